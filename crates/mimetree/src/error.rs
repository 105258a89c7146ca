use thiserror::Error;

#[derive(Error, Debug)]
pub enum MimeTreeError {
    #[error("failed to parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("multipart node has no boundary in its Content-Type: {0}")]
    MissingBoundary(String),
    #[error("IO error while writing message: {0}")]
    WriteMessage(#[from] std::io::Error),
}
