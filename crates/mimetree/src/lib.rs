mod error;
mod mimepart;

pub use error::MimeTreeError;
pub type Result<T> = std::result::Result<T, MimeTreeError>;

pub use mimepart::*;
