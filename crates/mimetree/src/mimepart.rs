use crate::{MimeTreeError, Result};
use mailparse::ParsedMail;
use std::collections::BTreeMap;
use std::io::Write;

/// Subtrees nested deeper than this are not searched when locating
/// the html part. MIME trees are acyclic, but a hostile message can
/// still nest multiparts arbitrarily deep.
pub const MAX_LOCATE_DEPTH: usize = 64;

/// The decoded payload of a leaf part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    Binary(Vec<u8>),
}

/// One part of a (possibly multipart) message.
///
/// Leaf parts carry a decoded payload; multipart containers carry
/// an ordered list of child parts and no payload of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeNode {
    /// The full Content-Type header value, including parameters
    content_type: String,
    /// Headers other than Content-Type and Content-Transfer-Encoding,
    /// in their original order. Values are kept in their raw,
    /// possibly rfc2047 encoded, form.
    headers: Vec<(String, String)>,
    body: Option<Body>,
    parts: Vec<Self>,
}

impl MimeNode {
    pub fn new_text(content_type: &str, content: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            headers: vec![],
            body: Some(Body::Text(content.to_string())),
            parts: vec![],
        }
    }

    pub fn new_text_plain(content: &str) -> Self {
        Self::new_text("text/plain", content)
    }

    pub fn new_html(content: &str) -> Self {
        Self::new_text("text/html", content)
    }

    pub fn new_binary(content_type: &str, content: &[u8]) -> Self {
        Self {
            content_type: content_type.to_string(),
            headers: vec![],
            body: Some(Body::Binary(content.to_vec())),
            parts: vec![],
        }
    }

    /// Create a multipart container. If `boundary` is None, a random
    /// boundary is generated.
    pub fn new_multipart(content_type: &str, parts: Vec<Self>, boundary: Option<&str>) -> Self {
        let ct = mailparse::parse_content_type(content_type);
        let mut params = ct.params;
        params.insert(
            "boundary".to_string(),
            boundary.map(|b| b.to_string()).unwrap_or_else(generate_boundary),
        );

        Self {
            content_type: format_content_type(&ct.mimetype, &params),
            headers: vec![],
            body: None,
            parts,
        }
    }

    /// Parse an RFC 5322 message into a tree of MimeNodes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mail = mailparse::parse_mail(bytes)?;
        Self::from_parsed(&mail)
    }

    fn from_parsed(mail: &ParsedMail) -> Result<Self> {
        let mut headers = vec![];
        for hdr in &mail.headers {
            let name = hdr.get_key();
            if name.eq_ignore_ascii_case("Content-Type")
                || name.eq_ignore_ascii_case("Content-Transfer-Encoding")
            {
                continue;
            }
            let value = String::from_utf8_lossy(hdr.get_value_raw()).into_owned();
            headers.push((name, value));
        }

        let mimetype = mail.ctype.mimetype.to_ascii_lowercase();

        if mimetype.starts_with("multipart/") {
            let parts = mail
                .subparts
                .iter()
                .map(Self::from_parsed)
                .collect::<Result<Vec<_>>>()?;

            let mut params = mail.ctype.params.clone();
            params
                .entry("boundary".to_string())
                .or_insert_with(generate_boundary);

            return Ok(Self {
                content_type: format_content_type(&mimetype, &params),
                headers,
                body: None,
                parts,
            });
        }

        let body = if mimetype.starts_with("text/") {
            Body::Text(mail.get_body()?)
        } else {
            Body::Binary(mail.get_body_raw()?)
        };

        Ok(Self {
            content_type: format_content_type(&mimetype, &mail.ctype.params),
            headers,
            body: Some(body),
            parts: vec![],
        })
    }

    /// The full Content-Type value, including any parameters
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The lowercased `type/subtype` token, without parameters
    pub fn mime_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
    }

    /// True when the type token begins with `text/html`
    pub fn is_html(&self) -> bool {
        self.mime_type().starts_with("text/html")
    }

    /// `message/*` parts carry an encapsulated message, which
    /// must not be given a base64 or quoted-printable encoding
    pub fn is_encapsulated_message(&self) -> bool {
        self.mime_type().starts_with("message/")
    }

    pub fn is_multipart(&self) -> bool {
        self.mime_type().starts_with("multipart/")
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn append_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Returns the decoded text payload, if this is a text leaf
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Some(Body::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Replace the payload with the supplied text.
    /// The transfer encoding and charset are recomputed when the
    /// node is next written out.
    pub fn set_text(&mut self, text: String) {
        self.body.replace(Body::Text(text));
    }

    /// Obtain a reference to the child parts
    pub fn child_parts(&self) -> &[Self] {
        &self.parts
    }

    /// Obtain a mutable reference to the child parts
    pub fn child_parts_mut(&mut self) -> &mut Vec<Self> {
        &mut self.parts
    }

    /// Depth-first, pre-order search for the first html part,
    /// visiting children in document order.
    pub fn locate_html(&self) -> Option<&Self> {
        self.locate_html_at(0)
    }

    /// Like `locate_html`, but returns a mutable reference so that
    /// the payload can be replaced in place.
    pub fn locate_html_mut(&mut self) -> Option<&mut Self> {
        self.locate_html_mut_at(0)
    }

    fn locate_html_at(&self, depth: usize) -> Option<&Self> {
        if self.is_html() {
            return Some(self);
        }
        if depth >= MAX_LOCATE_DEPTH {
            return None;
        }
        self.parts
            .iter()
            .find_map(|part| part.locate_html_at(depth + 1))
    }

    fn locate_html_mut_at(&mut self, depth: usize) -> Option<&mut Self> {
        if self.is_html() {
            return Some(self);
        }
        if depth >= MAX_LOCATE_DEPTH {
            return None;
        }
        self.parts
            .iter_mut()
            .find_map(|part| part.locate_html_mut_at(depth + 1))
    }

    fn boundary(&self) -> Option<String> {
        mailparse::parse_content_type(&self.content_type)
            .params
            .get("boundary")
            .cloned()
    }

    /// Write the tree out as a message, transfer encoding the
    /// leaf payloads as needed.
    pub fn write_message<W: Write>(&self, out: &mut W) -> Result<()> {
        for (name, value) in &self.headers {
            write!(out, "{name}: {value}\r\n")?;
        }

        match &self.body {
            Some(Body::Text(text)) => {
                let mut ct = mailparse::parse_content_type(&self.content_type);
                ct.params.insert(
                    "charset".to_string(),
                    if text.is_ascii() { "us-ascii" } else { "utf-8" }.to_string(),
                );
                write!(
                    out,
                    "Content-Type: {}\r\n",
                    format_content_type(&ct.mimetype, &ct.params)
                )?;

                let qp_encoded = quoted_printable::encode(text.as_bytes());
                if qp_encoded == text.as_bytes() {
                    out.write_all(b"\r\n")?;
                    out.write_all(text.as_bytes())?;
                } else if qp_encoded.len() <= data_encoding::BASE64_MIME.encode_len(text.len()) {
                    out.write_all(b"Content-Transfer-Encoding: quoted-printable\r\n\r\n")?;
                    out.write_all(&qp_encoded)?;
                } else {
                    out.write_all(b"Content-Transfer-Encoding: base64\r\n\r\n")?;
                    out.write_all(data_encoding::BASE64_MIME.encode(text.as_bytes()).as_bytes())?;
                }
            }
            Some(Body::Binary(data)) if self.is_encapsulated_message() => {
                write!(out, "Content-Type: {}\r\n", self.content_type)?;
                let cte = if data.is_ascii() { "7bit" } else { "8bit" };
                write!(out, "Content-Transfer-Encoding: {cte}\r\n\r\n")?;
                out.write_all(data)?;
            }
            Some(Body::Binary(data)) => {
                write!(out, "Content-Type: {}\r\n", self.content_type)?;
                out.write_all(b"Content-Transfer-Encoding: base64\r\n\r\n")?;
                out.write_all(data_encoding::BASE64_MIME.encode(data).as_bytes())?;
            }
            None => {
                let boundary = self
                    .boundary()
                    .ok_or_else(|| MimeTreeError::MissingBoundary(self.content_type.clone()))?;
                write!(out, "Content-Type: {}\r\n\r\n", self.content_type)?;
                for part in &self.parts {
                    write!(out, "--{boundary}\r\n")?;
                    part.write_message(out)?;
                    out.write_all(b"\r\n")?;
                }
                write!(out, "--{boundary}--\r\n")?;
            }
        }

        Ok(())
    }

    pub fn to_message_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        self.write_message(&mut out)?;
        Ok(out)
    }
}

fn generate_boundary() -> String {
    let uuid = uuid::Uuid::new_v4();
    data_encoding::HEXLOWER.encode(uuid.as_bytes())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_graphic() && !"()<>@,;:\\\"/[]?=".contains(c)
}

fn format_content_type(mimetype: &str, params: &BTreeMap<String, String>) -> String {
    let mut result = mimetype.to_string();
    for (name, value) in params {
        if !value.is_empty() && value.chars().all(is_token_char) {
            result.push_str(&format!("; {name}={value}"));
        } else {
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            result.push_str(&format!("; {name}=\"{escaped}\""));
        }
    }
    result
}
