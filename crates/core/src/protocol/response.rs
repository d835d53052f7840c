//! RTSP reply serialization (RFC 2326 §7).
//!
//! Every reply carries the status line, the echoed `CSeq` and a `Date`
//! header, then method-specific headers and an optional body:
//!
//! ```text
//! RTSP/1.0 200 OK\r\n
//! CSeq: 2\r\n
//! Date: Tue, 04 Jun 2013 21:16:06 GMT\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 460\r\n
//! \r\n
//! v=0\r\n...
//! ```
//!
//! `Content-Length` is computed from the finished body, so bodies are
//! built before the header block is serialized.

use std::fmt;

use chrono::Utc;

use crate::error::Status;

/// Builder for one RTSP reply.
#[must_use]
pub struct Reply {
    status: Status,
    cseq: u32,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Reply {
    pub fn new(status: Status, cseq: u32) -> Self {
        Self {
            status,
            cseq,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok(cseq: u32) -> Self {
        Self::new(Status::Ok, cseq)
    }

    pub fn header(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Attach a body. The body string must already end with `\r\n`.
    pub fn body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Serialize to the wire format. Appends `Content-Length` when a body
    /// is present (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut out = format!("RTSP/1.0 {}\r\n", self.status);
        out.push_str(&format!("CSeq: {}\r\n", self.cseq));
        out.push_str(&format!("Date: {}\r\n", http_date()));
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        match &self.body {
            Some(body) => {
                out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                out.push_str(body);
            }
            None => out.push_str("\r\n"),
        }
        out
    }
}

/// RFC 1123 date in GMT, e.g. `Tue, 04 Jun 2013 21:16:06 GMT`.
fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
