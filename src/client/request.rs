use crate::url::{GeminiUrl, MAX_REQUEST_LEN};
use std::fmt;

/// A request to a given URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request(pub GeminiUrl);

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.0)
    }
}

impl Request {
    /// Check if the request is valid (less than or equal to 1024 bytes, CRLF included).
    pub fn is_valid_length(&self) -> bool {
        self.0.request_len() <= MAX_REQUEST_LEN
    }

    /// The exact bytes sent to the server.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}
