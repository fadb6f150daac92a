//! HTTP request/response types exchanged with a [`Transport`](crate::Transport).
//!
//! # Design
//! Requests and responses are plain data. The client assembles an
//! `HttpRequest`, hands it to the injected transport, and interprets the
//! returned `HttpResponse`. Keeping the boundary as data means every request
//! the client would send can be asserted on in tests without a socket.
//!
//! Bodies are `Bytes` because blob members travel as raw octet streams next to
//! the JSON traffic.

use bytes::Bytes;

pub const CONTENT_TYPE: &str = "Content-type";
pub const DATA_TYPE: &str = "Data-type";
pub const JSON: &str = "application/json";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// A request carrying the default JSON `Content-type`/`Data-type` pair.
    pub fn json(method: HttpMethod, url: impl Into<String>, body: Option<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: vec![
                (DATA_TYPE.to_string(), JSON.to_string()),
                (CONTENT_TYPE.to_string(), JSON.to_string()),
            ],
            body: body.map(Bytes::from),
        }
    }

    /// A PUT of raw bytes to a blob member.
    pub fn octet_stream(url: impl Into<String>, member: &str, payload: Bytes) -> Self {
        Self {
            method: HttpMethod::Put,
            url: url.into(),
            headers: vec![
                (DATA_TYPE.to_string(), OCTET_STREAM.to_string()),
                (CONTENT_TYPE.to_string(), OCTET_STREAM.to_string()),
                ("Content-Name".to_string(), member.to_string()),
                ("x-file-name".to_string(), member.to_string()),
                ("x-file-size".to_string(), payload.len().to_string()),
                ("x-file-type".to_string(), OCTET_STREAM.to_string()),
            ],
            body: Some(payload),
        }
    }

    /// A GET for a blob member's raw bytes.
    pub fn download(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: vec![(DATA_TYPE.to_string(), OCTET_STREAM.to_string())],
            body: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// The body as UTF-8 text, for logging and assertions.
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
