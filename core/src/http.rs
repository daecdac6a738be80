//! HTTP request/response values passed between the dispatcher and a transport.
//!
//! # Design
//! Requests and responses are plain owned data so they can be built on the
//! host thread and moved into a worker without borrowing anything from the
//! registries. Headers stay an ordered list rather than a map: duplicates
//! are sent as independent header lines.

use crate::registry::HeaderList;

/// HTTP method, numbered the way the host script enumerates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl HttpMethod {
    /// Map the host's method code (0 = GET ... 8 = PATCH).
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => HttpMethod::Get,
            1 => HttpMethod::Head,
            2 => HttpMethod::Post,
            3 => HttpMethod::Put,
            4 => HttpMethod::Delete,
            5 => HttpMethod::Connect,
            6 => HttpMethod::Options,
            7 => HttpMethod::Trace,
            8 => HttpMethod::Patch,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// How a body is encoded: on the way out for requests, and how the pump
/// should hand it to the script on the way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    String,
    Json,
}

/// A fully-resolved outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HeaderList,
    pub body: Option<Vec<u8>>,
}

/// A response as produced by a transport.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}
