//! Configured HTTP clients.
//!
//! # Design
//! A `RequestClient` is immutable once created: it owns its endpoint, a copy
//! of the default headers it was created with, and the transport that will
//! execute its requests. `build_request` does the header merge and body
//! encoding on the calling thread so a worker receives a finished request.

use std::sync::Arc;

use serde_json::Value;
use ureq::http::Uri;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::http::{HttpMethod, HttpRequest};
use crate::registry::HeaderList;
use crate::transport::{Transport, UreqTransport};

/// Body attached to an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    None,
    Text(Vec<u8>),
    Json(Value),
}

pub struct RequestClient {
    endpoint: String,
    headers: HeaderList,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("endpoint", &self.endpoint)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RequestClient {
    /// Create a client backed by a `ureq` agent.
    pub fn new(endpoint: &str, headers: HeaderList, config: &BridgeConfig) -> Result<Self, BridgeError> {
        validate_endpoint(endpoint)?;
        let transport = UreqTransport::new(endpoint, config)?;
        Ok(Self::with_transport(endpoint, headers, Arc::new(transport)))
    }

    /// Create a client around an existing transport.
    pub fn with_transport(endpoint: &str, headers: HeaderList, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headers,
            transport,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    /// Build the outbound request: client headers first, then `extra`, both
    /// appended as independent lines so a duplicate name is sent twice.
    /// A JSON body forces `Content-Type: application/json`.
    pub fn build_request(
        &self,
        method: HttpMethod,
        path: &str,
        extra: HeaderList,
        body: RequestBody,
    ) -> Result<HttpRequest, BridgeError> {
        let mut headers = self.headers.clone();
        headers.extend(extra);

        let body = match body {
            RequestBody::None => None,
            RequestBody::Text(bytes) => Some(bytes),
            RequestBody::Json(value) => {
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
                match value {
                    Value::Null => None,
                    value => Some(
                        serde_json::to_vec(&value).map_err(|e| BridgeError::Serialization(e.to_string()))?,
                    ),
                }
            }
        };

        Ok(HttpRequest {
            method,
            url: self.url_for(path),
            headers,
            body,
        })
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), BridgeError> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e| BridgeError::ClientCreation(format!("malformed endpoint {endpoint:?}: {e}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(BridgeError::ClientCreation(format!(
                "endpoint {endpoint:?} must use http or https"
            )))
        }
    }
    if uri.authority().is_none() {
        return Err(BridgeError::ClientCreation(format!("endpoint {endpoint:?} has no host")));
    }
    Ok(())
}
