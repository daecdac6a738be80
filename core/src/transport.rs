//! The HTTP transport seam.
//!
//! # Design
//! Workers only see `dyn Transport`, so the dispatcher can be exercised
//! without a network. `UreqTransport` is the production implementation: a
//! blocking `ureq` agent that treats every status code as data and only
//! reports genuine transport failures as errors.

use std::path::Path;
use std::time::Duration;

use ureq::http::Request;
use ureq::tls::{PemItem, RootCerts, TlsConfig};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, TransportError};
use crate::http::{HttpRequest, HttpResponse};

/// Executes one request to completion on the calling thread.
pub trait Transport: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking transport backed by a `ureq` agent.
#[derive(Debug)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    /// Build an agent for `endpoint`. `https` endpoints trust the configured
    /// CA bundle, which must load or client creation fails.
    pub fn new(endpoint: &str, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let timeout = match config.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let mut builder = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(timeout);

        let is_https = endpoint
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"));
        if is_https {
            if let Some(bundle) = &config.ca_bundle {
                builder = builder.tls_config(load_trust_store(bundle)?);
            }
        }

        Ok(Self {
            agent: builder.build().new_agent(),
        })
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let builder = request
            .headers
            .iter()
            .fold(
                Request::builder().method(request.method.as_str()).uri(request.url.as_str()),
                |builder, (name, value)| builder.header(name.as_str(), value.as_str()),
            );

        let sent = match request.body.as_deref() {
            Some(body) if !body.is_empty() => {
                let req = builder.body(body.to_vec()).map_err(|e| TransportError::Http(e.to_string()))?;
                self.agent.run(req)
            }
            _ => {
                let req = builder.body(()).map_err(|e| TransportError::Http(e.to_string()))?;
                self.agent.run(req)
            }
        };
        let mut response = sent.map_err(classify)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .collect();
        let body = response.body_mut().read_to_vec().map_err(classify)?;

        Ok(HttpResponse { status, headers, body })
    }
}

/// I/O and timeouts are generic failures; everything else `ureq` reports
/// happened at the HTTP layer.
fn classify(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Io(e) => TransportError::Generic(e.to_string()),
        err @ ureq::Error::Timeout(_) => TransportError::Generic(err.to_string()),
        other => TransportError::Http(other.to_string()),
    }
}

fn load_trust_store(path: &Path) -> Result<TlsConfig, BridgeError> {
    let pem = std::fs::read(path).map_err(|e| {
        BridgeError::ClientCreation(format!("failed to read CA bundle {}: {e}", path.display()))
    })?;
    let certs: Vec<_> = ureq::tls::parse_pem(&pem)
        .filter_map(|item| match item {
            Ok(PemItem::Certificate(cert)) => Some(cert.to_owned()),
            _ => None,
        })
        .collect();
    if certs.is_empty() {
        return Err(BridgeError::ClientCreation(format!(
            "CA bundle {} contains no certificates",
            path.display()
        )));
    }
    Ok(TlsConfig::builder()
        .root_certs(RootCerts::new_with_certs(&certs))
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;

    #[test]
    fn http_endpoint_skips_trust_store() {
        let config = BridgeConfig {
            ca_bundle: Some("/nonexistent/bundle.pem".into()),
            ..BridgeConfig::default()
        };
        assert!(UreqTransport::new("http://localhost:3000", &config).is_ok());
    }

    #[test]
    fn https_endpoint_with_missing_bundle_fails() {
        let config = BridgeConfig {
            ca_bundle: Some("/nonexistent/bundle.pem".into()),
            ..BridgeConfig::default()
        };
        let err = UreqTransport::new("https://example.com", &config).unwrap_err();
        assert!(matches!(err, BridgeError::ClientCreation(_)));
    }

    #[test]
    fn unreachable_host_is_an_error() {
        let transport = UreqTransport::new("http://127.0.0.1:1", &BridgeConfig::default()).unwrap();
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: "http://127.0.0.1:1/".to_string(),
            headers: Vec::new(),
            body: None,
        };
        let err = transport.execute(&request).unwrap_err();
        assert!(matches!(err.failure_class(), 1 | 2));
        assert!(!err.to_string().is_empty());
    }
}
