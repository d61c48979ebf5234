use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

pub const DEFAULT_DOH_URL: &str = "https://1.1.1.1/dns-query";

const DOH_CONTENT_TYPE: &str = "application/dns-message";

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability interface for the DNS-over-HTTPS upstream: one call carries
/// one raw DNS message and resolves to the raw reply. Tests swap in a
/// deterministic responder.
#[async_trait]
pub trait DnsOverHttps: Send + Sync {
    async fn query(&self, body: &[u8]) -> std::io::Result<Bytes>;
}

/// RFC 8484 client: POST with `application/dns-message` bodies over a pooled
/// hyper client, TLS via rustls with webpki roots.
pub struct HyperDohClient {
    uri: Uri,
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl std::fmt::Debug for HyperDohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperDohClient")
            .field("uri", &self.uri.to_string())
            .finish()
    }
}

impl HyperDohClient {
    pub fn new(doh_url: &str) -> std::io::Result<Self> {
        let uri: Uri = doh_url.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid DoH URL '{doh_url}': {e}"),
            )
        })?;

        let scheme = uri.scheme_str().unwrap_or("");
        if scheme != "https" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("DoH URL must use HTTPS scheme, got: {scheme}"),
            ));
        }

        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_only()
            .enable_all_versions()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self { uri, client })
    }
}

#[async_trait]
impl DnsOverHttps for HyperDohClient {
    async fn query(&self, body: &[u8]) -> std::io::Result<Bytes> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(header::ACCEPT, DOH_CONTENT_TYPE)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::copy_from_slice(body)))
            .map_err(|e| std::io::Error::other(format!("failed to build DoH request: {e}")))?;

        let response = timeout(QUERY_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("DoH request to {} timed out", self.uri),
                )
            })?
            .map_err(|e| std::io::Error::other(format!("DoH request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(std::io::Error::other(format!(
                "DoH request returned HTTP {status}"
            )));
        }

        self.collect_body(response.into_body()).await
    }
}

impl HyperDohClient {
    async fn collect_body(&self, body: Incoming) -> std::io::Result<Bytes> {
        let collected = timeout(QUERY_TIMEOUT, body.collect())
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("DoH response body from {} timed out", self.uri),
                )
            })?
            .map_err(|e| std::io::Error::other(format!("failed to read DoH response body: {e}")))?;

        Ok(collected.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doh_client_new() {
        let client = HyperDohClient::new(DEFAULT_DOH_URL).unwrap();
        assert_eq!(format!("{client:?}"), "HyperDohClient { uri: \"https://1.1.1.1/dns-query\" }");
    }

    #[test]
    fn test_doh_client_rejects_http_scheme() {
        let err = HyperDohClient::new("http://1.1.1.1/dns-query").unwrap_err();
        assert!(err.to_string().contains("HTTPS scheme"));
    }

    #[test]
    fn test_doh_client_rejects_garbage_url() {
        assert!(HyperDohClient::new("dns server").is_err());
    }
}
