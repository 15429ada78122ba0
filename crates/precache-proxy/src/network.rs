use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use precache_core::{Error, FetchRequest, Network, ResponseSnapshot};

pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

/// Headers that describe one connection, not the resource.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// The origin server, reached over HTTP.
pub struct UpstreamNetwork {
    client: HttpClient,
    upstream_url: String,
}

impl UpstreamNetwork {
    pub fn new(client: HttpClient, upstream_url: impl Into<String>) -> Self {
        Self {
            client,
            upstream_url: upstream_url.into(),
        }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Absolute upstream URI for an origin-relative path and query.
    pub fn upstream_uri(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.upstream_url.trim_end_matches('/'),
            path_and_query
        )
    }
}

/// Flatten response headers into owned pairs, dropping hop-by-hop ones.
/// Values that are not visible ASCII are dropped rather than stored mangled.
pub fn snapshot_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
        .filter_map(|(k, v)| match v.to_str() {
            Ok(value) => Some((k.to_string(), value.to_string())),
            Err(_) => {
                tracing::debug!(header = %k, "skipping non-ASCII header value");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Network for UpstreamNetwork {
    async fn fetch(&self, request: &FetchRequest) -> precache_core::Result<ResponseSnapshot> {
        let uri = self.upstream_uri(&request.url);
        let upstream_req = Request::builder()
            .method(request.method.clone())
            .uri(&uri)
            .body(Body::empty())
            .map_err(|e| Error::network(&request.url, e))?;

        let upstream_resp = self.client.request(upstream_req).await.map_err(|e| {
            tracing::warn!(error = %e, upstream = %uri, "upstream request failed");
            Error::network(&request.url, e)
        })?;

        let status = upstream_resp.status().as_u16();
        let headers = snapshot_headers(upstream_resp.headers());

        // A body cut off mid-stream is as much a network failure as no body.
        let body = upstream_resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::network(&request.url, e))?
            .to_bytes();

        Ok(ResponseSnapshot::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use hyper_util::rt::TokioExecutor;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));

        let pairs = snapshot_headers(&headers);
        assert_eq!(pairs, vec![("content-type".to_string(), "text/html".to_string())]);
    }

    #[test]
    fn opaque_header_values_are_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.insert(
            "content-disposition",
            HeaderValue::from_bytes(b"inline; filename=\"caf\xe9.html\"").unwrap(),
        );

        let pairs = snapshot_headers(&headers);
        assert_eq!(pairs, vec![("content-type".to_string(), "text/html".to_string())]);
    }

    #[test]
    fn upstream_uri_joins_without_double_slash() {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let network = UpstreamNetwork::new(client, "http://127.0.0.1:3000/");
        assert_eq!(
            network.upstream_uri("/css/critical.css?v=2"),
            "http://127.0.0.1:3000/css/critical.css?v=2"
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_network_error() {
        let client = Client::builder(TokioExecutor::new()).build_http();
        // Port 9 (discard) on localhost is closed on any sane test machine.
        let network = UpstreamNetwork::new(client, "http://127.0.0.1:9");
        let req = FetchRequest::get("/", precache_core::Destination::Document);
        let err = network.fetch(&req).await.unwrap_err();
        assert!(err.is_network());
    }
}
