use crate::request::InterceptedRequest;
use arcade_cache::CachedResponse;
use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use thiserror::Error;

/// The fetch could not complete at the transport level (offline, DNS,
/// connection reset, body read error).
#[derive(Error, Debug, Clone)]
#[error("network failure fetching {url}: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

/// Headers that describe a single connection and are never forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
    )
}

/// Outbound network access. Any HTTP status counts as success; only
/// transport failures are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Send the request as-is with the given body.
    async fn send(&self, req: &InterceptedRequest, body: Bytes) -> Result<CachedResponse, FetchError>;

    /// Plain fetch without a body, used by both cache policies.
    async fn fetch(&self, req: &InterceptedRequest) -> Result<CachedResponse, FetchError> {
        self.send(req, Bytes::new()).await
    }
}

/// `reqwest`-backed fetcher. Redirects are handed back to the caller rather
/// than followed, and no timeout is applied.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(64)
            .build()?;
        Ok(Self { client })
    }
}

fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let n = name.as_str();
        if is_hop_by_hop(n) || n == "host" || n == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn send(&self, req: &InterceptedRequest, body: Bytes) -> Result<CachedResponse, FetchError> {
        let url = req.uri.to_string();
        let failed = |e: reqwest::Error| FetchError {
            url: url.clone(),
            reason: e.to_string(),
        };

        let resp = self
            .client
            .request(req.method.clone(), &url)
            .headers(outbound_headers(&req.headers))
            .body(body)
            .send()
            .await
            .map_err(failed)?;

        let status = resp.status().as_u16();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp.bytes().await.map_err(failed)?;

        Ok(CachedResponse::new(status, headers, body))
    }
}
