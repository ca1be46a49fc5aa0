use arcade_cache::CacheKey;
use axum::http::{HeaderMap, Method, Uri};

/// File extensions served with the cache-first policy.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico"];

/// What the requesting page intends to do with the response, taken from the
/// `Sec-Fetch-Dest` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Image,
    Document,
    Script,
    Style,
    Font,
    Iframe,
    Empty,
    Other,
}

impl Destination {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get("sec-fetch-dest")
            .and_then(|v| v.to_str().ok())
            .map(Self::parse)
            .unwrap_or(Destination::Other)
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "image" => Destination::Image,
            "document" => Destination::Document,
            "script" => Destination::Script,
            "style" => Destination::Style,
            "font" => Destination::Font,
            "iframe" | "frame" => Destination::Iframe,
            "empty" => Destination::Empty,
            _ => Destination::Other,
        }
    }
}

/// A request as seen by the gateway, with an absolute URI. Headers are kept
/// so the network fetch goes out exactly as the page issued it.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub destination: Destination,
}

impl InterceptedRequest {
    #[cfg(test)]
    pub fn new(method: Method, uri: Uri, destination: Destination) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            destination,
        }
    }

    /// Builds the request from incoming parts, reading the destination hint
    /// from `Sec-Fetch-Dest`.
    pub fn from_parts(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let destination = Destination::from_headers(&headers);
        Self {
            method,
            uri,
            headers,
            destination,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.method.as_str(), normalized_url(&self.uri))
    }
}

/// Lower-cased scheme and host, default port dropped, path and query kept
/// verbatim.
fn normalized_url(uri: &Uri) -> String {
    let (Some(scheme), Some(host)) = (uri.scheme_str(), uri.host()) else {
        return uri.to_string();
    };
    let scheme = scheme.to_ascii_lowercase();
    let port = match (scheme.as_str(), uri.port_u16()) {
        (_, None) | ("http", Some(80)) | ("https", Some(443)) => String::new(),
        (_, Some(port)) => format!(":{port}"),
    };
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("{scheme}://{}{port}{path}", host.to_ascii_lowercase())
}

/// Hosts whose requests the gateway intercepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Any,
    Hosts(Vec<String>),
}

impl Scope {
    /// An empty `extra_hosts` list means every host is in scope. Otherwise the
    /// upstream host is always included alongside the listed ones.
    pub fn new(upstream_host: Option<&str>, extra_hosts: &[String]) -> Self {
        if extra_hosts.is_empty() {
            return Scope::Any;
        }
        let mut hosts: Vec<String> = extra_hosts.iter().map(|h| h.to_ascii_lowercase()).collect();
        if let Some(host) = upstream_host {
            hosts.push(host.to_ascii_lowercase());
        }
        hosts.sort();
        hosts.dedup();
        Scope::Hosts(hosts)
    }

    pub fn contains(&self, host: Option<&str>) -> bool {
        match (self, host) {
            (Scope::Any, _) => true,
            (Scope::Hosts(hosts), Some(host)) => hosts.iter().any(|h| h.eq_ignore_ascii_case(host)),
            (Scope::Hosts(_), None) => false,
        }
    }
}

/// Why a request was left to the network untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Method,
    Scheme,
    OutOfScope,
    /// No generation has been activated yet.
    Uncontrolled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PassThrough(PassReason),
    Image,
    General,
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::PassThrough(_) => "passthrough",
            Route::Image => "image",
            Route::General => "general",
        }
    }
}

pub fn classify(req: &InterceptedRequest, scope: &Scope) -> Route {
    if req.method != Method::GET {
        return Route::PassThrough(PassReason::Method);
    }
    if !matches!(req.uri.scheme_str(), Some("http" | "https")) {
        return Route::PassThrough(PassReason::Scheme);
    }
    if !scope.contains(req.uri.host()) {
        return Route::PassThrough(PassReason::OutOfScope);
    }
    if req.destination == Destination::Image || has_image_extension(req.uri.path()) {
        Route::Image
    } else {
        Route::General
    }
}

/// Checks the extension of the last path segment, ignoring case.
pub fn has_image_extension(path: &str) -> bool {
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((_, ext)) => IMAGE_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        None => false,
    }
}
