use http::Method;
use std::fmt;

/// What kind of resource a request is loading, as reported by the browser
/// (`Sec-Fetch-Dest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Script,
    Style,
    Image,
    /// Top-level navigation.
    Document,
    Other,
}

impl Destination {
    /// Parse a `Sec-Fetch-Dest` value. Unknown values map to `Other`.
    pub fn from_fetch_dest(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "script" => Destination::Script,
            "style" => Destination::Style,
            "image" => Destination::Image,
            "document" => Destination::Document,
            _ => Destination::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Script => "script",
            Destination::Style => "style",
            Destination::Image => "image",
            Destination::Document => "document",
            Destination::Other => "other",
        }
    }
}

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: Method,
    /// Origin-relative URL (path and query).
    pub url: String,
    pub destination: Destination,
}

impl FetchRequest {
    pub fn new(method: Method, url: impl Into<String>, destination: Destination) -> Self {
        Self {
            method,
            url: url.into(),
            destination,
        }
    }

    pub fn get(url: impl Into<String>, destination: Destination) -> Self {
        Self::new(Method::GET, url, destination)
    }

    /// Store key for this request. `None` for anything but GET.
    pub fn key(&self) -> Option<RequestKey> {
        if self.method == Method::GET {
            Some(RequestKey {
                url: self.url.clone(),
            })
        } else {
            None
        }
    }
}

/// Key under which a response snapshot is stored: method + URL.
///
/// Only GET requests are ever cached, so the method is implied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    url: String,
}

impl RequestKey {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn method(&self) -> Method {
        Method::GET
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GET {}", self.url)
    }
}
