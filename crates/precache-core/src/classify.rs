use crate::request::{Destination, FetchRequest};
use http::Method;

/// Which strategy a request is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Static assets: serve from the store, fetch only on miss.
    CacheFirst,
    /// Documents: prefer the network, fall back to the store when offline.
    NetworkFirstWithFallback,
    /// Not intercepted; the request goes straight to the network.
    Passthrough,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::CacheFirst => "cache_first",
            Route::NetworkFirstWithFallback => "network_first",
            Route::Passthrough => "passthrough",
        }
    }
}

/// Classify a request. Pure: depends only on method and destination.
pub fn route(request: &FetchRequest) -> Route {
    if request.method != Method::GET {
        return Route::Passthrough;
    }
    match request.destination {
        Destination::Script | Destination::Style | Destination::Image => Route::CacheFirst,
        Destination::Document => Route::NetworkFirstWithFallback,
        Destination::Other => Route::Passthrough,
    }
}
