//! The two caching strategies a fetch event can be routed to.
//!
//! Both make exactly one network attempt per request and never retry.

use crate::error::Result;
use crate::lifetime::Lifetime;
use crate::request::{FetchRequest, RequestKey};
use crate::traits::{Cache, Network, ResponseSnapshot};
use std::sync::Arc;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Stored snapshot, no network call made.
    Cache,
    /// Live network response.
    Network,
    /// Stored snapshot served because the network failed.
    Fallback,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Network => "network",
            Source::Fallback => "fallback",
        }
    }
}

#[derive(Debug)]
pub struct Served {
    pub response: ResponseSnapshot,
    pub source: Source,
    /// Generation of the worker that handled the fetch.
    pub generation: String,
}

impl Served {
    fn new(cache: &Arc<dyn Cache>, response: ResponseSnapshot, source: Source) -> Self {
        Self {
            response,
            source,
            generation: cache.generation().to_string(),
        }
    }
}

/// Serve from the store when present, otherwise fetch and populate.
pub async fn cache_first(
    cache: &Arc<dyn Cache>,
    network: &dyn Network,
    lifetime: &Lifetime,
    request: &FetchRequest,
) -> Result<Served> {
    let Some(key) = request.key() else {
        return network
            .fetch(request)
            .await
            .map(|r| Served::new(cache, r, Source::Network));
    };

    match cache.match_request(&key).await {
        Ok(Some(stored)) => {
            tracing::debug!(key = %key, generation = cache.generation(), "cache HIT");
            return Ok(Served::new(cache, stored, Source::Cache));
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(key = %key, error = %e, "cache lookup failed, treating as miss"),
    }

    // Miss: a network failure here propagates, there is no asset fallback.
    let fetched = network.fetch(request).await?;
    tracing::debug!(key = %key, status = fetched.status, "cache MISS → network");
    Ok(Served::new(
        cache,
        store_and_return(cache, lifetime, key, fetched),
        Source::Network,
    ))
}

/// Prefer a live response; fall back to the store only when the network fails.
pub async fn network_first(
    cache: &Arc<dyn Cache>,
    network: &dyn Network,
    lifetime: &Lifetime,
    request: &FetchRequest,
) -> Result<Served> {
    let Some(key) = request.key() else {
        return network
            .fetch(request)
            .await
            .map(|r| Served::new(cache, r, Source::Network));
    };

    let err = match network.fetch(request).await {
        Ok(fetched) => {
            tracing::debug!(key = %key, status = fetched.status, "network response, refreshing cache");
            return Ok(Served::new(
                cache,
                store_and_return(cache, lifetime, key, fetched),
                Source::Network,
            ));
        }
        Err(e) => e,
    };

    match cache.match_request(&key).await {
        Ok(Some(stored)) => {
            tracing::info!(key = %key, error = %err, "network failed, serving cached copy");
            Ok(Served::new(cache, stored, Source::Fallback))
        }
        Ok(None) => Err(err),
        Err(store_err) => {
            tracing::warn!(key = %key, error = %store_err, "fallback lookup failed");
            Err(err)
        }
    }
}

/// Duplicate `response`, persist one copy without waiting for the write, and
/// return the other. The write is registered with `lifetime` so the host
/// doesn't drop it.
fn store_and_return(
    cache: &Arc<dyn Cache>,
    lifetime: &Lifetime,
    key: RequestKey,
    response: ResponseSnapshot,
) -> ResponseSnapshot {
    if !response.is_storable() {
        return response;
    }

    let (live, stored) = response.duplicate();
    let cache = Arc::clone(cache);
    lifetime.wait_until(async move {
        if let Err(e) = cache.put(key.clone(), stored).await {
            tracing::warn!(key = %key, generation = cache.generation(), error = %e, "cache write failed");
        }
    });
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::request::Destination;
    use crate::testing::FakeNetwork;
    use crate::traits::CacheStorage;

    async fn setup() -> (Arc<dyn Cache>, FakeNetwork, Lifetime) {
        let storage = MemoryStorage::new();
        let cache = storage.open("v1").await.unwrap();
        (cache, FakeNetwork::new(), Lifetime::new())
    }

    #[tokio::test]
    async fn cache_first_hit_makes_no_network_call() {
        let (cache, network, lifetime) = setup().await;
        cache
            .put(
                RequestKey::get("/js/app.min.js"),
                ResponseSnapshot::new(200, vec![("etag".into(), "v1".into())], "cached"),
            )
            .await
            .unwrap();
        network.serve("/js/app.min.js", 200, "live");

        let req = FetchRequest::get("/js/app.min.js", Destination::Script);
        let served = cache_first(&cache, &network, &lifetime, &req).await.unwrap();

        assert_eq!(served.source, Source::Cache);
        assert_eq!(served.generation, "v1");
        assert_eq!(served.response.body, "cached");
        assert_eq!(served.response.header("etag"), Some("v1"));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn cache_first_miss_fetches_once_and_populates() {
        let (cache, network, lifetime) = setup().await;
        network.serve("/assets/hero.webp", 200, "webp-bytes");

        let req = FetchRequest::get("/assets/hero.webp", Destination::Image);
        let served = cache_first(&cache, &network, &lifetime, &req).await.unwrap();
        assert_eq!(served.source, Source::Network);
        assert_eq!(served.response.body, "webp-bytes");
        assert_eq!(network.calls(), 1);

        lifetime.settle().await;
        let stored = cache
            .match_request(&RequestKey::get("/assets/hero.webp"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, served.response);

        // Second request is now a hit.
        let again = cache_first(&cache, &network, &lifetime, &req).await.unwrap();
        assert_eq!(again.source, Source::Cache);
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn cache_first_miss_offline_propagates() {
        let (cache, network, lifetime) = setup().await;
        network.go_offline();

        let req = FetchRequest::get("/css/style.min.css", Destination::Style);
        let err = cache_first(&cache, &network, &lifetime, &req)
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(network.calls(), 1);

        lifetime.settle().await;
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn network_first_online_refreshes_store() {
        let (cache, network, lifetime) = setup().await;
        cache
            .put(RequestKey::get("/"), ResponseSnapshot::new(200, vec![], "old home"))
            .await
            .unwrap();
        network.serve("/", 200, "new home");

        let req = FetchRequest::get("/", Destination::Document);
        let served = network_first(&cache, &network, &lifetime, &req).await.unwrap();
        assert_eq!(served.source, Source::Network);
        assert_eq!(served.response.body, "new home");

        lifetime.settle().await;
        let stored = cache.match_request(&RequestKey::get("/")).await.unwrap().unwrap();
        assert_eq!(stored, served.response);
    }

    #[tokio::test]
    async fn network_first_offline_serves_prior_snapshot() {
        let (cache, network, lifetime) = setup().await;
        cache
            .put(RequestKey::get("/"), ResponseSnapshot::new(200, vec![], "last known good"))
            .await
            .unwrap();
        network.go_offline();

        let req = FetchRequest::get("/", Destination::Document);
        let served = network_first(&cache, &network, &lifetime, &req).await.unwrap();
        assert_eq!(served.source, Source::Fallback);
        assert_eq!(served.response.body, "last known good");
        assert_eq!(served.generation, "v1");
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn network_first_offline_without_snapshot_propagates() {
        let (cache, network, lifetime) = setup().await;
        network.go_offline();

        let req = FetchRequest::get("/compare.html", Destination::Document);
        let err = network_first(&cache, &network, &lifetime, &req)
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn partial_content_is_not_stored() {
        let (cache, network, lifetime) = setup().await;
        network.serve("/assets/replika.webp", 206, "partial");

        let req = FetchRequest::get("/assets/replika.webp", Destination::Image);
        let served = cache_first(&cache, &network, &lifetime, &req).await.unwrap();
        assert_eq!(served.response.status, 206);

        lifetime.settle().await;
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_failures() {
        let (cache, network, lifetime) = setup().await;
        network.serve("/missing.html", 404, "not found");

        let req = FetchRequest::get("/missing.html", Destination::Document);
        let served = network_first(&cache, &network, &lifetime, &req).await.unwrap();
        assert_eq!(served.response.status, 404);
        assert_eq!(served.source, Source::Network);
    }
}
