use crate::fetch::{FetchError, Fetcher};
use crate::lifecycle::GenerationSet;
use crate::request::{classify, InterceptedRequest, PassReason, Route, Scope};
use arc_swap::{ArcSwap, ArcSwapOption};
use arcade_cache::{CacheKey, CachedResponse, Partition};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// The network fetch failed and there was no cached copy to fall back on.
    #[error(transparent)]
    Network(#[from] FetchError),

    #[error("fetch task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    CacheFirst,
    StaleWhileRevalidate,
}

impl Policy {
    pub fn label(&self) -> &'static str {
        match self {
            Policy::CacheFirst => "cache-first",
            Policy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
}

/// A response produced by one of the cache policies.
#[derive(Debug, Clone)]
pub struct Served {
    pub response: CachedResponse,
    pub source: Source,
    pub policy: Policy,
    pub partition: String,
}

#[derive(Debug, Clone)]
pub enum Interception {
    /// Not intercepted: the caller sends the request to the network itself.
    PassThrough(PassReason),
    Served(Served),
}

/// Routes every request to a cache policy over the active generation's
/// partitions.
///
/// Holds no per-request state. Entries are only ever added or overwritten
/// here; removal belongs to the lifecycle.
pub struct Gateway {
    fetcher: Arc<dyn Fetcher>,
    generation: Arc<ArcSwapOption<GenerationSet>>,
    scope: ArcSwap<Scope>,
    refreshes: TaskTracker,
}

impl Gateway {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        generation: Arc<ArcSwapOption<GenerationSet>>,
        scope: Scope,
    ) -> Self {
        Self {
            fetcher,
            generation,
            scope: ArcSwap::from_pointee(scope),
            refreshes: TaskTracker::new(),
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    #[cfg(test)]
    pub fn scope(&self) -> Arc<Scope> {
        self.scope.load_full()
    }

    pub fn set_scope(&self, scope: Scope) {
        tracing::info!(?scope, "intercept scope updated");
        self.scope.store(Arc::new(scope));
    }

    /// Number of background refreshes still running.
    pub fn pending_refreshes(&self) -> usize {
        self.refreshes.len()
    }

    /// Wait until every background refresh spawned so far has finished.
    #[cfg(test)]
    pub async fn settle(&self) {
        self.refreshes.close();
        self.refreshes.wait().await;
        self.refreshes.reopen();
    }

    /// Stop accepting refresh bookkeeping and drain what is in flight.
    pub async fn shutdown(&self) {
        self.refreshes.close();
        self.refreshes.wait().await;
    }

    pub async fn handle(&self, req: &InterceptedRequest) -> Result<Interception, GatewayError> {
        let Some(generation) = self.generation.load_full() else {
            metrics::counter!("gateway_requests_total", "route" => "uncontrolled").increment(1);
            return Ok(Interception::PassThrough(PassReason::Uncontrolled));
        };

        let route = classify(req, &self.scope.load());
        metrics::counter!("gateway_requests_total", "route" => route.label()).increment(1);

        match route {
            Route::PassThrough(reason) => {
                tracing::trace!(method = %req.method, uri = %req.uri, ?reason, "pass through");
                Ok(Interception::PassThrough(reason))
            }
            Route::Image => self
                .cache_first(req, generation.image())
                .await
                .map(Interception::Served),
            Route::General => self
                .stale_while_revalidate(req, generation.general())
                .await
                .map(Interception::Served),
        }
    }

    async fn cache_first(
        &self,
        req: &InterceptedRequest,
        partition: &Partition,
    ) -> Result<Served, GatewayError> {
        let policy = Policy::CacheFirst;
        let key = req.cache_key();

        if let Some(cached) = lookup(partition, &key, policy).await {
            return Ok(served(cached, Source::Cache, policy, partition));
        }

        let response = self.fetcher.fetch(req).await?;
        store_if_current(&self.generation, partition, &key, &response).await;
        Ok(served(response, Source::Network, policy, partition))
    }

    async fn stale_while_revalidate(
        &self,
        req: &InterceptedRequest,
        partition: &Partition,
    ) -> Result<Served, GatewayError> {
        let policy = Policy::StaleWhileRevalidate;
        let key = req.cache_key();

        // The fetch starts before the lookup and is never tied to this
        // request's lifetime.
        let refresh = self.spawn_refresh(req.clone(), partition.clone(), key.clone());

        if let Some(cached) = lookup(partition, &key, policy).await {
            return Ok(served(cached, Source::Cache, policy, partition));
        }

        let response = refresh.await??;
        Ok(served(response, Source::Network, policy, partition))
    }

    fn spawn_refresh(
        &self,
        req: InterceptedRequest,
        partition: Partition,
        key: CacheKey,
    ) -> JoinHandle<Result<CachedResponse, FetchError>> {
        let fetcher = Arc::clone(&self.fetcher);
        let generation = Arc::clone(&self.generation);
        self.refreshes.spawn(async move {
            match fetcher.fetch(&req).await {
                Ok(response) => {
                    store_if_current(&generation, &partition, &key, &response).await;
                    Ok(response)
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "background refresh failed");
                    metrics::counter!("gateway_refresh_failures_total").increment(1);
                    Err(e)
                }
            }
        })
    }
}

fn served(response: CachedResponse, source: Source, policy: Policy, partition: &Partition) -> Served {
    Served {
        response,
        source,
        policy,
        partition: partition.name().to_string(),
    }
}

/// Storage errors on lookup count as a miss.
async fn lookup(partition: &Partition, key: &CacheKey, policy: Policy) -> Option<CachedResponse> {
    match partition.match_entry(key).await {
        Ok(Some(hit)) => {
            tracing::debug!(key = %key, partition = partition.name(), "cache HIT");
            metrics::counter!("gateway_cache_hits_total", "policy" => policy.label()).increment(1);
            Some(hit)
        }
        Ok(None) => {
            tracing::debug!(key = %key, partition = partition.name(), "cache MISS");
            metrics::counter!("gateway_cache_misses_total", "policy" => policy.label()).increment(1);
            None
        }
        Err(e) => {
            tracing::warn!(key = %key, partition = partition.name(), error = %e, "cache lookup failed");
            metrics::counter!("gateway_storage_errors_total", "op" => "match").increment(1);
            metrics::counter!("gateway_cache_misses_total", "policy" => policy.label()).increment(1);
            None
        }
    }
}

/// Persist a `200` response into `partition`, unless an activation has
/// superseded it while the fetch was in flight. Write failures are logged and
/// swallowed.
async fn store_if_current(
    generation: &ArcSwapOption<GenerationSet>,
    partition: &Partition,
    key: &CacheKey,
    response: &CachedResponse,
) {
    if !response.is_storable() {
        tracing::debug!(key = %key, status = response.status, "not caching non-200 response");
        return;
    }
    let current = generation
        .load()
        .as_ref()
        .is_some_and(|g| g.contains(partition.name()));
    if !current {
        tracing::debug!(key = %key, partition = partition.name(), "partition superseded, dropping write");
        return;
    }
    match partition.put(key, response).await {
        Ok(()) => {
            metrics::counter!("gateway_cache_stores_total", "partition" => partition.name().to_string())
                .increment(1);
        }
        Err(e) => {
            tracing::warn!(key = %key, partition = partition.name(), error = %e, "cache write failed");
            metrics::counter!("gateway_storage_errors_total", "op" => "put").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::MockFetcher;
    use crate::lifecycle::Lifecycle;
    use crate::request::Destination;
    use arcade_cache::{CacheStore, MemoryBackend, StorageBackend, StorageError};
    use async_trait::async_trait;
    use axum::http::Method;
    use std::time::Duration;

    const GENERAL: &str = "game-v1-cache";
    const IMAGE: &str = "game-image-cache-v1";

    struct Harness {
        store: CacheStore,
        fetcher: Arc<MockFetcher>,
        gateway: Gateway,
    }

    async fn harness_with(store: CacheStore, fetcher: MockFetcher) -> Harness {
        let fetcher = Arc::new(fetcher);
        let lifecycle = Lifecycle::new(store.clone());
        lifecycle
            .install_and_activate(GenerationSet::new(&store, GENERAL, IMAGE).unwrap())
            .await
            .unwrap();
        let gateway = Gateway::new(fetcher.clone(), lifecycle.controller(), Scope::Any);
        Harness {
            store,
            fetcher,
            gateway,
        }
    }

    async fn harness(fetcher: MockFetcher) -> Harness {
        harness_with(CacheStore::new(Arc::new(MemoryBackend::new())), fetcher).await
    }

    fn get(uri: &str, destination: Destination) -> InterceptedRequest {
        InterceptedRequest::new(Method::GET, uri.parse().unwrap(), destination)
    }

    fn unwrap_served(i: Interception) -> Served {
        match i {
            Interception::Served(s) => s,
            other => panic!("expected served, got {other:?}"),
        }
    }

    async fn stored(h: &Harness, partition: &str, url: &str) -> Option<CachedResponse> {
        h.store
            .partition(partition)
            .unwrap()
            .match_entry(&CacheKey::get(url))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn image_miss_then_hit_without_network() {
        let url = "http://origin/thumb.png";
        let fetcher = MockFetcher::new();
        fetcher.respond(url, 200, "png-bytes");
        let h = harness(fetcher).await;

        let first = unwrap_served(h.gateway.handle(&get(url, Destination::Image)).await.unwrap());
        assert_eq!(first.source, Source::Network);
        assert_eq!(first.policy, Policy::CacheFirst);
        assert_eq!(first.partition, IMAGE);
        assert!(stored(&h, IMAGE, url).await.is_some());
        assert_eq!(h.fetcher.calls(), 1);

        let second = unwrap_served(h.gateway.handle(&get(url, Destination::Image)).await.unwrap());
        assert_eq!(second.source, Source::Cache);
        assert_eq!(second.response.body.as_ref(), b"png-bytes");
        assert_eq!(h.fetcher.calls(), 1, "cache-first hit must not touch the network");
    }

    #[tokio::test]
    async fn image_by_extension_without_destination_hint() {
        let url = "http://origin/games/slope/cover.JPG";
        let fetcher = MockFetcher::new();
        fetcher.respond(url, 200, "jpg");
        let h = harness(fetcher).await;

        let served = unwrap_served(h.gateway.handle(&get(url, Destination::Other)).await.unwrap());
        assert_eq!(served.policy, Policy::CacheFirst);
        assert!(stored(&h, IMAGE, url).await.is_some());
        assert!(stored(&h, GENERAL, url).await.is_none());
    }

    #[tokio::test]
    async fn image_non_200_is_returned_but_not_stored() {
        let url = "http://origin/missing.png";
        let fetcher = MockFetcher::new();
        fetcher.respond(url, 404, "gone");
        let h = harness(fetcher).await;

        let served = unwrap_served(h.gateway.handle(&get(url, Destination::Image)).await.unwrap());
        assert_eq!(served.response.status, 404);
        assert_eq!(h.store.partition(IMAGE).unwrap().len().await.unwrap(), 0);

        h.gateway.handle(&get(url, Destination::Image)).await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn image_network_failure_propagates() {
        let url = "http://origin/thumb.png";
        let fetcher = MockFetcher::new();
        fetcher.fail(url);
        let h = harness(fetcher).await;

        let err = h.gateway.handle(&get(url, Destination::Image)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert_eq!(h.store.partition(IMAGE).unwrap().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn general_miss_waits_for_network_and_stores() {
        let url = "http://origin/g/index.json";
        let fetcher = MockFetcher::new();
        fetcher.respond(url, 200, "[]");
        let h = harness(fetcher).await;

        let served = unwrap_served(h.gateway.handle(&get(url, Destination::Empty)).await.unwrap());
        assert_eq!(served.source, Source::Network);
        assert_eq!(served.policy, Policy::StaleWhileRevalidate);
        assert_eq!(served.response.body.as_ref(), b"[]");
        assert_eq!(stored(&h, GENERAL, url).await.unwrap().body.as_ref(), b"[]");
    }

    #[tokio::test]
    async fn stale_value_served_immediately_then_refreshed() {
        let url = "http://origin/api/data.json";
        let fetcher = MockFetcher::gated();
        fetcher.respond(url, 200, r#"{"a":2}"#);
        let h = harness(fetcher).await;

        h.store
            .partition(GENERAL)
            .unwrap()
            .put(&CacheKey::get(url), &CachedResponse::new(200, vec![], r#"{"a":1}"#))
            .await
            .unwrap();

        // The network is blocked, so only the cached copy can answer in time.
        let served = tokio::time::timeout(
            Duration::from_secs(1),
            h.gateway.handle(&get(url, Destination::Empty)),
        )
        .await
        .expect("stale hit must not wait for the network")
        .unwrap();
        let served = unwrap_served(served);
        assert_eq!(served.source, Source::Cache);
        assert_eq!(served.response.body.as_ref(), br#"{"a":1}"#);

        h.fetcher.release(1);
        h.gateway.settle().await;
        assert_eq!(h.fetcher.calls_for(url), 1);
        assert_eq!(stored(&h, GENERAL, url).await.unwrap().body.as_ref(), br#"{"a":2}"#);

        h.fetcher.release(1);
        let next = unwrap_served(h.gateway.handle(&get(url, Destination::Empty)).await.unwrap());
        assert_eq!(next.response.body.as_ref(), br#"{"a":2}"#);
        h.gateway.settle().await;
    }

    #[tokio::test]
    async fn refresh_outlives_the_caller() {
        let url = "http://origin/c/index.json";
        let fetcher = MockFetcher::gated();
        fetcher.respond(url, 200, "cats");
        let h = harness(fetcher).await;

        // Caller gives up before the network answers.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), h.gateway.handle(&get(url, Destination::Empty)))
                .await;
        assert!(abandoned.is_err());

        h.fetcher.release(1);
        h.gateway.settle().await;
        assert_eq!(stored(&h, GENERAL, url).await.unwrap().body.as_ref(), b"cats");
    }

    #[tokio::test]
    async fn failed_refresh_is_swallowed_when_stale_exists() {
        let url = "http://origin/a/index.json";
        let fetcher = MockFetcher::new();
        fetcher.fail(url);
        let h = harness(fetcher).await;
        h.store
            .partition(GENERAL)
            .unwrap()
            .put(&CacheKey::get(url), &CachedResponse::new(200, vec![], "old"))
            .await
            .unwrap();

        let served = unwrap_served(h.gateway.handle(&get(url, Destination::Empty)).await.unwrap());
        assert_eq!(served.response.body.as_ref(), b"old");

        h.gateway.settle().await;
        assert_eq!(stored(&h, GENERAL, url).await.unwrap().body.as_ref(), b"old");
    }

    #[tokio::test]
    async fn failed_fetch_without_stale_propagates() {
        let url = "http://origin/a/index.json";
        let fetcher = MockFetcher::new();
        fetcher.fail(url);
        let h = harness(fetcher).await;

        let err = h.gateway.handle(&get(url, Destination::Empty)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert!(stored(&h, GENERAL, url).await.is_none());
    }

    #[tokio::test]
    async fn non_200_refresh_keeps_stale_entry() {
        let url = "http://origin/g/index.json";
        let fetcher = MockFetcher::new();
        fetcher.respond(url, 503, "maintenance");
        let h = harness(fetcher).await;
        h.store
            .partition(GENERAL)
            .unwrap()
            .put(&CacheKey::get(url), &CachedResponse::new(200, vec![], "good"))
            .await
            .unwrap();

        h.gateway.handle(&get(url, Destination::Empty)).await.unwrap();
        h.gateway.settle().await;
        assert_eq!(stored(&h, GENERAL, url).await.unwrap().body.as_ref(), b"good");

        // With nothing cached the caller sees the real error response.
        let other = "http://origin/fresh.json";
        h.fetcher.respond(other, 503, "maintenance");
        let served = unwrap_served(h.gateway.handle(&get(other, Destination::Empty)).await.unwrap());
        assert_eq!(served.response.status, 503);
        assert!(stored(&h, GENERAL, other).await.is_none());
    }

    #[tokio::test]
    async fn non_get_never_touches_storage() {
        let url = "http://origin/thumb.png";
        let h = harness(MockFetcher::new()).await;

        for method in [Method::POST, Method::PUT, Method::DELETE] {
            let req = InterceptedRequest::new(method, url.parse().unwrap(), Destination::Image);
            let result = h.gateway.handle(&req).await.unwrap();
            assert!(matches!(result, Interception::PassThrough(PassReason::Method)));
        }

        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(h.store.partition(IMAGE).unwrap().len().await.unwrap(), 0);
        assert_eq!(h.store.partition(GENERAL).unwrap().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn uncontrolled_before_activation() {
        let store = CacheStore::new(Arc::new(MemoryBackend::new()));
        let lifecycle = Lifecycle::new(store.clone());
        let fetcher = Arc::new(MockFetcher::new());
        let gateway = Gateway::new(fetcher.clone(), lifecycle.controller(), Scope::Any);

        let result = gateway
            .handle(&get("http://origin/g/index.json", Destination::Empty))
            .await
            .unwrap();
        assert!(matches!(result, Interception::PassThrough(PassReason::Uncontrolled)));
        assert!(store.partition_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_generation_serves_existing_clients_immediately() {
        let url = "http://origin/g/index.json";
        let fetcher = MockFetcher::new();
        fetcher.respond(url, 200, "v1");
        let store = CacheStore::new(Arc::new(MemoryBackend::new()));
        let lifecycle = Lifecycle::new(store.clone());
        lifecycle
            .install_and_activate(GenerationSet::new(&store, GENERAL, IMAGE).unwrap())
            .await
            .unwrap();
        let gateway = Gateway::new(Arc::new(fetcher), lifecycle.controller(), Scope::Any);

        gateway.handle(&get(url, Destination::Empty)).await.unwrap();
        gateway.settle().await;

        lifecycle
            .install_and_activate(GenerationSet::new(&store, "game-v2-cache", IMAGE).unwrap())
            .await
            .unwrap();

        let served = unwrap_served(gateway.handle(&get(url, Destination::Empty)).await.unwrap());
        assert_eq!(served.partition, "game-v2-cache");
        assert_eq!(served.source, Source::Network, "old generation entries are gone");
        gateway.settle().await;
    }

    /// Memory backend whose writes always fail.
    struct ReadOnlyBackend(MemoryBackend);

    #[async_trait]
    impl StorageBackend for ReadOnlyBackend {
        async fn open_partition(&self, name: &str) -> Result<(), StorageError> {
            self.0.open_partition(name).await
        }

        async fn match_entry(
            &self,
            partition: &str,
            key: &CacheKey,
        ) -> Result<Option<CachedResponse>, StorageError> {
            self.0.match_entry(partition, key).await
        }

        async fn put_entry(
            &self,
            _partition: &str,
            _key: &CacheKey,
            _response: &CachedResponse,
        ) -> Result<(), StorageError> {
            Err(std::io::Error::other("quota exceeded").into())
        }

        async fn delete_entry(&self, partition: &str, key: &CacheKey) -> Result<bool, StorageError> {
            self.0.delete_entry(partition, key).await
        }

        async fn partition_names(&self) -> Result<Vec<String>, StorageError> {
            self.0.partition_names().await
        }

        async fn delete_partition(&self, name: &str) -> Result<bool, StorageError> {
            self.0.delete_partition(name).await
        }

        async fn entry_count(&self, partition: &str) -> Result<usize, StorageError> {
            self.0.entry_count(partition).await
        }

        fn name(&self) -> &'static str {
            "read-only"
        }
    }

    #[tokio::test]
    async fn storage_write_failure_still_returns_response() {
        let store = CacheStore::new(Arc::new(ReadOnlyBackend(MemoryBackend::new())));
        let fetcher = MockFetcher::new();
        fetcher.respond("http://origin/thumb.png", 200, "png");
        fetcher.respond("http://origin/data.json", 200, "json");
        let h = harness_with(store, fetcher).await;

        let image = unwrap_served(
            h.gateway
                .handle(&get("http://origin/thumb.png", Destination::Image))
                .await
                .unwrap(),
        );
        assert_eq!(image.response.body.as_ref(), b"png");

        let general = unwrap_served(
            h.gateway
                .handle(&get("http://origin/data.json", Destination::Empty))
                .await
                .unwrap(),
        );
        assert_eq!(general.response.body.as_ref(), b"json");
    }

    #[tokio::test]
    async fn concurrent_misses_last_write_wins() {
        let url = "http://origin/g/index.json";
        let fetcher = MockFetcher::new();
        fetcher.respond(url, 200, "same");
        let h = harness(fetcher).await;

        let first = get(url, Destination::Empty);
        let second = get(url, Destination::Empty);
        let (a, b) = tokio::join!(h.gateway.handle(&first), h.gateway.handle(&second));
        a.unwrap();
        b.unwrap();
        h.gateway.settle().await;

        assert_eq!(h.store.partition(GENERAL).unwrap().len().await.unwrap(), 1);
        assert_eq!(stored(&h, GENERAL, url).await.unwrap().body.as_ref(), b"same");
    }

    #[tokio::test]
    async fn late_refresh_does_not_recreate_superseded_partition() {
        let url = "http://origin/g/index.json";
        let fetcher = Arc::new(MockFetcher::gated());
        fetcher.respond(url, 200, "fresh");
        let store = CacheStore::new(Arc::new(MemoryBackend::new()));
        let lifecycle = Lifecycle::new(store.clone());
        lifecycle
            .install_and_activate(GenerationSet::new(&store, GENERAL, IMAGE).unwrap())
            .await
            .unwrap();
        let gateway = Gateway::new(fetcher.clone(), lifecycle.controller(), Scope::Any);

        store
            .partition(GENERAL)
            .unwrap()
            .put(&CacheKey::get(url), &CachedResponse::new(200, vec![], "stale"))
            .await
            .unwrap();

        // Stale hit returns at once; the refresh stays blocked on the network.
        let served = unwrap_served(gateway.handle(&get(url, Destination::Empty)).await.unwrap());
        assert_eq!(served.source, Source::Cache);
        assert_eq!(gateway.pending_refreshes(), 1);

        lifecycle
            .install_and_activate(GenerationSet::new(&store, "game-v2-cache", IMAGE).unwrap())
            .await
            .unwrap();
        assert_eq!(
            store.partition_names().await.unwrap(),
            vec![IMAGE, "game-v2-cache"]
        );

        fetcher.release(1);
        gateway.settle().await;
        assert_eq!(fetcher.calls_for(url), 1);
        assert_eq!(
            store.partition_names().await.unwrap(),
            vec![IMAGE, "game-v2-cache"]
        );
    }

    #[tokio::test]
    async fn equivalent_urls_share_one_entry() {
        let fetcher = MockFetcher::new();
        fetcher.respond("http://origin/thumb.png", 200, "png");
        fetcher.respond("http://ORIGIN:80/thumb.png", 200, "png");
        let h = harness(fetcher).await;

        h.gateway
            .handle(&get("http://origin/thumb.png", Destination::Image))
            .await
            .unwrap();
        let second = unwrap_served(
            h.gateway
                .handle(&get("http://ORIGIN:80/thumb.png", Destination::Image))
                .await
                .unwrap(),
        );
        assert_eq!(second.source, Source::Cache);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.store.partition(IMAGE).unwrap().len().await.unwrap(), 1);
    }
}
