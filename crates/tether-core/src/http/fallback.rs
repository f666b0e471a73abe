//! Protocol selection and negotiation fallback per target
//!
//! The selector owns the binding table: at most one live transport per
//! (target, effective version). Each (target, requested version) pair has a
//! cursor into its fallback chain which only moves forward, and only when a
//! negotiation failure is reported. Ordinary network and status failures never
//! move it, and neither does anything that goes wrong on a version the target
//! has already completed an exchange over.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::http::protocol::{Capabilities, ProtocolVersion};
use crate::http::request::{Request, Response};
use crate::http::routing::RoutingTable;
use crate::http::target::Target;
use crate::http::transport::{ConnectionHandle, Transport, TransportError, TransportSettings};

type BindingKey = (Target, ProtocolVersion);

/// A transport opened for one target over one effective version
pub struct Binding {
    transport: Arc<dyn Transport>,
    handle: ConnectionHandle,
    negotiated: AtomicBool,
}

impl Binding {
    pub fn version(&self) -> ProtocolVersion {
        self.handle.version()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Whether an exchange over this binding has completed
    pub fn is_negotiated(&self) -> bool {
        self.negotiated.load(Ordering::Acquire)
    }

    pub async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        self.transport.send(&self.handle, request).await
    }

    async fn close(&self) {
        self.transport.close(self.handle.clone()).await;
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("handle", &self.handle).finish()
    }
}

#[derive(Default)]
struct SelectorState {
    bindings: HashMap<BindingKey, Arc<Binding>>,
    /// Creation order, oldest first
    order: VecDeque<BindingKey>,
    /// Chain position per (target, requested version)
    cursors: HashMap<BindingKey, usize>,
    /// (target, effective version) pairs that completed an exchange
    negotiated: HashSet<BindingKey>,
}

impl SelectorState {
    fn remove(&mut self, key: &BindingKey) -> Option<Arc<Binding>> {
        self.order.retain(|k| k != key);
        self.bindings.remove(key)
    }
}

/// Resolves transports for targets, with fallback on negotiation failure
pub struct TransportSelector {
    routing: RoutingTable,
    capabilities: Capabilities,
    settings: TransportSettings,
    state: RwLock<SelectorState>,
    /// Serializes binding creation and teardown
    pool_lock: Mutex<()>,
}

impl TransportSelector {
    pub fn new(routing: RoutingTable, capabilities: Capabilities, settings: TransportSettings) -> Self {
        Self {
            routing,
            capabilities,
            settings,
            state: RwLock::new(SelectorState::default()),
            pool_lock: Mutex::new(()),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, SelectorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SelectorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remaining candidates for `target`, most preferred first
    pub fn resolve(&self, target: &Target, requested: ProtocolVersion) -> Vec<ProtocolVersion> {
        let chain = self.capabilities.chain_for(requested);
        let cursor = self
            .read()
            .cursors
            .get(&(target.clone(), requested))
            .copied()
            .unwrap_or(0);
        chain.into_iter().skip(cursor).collect()
    }

    /// The candidate the next attempt should use
    pub fn current(&self, target: &Target, requested: ProtocolVersion) -> Option<ProtocolVersion> {
        self.resolve(target, requested).first().copied()
    }

    /// Binding for (target, version), created on first use
    pub async fn acquire(
        &self,
        url: &Url,
        target: &Target,
        version: ProtocolVersion,
    ) -> Result<Arc<Binding>, TransportError> {
        let key = (target.clone(), version);
        let existing = self.read().bindings.get(&key).cloned();
        if let Some(binding) = existing {
            return Ok(binding);
        }

        let _guard = self.pool_lock.lock().await;
        // another caller may have created it while we waited
        let existing = self.read().bindings.get(&key).cloned();
        if let Some(binding) = existing {
            return Ok(binding);
        }

        let factory = self.routing.resolve(url.as_str()).ok_or_else(|| {
            TransportError::Request(format!("no transport mounted for {}", url))
        })?;
        let transport = factory.create(version, &self.settings)?;
        let handle = transport.open(target).await?;
        debug!(target = %target, version = %version, factory = factory.name(), "opened binding");

        let binding = Arc::new(Binding {
            transport,
            handle,
            negotiated: AtomicBool::new(false),
        });
        let evicted = {
            let mut state = self.write();
            state.bindings.insert(key.clone(), Arc::clone(&binding));
            state.order.push_back(key);

            let mut evicted = Vec::new();
            while state.bindings.len() > self.settings.pool.max_pools {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                if let Some(old) = state.bindings.remove(&oldest) {
                    evicted.push(old);
                }
            }
            evicted
        };
        for old in evicted {
            debug!(target = %old.handle.target(), version = %old.version(), "evicting binding");
            old.close().await;
        }

        Ok(binding)
    }

    /// Record a negotiation failure of `failed` and return the next candidate
    ///
    /// The failed binding is torn down. When `failed` was the last candidate
    /// the cursor stays on it and `None` is returned.
    pub async fn advance(
        &self,
        target: &Target,
        requested: ProtocolVersion,
        failed: ProtocolVersion,
    ) -> Option<ProtocolVersion> {
        let chain = self.capabilities.chain_for(requested);
        let position = chain.iter().position(|v| *v == failed)?;
        let next = chain.get(position + 1).copied();

        let _guard = self.pool_lock.lock().await;
        let removed = {
            let mut state = self.write();
            if next.is_some() {
                let cursor = state.cursors.entry((target.clone(), requested)).or_insert(0);
                *cursor = (*cursor).max(position + 1);
            }
            state.remove(&(target.clone(), failed))
        };
        if let Some(binding) = removed {
            binding.close().await;
        }

        match next {
            Some(next) => info!(target = %target, from = %failed, to = %next, "protocol fallback"),
            None => info!(target = %target, version = %failed, "no protocol left to fall back to"),
        }
        next
    }

    /// Record that `binding` completed an exchange
    ///
    /// From then on the pair is established for the lifetime of the selector,
    /// surviving eviction and [`close_all`](Self::close_all).
    pub fn mark_negotiated(&self, binding: &Binding) {
        if binding.negotiated.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = binding.handle.target();
        let inserted = self
            .write()
            .negotiated
            .insert((target.clone(), binding.version()));
        if inserted {
            debug!(target = %target, version = %binding.version(), "protocol negotiated");
        }
    }

    /// Whether `target` has completed an exchange over `version`
    pub fn is_negotiated(&self, target: &Target, version: ProtocolVersion) -> bool {
        self.read().negotiated.contains(&(target.clone(), version))
    }

    /// Number of live bindings
    pub fn binding_count(&self) -> usize {
        self.read().bindings.len()
    }

    /// Effective versions with a live binding for `target`
    pub fn bound_versions(&self, target: &Target) -> Vec<ProtocolVersion> {
        let mut versions: Vec<ProtocolVersion> = self
            .read()
            .bindings
            .keys()
            .filter(|(t, _)| t == target)
            .map(|(_, v)| *v)
            .collect();
        versions.sort();
        versions
    }

    /// Close every binding; negotiated positions are kept
    pub async fn close_all(&self) {
        let _guard = self.pool_lock.lock().await;
        let drained: Vec<Arc<Binding>> = {
            let mut state = self.write();
            state.order.clear();
            state.bindings.drain().map(|(_, binding)| binding).collect()
        };
        for binding in drained {
            binding.close().await;
        }
    }
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("routing", &self.routing)
            .field("capabilities", &self.capabilities)
            .field("bindings", &self.binding_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::{PoolSettings, TransportFactory};
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    struct CountingTransport {
        version: ProtocolVersion,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn version(&self) -> ProtocolVersion {
            self.version
        }

        async fn open(&self, target: &Target) -> Result<ConnectionHandle, TransportError> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(ConnectionHandle::new(target.clone(), self.version))
        }

        async fn send(
            &self,
            _handle: &ConnectionHandle,
            request: &Request,
        ) -> Result<Response, TransportError> {
            Ok(Response::new(
                StatusCode::OK,
                HeaderMap::new(),
                "",
                self.version,
                request.url().clone(),
            ))
        }

        async fn close(&self, _handle: ConnectionHandle) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory(Arc<Counters>);

    impl TransportFactory for CountingFactory {
        fn create(
            &self,
            version: ProtocolVersion,
            _settings: &TransportSettings,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            self.0.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingTransport {
                version,
                counters: Arc::clone(&self.0),
            }))
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn selector(max_pools: usize) -> (TransportSelector, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let routing = RoutingTable::builder()
            .mount("https://", Arc::new(CountingFactory(Arc::clone(&counters))))
            .build();
        let settings = TransportSettings {
            pool: PoolSettings {
                max_pools,
                max_connections: 4,
            },
            connect_timeout: Duration::from_secs(1),
            read_timeout: None,
        };
        (
            TransportSelector::new(routing, Capabilities::all(), settings),
            counters,
        )
    }

    fn url(raw: &str) -> (Url, Target) {
        let url = Url::parse(raw).unwrap();
        let target = Target::from_url(&url).unwrap();
        (url, target)
    }

    #[test]
    fn test_chain_follows_requested_version() {
        let (selector, _) = selector(10);
        let (_, target) = url("https://api.example.com");
        assert_eq!(
            selector.resolve(&target, ProtocolVersion::Http3),
            vec![ProtocolVersion::Http3, ProtocolVersion::Http2, ProtocolVersion::Http11]
        );
        assert_eq!(
            selector.resolve(&target, ProtocolVersion::Http11),
            vec![ProtocolVersion::Http11]
        );
    }

    #[test]
    fn test_unavailable_protocols_are_pruned() {
        let selector = TransportSelector::new(
            RoutingTable::default(),
            Capabilities::from_versions([ProtocolVersion::Http11, ProtocolVersion::Http2]),
            selector(1).0.settings().clone(),
        );
        let (_, target) = url("https://api.example.com");
        assert_eq!(
            selector.current(&target, ProtocolVersion::Http3),
            Some(ProtocolVersion::Http2)
        );
    }

    #[tokio::test]
    async fn test_binding_is_reused() {
        let (selector, counters) = selector(10);
        let (url, target) = url("https://api.example.com/a");

        let first = selector.acquire(&url, &target, ProtocolVersion::Http2).await.unwrap();
        let second = selector.acquire(&url, &target, ProtocolVersion::Http2).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_contact_creates_one_binding() {
        let (selector, counters) = selector(10);
        let selector = Arc::new(selector);
        let (url, target) = url("https://api.example.com");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let selector = Arc::clone(&selector);
                let url = url.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    selector.acquire(&url, &target, ProtocolVersion::Http11).await.unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(selector.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_advance_moves_cursor_for_that_target_only() {
        let (selector, counters) = selector(10);
        let (url_a, a) = url("https://quic.example.com");
        let (_, b) = url("https://other.example.com");

        selector.acquire(&url_a, &a, ProtocolVersion::Http3).await.unwrap();
        let next = selector
            .advance(&a, ProtocolVersion::Http3, ProtocolVersion::Http3)
            .await;

        assert_eq!(next, Some(ProtocolVersion::Http2));
        assert_eq!(selector.current(&a, ProtocolVersion::Http3), Some(ProtocolVersion::Http2));
        assert_eq!(selector.current(&b, ProtocolVersion::Http3), Some(ProtocolVersion::Http3));
        // the failed binding is torn down
        assert!(selector.bound_versions(&a).is_empty());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_advance_is_idempotent_and_stops_at_end_of_chain() {
        let (selector, _) = selector(10);
        let (_, target) = url("https://api.example.com");

        selector.advance(&target, ProtocolVersion::Http3, ProtocolVersion::Http3).await;
        // a late report for the same failure does not skip HTTP/2
        selector.advance(&target, ProtocolVersion::Http3, ProtocolVersion::Http3).await;
        assert_eq!(
            selector.current(&target, ProtocolVersion::Http3),
            Some(ProtocolVersion::Http2)
        );

        selector.advance(&target, ProtocolVersion::Http3, ProtocolVersion::Http2).await;
        let last = selector
            .advance(&target, ProtocolVersion::Http3, ProtocolVersion::Http11)
            .await;
        assert_eq!(last, None);
        assert_eq!(
            selector.current(&target, ProtocolVersion::Http3),
            Some(ProtocolVersion::Http11)
        );
    }

    #[tokio::test]
    async fn test_negotiated_version_outlives_its_binding() {
        let (selector, _) = selector(10);
        let (url, target) = url("https://api.example.com");

        let binding = selector.acquire(&url, &target, ProtocolVersion::Http2).await.unwrap();
        assert!(!binding.is_negotiated());
        assert!(!selector.is_negotiated(&target, ProtocolVersion::Http2));

        selector.mark_negotiated(&binding);
        selector.mark_negotiated(&binding);
        assert!(binding.is_negotiated());
        assert!(selector.is_negotiated(&target, ProtocolVersion::Http2));
        assert!(!selector.is_negotiated(&target, ProtocolVersion::Http3));

        selector.close_all().await;
        assert!(selector.is_negotiated(&target, ProtocolVersion::Http2));
    }

    #[tokio::test]
    async fn test_oldest_binding_is_evicted_past_pool_limit() {
        let (selector, counters) = selector(2);
        for host in ["a", "b", "c"] {
            let (url, target) = url(&format!("https://{}.example.com", host));
            selector.acquire(&url, &target, ProtocolVersion::Http2).await.unwrap();
        }

        assert_eq!(selector.binding_count(), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        let (_, a) = url("https://a.example.com");
        assert!(selector.bound_versions(&a).is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_url_is_fatal() {
        let (selector, _) = selector(2);
        let (url, target) = url("http://plain.example.com");
        let err = selector
            .acquire(&url, &target, ProtocolVersion::Http11)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Request(_)));
        assert!(!err.is_negotiation_failure());
    }

    #[tokio::test]
    async fn test_close_all_keeps_negotiated_position() {
        let (selector, counters) = selector(4);
        let (url, target) = url("https://api.example.com");
        selector.acquire(&url, &target, ProtocolVersion::Http2).await.unwrap();
        selector.advance(&target, ProtocolVersion::Http3, ProtocolVersion::Http3).await;

        selector.close_all().await;

        assert_eq!(selector.binding_count(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            selector.current(&target, ProtocolVersion::Http3),
            Some(ProtocolVersion::Http2)
        );
    }
}
