//! URL-prefix routing of requests to transport factories
//!
//! The table is built once and is immutable afterwards; lookups pick the
//! longest mounted prefix that matches the full request URL.

use std::sync::Arc;

use crate::http::reqwest_transport::ReqwestTransportFactory;
use crate::http::transport::TransportFactory;

/// A mounted prefix and the factory serving it
#[derive(Clone)]
struct Route {
    prefix: String,
    factory: Arc<dyn TransportFactory>,
}

/// Immutable longest-prefix routing table
#[derive(Clone)]
pub struct RoutingTable {
    /// Sorted by descending prefix length so the first hit is the longest
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Factory for `url`, if any mounted prefix matches
    pub fn resolve(&self, url: &str) -> Option<Arc<dyn TransportFactory>> {
        let lowered = url.to_ascii_lowercase();
        self.routes
            .iter()
            .find(|route| lowered.starts_with(&route.prefix))
            .map(|route| Arc::clone(&route.factory))
    }

    /// Mounted prefixes, longest first
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.prefix.as_str())
    }
}

impl Default for RoutingTable {
    /// reqwest transports mounted for plain and TLS HTTP
    fn default() -> Self {
        RoutingTableBuilder::with_defaults().build()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|r| (&r.prefix, r.factory.name())))
            .finish()
    }
}

/// Collects mounts before the table is frozen
#[derive(Default)]
pub struct RoutingTableBuilder {
    routes: Vec<Route>,
}

impl RoutingTableBuilder {
    /// Start from the reqwest mounts for `http://` and `https://`
    pub fn with_defaults() -> Self {
        let factory: Arc<dyn TransportFactory> = Arc::new(ReqwestTransportFactory::new());
        Self::default()
            .mount("http://", Arc::clone(&factory))
            .mount("https://", factory)
    }

    /// Mount `factory` at `prefix`; a later mount of the same prefix replaces it
    pub fn mount(mut self, prefix: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        let prefix = prefix.into().to_ascii_lowercase();
        self.routes.retain(|route| route.prefix != prefix);
        self.routes.push(Route { prefix, factory });
        self
    }

    pub fn build(mut self) -> RoutingTable {
        // stable sort keeps mount order among equal lengths
        self.routes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        RoutingTable {
            routes: self.routes,
        }
    }
}
