//! Provider abstraction.
//!
//! A provider is the adapter between the engine and one class of
//! infrastructure (ssh-reachable hosts, a container platform, a cloud API).
//! The engine never inspects provider internals: connections are opaque
//! `Any` values the provider downcasts on its own, and every method is a
//! suspension point the engine wraps in a per-call timeout.
//!
//! Connection-open timeouts are recoverable; everything else a provider
//! raises is treated as fatal by the engine so an incomplete graph never
//! masquerades as a complete one.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use catalog::{ProfileStrategy, ResponseParseError};
use graph::GraphStore;
use types::{Hint, NodeTransport, NodeType};

use crate::settings::DiscoverySettings;

/// Opaque connection handle passed back into the provider that opened it.
pub type ProviderConnection = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Recoverable when raised from `open_connection`; fatal elsewhere.
    #[error("provider timeout: {message}")]
    Timeout { message: String },

    #[error("provider failure: {message}")]
    Failed { message: String },

    #[error(transparent)]
    Response(#[from] ResponseParseError),

    #[error("provider i/o failure: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl ProviderError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// The capability contract every provider plugin satisfies.
///
/// Every method except `ref_id` and `is_container_platform` has a no-op
/// default so providers implement only the capabilities they have.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short unique id, e.g. `ssh`, `k8s`, `proc`.
    fn ref_id(&self) -> &'static str;

    /// Container-platform providers produce containerized children.
    fn is_container_platform(&self) -> bool {
        false
    }

    /// Optional bulk population of the graph before discovery begins.
    async fn inventory(&self, _graph: Arc<dyn GraphStore>) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Open a connection to an address for reuse across the node's phases.
    async fn open_connection(
        &self,
        _address: &str,
    ) -> Result<Option<ProviderConnection>, ProviderError> {
        Ok(None)
    }

    /// Resolve the service name behind an address; `None` when the provider
    /// has no way to know.
    async fn lookup_name(
        &self,
        _address: &str,
        _connection: Option<&ProviderConnection>,
    ) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    /// Opportunistic per-connection work after name lookup. Sidecars may
    /// save nodes into the graph but never touch the working set.
    async fn sidecar(
        &self,
        _address: &str,
        _connection: Option<&ProviderConnection>,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Enumerate downstream dependencies for one strategy invocation.
    async fn profile(
        &self,
        _address: &str,
        _connection: Option<&ProviderConnection>,
        _strategy: &ProfileStrategy,
    ) -> Result<Vec<NodeTransport>, ProviderError> {
        Ok(vec![])
    }

    /// Resolve a static hint into concrete transports. The default answers
    /// with the single transport the hint itself describes; instance
    /// providers override this to look up a live address.
    async fn take_a_hint(&self, hint: &Hint) -> Result<Vec<NodeTransport>, ProviderError> {
        let mut transport = NodeTransport::new(
            "Hint",
            hint.provider.clone(),
            hint.protocol.clone(),
            hint.protocol_mux.clone(),
            None,
            true,
            Some(hint.service_name.clone()),
            None,
        );
        transport.node_type = NodeType::Compute;
        Ok(vec![transport])
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider {0} already registered")]
    DuplicateRef(String),

    #[error("no provider registered for ref {0}")]
    UnknownProvider(String),
}

/// Maps provider refs to implementations, with an optional per-provider
/// concurrency bound enforced by the engine around every provider call.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    limiters: HashMap<String, Arc<Semaphore>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; two providers may not share a ref.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        let ref_id = provider.ref_id().to_string();
        if self.providers.contains_key(&ref_id) {
            return Err(RegistryError::DuplicateRef(ref_id));
        }
        debug!(provider = %ref_id, "registered provider");
        self.providers.insert(ref_id, provider);
        Ok(())
    }

    /// Bound concurrent calls into one provider.
    pub fn set_concurrency(&mut self, ref_id: impl Into<String>, permits: usize) {
        self.limiters
            .insert(ref_id.into(), Arc::new(Semaphore::new(permits)));
    }

    pub fn get(&self, ref_id: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        self.providers
            .get(ref_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider(ref_id.to_string()))
    }

    pub fn limiter(&self, ref_id: &str) -> Option<Arc<Semaphore>> {
        self.limiters.get(ref_id).cloned()
    }

    pub fn refs(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Run the inventory pass for every enabled provider.
    pub async fn perform_inventory(
        &self,
        settings: &DiscoverySettings,
        graph: Arc<dyn GraphStore>,
    ) -> Result<(), ProviderError> {
        if settings.seeds_only {
            info!("skipping inventory: --seeds-only");
            return Ok(());
        }
        if settings.skip_inventory {
            info!("skipping inventory: --skip-inventory");
            return Ok(());
        }
        for (ref_id, provider) in &self.providers {
            if settings.disable_providers.contains(ref_id) {
                continue;
            }
            debug!(provider = %ref_id, "running inventory");
            provider.inventory(graph.clone()).await?;
        }
        Ok(())
    }
}
