//! The recursive, concurrent discovery engine.
//!
//! One `discover` call works a set of nodes through strictly ordered phases:
//! filter unreachable muxes, open connections, resolve service names, run
//! sidecars, guard depth, then profile. Tasks within a phase run
//! concurrently; recursion into discovered children is fire-and-forget, and
//! `run` returns once every spawned task has quiesced.
//!
//! Failure policy: a connection-open timeout marks the node and discovery
//! continues with its siblings. Any other provider failure, including a
//! timeout during name lookup, sidecar or profiling, is converted into a
//! `FatalDiscoveryError` carrying the ancestor chain; the runner logs it and
//! exits non-zero so a partial graph never pretends to be complete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use catalog::{hint_strategy, NetworkCatalog, ProfileStrategy, StrategyRegistry, SEED_PROFILE_STRATEGY};
use graph::{GraphError, GraphStore};
use types::{
    Hint, Node, NodeError, NodeHandle, NodeTransport, NodeType, NodeWarning, Tree, PROTOCOL_TCP,
};

use crate::obfuscate::Obfuscator;
use crate::provider::{Provider, ProviderConnection, ProviderError, ProviderRegistry};
use crate::settings::DiscoverySettings;

#[derive(Debug, Error)]
pub enum FatalDiscoveryError {
    #[error("timeout during {phase} for {subject} (ancestors: {ancestors:?})")]
    Timeout {
        phase: &'static str,
        subject: String,
        ancestors: Vec<String>,
    },

    #[error("failure during {phase} for {subject} (ancestors: {ancestors:?}): {message}")]
    Failure {
        phase: &'static str,
        subject: String,
        ancestors: Vec<String>,
        message: String,
    },

    #[error("invalid seed {0:?}: expected \"provider:address\"")]
    InvalidSeed(String),
}

impl FatalDiscoveryError {
    fn from_provider(
        phase: &'static str,
        subject: impl Into<String>,
        ancestors: &[String],
        err: ProviderError,
    ) -> Self {
        let subject = subject.into();
        let ancestors = ancestors.to_vec();
        if err.is_timeout() {
            Self::Timeout {
                phase,
                subject,
                ancestors,
            }
        } else {
            Self::Failure {
                phase,
                subject,
                ancestors,
                message: err.to_string(),
            }
        }
    }
}

/// Engine context: configuration, collaborators and the process-wide caches.
/// One engine instance exists per run; everything "global" lives here.
pub struct DiscoveryEngine {
    settings: DiscoverySettings,
    catalog: NetworkCatalog,
    strategies: StrategyRegistry,
    providers: ProviderRegistry,
    graph: Arc<dyn GraphStore>,
    obfuscator: Obfuscator,

    /// address -> resolved name; a `None` entry is a negative cache that
    /// also blocks connection opening for the address.
    service_name_cache: DashMap<String, Option<String>>,
    /// service name -> children, served as deep copies on later profiles.
    child_cache: DashMap<String, HashMap<String, Node>>,
    /// Single-flight gates so one service name is profiled at most once
    /// even when siblings resolve to it concurrently.
    profile_gates: DashMap<String, Arc<AsyncMutex<()>>>,
    /// alias -> resolved address (or None after a failed resolution).
    dns_cache: DashMap<String, Option<String>>,

    inflight: AtomicUsize,
    wake: Notify,
    fatal: Mutex<Option<FatalDiscoveryError>>,
    me: Weak<DiscoveryEngine>,
}

impl DiscoveryEngine {
    pub fn new(
        settings: DiscoverySettings,
        catalog: NetworkCatalog,
        strategies: StrategyRegistry,
        providers: ProviderRegistry,
        graph: Arc<dyn GraphStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            catalog,
            strategies,
            providers,
            graph,
            obfuscator: Obfuscator::new(),
            service_name_cache: DashMap::new(),
            child_cache: DashMap::new(),
            profile_gates: DashMap::new(),
            dns_cache: DashMap::new(),
            inflight: AtomicUsize::new(0),
            wake: Notify::new(),
            fatal: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    pub fn graph(&self) -> Arc<dyn GraphStore> {
        self.graph.clone()
    }

    /// Build the initial working set from `provider:address` seed specs.
    pub fn seed_tree(&self) -> Result<Tree, FatalDiscoveryError> {
        let mut tree = Tree::new();
        for seed in &self.settings.seeds {
            let Some((provider_ref, address)) = seed.split_once(':') else {
                return Err(FatalDiscoveryError::InvalidSeed(seed.clone()));
            };
            let provider = self.providers.get(provider_ref).map_err(|err| {
                FatalDiscoveryError::Failure {
                    phase: "seed",
                    subject: seed.clone(),
                    ancestors: vec![],
                    message: err.to_string(),
                }
            })?;
            let mut transport = NodeTransport::new(
                SEED_PROFILE_STRATEGY.name.clone(),
                provider_ref,
                PROTOCOL_TCP.clone(),
                "seed",
                Some(address.to_string()),
                false,
                None,
                None,
            );
            transport.node_type = NodeType::Compute;
            let node = Node::from_transport(&transport, provider.is_container_platform());
            tree.insert(transport.node_ref(), node.into_handle());
        }
        Ok(tree)
    }

    /// Run provider inventory, honoring the seeds-only / skip-inventory and
    /// disabled-provider flags.
    pub async fn perform_inventory(&self) -> Result<(), FatalDiscoveryError> {
        self.providers
            .perform_inventory(&self.settings, self.graph.clone())
            .await
            .map_err(|err| FatalDiscoveryError::from_provider("inventory", "inventory", &[], err))
    }

    /// Discover from the seed set and wait for every recursive task to
    /// quiesce, or for the first fatal failure.
    pub async fn run(&self, seeds: Tree) -> Result<(), FatalDiscoveryError> {
        self.spawn_discover(seeds, vec![]);
        loop {
            let notified = self.wake.notified();
            if let Some(fatal) = self.fatal.lock().take() {
                return Err(fatal);
            }
            if self.inflight.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Fire-and-forget recursion into a working set.
    fn spawn_discover(&self, tree: Tree, ancestors: Vec<String>) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        self.inflight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            engine.discover(tree, ancestors).await;
            if engine.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
                engine.wake.notify_one();
            }
        });
    }

    async fn discover(&self, tree: Tree, ancestors: Vec<String>) {
        if self.fatal.lock().is_some() {
            return;
        }
        let depth = ancestors.len();
        debug!(nodes = tree.len(), depth, "discovering nodes");

        // Phase 1: drop nodes whose mux is on a skip list.
        let mut refs: Vec<String> = tree.keys().cloned().collect();
        refs.sort();
        let mut connectable: Vec<(String, NodeHandle)> = Vec::new();
        for ref_ in refs {
            let handle = tree[&ref_].clone();
            let mux = handle.read().protocol_mux.clone();
            if self.catalog.skip_protocol_mux(&mux) {
                handle.write().errors.insert(NodeError::ConnectSkipped);
            } else {
                connectable.push((ref_, handle));
            }
        }

        // Phase 2: open connections. Timeouts are recoverable here.
        let opens = connectable
            .iter()
            .map(|(_, handle)| self.open_connection(handle));
        let results = join_all(opens).await;
        let mut survivors: Vec<(String, NodeHandle, Option<ProviderConnection>)> = Vec::new();
        for ((ref_, handle), result) in connectable.into_iter().zip(results) {
            match result {
                Ok(conn) => survivors.push((ref_, handle, conn)),
                Err(err) if err.is_timeout() => {
                    debug!(node = %ref_, "connection open timed out");
                    handle.write().errors.insert(NodeError::Timeout);
                }
                Err(err) => {
                    self.record_fatal(FatalDiscoveryError::from_provider(
                        "open_connection",
                        ref_,
                        &ancestors,
                        err,
                    ));
                    return;
                }
            }
        }

        // Phase 3: resolve service names.
        let lookups = survivors
            .iter()
            .map(|(_, handle, conn)| self.lookup_service_name(handle, conn.as_ref()));
        let mut resolved: Vec<Option<String>> = Vec::with_capacity(survivors.len());
        for ((ref_, _, _), result) in survivors.iter().zip(join_all(lookups).await) {
            match result {
                Ok(name) => resolved.push(name),
                Err(err) => {
                    self.record_fatal(FatalDiscoveryError::from_provider(
                        "name_lookup",
                        ref_.clone(),
                        &ancestors,
                        err,
                    ));
                    return;
                }
            }
        }
        for ((ref_, handle, _), name) in survivors.iter().zip(resolved) {
            self.assign_name(ref_, handle, name, &ancestors);
        }

        // Phase 4: sidecars, then engine-side alias resolution.
        let sidecars = survivors
            .iter()
            .map(|(_, handle, conn)| self.run_sidecar(handle, conn.as_ref()));
        for ((ref_, _, _), result) in survivors.iter().zip(join_all(sidecars).await) {
            if let Err(err) = result {
                self.record_fatal(FatalDiscoveryError::from_provider(
                    "sidecar",
                    ref_.clone(),
                    &ancestors,
                    err,
                ));
                return;
            }
        }
        self.resolve_pending_aliases().await;

        // Phase 5: depth guard.
        if depth >= self.settings.max_depth {
            debug!(depth, max_depth = self.settings.max_depth, "reached max depth");
            return;
        }

        // Phase 6: profileability.
        enum Verdict {
            Terminal,
            Skip,
            Profile,
        }
        let mut profileable: Vec<(String, NodeHandle, Option<ProviderConnection>)> = Vec::new();
        for (ref_, handle, conn) in survivors {
            let verdict = {
                let node = handle.read();
                if !node.errors.is_empty() {
                    Verdict::Terminal
                } else if self.is_profileable(&node, depth) {
                    Verdict::Profile
                } else {
                    Verdict::Skip
                }
            };
            match verdict {
                Verdict::Terminal => {}
                Verdict::Skip => {
                    handle.write().errors.insert(NodeError::ProfileSkipped);
                }
                Verdict::Profile => profileable.push((ref_, handle, conn)),
            }
        }

        // Phase 7: profile, record children, recurse.
        let profiles = profileable
            .iter()
            .map(|(_, handle, conn)| self.profile_with_hints(handle, conn.as_ref()));
        let results = join_all(profiles).await;
        for ((ref_, handle, _), result) in profileable.iter().zip(results) {
            match result {
                Ok(children) => self.record_children(ref_, handle, children, depth, &ancestors),
                Err(err) => {
                    let subject = handle
                        .read()
                        .service_name
                        .clone()
                        .unwrap_or_else(|| ref_.clone());
                    self.record_fatal(FatalDiscoveryError::from_provider(
                        "profile",
                        subject,
                        &ancestors,
                        err,
                    ));
                    return;
                }
            }
        }
    }

    async fn open_connection(
        &self,
        handle: &NodeHandle,
    ) -> Result<Option<ProviderConnection>, ProviderError> {
        let (address, provider_ref) = {
            let node = handle.read();
            (node.address.clone(), node.provider.clone())
        };
        let Some(address) = address else {
            return Ok(None);
        };
        if let Some(cached) = self.service_name_cache.get(&address) {
            match cached.value() {
                None => {
                    debug!(%address, "not opening connection: cached lookup failure");
                    return Ok(None);
                }
                Some(name) => {
                    if self.catalog.skip_service_name(name) {
                        debug!(%name, "not opening connection: skipped service");
                        return Ok(None);
                    }
                    if self.child_cache.contains_key(name) {
                        debug!(%name, "not opening connection: children cached");
                        return Ok(None);
                    }
                }
            }
        }
        let provider = self.provider(&provider_ref)?;
        debug!(%address, provider = %provider_ref, "opening connection");
        self.provider_call(&provider_ref, provider.open_connection(&address))
            .await
    }

    async fn lookup_service_name(
        &self,
        handle: &NodeHandle,
        conn: Option<&ProviderConnection>,
    ) -> Result<Option<String>, ProviderError> {
        let (address, provider_ref) = {
            let node = handle.read();
            (node.address.clone(), node.provider.clone())
        };
        let Some(address) = address else {
            return Ok(None);
        };
        if let Some(cached) = self.service_name_cache.get(&address) {
            debug!(%address, name = ?cached.value(), "using cached service name");
            return Ok(cached.value().clone());
        }
        let provider = self.provider(&provider_ref)?;
        let name = self
            .provider_call(&provider_ref, provider.lookup_name(&address, conn))
            .await?;
        if let Some(name) = &name {
            debug!(%address, %name, "discovered service name");
            self.service_name_cache
                .insert(address.clone(), Some(name.clone()));
        }
        Ok(name)
    }

    /// Rewrite, obfuscate, cycle-check and assign a resolved name.
    fn assign_name(
        &self,
        ref_: &str,
        handle: &NodeHandle,
        name: Option<String>,
        ancestors: &[String],
    ) {
        let Some(name) = name else {
            let address = handle.read().address.clone();
            if let Some(address) = address {
                self.service_name_cache.insert(address, None);
            }
            debug!(node = %ref_, "name lookup failed");
            handle.write().warnings.insert(NodeWarning::NameLookupFailed);
            return;
        };
        let rewritten = {
            let node = handle.read();
            self.catalog.rewrite_service_name(&name, &node)
        };
        let final_name = if self.settings.obfuscate {
            self.obfuscator.service_name(&rewritten)
        } else {
            rewritten
        };
        let mut node = handle.write();
        if ancestors.iter().any(|a| *a == final_name) {
            node.errors.insert(NodeError::Cycle);
        }
        if let Err(conflict) = node.assign_service_name(final_name) {
            warn!(node = %ref_, %conflict, "rejecting conflicting name resolution");
        }
    }

    async fn run_sidecar(
        &self,
        handle: &NodeHandle,
        conn: Option<&ProviderConnection>,
    ) -> Result<(), ProviderError> {
        let (address, provider_ref) = {
            let node = handle.read();
            (node.address.clone(), node.provider.clone())
        };
        let Some(address) = address else {
            return Ok(());
        };
        let provider = self.provider(&provider_ref)?;
        self.provider_call(&provider_ref, provider.sidecar(&address, conn))
            .await
    }

    /// Forward-resolve nodes the graph knows only by alias, memoized so each
    /// alias is attempted once per run. Resolution failures are ordinary.
    async fn resolve_pending_aliases(&self) {
        for (alias, node) in self.graph.pending_dns_lookup() {
            if self.dns_cache.contains_key(&alias) {
                continue;
            }
            let lookup = timeout(
                self.settings.timeout_duration(),
                tokio::net::lookup_host((alias.clone(), 0u16)),
            )
            .await;
            let address = match lookup {
                Ok(Ok(mut addrs)) => addrs.next().map(|sock| sock.ip().to_string()),
                _ => None,
            };
            if let Some(address) = &address {
                debug!(%alias, %address, "resolved pending alias");
                let mut updated = node.clone();
                updated.address = Some(address.clone());
                if let Err(err) = self.graph.save(&updated) {
                    warn!(%err, %alias, "failed to save alias resolution");
                }
            }
            self.dns_cache.insert(alias, address);
        }
    }

    fn is_profileable(&self, node: &Node, depth: usize) -> bool {
        let Some(name) = &node.service_name else {
            return false;
        };
        if self.catalog.skip_service_name(name) {
            return false;
        }
        if self.catalog.skip_protocol_mux(&node.protocol_mux) {
            return false;
        }
        if self.settings.skip_nonblocking_grandchildren && !node.protocol.blocking && depth >= 2 {
            return false;
        }
        true
    }

    fn is_excluded(&self, node: &Node, depth: usize) -> bool {
        if self.settings.disable_providers.contains(&node.provider) {
            return true;
        }
        self.settings.skip_nonblocking_grandchildren && !node.protocol.blocking && depth >= 2
    }

    /// Profile one node: run every applicable strategy plus its hints
    /// concurrently, then parse the results into child nodes. Results are
    /// cached per service name; later profiles of the same service get deep
    /// copies with empty children and cloned diagnostics.
    async fn profile_with_hints(
        &self,
        handle: &NodeHandle,
        conn: Option<&ProviderConnection>,
    ) -> Result<HashMap<String, Node>, ProviderError> {
        let (provider_ref, address, service_name) = {
            let node = handle.read();
            (
                node.provider.clone(),
                node.address.clone().unwrap_or_default(),
                node.service_name.clone().unwrap_or_default(),
            )
        };
        // One profile per service name at a time; losers of the race serve
        // the winner's cached children.
        let gate = self
            .profile_gates
            .entry(service_name.clone())
            .or_default()
            .clone();
        let _guard = gate.lock().await;

        if let Some(cached) = self.child_cache.get(&service_name) {
            debug!(service = %service_name, count = cached.len(), "serving children from cache");
            return Ok(cached
                .iter()
                .map(|(ref_, node)| {
                    (
                        ref_.clone(),
                        Node {
                            children: HashMap::new(),
                            ..node.clone()
                        },
                    )
                })
                .collect());
        }

        debug!(service = %service_name, "profiling");
        let provider = self.provider(&provider_ref)?;

        let mut planned: Vec<(ProfileStrategy, Option<Hint>)> = Vec::new();
        for strategy in
            self.strategies
                .applicable(&provider_ref, &service_name, &self.settings.skip_protocols)
        {
            planned.push((strategy.clone(), None));
        }
        for hint in self.catalog.hints(&service_name) {
            if self.settings.disable_providers.contains(&hint.instance_provider) {
                continue;
            }
            planned.push((hint_strategy(hint), Some(hint.clone())));
        }

        let calls = planned.iter().map(|(strategy, maybe_hint)| {
            let provider = provider.clone();
            let address = &address;
            let provider_ref = &provider_ref;
            async move {
                match maybe_hint {
                    None => {
                        self.provider_call(provider_ref, provider.profile(address, conn, strategy))
                            .await
                    }
                    Some(hint) => {
                        let hint_provider = self.provider(&hint.instance_provider)?;
                        self.provider_call(
                            &hint.instance_provider,
                            hint_provider.take_a_hint(hint),
                        )
                        .await
                    }
                }
            }
        });
        let results = join_all(calls).await;

        let mut children: HashMap<String, Node> = HashMap::new();
        for ((strategy, _), result) in planned.iter().zip(results) {
            for transport in result? {
                if self.catalog.skip_protocol_mux(&transport.protocol_mux) {
                    continue;
                }
                if let Some((child_ref, child)) = self.create_child(transport, strategy)? {
                    children.insert(child_ref, child);
                }
            }
        }
        debug!(service = %service_name, count = children.len(), "profiled children");
        self.child_cache.insert(service_name, children.clone());
        Ok(children)
    }

    /// Build a child node from a transport plus the strategy that produced
    /// it. The strategy's child-provider rule is authoritative for the
    /// child's provider and node type.
    fn create_child(
        &self,
        transport: NodeTransport,
        strategy: &ProfileStrategy,
    ) -> Result<Option<(String, Node)>, ProviderError> {
        let assignment = strategy
            .determine_child_provider(&transport.protocol_mux, transport.address.as_deref())
            .map_err(|err| ProviderError::failed(err.to_string()))?;

        let mut transport = transport;
        transport.provider = assignment.provider;
        transport.node_type = assignment.node_type;
        transport.from_hint = transport.from_hint || strategy.is_hint();
        if self.settings.obfuscate {
            transport.protocol_mux = self.obfuscator.protocol_mux(&transport.protocol_mux);
            if transport.from_hint {
                if let Some(id) = &transport.debug_identifier {
                    transport.debug_identifier = Some(self.obfuscator.service_name(id));
                }
            }
        }

        if self.settings.disable_providers.contains(&transport.provider) {
            info!(
                provider = %transport.provider,
                address = ?transport.address,
                "skipping child of disabled provider"
            );
            return Ok(None);
        }

        let child_provider = self.provider(&transport.provider)?;
        let node = Node::from_transport(&transport, child_provider.is_container_platform());
        Ok(Some((transport.node_ref(), node)))
    }

    /// Attach surviving children to the parent, persist the subgraph, stamp
    /// the parent and schedule recursion into addressed children.
    fn record_children(
        &self,
        parent_ref: &str,
        parent: &NodeHandle,
        children: HashMap<String, Node>,
        depth: usize,
        ancestors: &[String],
    ) {
        let child_depth = depth + 1;
        let mut kept = Tree::new();
        for (child_ref, child) in children {
            if self.is_excluded(&child, child_depth) {
                continue;
            }
            kept.insert(child_ref, child.into_handle());
        }

        let recurse: Tree = kept
            .iter()
            .filter(|(_, handle)| handle.read().address.is_some())
            .map(|(ref_, handle)| (ref_.clone(), handle.clone()))
            .collect();

        let parent_name = {
            let mut node = parent.write();
            node.children = kept;
            node.set_profile_timestamp();
            node.service_name.clone().unwrap_or_default()
        };
        self.persist(parent);
        debug!(parent = %parent_ref, children = recurse.len(), "recursing into children");

        if !recurse.is_empty() {
            let mut next_ancestors = ancestors.to_vec();
            next_ancestors.push(parent_name);
            self.spawn_discover(recurse, next_ancestors);
        }
    }

    /// Upsert the parent and its children into the graph store and connect
    /// the supported edges.
    fn persist(&self, parent: &NodeHandle) {
        let parent_node = parent.read().clone();
        if !parent_node.persistable() {
            return;
        }
        if let Err(err) = self.graph.save(&parent_node) {
            warn!(%err, parent = %parent_node.debug_id(), "failed to save node");
            return;
        }
        for handle in parent_node.children.values() {
            let child = handle.read().clone();
            if !child.persistable() {
                continue;
            }
            if let Err(err) = self.graph.save(&child) {
                warn!(%err, child = %child.debug_id(), "failed to save node");
                continue;
            }
            match self.graph.connect(&parent_node, &child) {
                Ok(_) => {}
                Err(GraphError::InvalidEdge { parent, child }) => {
                    debug!(%parent, %child, "unsupported edge pair, not connecting");
                }
                Err(err) => warn!(%err, "failed to connect nodes"),
            }
        }
    }

    fn provider(&self, ref_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(ref_id)
            .map_err(|err| ProviderError::failed(err.to_string()))
    }

    /// Wrap a provider call in the per-provider semaphore and the per-call
    /// timeout.
    async fn provider_call<T>(
        &self,
        provider_ref: &str,
        call: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let _permit = match self.providers.limiter(provider_ref) {
            Some(limiter) => Some(
                limiter
                    .acquire_owned()
                    .await
                    .map_err(|_| ProviderError::failed("provider semaphore closed"))?,
            ),
            None => None,
        };
        match timeout(self.settings.timeout_duration(), call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(format!(
                "call into provider {provider_ref} exceeded {}s",
                self.settings.timeout
            ))),
        }
    }

    fn record_fatal(&self, fatal: FatalDiscoveryError) {
        error!(%fatal, "fatal discovery failure");
        {
            let mut slot = self.fatal.lock();
            if slot.is_none() {
                *slot = Some(fatal);
            }
        }
        self.wake.notify_one();
    }
}
