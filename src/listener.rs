/*
 * Copyright 2026 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The compiled, immutable form of one listener configuration.
//!
//! [`Listener::build`] runs the whole compilation pipeline eagerly: listener
//! filter factories (with TLS inspector auto-injection), filter chains with
//! their transport sockets, the match tree, the socket option set, and the
//! bound (or donated) socket. Everything on the resulting [`Listener`] is
//! read-only except the lifecycle state, which only the
//! [`ListenerManager`][crate::manager::ListenerManager] advances.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::SystemTime,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::{
        tls::LoadedTlsContext, DrainType, Filter as FilterConfig, FilterChainConfig,
        FilterChainMatch, ListenerAddress, ListenerConfig, SocketOptionConfig, SocketType,
    },
    drain::DrainManager,
    filters::{
        tls_inspector, CreateFilterArgs, FilterRegistry, ListenerFilter, NetworkFilterInstance,
    },
    manager::CreationError,
    matcher::FilterChainMatcher,
    net::ConnectionInfo,
    socket::{ListenSocket, OsSocketOps, SocketError, SocketOps},
    stats::Scope,
};

/// Produces the transport socket for connections of one filter chain. Real
/// implementations live outside this crate; the two stock ones only carry the
/// material and answer whether the transport is secure.
pub trait TransportSocketFactory: Send + Sync {
    fn implements_secure_transport(&self) -> bool;
}

/// Plaintext transport.
#[derive(Debug, Default)]
pub struct RawBufferSocketFactory;

impl TransportSocketFactory for RawBufferSocketFactory {
    fn implements_secure_transport(&self) -> bool {
        false
    }
}

/// TLS transport carrying the loaded certificate material.
#[derive(Debug)]
pub struct TlsSocketFactory {
    context: LoadedTlsContext,
}

impl TlsSocketFactory {
    pub fn new(context: LoadedTlsContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &LoadedTlsContext {
        &self.context
    }
}

impl TransportSocketFactory for TlsSocketFactory {
    fn implements_secure_transport(&self) -> bool {
        true
    }
}

/// A compiled filter chain: its predicate, transport socket, and network
/// filter instances.
pub struct FilterChain {
    name: Option<String>,
    match_rules: FilterChainMatch,
    transport_socket: Arc<dyn TransportSocketFactory>,
    tls: Option<LoadedTlsContext>,
    filters: Vec<(String, NetworkFilterInstance)>,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("name", &self.name)
            .field("match_rules", &self.match_rules)
            .field("tls", &self.tls)
            .field(
                "filters",
                &self.filters.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FilterChain {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn match_rules(&self) -> &FilterChainMatch {
        &self.match_rules
    }

    pub fn transport_socket(&self) -> &Arc<dyn TransportSocketFactory> {
        &self.transport_socket
    }

    /// The loaded TLS material, when the chain terminates TLS.
    pub fn tls(&self) -> Option<&LoadedTlsContext> {
        self.tls.as_ref()
    }

    pub fn filters(&self) -> &[(String, NetworkFilterInstance)] {
        &self.filters
    }

    /// A chain with the given predicate and no filters, for matcher tests.
    pub fn testing(match_rules: FilterChainMatch) -> Self {
        Self {
            name: None,
            match_rules,
            transport_socket: Arc::new(RawBufferSocketFactory),
            tls: None,
            filters: Vec::new(),
        }
    }
}

/// An asynchronous initializer a listener waits for before activating, e.g. a
/// dynamic route table a network filter depends on.
///
/// Cloning shares the target; [`InitTarget::ready`] is idempotent and
/// publishes readiness to at most one watcher, exactly once.
#[derive(Clone)]
pub struct InitTarget {
    inner: Arc<InitTargetState>,
}

struct InitTargetState {
    name: String,
    ready: AtomicBool,
    watcher: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl InitTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(InitTargetState {
                name: name.into(),
                ready: AtomicBool::new(false),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Signals completion. The first call fires the watcher, if any; further
    /// calls are no-ops.
    pub fn ready(&self) {
        if self.inner.ready.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher();
        }
    }

    fn watch(&self, watcher: Box<dyn FnOnce() + Send>) {
        if self.is_ready() {
            watcher();
        } else {
            *self.inner.watcher.lock() = Some(watcher);
        }
    }

    fn cancel_watch(&self) {
        self.inner.watcher.lock().take();
    }
}

/// Build context threaded through every filter factory while a listener is
/// being compiled. Factories use it to attach socket options to the listener
/// socket and to register init targets that keep the listener warming.
pub struct ListenerFactoryContext {
    pub(crate) socket_options: Vec<SocketOptionConfig>,
    pub(crate) init_targets: Vec<InitTarget>,
    scope: Scope,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl ListenerFactoryContext {
    pub(crate) fn new(scope: Scope, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            socket_options: Vec::new(),
            init_targets: Vec::new(),
            scope,
            metadata,
        }
    }

    /// Adds a socket option to the listener's socket; it is applied at its
    /// declared state alongside the listener's own options.
    pub fn add_listen_socket_option(&mut self, option: SocketOptionConfig) {
        self.socket_options.push(option);
    }

    /// Registers an asynchronous initializer. The listener stays warming
    /// until every registered target has signalled ready.
    pub fn add_init_target(&mut self, target: InitTarget) {
        self.init_targets.push(target);
    }

    /// The listener's stats scope (`listener.<sanitized_address>`).
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The listener's opaque metadata.
    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn for_testing() -> Self {
        Self::new(
            crate::stats::StatsStore::new().scope("listener.testing"),
            serde_json::Map::new(),
        )
    }
}

/// The seam between the manager and everything it builds. The production
/// implementation is [`DefaultListenerComponentFactory`]; tests substitute
/// recorders and failure injectors.
pub trait ListenerComponentFactory: Send + Sync {
    fn create_listener_filter_factories(
        &self,
        filters: &[FilterConfig],
        context: &mut ListenerFactoryContext,
    ) -> Result<Vec<(String, Arc<dyn ListenerFilter>)>, CreationError>;

    fn create_network_filter_factories(
        &self,
        filters: &[FilterConfig],
        context: &mut ListenerFactoryContext,
    ) -> Result<Vec<(String, NetworkFilterInstance)>, CreationError>;

    fn create_listen_socket(
        &self,
        address: &ListenerAddress,
        socket_type: SocketType,
        options: &[SocketOptionConfig],
        bind_to_port: bool,
        tcp_backlog_size: u32,
    ) -> Result<Arc<ListenSocket>, SocketError>;

    fn create_drain_manager(&self, drain_type: DrainType) -> Arc<dyn DrainManager>;

    /// Invoked when a fully built listener is destroyed, after any drain has
    /// completed and before the object is dropped.
    fn on_listener_destroyed(&self, _listener: &Listener) {}
}

/// Production [`ListenerComponentFactory`]: registry-backed filters, kernel
/// sockets, timer-backed drain managers.
pub struct DefaultListenerComponentFactory {
    socket_ops: Arc<dyn SocketOps>,
    server_drain: Arc<dyn crate::drain::DrainDecision>,
    drain_period: std::time::Duration,
}

impl Default for DefaultListenerComponentFactory {
    fn default() -> Self {
        Self {
            socket_ops: Arc::new(OsSocketOps),
            server_drain: Arc::new(crate::drain::NeverDrain),
            drain_period: crate::drain::DEFAULT_DRAIN_PERIOD,
        }
    }
}

impl DefaultListenerComponentFactory {
    pub fn new(
        socket_ops: Arc<dyn SocketOps>,
        server_drain: Arc<dyn crate::drain::DrainDecision>,
        drain_period: std::time::Duration,
    ) -> Self {
        Self {
            socket_ops,
            server_drain,
            drain_period,
        }
    }
}

impl ListenerComponentFactory for DefaultListenerComponentFactory {
    fn create_listener_filter_factories(
        &self,
        filters: &[FilterConfig],
        context: &mut ListenerFactoryContext,
    ) -> Result<Vec<(String, Arc<dyn ListenerFilter>)>, CreationError> {
        filters
            .iter()
            .map(|filter| {
                let instance = FilterRegistry::listener_filter(
                    &filter.name,
                    CreateFilterArgs {
                        config: filter.config.as_ref(),
                        context: &mut *context,
                    },
                )?;
                Ok((filter.name.clone(), instance))
            })
            .collect()
    }

    fn create_network_filter_factories(
        &self,
        filters: &[FilterConfig],
        context: &mut ListenerFactoryContext,
    ) -> Result<Vec<(String, NetworkFilterInstance)>, CreationError> {
        filters
            .iter()
            .map(|filter| {
                let instance = FilterRegistry::network_filter(
                    &filter.name,
                    CreateFilterArgs {
                        config: filter.config.as_ref(),
                        context: &mut *context,
                    },
                )?;
                Ok((filter.name.clone(), instance))
            })
            .collect()
    }

    fn create_listen_socket(
        &self,
        address: &ListenerAddress,
        socket_type: SocketType,
        options: &[SocketOptionConfig],
        bind_to_port: bool,
        tcp_backlog_size: u32,
    ) -> Result<Arc<ListenSocket>, SocketError> {
        ListenSocket::bind(
            address.clone(),
            socket_type,
            options,
            bind_to_port,
            tcp_backlog_size,
            &*self.socket_ops,
        )
    }

    fn create_drain_manager(&self, drain_type: DrainType) -> Arc<dyn DrainManager> {
        Arc::new(crate::drain::TimedDrainManager::new(
            drain_type,
            self.drain_period,
            self.server_drain.clone(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Warming,
    Active,
    Draining,
    Destroyed,
}

/// An immutable compiled listener. See the module docs for what "compiled"
/// covers.
pub struct Listener {
    name: String,
    config: ListenerConfig,
    version_info: Option<String>,
    last_updated: SystemTime,
    modifiable: bool,
    socket: Arc<ListenSocket>,
    filter_chains: Vec<Arc<FilterChain>>,
    matcher: FilterChainMatcher,
    listener_filters: Vec<(String, Arc<dyn ListenerFilter>)>,
    drain_manager: Arc<dyn DrainManager>,
    scope: Scope,
    state: Mutex<ListenerState>,
    init_targets: Vec<InitTarget>,
}

impl Listener {
    /// Runs the compilation pipeline. On error every partially built
    /// resource is released and nothing observable has changed.
    ///
    /// `donated_socket` carries the predecessor's socket across an update so
    /// the kernel accept queue survives; when absent a fresh socket is bound
    /// through the factory.
    pub(crate) fn build(
        config: ListenerConfig,
        version_info: Option<String>,
        modifiable: bool,
        factory: &dyn ListenerComponentFactory,
        stats: &crate::stats::StatsStore,
        donated_socket: Option<Arc<ListenSocket>>,
    ) -> Result<Arc<Self>, CreationError> {
        let address = config.address.clone();
        let scope = stats.scope(format!("listener.{}", address.stat_name()));
        let mut context = ListenerFactoryContext::new(scope.clone(), config.metadata.clone());

        let listener_filter_configs = with_injected_tls_inspector(&config);
        let listener_filters =
            factory.create_listener_filter_factories(&listener_filter_configs, &mut context)?;

        let mut filter_chains = Vec::with_capacity(config.filter_chains.len());
        for chain_config in &config.filter_chains {
            filter_chains.push(Arc::new(build_filter_chain(
                chain_config,
                factory,
                &mut context,
            )?));
        }

        let matcher = FilterChainMatcher::new(&filter_chains).map_err(|source| {
            CreationError::FilterChainRules {
                address: address.to_string(),
                source,
            }
        })?;

        let mut socket_options = crate::socket::well_known_options(&config)?;
        socket_options.extend(config.socket_options.iter().cloned());
        socket_options.extend(context.socket_options.drain(..));

        let socket = match donated_socket {
            Some(socket) => {
                debug!(name = %config.name, address = %address, "reusing predecessor socket");
                socket
            }
            None => factory.create_listen_socket(
                &address,
                config.socket_type,
                &socket_options,
                config.bind_to_port,
                config.tcp_backlog_size,
            )?,
        };

        let drain_manager = factory.create_drain_manager(config.drain_type);

        Ok(Arc::new(Self {
            name: config.name.clone(),
            version_info,
            last_updated: SystemTime::now(),
            modifiable,
            socket,
            filter_chains,
            matcher,
            listener_filters,
            drain_manager,
            scope,
            state: Mutex::new(ListenerState::Warming),
            init_targets: context.init_targets,
            config,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &ListenerAddress {
        &self.config.address
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn version_info(&self) -> Option<&str> {
        self.version_info.as_deref()
    }

    pub fn last_updated(&self) -> SystemTime {
        self.last_updated
    }

    /// Whether update and remove operations may touch this listener. False
    /// for listeners admitted from static configuration.
    pub fn modifiable(&self) -> bool {
        self.modifiable
    }

    pub fn bind_to_port(&self) -> bool {
        self.config.bind_to_port
    }

    pub fn drain_type(&self) -> DrainType {
        self.config.drain_type
    }

    pub fn per_connection_buffer_limit_bytes(&self) -> u32 {
        self.config.per_connection_buffer_limit_bytes
    }

    pub fn listener_filters_timeout(&self) -> std::time::Duration {
        self.config.listener_filters_timeout
    }

    pub fn reverse_write_filter_order(&self) -> bool {
        self.config.reverse_write_filter_order
    }

    pub fn socket(&self) -> &Arc<ListenSocket> {
        &self.socket
    }

    pub fn filter_chains(&self) -> &[Arc<FilterChain>] {
        &self.filter_chains
    }

    pub fn listener_filters(&self) -> &[(String, Arc<dyn ListenerFilter>)] {
        &self.listener_filters
    }

    /// The listener's stats scope, `listener.<sanitized_address>`.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ListenerState) {
        let mut current = self.state.lock();
        debug!(name = %self.name, from = ?*current, to = ?state, "listener state change");
        *current = state;
    }

    pub fn drain_manager(&self) -> &Arc<dyn DrainManager> {
        &self.drain_manager
    }

    /// The composite drain decision for this listener's connections.
    pub fn drain_close(&self) -> bool {
        self.drain_manager.drain_close()
    }

    /// Classifies an accepted socket into a filter chain.
    pub fn find_filter_chain(&self, info: &dyn ConnectionInfo) -> Option<Arc<FilterChain>> {
        self.matcher.find_filter_chain(info)
    }

    pub fn init_targets(&self) -> &[InitTarget] {
        &self.init_targets
    }

    pub fn pending_init_targets(&self) -> usize {
        self.init_targets.iter().filter(|t| !t.is_ready()).count()
    }

    /// Runs `on_ready` once every init target has completed; immediately when
    /// none are pending. Publishes readiness exactly once.
    pub(crate) fn watch_init(&self, on_ready: Box<dyn FnOnce() + Send>) {
        let pending: Vec<_> = self
            .init_targets
            .iter()
            .filter(|target| !target.is_ready())
            .cloned()
            .collect();

        if pending.is_empty() {
            on_ready();
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        let on_ready = Arc::new(Mutex::new(Some(on_ready)));

        for target in pending {
            let remaining = remaining.clone();
            let on_ready = on_ready.clone();
            target.watch(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(on_ready) = on_ready.lock().take() {
                        on_ready();
                    }
                }
            }));
        }
    }

    /// Tears the listener down: watchers are cancelled first so a late init
    /// completion cannot resurrect it, then the destruction hook fires.
    pub(crate) fn destroy(&self, factory: &dyn ListenerComponentFactory) {
        for target in &self.init_targets {
            target.cancel_watch();
        }
        self.set_state(ListenerState::Destroyed);
        debug!(name = %self.name, address = %self.config.address, "destroying listener");
        factory.on_listener_destroyed(self);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("address", &self.config.address)
            .field("version_info", &self.version_info)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Prepends the TLS inspector to the listener filters when some chain match
/// depends on handshake metadata and the config does not already carry one.
fn with_injected_tls_inspector(config: &ListenerConfig) -> Vec<FilterConfig> {
    let requires = crate::matcher::requires_tls_inspector(
        config.filter_chains.iter().map(|chain| &chain.match_rules),
    );
    let present = config
        .listener_filters
        .iter()
        .any(|filter| filter.name == tls_inspector::NAME);

    let mut filters = Vec::with_capacity(config.listener_filters.len() + 1);
    if requires && !present {
        debug!(name = %config.name, "injecting TLS inspector listener filter");
        filters.push(FilterConfig {
            name: tls_inspector::NAME.into(),
            label: None,
            config: None,
        });
    }
    filters.extend(config.listener_filters.iter().cloned());
    filters
}

fn build_filter_chain(
    chain_config: &FilterChainConfig,
    factory: &dyn ListenerComponentFactory,
    context: &mut ListenerFactoryContext,
) -> Result<FilterChain, CreationError> {
    let tls = chain_config
        .tls_context
        .as_ref()
        .map(|tls| tls.load())
        .transpose()?;

    let transport_socket: Arc<dyn TransportSocketFactory> = match &tls {
        Some(loaded) => Arc::new(TlsSocketFactory::new(loaded.clone())),
        None => Arc::new(RawBufferSocketFactory),
    };

    let filters = factory.create_network_filter_factories(&chain_config.filters, context)?;

    Ok(FilterChain {
        name: chain_config.name.clone(),
        match_rules: chain_config.match_rules.clone(),
        transport_socket,
        tls,
        filters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockComponentFactory;

    fn minimal_config() -> ListenerConfig {
        ListenerConfig::minimal("foo", "127.0.0.1:0".parse().unwrap())
    }

    fn build(config: ListenerConfig) -> Result<Arc<Listener>, CreationError> {
        let factory = MockComponentFactory::new();
        Listener::build(
            config,
            Some("v1".into()),
            true,
            &factory,
            &crate::stats::StatsStore::new(),
            None,
        )
    }

    #[test]
    fn compiles_minimal_listener() {
        let listener = build(minimal_config()).unwrap();

        assert_eq!(listener.name(), "foo");
        assert_eq!(listener.state(), ListenerState::Warming);
        assert_eq!(listener.filter_chains().len(), 1);
        assert!(listener.listener_filters().is_empty());
        assert_eq!(listener.pending_init_targets(), 0);
        assert_eq!(
            listener.per_connection_buffer_limit_bytes(),
            crate::config::DEFAULT_BUFFER_LIMIT_BYTES
        );
    }

    #[test]
    #[tracing_test::traced_test]
    fn injects_tls_inspector_for_sni_chains() {
        let mut config = minimal_config();
        config.filter_chains[0].match_rules.server_names = vec!["example.com".into()];

        let listener = build(config).unwrap();
        assert_eq!(listener.listener_filters().len(), 1);
        assert_eq!(listener.listener_filters()[0].0, tls_inspector::NAME);
        assert!(logs_contain("injecting TLS inspector"));
    }

    #[test]
    fn no_injection_for_non_tls_transport() {
        let mut config = minimal_config();
        config.filter_chains[0].match_rules.transport_protocol = Some("custom".into());

        let listener = build(config).unwrap();
        assert!(listener.listener_filters().is_empty());
    }

    #[test]
    fn no_double_injection() {
        let mut config = minimal_config();
        config.filter_chains[0].match_rules.server_names = vec!["example.com".into()];
        config.listener_filters.push(FilterConfig {
            name: tls_inspector::NAME.into(),
            label: None,
            config: None,
        });

        let listener = build(config).unwrap();
        assert_eq!(listener.listener_filters().len(), 1);
    }

    #[test]
    fn duplicate_chain_rules_fail_with_address() {
        let mut config = minimal_config();
        config.filter_chains.push(FilterChainConfig::default());

        let err = build(config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "error adding listener '127.0.0.1:0': multiple filter chains with the same matching rules are defined"
        );
    }

    #[test]
    fn init_targets_gate_readiness() {
        let target = InitTarget::new("route-config");
        let factory = MockComponentFactory::new().with_init_target(target.clone());

        let listener = Listener::build(
            minimal_config(),
            None,
            true,
            &factory,
            &crate::stats::StatsStore::new(),
            None,
        )
        .unwrap();

        assert_eq!(listener.pending_init_targets(), 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        listener.watch_init(Box::new(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        target.ready();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Idempotent.
        target.ready();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_cancels_init_watch() {
        let target = InitTarget::new("route-config");
        let factory = MockComponentFactory::new().with_init_target(target.clone());

        let listener = Listener::build(
            minimal_config(),
            None,
            true,
            &factory,
            &crate::stats::StatsStore::new(),
            None,
        )
        .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        listener.watch_init(Box::new(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        }));

        listener.destroy(&factory);
        assert_eq!(listener.state(), ListenerState::Destroyed);
        assert_eq!(factory.destroyed(), vec!["foo".to_owned()]);

        // A late ready() must not fire the cancelled watcher.
        target.ready();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
