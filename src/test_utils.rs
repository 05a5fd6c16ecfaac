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

//! Common utilities for testing: mock workers, drain managers, component
//! factories, and a call-counting connection for matcher contracts.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Once,
};

use parking_lot::Mutex;

use crate::{
    config::{DrainType, Filter as FilterConfig, ListenerAddress, SocketOptionConfig, SocketState,
        SocketOptionValue, SocketType},
    drain::{DrainCompletion, DrainDecision, DrainManager},
    filters::{
        AcceptContext, CreateFilterArgs, CreationError, FilterRegistry, FilterStatus,
        ListenerFilter, ListenerFilterFactory, NetworkFilter, NetworkFilterFactory,
        NetworkFilterInstance,
    },
    listener::{InitTarget, Listener, ListenerComponentFactory, ListenerFactoryContext},
    net::ConnectionInfo,
    socket::{ListenSocket, SocketError, SocketOps},
    worker::{GuardDog, Worker, WorkerCompletion},
};

/// Name of the network filter registered by [`load_test_filters`]. Accepts
/// any configuration.
pub const TEST_FILTER_NAME: &str = "test.filter";

/// Name of the listener filter registered by [`load_test_filters`]. Its
/// configuration is a socket option it contributes to the listener socket.
pub const TEST_OPTION_FILTER_NAME: &str = "test.option_filter";

/// Registers the test filters with the global registry. Idempotent.
pub fn load_test_filters() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        FilterRegistry::register_network_filters([
            Box::new(TestFilterFactory) as crate::filters::DynNetworkFilterFactory
        ]);
        FilterRegistry::register_listener_filters([
            Box::new(TestOptionFilterFactory) as crate::filters::DynListenerFilterFactory,
        ]);
    });
}

struct NoopNetworkFilter;

impl NetworkFilter for NoopNetworkFilter {}

struct TestFilterFactory;

impl NetworkFilterFactory for TestFilterFactory {
    fn name(&self) -> &'static str {
        TEST_FILTER_NAME
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(serde_json::Value)
    }

    fn create_filter(
        &self,
        args: CreateFilterArgs<'_>,
    ) -> Result<NetworkFilterInstance, CreationError> {
        Ok(NetworkFilterInstance::new(
            args.config.cloned().unwrap_or(serde_json::Value::Null),
            Arc::new(NoopNetworkFilter),
        ))
    }
}

struct NoopListenerFilter;

impl ListenerFilter for NoopListenerFilter {
    fn on_accept(&self, _ctx: &mut AcceptContext) -> FilterStatus {
        FilterStatus::Continue
    }
}

struct TestOptionFilterFactory;

impl ListenerFilterFactory for TestOptionFilterFactory {
    fn name(&self) -> &'static str {
        TEST_OPTION_FILTER_NAME
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(serde_json::Value)
    }

    fn create_filter(
        &self,
        args: CreateFilterArgs<'_>,
    ) -> Result<Arc<dyn ListenerFilter>, CreationError> {
        let option: SocketOptionConfig = args.require_config(TEST_OPTION_FILTER_NAME)?;
        args.context.add_listen_socket_option(option);
        Ok(Arc::new(NoopListenerFilter))
    }
}

/// Connection metadata handed to [`MockConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionFixture {
    pub destination: ListenerAddress,
    pub source: ListenerAddress,
    pub server_name: Option<String>,
    pub transport_protocol: String,
    pub application_protocols: Vec<String>,
}

impl Default for ConnectionFixture {
    fn default() -> Self {
        Self {
            destination: "127.0.0.1:1234".parse().unwrap(),
            source: "127.0.0.1:52000".parse().unwrap(),
            server_name: None,
            transport_protocol: "raw_buffer".into(),
            application_protocols: Vec::new(),
        }
    }
}

impl ConnectionFixture {
    pub fn with_transport(mut self, transport: &str) -> Self {
        self.transport_protocol = transport.into();
        self
    }
}

/// [`ConnectionInfo`] that counts every accessor call, for verifying the
/// matcher's read-at-most-once / read-only-when-needed contract.
pub struct MockConnection {
    fixture: ConnectionFixture,
    destination_calls: AtomicUsize,
    server_name_calls: AtomicUsize,
    transport_calls: AtomicUsize,
    application_calls: AtomicUsize,
    source_calls: AtomicUsize,
}

impl MockConnection {
    pub fn new(fixture: ConnectionFixture) -> Self {
        Self {
            fixture,
            destination_calls: AtomicUsize::new(0),
            server_name_calls: AtomicUsize::new(0),
            transport_calls: AtomicUsize::new(0),
            application_calls: AtomicUsize::new(0),
            source_calls: AtomicUsize::new(0),
        }
    }

    pub fn destination_calls(&self) -> usize {
        self.destination_calls.load(Ordering::SeqCst)
    }

    pub fn server_name_calls(&self) -> usize {
        self.server_name_calls.load(Ordering::SeqCst)
    }

    pub fn transport_protocol_calls(&self) -> usize {
        self.transport_calls.load(Ordering::SeqCst)
    }

    pub fn application_protocol_calls(&self) -> usize {
        self.application_calls.load(Ordering::SeqCst)
    }

    pub fn source_address_calls(&self) -> usize {
        self.source_calls.load(Ordering::SeqCst)
    }
}

impl ConnectionInfo for MockConnection {
    fn destination_address(&self) -> ListenerAddress {
        self.destination_calls.fetch_add(1, Ordering::SeqCst);
        self.fixture.destination.clone()
    }

    fn server_name(&self) -> Option<String> {
        self.server_name_calls.fetch_add(1, Ordering::SeqCst);
        self.fixture.server_name.clone()
    }

    fn transport_protocol(&self) -> String {
        self.transport_calls.fetch_add(1, Ordering::SeqCst);
        self.fixture.transport_protocol.clone()
    }

    fn application_protocols(&self) -> Vec<String> {
        self.application_calls.fetch_add(1, Ordering::SeqCst);
        self.fixture.application_protocols.clone()
    }

    fn source_address(&self) -> ListenerAddress {
        self.source_calls.fetch_add(1, Ordering::SeqCst);
        self.fixture.source.clone()
    }
}

/// [`SocketOps`] that records `(name, state)` pairs in application order and
/// can be told to fail a specific option.
#[derive(Debug, Default)]
pub struct RecordingSocketOps {
    applied: Mutex<Vec<(i32, SocketState)>>,
    fail_name: Option<i32>,
}

impl RecordingSocketOps {
    /// An ops recorder whose application of option `name` fails.
    pub fn failing_on(name: i32) -> Self {
        Self {
            applied: Mutex::default(),
            fail_name: Some(name),
        }
    }

    pub fn applied(&self) -> Vec<(i32, SocketState)> {
        self.applied.lock().clone()
    }
}

impl SocketOps for RecordingSocketOps {
    fn set_option(
        &self,
        _socket: &ListenSocket,
        _level: i32,
        name: i32,
        _value: &SocketOptionValue,
        state: SocketState,
    ) -> std::io::Result<()> {
        if self.fail_name == Some(name) {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        }
        self.applied.lock().push((name, state));
        Ok(())
    }
}

/// [`DrainManager`] under manual control: the drain completion fires only
/// when the test calls [`MockDrainManager::complete`].
pub struct MockDrainManager {
    drain_type: DrainType,
    draining: AtomicBool,
    completion: Mutex<Option<DrainCompletion>>,
    drain_sequences: AtomicUsize,
    parent_shutdowns: AtomicUsize,
}

impl MockDrainManager {
    pub fn new(drain_type: DrainType) -> Self {
        Self {
            drain_type,
            draining: AtomicBool::new(false),
            completion: Mutex::new(None),
            drain_sequences: AtomicUsize::new(0),
            parent_shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn drain_type(&self) -> DrainType {
        self.drain_type
    }

    /// Fires the pending drain completion, if a sequence was started.
    pub fn complete(&self) {
        if let Some(completion) = self.completion.lock().take() {
            completion();
        }
    }

    pub fn drain_sequences(&self) -> usize {
        self.drain_sequences.load(Ordering::SeqCst)
    }

    pub fn parent_shutdowns(&self) -> usize {
        self.parent_shutdowns.load(Ordering::SeqCst)
    }
}

impl DrainDecision for MockDrainManager {
    fn drain_close(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

impl DrainManager for MockDrainManager {
    fn start_drain_sequence(&self, on_complete: DrainCompletion) {
        self.drain_sequences.fetch_add(1, Ordering::SeqCst);
        self.draining.store(true, Ordering::SeqCst);
        *self.completion.lock() = Some(on_complete);
    }

    fn start_parent_shutdown_sequence(&self) {
        self.parent_shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a [`MockWorker`] observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Add(String),
    Remove(String),
    Stop(String),
}

/// How a [`MockWorker`] answers completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge success synchronously.
    Auto,
    /// Fail every `add_listener` synchronously.
    FailAdds,
    /// Park completions until [`MockWorker::ack_pending`].
    Manual,
}

/// An in-process [`Worker`] recording every message.
#[derive(Clone)]
pub struct MockWorker {
    inner: Arc<MockWorkerInner>,
}

struct MockWorkerInner {
    events: Mutex<Vec<WorkerEvent>>,
    pending: Mutex<Vec<WorkerCompletion>>,
    mode: Mutex<AckMode>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MockWorker {
    pub fn new() -> Self {
        Self::with_mode(AckMode::Auto)
    }

    pub fn with_mode(mode: AckMode) -> Self {
        Self {
            inner: Arc::new(MockWorkerInner {
                events: Mutex::new(Vec::new()),
                pending: Mutex::new(Vec::new()),
                mode: Mutex::new(mode),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_mode(&self, mode: AckMode) {
        *self.inner.mode.lock() = mode;
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.inner.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.inner.events.lock().clear();
    }

    /// Fires every parked completion with `success`.
    pub fn ack_pending(&self, success: bool) {
        let pending: Vec<_> = self.inner.pending.lock().drain(..).collect();
        for completion in pending {
            completion(success);
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn dispatch(&self, completion: WorkerCompletion, is_add: bool) {
        let mode = *self.inner.mode.lock();
        match mode {
            AckMode::Auto => completion(true),
            AckMode::FailAdds if is_add => completion(false),
            AckMode::FailAdds => completion(true),
            AckMode::Manual => self.inner.pending.lock().push(completion),
        }
    }
}

impl Default for MockWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for MockWorker {
    fn add_listener(&self, listener: Arc<Listener>, completion: WorkerCompletion) {
        self.inner
            .events
            .lock()
            .push(WorkerEvent::Add(listener.name().to_owned()));
        self.dispatch(completion, true);
    }

    fn remove_listener(&self, listener: Arc<Listener>, completion: WorkerCompletion) {
        self.inner
            .events
            .lock()
            .push(WorkerEvent::Remove(listener.name().to_owned()));
        self.dispatch(completion, false);
    }

    fn stop_listener(&self, listener: Arc<Listener>) {
        self.inner
            .events
            .lock()
            .push(WorkerEvent::Stop(listener.name().to_owned()));
    }

    fn start(&self, _guard_dog: &Arc<dyn GuardDog>) {
        self.inner.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

/// [`ListenerComponentFactory`] for tests: real registry-backed filters,
/// virtual sockets configured through a [`RecordingSocketOps`], manual drain
/// managers, and a destruction log.
pub struct MockComponentFactory {
    socket_ops: Arc<RecordingSocketOps>,
    init_targets: Mutex<Vec<InitTarget>>,
    drain_managers: Mutex<Vec<Arc<MockDrainManager>>>,
    destroyed: Mutex<Vec<String>>,
}

impl MockComponentFactory {
    pub fn new() -> Self {
        load_test_filters();
        Self {
            socket_ops: Arc::new(RecordingSocketOps::default()),
            init_targets: Mutex::new(Vec::new()),
            drain_managers: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// A factory whose application of socket option `name` fails.
    pub fn failing_socket_option(name: i32) -> Self {
        load_test_filters();
        Self {
            socket_ops: Arc::new(RecordingSocketOps::failing_on(name)),
            init_targets: Mutex::new(Vec::new()),
            drain_managers: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// Registers `target` on the next listener built through this factory.
    pub fn with_init_target(self, target: InitTarget) -> Self {
        self.push_init_target(target);
        self
    }

    /// Same as [`Self::with_init_target`], for factories already shared.
    pub fn push_init_target(&self, target: InitTarget) {
        self.init_targets.lock().push(target);
    }

    pub fn socket_ops(&self) -> &RecordingSocketOps {
        &self.socket_ops
    }

    /// Names of destroyed listeners, in destruction order.
    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().clone()
    }

    /// Drain managers created so far, in creation order.
    pub fn drain_managers(&self) -> Vec<Arc<MockDrainManager>> {
        self.drain_managers.lock().clone()
    }
}

impl Default for MockComponentFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerComponentFactory for MockComponentFactory {
    fn create_listener_filter_factories(
        &self,
        filters: &[FilterConfig],
        context: &mut ListenerFactoryContext,
    ) -> Result<Vec<(String, Arc<dyn ListenerFilter>)>, crate::manager::CreationError> {
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
    ) -> Result<Vec<(String, NetworkFilterInstance)>, crate::manager::CreationError> {
        for target in self.init_targets.lock().drain(..) {
            context.add_init_target(target);
        }

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
        _bind_to_port: bool,
        _tcp_backlog_size: u32,
    ) -> Result<Arc<ListenSocket>, SocketError> {
        let socket = ListenSocket::virtual_socket(address.clone(), socket_type);
        socket.apply_options(options, SocketState::Prebind, &*self.socket_ops)?;
        socket.apply_options(options, SocketState::Bound, &*self.socket_ops)?;
        if socket_type == SocketType::Stream {
            socket.apply_options(options, SocketState::Listening, &*self.socket_ops)?;
        }
        Ok(socket)
    }

    fn create_drain_manager(&self, drain_type: DrainType) -> Arc<dyn DrainManager> {
        let manager = Arc::new(MockDrainManager::new(drain_type));
        self.drain_managers.lock().push(manager.clone());
        manager
    }

    fn on_listener_destroyed(&self, listener: &Listener) {
        self.destroyed.lock().push(listener.name().to_owned());
    }
}
