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

//! The listener orchestrator.
//!
//! [`ListenerManager`] owns the warming, active and draining sets, admits
//! configuration pushes, swaps listener versions without dropping the kernel
//! accept queue, and walks each retired version through stop → drain →
//! remove → destroy across the workers.
//!
//! All bookkeeping happens under one mutex and worker dispatch happens after
//! it is released; workers answer through completion callbacks that re-enter
//! via a cloned handle. Cloning the manager is shallow.

use std::{
    sync::Arc,
    time::SystemTime,
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::{tls::TlsError, ListenerConfig},
    listener::{Listener, ListenerComponentFactory, ListenerState},
    matcher::MatchBuildError,
    socket::SocketError,
    stats::{Counter, Gauge, StatsStore},
    worker::{GuardDog, Worker},
};

/// Why `add_or_update_listener` rejected a configuration. Message strings are
/// part of the public contract.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error("error adding listener: a name is required for dynamic listeners")]
    MissingName,
    #[error("error updating listener: '{name}' has a different address '{address}' from existing listener")]
    AddressMismatch { name: String, address: String },
    #[error("error adding listener: '{name}' has duplicate address '{address}' as existing listener")]
    DuplicateAddress { name: String, address: String },
    #[error("error adding listener '{address}': {source}")]
    FilterChainRules {
        address: String,
        source: MatchBuildError,
    },
    #[error(transparent)]
    Filter(#[from] crate::filters::CreationError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

struct DrainingEntry {
    listener: Arc<Listener>,
    drain_start: SystemTime,
    pending_removals: usize,
}

#[derive(Default)]
struct ManagerState {
    warming: Vec<Arc<Listener>>,
    active: Vec<Arc<Listener>>,
    draining: Vec<DrainingEntry>,
    workers_started: bool,
    workers_stopped: bool,
    lds_version: String,
}

impl ManagerState {
    fn find(listeners: &[Arc<Listener>], name: &str) -> Option<usize> {
        listeners.iter().position(|l| l.name() == name)
    }
}

struct ManagerStats {
    added: Counter,
    modified: Counter,
    removed: Counter,
    create_failure: Counter,
    warming: Gauge,
    active: Gauge,
    draining: Gauge,
}

impl ManagerStats {
    fn new(store: &StatsStore) -> Self {
        let scope = store.scope("listener_manager");
        Self {
            added: scope.counter("listener_added"),
            modified: scope.counter("listener_modified"),
            removed: scope.counter("listener_removed"),
            create_failure: scope.counter("listener_create_failure"),
            warming: scope.gauge("total_listeners_warming"),
            active: scope.gauge("total_listeners_active"),
            draining: scope.gauge("total_listeners_draining"),
        }
    }

    fn update_gauges(&self, state: &ManagerState) {
        self.warming.set(state.warming.len() as u64);
        self.active.set(state.active.len() as u64);
        self.draining.set(state.draining.len() as u64);
    }
}

struct ManagerInner {
    factory: Arc<dyn ListenerComponentFactory>,
    workers: Vec<Arc<dyn Worker>>,
    store: StatsStore,
    stats: ManagerStats,
    state: Mutex<ManagerState>,
}

/// See the module docs. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ListenerManager {
    inner: Arc<ManagerInner>,
}

impl ListenerManager {
    pub fn new(
        factory: Arc<dyn ListenerComponentFactory>,
        workers: Vec<Arc<dyn Worker>>,
        store: StatsStore,
    ) -> Self {
        let stats = ManagerStats::new(&store);
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                workers,
                store,
                stats,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// The stats store backing `listener_manager.*` and every per-listener
    /// scope.
    pub fn stats(&self) -> &StatsStore {
        &self.inner.store
    }

    /// Listeners currently accepting or about to (active ∪ warming).
    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        let state = self.inner.state.lock();
        state
            .active
            .iter()
            .chain(state.warming.iter())
            .cloned()
            .collect()
    }

    /// Records the most recent version pushed by the config source; surfaced
    /// as the top-level `version_info` of the config dump.
    pub fn set_lds_version(&self, version: impl Into<String>) {
        self.inner.state.lock().lds_version = version.into();
    }

    /// Admits a configuration push.
    ///
    /// Returns `Ok(true)` when a new listener version was admitted,
    /// `Ok(false)` for an exact duplicate of the current version or when the
    /// existing listener is not modifiable. Hard errors leave every set, every
    /// counter and the pre-existing listener untouched.
    pub fn add_or_update_listener(
        &self,
        mut config: ListenerConfig,
        version_info: &str,
        modifiable: bool,
    ) -> crate::Result<bool> {
        if config.name.is_empty() {
            if modifiable {
                return Err(CreationError::MissingName);
            }
            config.name = format!("listener-{:016x}", rand::random::<u64>());
        }
        let name = config.name.clone();

        enum Dispatch {
            None,
            WatchInit(Arc<Listener>),
            Activate(Arc<Listener>),
        }

        let dispatch;
        {
            let mut state = self.inner.state.lock();

            let existing = ManagerState::find(&state.warming, &name)
                .map(|i| state.warming[i].clone())
                .or_else(|| {
                    ManagerState::find(&state.active, &name).map(|i| state.active[i].clone())
                });

            if let Some(existing) = &existing {
                if !existing.modifiable() {
                    debug!(%name, "ignoring update to non-modifiable listener");
                    return Ok(false);
                }
                if *existing.config() == config {
                    debug!(%name, "ignoring duplicate listener configuration");
                    return Ok(false);
                }
                if *existing.address() != config.address {
                    return Err(CreationError::AddressMismatch {
                        name,
                        address: config.address.to_string(),
                    });
                }
            }

            let address_taken = state
                .warming
                .iter()
                .chain(state.active.iter())
                .any(|l| l.name() != name && *l.address() == config.address);
            if address_taken {
                return Err(CreationError::DuplicateAddress {
                    name,
                    address: config.address.to_string(),
                });
            }

            // Socket donation: prefer the same-named predecessor, else a
            // draining listener still holding the same binding tuple.
            let donated = existing
                .as_ref()
                .filter(|l| l.bind_to_port() == config.bind_to_port)
                .map(|l| l.socket().clone())
                .or_else(|| {
                    state
                        .draining
                        .iter()
                        .find(|entry| {
                            *entry.listener.address() == config.address
                                && entry.listener.bind_to_port() == config.bind_to_port
                        })
                        .map(|entry| entry.listener.socket().clone())
                });

            let listener = Listener::build(
                config,
                modifiable.then(|| version_info.to_owned()),
                modifiable,
                &*self.inner.factory,
                &self.inner.store,
                donated,
            )?;

            if existing.is_some() {
                self.inner.stats.modified.inc();
            } else {
                self.inner.stats.added.inc();
            }

            // A warming predecessor dies on the spot; its init subscription
            // is cancelled during destruction.
            if let Some(pos) = ManagerState::find(&state.warming, &name) {
                let superseded = state.warming.remove(pos);
                debug!(%name, "destroying superseded warming listener");
                superseded.destroy(&*self.inner.factory);
            }

            if !state.workers_started {
                listener.set_state(ListenerState::Active);
                match ManagerState::find(&state.active, &name) {
                    Some(pos) => {
                        let superseded = std::mem::replace(&mut state.active[pos], listener);
                        superseded.destroy(&*self.inner.factory);
                    }
                    None => state.active.push(listener),
                }
                dispatch = Dispatch::None;
            } else if listener.pending_init_targets() > 0
                || ManagerState::find(&state.active, &name).is_some()
            {
                debug!(%name, pending = listener.pending_init_targets(), "listener warming");
                state.warming.push(listener.clone());
                dispatch = Dispatch::WatchInit(listener);
            } else {
                listener.set_state(ListenerState::Active);
                state.active.push(listener.clone());
                dispatch = Dispatch::Activate(listener);
            }

            self.inner.stats.update_gauges(&state);
        }

        match dispatch {
            Dispatch::None => {}
            Dispatch::WatchInit(listener) => {
                let manager = self.clone();
                let warmed = listener.clone();
                listener.watch_init(Box::new(move || manager.on_listener_warmed(warmed)));
            }
            Dispatch::Activate(listener) => self.add_listener_to_workers(listener),
        }

        Ok(true)
    }

    /// Removes a listener by name.
    ///
    /// Warming versions are destroyed immediately; the active version drains
    /// first and is removed from the workers when the drain completes.
    /// Returns false for unknown names and non-modifiable listeners.
    pub fn remove_listener(&self, name: &str) -> bool {
        let to_drain;
        {
            let mut state = self.inner.state.lock();

            let warming_pos = ManagerState::find(&state.warming, name);
            let active_pos = ManagerState::find(&state.active, name);
            if warming_pos.is_none() && active_pos.is_none() {
                return false;
            }

            let modifiable = warming_pos
                .map(|i| state.warming[i].modifiable())
                .into_iter()
                .chain(active_pos.map(|i| state.active[i].modifiable()))
                .all(|m| m);
            if !modifiable {
                debug!(%name, "ignoring removal of non-modifiable listener");
                return false;
            }

            self.inner.stats.removed.inc();

            if let Some(pos) = warming_pos {
                let warming = state.warming.remove(pos);
                debug!(%name, "destroying warming listener on removal");
                warming.destroy(&*self.inner.factory);
            }

            to_drain = active_pos.map(|pos| state.active.remove(pos));

            self.inner.stats.update_gauges(&state);
        }

        if let Some(listener) = to_drain {
            self.drain_listener(listener);
        }

        true
    }

    /// Starts every worker and publishes the currently active listeners to
    /// them. Must be called exactly once.
    pub fn start_workers(&self, guard_dog: Arc<dyn GuardDog>) {
        let active;
        {
            let mut state = self.inner.state.lock();
            assert!(!state.workers_started, "start_workers called twice");
            state.workers_started = true;
            active = state.active.clone();
        }

        for worker in &self.inner.workers {
            for listener in &active {
                let manager = self.clone();
                let failed = listener.clone();
                worker.add_listener(
                    listener.clone(),
                    Box::new(move |success| {
                        if !success {
                            manager.on_worker_add_failure(failed);
                        }
                    }),
                );
            }
            worker.start(&guard_dog);
        }
    }

    /// Stops accepting everywhere and shuts the workers down. A no-op when
    /// workers were never started; idempotent afterwards.
    pub fn stop_workers(&self) {
        let active;
        {
            let mut state = self.inner.state.lock();
            if !state.workers_started || state.workers_stopped {
                return;
            }
            state.workers_stopped = true;
            active = state.active.clone();
        }

        for worker in &self.inner.workers {
            for listener in &active {
                worker.stop_listener(listener.clone());
            }
            worker.stop();
        }
    }

    /// Snapshots the four config-dump buckets.
    pub fn config_dump(&self) -> ConfigDump {
        let state = self.inner.state.lock();

        let dynamic = |listener: &Arc<Listener>| DynamicListenerDump {
            version_info: listener.version_info().unwrap_or_default().to_owned(),
            listener: listener.config().clone(),
            last_updated: listener.last_updated().into(),
        };

        ConfigDump {
            version_info: state.lds_version.clone(),
            static_listeners: state
                .active
                .iter()
                .chain(state.warming.iter())
                .filter(|l| !l.modifiable())
                .map(|listener| StaticListenerDump {
                    listener: listener.config().clone(),
                    last_updated: listener.last_updated().into(),
                })
                .collect(),
            dynamic_active_listeners: state
                .active
                .iter()
                .filter(|l| l.modifiable())
                .map(dynamic)
                .collect(),
            dynamic_warming_listeners: state
                .warming
                .iter()
                .filter(|l| l.modifiable())
                .map(dynamic)
                .collect(),
            dynamic_draining_listeners: state
                .draining
                .iter()
                .map(|entry| dynamic(&entry.listener))
                .collect(),
        }
    }

    /// A warming listener has finished its init targets.
    fn on_listener_warmed(&self, listener: Arc<Listener>) {
        let predecessor;
        {
            let mut state = self.inner.state.lock();

            // The listener may have been superseded or removed while warming.
            let Some(pos) = state
                .warming
                .iter()
                .position(|l| Arc::ptr_eq(l, &listener))
            else {
                return;
            };
            state.warming.remove(pos);

            listener.set_state(ListenerState::Active);
            match ManagerState::find(&state.active, listener.name()) {
                Some(pos) => {
                    predecessor =
                        Some(std::mem::replace(&mut state.active[pos], listener.clone()));
                }
                None => {
                    predecessor = None;
                    state.active.push(listener.clone());
                }
            }

            self.inner.stats.update_gauges(&state);
        }

        // The predecessor's stop is issued before the successor is published
        // to any worker, so no worker ever accepts for both.
        if let Some(predecessor) = predecessor {
            debug!(
                name = %predecessor.name(),
                "draining superseded listener"
            );
            self.drain_listener(predecessor);
        }

        self.add_listener_to_workers(listener);
    }

    fn add_listener_to_workers(&self, listener: Arc<Listener>) {
        for worker in &self.inner.workers {
            let manager = self.clone();
            let failed = listener.clone();
            worker.add_listener(
                listener.clone(),
                Box::new(move |success| {
                    if !success {
                        manager.on_worker_add_failure(failed);
                    }
                }),
            );
        }
    }

    /// A worker rejected a listener: count it and retire this version through
    /// the normal drain path.
    fn on_worker_add_failure(&self, listener: Arc<Listener>) {
        warn!(name = %listener.name(), "worker failed to add listener");
        self.inner.stats.create_failure.inc();

        {
            let mut state = self.inner.state.lock();
            let Some(pos) = state
                .active
                .iter()
                .position(|l| Arc::ptr_eq(l, &listener))
            else {
                // Another worker's failure already retired it.
                return;
            };
            state.active.remove(pos);
            self.inner.stats.update_gauges(&state);
        }

        self.drain_listener(listener);
    }

    /// stop on every worker → drain sequence → remove on every worker →
    /// destroy once all removals ack.
    fn drain_listener(&self, listener: Arc<Listener>) {
        listener.set_state(ListenerState::Draining);
        debug!(name = %listener.name(), address = %listener.address(), "draining listener");

        {
            let mut state = self.inner.state.lock();
            state.draining.push(DrainingEntry {
                listener: listener.clone(),
                drain_start: SystemTime::now(),
                pending_removals: self.inner.workers.len(),
            });
            self.inner.stats.update_gauges(&state);
        }

        for worker in &self.inner.workers {
            worker.stop_listener(listener.clone());
        }

        let manager = self.clone();
        let drained = listener.clone();
        listener
            .drain_manager()
            .start_drain_sequence(Box::new(move || manager.on_drain_complete(drained)));
    }

    fn on_drain_complete(&self, listener: Arc<Listener>) {
        debug!(name = %listener.name(), "drain complete, removing listener");

        if self.inner.workers.is_empty() {
            self.finalize_removal(&listener);
            return;
        }

        for worker in &self.inner.workers {
            let manager = self.clone();
            let removed = listener.clone();
            worker.remove_listener(
                listener.clone(),
                Box::new(move |success| {
                    if !success {
                        // Progress over precision: an unreachable worker
                        // counts as removed.
                        warn!(name = %removed.name(), "worker failed to ack listener removal");
                    }
                    manager.on_worker_removed(removed);
                }),
            );
        }
    }

    fn on_worker_removed(&self, listener: Arc<Listener>) {
        {
            let mut state = self.inner.state.lock();
            let Some(pos) = state
                .draining
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.listener, &listener))
            else {
                return;
            };

            state.draining[pos].pending_removals =
                state.draining[pos].pending_removals.saturating_sub(1);
            if state.draining[pos].pending_removals > 0 {
                return;
            }

            let entry = state.draining.remove(pos);
            if let Ok(elapsed) = entry.drain_start.elapsed() {
                debug!(
                    name = %listener.name(),
                    drain_secs = elapsed.as_secs(),
                    "listener removal complete"
                );
            }
            self.inner.stats.update_gauges(&state);
        }

        self.finalize_removal(&listener);
    }

    fn finalize_removal(&self, listener: &Arc<Listener>) {
        {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state
                .draining
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.listener, listener))
            {
                state.draining.remove(pos);
                self.inner.stats.update_gauges(&state);
            }
        }
        listener.destroy(&*self.inner.factory);
    }
}

/// Wall-clock timestamp as seconds + nanos, the shape config dumps carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimestampDump {
    pub seconds: u64,
    pub nanos: u32,
}

impl From<SystemTime> for TimestampDump {
    fn from(time: SystemTime) -> Self {
        let since_epoch = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StaticListenerDump {
    pub listener: ListenerConfig,
    pub last_updated: TimestampDump,
}

#[derive(Debug, Serialize)]
pub struct DynamicListenerDump {
    pub version_info: String,
    pub listener: ListenerConfig,
    pub last_updated: TimestampDump,
}

/// The four config-dump buckets plus the top-level config-source version.
#[derive(Debug, Serialize)]
pub struct ConfigDump {
    pub version_info: String,
    pub static_listeners: Vec<StaticListenerDump>,
    pub dynamic_active_listeners: Vec<DynamicListenerDump>,
    pub dynamic_warming_listeners: Vec<DynamicListenerDump>,
    pub dynamic_draining_listeners: Vec<DynamicListenerDump>,
}
