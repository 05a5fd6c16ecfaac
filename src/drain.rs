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

//! Drain coordination.
//!
//! Each listener owns a [`DrainManager`]; the manager starts its drain
//! sequence when the listener is superseded or removed and destroys the
//! listener once the sequence reports completion.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::debug;

use crate::config::DrainType;

/// Default time a draining listener keeps serving existing connections,
/// mirroring the server-wide drain period.
pub const DEFAULT_DRAIN_PERIOD: Duration = Duration::from_secs(600);

/// Callback invoked exactly once when a drain sequence finishes.
pub type DrainCompletion = Box<dyn FnOnce() + Send>;

/// A yes/no answer to "should connections be closed now?". The server-wide
/// drain controller implements this; so does every listener-local
/// [`DrainManager`].
pub trait DrainDecision: Send + Sync {
    fn drain_close(&self) -> bool;
}

/// Per-listener drain contract.
pub trait DrainManager: DrainDecision {
    /// Begins a time-bounded drain; `on_complete` fires exactly once.
    fn start_drain_sequence(&self, on_complete: DrainCompletion);

    /// Used only during whole-process hot restart. Never part of a normal
    /// listener lifecycle.
    fn start_parent_shutdown_sequence(&self);
}

/// A server-wide decision that never drains; the default when no hot restart
/// or shutdown coordinator is wired in.
#[derive(Debug, Default)]
pub struct NeverDrain;

impl DrainDecision for NeverDrain {
    fn drain_close(&self) -> bool {
        false
    }
}

/// [`DrainManager`] over a timer.
///
/// `drain_close` composes the listener-local state with the server-wide
/// decision, short-circuiting on the local side; `ModifyOnly` listeners never
/// consult the server-wide side at all.
pub struct TimedDrainManager {
    drain_type: DrainType,
    drain_period: Duration,
    server: Arc<dyn DrainDecision>,
    draining: AtomicBool,
    parent_shutdown: AtomicBool,
}

impl TimedDrainManager {
    pub fn new(
        drain_type: DrainType,
        drain_period: Duration,
        server: Arc<dyn DrainDecision>,
    ) -> Self {
        Self {
            drain_type,
            drain_period,
            server,
            draining: AtomicBool::new(false),
            parent_shutdown: AtomicBool::new(false),
        }
    }
}

impl DrainDecision for TimedDrainManager {
    fn drain_close(&self) -> bool {
        if self.draining.load(Ordering::Acquire) {
            return true;
        }
        if self.drain_type == DrainType::ModifyOnly {
            return false;
        }
        self.server.drain_close()
    }
}

impl DrainManager for TimedDrainManager {
    fn start_drain_sequence(&self, on_complete: DrainCompletion) {
        self.draining.store(true, Ordering::Release);
        let period = self.drain_period;
        debug!(period_secs = period.as_secs(), "starting drain sequence");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(period).await;
                    on_complete();
                });
            }
            // No runtime on this thread; a plain timer thread keeps the
            // sequence moving rather than wedging the state machine.
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(period);
                    on_complete();
                });
            }
        }
    }

    fn start_parent_shutdown_sequence(&self) {
        self.parent_shutdown.store(true, Ordering::Release);
        debug!("starting parent shutdown sequence");
    }
}
