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

//! Worker threads from the manager's point of view.
//!
//! Every call is a message: it returns immediately and the worker invokes the
//! paired completion exactly once when done. Per-listener messages are
//! processed in the order they were sent.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::listener::Listener;

/// Completion callback for a worker message; invoked exactly once with the
/// outcome.
pub type WorkerCompletion = Box<dyn FnOnce(bool) + Send>;

/// Watchdog handle given to workers at start so a wedged event loop can be
/// detected. Registration-only in this crate.
pub trait GuardDog: Send + Sync {
    fn watch(&self, thread_name: &str);
}

/// A [`GuardDog`] that watches nothing.
#[derive(Debug, Default)]
pub struct NopGuardDog;

impl GuardDog for NopGuardDog {
    fn watch(&self, _thread_name: &str) {}
}

/// One worker thread's listener-management surface.
pub trait Worker: Send + Sync {
    /// Starts accepting on `listener`'s socket.
    fn add_listener(&self, listener: Arc<Listener>, completion: WorkerCompletion);

    /// Forgets `listener` entirely; only sent after its drain has completed.
    fn remove_listener(&self, listener: Arc<Listener>, completion: WorkerCompletion);

    /// Stops accepting new connections on `listener` while existing ones
    /// drain. No completion; the drain sequence provides the pacing.
    fn stop_listener(&self, listener: Arc<Listener>);

    /// Starts the worker's event loop.
    fn start(&self, guard_dog: &Arc<dyn GuardDog>);

    /// Stops the event loop. Idempotent.
    fn stop(&self);
}

enum Message {
    Add(Arc<Listener>, WorkerCompletion),
    Remove(Arc<Listener>, WorkerCompletion),
    Stop(Arc<Listener>),
    Shutdown,
}

/// A [`Worker`] backed by a tokio task. The task owns the worker's view of
/// its listeners; the handle only enqueues messages, so every trait method is
/// non-blocking and safe to call from the main thread.
pub struct EventLoopWorker {
    name: String,
    tx: mpsc::UnboundedSender<Message>,
    started: AtomicBool,
}

impl EventLoopWorker {
    /// Spawns the worker task on the current tokio runtime.
    pub fn spawn(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_event_loop(name.clone(), rx));
        Arc::new(Self {
            name,
            tx,
            started: AtomicBool::new(false),
        })
    }

    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            warn!(worker = %self.name, "worker event loop is gone");
        }
    }
}

impl Worker for EventLoopWorker {
    fn add_listener(&self, listener: Arc<Listener>, completion: WorkerCompletion) {
        self.send(Message::Add(listener, completion));
    }

    fn remove_listener(&self, listener: Arc<Listener>, completion: WorkerCompletion) {
        self.send(Message::Remove(listener, completion));
    }

    fn stop_listener(&self, listener: Arc<Listener>) {
        self.send(Message::Stop(listener));
    }

    fn start(&self, guard_dog: &Arc<dyn GuardDog>) {
        if !self.started.swap(true, Ordering::AcqRel) {
            guard_dog.watch(&self.name);
            debug!(worker = %self.name, "worker started");
        }
    }

    fn stop(&self) {
        self.send(Message::Shutdown);
    }
}

async fn run_event_loop(name: String, mut rx: mpsc::UnboundedReceiver<Message>) {
    // Listener identity is the Arc pointer, not the name: two versions of the
    // same name coexist while the old one drains.
    let mut listeners: Vec<(Arc<Listener>, bool)> = Vec::new();

    while let Some(message) = rx.recv().await {
        match message {
            Message::Add(listener, completion) => {
                debug!(worker = %name, listener = %listener.name(), "adding listener");
                listeners.push((listener, true));
                completion(true);
            }
            Message::Remove(listener, completion) => {
                debug!(worker = %name, listener = %listener.name(), "removing listener");
                listeners.retain(|(existing, _)| !Arc::ptr_eq(existing, &listener));
                completion(true);
            }
            Message::Stop(listener) => {
                debug!(worker = %name, listener = %listener.name(), "stopping listener");
                for (existing, accepting) in &mut listeners {
                    if Arc::ptr_eq(existing, &listener) {
                        *accepting = false;
                    }
                }
            }
            Message::Shutdown => break,
        }
    }

    debug!(worker = %name, "worker event loop finished");
}
