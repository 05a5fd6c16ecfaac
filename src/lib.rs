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

//! Gangway keeps the accepting edge of an L4-L7 gateway in sync with a
//! declarative stream of listener configurations: it compiles each
//! configuration into an immutable [`Listener`], selects a filter chain for
//! every accepted connection, and coordinates warm-up, hot swap and drain
//! across the worker threads.

pub(crate) mod metrics;

pub mod config;
pub mod drain;
pub mod filters;
pub mod listener;
pub mod manager;
pub mod matcher;
pub mod net;
pub mod socket;
pub mod stats;
pub mod worker;

#[doc(hidden)]
pub mod test_utils;

pub type Result<T, E = manager::CreationError> = std::result::Result<T, E>;

#[doc(inline)]
pub use self::{
    config::ListenerConfig,
    listener::Listener,
    manager::{CreationError, ListenerManager},
    matcher::FilterChainMatcher,
};
