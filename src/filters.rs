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

//! Filters attached to listeners.
//!
//! Two kinds exist: *listener filters* run at accept time, before a network
//! filter chain has been selected (the TLS inspector is the canonical one),
//! and *network filters* form the per-connection processing chain selected by
//! the [`FilterChainMatcher`][crate::matcher::FilterChainMatcher].

mod error;
mod factory;
mod registry;
mod set;

pub mod tls_inspector;

/// Prelude containing all types and traits required to implement a filter and
/// its factory.
pub mod prelude {
    pub use super::{
        AcceptContext, CreateFilterArgs, CreationError, DynListenerFilterFactory,
        DynNetworkFilterFactory, FilterStatus, ListenerFilter, ListenerFilterFactory,
        NetworkFilter, NetworkFilterFactory, NetworkFilterInstance,
    };
    pub use crate::listener::ListenerFactoryContext;
}

pub use self::{
    error::CreationError,
    factory::{
        CreateFilterArgs, DynListenerFilterFactory, DynNetworkFilterFactory,
        ListenerFilterFactory, NetworkFilterFactory, NetworkFilterInstance,
    },
    registry::FilterRegistry,
    set::{FactoryName, FilterMap, FilterSet},
};

/// Outcome of one listener filter's `on_accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Hand the connection to the next filter in the accept chain.
    Continue,
    /// Park the connection until this filter signals completion (e.g. more
    /// prelude bytes are needed).
    StopIteration,
}

/// Mutable connection metadata threaded through the accept filter chain.
///
/// Listener filters populate it; once the chain completes it backs the
/// [`ConnectionInfo`][crate::net::ConnectionInfo] view the matcher reads.
#[derive(Debug, Default)]
pub struct AcceptContext {
    /// Bytes peeked from the socket without consuming them.
    pub prelude: Vec<u8>,
    /// Requested SNI, once a filter has detected it.
    pub server_name: Option<String>,
    /// Detected transport protocol, e.g. `"tls"` or `"raw_buffer"`.
    pub transport_protocol: Option<String>,
    /// ALPN protocols offered by the client.
    pub application_protocols: Vec<String>,
}

/// An accept-time filter. Runs before filter chain selection.
pub trait ListenerFilter: Send + Sync {
    fn on_accept(&self, ctx: &mut AcceptContext) -> FilterStatus;
}

/// A per-connection processor. Instances are shared across the connections of
/// the chain they belong to, so implementations keep per-connection state out
/// of `self`.
pub trait NetworkFilter: Send + Sync {
    /// Invoked when a connection has been dispatched to this filter's chain.
    fn on_new_connection(&self) -> FilterStatus {
        FilterStatus::Continue
    }
}
