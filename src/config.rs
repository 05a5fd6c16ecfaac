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

//! The declarative configuration surface consumed by
//! [`ListenerManager`][crate::manager::ListenerManager].
//!
//! A [`ListenerConfig`] is the unit the control plane pushes; everything in
//! it is plain data. Compilation into running state happens in
//! [`listener`][crate::listener] and [`matcher`][crate::matcher].

mod address;
pub mod tls;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::net::CidrRange;

pub use self::{
    address::{AddressParseError, ListenerAddress},
    tls::TlsContext,
};

/// Default `per_connection_buffer_limit_bytes`.
pub const DEFAULT_BUFFER_LIMIT_BYTES: u32 = 1024 * 1024;

/// Default `listener_filters_timeout`.
pub const DEFAULT_LISTENER_FILTERS_TIMEOUT: Duration = Duration::from_secs(15);

/// Default `tcp_backlog_size`.
pub const DEFAULT_TCP_BACKLOG_SIZE: u32 = 128;

/// One listener as declared by the control plane or a static config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Primary key for updates. Required for dynamic listeners; static
    /// listeners without one are admitted under a generated name.
    #[serde(default)]
    pub name: String,

    /// Bound address. Immutable across updates of the same name.
    pub address: ListenerAddress,

    #[serde(default)]
    pub socket_type: SocketType,

    /// When false no kernel socket is bound; the listener is virtual and
    /// shares an upstream socket.
    #[serde(default = "default_true")]
    pub bind_to_port: bool,

    #[serde(default = "default_buffer_limit")]
    pub per_connection_buffer_limit_bytes: u32,

    /// Bounds the per-connection accept filter chain. Zero disables the
    /// timeout entirely.
    #[serde(default = "default_listener_filters_timeout", with = "duration_ms")]
    pub listener_filters_timeout: Duration,

    #[serde(default)]
    pub continue_on_listener_filters_timeout: bool,

    #[serde(default)]
    pub transparent: bool,

    #[serde(default)]
    pub freebind: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_fast_open_queue_length: Option<u32>,

    #[serde(default = "default_tcp_backlog")]
    pub tcp_backlog_size: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub socket_options: Vec<SocketOptionConfig>,

    #[serde(default)]
    pub drain_type: DrainType,

    #[serde(default)]
    pub reverse_write_filter_order: bool,

    /// Opaque key/value map surfaced to filters.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Accept-time filters, run before a network filter chain is selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listener_filters: Vec<Filter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_chains: Vec<FilterChainConfig>,
}

impl ListenerConfig {
    /// A minimal stream listener on `address` with a single catch-all filter
    /// chain and every other field defaulted.
    pub fn minimal(name: impl Into<String>, address: ListenerAddress) -> Self {
        Self {
            name: name.into(),
            address,
            socket_type: SocketType::default(),
            bind_to_port: true,
            per_connection_buffer_limit_bytes: default_buffer_limit(),
            listener_filters_timeout: default_listener_filters_timeout(),
            continue_on_listener_filters_timeout: false,
            transparent: false,
            freebind: false,
            tcp_fast_open_queue_length: None,
            tcp_backlog_size: default_tcp_backlog(),
            socket_options: Vec::new(),
            drain_type: DrainType::default(),
            reverse_write_filter_order: false,
            metadata: serde_json::Map::new(),
            listener_filters: Vec::new(),
            filter_chains: vec![FilterChainConfig::default()],
        }
    }
}

/// Named filter instance plus its opaque configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Filter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Map<String, serde_json::Value>>")]
    pub config: Option<serde_json::Value>,
}

/// One declarative filter chain: a match predicate, optional TLS material,
/// and the network filters built for each matched connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterChainConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, rename = "match")]
    pub match_rules: FilterChainMatch,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_context: Option<TlsContext>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

/// The predicate selecting a filter chain. Every field is optional; unset
/// means wildcard. See [`FilterChainMatcher`][crate::matcher::FilterChainMatcher]
/// for the priority between criteria.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterChainMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,

    /// Match when any element contains the destination IP; longer prefixes
    /// beat shorter ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefix_ranges: Vec<CidrRange>,

    /// SNI names, exact (`example.com`) or leading-label wildcard
    /// (`*.example.com`). Partial wildcards are rejected at build time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_protocol: Option<String>,

    /// ALPN values; match when the intersection with the connection's
    /// protocols is non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_protocols: Vec<String>,

    #[serde(default)]
    pub source_type: SourceType,
}

impl FilterChainMatch {
    /// Whether every field is a wildcard.
    pub fn is_catch_all(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    #[default]
    Any,
    Local,
    External,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    #[default]
    Stream,
    Datagram,
}

/// Controls which drain events apply to a listener: `Default` listeners also
/// drain on server-wide drain (e.g. hot restart); `ModifyOnly` listeners
/// drain only when superseded or removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrainType {
    #[default]
    Default,
    ModifyOnly,
}

/// A raw socket option applied at a declared lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketOptionConfig {
    pub level: i32,
    pub name: i32,
    #[serde(flatten)]
    pub value: SocketOptionValue,
    #[serde(default)]
    pub state: SocketState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketOptionValue {
    IntValue(i64),
    BufValue(Vec<u8>),
}

/// The three well-defined points a socket option may be applied at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketState {
    /// After socket creation, before bind.
    #[default]
    Prebind,
    /// After bind, before listen.
    Bound,
    /// After listen.
    Listening,
}

fn default_true() -> bool {
    true
}

fn default_buffer_limit() -> u32 {
    DEFAULT_BUFFER_LIMIT_BYTES
}

fn default_listener_filters_timeout() -> Duration {
    DEFAULT_LISTENER_FILTERS_TIMEOUT
}

fn default_tcp_backlog() -> u32 {
    DEFAULT_TCP_BACKLOG_SIZE
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config: ListenerConfig = serde_yaml::from_str(
            r#"
name: foo
address: 127.0.0.1:1234
"#,
        )
        .unwrap();

        assert_eq!(config.per_connection_buffer_limit_bytes, 1024 * 1024);
        assert_eq!(config.listener_filters_timeout, Duration::from_secs(15));
        assert!(config.bind_to_port);
        assert_eq!(config.drain_type, DrainType::Default);
        assert_eq!(config.tcp_backlog_size, 128);
        assert!(!config.continue_on_listener_filters_timeout);
    }

    #[test]
    fn full_surface_round_trips() {
        let config: ListenerConfig = serde_yaml::from_str(
            r#"
name: foo
address: "[::1]:10000"
bind_to_port: false
per_connection_buffer_limit_bytes: 8192
listener_filters_timeout: 0
drain_type: MODIFY_ONLY
transparent: true
socket_options:
  - level: 1
    name: 9
    int_value: 1
    state: BOUND
listener_filters:
  - name: gangway.listener_filters.tls_inspector.v1alpha1.TlsInspector
filter_chains:
  - match:
      destination_port: 10000
      prefix_ranges: ["10.0.0.0/8"]
      server_names: ["example.com", "*.example.com"]
      transport_protocol: tls
      application_protocols: ["h2"]
      source_type: EXTERNAL
    filters:
      - name: test.filter
"#,
        )
        .unwrap();

        assert_eq!(config.listener_filters_timeout, Duration::ZERO);
        assert_eq!(config.drain_type, DrainType::ModifyOnly);
        assert_eq!(
            config.socket_options[0].value,
            SocketOptionValue::IntValue(1)
        );
        assert_eq!(config.socket_options[0].state, SocketState::Bound);

        let chain = &config.filter_chains[0];
        assert_eq!(chain.match_rules.destination_port, Some(10000));
        assert_eq!(chain.match_rules.source_type, SourceType::External);

        let json = serde_json::to_value(&config).unwrap();
        let reparsed: ListenerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn unknown_fields_rejected() {
        let result: Result<ListenerConfig, _> = serde_yaml::from_str(
            r#"
name: foo
address: 127.0.0.1:1234
no_such_field: true
"#,
        );
        assert!(result.is_err());
    }
}
