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

//! Filter chain selection.
//!
//! [`FilterChainMatcher`] compiles the declarative predicates of a listener's
//! filter chains into a fixed-priority decision tree: destination port, then
//! destination IP (longest prefix), then server name (exact before wildcard
//! suffix), then transport protocol, then ALPN, then source type. Each level
//! commits to its most specific populated branch; there is no backtracking
//! across levels.
//!
//! Connection metadata is pulled through [`ConnectionInfo`] accessors, each
//! read at most once and only when the reached level actually constrains that
//! dimension, so a listener whose chains never mention SNI will never request
//! the server name.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use crate::{
    config::{FilterChainMatch, SourceType},
    listener::FilterChain,
    net::{is_local_connection, CidrRange, ConnectionInfo},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MatchBuildError {
    #[error("multiple filter chains with the same matching rules are defined")]
    DuplicateMatch,
    #[error("partial wildcards are not supported in \"server_names\"")]
    PartialWildcard,
}

/// The compiled decision tree for one listener.
#[derive(Debug)]
pub struct FilterChainMatcher {
    destination_ports: HashMap<u16, IpLevel>,
    any_port: Option<IpLevel>,
}

impl FilterChainMatcher {
    /// Compiles `chains` into a matcher, rejecting structurally duplicate
    /// predicates and malformed wildcard server names.
    pub fn new(chains: &[Arc<FilterChain>]) -> Result<Self, MatchBuildError> {
        let mut seen = std::collections::HashSet::new();
        let mut matcher = Self {
            destination_ports: HashMap::new(),
            any_port: None,
        };

        for chain in chains {
            let rules = chain.match_rules();
            validate_server_names(&rules.server_names)?;

            if !seen.insert(NormalizedMatch::from(rules)) {
                return Err(MatchBuildError::DuplicateMatch);
            }

            matcher.insert(rules, chain.clone());
        }

        for level in matcher
            .destination_ports
            .values_mut()
            .chain(matcher.any_port.as_mut())
        {
            level.sort();
        }

        Ok(matcher)
    }

    /// Selects the filter chain for an accepted socket, or `None` when no
    /// chain applies (the connection is then dropped once the accept chain
    /// completes).
    pub fn find_filter_chain(&self, info: &dyn ConnectionInfo) -> Option<Arc<FilterChain>> {
        let destination = info.destination_address();

        let ip_level = destination
            .port()
            .filter(|_| !self.destination_ports.is_empty())
            .and_then(|port| self.destination_ports.get(&port))
            .or(self.any_port.as_ref())?;

        let name_level = ip_level.find(destination.ip())?;
        let transport_level = name_level.find(info)?;
        let alpn_level = transport_level.find(info)?;
        let source_level = alpn_level.find(info)?;
        source_level.find(info, destination.ip())
    }

    fn insert(&mut self, rules: &FilterChainMatch, chain: Arc<FilterChain>) {
        let level = match rules.destination_port {
            Some(port) => self.destination_ports.entry(port).or_default(),
            None => self.any_port.get_or_insert_with(Default::default),
        };
        level.insert(rules, chain);
    }
}

#[derive(Debug, Default)]
struct IpLevel {
    ranges: Vec<(CidrRange, ServerNameLevel)>,
    any: Option<ServerNameLevel>,
}

impl IpLevel {
    fn insert(&mut self, rules: &FilterChainMatch, chain: Arc<FilterChain>) {
        if rules.prefix_ranges.is_empty() {
            self.any
                .get_or_insert_with(Default::default)
                .insert(rules, chain);
            return;
        }

        for range in &rules.prefix_ranges {
            match self.ranges.iter_mut().find(|(r, _)| r == range) {
                Some((_, level)) => level.insert(rules, chain.clone()),
                None => {
                    let mut level = ServerNameLevel::default();
                    level.insert(rules, chain.clone());
                    self.ranges.push((*range, level));
                }
            }
        }
    }

    /// Longest prefixes first, so lookup commits to the most specific range.
    fn sort(&mut self) {
        self.ranges
            .sort_by(|(a, _), (b, _)| b.prefix_len().cmp(&a.prefix_len()));
    }

    fn find(&self, ip: Option<IpAddr>) -> Option<&ServerNameLevel> {
        match ip {
            Some(ip) => self
                .ranges
                .iter()
                .find(|(range, _)| range.contains(ip))
                .map(|(_, level)| level)
                .or(self.any.as_ref()),
            // Pipe destinations only reach the wildcard arm.
            None => self.any.as_ref(),
        }
    }
}

#[derive(Debug, Default)]
struct ServerNameLevel {
    exact: HashMap<String, TransportLevel>,
    wildcard: HashMap<String, TransportLevel>,
    any: Option<TransportLevel>,
}

impl ServerNameLevel {
    fn insert(&mut self, rules: &FilterChainMatch, chain: Arc<FilterChain>) {
        if rules.server_names.is_empty() {
            self.any
                .get_or_insert_with(Default::default)
                .insert(rules, chain);
            return;
        }

        for name in &rules.server_names {
            let map = if name.starts_with("*.") {
                &mut self.wildcard
            } else {
                &mut self.exact
            };
            map.entry(name.to_lowercase())
                .or_default()
                .insert(rules, chain.clone());
        }
    }

    fn find(&self, info: &dyn ConnectionInfo) -> Option<&TransportLevel> {
        if self.exact.is_empty() && self.wildcard.is_empty() {
            return self.any.as_ref();
        }

        let Some(name) = info.server_name().filter(|name| !name.is_empty()) else {
            return self.any.as_ref();
        };
        let name = name.to_lowercase();

        if let Some(level) = self.exact.get(&name) {
            return Some(level);
        }

        // `www.example.com` tries `*.example.com`, then `*.com`; a bare
        // suffix never matches its own wildcard (`example.com` does not
        // match `*.example.com`).
        if !self.wildcard.is_empty() {
            let mut rest = name.as_str();
            while let Some(dot) = rest.find('.') {
                let suffix = &rest[dot..];
                if suffix.len() > 1 {
                    if let Some(level) = self.wildcard.get(&format!("*{suffix}")) {
                        return Some(level);
                    }
                }
                rest = &rest[dot + 1..];
            }
        }

        self.any.as_ref()
    }
}

#[derive(Debug, Default)]
struct TransportLevel {
    exact: HashMap<String, AlpnLevel>,
    any: Option<AlpnLevel>,
}

impl TransportLevel {
    fn insert(&mut self, rules: &FilterChainMatch, chain: Arc<FilterChain>) {
        match &rules.transport_protocol {
            Some(protocol) => self
                .exact
                .entry(protocol.clone())
                .or_default()
                .insert(rules, chain),
            None => self
                .any
                .get_or_insert_with(Default::default)
                .insert(rules, chain),
        }
    }

    fn find(&self, info: &dyn ConnectionInfo) -> Option<&AlpnLevel> {
        if self.exact.is_empty() {
            return self.any.as_ref();
        }

        self.exact
            .get(&info.transport_protocol())
            .or(self.any.as_ref())
    }
}

#[derive(Debug, Default)]
struct AlpnLevel {
    exact: HashMap<String, SourceLevel>,
    any: Option<SourceLevel>,
}

impl AlpnLevel {
    fn insert(&mut self, rules: &FilterChainMatch, chain: Arc<FilterChain>) {
        if rules.application_protocols.is_empty() {
            self.any
                .get_or_insert_with(Default::default)
                .insert(rules, chain);
            return;
        }

        for protocol in &rules.application_protocols {
            self.exact
                .entry(protocol.clone())
                .or_default()
                .insert(rules, chain.clone());
        }
    }

    fn find(&self, info: &dyn ConnectionInfo) -> Option<&SourceLevel> {
        if self.exact.is_empty() {
            return self.any.as_ref();
        }

        for protocol in info.application_protocols() {
            if let Some(level) = self.exact.get(&protocol) {
                return Some(level);
            }
        }

        self.any.as_ref()
    }
}

#[derive(Debug, Default)]
struct SourceLevel {
    local: Option<Arc<FilterChain>>,
    external: Option<Arc<FilterChain>>,
    any: Option<Arc<FilterChain>>,
}

impl SourceLevel {
    fn insert(&mut self, rules: &FilterChainMatch, chain: Arc<FilterChain>) {
        let slot = match rules.source_type {
            SourceType::Local => &mut self.local,
            SourceType::External => &mut self.external,
            SourceType::Any => &mut self.any,
        };
        *slot = Some(chain);
    }

    fn find(
        &self,
        info: &dyn ConnectionInfo,
        destination_ip: Option<IpAddr>,
    ) -> Option<Arc<FilterChain>> {
        if self.local.is_none() && self.external.is_none() {
            return self.any.clone();
        }

        let source = info.source_address();
        let slot = if is_local_connection(&source, destination_ip) {
            &self.local
        } else {
            &self.external
        };

        slot.as_ref().or(self.any.as_ref()).cloned()
    }
}

/// Whether the listener needs the TLS inspector injected: some chain
/// constrains SNI, ALPN, or requires the TLS transport. A chain pinning a
/// non-TLS transport protocol does not qualify.
pub(crate) fn requires_tls_inspector<'a>(
    rules: impl IntoIterator<Item = &'a FilterChainMatch>,
) -> bool {
    rules.into_iter().any(|rules| {
        !rules.server_names.is_empty()
            || !rules.application_protocols.is_empty()
            || rules.transport_protocol.as_deref() == Some("tls")
    })
}

fn validate_server_names(names: &[String]) -> Result<(), MatchBuildError> {
    for name in names {
        if name.contains('*') && !(name.len() > 2 && name.starts_with("*.")) {
            return Err(MatchBuildError::PartialWildcard);
        }
        if name.starts_with("*.") && name[2..].contains('*') {
            return Err(MatchBuildError::PartialWildcard);
        }
    }
    Ok(())
}

/// Order-insensitive form of a predicate, used for duplicate detection.
#[derive(PartialEq, Eq, Hash)]
struct NormalizedMatch {
    destination_port: Option<u16>,
    prefix_ranges: Vec<String>,
    server_names: Vec<String>,
    transport_protocol: Option<String>,
    application_protocols: Vec<String>,
    source_type: SourceType,
}

impl From<&FilterChainMatch> for NormalizedMatch {
    fn from(rules: &FilterChainMatch) -> Self {
        let mut prefix_ranges: Vec<_> =
            rules.prefix_ranges.iter().map(CidrRange::to_string).collect();
        prefix_ranges.sort();
        prefix_ranges.dedup();

        let mut server_names: Vec<_> =
            rules.server_names.iter().map(|s| s.to_lowercase()).collect();
        server_names.sort();
        server_names.dedup();

        let mut application_protocols = rules.application_protocols.clone();
        application_protocols.sort();
        application_protocols.dedup();

        Self {
            destination_port: rules.destination_port,
            prefix_ranges,
            server_names,
            transport_protocol: rules.transport_protocol.clone(),
            application_protocols,
            source_type: rules.source_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FilterChainMatch,
        test_utils::{ConnectionFixture, MockConnection},
    };

    fn chain(rules: FilterChainMatch) -> Arc<FilterChain> {
        Arc::new(FilterChain::testing(rules))
    }

    fn compile(rules: impl IntoIterator<Item = FilterChainMatch>) -> FilterChainMatcher {
        let chains: Vec<_> = rules.into_iter().map(chain).collect();
        FilterChainMatcher::new(&chains).unwrap()
    }

    fn rules(f: impl FnOnce(&mut FilterChainMatch)) -> FilterChainMatch {
        let mut rules = FilterChainMatch::default();
        f(&mut rules);
        rules
    }

    #[test]
    fn catch_all_matches_everything() {
        let matcher = compile([FilterChainMatch::default()]);
        let conn = MockConnection::new(ConnectionFixture::default());
        assert!(matcher.find_filter_chain(&conn).is_some());
    }

    #[test]
    fn destination_port_beats_wildcard() {
        let specific = chain(rules(|r| r.destination_port = Some(8080)));
        let fallback = chain(FilterChainMatch::default());
        let matcher = FilterChainMatcher::new(&[specific.clone(), fallback.clone()]).unwrap();

        let conn = MockConnection::new(ConnectionFixture {
            destination: "127.0.0.1:8080".parse().unwrap(),
            ..Default::default()
        });
        let found = matcher.find_filter_chain(&conn).unwrap();
        assert!(Arc::ptr_eq(&found, &specific));

        let conn = MockConnection::new(ConnectionFixture {
            destination: "127.0.0.1:9090".parse().unwrap(),
            ..Default::default()
        });
        let found = matcher.find_filter_chain(&conn).unwrap();
        assert!(Arc::ptr_eq(&found, &fallback));
    }

    #[test]
    fn port_match_commits_without_backtracking() {
        // The specific-port subtree requires SNI `a.com`; a connection on
        // that port with a different SNI must not fall back to the wildcard
        // port entry.
        let specific = chain(rules(|r| {
            r.destination_port = Some(8080);
            r.server_names = vec!["a.com".into()];
        }));
        let fallback = chain(FilterChainMatch::default());
        let matcher = FilterChainMatcher::new(&[specific, fallback]).unwrap();

        let conn = MockConnection::new(ConnectionFixture {
            destination: "127.0.0.1:8080".parse().unwrap(),
            server_name: Some("b.com".into()),
            ..Default::default()
        });
        assert!(matcher.find_filter_chain(&conn).is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let wide = chain(rules(|r| r.prefix_ranges = vec!["10.0.0.0/8".parse().unwrap()]));
        let narrow = chain(rules(|r| r.prefix_ranges = vec!["10.1.0.0/16".parse().unwrap()]));
        let matcher = FilterChainMatcher::new(&[wide.clone(), narrow.clone()]).unwrap();

        let conn = MockConnection::new(ConnectionFixture {
            destination: "10.1.2.3:443".parse().unwrap(),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &narrow));

        let conn = MockConnection::new(ConnectionFixture {
            destination: "10.200.0.1:443".parse().unwrap(),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &wide));
    }

    #[test]
    fn sni_exact_beats_wildcard_beats_absent() {
        let exact = chain(rules(|r| r.server_names = vec!["www.example.com".into()]));
        let wildcard = chain(rules(|r| r.server_names = vec!["*.example.com".into()]));
        let any = chain(FilterChainMatch::default());
        let matcher =
            FilterChainMatcher::new(&[exact.clone(), wildcard.clone(), any.clone()]).unwrap();

        let lookup = |name: &str| {
            let conn = MockConnection::new(ConnectionFixture {
                server_name: Some(name.into()),
                ..Default::default()
            });
            matcher.find_filter_chain(&conn).unwrap()
        };

        assert!(Arc::ptr_eq(&lookup("www.example.com"), &exact));
        assert!(Arc::ptr_eq(&lookup("api.example.com"), &wildcard));
        // A bare domain does not match its own wildcard.
        assert!(Arc::ptr_eq(&lookup("example.com"), &any));
        assert!(Arc::ptr_eq(&lookup("other.test"), &any));
    }

    #[test]
    fn deep_subdomain_matches_wildcard_suffix() {
        let wildcard = chain(rules(|r| r.server_names = vec!["*.example.com".into()]));
        let matcher = FilterChainMatcher::new(&[wildcard.clone()]).unwrap();

        let conn = MockConnection::new(ConnectionFixture {
            server_name: Some("a.b.example.com".into()),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &wildcard));
    }

    #[test]
    fn transport_protocol_exact_beats_absent() {
        let tls = chain(rules(|r| r.transport_protocol = Some("tls".into())));
        let any = chain(FilterChainMatch::default());
        let matcher = FilterChainMatcher::new(&[tls.clone(), any.clone()]).unwrap();

        let conn = MockConnection::new(ConnectionFixture::default().with_transport("tls"));
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &tls));

        let conn = MockConnection::new(ConnectionFixture::default().with_transport("raw_buffer"));
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &any));
    }

    #[test]
    fn alpn_intersection() {
        let h2 = chain(rules(|r| {
            r.application_protocols = vec!["h2".into(), "http/1.1".into()]
        }));
        let any = chain(FilterChainMatch::default());
        let matcher = FilterChainMatcher::new(&[h2.clone(), any.clone()]).unwrap();

        let conn = MockConnection::new(ConnectionFixture {
            application_protocols: vec!["http/1.1".into()],
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &h2));

        let conn = MockConnection::new(ConnectionFixture {
            application_protocols: vec!["spdy".into()],
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &any));
    }

    #[test]
    fn source_type_classification() {
        let local = chain(rules(|r| r.source_type = crate::config::SourceType::Local));
        let external = chain(rules(|r| {
            r.source_type = crate::config::SourceType::External;
            r.application_protocols = vec!["http/1.1".into()];
        }));
        let any = chain(FilterChainMatch::default());
        let matcher =
            FilterChainMatcher::new(&[local.clone(), external.clone(), any.clone()]).unwrap();

        // Loopback source, no ALPN: the LOCAL chain.
        let conn = MockConnection::new(ConnectionFixture {
            source: "127.0.0.1:52000".parse().unwrap(),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &local));

        // External source offering http/1.1: the EXTERNAL+ALPN chain.
        let conn = MockConnection::new(ConnectionFixture {
            source: "8.8.8.8:52000".parse().unwrap(),
            application_protocols: vec!["h2".into(), "http/1.1".into()],
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &external));

        // External source, no ALPN: the catch-all.
        let conn = MockConnection::new(ConnectionFixture {
            source: "8.8.8.8:52000".parse().unwrap(),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &any));
    }

    #[test]
    fn pipe_destination_uses_wildcard_arms_only() {
        let port_bound = chain(rules(|r| r.destination_port = Some(8080)));
        let any = chain(FilterChainMatch::default());
        let matcher = FilterChainMatcher::new(&[port_bound, any.clone()]).unwrap();

        let conn = MockConnection::new(ConnectionFixture {
            destination: "/tmp/test.sock".parse().unwrap(),
            source: "/tmp/peer.sock".parse().unwrap(),
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&matcher.find_filter_chain(&conn).unwrap(), &any));
    }

    #[test]
    fn no_match_drops() {
        let matcher = compile([rules(|r| r.destination_port = Some(4443))]);
        let conn = MockConnection::new(ConnectionFixture {
            destination: "127.0.0.1:9999".parse().unwrap(),
            ..Default::default()
        });
        assert!(matcher.find_filter_chain(&conn).is_none());
    }

    #[test]
    fn duplicate_rules_rejected() {
        let a = chain(rules(|r| {
            r.server_names = vec!["a.com".into(), "b.com".into()];
        }));
        // Same predicate up to ordering.
        let b = chain(rules(|r| {
            r.server_names = vec!["b.com".into(), "a.com".into()];
        }));

        let err = FilterChainMatcher::new(&[a, b]).unwrap_err();
        assert_eq!(err, MatchBuildError::DuplicateMatch);
        assert_eq!(
            err.to_string(),
            "multiple filter chains with the same matching rules are defined"
        );
    }

    #[test]
    fn partial_wildcards_rejected() {
        for name in ["*w.example.com", "w*.example.com", "*", "*.", "*.exa*.com"] {
            let c = chain(rules(|r| r.server_names = vec![name.into()]));
            assert_eq!(
                FilterChainMatcher::new(&[c]).unwrap_err(),
                MatchBuildError::PartialWildcard,
                "{name} should be rejected",
            );
        }

        let err = FilterChainMatcher::new(&[chain(rules(|r| {
            r.server_names = vec!["*w.example.com".into()]
        }))])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "partial wildcards are not supported in \"server_names\""
        );
    }

    #[test]
    fn accessors_read_lazily_and_at_most_once() {
        // No chain constrains SNI/transport/ALPN/source, so none of those
        // accessors may be touched.
        let matcher = compile([FilterChainMatch::default()]);
        let conn = MockConnection::new(ConnectionFixture::default());
        matcher.find_filter_chain(&conn).unwrap();

        assert_eq!(conn.server_name_calls(), 0);
        assert_eq!(conn.transport_protocol_calls(), 0);
        assert_eq!(conn.application_protocol_calls(), 0);
        assert_eq!(conn.source_address_calls(), 0);

        // With an SNI-constrained chain the server name is read exactly once
        // and everything downstream of the match is still untouched.
        let matcher = compile([
            rules(|r| r.server_names = vec!["example.com".into()]),
            FilterChainMatch::default(),
        ]);
        let conn = MockConnection::new(ConnectionFixture {
            server_name: Some("example.com".into()),
            ..Default::default()
        });
        matcher.find_filter_chain(&conn).unwrap();

        assert_eq!(conn.server_name_calls(), 1);
        assert_eq!(conn.transport_protocol_calls(), 0);
        assert_eq!(conn.source_address_calls(), 0);
    }

    #[test]
    fn tls_inspector_requirement() {
        let sni = rules(|r| r.server_names = vec!["e.com".into()]);
        assert!(requires_tls_inspector([&sni]));

        let tls = rules(|r| r.transport_protocol = Some("tls".into()));
        assert!(requires_tls_inspector([&tls]));

        let custom = rules(|r| r.transport_protocol = Some("custom".into()));
        assert!(!requires_tls_inspector([&custom]));

        let plain = FilterChainMatch::default();
        assert!(!requires_tls_inspector([&plain]));
    }
}
