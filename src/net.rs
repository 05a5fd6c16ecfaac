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

//! Network level types shared by the matcher and the socket pipeline.

use std::{fmt, net::IpAddr, str::FromStr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::config::ListenerAddress;

/// A destination prefix of a [`FilterChainMatch`][crate::config::FilterChainMatch].
///
/// Parsed from CIDR notation (`10.0.0.0/8`); a bare IP is treated as a full
/// length prefix. The stored form is canonical (host bits cleared), so two
/// spellings of the same range compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CidrRange {
    network: IpNetwork,
}

impl CidrRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.network.contains(ip)
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.network, IpNetwork::V4(_))
    }
}

impl FromStr for CidrRange {
    type Err = CidrParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (addr, len) = match input.split_once('/') {
            Some((addr, len)) => {
                let len = len
                    .parse::<u8>()
                    .map_err(|_| CidrParseError(input.to_owned()))?;
                (addr, Some(len))
            }
            None => (input, None),
        };

        let ip = addr
            .parse::<IpAddr>()
            .map_err(|_| CidrParseError(input.to_owned()))?;
        let len = len.unwrap_or(match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        });

        let network = IpNetwork::new(ip, len).map_err(|_| CidrParseError(input.to_owned()))?;

        // Canonicalize so `1.2.3.4/8` and `1.0.0.0/8` are the same range.
        let network =
            IpNetwork::new(network.network(), len).map_err(|_| CidrParseError(input.to_owned()))?;

        Ok(Self { network })
    }
}

impl TryFrom<String> for CidrRange {
    type Error = CidrParseError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<CidrRange> for String {
    fn from(range: CidrRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network.network(), self.network.prefix())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("malformed IP address: {0}")]
pub struct CidrParseError(pub String);

/// Accessors for the connection metadata the filter chain matcher classifies
/// on. Accepted sockets implement this; so do the listener filter contexts
/// that populate it during the accept chain.
///
/// The matcher reads each accessor at most once, and only when some surviving
/// chain actually constrains that dimension, so implementations are free to
/// compute values lazily (or to count calls, which is how the contract is
/// tested).
pub trait ConnectionInfo {
    /// The destination (local) address of the accepted socket.
    fn destination_address(&self) -> ListenerAddress;

    /// The server name (SNI) requested during the handshake, if any.
    fn server_name(&self) -> Option<String>;

    /// The transport protocol detected on the wire, e.g. `"tls"` or
    /// `"raw_buffer"`.
    fn transport_protocol(&self) -> String;

    /// The application protocols (ALPN) offered by the client.
    fn application_protocols(&self) -> Vec<String>;

    /// The source (remote) address of the accepted socket.
    fn source_address(&self) -> ListenerAddress;
}

/// Whether `source` counts as a local peer of `destination_ip`.
///
/// Pipe peers are always local. IP peers are local when the source is a
/// loopback address or equals the destination address itself.
pub fn is_local_connection(source: &ListenerAddress, destination_ip: Option<IpAddr>) -> bool {
    match source {
        ListenerAddress::Pipe(_) => true,
        ListenerAddress::Socket(addr) => {
            addr.ip().is_loopback() || Some(addr.ip()) == destination_ip
        }
    }
}
