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

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// The bound endpoint of a listener: an IP socket address or a unix pipe.
///
/// The address is the immutable part of a listener's identity; an update to a
/// named listener may change anything except this. The serialized form is the
/// display string; pipe addresses are distinguished by their leading `/` (or
/// `@` for abstract sockets).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ListenerAddress {
    Socket(SocketAddr),
    Pipe(PathBuf),
}

impl TryFrom<String> for ListenerAddress {
    type Error = AddressParseError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<ListenerAddress> for String {
    fn from(addr: ListenerAddress) -> Self {
        addr.to_string()
    }
}

impl ListenerAddress {
    /// Returns the destination port, or `None` for pipe addresses.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Socket(addr) => Some(addr.port()),
            Self::Pipe(_) => None,
        }
    }

    /// Returns the destination IP, or `None` for pipe addresses.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Socket(addr) => Some(addr.ip()),
            Self::Pipe(_) => None,
        }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, Self::Pipe(_))
    }

    /// The name of this address inside the stats tree, i.e. the `<sanitized>`
    /// of `listener.<sanitized>.<counter>`.
    ///
    /// Sanitization replaces `:` with `_`, so `[::1]:10000` becomes
    /// `[__1]_10000` and `127.0.0.1:1234` becomes `127.0.0.1_1234`. Distinct
    /// binding tuples always produce distinct names, and the display form
    /// survives the config dump untouched.
    pub fn stat_name(&self) -> String {
        self.to_string().replace(':', "_")
    }
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => addr.fmt(f),
            Self::Pipe(path) => path.display().fmt(f),
        }
    }
}

impl FromStr for ListenerAddress {
    type Err = AddressParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.starts_with('/') || input.starts_with('@') {
            return Ok(Self::Pipe(PathBuf::from(input)));
        }

        input
            .parse::<SocketAddr>()
            .map(Self::Socket)
            .map_err(|_| AddressParseError::Invalid(input.to_owned()))
    }
}

impl From<SocketAddr> for ListenerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("malformed listener address: {0}")]
    Invalid(String),
}
