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

//! Listen socket creation and the socket option pipeline.
//!
//! Options are collected from the listener's well-known fields, its
//! `socket_options`, and anything listener filter factories contribute, then
//! applied at exactly three lifecycle points: pre-bind, post-bind, and
//! post-listen. A single failing `setsockopt(2)` aborts listener creation.

use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::config::{
    ListenerAddress, ListenerConfig, SocketOptionConfig, SocketOptionValue, SocketState,
    SocketType,
};

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("Setting socket options failed")]
    OptionFailed,
    #[error("socket option '{0}' is not supported on this platform")]
    UnsupportedOption(&'static str),
    #[error("cannot create socket for '{address}': {error}")]
    Create {
        address: String,
        error: std::io::Error,
    },
    #[error("cannot bind '{address}': {error}")]
    Bind {
        address: String,
        error: std::io::Error,
    },
    #[error("cannot listen on '{address}': {error}")]
    Listen {
        address: String,
        error: std::io::Error,
    },
}

/// The platform primitive behind option application. One implementation talks
/// to the kernel; tests substitute recorders and failure injectors.
pub trait SocketOps: Send + Sync {
    fn set_option(
        &self,
        socket: &ListenSocket,
        level: i32,
        name: i32,
        value: &SocketOptionValue,
        state: SocketState,
    ) -> std::io::Result<()>;
}

/// [`SocketOps`] backed by `setsockopt(2)`.
#[derive(Debug, Default)]
pub struct OsSocketOps;

impl SocketOps for OsSocketOps {
    #[cfg(unix)]
    fn set_option(
        &self,
        socket: &ListenSocket,
        level: i32,
        name: i32,
        value: &SocketOptionValue,
        _state: SocketState,
    ) -> std::io::Result<()> {
        use std::os::fd::AsRawFd;

        let Some(inner) = socket.inner.as_ref() else {
            // Virtual sockets have no fd to configure.
            return Ok(());
        };
        let fd = inner.as_raw_fd();

        let rc = match value {
            SocketOptionValue::IntValue(v) => {
                let v = *v as libc::c_int;
                unsafe {
                    libc::setsockopt(
                        fd,
                        level,
                        name,
                        &v as *const libc::c_int as *const libc::c_void,
                        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    )
                }
            }
            SocketOptionValue::BufValue(buf) => unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    name,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len() as libc::socklen_t,
                )
            },
        };

        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn set_option(
        &self,
        _socket: &ListenSocket,
        _level: i32,
        _name: i32,
        _value: &SocketOptionValue,
        _state: SocketState,
    ) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "raw socket options are unsupported on this platform",
        ))
    }
}

/// A socket owned by a listener. Either bound to the kernel, or a virtual
/// placeholder when the listener declared `bind_to_port: false`.
///
/// Sockets are shared (`Arc`) so a superseded listener can donate its handle
/// to the successor without the kernel accept queue ever closing.
#[derive(Debug)]
pub struct ListenSocket {
    address: ListenerAddress,
    socket_type: SocketType,
    inner: Option<Socket>,
}

impl ListenSocket {
    /// Creates, configures, binds and (for stream sockets) starts listening.
    ///
    /// `options` are applied through `ops` at their declared states:
    /// `Prebind` after creation, `Bound` after `bind(2)`, `Listening` after
    /// `listen(2)`. Datagram and virtual sockets never reach the listening
    /// state, so their `Listening` options are silently inapplicable.
    pub fn bind(
        address: ListenerAddress,
        socket_type: SocketType,
        options: &[SocketOptionConfig],
        bind_to_port: bool,
        tcp_backlog_size: u32,
        ops: &dyn SocketOps,
    ) -> Result<Arc<Self>, SocketError> {
        if !bind_to_port {
            return Ok(Self::virtual_socket(address, socket_type));
        }

        let inner = create_socket(&address, socket_type)?;
        let mut socket = Self {
            address,
            socket_type,
            inner: Some(inner),
        };

        socket.apply_options(options, SocketState::Prebind, ops)?;
        socket.bind_inner()?;
        socket.apply_options(options, SocketState::Bound, ops)?;

        if socket_type == SocketType::Stream {
            socket.listen_inner(tcp_backlog_size)?;
            socket.apply_options(options, SocketState::Listening, ops)?;
        }

        Ok(Arc::new(socket))
    }

    /// A placeholder socket with no kernel object behind it. Used for
    /// `bind_to_port: false` listeners and by test component factories.
    pub fn virtual_socket(address: ListenerAddress, socket_type: SocketType) -> Arc<Self> {
        Arc::new(Self {
            address,
            socket_type,
            inner: None,
        })
    }

    pub fn address(&self) -> &ListenerAddress {
        &self.address
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// Whether this is a placeholder with no kernel socket behind it.
    pub fn is_virtual(&self) -> bool {
        self.inner.is_none()
    }

    /// The address actually bound by the kernel. Differs from
    /// [`Self::address`] when port zero was requested.
    pub fn local_addr(&self) -> Option<ListenerAddress> {
        let addr = self.inner.as_ref()?.local_addr().ok()?;
        addr.as_socket().map(ListenerAddress::Socket)
    }

    pub(crate) fn apply_options(
        &self,
        options: &[SocketOptionConfig],
        state: SocketState,
        ops: &dyn SocketOps,
    ) -> Result<(), SocketError> {
        for option in options.iter().filter(|option| option.state == state) {
            ops.set_option(self, option.level, option.name, &option.value, state)
                .map_err(|error| {
                    warn!(
                        address = %self.address,
                        level = option.level,
                        name = option.name,
                        %error,
                        "setsockopt failed"
                    );
                    SocketError::OptionFailed
                })?;
        }
        Ok(())
    }

    fn bind_inner(&mut self) -> Result<(), SocketError> {
        let inner = self.inner.as_ref().expect("bound socket");
        let result = match &self.address {
            ListenerAddress::Socket(addr) => inner.bind(&(*addr).into()),
            #[cfg(unix)]
            ListenerAddress::Pipe(path) => {
                // A stale socket file from a previous run would fail the bind.
                let _ = std::fs::remove_file(path);
                socket2::SockAddr::unix(path).and_then(|addr| inner.bind(&addr))
            }
            #[cfg(not(unix))]
            ListenerAddress::Pipe(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "pipe listeners are unsupported on this platform",
            )),
        };

        result.map_err(|error| SocketError::Bind {
            address: self.address.to_string(),
            error,
        })
    }

    fn listen_inner(&mut self, backlog: u32) -> Result<(), SocketError> {
        self.inner
            .as_ref()
            .expect("bound socket")
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(|error| SocketError::Listen {
                address: self.address.to_string(),
                error,
            })
    }
}

/// Only the address family actually used is opened, so single-family hosts
/// (IPv4-only or IPv6-only) can always serve literals of their own family.
fn create_socket(
    address: &ListenerAddress,
    socket_type: SocketType,
) -> Result<Socket, SocketError> {
    let (domain, protocol) = match address {
        ListenerAddress::Socket(addr) => {
            let domain = if addr.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let protocol = match socket_type {
                SocketType::Stream => Protocol::TCP,
                SocketType::Datagram => Protocol::UDP,
            };
            (domain, Some(protocol))
        }
        ListenerAddress::Pipe(_) => (Domain::UNIX, None),
    };

    let kind = match socket_type {
        SocketType::Stream => Type::STREAM,
        SocketType::Datagram => Type::DGRAM,
    };

    let socket = Socket::new(domain, kind, protocol).map_err(|error| SocketError::Create {
        address: address.to_string(),
        error,
    })?;

    if let ListenerAddress::Socket(addr) = address {
        if addr.is_ipv6() {
            let _ = socket.set_only_v6(true);
        }
    }

    Ok(socket)
}

/// Expands the listener's well-known fields into concrete socket options.
///
/// Fails on platforms without the matching option, so misconfiguration is a
/// build-time error rather than a surprise at apply time.
pub fn well_known_options(
    config: &ListenerConfig,
) -> Result<Vec<SocketOptionConfig>, SocketError> {
    let mut options = Vec::new();

    if config.transparent {
        options.push(platform_option(
            "transparent",
            ip_transparent(),
            1,
            SocketState::Prebind,
        )?);
    }

    if config.freebind {
        options.push(platform_option(
            "freebind",
            ip_freebind(),
            1,
            SocketState::Prebind,
        )?);
    }

    if let Some(queue_length) = config.tcp_fast_open_queue_length {
        options.push(platform_option(
            "tcp_fast_open_queue_length",
            tcp_fastopen(),
            i64::from(queue_length),
            SocketState::Listening,
        )?);
    }

    Ok(options)
}

fn platform_option(
    field: &'static str,
    option: Option<(i32, i32)>,
    value: i64,
    state: SocketState,
) -> Result<SocketOptionConfig, SocketError> {
    let (level, name) = option.ok_or(SocketError::UnsupportedOption(field))?;
    Ok(SocketOptionConfig {
        level,
        name,
        value: SocketOptionValue::IntValue(value),
        state,
    })
}

#[cfg(target_os = "linux")]
fn ip_transparent() -> Option<(i32, i32)> {
    Some((libc::IPPROTO_IP, libc::IP_TRANSPARENT))
}

#[cfg(not(target_os = "linux"))]
fn ip_transparent() -> Option<(i32, i32)> {
    None
}

#[cfg(target_os = "linux")]
fn ip_freebind() -> Option<(i32, i32)> {
    Some((libc::IPPROTO_IP, libc::IP_FREEBIND))
}

#[cfg(not(target_os = "linux"))]
fn ip_freebind() -> Option<(i32, i32)> {
    None
}

#[cfg(target_os = "linux")]
fn tcp_fastopen() -> Option<(i32, i32)> {
    Some((libc::IPPROTO_TCP, libc::TCP_FASTOPEN))
}

#[cfg(not(target_os = "linux"))]
fn tcp_fastopen() -> Option<(i32, i32)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSocketOps;

    fn loopback() -> ListenerAddress {
        "127.0.0.1:0".parse().unwrap()
    }

    fn option(level: i32, name: i32, state: SocketState) -> SocketOptionConfig {
        SocketOptionConfig {
            level,
            name,
            value: SocketOptionValue::IntValue(1),
            state,
        }
    }

    #[test]
    fn applies_options_per_state_in_order() {
        let ops = RecordingSocketOps::default();
        let options = vec![
            option(1, 101, SocketState::Bound),
            option(1, 100, SocketState::Prebind),
            option(1, 102, SocketState::Listening),
        ];

        let socket = ListenSocket::bind(
            loopback(),
            SocketType::Stream,
            &options,
            true,
            128,
            &ops,
        )
        .unwrap();

        assert!(!socket.is_virtual());
        assert_eq!(
            ops.applied(),
            vec![
                (100, SocketState::Prebind),
                (101, SocketState::Bound),
                (102, SocketState::Listening),
            ]
        );
    }

    #[test]
    fn datagram_sockets_never_reach_listening() {
        let ops = RecordingSocketOps::default();
        let options = vec![
            option(1, 100, SocketState::Prebind),
            option(1, 102, SocketState::Listening),
        ];

        ListenSocket::bind(
            loopback(),
            SocketType::Datagram,
            &options,
            true,
            128,
            &ops,
        )
        .unwrap();

        assert_eq!(ops.applied(), vec![(100, SocketState::Prebind)]);
    }

    #[test]
    fn option_failure_aborts_bind() {
        let ops = RecordingSocketOps::failing_on(100);
        let options = vec![option(1, 100, SocketState::Prebind)];

        let err = ListenSocket::bind(
            loopback(),
            SocketType::Stream,
            &options,
            true,
            128,
            &ops,
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "Setting socket options failed");
    }

    #[test]
    fn virtual_socket_skips_kernel() {
        let ops = RecordingSocketOps::default();
        let options = vec![option(1, 100, SocketState::Prebind)];

        let socket = ListenSocket::bind(
            loopback(),
            SocketType::Stream,
            &options,
            false,
            128,
            &ops,
        )
        .unwrap();

        assert!(socket.is_virtual());
        assert!(ops.applied().is_empty());
        assert_eq!(socket.local_addr(), None);
    }

    #[test]
    fn binds_real_loopback_socket() {
        let ops = RecordingSocketOps::default();
        let socket =
            ListenSocket::bind(loopback(), SocketType::Stream, &[], true, 128, &ops).unwrap();

        let bound = socket.local_addr().unwrap();
        assert_ne!(bound.port(), Some(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn well_known_fields_expand() {
        let mut config = ListenerConfig::minimal("foo", loopback());
        config.transparent = true;
        config.freebind = true;
        config.tcp_fast_open_queue_length = Some(7);

        let options = well_known_options(&config).unwrap();
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].state, SocketState::Prebind);
        assert_eq!(options[1].state, SocketState::Prebind);
        assert_eq!(options[2].state, SocketState::Listening);
        assert_eq!(options[2].value, SocketOptionValue::IntValue(7));
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn well_known_fields_fail_without_platform_support() {
        let mut config = ListenerConfig::minimal("foo", loopback());
        config.transparent = true;

        assert!(well_known_options(&config).is_err());
    }
}
