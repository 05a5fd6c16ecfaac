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

//! Listener filter that sniffs the first bytes of a connection for a TLS
//! ClientHello, extracting the requested server name and ALPN protocols for
//! filter chain matching.
//!
//! This is the filter the listener builder injects automatically when any
//! filter chain constrains `server_names`, `application_protocols`, or
//! `transport_protocol: "tls"`.

use std::sync::Arc;

use tracing::trace;

use crate::filters::prelude::*;
use crate::metrics::{filter_opts, CollectorExt};

pub const NAME: &str = "gangway.listener_filters.tls_inspector.v1alpha1.TlsInspector";

/// TLS handshake record type.
const TLS_HANDSHAKE: u8 = 0x16;
/// ClientHello handshake message type.
const CLIENT_HELLO: u8 = 0x01;

/// Creates a factory for building the filter instances.
pub fn factory() -> DynListenerFilterFactory {
    Box::from(TlsInspectorFactory)
}

struct TlsInspectorFactory;

impl ListenerFilterFactory for TlsInspectorFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(Config)
    }

    fn create_filter(
        &self,
        args: CreateFilterArgs<'_>,
    ) -> Result<Arc<dyn ListenerFilter>, CreationError> {
        let _config: Config = args.config_or_default(NAME)?;
        Ok(Arc::new(TlsInspector {
            metrics: Metrics::new().map_err(|err| CreationError::FieldInvalid {
                field: "metrics".into(),
                reason: err.to_string(),
            })?,
        }))
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {}

struct Metrics {
    tls_found: prometheus::IntCounter,
    tls_not_found: prometheus::IntCounter,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            tls_found: prometheus::IntCounter::with_opts(filter_opts(
                "tls_found_total",
                "TlsInspector",
                "Total number of connections with a TLS ClientHello.",
            ))?
            .register_if_not_exists()?,
            tls_not_found: prometheus::IntCounter::with_opts(filter_opts(
                "tls_not_found_total",
                "TlsInspector",
                "Total number of connections without a TLS ClientHello.",
            ))?
            .register_if_not_exists()?,
        })
    }
}

struct TlsInspector {
    metrics: Metrics,
}

impl ListenerFilter for TlsInspector {
    fn on_accept(&self, ctx: &mut AcceptContext) -> FilterStatus {
        if ctx.prelude.is_empty() {
            return FilterStatus::StopIteration;
        }

        if ctx.prelude[0] != TLS_HANDSHAKE {
            self.metrics.tls_not_found.inc();
            ctx.transport_protocol = Some("raw_buffer".into());
            return FilterStatus::Continue;
        }

        match parse_client_hello(&ctx.prelude) {
            ParseResult::NeedMoreData => FilterStatus::StopIteration,
            ParseResult::NotTls => {
                self.metrics.tls_not_found.inc();
                ctx.transport_protocol = Some("raw_buffer".into());
                FilterStatus::Continue
            }
            ParseResult::Hello(hello) => {
                self.metrics.tls_found.inc();
                trace!(server_name = ?hello.server_name, alpn = ?hello.alpn, "sniffed ClientHello");
                ctx.transport_protocol = Some("tls".into());
                ctx.server_name = hello.server_name;
                ctx.application_protocols = hello.alpn;
                FilterStatus::Continue
            }
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct ClientHello {
    server_name: Option<String>,
    alpn: Vec<String>,
}

#[derive(Debug, PartialEq)]
enum ParseResult {
    Hello(ClientHello),
    NeedMoreData,
    NotTls,
}

/// Parses the SNI and ALPN extensions out of a TLS ClientHello.
///
/// The handshake message may be fragmented across several records, so record
/// payloads are reassembled until the declared body is complete. Running out
/// of input mid-record or mid-body asks for more data; only a malformed
/// header or message declares the connection plaintext.
fn parse_client_hello(data: &[u8]) -> ParseResult {
    let mut message = Vec::new();
    let mut message_len = None;
    let mut rest = data;

    loop {
        // Record header: type, version (2), length (2).
        if rest.len() < 5 {
            return ParseResult::NeedMoreData;
        }
        if rest[0] != TLS_HANDSHAKE || rest[1] != 0x03 {
            return ParseResult::NotTls;
        }
        let record_len = u16::from_be_bytes([rest[3], rest[4]]) as usize;
        if rest.len() < 5 + record_len {
            return ParseResult::NeedMoreData;
        }
        message.extend_from_slice(&rest[5..5 + record_len]);
        rest = &rest[5 + record_len..];

        // Handshake header: type, length (3).
        if message_len.is_none() && message.len() >= 4 {
            if message[0] != CLIENT_HELLO {
                return ParseResult::NotTls;
            }
            let body_len = u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize;
            message_len = Some(4 + body_len);
        }

        if let Some(message_len) = message_len {
            if message.len() >= message_len {
                let mut body = Cursor::new(&message[4..message_len]);
                return match parse_hello_body(&mut body) {
                    Some(hello) => ParseResult::Hello(hello),
                    None => ParseResult::NotTls,
                };
            }
        }
    }
}

fn parse_hello_body(body: &mut Cursor<'_>) -> Option<ClientHello> {
    body.take(2)?; // client version
    body.take(32)?; // random
    let session_id_len = body.u8()? as usize;
    body.take(session_id_len)?;
    let cipher_suites_len = body.u16()? as usize;
    body.take(cipher_suites_len)?;
    let compression_len = body.u8()? as usize;
    body.take(compression_len)?;

    let mut hello = ClientHello::default();
    if body.is_empty() {
        // Extension-less hellos are still TLS.
        return Some(hello);
    }

    let extensions_len = body.u16()? as usize;
    let mut extensions = Cursor::new(body.take(extensions_len)?);
    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let len = extensions.u16()? as usize;
        let payload = extensions.take(len)?;
        match kind {
            // server_name
            0 => hello.server_name = parse_sni(payload),
            // application_layer_protocol_negotiation
            16 => hello.alpn = parse_alpn(payload),
            _ => {}
        }
    }

    Some(hello)
}

fn parse_sni(payload: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(payload);
    let list_len = cursor.u16()? as usize;
    let mut list = Cursor::new(cursor.take(list_len)?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        // host_name
        if name_type == 0 {
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

fn parse_alpn(payload: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    let mut cursor = Cursor::new(payload);
    let Some(list_len) = cursor.u16() else {
        return protocols;
    };
    let Some(list) = cursor.take(list_len as usize) else {
        return protocols;
    };
    let mut list = Cursor::new(list);
    while !list.is_empty() {
        let Some(len) = list.u8() else { break };
        let Some(proto) = list.take(len as usize) else {
            break;
        };
        if let Ok(proto) = String::from_utf8(proto.to_vec()) {
            protocols.push(proto);
        }
    }
    protocols
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.data.len() < len {
            return None;
        }
        let (taken, rest) = self.data.split_at(len);
        self.data = rest;
        Some(taken)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerFactoryContext;

    /// Builds a syntactically valid ClientHello record with the given SNI
    /// and ALPN extensions.
    fn client_hello(server_name: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut extensions = Vec::new();

        if let Some(name) = server_name {
            let mut ext = Vec::new();
            ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
            ext.push(0); // host_name
            ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
            ext.extend_from_slice(name.as_bytes());

            extensions.extend_from_slice(&0u16.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        if !alpn.is_empty() {
            let mut list = Vec::new();
            for proto in alpn {
                list.push(proto.len() as u8);
                list.extend_from_slice(proto.as_bytes());
            }
            let mut ext = Vec::new();
            ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
            ext.extend_from_slice(&list);

            extensions.extend_from_slice(&16u16.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut hello = vec![CLIENT_HELLO];
        hello.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hello.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        record.extend_from_slice(&hello);
        record
    }

    fn inspector() -> Arc<dyn ListenerFilter> {
        let mut context = ListenerFactoryContext::for_testing();
        factory()
            .create_filter(CreateFilterArgs {
                config: None,
                context: &mut context,
            })
            .unwrap()
    }

    #[test]
    fn detects_sni_and_alpn() {
        let mut ctx = AcceptContext {
            prelude: client_hello(Some("example.com"), &["h2", "http/1.1"]),
            ..Default::default()
        };

        assert_eq!(inspector().on_accept(&mut ctx), FilterStatus::Continue);
        assert_eq!(ctx.transport_protocol.as_deref(), Some("tls"));
        assert_eq!(ctx.server_name.as_deref(), Some("example.com"));
        assert_eq!(ctx.application_protocols, vec!["h2", "http/1.1"]);
    }

    #[test]
    fn plaintext_is_raw_buffer() {
        let mut ctx = AcceptContext {
            prelude: b"GET / HTTP/1.1\r\n".to_vec(),
            ..Default::default()
        };

        assert_eq!(inspector().on_accept(&mut ctx), FilterStatus::Continue);
        assert_eq!(ctx.transport_protocol.as_deref(), Some("raw_buffer"));
        assert_eq!(ctx.server_name, None);
    }

    #[test]
    fn fragmented_hello_reassembles_records() {
        let record = client_hello(Some("example.com"), &["h2"]);
        let payload = &record[5..];
        let split = payload.len() / 2;

        let mut fragmented = Vec::new();
        for part in [&payload[..split], &payload[split..]] {
            fragmented.extend_from_slice(&[TLS_HANDSHAKE, 0x03, 0x01]);
            fragmented.extend_from_slice(&(part.len() as u16).to_be_bytes());
            fragmented.extend_from_slice(part);
        }

        // Only the first record so far: the handshake body is incomplete,
        // which must not be mistaken for plaintext.
        let mut ctx = AcceptContext {
            prelude: fragmented[..5 + split].to_vec(),
            ..Default::default()
        };
        assert_eq!(inspector().on_accept(&mut ctx), FilterStatus::StopIteration);
        assert_eq!(ctx.transport_protocol, None);

        ctx.prelude = fragmented;
        assert_eq!(inspector().on_accept(&mut ctx), FilterStatus::Continue);
        assert_eq!(ctx.transport_protocol.as_deref(), Some("tls"));
        assert_eq!(ctx.server_name.as_deref(), Some("example.com"));
        assert_eq!(ctx.application_protocols, vec!["h2"]);
    }

    #[test]
    fn short_record_waits_for_more_data() {
        let full = client_hello(Some("example.com"), &[]);
        let mut ctx = AcceptContext {
            prelude: full[..8].to_vec(),
            ..Default::default()
        };

        assert_eq!(inspector().on_accept(&mut ctx), FilterStatus::StopIteration);

        ctx.prelude = full;
        assert_eq!(inspector().on_accept(&mut ctx), FilterStatus::Continue);
        assert_eq!(ctx.server_name.as_deref(), Some("example.com"));
    }

    #[test]
    fn hello_without_extensions() {
        let mut record = client_hello(None, &[]);
        // Strip the (empty) extensions length to mimic a legacy hello.
        record.truncate(record.len() - 2);
        let body_len = (record.len() - 5) as u16;
        record[3..5].copy_from_slice(&body_len.to_be_bytes());
        let hello_len = (record.len() - 9) as u32;
        record[6..9].copy_from_slice(&hello_len.to_be_bytes()[1..]);

        let mut ctx = AcceptContext {
            prelude: record,
            ..Default::default()
        };
        assert_eq!(inspector().on_accept(&mut ctx), FilterStatus::Continue);
        assert_eq!(ctx.transport_protocol.as_deref(), Some("tls"));
    }
}
