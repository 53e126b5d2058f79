//! Integration tests for full relay sessions
//!
//! Tests verify that:
//! - A chain without plugins is a byte-exact pass-through
//! - Forwarding plugins do not alter the stream
//! - Directions progress independently under backpressure
//! - Byte limits end a direction without aborting the session

mod common;

use common::*;
use qrexec_proxy::config::{Config, PluginDescriptor};
use qrexec_proxy::error::ConnectError;
use qrexec_proxy::invocation::NextHop;
use qrexec_proxy::relay::SessionState;
use qrexec_proxy::transport::{Connector, ConnectorType, TransportLeg};
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_direct_round_trip() {
    let connector = Arc::new(MirrorConnector::default());
    let relay = relay(&Config::default(), connector.clone());
    let (local, mut far) = caller();
    let data = payload(300 * 1024);

    let session = tokio::spawn(async move {
        relay
            .serve("dst+mirror", "src", local, &CancellationToken::new())
            .await
    });
    let echoed = within(10, exchange(&mut far, &data)).await;
    let outcome = session.await.unwrap();

    assert_eq!(echoed, data);
    assert!(outcome.is_closed());
    assert_eq!(outcome.stats().outbound, data.len() as u64);
    assert_eq!(outcome.stats().inbound, data.len() as u64);

    let calls = connector.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].domain, "dst");
    assert_eq!(calls[0].call(), "mirror");
}

#[tokio::test]
async fn test_empty_chain_segment_is_direct() {
    let relay = relay(&Config::default(), Arc::new(MirrorConnector::default()));
    let (local, mut far) = caller();

    let session = tokio::spawn(async move {
        relay
            .serve("+dst+mirror+arg", "src", local, &CancellationToken::new())
            .await
    });
    assert_eq!(within(5, exchange(&mut far, b"abc")).await, b"abc");
    assert!(session.await.unwrap().is_closed());
}

#[tokio::test]
async fn test_forwarding_plugins_do_not_alter_stream() {
    let config = Config::default().with_chain(
        "noop",
        vec![
            PluginDescriptor::new("pass"),
            PluginDescriptor::new("sniff").with_param("decode", "hex"),
            PluginDescriptor::new("streamline")
                .with_param("bufSize", 4096)
                .with_param("delayReadSeconds", 0)
                .with_param("delayWriteSeconds", 0),
            PluginDescriptor::new("pass"),
        ],
    );
    let relay = relay(&config, Arc::new(MirrorConnector::default()));
    let (local, mut far) = caller();
    let data = payload(50_000);

    let session = tokio::spawn(async move {
        relay
            .serve("noop+dst+mirror", "src", local, &CancellationToken::new())
            .await
    });
    let echoed = within(10, exchange(&mut far, &data)).await;
    let outcome = session.await.unwrap();

    assert_eq!(echoed, data);
    assert_eq!(outcome.final_state(), SessionState::Closed);
}

#[tokio::test]
async fn test_byte_limit_truncates_and_closes_cleanly() {
    let config = Config::default().with_chain(
        "limited",
        vec![PluginDescriptor::new("byte_limit")
            .with_param("outboundLimit", 5)
            .with_param("inboundLimit", -1)],
    );
    let relay = relay(&config, Arc::new(MirrorConnector::default()));
    let (local, mut far) = caller();

    let session = tokio::spawn(async move {
        relay
            .serve("limited+dst+mirror", "src", local, &CancellationToken::new())
            .await
    });
    let echoed = within(5, exchange(&mut far, b"hello world")).await;
    let outcome = session.await.unwrap();

    assert_eq!(echoed, b"hello");
    assert!(outcome.is_closed());
    assert_eq!(outcome.stats().outbound, 5);
}

#[tokio::test]
async fn test_one_way_silences_destination() {
    let config = Config::default().with_chain("ow", vec![PluginDescriptor::new("one_way")]);
    let relay = relay(&config, Arc::new(MirrorConnector::default()));
    let (local, mut far) = caller();

    let session = tokio::spawn(async move {
        relay
            .serve("ow+dst+mirror", "src", local, &CancellationToken::new())
            .await
    });
    let echoed = within(5, exchange(&mut far, b"nothing comes back")).await;
    let outcome = session.await.unwrap();

    assert!(echoed.is_empty());
    assert!(outcome.is_closed());
    assert_eq!(outcome.stats().inbound, 0);
}

/// Next hop that floods its output and never reads its input
#[derive(Debug)]
struct FloodConnector {
    len: usize,
}

#[async_trait::async_trait]
impl Connector for FloodConnector {
    async fn connect(&self, _hop: &NextHop) -> Result<TransportLeg, ConnectError> {
        let (near, mut far) = duplex(1024);
        let data = payload(self.len);
        tokio::spawn(async move {
            far.write_all(&data).await.unwrap();
            // Keep the input side open and unread
            std::future::pending::<()>().await;
        });
        Ok(TransportLeg::from_stream("flood", near))
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Custom
    }
}

#[tokio::test]
async fn test_fast_direction_progresses_while_other_is_blocked() {
    let len = 512 * 1024;
    let relay = relay(&Config::default(), Arc::new(FloodConnector { len }));
    let (local, far) = caller();
    let (mut far_reader, mut far_writer) = tokio::io::split(far);
    let shutdown = CancellationToken::new();

    let session = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { relay.serve("dst+sink", "src", local, &shutdown).await }
    });

    // Outbound backs up: the next hop never reads
    let writer = tokio::spawn(async move {
        let chunk = vec![0u8; 64 * 1024];
        loop {
            if far_writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let mut received = vec![0u8; len];
    within(10, far_reader.read_exact(&mut received)).await.unwrap();
    assert_eq!(received, payload(len));
    assert!(!writer.is_finished());

    shutdown.cancel();
    let outcome = within(5, session).await.unwrap();
    assert_eq!(outcome.exit_code(), 7);
    writer.abort();
}
