//! Shared fixtures for relay integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use qrexec_proxy::config::{Config, PluginDescriptor};
use qrexec_proxy::error::ConnectError;
use qrexec_proxy::invocation::NextHop;
use qrexec_proxy::plugin::{ChainRegistry, PluginFactory};
use qrexec_proxy::transport::{Connector, ConnectorType, TransportLeg};
use qrexec_proxy::Relay;

pub const PIPE_CAPACITY: usize = 64 * 1024;

/// In-memory next hop that echoes everything back and ends its output when
/// its input ends
#[derive(Debug, Default)]
pub struct MirrorConnector {
    calls: Mutex<Vec<NextHop>>,
}

impl MirrorConnector {
    pub fn calls(&self) -> Vec<NextHop> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MirrorConnector {
    async fn connect(&self, hop: &NextHop) -> Result<TransportLeg, ConnectError> {
        self.calls.lock().unwrap().push(hop.clone());
        Ok(mirror_leg())
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Custom
    }
}

pub fn mirror_leg() -> TransportLeg {
    let (near, far) = duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        let (mut r, mut w) = tokio::io::split(far);
        let _ = tokio::io::copy(&mut r, &mut w).await;
        let _ = w.shutdown().await;
    });
    TransportLeg::from_stream("mirror", near)
}

/// The calling domain's side of a session: the leg handed to the relay and
/// the stream the test drives
pub fn caller() -> (TransportLeg, DuplexStream) {
    let (near, far) = duplex(PIPE_CAPACITY);
    (TransportLeg::from_stream("caller", near), far)
}

pub fn relay(config: &Config, connector: Arc<dyn Connector>) -> Relay {
    let registry = ChainRegistry::from_config(config, &PluginFactory::with_builtins()).unwrap();
    Relay::new(registry, connector).with_settings(config.relay.clone())
}

pub fn timeout_config(seconds: f64) -> Config {
    Config::default().with_chain(
        "timeout",
        vec![PluginDescriptor::new("timeout").with_param("seconds", seconds)],
    )
}

/// Send `data`, close the caller's output and collect everything that comes
/// back
pub async fn exchange(far: &mut DuplexStream, data: &[u8]) -> Vec<u8> {
    far.write_all(data).await.unwrap();
    far.shutdown().await.unwrap();
    let mut out = Vec::new();
    far.read_to_end(&mut out).await.unwrap();
    out
}

/// Deterministic non-text payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub async fn within<F: std::future::Future>(secs: u64, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .expect("operation timed out")
}
