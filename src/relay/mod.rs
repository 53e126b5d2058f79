//! Session relay engine
//!
//! A [`Relay`] decodes the service argument, resolves the chain, connects
//! the next hop and hands both transport legs to a [`RelaySession`], which
//! pumps bytes in both directions through the chain's plugins.

mod context;
mod leg;
mod pipeline;
mod session;

pub use context::{AbortReason, SessionContext, SessionMeta, SessionState};
pub use session::{RelaySession, SessionOutcome, TransferStats};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{Config, RelayConfig};
use crate::error::Result;
use crate::invocation::InvocationTarget;
use crate::plugin::{ChainRegistry, PluginFactory};
use crate::transport::{create_connector, Connector, TransportLeg};

/// Everything needed to serve sessions: chains, connector and settings
#[derive(Clone)]
pub struct Relay {
    registry: Arc<ChainRegistry>,
    connector: Arc<dyn Connector>,
    settings: RelayConfig,
}

impl Relay {
    pub fn new(registry: ChainRegistry, connector: Arc<dyn Connector>) -> Self {
        Self {
            registry: Arc::new(registry),
            connector,
            settings: RelayConfig::default(),
        }
    }

    /// Build the chain registry and connector described by `config`
    pub fn from_config(config: &Config, factory: &PluginFactory) -> Result<Self> {
        let registry = ChainRegistry::from_config(config, factory)?;
        Ok(Self::new(registry, create_connector(&config.connector)).with_settings(config.relay.clone()))
    }

    pub fn with_settings(mut self, settings: RelayConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Decode the invocation and connect the next hop. Nothing is read from
    /// or written to `local` here.
    pub async fn start(
        &self,
        argument: &str,
        source: &str,
        local: TransportLeg,
        parent: &CancellationToken,
    ) -> Result<RelaySession> {
        let target = InvocationTarget::parse(argument)?;
        let chain = self.registry.resolve(target.chain())?;
        debug!(
            chain = target.chain().unwrap_or("-"),
            destination = %target.hop.domain,
            call = %target.hop.call(),
            "Invocation decoded"
        );

        let next_hop = self.connector.connect(&target.hop).await?;
        let meta = SessionMeta {
            chain: target.chain,
            source: source.to_string(),
            destination: target.hop.domain.clone(),
            call: target.hop.call(),
        };
        let context = SessionContext::with_parent(meta, parent);

        Ok(RelaySession::new(chain, context, local, next_hop).with_settings(self.settings.clone()))
    }

    /// Start and run one session, folding startup failures into the outcome
    pub async fn serve(
        &self,
        argument: &str,
        source: &str,
        local: TransportLeg,
        parent: &CancellationToken,
    ) -> SessionOutcome {
        match self.start(argument, source, local, parent).await {
            Ok(session) => session.run().await,
            Err(e) => {
                error!(argument, source, error = %e, "Failed to start session");
                SessionOutcome::Aborted {
                    reason: AbortReason::Startup(e),
                    stats: TransferStats::default(),
                }
            }
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("chains", &self.registry.chain_names())
            .field("connector", &self.connector.connector_type())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginDescriptor;
    use crate::error::{ConnectError, ProxyError};
    use crate::transport::{ConnectorType, MockConnector};

    fn registry() -> ChainRegistry {
        let config = Config::default().with_chain("audit", vec![PluginDescriptor::new("pass")]);
        ChainRegistry::from_config(&config, &PluginFactory::with_builtins()).unwrap()
    }

    fn local() -> TransportLeg {
        let (near, _far) = tokio::io::duplex(16);
        TransportLeg::from_stream("caller", near)
    }

    #[tokio::test]
    async fn test_malformed_argument_never_connects() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        let relay = Relay::new(registry(), Arc::new(connector));

        let outcome = relay
            .serve("justone", "src", local(), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome.reason(),
            Some(AbortReason::Startup(ProxyError::MalformedInvocation(_)))
        ));
        assert_eq!(outcome.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_unknown_chain_never_connects() {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        let relay = Relay::new(registry(), Arc::new(connector));

        let err = relay
            .start("nope+dst+svc", "src", local(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownChain(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_connect_failure_exit_code() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .withf(|hop| hop.domain == "dst" && hop.call() == "svc+arg")
            .times(1)
            .returning(|_| Err(ConnectError::Refused("policy denied".into())));
        connector
            .expect_connector_type()
            .return_const(ConnectorType::Custom);
        let relay = Relay::new(registry(), Arc::new(connector));

        let outcome = relay
            .serve("audit+dst+svc+arg", "src", local(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.exit_code(), 3);
        assert_eq!(outcome.final_state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_start_builds_session_meta() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|_| Ok(TransportLeg::from_stream("hop", tokio::io::duplex(16).0)));
        let relay = Relay::new(registry(), Arc::new(connector));

        let session = relay
            .start("audit+dst+svc+a+b", "caller-vm", local(), &CancellationToken::new())
            .await
            .unwrap();
        let meta = session.context().meta();
        assert_eq!(meta.chain.as_deref(), Some("audit"));
        assert_eq!(meta.source, "caller-vm");
        assert_eq!(meta.destination, "dst");
        assert_eq!(meta.call, "svc+a+b");
        assert_eq!(session.context().state(), SessionState::Starting);
    }
}
