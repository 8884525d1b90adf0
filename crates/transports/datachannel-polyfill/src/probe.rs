//! Capability probe and installation
//!
//! Decides, once per host, whether native data channels work. Only a host
//! that can open a peer connection but fails to create a data channel on it
//! gets the polyfill.

use crate::config::PolyfillConfig;
use crate::connection::{PeerConnection, SessionNegotiator};
use crate::transport::Connector;
use crate::websocket::WebSocketConnector;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Label of the throwaway channel created by the probe
pub const PROBE_LABEL: &str = "test";

/// Outcome of the capability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Support {
    /// Host data channels work; nothing to install
    Native,
    /// Host can negotiate sessions but not data channels
    Polyfill,
    /// Host has no usable peer connection primitive
    Unsupported,
}

impl fmt::Display for Support {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Support::Native => "native",
            Support::Polyfill => "polyfill",
            Support::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Host environment offering native peer connections
#[async_trait]
pub trait NativeHost: Send + Sync {
    /// Open a throwaway peer connection
    async fn open_probe_connection(&self) -> Result<Box<dyn ProbeConnection>>;
}

/// Throwaway peer connection used only by the probe
#[async_trait]
pub trait ProbeConnection: Send + Sync {
    /// Try to create a data channel
    async fn create_data_channel(&self, label: &str) -> Result<()>;

    /// Discard the connection
    async fn close(&self);
}

/// Probe `host` for native data channel support
pub async fn probe(host: Option<&dyn NativeHost>) -> Support {
    let Some(host) = host else {
        return Support::Unsupported;
    };

    let connection = match host.open_probe_connection().await {
        Ok(connection) => connection,
        Err(e) => {
            debug!("Probe connection could not be opened: {}", e);
            return Support::Unsupported;
        }
    };

    let support = match connection.create_data_channel(PROBE_LABEL).await {
        Ok(()) => Support::Native,
        Err(e) => {
            debug!("Probe data channel failed: {}", e);
            Support::Polyfill
        }
    };
    connection.close().await;

    support
}

/// Result of [`install`]
pub enum Installation {
    /// Native data channels are available
    Native,
    /// No peer connection primitive; nothing was installed
    Unsupported,
    /// Data channels are emulated
    Polyfill(Polyfill),
}

impl Installation {
    pub fn support(&self) -> Support {
        match self {
            Installation::Native => Support::Native,
            Installation::Unsupported => Support::Unsupported,
            Installation::Polyfill(_) => Support::Polyfill,
        }
    }
}

impl fmt::Debug for Installation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Installation({})", self.support())
    }
}

/// Probe `host` and build the polyfill if it is needed
///
/// # Errors
///
/// Returns an error only on the polyfill path, if `config` is invalid.
pub async fn install(
    host: Option<&dyn NativeHost>,
    config: PolyfillConfig,
) -> Result<Installation> {
    match probe(host).await {
        Support::Native => {
            info!("Native data channel support detected");
            Ok(Installation::Native)
        }
        Support::Polyfill => {
            warn!("Native data channels unavailable; installing polyfill");
            Ok(Installation::Polyfill(Polyfill::new(config)?))
        }
        Support::Unsupported => {
            error!("No peer connection support; data channels are unavailable");
            Ok(Installation::Unsupported)
        }
    }
}

/// Factory of polyfilled peer connections sharing one connector and config
#[derive(Clone)]
pub struct Polyfill {
    config: Arc<PolyfillConfig>,
    connector: Arc<dyn Connector>,
}

impl fmt::Debug for Polyfill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Polyfill")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Polyfill {
    /// Build a polyfill that reaches the rendezvous service over WebSockets
    pub fn new(config: PolyfillConfig) -> Result<Self> {
        let connector = WebSocketConnector::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
        })
    }

    /// Build a polyfill over a custom connector
    pub fn with_connector(config: PolyfillConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            connector,
        })
    }

    pub fn config(&self) -> &PolyfillConfig {
        &self.config
    }

    /// Wrap a native session negotiator in a polyfilled peer connection
    pub fn peer_connection(&self, negotiator: Arc<dyn SessionNegotiator>) -> PeerConnection {
        PeerConnection::new(
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
            negotiator,
        )
    }
}
