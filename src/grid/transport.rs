//! gRPC channel connections for [`GridService`](crate::grid::GridService)
//! implementations.
//!
//! A [`ChannelConnection`] wraps a `tonic` channel together with the connectivity
//! state the pool inspects. Generated grid clients are built on top of
//! [`ChannelConnection::channel`].

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info};

use crate::config::{ClientConfig, TlsConfig};
use crate::error::{GridError, Result};
use crate::pool::{Connection, ConnectionFactory, ConnectivityState};

/// A pooled gRPC channel.
pub struct ChannelConnection {
    id: u64,
    channel: Channel,
    state: AtomicU8,
}

impl ChannelConnection {
    fn new(id: u64, channel: Channel, state: ConnectivityState) -> Self {
        Self {
            id,
            channel,
            state: AtomicU8::new(state.to_u8()),
        }
    }

    /// Handle for building generated clients. Cloning a channel is cheap.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Record a state observed by the caller, e.g. `Ready` after a successful call.
    pub fn set_state(&self, state: ConnectivityState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn report_failure(&self) {
        self.set_state(ConnectivityState::TransientFailure);
    }

    async fn shutdown(self) {
        self.set_state(ConnectivityState::Shutdown);
        debug!(connection = self.id, "Closing channel");
    }
}

/// Builds [`ChannelConnection`]s for one endpoint.
pub struct ChannelConnector {
    endpoint: Endpoint,
    lazy: bool,
    next_id: AtomicU64,
}

impl ChannelConnector {
    /// Create a connector from the endpoint, timeouts and TLS material of
    /// `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut endpoint = Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| GridError::Configuration(format!("Invalid endpoint: {}", e)))?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .tcp_nodelay(true);

        if let Some(tls) = tls_config(&config.tls, &config.endpoint)? {
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| GridError::Configuration(format!("Invalid TLS setup: {}", e)))?;
        }

        info!(endpoint = %config.endpoint, "Created channel connector");
        Ok(Self {
            endpoint,
            lazy: false,
            next_id: AtomicU64::new(0),
        })
    }

    /// Defer the transport handshake to the first call.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }
}

#[async_trait]
impl ConnectionFactory<ChannelConnection> for ChannelConnector {
    async fn connect(&self) -> Result<ChannelConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        if self.lazy {
            return Ok(ChannelConnection::new(
                id,
                self.endpoint.connect_lazy(),
                ConnectivityState::Idle,
            ));
        }

        let channel = self
            .endpoint
            .connect()
            .await
            .map_err(|e| GridError::Connection(format!("Failed to connect: {}", e)))?;
        debug!(connection = id, "Channel connected");
        Ok(ChannelConnection::new(id, channel, ConnectivityState::Ready))
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    let pem = fs::read(path).map_err(|e| {
        io::Error::new(e.kind(), format!("Cannot read {} {:?}: {}", what, path, e))
    })?;
    Ok(pem)
}

fn tls_config(tls: &TlsConfig, endpoint: &str) -> Result<Option<ClientTlsConfig>> {
    let has_material = tls.ca_cert.is_some() || tls.client_cert.is_some();
    if !endpoint.starts_with("https://") && !has_material {
        return Ok(None);
    }

    let mut config = ClientTlsConfig::new();
    if let Some(ca) = &tls.ca_cert {
        config = config.ca_certificate(Certificate::from_pem(read_pem(ca, "CA certificate")?));
    }
    if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
        config = config.identity(Identity::from_pem(
            read_pem(cert, "client certificate")?,
            read_pem(key, "client key")?,
        ));
    }
    if let Some(domain) = &tls.domain_override {
        config = config.domain_name(domain.clone());
    }
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_lazy_connection_starts_idle_and_fails_over() {
        let connector = ChannelConnector::from_config(&ClientConfig::default())
            .unwrap()
            .lazy(true);

        let first = connector.connect().await.unwrap();
        let second = connector.connect().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), ConnectivityState::Idle);
        assert!(first.state().is_healthy());

        first.report_failure();
        assert_eq!(first.state(), ConnectivityState::TransientFailure);
        assert!(!first.state().is_healthy());
    }

    #[test]
    fn test_invalid_endpoint_is_a_configuration_error() {
        let config = ClientConfig {
            endpoint: "http://bad host:5001".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ChannelConnector::from_config(&config),
            Err(GridError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let config = ClientConfig {
            endpoint: "https://grid.example:5001".to_string(),
            tls: TlsConfig {
                ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
                ..Default::default()
            },
            ..Default::default()
        };
        match ChannelConnector::from_config(&config) {
            Err(GridError::Io(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::NotFound);
                assert!(e.to_string().contains("CA certificate"));
            }
            _ => panic!("expected I/O error"),
        }
    }
}
