use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Code, Request, Status};
use tracing::{debug, warn};

use super::codec::RawCodec;
use super::proto::SERVICE_PATH;
use super::settings::{ConnectionSettings, TransportMode, TrustPool};
use crate::error::ConnectionError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One established channel to the administrative service.
#[async_trait]
pub trait AdminTransport: Send + Sync {
    /// Issue a unary call with an already-encoded request body.
    async fn unary(
        &self,
        method: &'static str,
        body: Vec<u8>,
        bearer: &str,
    ) -> Result<Vec<u8>, Status>;

    /// Remote peer, for call logging.
    fn peer(&self) -> &str;
}

/// Opens channels. Swappable so the connection state machine can be driven
/// without a live server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(
        &self,
        settings: &ConnectionSettings,
        trust: &TrustPool,
    ) -> Result<Arc<dyn AdminTransport>, ConnectionError>;
}

/// Authentication-class failures: the key is missing, expired or unknown.
pub fn is_auth_failure(status: &Status) -> bool {
    match status.code() {
        Code::Unauthenticated => true,
        Code::Internal => status.message() == "failed to validate token",
        _ => false,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    async fn dial(
        &self,
        settings: &ConnectionSettings,
        trust: &TrustPool,
    ) -> Result<Arc<dyn AdminTransport>, ConnectionError> {
        let mode = settings.transport_mode();
        let uri = endpoint_uri(&settings.address, mode);
        let dial_err = |reason: String| ConnectionError::Dial {
            target: settings.address.clone(),
            reason,
        };

        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| dial_err(e.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT);

        match mode {
            TransportMode::Tls => {
                let tls = settings
                    .tls
                    .as_ref()
                    .ok_or_else(|| ConnectionError::Tls("tls material missing".into()))?;
                if let Some(ca) = &tls.ca {
                    if trust.add(ca) {
                        debug!("Added CA certificate to trust pool");
                    }
                }
                let mut config = ClientTlsConfig::new()
                    .with_native_roots()
                    .identity(Identity::from_pem(&tls.cert, &tls.key));
                for ca in trust.certificates().iter() {
                    config = config.ca_certificate(Certificate::from_pem(ca));
                }
                if let Some(name) = &tls.server_name {
                    config = config.domain_name(name.clone());
                }
                endpoint = endpoint
                    .tls_config(config)
                    .map_err(|e| ConnectionError::Tls(e.to_string()))?;
            }
            TransportMode::Plaintext => {}
            TransportMode::Unspecified => {
                warn!(
                    target_addr = %settings.address,
                    "Neither TLS material nor insecure mode configured, dialing without TLS"
                );
            }
        }

        debug!(uri = %uri, ?mode, "Dialing administrative service");
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| dial_err(e.to_string()))?;

        Ok(Arc::new(GrpcTransport {
            channel,
            peer: settings.address.clone(),
        }))
    }
}

fn endpoint_uri(address: &str, mode: TransportMode) -> String {
    if address.contains("://") {
        return address.to_string();
    }
    match mode {
        TransportMode::Tls => format!("https://{}", address),
        TransportMode::Plaintext | TransportMode::Unspecified => format!("http://{}", address),
    }
}

pub struct GrpcTransport {
    channel: Channel,
    peer: String,
}

#[async_trait]
impl AdminTransport for GrpcTransport {
    async fn unary(
        &self,
        method: &'static str,
        body: Vec<u8>,
        bearer: &str,
    ) -> Result<Vec<u8>, Status> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;

        let path: PathAndQuery = format!("{}/{}", SERVICE_PATH, method)
            .parse()
            .map_err(|_| Status::internal(format!("invalid method path: {}", method)))?;

        let mut request = Request::new(body);
        let authorization = format!("Bearer {}", bearer)
            .parse::<MetadataValue<Ascii>>()
            .map_err(|_| Status::unauthenticated("api key is not a valid header value"))?;
        request.metadata_mut().insert("authorization", authorization);

        let response = grpc.unary(request, path, RawCodec).await?;
        Ok(response.into_inner())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
