//! Administrative gRPC channel to the coordination service.

mod client;
mod codec;
pub mod connection;
mod lookup;
pub mod proto;
mod settings;
mod transport;

pub use client::AdminClient;
pub use connection::{ConnectionManager, ConnectionOptions, ConnectionState, LinkStatus, Rotation};
pub use lookup::{find_node, find_user};
pub use settings::{api_key_prefix, ConnectionSettings, SharedSettings, TlsMaterial, TransportMode, TrustPool};
pub use transport::{is_auth_failure, AdminTransport, Connector, GrpcConnector, GrpcTransport};
