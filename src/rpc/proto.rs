//! Message set of the `headscale.v1.HeadscaleService` administrative API.
//!
//! Declared by hand with `prost` derives so no build-time code generation is
//! needed. Only the fields this crate reads are declared; unknown fields on
//! the wire are skipped by the decoder.

use prost_types::Timestamp;

pub const SERVICE_PATH: &str = "/headscale.v1.HeadscaleService";

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct ApiKey {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub prefix: String,
    #[prost(message, optional, tag = "3")]
    pub expiration: Option<Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub created_at: Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub last_seen: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListApiKeysRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListApiKeysResponse {
    #[prost(message, repeated, tag = "1")]
    pub api_keys: Vec<ApiKey>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateApiKeyRequest {
    #[prost(message, optional, tag = "1")]
    pub expiration: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateApiKeyResponse {
    #[prost(string, tag = "1")]
    pub api_key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExpireApiKeyRequest {
    #[prost(string, tag = "1")]
    pub prefix: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExpireApiKeyResponse {}

// ---------------------------------------------------------------------------
// Pre-authorization keys
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct PreAuthKey {
    #[prost(string, tag = "1")]
    pub user: String,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(bool, tag = "4")]
    pub reusable: bool,
    #[prost(bool, tag = "5")]
    pub ephemeral: bool,
    #[prost(bool, tag = "6")]
    pub used: bool,
    #[prost(message, optional, tag = "7")]
    pub expiration: Option<Timestamp>,
    #[prost(message, optional, tag = "8")]
    pub created_at: Option<Timestamp>,
    #[prost(string, repeated, tag = "9")]
    pub acl_tags: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPreAuthKeysRequest {
    #[prost(string, tag = "1")]
    pub user: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPreAuthKeysResponse {
    #[prost(message, repeated, tag = "1")]
    pub pre_auth_keys: Vec<PreAuthKey>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreatePreAuthKeyRequest {
    #[prost(string, tag = "1")]
    pub user: String,
    #[prost(bool, tag = "2")]
    pub reusable: bool,
    #[prost(bool, tag = "3")]
    pub ephemeral: bool,
    #[prost(message, optional, tag = "4")]
    pub expiration: Option<Timestamp>,
    #[prost(string, repeated, tag = "5")]
    pub acl_tags: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreatePreAuthKeyResponse {
    #[prost(message, optional, tag = "1")]
    pub pre_auth_key: Option<PreAuthKey>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExpirePreAuthKeyRequest {
    #[prost(string, tag = "1")]
    pub user: String,
    #[prost(string, tag = "2")]
    pub key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExpirePreAuthKeyResponse {}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, optional, tag = "3")]
    pub created_at: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListUsersRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListUsersResponse {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<User>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetUserRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateUserRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteUserRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteUserResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RenameUserRequest {
    #[prost(string, tag = "1")]
    pub old_name: String,
    #[prost(string, tag = "2")]
    pub new_name: String,
}

/// Shared shape of Get/Create/RenameUserResponse.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UserResponse {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct Node {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub machine_key: String,
    #[prost(string, tag = "3")]
    pub node_key: String,
    #[prost(string, tag = "4")]
    pub disco_key: String,
    #[prost(string, repeated, tag = "5")]
    pub ip_addresses: Vec<String>,
    #[prost(string, tag = "6")]
    pub name: String,
    #[prost(message, optional, tag = "7")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "8")]
    pub last_seen: Option<Timestamp>,
    #[prost(message, optional, tag = "10")]
    pub expiry: Option<Timestamp>,
    #[prost(message, optional, tag = "12")]
    pub created_at: Option<Timestamp>,
    #[prost(string, repeated, tag = "18")]
    pub forced_tags: Vec<String>,
    #[prost(string, repeated, tag = "19")]
    pub invalid_tags: Vec<String>,
    #[prost(string, repeated, tag = "20")]
    pub valid_tags: Vec<String>,
    #[prost(string, tag = "21")]
    pub given_name: String,
    #[prost(bool, tag = "22")]
    pub online: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListNodesRequest {
    #[prost(string, tag = "1")]
    pub user: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListNodesResponse {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<Node>,
}

/// Request shape shared by Get/Expire/DeleteNode.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeIdRequest {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RenameNodeRequest {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, tag = "2")]
    pub new_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MoveNodeRequest {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, tag = "2")]
    pub user: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterNodeRequest {
    #[prost(string, tag = "1")]
    pub user: String,
    #[prost(string, tag = "2")]
    pub key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetTagsRequest {
    #[prost(uint64, tag = "1")]
    pub node_id: u64,
    #[prost(string, repeated, tag = "2")]
    pub tags: Vec<String>,
}

/// Shared shape of every response that carries a single node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeResponse {
    #[prost(message, optional, tag = "1")]
    pub node: Option<Node>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteNodeResponse {}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct Route {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    #[prost(string, tag = "3")]
    pub prefix: String,
    #[prost(bool, tag = "4")]
    pub advertised: bool,
    #[prost(bool, tag = "5")]
    pub enabled: bool,
    #[prost(bool, tag = "6")]
    pub is_primary: bool,
    #[prost(message, optional, tag = "7")]
    pub created_at: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetRoutesRequest {}

/// Shared shape of GetRoutes/GetNodeRoutes responses.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RoutesResponse {
    #[prost(message, repeated, tag = "1")]
    pub routes: Vec<Route>,
}

/// Request shape shared by Enable/Disable/DeleteRoute.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RouteIdRequest {
    #[prost(uint64, tag = "1")]
    pub route_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn unknown_fields_are_skipped() {
        // Route with an extra field 8 (updated_at) that is not declared here.
        let mut bytes = Route {
            id: 7,
            prefix: "10.0.0.0/24".into(),
            enabled: true,
            ..Default::default()
        }
        .encode_to_vec();
        let updated_at = Timestamp {
            seconds: 5,
            nanos: 0,
        }
        .encode_to_vec();
        // field 8, wire type 2 (length-delimited)
        bytes.push((8 << 3) | 2);
        bytes.push(updated_at.len() as u8);
        bytes.extend_from_slice(&updated_at);

        let decoded = Route::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.id, 7);
        assert!(decoded.enabled);
    }

    #[test]
    fn node_id_request_matches_get_node_layout() {
        let bytes = NodeIdRequest { node_id: 300 }.encode_to_vec();
        // field 1 varint 300
        assert_eq!(bytes, vec![0x08, 0xAC, 0x02]);
    }
}
