use chrono::{DateTime, Utc};
use prost::Message;
use prost_types::Timestamp;
use std::sync::Arc;
use tonic::Status;

use super::connection::ConnectionManager;
use super::lookup::{find_node, find_user};
use super::proto::*;
use crate::error::ConnectionError;

/// Typed administrative operations over the managed channel.
#[derive(Clone)]
pub struct AdminClient {
    manager: Arc<ConnectionManager>,
}

fn timestamp(at: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

impl AdminClient {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    async fn call<Req, Resp>(&self, method: &'static str, request: Req) -> Result<Resp, ConnectionError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let body = self.manager.invoke(method, request.encode_to_vec()).await?;
        Resp::decode(body.as_slice()).map_err(|e| ConnectionError::Rpc {
            method,
            status: Status::internal(format!("failed to decode response: {}", e)),
        })
    }

    // API keys

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>, ConnectionError> {
        let resp: ListApiKeysResponse = self.call("ListApiKeys", ListApiKeysRequest {}).await?;
        Ok(resp.api_keys)
    }

    pub async fn create_api_key(
        &self,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<String, ConnectionError> {
        let req = CreateApiKeyRequest {
            expiration: expiration.map(timestamp),
        };
        let resp: CreateApiKeyResponse = self.call("CreateApiKey", req).await?;
        Ok(resp.api_key)
    }

    pub async fn expire_api_key(&self, prefix: &str) -> Result<(), ConnectionError> {
        let req = ExpireApiKeyRequest {
            prefix: prefix.to_string(),
        };
        let _: ExpireApiKeyResponse = self.call("ExpireApiKey", req).await?;
        Ok(())
    }

    // Pre-authorization keys

    pub async fn list_pre_auth_keys(&self, user: &str) -> Result<Vec<PreAuthKey>, ConnectionError> {
        let req = ListPreAuthKeysRequest {
            user: user.to_string(),
        };
        let resp: ListPreAuthKeysResponse = self.call("ListPreAuthKeys", req).await?;
        Ok(resp.pre_auth_keys)
    }

    pub async fn create_pre_auth_key(
        &self,
        user: &str,
        reusable: bool,
        ephemeral: bool,
        expiration: Option<DateTime<Utc>>,
        acl_tags: Vec<String>,
    ) -> Result<PreAuthKey, ConnectionError> {
        let req = CreatePreAuthKeyRequest {
            user: user.to_string(),
            reusable,
            ephemeral,
            expiration: expiration.map(timestamp),
            acl_tags,
        };
        let resp: CreatePreAuthKeyResponse = self.call("CreatePreAuthKey", req).await?;
        resp.pre_auth_key.ok_or_else(|| missing("CreatePreAuthKey", "pre_auth_key"))
    }

    pub async fn expire_pre_auth_key(&self, user: &str, key: &str) -> Result<(), ConnectionError> {
        let req = ExpirePreAuthKeyRequest {
            user: user.to_string(),
            key: key.to_string(),
        };
        let _: ExpirePreAuthKeyResponse = self.call("ExpirePreAuthKey", req).await?;
        Ok(())
    }

    // Users

    pub async fn list_users(&self) -> Result<Vec<User>, ConnectionError> {
        let resp: ListUsersResponse = self.call("ListUsers", ListUsersRequest {}).await?;
        Ok(resp.users)
    }

    pub async fn get_user(&self, name: &str) -> Result<User, ConnectionError> {
        let req = GetUserRequest {
            name: name.to_string(),
        };
        let resp: UserResponse = self.call("GetUser", req).await?;
        resp.user.ok_or_else(|| missing("GetUser", "user"))
    }

    /// Resolve a user by name from the full listing.
    pub async fn find_user(&self, name: &str) -> Result<Option<User>, ConnectionError> {
        let users = self.list_users().await?;
        Ok(find_user(&users, name).cloned())
    }

    pub async fn create_user(&self, name: &str) -> Result<User, ConnectionError> {
        let req = CreateUserRequest {
            name: name.to_string(),
        };
        let resp: UserResponse = self.call("CreateUser", req).await?;
        resp.user.ok_or_else(|| missing("CreateUser", "user"))
    }

    pub async fn delete_user(&self, name: &str) -> Result<(), ConnectionError> {
        let req = DeleteUserRequest {
            name: name.to_string(),
        };
        let _: DeleteUserResponse = self.call("DeleteUser", req).await?;
        Ok(())
    }

    pub async fn rename_user(&self, old_name: &str, new_name: &str) -> Result<User, ConnectionError> {
        let req = RenameUserRequest {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        };
        let resp: UserResponse = self.call("RenameUser", req).await?;
        resp.user.ok_or_else(|| missing("RenameUser", "user"))
    }

    // Routes

    pub async fn list_routes(&self) -> Result<Vec<Route>, ConnectionError> {
        let resp: RoutesResponse = self.call("GetRoutes", GetRoutesRequest {}).await?;
        Ok(resp.routes)
    }

    pub async fn enable_route(&self, route_id: u64) -> Result<(), ConnectionError> {
        let _: Empty = self.call("EnableRoute", RouteIdRequest { route_id }).await?;
        Ok(())
    }

    pub async fn disable_route(&self, route_id: u64) -> Result<(), ConnectionError> {
        let _: Empty = self.call("DisableRoute", RouteIdRequest { route_id }).await?;
        Ok(())
    }

    pub async fn delete_route(&self, route_id: u64) -> Result<(), ConnectionError> {
        let _: Empty = self.call("DeleteRoute", RouteIdRequest { route_id }).await?;
        Ok(())
    }

    pub async fn node_routes(&self, node_id: u64) -> Result<Vec<Route>, ConnectionError> {
        let resp: RoutesResponse = self.call("GetNodeRoutes", NodeIdRequest { node_id }).await?;
        Ok(resp.routes)
    }

    // Nodes

    /// All nodes, or only those of `user` when given.
    pub async fn list_nodes(&self, user: Option<&str>) -> Result<Vec<Node>, ConnectionError> {
        let req = ListNodesRequest {
            user: user.unwrap_or_default().to_string(),
        };
        let resp: ListNodesResponse = self.call("ListNodes", req).await?;
        Ok(resp.nodes)
    }

    pub async fn get_node(&self, node_id: u64) -> Result<Node, ConnectionError> {
        let resp: NodeResponse = self.call("GetNode", NodeIdRequest { node_id }).await?;
        resp.node.ok_or_else(|| missing("GetNode", "node"))
    }

    /// Resolve a node by id from the full listing.
    pub async fn find_node(&self, node_id: u64) -> Result<Option<Node>, ConnectionError> {
        let nodes = self.list_nodes(None).await?;
        Ok(find_node(&nodes, node_id).cloned())
    }

    pub async fn expire_node(&self, node_id: u64) -> Result<Node, ConnectionError> {
        let resp: NodeResponse = self.call("ExpireNode", NodeIdRequest { node_id }).await?;
        resp.node.ok_or_else(|| missing("ExpireNode", "node"))
    }

    pub async fn rename_node(&self, node_id: u64, new_name: &str) -> Result<Node, ConnectionError> {
        let req = RenameNodeRequest {
            node_id,
            new_name: new_name.to_string(),
        };
        let resp: NodeResponse = self.call("RenameNode", req).await?;
        resp.node.ok_or_else(|| missing("RenameNode", "node"))
    }

    pub async fn move_node(&self, node_id: u64, user: &str) -> Result<Node, ConnectionError> {
        let req = MoveNodeRequest {
            node_id,
            user: user.to_string(),
        };
        let resp: NodeResponse = self.call("MoveNode", req).await?;
        resp.node.ok_or_else(|| missing("MoveNode", "node"))
    }

    pub async fn delete_node(&self, node_id: u64) -> Result<(), ConnectionError> {
        let _: DeleteNodeResponse = self.call("DeleteNode", NodeIdRequest { node_id }).await?;
        Ok(())
    }

    pub async fn register_node(&self, user: &str, key: &str) -> Result<Node, ConnectionError> {
        let req = RegisterNodeRequest {
            user: user.to_string(),
            key: key.to_string(),
        };
        let resp: NodeResponse = self.call("RegisterNode", req).await?;
        resp.node.ok_or_else(|| missing("RegisterNode", "node"))
    }

    pub async fn set_tags(&self, node_id: u64, tags: Vec<String>) -> Result<Node, ConnectionError> {
        let resp: NodeResponse = self.call("SetTags", SetTagsRequest { node_id, tags }).await?;
        resp.node.ok_or_else(|| missing("SetTags", "node"))
    }
}

fn missing(method: &'static str, field: &str) -> ConnectionError {
    ConnectionError::Rpc {
        method,
        status: Status::internal(format!("response is missing `{}`", field)),
    }
}
