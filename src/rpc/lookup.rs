use super::proto::{Node, User};

/// Find a user by name. The service returns users in no particular order.
pub fn find_user<'a>(users: &'a [User], name: &str) -> Option<&'a User> {
    users.iter().find(|u| u.name == name)
}

/// Find a node by id.
pub fn find_node(nodes: &[Node], id: u64) -> Option<&Node> {
    nodes.iter().find(|n| n.id == id)
}
