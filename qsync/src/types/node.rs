use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{ErrorKind, SyncError};

/// Position of a node in the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Origin of the changes. Its tables can be locked directly.
    Root,
    /// Relays changes received from an upstream node.
    Branch,
    /// End of a cascade. Like a branch, it only sees relayed changes.
    Leaf,
}

impl NodeType {
    /// Returns `true` if the node originates changes itself.
    pub fn is_root(&self) -> bool {
        matches!(self, NodeType::Root)
    }
}

impl FromStr for NodeType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(NodeType::Root),
            "branch" => Ok(NodeType::Branch),
            "leaf" => Ok(NodeType::Leaf),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown node type",
                format!("node type '{other}' is not one of root, branch, leaf")
            ),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Root => write!(f, "root"),
            NodeType::Branch => write!(f, "branch"),
            NodeType::Leaf => write!(f, "leaf"),
        }
    }
}

/// Metadata of a node for a given queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_name: String,
    pub node_type: NodeType,
    /// Name of the worker pulling changes from the upstream node, absent on roots.
    pub worker_name: Option<String>,
    /// Connection string of this node's provider, absent on roots.
    pub provider_location: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("root".parse::<NodeType>().unwrap(), NodeType::Root);
        assert_eq!("branch".parse::<NodeType>().unwrap(), NodeType::Branch);
        assert_eq!("leaf".parse::<NodeType>().unwrap(), NodeType::Leaf);

        let err = "combined-root".parse::<NodeType>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
