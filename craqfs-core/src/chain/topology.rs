use crate::error::{CraqError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Head,
    Middle,
    Tail,
    /// Single-node chain: the node is both head and tail.
    Sole,
}

impl NodeRole {
    pub fn is_head(self) -> bool {
        matches!(self, Self::Head | Self::Sole)
    }

    pub fn is_tail(self) -> bool {
        matches!(self, Self::Tail | Self::Sole)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    pub node_id: String,
    pub address: String,
    pub role: NodeRole,
}

/// Ordered chain membership. Position 0 is the head, the last position is
/// the tail; next/prev are plain index arithmetic.
#[derive(Debug, Clone)]
pub struct ChainTopology {
    chain_length: usize,
    nodes: Vec<ChainNode>,
}

impl ChainTopology {
    pub fn new(chain_length: usize) -> Self {
        Self {
            chain_length,
            nodes: Vec::with_capacity(chain_length),
        }
    }

    pub fn push(&mut self, node_id: &str, address: &str) -> Result<()> {
        if self.nodes.len() >= self.chain_length {
            return Err(CraqError::ChainFull(self.chain_length));
        }

        if node_id.trim().is_empty() {
            return Err(CraqError::Validation("node id cannot be empty".to_string()));
        }

        if self.position(node_id).is_some() {
            return Err(CraqError::Validation(format!(
                "node {} is already part of the chain",
                node_id
            )));
        }

        self.nodes.push(ChainNode {
            node_id: node_id.to_string(),
            address: address.to_string(),
            role: NodeRole::Tail,
        });
        self.recompute_roles();
        Ok(())
    }

    fn recompute_roles(&mut self) {
        let last = self.nodes.len().saturating_sub(1);
        for (index, node) in self.nodes.iter_mut().enumerate() {
            node.role = match (index == 0, index == last) {
                (true, true) => NodeRole::Sole,
                (true, false) => NodeRole::Head,
                (false, true) => NodeRole::Tail,
                (false, false) => NodeRole::Middle,
            };
        }
    }

    pub fn chain_length(&self) -> usize {
        self.chain_length
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ChainNode] {
        &self.nodes
    }

    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.node_id == node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&ChainNode> {
        self.nodes.iter().find(|node| node.node_id == node_id)
    }

    pub fn head(&self) -> Option<&ChainNode> {
        self.nodes.first()
    }

    pub fn tail(&self) -> Option<&ChainNode> {
        self.nodes.last()
    }

    pub fn successor(&self, node_id: &str) -> Option<&ChainNode> {
        let index = self.position(node_id)?;
        self.nodes.get(index + 1)
    }

    pub fn predecessor(&self, node_id: &str) -> Option<&ChainNode> {
        let index = self.position(node_id)?;
        index.checked_sub(1).and_then(|prev| self.nodes.get(prev))
    }
}
