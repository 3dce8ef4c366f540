//! Merkle aggregation for batched signatures.
//!
//! A batch of payloads is hashed into a tree with configurable fan-out; the
//! signer signs only the root, and every payload ships with the path needed
//! to rebuild that root. Interior nodes hash the concatenation of their
//! children, leaves hash the payload with a distinct prefix so a leaf can
//! never be confused with an interior node.

use serde::{Deserialize, Serialize};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

fn node_hash(children: &[[u8; 32]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    for child in children {
        hasher.update(child);
    }
    *hasher.finalize().as_bytes()
}

/// One level of a Merkle path: the node's position within its sibling group
/// and the hashes of the other group members, in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathLevel {
    pub position: u32,
    pub siblings: Vec<[u8; 32]>,
}

/// Path from one payload up to the batch root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    pub levels: Vec<PathLevel>,
}

impl MerklePath {
    /// Rebuild the root this path commits `data` to.
    pub fn root_for(&self, data: &[u8]) -> [u8; 32] {
        let mut hash = leaf_hash(data);
        for level in &self.levels {
            let mut children =
                Vec::with_capacity(level.siblings.len() + 1);
            let position = level.position as usize;
            children.extend_from_slice(&level.siblings[..position.min(level.siblings.len())]);
            children.push(hash);
            if position < level.siblings.len() {
                children.extend_from_slice(&level.siblings[position..]);
            }
            hash = node_hash(&children);
        }
        hash
    }
}

/// Builder that hashes a batch and emits one path per payload.
pub struct MerkleTree;

impl MerkleTree {
    /// Hash `payloads` into a tree with `branch_factor` fan-out.
    ///
    /// Returns the root and a path for every payload, in input order. A
    /// single-payload batch degenerates to `root == leaf_hash(payload)` with
    /// an empty path.
    pub fn build(payloads: &[Vec<u8>], branch_factor: usize) -> ([u8; 32], Vec<MerklePath>) {
        assert!(!payloads.is_empty(), "merkle batch cannot be empty");
        let branch = branch_factor.max(2);

        let mut level: Vec<[u8; 32]> = payloads.iter().map(|p| leaf_hash(p)).collect();
        let mut paths: Vec<MerklePath> = (0..payloads.len())
            .map(|_| MerklePath { levels: Vec::new() })
            .collect();
        // Index of the tree node each payload currently hashes up to.
        let mut node_of: Vec<usize> = (0..payloads.len()).collect();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(branch));
            for group in level.chunks(branch) {
                next.push(node_hash(group));
            }
            for (payload_idx, node_idx) in node_of.iter_mut().enumerate() {
                let group_start = (*node_idx / branch) * branch;
                let group_end = (group_start + branch).min(level.len());
                let position = *node_idx - group_start;
                let siblings = level[group_start..group_end]
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != position)
                    .map(|(_, h)| *h)
                    .collect();
                paths[payload_idx].levels.push(PathLevel {
                    position: position as u32,
                    siblings,
                });
                *node_idx /= branch;
            }
            level = next;
        }

        (level[0], paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_path_reaches_the_same_root() {
        let payloads: Vec<Vec<u8>> = (0u8..13).map(|i| vec![i; 8]).collect();
        for branch in [2usize, 3, 4, 8] {
            let (root, paths) = MerkleTree::build(&payloads, branch);
            for (payload, path) in payloads.iter().zip(&paths) {
                assert_eq!(path.root_for(payload), root, "branch factor {branch}");
            }
        }
    }

    #[test]
    fn single_payload_batch_has_empty_path() {
        let payloads = vec![b"only".to_vec()];
        let (root, paths) = MerkleTree::build(&payloads, 4);
        assert!(paths[0].levels.is_empty());
        assert_eq!(paths[0].root_for(b"only"), root);
    }

    #[test]
    fn path_does_not_verify_foreign_payload() {
        let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 4]).collect();
        let (root, paths) = MerkleTree::build(&payloads, 2);
        assert_ne!(paths[0].root_for(&payloads[1]), root);
    }
}
