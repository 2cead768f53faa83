use crate::*;

/// Which side of the current node a proof sibling sits on
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// One step of a merkle proof path
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProofNode {
    pub side: Side,
    pub hash: String,
}

/// Sibling-hash path proving a leaf's membership in a tree. Valid only
/// against the root of the tree it was derived from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub root: String,
    pub path: Vec<ProofNode>,
    pub leaf: String,
    pub index: usize,
}

impl MerkleProof {
    /// Fold the proof path and compare against `root`. Pure; never errors.
    pub fn verify(&self, root: &str) -> bool {
        let mut hash = normalize_leaf(&self.leaf);

        for node in &self.path {
            hash = match node.side {
                Side::Left => sha256_hex(format!("{}{}", node.hash, hash).as_bytes()),
                Side::Right => sha256_hex(format!("{}{}", hash, node.hash).as_bytes()),
            };
        }

        hash == root
    }
}

/// Binary hash tree over an ordered batch of vote hashes.
///
/// Construction is a pure function of the ordered input sequence. The tree
/// is immutable once built; a changed batch needs a new tree.
///
/// An odd trailing node is promoted unchanged to the next layer, and leaf
/// hashes are not domain-separated from internal-node hashes. This is a
/// known-weak construction kept for compatibility with already-anchored
/// roots; do not strengthen it without a migration plan for those roots.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    leaves: Vec<String>,
    layers: Vec<Vec<String>>,
}

/// Hash anything that is not already a 64-char digest into leaf form
pub fn normalize_leaf(leaf: &str) -> String {
    if leaf.len() == 64 {
        leaf.to_string()
    } else {
        sha256_hex(leaf.as_bytes())
    }
}

impl MerkleTree {
    /// Build a tree from a fixed, ordered batch. Inputs not already in hash
    /// form are hashed first.
    pub fn build(input: &[String]) -> Result<Self, Error> {
        if input.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let leaves: Vec<String> = input.iter().map(|leaf| normalize_leaf(leaf)).collect();

        let mut layers = vec![leaves.clone()];
        let mut current = leaves.clone();

        while current.len() > 1 {
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            for pair in current.chunks(2) {
                if pair.len() == 2 {
                    next.push(sha256_hex(format!("{}{}", pair[0], pair[1]).as_bytes()));
                } else {
                    // Odd trailing node is promoted unchanged
                    next.push(pair[0].clone());
                }
            }
            layers.push(next.clone());
            current = next;
        }

        Ok(MerkleTree { leaves, layers })
    }

    /// The root commitment to the whole batch. A single-leaf tree has root
    /// equal to that leaf's hash.
    pub fn root(&self) -> &str {
        // build() guarantees a non-empty final layer
        &self.layers[self.layers.len() - 1][0]
    }

    pub fn leaves(&self) -> &[String] {
        &self.leaves
    }

    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Walk from the leaf's layer-0 index to the root, recording each
    /// sibling and its side. Returns None if the leaf is not in the tree.
    pub fn proof(&self, leaf: &str) -> Option<MerkleProof> {
        let hash = normalize_leaf(leaf);
        let leaf_index = self.leaves.iter().position(|l| *l == hash)?;

        let mut path = Vec::new();
        let mut index = leaf_index;

        for layer in &self.layers[..self.layers.len() - 1] {
            let (sibling_index, side) = if index % 2 == 0 {
                (index + 1, Side::Right)
            } else {
                (index - 1, Side::Left)
            };

            // A promoted odd node has no sibling at this layer
            if sibling_index < layer.len() {
                path.push(ProofNode {
                    side,
                    hash: layer[sibling_index].clone(),
                });
            }

            index /= 2;
        }

        Some(MerkleProof {
            root: self.root().to_string(),
            path,
            leaf: hash,
            index: leaf_index,
        })
    }
}
