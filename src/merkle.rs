//! Merkle-indexed secrets for partial fills
//!
//! An order split into `n` parts commits to `n + 1` secrets. Leaf `i` is
//! `keccak256(i_be_u64 ‖ keccak256(secret_i))`, so a secret cannot be
//! presented under another index. The tree is padded with zero leaves to a
//! power of two and internal nodes are `keccak256(left ‖ right)`.

use crate::types::{keccak256, Hash32, Secret, SecretHash};

/// Leaf hash binding the disclosure index to the secret hash
pub fn leaf_hash(index: u32, secret_hash: &SecretHash) -> Hash32 {
    let mut buf = [0u8; 40];
    buf[..8].copy_from_slice(&(index as u64).to_be_bytes());
    buf[8..].copy_from_slice(secret_hash.as_bytes());
    keccak256(&buf)
}

fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    keccak256(&buf)
}

/// Sibling path from a leaf to the root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub index: u32,
    pub siblings: Vec<Hash32>,
}

impl MerkleProof {
    /// Fold the sibling path over `leaf`, using the index bits for ordering
    pub fn recompute_root(&self, leaf: &Hash32) -> Hash32 {
        let mut current = *leaf;
        let mut position = self.index as u64;
        for sibling in &self.siblings {
            current = if position & 1 == 0 {
                node_hash(&current, sibling)
            } else {
                node_hash(sibling, &current)
            };
            position >>= 1;
        }
        current
    }

    pub fn verify(&self, root: &Hash32, leaf: &Hash32) -> bool {
        self.recompute_root(leaf) == *root
    }

    /// Verify that `secret_hash` is committed at this proof's index
    pub fn verify_secret_hash(&self, root: &Hash32, secret_hash: &SecretHash) -> bool {
        self.verify(root, &leaf_hash(self.index, secret_hash))
    }
}

/// Secret set and commitment tree of one order
pub struct MerkleSecretIndex {
    secrets: Vec<Secret>,
    hashes: Vec<SecretHash>,
    /// layers[0] are the padded leaves, the last layer holds the root
    layers: Vec<Vec<Hash32>>,
}

impl MerkleSecretIndex {
    /// Generate `parts_count + 1` fresh secrets and build the tree
    pub fn generate(parts_count: u32) -> Self {
        let secrets = (0..=parts_count).map(|_| Secret::random()).collect();
        Self::build(secrets)
    }

    /// Build the tree over known secrets; `None` for an empty set
    pub fn from_secrets(secrets: Vec<Secret>) -> Option<Self> {
        if secrets.is_empty() {
            return None;
        }
        Some(Self::build(secrets))
    }

    fn build(secrets: Vec<Secret>) -> Self {
        let hashes: Vec<SecretHash> = secrets.iter().map(Secret::hash).collect();
        let mut leaves: Vec<Hash32> = hashes
            .iter()
            .enumerate()
            .map(|(i, h)| leaf_hash(i as u32, h))
            .collect();
        leaves.resize(leaves.len().next_power_of_two(), Hash32::ZERO);

        let mut layers = vec![leaves];
        while layers.last().map(|l| l.len()).unwrap_or(0) > 1 {
            let next = layers
                .last()
                .map(|layer| {
                    layer
                        .chunks(2)
                        .map(|pair| node_hash(&pair[0], &pair[1]))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            layers.push(next);
        }

        Self {
            secrets,
            hashes,
            layers,
        }
    }

    pub fn root(&self) -> Hash32 {
        self.layers
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or(Hash32::ZERO)
    }

    /// Number of secrets (`parts_count + 1`)
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn parts_count(&self) -> u32 {
        (self.secrets.len() - 1) as u32
    }

    pub fn secret(&self, index: u32) -> Option<&Secret> {
        self.secrets.get(index as usize)
    }

    pub fn secret_hash(&self, index: u32) -> Option<SecretHash> {
        self.hashes.get(index as usize).copied()
    }

    pub fn leaf(&self, index: u32) -> Option<Hash32> {
        self.secret_hash(index).map(|h| leaf_hash(index, &h))
    }

    pub fn proof(&self, index: u32) -> Option<MerkleProof> {
        if index as usize >= self.secrets.len() {
            return None;
        }
        let mut position = index as usize;
        let mut siblings = Vec::with_capacity(self.layers.len().saturating_sub(1));
        for layer in &self.layers[..self.layers.len() - 1] {
            siblings.push(layer[position ^ 1]);
            position >>= 1;
        }
        Some(MerkleProof { index, siblings })
    }
}

/// Canonical disclosure index for a fill.
///
/// Maps the cumulative filled fraction after this fill onto `[0, parts]` with
/// ceiling rounding, so a fill never discloses less than the value it moves.
/// The complete fill lands on the last secret.
pub fn expected_index(total_amount: u64, remaining_amount: u64, fill_amount: u64, parts_count: u32) -> u32 {
    if total_amount == 0 {
        return 0;
    }
    let current_filled = total_amount.saturating_sub(remaining_amount) as u128;
    let new_filled = current_filled + fill_amount as u128;
    let numerator = new_filled * (parts_count as u128 + 1);
    let denominator = total_amount as u128;
    let index = (numerator + denominator - 1) / denominator;
    index.min(parts_count as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_secrets(n: u8) -> Vec<Secret> {
        (0..n).map(|i| Secret([i.wrapping_add(1); 32])).collect()
    }

    #[test]
    fn test_generate_sizes() {
        let index = MerkleSecretIndex::generate(10);
        assert_eq!(index.len(), 11);
        assert_eq!(index.parts_count(), 10);
        assert!(index.secret(10).is_some());
        assert!(index.secret(11).is_none());
        assert_ne!(index.secret(0), index.secret(1));
    }

    #[test]
    fn test_every_proof_verifies() {
        for n in 1..=9u8 {
            let index = MerkleSecretIndex::from_secrets(fixed_secrets(n)).unwrap();
            let root = index.root();
            for i in 0..n as u32 {
                let proof = index.proof(i).unwrap();
                let leaf = index.leaf(i).unwrap();
                assert!(proof.verify(&root, &leaf), "n={} i={}", n, i);
                let hash = index.secret(i).unwrap().hash();
                assert!(proof.verify_secret_hash(&root, &hash));
            }
            assert!(index.proof(n as u32).is_none());
        }
    }

    #[test]
    fn test_mismatched_pairs_fail() {
        let index = MerkleSecretIndex::generate(4);
        let root = index.root();
        for i in 0..5u32 {
            for j in 0..5u32 {
                if i == j {
                    continue;
                }
                let proof = index.proof(i).unwrap();
                let other_leaf = index.leaf(j).unwrap();
                assert!(!proof.verify(&root, &other_leaf));
            }
        }
    }

    #[test]
    fn test_index_substitution_rejected() {
        let index = MerkleSecretIndex::generate(3);
        let root = index.root();
        let hash_of_two = index.secret_hash(2).unwrap();
        let mut proof = index.proof(2).unwrap();
        assert!(proof.verify_secret_hash(&root, &hash_of_two));
        // Same sibling path, different claimed index
        proof.index = 3;
        assert!(!proof.verify_secret_hash(&root, &hash_of_two));
    }

    #[test]
    fn test_single_secret_tree() {
        assert!(MerkleSecretIndex::from_secrets(Vec::new()).is_none());

        let index = MerkleSecretIndex::from_secrets(fixed_secrets(1)).unwrap();
        let proof = index.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert_eq!(index.root(), index.leaf(0).unwrap());
    }

    #[test]
    fn test_expected_index_boundaries() {
        let t = 100_000_000;
        assert_eq!(expected_index(t, t, t, 10), 10);
        assert_eq!(expected_index(t, t, 0, 10), 0);
        assert_eq!(expected_index(t, t, t, 0), 0);
        assert_eq!(expected_index(0, 0, 0, 4), 0);
    }

    #[test]
    fn test_expected_index_partial_fill_scenario() {
        let t = 100_000_000;
        // ceil(10_000_000 * 11 / 100_000_000) = ceil(1.1) = 2
        assert_eq!(expected_index(t, t, 10_000_000, 10), 2);
        // ceil(20_000_000 * 11 / 100_000_000) = ceil(2.2) = 3
        assert_eq!(expected_index(t, 90_000_000, 10_000_000, 10), 3);
    }

    #[test]
    fn test_expected_index_non_decreasing_over_fill_sequences() {
        let total = 1_000_003u64;
        for parts in [1u32, 2, 3, 7, 10, 32] {
            for step in [13u64, 999, 100_000, 333_334] {
                let mut remaining = total;
                let mut last = 0u32;
                while remaining > 0 {
                    let fill = step.min(remaining);
                    let idx = expected_index(total, remaining, fill, parts);
                    assert!(idx >= last);
                    assert!(idx <= parts);
                    last = idx;
                    remaining -= fill;
                }
                assert_eq!(last, parts);
            }
        }
    }
}
