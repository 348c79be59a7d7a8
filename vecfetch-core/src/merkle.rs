use std::fs::File;
use std::path::Path;

use blake3::Hash;
use memmap2::Mmap;
use rayon::prelude::*;

use crate::chunking::ChunkLayout;
use crate::error::{IoContext, Result, VecfetchError};

/// Hash used for leaf slots past the last real chunk.
pub fn padding_hash() -> Hash {
    blake3::hash(&[])
}

pub fn leaf_hash(bytes: &[u8]) -> Hash {
    blake3::hash(bytes)
}

pub(crate) fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut cat = [0u8; 64];
    cat[..32].copy_from_slice(left.as_bytes());
    cat[32..].copy_from_slice(right.as_bytes());
    blake3::hash(&cat)
}

/// Binary hash tree over the chunk hashes of one file.
///
/// Nodes live in heap order: node `i` has children `2i + 1` and `2i + 2`,
/// the root is node 0 and the leaves start at `capacity - 1`. The leaf row is
/// padded up to a power of two with [`padding_hash`], so the shape depends on
/// the chunk count alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleTree {
    layout: ChunkLayout,
    nodes: Vec<Hash>,
}

impl MerkleTree {
    pub fn build(layout: ChunkLayout, leaves: Vec<Hash>) -> Result<Self> {
        if leaves.len() != layout.chunk_count() as usize {
            return Err(VecfetchError::TreeMismatch {
                expected: format!("{} leaves", layout.chunk_count()),
                found: format!("{} leaves", leaves.len()),
            });
        }
        let cap = leaf_capacity(layout.chunk_count());
        let offset = cap - 1;
        let pad = padding_hash();
        let mut nodes = vec![pad; 2 * cap - 1];
        for (i, h) in leaves.into_iter().enumerate() {
            nodes[offset + i] = h;
        }
        for i in (0..offset).rev() {
            nodes[i] = node_hash(&nodes[2 * i + 1], &nodes[2 * i + 2]);
        }
        Ok(Self { layout, nodes })
    }

    /// Hash every chunk of a fully present local file.
    pub fn from_file(path: &Path, chunk_size: u32) -> Result<Self> {
        let f = File::open(path).ctx(|| format!("open {}", path.display()))?;
        let len = f.metadata().ctx(|| format!("stat {}", path.display()))?.len();
        let layout = ChunkLayout::new(len, chunk_size)?;
        if len == 0 {
            return Self::build(layout, Vec::new());
        }
        // The file is only read; concurrent truncation is the caller's problem.
        let mmap = unsafe { Mmap::map(&f) }.ctx(|| format!("mmap {}", path.display()))?;
        let leaves: Vec<Hash> = (0..layout.chunk_count())
            .into_par_iter()
            .map(|i| {
                let start = i as usize * layout.chunk_size() as usize;
                let end = (start + layout.chunk_size() as usize).min(mmap.len());
                leaf_hash(&mmap[start..end])
            })
            .collect();
        tracing::debug!(path = %path.display(), leaves = leaves.len(), "hashed local file");
        Self::build(layout, leaves)
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn root_hash(&self) -> Hash {
        self.nodes[0]
    }

    pub fn leaf_count(&self) -> u32 {
        self.layout.chunk_count()
    }

    pub fn leaf_hash(&self, index: u32) -> Option<Hash> {
        (index < self.leaf_count()).then(|| self.nodes[self.offset() + index as usize])
    }

    pub fn leaf_hashes(&self) -> &[Hash] {
        let offset = self.offset();
        &self.nodes[offset..offset + self.leaf_count() as usize]
    }

    /// Internal nodes in heap order, root first.
    pub fn internal_nodes(&self) -> &[Hash] {
        &self.nodes[..self.offset()]
    }

    /// Check one chunk's bytes against its own leaf; other leaves are not touched.
    pub fn verify_leaf(&self, index: u32, bytes: &[u8]) -> bool {
        match self.leaf_hash(index) {
            Some(expected) => leaf_hash(bytes) == expected,
            None => false,
        }
    }

    /// Sibling hashes from leaf `index` up to (excluding) the root.
    pub fn audit_path(&self, index: u32) -> Option<Vec<Hash>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut path = Vec::new();
        let mut node = self.offset() + index as usize;
        while node > 0 {
            let sibling = if node % 2 == 1 { node + 1 } else { node - 1 };
            path.push(self.nodes[sibling]);
            node = (node - 1) / 2;
        }
        Some(path)
    }

    /// Leaf indices whose hashes differ between two trees of identical shape.
    pub fn diff(&self, other: &MerkleTree) -> Result<Vec<u32>> {
        if self.layout != other.layout {
            return Err(VecfetchError::TreeMismatch {
                expected: describe(&self.layout),
                found: describe(&other.layout),
            });
        }
        if self.root_hash() == other.root_hash() {
            return Ok(Vec::new());
        }
        Ok(self
            .leaf_hashes()
            .iter()
            .zip(other.leaf_hashes())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i as u32)
            .collect())
    }

    fn offset(&self) -> usize {
        leaf_capacity(self.layout.chunk_count()) - 1
    }
}

/// Recompute the root from a leaf and its audit path.
pub fn verify_path(root: &Hash, index: u32, leaf: &Hash, path: &[Hash]) -> bool {
    let mut acc = *leaf;
    let mut pos = index as u64;
    for sibling in path {
        acc = if pos % 2 == 0 { node_hash(&acc, sibling) } else { node_hash(sibling, &acc) };
        pos /= 2;
    }
    pos == 0 && acc == *root
}

pub(crate) fn leaf_capacity(chunk_count: u32) -> usize {
    (chunk_count as usize).next_power_of_two().max(1)
}

pub(crate) fn describe(layout: &ChunkLayout) -> String {
    format!(
        "total_size={} chunk_size={} leaves={}",
        layout.total_size(),
        layout.chunk_size(),
        layout.chunk_count()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_root_is_the_leaf() {
        let layout = ChunkLayout::new(10, 16).unwrap();
        let t = MerkleTree::build(layout, vec![leaf_hash(b"0123456789")]).unwrap();
        assert_eq!(t.root_hash(), leaf_hash(b"0123456789"));
        assert!(t.internal_nodes().is_empty());
    }

    #[test]
    fn empty_file_root_is_padding() {
        let layout = ChunkLayout::new(0, 16).unwrap();
        let t = MerkleTree::build(layout, Vec::new()).unwrap();
        assert_eq!(t.root_hash(), padding_hash());
    }

    #[test]
    fn three_leaves_pad_to_four() {
        let layout = ChunkLayout::new(30, 10).unwrap();
        let l: Vec<Hash> = [b"a", b"b", b"c"].iter().map(|b| leaf_hash(*b)).collect();
        let t = MerkleTree::build(layout, l.clone()).unwrap();
        let left = node_hash(&l[0], &l[1]);
        let right = node_hash(&l[2], &padding_hash());
        assert_eq!(t.root_hash(), node_hash(&left, &right));
    }
}
