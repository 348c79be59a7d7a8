use std::fs::File;
use std::io::Write;
use std::path::Path;

use blake3::Hash;
use serde::{Deserialize, Serialize};

use crate::chunking::ChunkLayout;
use crate::error::{IoContext, Result, VecfetchError};
use crate::merkle::MerkleTree;

/// JSON form of a published tree: enough to rebuild it and check the root.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LeafManifest {
    pub created_utc: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub root_hex: String,
    pub leaves_hex: Vec<String>,
}

impl LeafManifest {
    pub fn from_tree(tree: &MerkleTree) -> Self {
        Self {
            created_utc: chrono::Utc::now().to_rfc3339(),
            total_size: tree.layout().total_size(),
            chunk_size: tree.layout().chunk_size(),
            root_hex: tree.root_hash().to_hex().to_string(),
            leaves_hex: tree.leaf_hashes().iter().map(|h| h.to_hex().to_string()).collect(),
        }
    }

    /// Rebuild the tree and insist the recomputed root matches `root_hex`.
    pub fn to_tree(&self) -> Result<MerkleTree> {
        let layout = ChunkLayout::new(self.total_size, self.chunk_size)?;
        let leaves = self
            .leaves_hex
            .iter()
            .enumerate()
            .map(|(i, hex)| {
                Hash::from_hex(hex)
                    .map_err(|e| VecfetchError::Format(format!("manifest leaf {i}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let tree = MerkleTree::build(layout, leaves)?;
        let root = tree.root_hash().to_hex().to_string();
        if root != self.root_hex {
            return Err(VecfetchError::TreeMismatch { expected: self.root_hex.clone(), found: root });
        }
        Ok(tree)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let f = File::open(path).ctx(|| format!("open {}", path.display()))?;
        serde_json::from_reader(f)
            .map_err(|e| VecfetchError::Format(format!("{}: {e}", path.display())))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VecfetchError::Format(format!("encode manifest: {e}")))?;
        let mut f = File::create(path).ctx(|| format!("create {}", path.display()))?;
        f.write_all(json.as_bytes()).ctx(|| format!("write {}", path.display()))
    }
}
