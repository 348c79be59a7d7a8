use std::path::Path;

use crate::error::{Result, VecfetchError};
use crate::merkle::{self, MerkleTree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub chunks_ok: u64,
    pub chunks_bad: u64,
    pub bad_indices: Vec<u32>,
    pub root_ok: bool,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.chunks_bad == 0 && self.root_ok
    }
}

/// Re-hash every chunk of the file at `path` against `tree`, independent of
/// any state sidecar.
pub fn verify_local(tree: &MerkleTree, path: &Path) -> Result<VerifyReport> {
    let layout = tree.layout();
    let local = MerkleTree::from_file(path, layout.chunk_size())?;
    if local.layout() != layout {
        return Err(VecfetchError::TreeMismatch {
            expected: merkle::describe(layout),
            found: format!("{} ({})", merkle::describe(local.layout()), path.display()),
        });
    }
    let bad_indices = tree.diff(&local)?;
    let chunks_bad = bad_indices.len() as u64;
    let report = VerifyReport {
        chunks_ok: u64::from(layout.chunk_count()) - chunks_bad,
        chunks_bad,
        bad_indices,
        root_ok: local.root_hash() == tree.root_hash(),
    };
    if !report.is_clean() {
        tracing::warn!(path = %path.display(), bad = report.chunks_bad, "local file does not match tree");
    }
    Ok(report)
}
