use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, VecfetchError};
use crate::local::LocalFile;
use crate::merkle::MerkleTree;
use crate::reader::VerifiedRandomAccess;
use crate::sidecar::sidecar_paths;
use crate::source::DatasetEntry;
use crate::state::ChunkStateStore;
use crate::transfer::{ProgressHandle, TransferCoordinator};

/// One dataset file cached at a local path, together with its `.mref` tree
/// and `.mrkl` state sidecars.
///
/// Opening resumes whatever a previous session left behind: the data file
/// and the state sidecar must either both exist or both be absent. The data
/// file stays exclusively locked while the cache is open.
pub struct DatasetCache {
    entry: DatasetEntry,
    data_path: PathBuf,
    tree: Arc<MerkleTree>,
    state: Arc<ChunkStateStore>,
    local: Arc<LocalFile>,
    config: Config,
}

impl DatasetCache {
    pub fn open(entry: DatasetEntry, data_path: &Path, config: Config) -> Result<Self> {
        config.transfer.validate()?;
        let (tree_path, state_path) = sidecar_paths(data_path);
        let (data_exists, state_exists) = (data_path.exists(), state_path.exists());
        if data_exists != state_exists {
            return Err(VecfetchError::InvalidConfiguration(format!(
                "{} and {} must both exist or both be absent",
                data_path.display(),
                state_path.display()
            )));
        }

        let tree = if tree_path.exists() {
            MerkleTree::load(&tree_path)?
        } else {
            let tree = entry.manifest_tree().ok_or_else(|| {
                VecfetchError::InvalidConfiguration(format!(
                    "no tree at {} and no manifest for {}",
                    tree_path.display(),
                    entry.remote_url
                ))
            })??;
            tree.save(&tree_path)?;
            tree
        };
        if tree.layout().total_size() != entry.total_size() {
            return Err(VecfetchError::TreeMismatch {
                expected: format!("total_size={}", entry.total_size()),
                found: format!("total_size={} in {}", tree.layout().total_size(), tree_path.display()),
            });
        }
        if let Some(root) = entry.published_root() {
            if root != tree.root_hash() {
                return Err(VecfetchError::TreeMismatch {
                    expected: root.to_hex().to_string(),
                    found: tree.root_hash().to_hex().to_string(),
                });
            }
        }

        let mut local = LocalFile::open(data_path, entry.total_size())?;
        local.lock_exclusive()?;
        let state = ChunkStateStore::open_or_create(&state_path, tree.leaf_count())?;
        tracing::info!(
            path = %data_path.display(),
            chunks = tree.leaf_count(),
            verified = state.verified_count(),
            root = %tree.root_hash().to_hex(),
            "opened dataset cache"
        );
        Ok(Self {
            entry,
            data_path: data_path.to_path_buf(),
            tree: Arc::new(tree),
            state: Arc::new(state),
            local: Arc::new(local),
            config,
        })
    }

    pub fn entry(&self) -> &DatasetEntry {
        &self.entry
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn tree(&self) -> &Arc<MerkleTree> {
        &self.tree
    }

    pub fn state(&self) -> &Arc<ChunkStateStore> {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Start fetching every chunk not yet verified.
    pub fn download(&self) -> Result<ProgressHandle> {
        TransferCoordinator::new(self.config.transfer.clone())?.download(
            &self.entry,
            self.tree.clone(),
            self.state.clone(),
            self.local.clone(),
        )
    }

    pub fn reader(&self) -> Result<VerifiedRandomAccess> {
        VerifiedRandomAccess::new(
            &self.entry,
            self.tree.clone(),
            self.state.clone(),
            self.local.clone(),
            self.config.transfer.clone(),
            self.config.reader.clone(),
        )
    }
}

impl Drop for DatasetCache {
    fn drop(&mut self) {
        if let Err(e) = self.state.persist() {
            tracing::warn!(path = %self.data_path.display(), error = %e, "failed to persist chunk state");
        }
    }
}
