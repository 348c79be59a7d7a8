use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use blake3::Hash;
use crc32fast::Hasher as Crc32;

use crate::chunking::ChunkLayout;
use crate::error::{IoContext, Result, VecfetchError};
use crate::merkle::{self, leaf_capacity, MerkleTree};

/// Tree sidecar layout (little endian):
/// magic (8) + NUL (1) + version (u32) + total_size (u64) + chunk_size (u32)
/// + leaf_count (u32) + flags (u32) + leaves (32 each)
/// + [internal nodes (32 each)] + crc32 (u32)
const TREE_MAGIC: &[u8; 8] = b"VFMREF01";
const TREE_HEADER_LEN: usize = 8 + 1 + 4 + 8 + 4 + 4 + 4;
/// Version 1: leaf row padded with BLAKE3("") up to a power of two.
pub const TREE_FORMAT_VERSION: u32 = 1;
const FLAG_INTERNAL_NODES: u32 = 1;

pub const TREE_SUFFIX: &str = "mref";
pub const STATE_SUFFIX: &str = "mrkl";

/// `<data>.mref` and `<data>.mrkl` next to the data file.
pub fn sidecar_paths(data_path: &Path) -> (PathBuf, PathBuf) {
    (with_suffix(data_path, TREE_SUFFIX), with_suffix(data_path, STATE_SUFFIX))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

impl MerkleTree {
    /// Compact form: header and leaf hashes only.
    pub fn serialize(&self) -> Vec<u8> {
        self.encode(false)
    }

    /// Includes the internal nodes so loaders can skip recomputation checks.
    pub fn serialize_full(&self) -> Vec<u8> {
        self.encode(true)
    }

    fn encode(&self, with_internal: bool) -> Vec<u8> {
        let layout = self.layout();
        let internal: &[Hash] = if with_internal { self.internal_nodes() } else { &[] };
        let mut buf = Vec::with_capacity(
            TREE_HEADER_LEN + 32 * (self.leaf_count() as usize + internal.len()) + 4,
        );
        buf.extend_from_slice(TREE_MAGIC);
        buf.push(0);
        buf.extend_from_slice(&TREE_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&layout.total_size().to_le_bytes());
        buf.extend_from_slice(&layout.chunk_size().to_le_bytes());
        buf.extend_from_slice(&layout.chunk_count().to_le_bytes());
        let flags = if with_internal { FLAG_INTERNAL_NODES } else { 0 };
        buf.extend_from_slice(&flags.to_le_bytes());
        for h in self.leaf_hashes() {
            buf.extend_from_slice(h.as_bytes());
        }
        for h in internal {
            buf.extend_from_slice(h.as_bytes());
        }
        let mut crc = Crc32::new();
        crc.update(&buf);
        buf.extend_from_slice(&crc.finalize().to_le_bytes());
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let body = check_crc(bytes, TREE_HEADER_LEN, "tree")?;
        let mut r = Cursor::new(body);
        if r.take(8)? != TREE_MAGIC || r.take(1)?[0] != 0 {
            return Err(VecfetchError::Format("bad tree magic".into()));
        }
        let version = r.u32()?;
        if version != TREE_FORMAT_VERSION {
            return Err(VecfetchError::Format(format!("unsupported tree version {version}")));
        }
        let total_size = r.u64()?;
        let chunk_size = r.u32()?;
        let leaf_count = r.u32()?;
        let flags = r.u32()?;
        let layout = ChunkLayout::new(total_size, chunk_size)
            .map_err(|e| VecfetchError::Format(format!("tree header: {e}")))?;
        if layout.chunk_count() != leaf_count {
            return Err(VecfetchError::Format(format!(
                "leaf count {leaf_count} disagrees with {}",
                merkle::describe(&layout)
            )));
        }
        // Header fields size every allocation below; the body must already hold them.
        let hashes = u64::from(leaf_count)
            + if flags & FLAG_INTERNAL_NODES != 0 { leaf_capacity(leaf_count) as u64 - 1 } else { 0 };
        let expected = hashes.checked_mul(32).and_then(|n| n.checked_add(TREE_HEADER_LEN as u64));
        if expected != Some(body.len() as u64) {
            return Err(VecfetchError::Format(format!(
                "tree body is {} bytes, header promises {hashes} hashes",
                body.len()
            )));
        }
        let mut leaves = Vec::with_capacity(leaf_count as usize);
        for _ in 0..leaf_count {
            leaves.push(r.hash()?);
        }
        let tree = MerkleTree::build(layout, leaves)?;
        if flags & FLAG_INTERNAL_NODES != 0 {
            for (i, computed) in tree.internal_nodes().iter().enumerate() {
                if r.hash()? != *computed {
                    return Err(VecfetchError::Format(format!(
                        "stored internal node {i} disagrees with its children"
                    )));
                }
            }
        }
        if !r.is_empty() {
            return Err(VecfetchError::Format("trailing bytes after tree".into()));
        }
        Ok(tree)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.serialize())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).ctx(|| format!("read {}", path.display()))?;
        Self::deserialize(&bytes)
    }

    /// Load a persisted tree and insist it describes `layout`.
    pub fn load_for(path: &Path, layout: &ChunkLayout) -> Result<Self> {
        let tree = Self::load(path)?;
        if tree.layout() != layout {
            return Err(VecfetchError::TreeMismatch {
                expected: merkle::describe(layout),
                found: merkle::describe(tree.layout()),
            });
        }
        Ok(tree)
    }
}

/// Write to a sibling temp file, fsync, then rename over `path` so readers
/// only ever see the old or the new content.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = with_suffix(path, "tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .ctx(|| format!("create {}", tmp.display()))?;
        f.write_all(bytes).ctx(|| format!("write {}", tmp.display()))?;
        f.sync_all().ctx(|| format!("sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).ctx(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        // Directory fsync makes the rename durable on POSIX; not supported elsewhere.
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            tracing::debug!(dir = %dir.display(), error = %e, "directory fsync unsupported");
        }
    }
    Ok(())
}

/// Validate the CRC32 trailer and return the body it covers.
pub(crate) fn check_crc<'a>(bytes: &'a [u8], min_body: usize, what: &str) -> Result<&'a [u8]> {
    if bytes.len() < min_body + 4 {
        return Err(VecfetchError::Format(format!("{what} sidecar too short")));
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let mut crc4 = [0u8; 4];
    crc4.copy_from_slice(tail);
    let mut h = Crc32::new();
    h.update(body);
    if h.finalize() != u32::from_le_bytes(crc4) {
        return Err(VecfetchError::Format(format!("{what} sidecar CRC mismatch")));
    }
    Ok(body)
}

pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(VecfetchError::Format("truncated sidecar".into()));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn hash(&mut self) -> Result<Hash> {
        let mut b = [0u8; 32];
        b.copy_from_slice(self.take(32)?);
        Ok(Hash::from(b))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
