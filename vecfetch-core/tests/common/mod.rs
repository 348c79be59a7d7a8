#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vecfetch_core::merkle::leaf_hash;
use vecfetch_core::{
    ByteRange, ChunkLayout, ChunkStateStore, DatasetEntry, FetchError, LocalFile, MerkleTree,
    RangeSource, TransferConfig,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic pseudo-random bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf);
    buf
}

pub fn tree_for(data: &[u8], chunk_size: u32) -> MerkleTree {
    let layout = ChunkLayout::new(data.len() as u64, chunk_size).unwrap();
    let leaves = layout.chunks().map(|c| leaf_hash(&data[c.range.start() as usize..c.range.end() as usize])).collect();
    MerkleTree::build(layout, leaves).unwrap()
}

/// Retries without real sleeps.
pub fn fast_config() -> TransferConfig {
    TransferConfig { backoff_base_ms: 1, backoff_max_ms: 2, fetch_timeout_ms: 1_000, ..Default::default() }
}

enum Fault {
    Corrupt,
    Fail(FetchError),
}

/// In-memory "remote" with per-range fetch counters and scripted faults.
pub struct MemorySource {
    data: Vec<u8>,
    delay: Duration,
    fetches: AtomicU64,
    per_start: Mutex<HashMap<u64, u64>>,
    faults: Mutex<HashMap<u64, Vec<Fault>>>,
    sticky: Mutex<HashMap<u64, FetchError>>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            delay: Duration::ZERO,
            fetches: AtomicU64::new(0),
            per_start: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Flip a byte in the next `n` responses for the range starting at `start`.
    pub fn corrupt_next(&self, start: u64, n: usize) {
        let mut f = self.faults.lock().unwrap();
        let q = f.entry(start).or_default();
        q.extend((0..n).map(|_| Fault::Corrupt));
    }

    pub fn fail_next(&self, start: u64, err: FetchError) {
        self.faults.lock().unwrap().entry(start).or_default().push(Fault::Fail(err));
    }

    pub fn fail_always(&self, start: u64, err: FetchError) {
        self.sticky.lock().unwrap().insert(start, err);
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetches_at(&self, start: u64) -> u64 {
        self.per_start.lock().unwrap().get(&start).copied().unwrap_or(0)
    }
}

impl RangeSource for MemorySource {
    fn fetch_range(&self, range: ByteRange, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.per_start.lock().unwrap().entry(range.start()).or_default() += 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if let Some(e) = self.sticky.lock().unwrap().get(&range.start()) {
            return Err(e.clone());
        }
        let fault = {
            let mut f = self.faults.lock().unwrap();
            f.get_mut(&range.start()).and_then(|q| if q.is_empty() { None } else { Some(q.remove(0)) })
        };
        let end = (range.end() as usize).min(self.data.len());
        let mut bytes = self.data[range.start() as usize..end].to_vec();
        match fault {
            Some(Fault::Fail(e)) => Err(e),
            Some(Fault::Corrupt) => {
                bytes[0] ^= 0xFF;
                Ok(bytes)
            }
            None => Ok(bytes),
        }
    }
}

/// Everything a test needs to drive a transfer against a memory source.
pub struct Fixture {
    pub data: Vec<u8>,
    pub source: Arc<MemorySource>,
    pub entry: DatasetEntry,
    pub tree: Arc<MerkleTree>,
    pub state: Arc<ChunkStateStore>,
    pub local: Arc<LocalFile>,
}

impl Fixture {
    pub fn new(dir: &Path, data: Vec<u8>, chunk_size: u32) -> Self {
        Self::with_source(dir, MemorySource::new(data), chunk_size)
    }

    pub fn with_source(dir: &Path, source: MemorySource, chunk_size: u32) -> Self {
        let data = source.data.clone();
        let tree = tree_for(&data, chunk_size);
        let source = Arc::new(source);
        let entry = DatasetEntry::new("mem://dataset.bin", data.len() as u64, source.clone())
            .with_published_root(tree.root_hash());
        let state = ChunkStateStore::open_or_create(&dir.join("dataset.bin.mrkl"), tree.leaf_count()).unwrap();
        let local = LocalFile::open(&dir.join("dataset.bin"), data.len() as u64).unwrap();
        Self {
            data,
            source,
            entry,
            tree: Arc::new(tree),
            state: Arc::new(state),
            local: Arc::new(local),
        }
    }

    pub fn range(&self, index: u32) -> ByteRange {
        self.tree.layout().chunk_range(index).unwrap()
    }
}
