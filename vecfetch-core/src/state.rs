use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::chunking::ChunkLayout;
use crate::error::{IoContext, Result, VecfetchError};
use crate::sidecar::{check_crc, write_atomic, Cursor};

/// State sidecar layout (little endian):
/// magic (8) + NUL (1) + version (u32) + chunk_count (u32)
/// + present bits + valid bits (ceil(n/8) each, LSB first) + crc32 (u32)
const STATE_MAGIC: &[u8; 8] = b"VFMRKL01";
const STATE_HEADER_LEN: usize = 8 + 1 + 4 + 4;
const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkState {
    Absent,
    Fetching,
    Verified,
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BitVec {
    bytes: Vec<u8>,
}

impl BitVec {
    fn new(bits: u32) -> Self {
        Self { bytes: vec![0u8; (bits as usize).div_ceil(8)] }
    }

    fn get(&self, i: u32) -> bool {
        self.bytes[i as usize / 8] & (1 << (i % 8)) != 0
    }

    fn set(&mut self, i: u32, on: bool) {
        let b = &mut self.bytes[i as usize / 8];
        if on {
            *b |= 1 << (i % 8);
        } else {
            *b &= !(1 << (i % 8));
        }
    }
}

/// Outcome slot shared by the owner of an in-flight chunk and everyone
/// waiting on it.
#[derive(Debug, Default)]
pub struct Flight {
    outcome: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl Flight {
    /// Block until the owning fetch settles and return its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut g = lock(&self.outcome);
        loop {
            if let Some(outcome) = g.as_ref() {
                return outcome.clone();
            }
            g = self.done.wait(g).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn publish(&self, outcome: Result<()>) {
        *lock(&self.outcome) = Some(outcome);
        self.done.notify_all();
    }
}

pub enum Claim<'a> {
    /// Already verified; nothing to do.
    Verified,
    /// Caller now owns the fetch of this chunk and must settle the ticket.
    Owner(FetchTicket<'a>),
    /// Another caller is fetching; wait on the flight for its outcome.
    InFlight(Arc<Flight>),
}

/// Exclusive right to fetch one chunk. Dropping an unsettled ticket settles
/// it as failed so waiters are never stranded.
pub struct FetchTicket<'a> {
    store: &'a ChunkStateStore,
    index: u32,
    settled: bool,
}

impl FetchTicket<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Record a failed attempt without giving up ownership.
    pub fn record_invalid(&self) {
        let mut g = self.store.inner();
        g.present.set(self.index, true);
        g.valid.set(self.index, false);
    }

    pub fn verified(mut self) -> Result<()> {
        self.settled = true;
        self.store.settle(self.index, Ok(()))
    }

    pub fn failed(mut self, err: VecfetchError) -> Result<()> {
        self.settled = true;
        self.store.settle(self.index, Err(err))
    }
}

impl Drop for FetchTicket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.store.settle(
                self.index,
                Err(VecfetchError::Io {
                    context: format!("chunk {}", self.index),
                    message: "fetch abandoned".into(),
                }),
            );
        }
    }
}

#[derive(Debug)]
struct Inner {
    present: BitVec,
    valid: BitVec,
    in_flight: HashMap<u32, Arc<Flight>>,
}

/// Per-chunk ledger: `present` says a verdict exists, `valid` says it was
/// good. `Fetching` lives only in memory as the in-flight map.
#[derive(Debug)]
pub struct ChunkStateStore {
    chunk_count: u32,
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl ChunkStateStore {
    pub fn new(chunk_count: u32) -> Self {
        Self::from_bits(chunk_count, BitVec::new(chunk_count), BitVec::new(chunk_count), None)
    }

    fn from_bits(chunk_count: u32, present: BitVec, valid: BitVec, path: Option<PathBuf>) -> Self {
        Self {
            chunk_count,
            inner: Mutex::new(Inner { present, valid, in_flight: HashMap::new() }),
            path,
            persist_lock: Mutex::new(()),
        }
    }

    /// Load `path` if it exists (it must describe `chunk_count` chunks),
    /// otherwise start empty and write the initial snapshot.
    pub fn open_or_create(path: &Path, chunk_count: u32) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path).ctx(|| format!("read {}", path.display()))?;
            let mut store = Self::restore(&bytes)?;
            if store.chunk_count != chunk_count {
                return Err(VecfetchError::TreeMismatch {
                    expected: format!("{chunk_count} chunks"),
                    found: format!("{} chunks in {}", store.chunk_count, path.display()),
                });
            }
            store.path = Some(path.to_path_buf());
            tracing::debug!(path = %path.display(), verified = store.verified_count(), "restored chunk state");
            return Ok(store);
        }
        let mut store = Self::new(chunk_count);
        store.path = Some(path.to_path_buf());
        store.persist()?;
        Ok(store)
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, index: u32) -> ChunkState {
        if index >= self.chunk_count {
            return ChunkState::Absent;
        }
        let g = self.inner();
        state_of(&g, index)
    }

    pub fn claim(&self, index: u32) -> Result<Claim<'_>> {
        self.check_index(index)?;
        let mut g = self.inner();
        if let Some(f) = g.in_flight.get(&index) {
            return Ok(Claim::InFlight(f.clone()));
        }
        if state_of(&g, index) == ChunkState::Verified {
            return Ok(Claim::Verified);
        }
        g.in_flight.insert(index, Arc::new(Flight::default()));
        Ok(Claim::Owner(FetchTicket { store: self, index, settled: false }))
    }

    pub fn mark_fetching(&self, index: u32) -> Result<()> {
        self.check_index(index)?;
        let mut g = self.inner();
        let from = state_of(&g, index);
        match from {
            ChunkState::Absent | ChunkState::Invalid => {
                g.in_flight.insert(index, Arc::new(Flight::default()));
                Ok(())
            }
            _ => Err(VecfetchError::IllegalTransition { index, from, to: ChunkState::Fetching }),
        }
    }

    pub fn mark_verified(&self, index: u32) -> Result<()> {
        self.settle(index, Ok(()))
    }

    pub fn mark_invalid(&self, index: u32) -> Result<()> {
        self.settle(index, Err(VecfetchError::ChunkCorrupt { index, attempts: 1 }))
    }

    /// Move a `Verified` chunk back to `Invalid` after its local bytes failed
    /// a recheck. Returns false if the chunk was not verified.
    pub fn demote(&self, index: u32) -> bool {
        if index >= self.chunk_count {
            return false;
        }
        let mut g = self.inner();
        if state_of(&g, index) != ChunkState::Verified {
            return false;
        }
        g.valid.set(index, false);
        true
    }

    fn settle(&self, index: u32, outcome: Result<()>) -> Result<()> {
        self.check_index(index)?;
        let flight = {
            let mut g = self.inner();
            let to = if outcome.is_ok() { ChunkState::Verified } else { ChunkState::Invalid };
            let Some(flight) = g.in_flight.remove(&index) else {
                return Err(VecfetchError::IllegalTransition { index, from: state_of(&g, index), to });
            };
            g.present.set(index, true);
            g.valid.set(index, outcome.is_ok());
            flight
        };
        flight.publish(outcome);
        Ok(())
    }

    pub fn verified_count(&self) -> u32 {
        let g = self.inner();
        (0..self.chunk_count).filter(|&i| state_of(&g, i) == ChunkState::Verified).count() as u32
    }

    pub fn verified_bytes(&self, layout: &ChunkLayout) -> u64 {
        let g = self.inner();
        (0..self.chunk_count)
            .filter(|&i| state_of(&g, i) == ChunkState::Verified)
            .map(|i| layout.chunk_len(i))
            .sum()
    }

    /// Indices not yet verified, in order.
    pub fn missing(&self) -> Vec<u32> {
        let g = self.inner();
        (0..self.chunk_count).filter(|&i| state_of(&g, i) != ChunkState::Verified).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.chunk_count
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let g = self.inner();
        let mut buf = Vec::with_capacity(STATE_HEADER_LEN + 2 * g.present.bytes.len() + 4);
        buf.extend_from_slice(STATE_MAGIC);
        buf.push(0);
        buf.extend_from_slice(&STATE_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.chunk_count.to_le_bytes());
        buf.extend_from_slice(&g.present.bytes);
        buf.extend_from_slice(&g.valid.bytes);
        drop(g);
        let mut crc = crc32fast::Hasher::new();
        crc.update(&buf);
        buf.extend_from_slice(&crc.finalize().to_le_bytes());
        buf
    }

    /// Rebuild a store from a snapshot. In-flight markers are never persisted,
    /// so a chunk that was mid-fetch comes back as whatever verdict it had.
    pub fn restore(bytes: &[u8]) -> Result<Self> {
        let body = check_crc(bytes, STATE_HEADER_LEN, "state")?;
        let mut r = Cursor::new(body);
        if r.take(8)? != STATE_MAGIC || r.take(1)?[0] != 0 {
            return Err(VecfetchError::Format("bad state magic".into()));
        }
        let version = r.u32()?;
        if version != STATE_FORMAT_VERSION {
            return Err(VecfetchError::Format(format!("unsupported state version {version}")));
        }
        let chunk_count = r.u32()?;
        let n = (chunk_count as usize).div_ceil(8);
        let present = BitVec { bytes: r.take(n)?.to_vec() };
        let valid = BitVec { bytes: r.take(n)?.to_vec() };
        if !r.is_empty() {
            return Err(VecfetchError::Format("trailing bytes after state".into()));
        }
        Ok(Self::from_bits(chunk_count, present, valid, None))
    }

    /// Write the current snapshot to the attached sidecar, if any.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = lock(&self.persist_lock);
        write_atomic(path, &self.snapshot())
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.chunk_count {
            return Err(VecfetchError::InvalidConfiguration(format!(
                "chunk {index} outside 0..{}",
                self.chunk_count
            )));
        }
        Ok(())
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

fn state_of(g: &Inner, index: u32) -> ChunkState {
    if g.in_flight.contains_key(&index) {
        ChunkState::Fetching
    } else if !g.present.get(index) {
        ChunkState::Absent
    } else if g.valid.get(index) {
        ChunkState::Verified
    } else {
        ChunkState::Invalid
    }
}

/// Poisoning only means another thread panicked mid-update of plain bits;
/// the data is still usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
