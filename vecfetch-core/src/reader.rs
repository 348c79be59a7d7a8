use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use crate::config::{ReaderConfig, TransferConfig};
use crate::error::{Result, VecfetchError};
use crate::fetch::{ChunkFetcher, ChunkOutcome};
use crate::local::LocalFile;
use crate::merkle::MerkleTree;
use crate::range::ByteRange;
use crate::source::DatasetEntry;
use crate::state::{lock, ChunkState, ChunkStateStore};
use crate::transfer::{ProgressHandle, TransferCoordinator};

/// Random reads over a partially downloaded file. Every byte returned
/// belongs to a chunk whose leaf hash has been checked; missing chunks are
/// fetched on demand through the same deduplicated path bulk transfers use.
pub struct VerifiedRandomAccess {
    fetcher: Arc<ChunkFetcher>,
    coordinator: TransferCoordinator,
    config: ReaderConfig,
    label: String,
    /// Chunks whose local bytes this session has already re-hashed.
    checked: Vec<Mutex<bool>>,
    readahead: Mutex<ReadAhead>,
}

/// Sequential-read detection for background read-ahead.
#[derive(Default)]
struct ReadAhead {
    /// Where the previous read ended.
    next_offset: Option<u64>,
    /// Reads in a row that started at `next_offset`.
    streak: u32,
    /// Chunks below this index were already handed to a read-ahead job.
    dispatched_to: u32,
    jobs: Vec<ProgressHandle>,
}

impl VerifiedRandomAccess {
    pub fn new(
        entry: &DatasetEntry,
        tree: Arc<MerkleTree>,
        state: Arc<ChunkStateStore>,
        local: Arc<LocalFile>,
        transfer: TransferConfig,
        config: ReaderConfig,
    ) -> Result<Self> {
        if entry.total_size() != tree.layout().total_size() {
            return Err(VecfetchError::TreeMismatch {
                expected: format!("total_size={}", entry.total_size()),
                found: format!("total_size={}", tree.layout().total_size()),
            });
        }
        let coordinator = TransferCoordinator::new(transfer.clone())?;
        let fetcher =
            Arc::new(ChunkFetcher::new(tree, state, local, entry.source.clone(), transfer)?);
        let checked = (0..fetcher.layout().chunk_count()).map(|_| Mutex::new(false)).collect();
        Ok(Self {
            fetcher,
            coordinator,
            config,
            label: entry.remote_url.clone(),
            checked,
            readahead: Mutex::new(ReadAhead::default()),
        })
    }

    pub fn len(&self) -> u64 {
        self.fetcher.layout().total_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, range: ByteRange) -> Result<Vec<u8>> {
        self.check_bounds(&range)?;
        let mut buf = vec![0u8; range.size() as usize];
        self.read_at(range.start(), &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` with the verified bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = ByteRange::at(offset, buf.len() as u64)?;
        self.check_bounds(&range)?;
        if range.is_empty() {
            return Ok(());
        }
        for index in self.fetcher.layout().chunks_overlapping(&range) {
            self.ensure_chunk(index)?;
        }
        self.fetcher.local().read_at(offset, buf)?;
        self.note_read(&range);
        Ok(())
    }

    /// Start fetching every chunk overlapping `range` in the background.
    pub fn prebuffer(&self, range: ByteRange) -> Result<ProgressHandle> {
        self.check_bounds(&range)?;
        let indices = self.fetcher.layout().chunks_overlapping(&range);
        self.coordinator.start(self.fetcher.clone(), indices, format!("{} {range}", self.label))
    }

    /// A `Read + Seek` view starting at offset 0.
    pub fn cursor(&self) -> VerifiedCursor<'_> {
        VerifiedCursor { reader: self, pos: 0 }
    }

    /// The most recent read-ahead job, if sequential reads started one.
    pub fn read_ahead(&self) -> Option<ProgressHandle> {
        lock(&self.readahead).jobs.last().cloned()
    }

    fn check_bounds(&self, range: &ByteRange) -> Result<()> {
        if range.end() > self.len() {
            return Err(VecfetchError::RangeOutOfBounds { end: range.end(), total_size: self.len() });
        }
        Ok(())
    }

    fn ensure_chunk(&self, index: u32) -> Result<()> {
        if self.config.recheck_local {
            let mut done = lock(&self.checked[index as usize]);
            if !*done {
                self.fetcher.recheck(index)?;
                *done = true;
            }
        }
        if let ChunkOutcome::Fetched { .. } = self.fetcher.ensure(index)? {
            self.fetcher.note_fetched()?;
        }
        Ok(())
    }

    /// After `readahead_after` back-to-back reads, keep the next
    /// `readahead_chunks` chunks past the read downloading in the background.
    fn note_read(&self, range: &ByteRange) {
        if self.config.readahead_chunks == 0 {
            return;
        }
        let mut ra = lock(&self.readahead);
        if ra.next_offset == Some(range.start()) {
            ra.streak = ra.streak.saturating_add(1);
        } else {
            ra.streak = 0;
            ra.dispatched_to = 0;
        }
        ra.next_offset = Some(range.end());
        if ra.streak < self.config.readahead_after {
            return;
        }
        let layout = self.fetcher.layout();
        let Some(last) = layout.chunk_index_of(range.end() - 1) else {
            return;
        };
        let end = last
            .saturating_add(1)
            .saturating_add(self.config.readahead_chunks)
            .min(layout.chunk_count());
        let first = (last + 1).max(ra.dispatched_to);
        ra.dispatched_to = ra.dispatched_to.max(end);
        let window: Vec<u32> =
            (first..end).filter(|&i| self.fetcher.state().get(i) != ChunkState::Verified).collect();
        let (Some(&from), Some(&to)) = (window.first(), window.last()) else {
            return;
        };
        ra.jobs.retain(|h| !h.is_finished());
        match self.coordinator.start(self.fetcher.clone(), window, format!("{} read-ahead", self.label)) {
            Ok(handle) => {
                tracing::debug!(from, to, streak = ra.streak, "read-ahead dispatched");
                ra.jobs.push(handle);
            }
            Err(e) => tracing::warn!(error = %e, "read-ahead not started"),
        }
    }
}

impl Drop for VerifiedRandomAccess {
    fn drop(&mut self) {
        let ra = self.readahead.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in &ra.jobs {
            handle.cancel();
        }
    }
}

pub struct VerifiedCursor<'a> {
    reader: &'a VerifiedRandomAccess,
    pos: u64,
}

impl VerifiedCursor<'_> {
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for VerifiedCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.reader.len().saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.reader.read_at(self.pos, &mut buf[..n]).map_err(io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for VerifiedCursor<'_> {
    fn seek(&mut self, to: SeekFrom) -> io::Result<u64> {
        let target = match to {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.reader.len().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let Some(target) = target else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file"));
        };
        self.pos = target;
        Ok(target)
    }
}
