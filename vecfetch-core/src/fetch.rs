use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crate::chunking::ChunkLayout;
use crate::config::TransferConfig;
use crate::error::{Result, VecfetchError};
use crate::local::LocalFile;
use crate::merkle::{self, MerkleTree};
use crate::source::{FetchError, RangeSource};
use crate::state::{ChunkState, ChunkStateStore, Claim, FetchTicket};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Was verified before the call.
    AlreadyVerified,
    /// This call fetched, verified and wrote the chunk.
    Fetched { bytes: u64 },
    /// Another caller was fetching; its fetch succeeded.
    Joined,
}

enum Attempt {
    Corrupt,
    Fetch(FetchError),
}

/// Fetch-and-verify for single chunks, shared by bulk downloads and
/// on-demand reads. All callers go through the state store's claim, so at
/// most one request per chunk is outstanding.
pub struct ChunkFetcher {
    tree: Arc<MerkleTree>,
    state: Arc<ChunkStateStore>,
    local: Arc<LocalFile>,
    source: Arc<dyn RangeSource>,
    config: TransferConfig,
    /// Chunks fetched since the state sidecar was last written.
    since_persist: AtomicU32,
}

impl ChunkFetcher {
    pub fn new(
        tree: Arc<MerkleTree>,
        state: Arc<ChunkStateStore>,
        local: Arc<LocalFile>,
        source: Arc<dyn RangeSource>,
        config: TransferConfig,
    ) -> Result<Self> {
        config.validate()?;
        if state.chunk_count() != tree.leaf_count() {
            return Err(VecfetchError::TreeMismatch {
                expected: format!("{} chunks", tree.leaf_count()),
                found: format!("{} chunks in state store", state.chunk_count()),
            });
        }
        if local.total_size() != tree.layout().total_size() {
            return Err(VecfetchError::TreeMismatch {
                expected: merkle::describe(tree.layout()),
                found: format!("local file of {} bytes", local.total_size()),
            });
        }
        Ok(Self { tree, state, local, source, config, since_persist: AtomicU32::new(0) })
    }

    pub fn layout(&self) -> &ChunkLayout {
        self.tree.layout()
    }

    pub fn tree(&self) -> &Arc<MerkleTree> {
        &self.tree
    }

    pub fn state(&self) -> &Arc<ChunkStateStore> {
        &self.state
    }

    pub fn local(&self) -> &Arc<LocalFile> {
        &self.local
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Make sure chunk `index` is verified on disk, fetching it if needed.
    pub fn ensure(&self, index: u32) -> Result<ChunkOutcome> {
        match self.state.claim(index)? {
            Claim::Verified => Ok(ChunkOutcome::AlreadyVerified),
            Claim::InFlight(flight) => {
                tracing::trace!(chunk = index, "joining in-flight fetch");
                flight.wait()?;
                Ok(ChunkOutcome::Joined)
            }
            Claim::Owner(ticket) => match self.fetch_verified(&ticket) {
                Ok(bytes) => {
                    ticket.verified()?;
                    Ok(ChunkOutcome::Fetched { bytes })
                }
                Err(e) => {
                    ticket.failed(e.clone())?;
                    Err(e)
                }
            },
        }
    }

    /// Count one newly fetched chunk; every `persist_every`-th call writes
    /// the state sidecar.
    pub(crate) fn note_fetched(&self) -> Result<()> {
        let every = self.config.persist_every.max(1);
        let step = |n: u32| Some(if n + 1 >= every { 0 } else { n + 1 });
        let (Ok(prev) | Err(prev)) =
            self.since_persist.fetch_update(Ordering::AcqRel, Ordering::Acquire, step);
        if prev + 1 >= every {
            self.state.persist()?;
        }
        Ok(())
    }

    /// Write the state sidecar now and restart the persist count.
    pub(crate) fn flush_state(&self) -> Result<()> {
        self.since_persist.store(0, Ordering::Release);
        self.state.persist()
    }

    /// Re-hash the local bytes of a chunk the store calls verified. On a
    /// mismatch the chunk is demoted so the next `ensure` fetches it again.
    pub fn recheck(&self, index: u32) -> Result<bool> {
        if self.state.get(index) != ChunkState::Verified {
            return Ok(true);
        }
        let Some(range) = self.layout().chunk_range(index) else {
            return Ok(true);
        };
        let bytes = self.local.read_range(range).map_err(|e| e.for_chunk(index))?;
        if self.tree.verify_leaf(index, &bytes) {
            return Ok(true);
        }
        tracing::warn!(chunk = index, "local bytes no longer match leaf hash; refetching");
        self.state.demote(index);
        Ok(false)
    }

    fn fetch_verified(&self, ticket: &FetchTicket<'_>) -> Result<u64> {
        let index = ticket.index();
        let range = self.layout().chunk_range(index).ok_or_else(|| {
            VecfetchError::InvalidConfiguration(format!("chunk {index} outside layout"))
        })?;
        let timeout = self.config.fetch_timeout();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let failure = match self.source.fetch_range(range, timeout) {
                Ok(bytes) if bytes.len() as u64 != range.size() => {
                    Attempt::Fetch(FetchError::ShortRead {
                        expected: range.size(),
                        got: bytes.len() as u64,
                    })
                }
                Ok(bytes) if self.tree.verify_leaf(index, &bytes) => {
                    // Disk failures are not retried.
                    self.local
                        .write_durable(range.start(), &bytes)
                        .map_err(|e| e.for_chunk(index))?;
                    tracing::debug!(chunk = index, attempt = attempts, bytes = bytes.len(), "chunk verified");
                    return Ok(range.size());
                }
                Ok(_) => Attempt::Corrupt,
                Err(e) => Attempt::Fetch(e),
            };
            ticket.record_invalid();
            let retryable = match &failure {
                Attempt::Corrupt => true,
                Attempt::Fetch(e) => e.is_transient(),
            };
            if !retryable || attempts > self.config.max_retries {
                return Err(match failure {
                    Attempt::Corrupt => VecfetchError::ChunkCorrupt { index, attempts },
                    Attempt::Fetch(source) => VecfetchError::Fetch { index, attempts, source },
                });
            }
            let delay = self.config.backoff(attempts);
            match &failure {
                Attempt::Corrupt => {
                    tracing::warn!(chunk = index, attempt = attempts, ?delay, "leaf hash mismatch; retrying")
                }
                Attempt::Fetch(e) => {
                    tracing::warn!(chunk = index, attempt = attempts, ?delay, error = %e, "fetch failed; retrying")
                }
            }
            thread::sleep(delay);
        }
    }
}

impl Drop for ChunkFetcher {
    fn drop(&mut self) {
        if *self.since_persist.get_mut() > 0 {
            if let Err(e) = self.state.persist() {
                tracing::warn!(error = %e, "state sidecar not persisted on close");
            }
        }
    }
}
