use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::TransferConfig;
use crate::error::{Result, VecfetchError};
use crate::fetch::{ChunkFetcher, ChunkOutcome};
use crate::local::LocalFile;
use crate::merkle::{self, MerkleTree};
use crate::progress::{Progress, TransferProgress, TransferStatus};
use crate::source::DatasetEntry;
use crate::state::{lock, ChunkState, ChunkStateStore};

/// Final outcome of a transfer job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferResult {
    Success,
    Failed(VecfetchError),
    Cancelled,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferResult::Success)
    }

    /// `Ok` on success, the failure otherwise.
    pub fn into_result(self) -> Result<()> {
        match self {
            TransferResult::Success => Ok(()),
            TransferResult::Failed(e) => Err(e),
            TransferResult::Cancelled => Err(VecfetchError::Cancelled),
        }
    }
}

struct Job {
    progress: Progress,
    queue: Mutex<VecDeque<u32>>,
    stop: AtomicBool,
    cancelled: AtomicBool,
    failure: Mutex<Option<VecfetchError>>,
    result: Mutex<Option<TransferResult>>,
    done: Condvar,
}

impl Job {
    fn fail(&self, err: VecfetchError) {
        let mut slot = lock(&self.failure);
        if slot.is_none() {
            tracing::error!(chunk = ?err.chunk_index(), error = %err, "transfer failed; draining in-flight chunks");
            *slot = Some(err);
        }
        self.stop.store(true, Ordering::Release);
    }

    fn next(&self) -> Option<u32> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        lock(&self.queue).pop_front()
    }
}

/// Handle to a running job. Cheap to clone; every clone observes the same job.
#[derive(Clone)]
pub struct ProgressHandle {
    job: Arc<Job>,
}

impl ProgressHandle {
    /// Wait up to `timeout` for the job to finish. `None` means still running.
    pub fn poll(&self, timeout: Duration) -> Option<TransferResult> {
        let g = lock(&self.job.result);
        let (g, _) = self
            .job
            .done
            .wait_timeout_while(g, timeout, |r| r.is_none())
            .unwrap_or_else(|e| e.into_inner());
        g.clone()
    }

    /// Block until the job finishes.
    pub fn wait(&self) -> TransferResult {
        let mut g = lock(&self.job.result);
        loop {
            if let Some(r) = g.as_ref() {
                return r.clone();
            }
            g = self.job.done.wait(g).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn progress(&self) -> TransferProgress {
        self.job.progress.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.job.result).is_some()
    }

    /// Stop scheduling new chunks. Requests already dispatched run to
    /// completion and anything they verify stays verified.
    pub fn cancel(&self) {
        if !self.job.cancelled.swap(true, Ordering::AcqRel) {
            tracing::info!("transfer cancel requested");
        }
        self.job.stop.store(true, Ordering::Release);
    }
}

/// Drives bulk downloads over a bounded pool of worker threads.
#[derive(Clone, Debug)]
pub struct TransferCoordinator {
    config: TransferConfig,
}

impl TransferCoordinator {
    pub fn new(config: TransferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Fetch every chunk not yet verified.
    pub fn download(
        &self,
        entry: &DatasetEntry,
        tree: Arc<MerkleTree>,
        state: Arc<ChunkStateStore>,
        local: Arc<LocalFile>,
    ) -> Result<ProgressHandle> {
        let indices = 0..tree.leaf_count();
        self.download_chunks(entry, tree, state, local, indices)
    }

    /// Like [`download`](Self::download) but restricted to `indices`.
    pub fn download_chunks(
        &self,
        entry: &DatasetEntry,
        tree: Arc<MerkleTree>,
        state: Arc<ChunkStateStore>,
        local: Arc<LocalFile>,
        indices: impl IntoIterator<Item = u32>,
    ) -> Result<ProgressHandle> {
        check_entry(entry, &tree)?;
        let fetcher = Arc::new(ChunkFetcher::new(
            tree,
            state,
            local,
            entry.source.clone(),
            self.config.clone(),
        )?);
        self.start(fetcher, indices, entry.remote_url.clone())
    }

    pub(crate) fn start(
        &self,
        fetcher: Arc<ChunkFetcher>,
        indices: impl IntoIterator<Item = u32>,
        label: String,
    ) -> Result<ProgressHandle> {
        let layout = *fetcher.layout();
        let wanted: BTreeSet<u32> = indices.into_iter().collect();
        if let Some(&bad) = wanted.iter().find(|&&i| i >= layout.chunk_count()) {
            return Err(VecfetchError::InvalidConfiguration(format!(
                "chunk {bad} outside 0..{}",
                layout.chunk_count()
            )));
        }
        let bytes_total = wanted.iter().map(|&i| layout.chunk_len(i)).sum();
        let progress = Progress::new(bytes_total, wanted.len() as u64);
        let mut queue = VecDeque::new();
        for &i in &wanted {
            if fetcher.state().get(i) == ChunkState::Verified {
                progress.add_preverified(layout.chunk_len(i));
            } else {
                queue.push_back(i);
            }
        }
        tracing::info!(
            source = %label,
            layout = %merkle::describe(&layout),
            pending = queue.len(),
            already_verified = wanted.len() - queue.len(),
            "transfer started"
        );
        progress.start_reporter(label, Duration::from_secs(self.config.report_interval_secs));

        let workers = self.config.concurrency.min(queue.len());
        let job = Arc::new(Job {
            progress,
            queue: Mutex::new(queue),
            stop: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        let supervisor_job = job.clone();
        thread::spawn(move || supervise(&supervisor_job, &fetcher, workers));
        Ok(ProgressHandle { job })
    }
}

fn check_entry(entry: &DatasetEntry, tree: &MerkleTree) -> Result<()> {
    if entry.total_size() != tree.layout().total_size() {
        return Err(VecfetchError::TreeMismatch {
            expected: format!("total_size={}", entry.total_size()),
            found: merkle::describe(tree.layout()),
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
    Ok(())
}

fn supervise(job: &Job, fetcher: &ChunkFetcher, workers: usize) {
    let t0 = Instant::now();
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| work(job, fetcher));
        }
    });

    if let Err(e) = fetcher.flush_state() {
        job.fail(e);
    }
    let failure = lock(&job.failure).take();
    let unscheduled = !lock(&job.queue).is_empty();
    let (result, status) = match failure {
        Some(e) => (TransferResult::Failed(e), TransferStatus::Failed),
        None if unscheduled => (TransferResult::Cancelled, TransferStatus::Cancelled),
        None => (TransferResult::Success, TransferStatus::Complete),
    };
    job.progress.set_status(status);
    job.progress.stop();
    let p = job.progress.snapshot();
    tracing::info!(
        ?status,
        bytes = p.current_bytes,
        bytes_total = p.total_bytes,
        elapsed_ms = t0.elapsed().as_millis() as u64,
        "transfer finished"
    );
    *lock(&job.result) = Some(result);
    job.done.notify_all();
}

fn work(job: &Job, fetcher: &ChunkFetcher) {
    while let Some(index) = job.next() {
        match fetcher.ensure(index) {
            Ok(ChunkOutcome::Fetched { bytes }) => {
                job.progress.add_verified(bytes);
                if let Err(e) = fetcher.note_fetched() {
                    job.fail(e);
                }
            }
            // Verified by someone else (a reader, or a concurrent job).
            Ok(ChunkOutcome::AlreadyVerified | ChunkOutcome::Joined) => {
                job.progress.add_verified(fetcher.layout().chunk_len(index));
            }
            Err(e) => job.fail(e),
        }
    }
}
