use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl TransferStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TransferStatus::Complete,
            2 => TransferStatus::Failed,
            3 => TransferStatus::Cancelled,
            _ => TransferStatus::InProgress,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransferStatus::InProgress => 0,
            TransferStatus::Complete => 1,
            TransferStatus::Failed => 2,
            TransferStatus::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != TransferStatus::InProgress
    }
}

/// Point-in-time view of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub status: TransferStatus,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.current_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Shared counters for one transfer job. Bytes are only ever added for
/// chunks that passed verification.
#[derive(Clone, Debug)]
pub struct Progress {
    pub chunks_done: Arc<AtomicU64>,
    pub chunks_total: Arc<AtomicU64>,
    pub bytes_done: Arc<AtomicU64>,
    pub bytes_total: Arc<AtomicU64>,
    status: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(bytes_total: u64, chunks_total: u64) -> Self {
        Self {
            chunks_done: Arc::new(AtomicU64::new(0)),
            chunks_total: Arc::new(AtomicU64::new(chunks_total)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(bytes_total)),
            status: Arc::new(AtomicU8::new(TransferStatus::InProgress.as_u8())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Count a chunk that was verified before this job started.
    pub fn add_preverified(&self, bytes: u64) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_verified(&self, bytes: u64) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Release);
    }

    pub fn set_status(&self, s: TransferStatus) {
        self.status.store(s.as_u8(), Ordering::Release);
    }

    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            current_bytes: self.bytes_done.load(Ordering::Acquire),
            total_bytes: self.bytes_total.load(Ordering::Relaxed),
            status: TransferStatus::from_u8(self.status.load(Ordering::Acquire)),
        }
    }

    /// Log a progress line every `interval` until [`Progress::stop`].
    pub fn start_reporter(&self, label: String, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let me = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while me.running.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if !me.running.load(Ordering::Relaxed) {
                    break;
                }
                let p = me.snapshot();
                tracing::info!(
                    target: "vecfetch::progress",
                    elapsed_s = t0.elapsed().as_secs(),
                    chunks = me.chunks_done.load(Ordering::Relaxed),
                    chunks_total = me.chunks_total.load(Ordering::Relaxed),
                    bytes = p.current_bytes,
                    bytes_total = p.total_bytes,
                    "{label}: {}%",
                    (p.fraction() * 100.0) as i32
                );
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
