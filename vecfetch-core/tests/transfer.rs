mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, init_tracing, random_bytes, Fixture, MemorySource};
use vecfetch_core::{
    verify_local, ChunkState, ChunkStateStore, FetchError, LocalFile, TransferConfig,
    TransferCoordinator, TransferResult, TransferStatus, VecfetchError,
};

fn run(fx: &Fixture, config: TransferConfig) -> TransferResult {
    let handle = TransferCoordinator::new(config)
        .unwrap()
        .download(&fx.entry, fx.tree.clone(), fx.state.clone(), fx.local.clone())
        .unwrap();
    handle.wait()
}

#[test]
fn ten_megabyte_download_completes() {
    init_tracing();
    let td = tempfile::tempdir().unwrap();
    let fx = Fixture::new(td.path(), random_bytes(10_000_000, 42), 1_048_576);
    assert_eq!(fx.tree.leaf_count(), 10);
    assert_eq!(fx.range(9).size(), 562_816);

    let handle = TransferCoordinator::new(fast_config())
        .unwrap()
        .download(&fx.entry, fx.tree.clone(), fx.state.clone(), fx.local.clone())
        .unwrap();
    let mut result = None;
    while result.is_none() {
        let p = handle.progress();
        assert!(p.current_bytes <= p.total_bytes);
        result = handle.poll(Duration::from_millis(20));
    }
    assert_eq!(result, Some(TransferResult::Success));
    assert!(handle.is_finished());

    for i in 0..10 {
        assert_eq!(fx.state.get(i), ChunkState::Verified);
    }
    let p = handle.progress();
    assert_eq!(p.current_bytes, 10_000_000);
    assert_eq!(p.total_bytes, 10_000_000);
    assert_eq!(p.status, TransferStatus::Complete);
    assert_eq!(std::fs::read(fx.local.path()).unwrap(), fx.data);
    assert_eq!(fx.source.fetches(), 10);
}

#[test]
fn resume_fetches_only_missing_chunks() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(64 * 1024 + 77, 5);
    let fx = Fixture::new(td.path(), data.clone(), 4096);
    let n = fx.tree.leaf_count();

    // First session: a subset of chunks.
    let coord = TransferCoordinator::new(fast_config()).unwrap();
    let first: Vec<u32> = (0..n).step_by(3).collect();
    let h = coord
        .download_chunks(&fx.entry, fx.tree.clone(), fx.state.clone(), fx.local.clone(), first.clone())
        .unwrap();
    assert!(h.wait().is_success());
    assert_eq!(fx.source.fetches(), first.len() as u64);
    let state_path = fx.state.path().unwrap().to_path_buf();
    drop(fx);

    // Second session reopens the sidecar and the partially written file.
    let source = Arc::new(MemorySource::new(data.clone()));
    let state = Arc::new(ChunkStateStore::open_or_create(&state_path, n).unwrap());
    assert_eq!(state.verified_count(), first.len() as u32);
    let local = Arc::new(LocalFile::open(&td.path().join("dataset.bin"), data.len() as u64).unwrap());
    let tree = Arc::new(common::tree_for(&data, 4096));
    let entry = vecfetch_core::DatasetEntry::new("mem://dataset.bin", data.len() as u64, source.clone())
        .with_published_root(tree.root_hash());
    let h = coord.download(&entry, tree.clone(), state.clone(), local.clone()).unwrap();
    assert!(h.wait().is_success());

    for i in &first {
        assert_eq!(source.fetches_at(u64::from(*i) * 4096), 0, "chunk {i} re-fetched");
    }
    assert_eq!(source.fetches(), u64::from(n) - first.len() as u64);
    assert!(state.is_complete());
    let report = verify_local(&tree, local.path()).unwrap();
    assert!(report.is_clean());

    // A third run has nothing to do.
    let h = coord.download(&entry, tree, state, local).unwrap();
    assert!(h.wait().is_success());
    assert_eq!(h.progress().current_bytes, data.len() as u64);
    assert_eq!(source.fetches(), u64::from(n) - first.len() as u64);
}

#[test]
fn transient_faults_are_retried() {
    let td = tempfile::tempdir().unwrap();
    let source = MemorySource::new(random_bytes(8 * 1024, 2));
    source.corrupt_next(1024, 2);
    source.fail_next(4096, FetchError::Status { code: 503 });
    source.fail_next(4096, FetchError::Timeout(Duration::from_millis(5)));
    let fx = Fixture::with_source(td.path(), source, 1024);

    assert_eq!(run(&fx, fast_config()), TransferResult::Success);
    assert!(fx.state.is_complete());
    assert_eq!(fx.source.fetches_at(1024), 3);
    assert_eq!(fx.source.fetches_at(4096), 3);
    assert_eq!(std::fs::read(fx.local.path()).unwrap(), fx.data);
}

#[test]
fn persistent_corruption_fails_naming_the_chunk() {
    let td = tempfile::tempdir().unwrap();
    let source = MemorySource::new(random_bytes(8 * 1024, 2));
    source.corrupt_next(5 * 1024, 100);
    let fx = Fixture::with_source(td.path(), source, 1024);

    let config = TransferConfig { max_retries: 2, ..fast_config() };
    let result = run(&fx, config);
    assert_eq!(result, TransferResult::Failed(VecfetchError::ChunkCorrupt { index: 5, attempts: 3 }));
    assert_eq!(fx.state.get(5), ChunkState::Invalid);
    assert_eq!(fx.source.fetches_at(5 * 1024), 3);
}

#[test]
fn permanent_errors_are_not_retried() {
    let td = tempfile::tempdir().unwrap();
    let source = MemorySource::new(random_bytes(4 * 1024, 3));
    source.fail_always(2048, FetchError::Status { code: 404 });
    let fx = Fixture::with_source(td.path(), source, 1024);

    let config = TransferConfig { concurrency: 1, ..fast_config() };
    match run(&fx, config) {
        TransferResult::Failed(e) => {
            assert_eq!(e.chunk_index(), Some(2));
            assert!(matches!(
                e,
                VecfetchError::Fetch { attempts: 1, source: FetchError::Status { code: 404 }, .. }
            ));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(fx.source.fetches_at(2048), 1);
    // With one worker the failure stops scheduling before chunk 3.
    assert_eq!(fx.state.get(3), ChunkState::Absent);
}

#[test]
fn local_write_failure_is_fatal_and_names_the_chunk() {
    let td = tempfile::tempdir().unwrap();
    let fx = Fixture::new(td.path(), random_bytes(4 * 1024, 13), 1024);
    // A read-only handle: every positional write fails.
    let read_only = std::fs::File::open(fx.local.path()).unwrap();
    let local = Arc::new(LocalFile::from_file(fx.local.path(), read_only).unwrap());
    assert_eq!(local.total_size(), 4 * 1024);

    let config = TransferConfig { concurrency: 1, ..fast_config() };
    let handle = TransferCoordinator::new(config)
        .unwrap()
        .download(&fx.entry, fx.tree.clone(), fx.state.clone(), local)
        .unwrap();
    match handle.wait() {
        TransferResult::Failed(e) => {
            assert_eq!(e.chunk_index(), Some(0));
            assert!(matches!(e, VecfetchError::LocalIo { index: 0, .. }), "{e:?}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(handle.progress().status, TransferStatus::Failed);
    // Fetched and verified once, never retried, never scheduled further.
    assert_eq!(fx.source.fetches_at(0), 1);
    assert_eq!(fx.source.fetches(), 1);
    assert_eq!(fx.state.get(0), ChunkState::Invalid);
    assert_eq!(fx.state.get(1), ChunkState::Absent);
}

#[test]
fn cancel_stops_scheduling_and_keeps_verified_chunks() {
    let td = tempfile::tempdir().unwrap();
    let source = MemorySource::new(random_bytes(64 * 512, 9)).with_delay(Duration::from_millis(10));
    let fx = Fixture::with_source(td.path(), source, 512);

    let config = TransferConfig { concurrency: 2, ..fast_config() };
    let handle = TransferCoordinator::new(config)
        .unwrap()
        .download(&fx.entry, fx.tree.clone(), fx.state.clone(), fx.local.clone())
        .unwrap();
    std::thread::sleep(Duration::from_millis(35));
    handle.cancel();
    assert_eq!(handle.wait(), TransferResult::Cancelled);
    assert_eq!(handle.progress().status, TransferStatus::Cancelled);

    let verified = fx.state.verified_count();
    assert!(verified < 64);
    assert_eq!(fx.source.fetches(), u64::from(verified));
    let report = verify_local(&fx.tree, fx.local.path()).unwrap();
    for i in 0..64 {
        if fx.state.get(i) == ChunkState::Verified {
            assert!(!report.bad_indices.contains(&i), "verified chunk {i} has bad bytes");
        }
    }
    assert_eq!(handle.progress().current_bytes, u64::from(verified) * 512);
}

#[test]
fn wrong_published_root_is_refused() {
    let td = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(td.path(), random_bytes(4096, 1), 1024);
    fx.entry = fx.entry.clone().with_published_root(blake3::hash(b"someone else"));
    let err = TransferCoordinator::new(fast_config())
        .unwrap()
        .download(&fx.entry, fx.tree.clone(), fx.state.clone(), fx.local.clone())
        .err()
        .unwrap();
    assert!(matches!(err, VecfetchError::TreeMismatch { .. }));
    assert_eq!(fx.source.fetches(), 0);
}

#[test]
fn zero_concurrency_is_rejected() {
    let config = TransferConfig { concurrency: 0, ..Default::default() };
    assert!(matches!(TransferCoordinator::new(config), Err(VecfetchError::InvalidConfiguration(_))));
}

#[test]
fn empty_file_completes_immediately() {
    let td = tempfile::tempdir().unwrap();
    let fx = Fixture::new(td.path(), Vec::new(), 1024);
    assert_eq!(run(&fx, fast_config()), TransferResult::Success);
    assert_eq!(fx.source.fetches(), 0);
}
