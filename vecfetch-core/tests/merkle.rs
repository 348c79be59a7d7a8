mod common;

use common::{random_bytes, tree_for};
use vecfetch_core::merkle::{leaf_hash, verify_path};
use vecfetch_core::{sidecar_paths, ChunkLayout, LeafManifest, MerkleTree, VecfetchError};

#[test]
fn build_is_deterministic() {
    let data = random_bytes(100_000, 7);
    let a = tree_for(&data, 4096);
    let b = tree_for(&data, 4096);
    assert_eq!(a, b);
    assert_eq!(a.root_hash(), b.root_hash());
    // Different chunking, different tree.
    assert_ne!(a.root_hash(), tree_for(&data, 8192).root_hash());
}

#[test]
fn from_file_matches_in_memory_build() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(300_001, 11);
    let path = td.path().join("blob.bin");
    std::fs::write(&path, &data).unwrap();
    let t = MerkleTree::from_file(&path, 65_536).unwrap();
    assert_eq!(t, tree_for(&data, 65_536));
    assert_eq!(t.leaf_count(), 5);
}

#[test]
fn sidecar_roundtrip_compact_and_full() {
    let t = tree_for(&random_bytes(50_000, 3), 4096);
    let compact = MerkleTree::deserialize(&t.serialize()).unwrap();
    let full = MerkleTree::deserialize(&t.serialize_full()).unwrap();
    assert_eq!(compact, t);
    assert_eq!(full, t);
    assert!(t.serialize_full().len() > t.serialize().len());
}

#[test]
fn every_byte_flip_in_sidecar_is_rejected() {
    let bytes = tree_for(&random_bytes(10_000, 5), 1024).serialize_full();
    for i in 0..bytes.len() {
        let mut bad = bytes.clone();
        bad[i] ^= 0x01;
        assert!(
            matches!(MerkleTree::deserialize(&bad), Err(VecfetchError::Format(_))),
            "flip at byte {i} accepted"
        );
    }
    assert!(MerkleTree::deserialize(&bytes[..bytes.len() - 1]).is_err());
    assert!(MerkleTree::deserialize(&[]).is_err());
}

/// Header plus CRC trailer, with whatever hash bytes the caller appends.
fn tree_sidecar(total_size: u64, chunk_size: u32, leaf_count: u32, flags: u32, hashes: &[u8]) -> Vec<u8> {
    let mut buf = b"VFMREF01\0".to_vec();
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&total_size.to_le_bytes());
    buf.extend_from_slice(&chunk_size.to_le_bytes());
    buf.extend_from_slice(&leaf_count.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(hashes);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

#[test]
fn header_claiming_more_leaves_than_the_body_holds_is_rejected() {
    // A well-formed CRC over a header promising four billion leaves and no body.
    let huge = tree_sidecar(u64::from(u32::MAX), 1, u32::MAX, 0, &[]);
    assert_eq!(huge.len(), 33 + 4);
    assert!(matches!(MerkleTree::deserialize(&huge), Err(VecfetchError::Format(_))));
    let huge_full = tree_sidecar(u64::from(u32::MAX), 1, u32::MAX, 1, &[0u8; 64]);
    assert!(matches!(MerkleTree::deserialize(&huge_full), Err(VecfetchError::Format(_))));

    // Three leaves declared, two present.
    let t = tree_for(&random_bytes(3_000, 4), 1000);
    let leaves: Vec<u8> = t.leaf_hashes().iter().flat_map(|h| *h.as_bytes()).collect();
    let short = tree_sidecar(3_000, 1000, 3, 0, &leaves[..64]);
    assert!(matches!(MerkleTree::deserialize(&short), Err(VecfetchError::Format(_))));
    // Same header with every leaf in place decodes.
    let whole = tree_sidecar(3_000, 1000, 3, 0, &leaves);
    assert_eq!(whole, t.serialize());
    assert_eq!(MerkleTree::deserialize(&whole).unwrap(), t);
}

#[test]
fn verify_leaf_detects_single_byte_flip() {
    let data = random_bytes(40_000, 9);
    let t = tree_for(&data, 4096);
    let layout = *t.layout();
    for c in layout.chunks() {
        let mut chunk = data[c.range.start() as usize..c.range.end() as usize].to_vec();
        assert!(t.verify_leaf(c.index, &chunk));
        let at = fastrand::usize(..chunk.len());
        chunk[at] ^= 0x80;
        assert!(!t.verify_leaf(c.index, &chunk), "flip in chunk {} at {at} not detected", c.index);
    }
    assert!(!t.verify_leaf(layout.chunk_count(), b""));
}

#[test]
fn audit_paths_prove_membership() {
    let data = random_bytes(13 * 512 + 100, 21);
    let t = tree_for(&data, 512);
    let root = t.root_hash();
    for i in 0..t.leaf_count() {
        let leaf = t.leaf_hash(i).unwrap();
        let path = t.audit_path(i).unwrap();
        assert_eq!(path.len(), 4); // 14 leaves pad to 16
        assert!(verify_path(&root, i, &leaf, &path));
        assert!(!verify_path(&root, i, &leaf_hash(b"forged"), &path));
    }
    assert!(t.audit_path(t.leaf_count()).is_none());
}

#[test]
fn diff_lists_changed_leaves() {
    let data = random_bytes(20 * 1024, 4);
    let mut changed = data.clone();
    changed[3 * 1024 + 5] ^= 1;
    changed[17 * 1024] ^= 1;
    let a = tree_for(&data, 1024);
    let b = tree_for(&changed, 1024);
    assert_eq!(a.diff(&b).unwrap(), vec![3, 17]);
    assert!(a.diff(&a).unwrap().is_empty());
    assert!(matches!(a.diff(&tree_for(&data, 2048)), Err(VecfetchError::TreeMismatch { .. })));
}

#[test]
fn save_load_and_layout_check() {
    let td = tempfile::tempdir().unwrap();
    let (tree_path, state_path) = sidecar_paths(&td.path().join("x.bin"));
    assert!(tree_path.to_string_lossy().ends_with("x.bin.mref"));
    assert!(state_path.to_string_lossy().ends_with("x.bin.mrkl"));

    let t = tree_for(&random_bytes(9_000, 1), 1000);
    t.save(&tree_path).unwrap();
    assert_eq!(MerkleTree::load(&tree_path).unwrap(), t);
    assert_eq!(MerkleTree::load_for(&tree_path, t.layout()).unwrap(), t);
    let other = ChunkLayout::new(9_000, 500).unwrap();
    assert!(matches!(
        MerkleTree::load_for(&tree_path, &other),
        Err(VecfetchError::TreeMismatch { .. })
    ));
}

#[test]
fn manifest_rebuilds_tree_and_checks_root() {
    let td = tempfile::tempdir().unwrap();
    let t = tree_for(&random_bytes(70_000, 8), 8192);
    let m = LeafManifest::from_tree(&t);
    let path = td.path().join("leaves.json");
    m.write(&path).unwrap();
    let back = LeafManifest::read(&path).unwrap();
    assert_eq!(back, m);
    assert_eq!(back.to_tree().unwrap(), t);

    let mut forged = m.clone();
    forged.leaves_hex.swap(0, 1);
    assert!(matches!(forged.to_tree(), Err(VecfetchError::TreeMismatch { .. })));
}
