pub mod cache;
pub mod chunking;
pub mod config;
pub mod error;
pub mod fetch;
pub mod local;
pub mod manifest;
pub mod merkle;
pub mod progress;
pub mod range;
pub mod reader;
pub mod sidecar;
pub mod source;
pub mod state;
pub mod transfer;
pub mod verify;

pub use cache::DatasetCache;
pub use chunking::{default_chunk_size, Chunk, ChunkLayout};
pub use config::{Config, ReaderConfig, TransferConfig};
pub use error::{Result, VecfetchError};
pub use local::LocalFile;
pub use manifest::LeafManifest;
pub use merkle::MerkleTree;
pub use progress::{TransferProgress, TransferStatus};
pub use range::ByteRange;
pub use reader::{VerifiedCursor, VerifiedRandomAccess};
pub use sidecar::sidecar_paths;
#[cfg(feature = "http")]
pub use source::HttpRangeSource;
pub use source::{DatasetEntry, FetchError, FileRangeSource, RangeSource};
pub use state::{ChunkState, ChunkStateStore};
pub use transfer::{ProgressHandle, TransferCoordinator, TransferResult};
pub use verify::{verify_local, VerifyReport};
