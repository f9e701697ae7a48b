#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{AssetError, ConstructionKind, Result};

pub mod utils;

mod heap;
pub use heap::SpanningHeap;

pub mod vfs;
pub use vfs::{
    mount::MountingTree, FileDesc, FileMonitor, FileSnapshot, FileState, FileSystem, Marker,
    TranslateResult,
};

pub mod depval;
pub use depval::{DependencyValidation, DependentFileState, DepValSystem};

pub mod artifact;
pub use artifact::{
    Artifact, ArtifactCollection, ArtifactDataForm, ArtifactRequest, ArtifactRequestResult,
    SerializedTarget, VERSION_ANY,
};

pub mod store;
pub use store::{
    ArchivedStore, CompileProductsGroupId, IntermediatesStore, MemoryStore, ProgressiveStore,
    ProgressiveStoreOptions, VersionDesc,
};

pub mod compile;
pub use compile::{
    simple_compiler, ArtifactFuture, ArtifactOutcome, CompileDelegate, CompileMarker,
    CompileOperation, CompilerDesc, CompilerRegistration, CompilerRegistry, Conduit, Initializer,
    InitializerPack, OperationContext,
};

pub mod pool;
pub use pool::{SharedFuture, ThreadPool};

use std::sync::Arc;

/// Shared immutable byte payload, the currency of artifacts and blobs.
pub type Blob = Arc<[u8]>;

pub fn as_blob(data: impl AsRef<[u8]>) -> Blob {
    Arc::from(data.as_ref())
}

/// Lossy view of a blob as text, for logs and error payloads.
pub fn blob_to_string(blob: &Blob) -> String {
    String::from_utf8_lossy(blob).into_owned()
}

/// State of an asset or artifact collection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AssetState {
    Pending,
    Ready,
    Invalid,
}

impl Default for AssetState {
    fn default() -> Self {
        AssetState::Ready
    }
}

/// Derives a chunk-type code from a short tag.
pub const fn chunk_type_code(tag: &[u8]) -> u64 {
    utils::fnv1a64(tag, utils::FNV_OFFSET_BASIS)
}

/// Textual diagnostic output; always surfaced on compile failure.
pub const CHUNK_TYPE_LOG: u64 = chunk_type_code(b"Log");
/// Profiling sidecar; never required by clients.
pub const CHUNK_TYPE_METRICS: u64 = chunk_type_code(b"Metrics");
/// Combined main artifact file when loose-files mode packs several chunks
/// into one file.
pub const CHUNK_TYPE_MULTI_CHUNK: u64 = chunk_type_code(b"MultiChunk");

/// The shared service context the pipeline components hang off: the mounting
/// tree namespace, the dependency-validation system built over it, and the
/// thread pool compile tasks run on.
///
/// These are explicit values rather than process globals so that tests and
/// embedders can run several isolated pipelines side by side.
#[derive(Clone)]
pub struct AssetServices {
    mounting_tree: Arc<MountingTree>,
    depval: Arc<DepValSystem>,
    pool: Arc<ThreadPool>,
}

impl AssetServices {
    pub fn new() -> Self {
        Self::with_pool_size(num_cpus::get().max(2))
    }

    pub fn with_pool_size(workers: usize) -> Self {
        let mounting_tree = Arc::new(MountingTree::new());
        let depval = DepValSystem::new(mounting_tree.clone());
        let pool = Arc::new(ThreadPool::new(workers));
        Self { mounting_tree, depval, pool }
    }

    pub fn mounting_tree(&self) -> &Arc<MountingTree> {
        &self.mounting_tree
    }

    pub fn depval(&self) -> &Arc<DepValSystem> {
        &self.depval
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }
}

impl Default for AssetServices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_codes_are_distinct() {
        assert_ne!(CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS);
        assert_ne!(CHUNK_TYPE_LOG, CHUNK_TYPE_MULTI_CHUNK);
        assert_ne!(CHUNK_TYPE_METRICS, CHUNK_TYPE_MULTI_CHUNK);
    }
}
