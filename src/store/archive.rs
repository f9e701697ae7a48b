//! Archive cache: many artifact collections in one data file.
//!
//! An archive is a data file of artifact payloads placed by an in-file span
//! allocator, plus a `.dir` sidecar describing blocks, collections and the
//! dependency table. The sidecar alone is enough to reconstruct the
//! directory structures; the data file is never scanned.
//!
//! Commits buffer in memory until [`ArchiveCache::flush_to_disk`]. A flush
//! frees the blocks of every rewritten entry, allocates space for the new
//! payloads (appending only when no freed span fits), writes payload bytes,
//! and rewrites the sidecar last, so the on-disk pair is always either the
//! pre-commit or the post-commit state. Collections opened from an entry
//! carry the entry's change id; a later commit to the same entry advances
//! it, and stale collections fail their reads rather than returning mixed
//! data.

use super::{try_register_dependency, ReadRef, VersionDesc};
use crate::{
    artifact::{
        self, Artifact, ArtifactCollection, ArtifactDataForm, ArtifactRequest,
        ArtifactRequestResult, BlobFile,
    },
    depval::{DependencyValidation, DependentFileState, DepValSystem},
    error::{AssetError, Result},
    heap::SpanningHeap,
    utils,
    vfs::{open_file, FileInterface, FileSystem, OpenMode, ShareMode},
    AssetState, Blob,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{Read as _, Seek as _, SeekFrom, Write as _},
    sync::{Arc, Mutex, Weak},
};

type FlushCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockRecord {
    entry_id: u64,
    offset: u64,
    size: u64,
    chunk_type_code: u64,
    version: u32,
    name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CollectionRecord {
    entry_id: u64,
    descriptive_name: String,
    state: AssetState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DependencyRecord {
    entry_id: u64,
    #[serde(flatten)]
    state: DependentFileState,
}

/// The sidecar contents. An internal format, versioned by the owning
/// store's version strings rather than kept interop-stable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ArchiveDirectory {
    version_string: String,
    date_string: String,
    blocks: Vec<BlockRecord>,
    collections: Vec<CollectionRecord>,
    dependencies: Vec<DependencyRecord>,
}

struct PendingCommit {
    entry_id: u64,
    descriptive_name: String,
    artifacts: Vec<Artifact>,
    state: AssetState,
    dependencies: Vec<DependentFileState>,
    on_flush: Option<FlushCallback>,
}

#[derive(Default)]
struct ArchiveInner {
    pending: Vec<PendingCommit>,
    /// Lazily loaded; replaced wholesale whenever the archive is modified.
    directory: Option<ArchiveDirectory>,
    change_ids: HashMap<u64, u32>,
}

/// Block-level breakdown returned by [`ArchiveCache::metrics`].
#[derive(Clone, Debug)]
pub struct BlockMetrics {
    pub entry_id: u64,
    pub offset: u64,
    pub size: u64,
    pub attached_string: String,
}

#[derive(Clone, Debug, Default)]
pub struct ArchiveMetrics {
    pub allocated_file_size: u64,
    pub used_space: u64,
    pub blocks: Vec<BlockMetrics>,
}

/// One archive: a data file plus its directory sidecar.
pub struct ArchiveCache {
    filesystem: Option<Arc<dyn FileSystem>>,
    main_file_name: String,
    directory_file_name: String,
    version: VersionDesc,
    check_depvals: bool,
    depval: Arc<DepValSystem>,
    self_weak: Weak<ArchiveCache>,
    inner: Mutex<ArchiveInner>,
}

impl ArchiveCache {
    /// `filesystem: None` keeps every commit pending in memory forever,
    /// which is how the in-memory store operates.
    pub fn new(
        filesystem: Option<Arc<dyn FileSystem>>,
        archive_name: &str,
        version: VersionDesc,
        depval: Arc<DepValSystem>,
        check_depvals: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            filesystem,
            main_file_name: archive_name.to_string(),
            directory_file_name: format!("{archive_name}.dir"),
            version,
            check_depvals,
            depval,
            self_weak: self_weak.clone(),
            inner: Mutex::new(ArchiveInner::default()),
        })
    }

    /// Buffers a (re)write of `entry_id`. Supersedes any pending commit to
    /// the same entry and invalidates collections issued before this call.
    pub fn commit(
        &self,
        entry_id: u64,
        descriptive_name: &str,
        artifacts: Vec<Artifact>,
        state: AssetState,
        dependencies: Vec<DependentFileState>,
        on_flush: Option<FlushCallback>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.retain(|p| p.entry_id != entry_id);
        *inner.change_ids.entry(entry_id).or_insert(0) += 1;
        inner.pending.push(PendingCommit {
            entry_id,
            descriptive_name: descriptive_name.to_string(),
            artifacts,
            state,
            dependencies,
            on_flush,
        });
        trace!(archive = %self.main_file_name, entry_id, "buffered archive commit");
    }

    /// Opens the artifact collection for `entry_id`, serving a pending
    /// commit from memory or a flushed one from disk. `None` when the entry
    /// does not exist or its recorded dependencies are stale.
    pub fn try_open_from_cache(&self, entry_id: u64) -> Result<Option<Arc<ArtifactCollection>>> {
        self.try_open_internal(entry_id, None)
    }

    pub(crate) fn try_open_internal(
        &self,
        entry_id: u64,
        read_ref: Option<ReadRef>,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        let cache = self.self_weak.upgrade().expect("archive caches are always Arc-owned");
        let mut inner = self.inner.lock().unwrap();
        let issued_change_id = inner.change_ids.get(&entry_id).copied().unwrap_or(0);

        let (state, descriptive_name, dependencies) =
            if let Some(pending) = inner.pending.iter().find(|p| p.entry_id == entry_id) {
                (pending.state, pending.descriptive_name.clone(), pending.dependencies.clone())
            } else {
                let Some(directory) = self.load_directory_locked(&mut inner)? else {
                    return Ok(None);
                };
                let Some(record) =
                    directory.collections.iter().find(|c| c.entry_id == entry_id)
                else {
                    return Ok(None);
                };
                let dependencies = directory
                    .dependencies
                    .iter()
                    .filter(|d| d.entry_id == entry_id)
                    .map(|d| d.state.clone())
                    .collect();
                (record.state, record.descriptive_name.clone(), dependencies)
            };
        drop(inner);

        let depval = self.depval.make();
        let mut still_valid = true;
        for dependency in &dependencies {
            still_valid &= try_register_dependency(&depval, &self.depval, dependency);
        }
        if self.check_depvals && !still_valid {
            return Ok(None);
        }

        Ok(Some(Arc::new(ArtifactCollection::ArchiveEntry(ArchiveEntryCollection {
            cache,
            entry_id,
            issued_change_id,
            depval,
            state,
            descriptive_name,
            _read_ref: read_ref,
        }))))
    }

    /// Applies every pending commit. No-op for memory-backed archives.
    pub fn flush_to_disk(&self) {
        if let Err(err) = self.try_flush() {
            error!(archive = %self.main_file_name, "archive flush failed: {err}");
        }
    }

    fn try_flush(&self) -> Result<()> {
        let Some(filesystem) = &self.filesystem else { return Ok(()) };

        let mut callbacks = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.is_empty() {
                return Ok(());
            }

            let mut directory = match self.load_directory_locked(&mut inner)? {
                Some(directory) => directory.clone(),
                None => ArchiveDirectory {
                    version_string: self.version.version_string.clone(),
                    date_string: self.version.build_date_string.clone(),
                    ..Default::default()
                },
            };
            let mut heap = rebuild_heap(&directory.blocks);

            let mut data_file = open_file(
                &**filesystem,
                &self.main_file_name,
                OpenMode::ReadWrite,
                ShareMode::None,
            )?;

            let pending = std::mem::take(&mut inner.pending);
            for mut commit in pending {
                // release the entry's existing blocks back to the heap
                for block in directory.blocks.iter().filter(|b| b.entry_id == commit.entry_id) {
                    if block.size != 0 {
                        heap.deallocate(block.offset, block.size);
                    }
                }
                directory.blocks.retain(|b| b.entry_id != commit.entry_id);
                directory.collections.retain(|c| c.entry_id != commit.entry_id);
                directory.dependencies.retain(|d| d.entry_id != commit.entry_id);

                for artifact in &commit.artifacts {
                    let size = artifact.data.len() as u64;
                    let offset = if size == 0 { 0 } else { heap.allocate_or_append(size) };
                    if size != 0 {
                        data_file
                            .seek(SeekFrom::Start(offset))
                            .and_then(|_| data_file.write_all(&artifact.data))
                            .map_err(|e| AssetError::io(e, &self.main_file_name))?;
                    }
                    directory.blocks.push(BlockRecord {
                        entry_id: commit.entry_id,
                        offset,
                        size,
                        chunk_type_code: artifact.chunk_type_code,
                        version: artifact.version,
                        name: artifact.name.clone(),
                    });
                }
                directory.collections.push(CollectionRecord {
                    entry_id: commit.entry_id,
                    descriptive_name: commit.descriptive_name.clone(),
                    state: commit.state,
                });
                directory.dependencies.extend(commit.dependencies.drain(..).map(|state| {
                    DependencyRecord { entry_id: commit.entry_id, state }
                }));

                if let Some(callback) = commit.on_flush.take() {
                    callbacks.push(callback);
                }
            }
            data_file.flush().map_err(|e| AssetError::io(e, &self.main_file_name))?;
            drop(data_file);

            // directory last: readers see the old complete state until the
            // sidecar is replaced
            let serialized = serde_json::to_vec_pretty(&directory)?;
            let mut directory_file = open_file(
                &**filesystem,
                &self.directory_file_name,
                OpenMode::Write,
                ShareMode::None,
            )?;
            directory_file
                .write_all(&serialized)
                .and_then(|_| directory_file.flush())
                .map_err(|e| AssetError::io(e, &self.directory_file_name))?;

            debug!(
                archive = %self.main_file_name,
                entries = directory.collections.len(),
                "flushed archive cache"
            );
            inner.directory = Some(directory);
        }

        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    fn load_directory_locked<'a>(
        &self,
        inner: &'a mut ArchiveInner,
    ) -> Result<Option<&'a ArchiveDirectory>> {
        if inner.directory.is_none() {
            let Some(filesystem) = &self.filesystem else { return Ok(None) };
            let contents = match open_file(
                &**filesystem,
                &self.directory_file_name,
                OpenMode::Read,
                ShareMode::Read,
            ) {
                Ok(mut file) => crate::vfs::read_entire_file(file.as_mut())
                    .map_err(|e| AssetError::io(e, &self.directory_file_name))?,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            let directory: ArchiveDirectory = match serde_json::from_slice(&contents) {
                Ok(directory) => directory,
                Err(err) => {
                    warn!(
                        archive = %self.main_file_name,
                        "discarding unreadable archive directory: {err}"
                    );
                    return Ok(None);
                }
            };
            if directory.version_string != self.version.version_string {
                // caches from other code versions stay disjoint
                return Ok(None);
            }
            inner.directory = Some(directory);
        }
        Ok(inner.directory.as_ref())
    }

    fn resolve_entry(
        &self,
        entry_id: u64,
        issued_change_id: u32,
        depval: &DependencyValidation,
        requests: &[ArtifactRequest],
    ) -> Result<Vec<ArtifactRequestResult>> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.change_ids.get(&entry_id).copied().unwrap_or(0);
        if current != issued_change_id {
            return Err(AssetError::StaleReference(format!(
                "{}#{entry_id:x} was rewritten after this collection was opened",
                self.main_file_name
            )));
        }

        if let Some(pending) = inner.pending.iter().find(|p| p.entry_id == entry_id) {
            return artifact::resolve_from_artifacts(
                &pending.artifacts,
                &pending.descriptive_name,
                depval,
                requests,
            );
        }

        let blocks: Vec<BlockRecord> = {
            let Some(directory) = self.load_directory_locked(&mut inner)? else {
                return Err(AssetError::construction(
                    crate::ConstructionKind::MissingFile,
                    format!("archive entry {entry_id:x} vanished from {}", self.main_file_name),
                    Some(depval.clone()),
                ));
            };
            directory.blocks.iter().filter(|b| b.entry_id == entry_id).cloned().collect()
        };
        drop(inner);

        let filesystem =
            self.filesystem.as_ref().expect("flushed entries only exist with a filesystem");
        let mut data_file: Option<Box<dyn FileInterface>> = None;
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let block = blocks
                .iter()
                .find(|b| b.chunk_type_code == request.chunk_type_code)
                .ok_or_else(|| {
                    artifact::missing_chunk_error(&self.main_file_name, request, depval)
                })?;
            if request.expected_version != artifact::VERSION_ANY
                && block.version != request.expected_version
            {
                return Err(artifact::version_mismatch_error(request, block.version, depval));
            }

            if data_file.is_none() {
                data_file = Some(open_file(
                    &**filesystem,
                    &self.main_file_name,
                    OpenMode::Read,
                    ShareMode::Read,
                )?);
            }
            let file = data_file.as_mut().expect("opened above");
            let mut data = vec![0u8; block.size as usize];
            file.seek(SeekFrom::Start(block.offset))
                .and_then(|_| file.read_exact(&mut data))
                .map_err(|e| AssetError::io(e, &self.main_file_name))?;

            results.push(match request.data_form {
                ArtifactDataForm::SharedBlob => ArtifactRequestResult::from_blob(Blob::from(data)),
                ArtifactDataForm::Raw | ArtifactDataForm::TypedBlock => {
                    ArtifactRequestResult::from_bytes(&data)
                }
                ArtifactDataForm::ReopenFunction => {
                    let blob = Blob::from(data);
                    ArtifactRequestResult::from_reopen(Arc::new(move || {
                        Ok(Box::new(BlobFile::new(blob.clone())) as Box<dyn FileInterface>)
                    }))
                }
                ArtifactDataForm::Filename => {
                    return Err(AssetError::construction(
                        crate::ConstructionKind::FormatError,
                        "filename requests are only valid for loose-files storage",
                        Some(depval.clone()),
                    ));
                }
            });
        }
        Ok(results)
    }

    /// Profiling breakdown of the flushed archive contents.
    pub fn metrics(&self) -> ArchiveMetrics {
        let mut inner = self.inner.lock().unwrap();
        let Ok(Some(directory)) = self.load_directory_locked(&mut inner) else {
            return ArchiveMetrics::default();
        };
        let heap = rebuild_heap(&directory.blocks);
        let attached: HashMap<u64, &str> = directory
            .collections
            .iter()
            .map(|c| (c.entry_id, c.descriptive_name.as_str()))
            .collect();
        ArchiveMetrics {
            allocated_file_size: heap.heap_end(),
            used_space: heap.used_space(),
            blocks: directory
                .blocks
                .iter()
                .map(|b| BlockMetrics {
                    entry_id: b.entry_id,
                    offset: b.offset,
                    size: b.size,
                    attached_string: attached
                        .get(&b.entry_id)
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// Reconstructs the in-file allocator state from the block list alone.
fn rebuild_heap(blocks: &[BlockRecord]) -> SpanningHeap {
    let mut spans: Vec<(u64, u64)> =
        blocks.iter().filter(|b| b.size != 0).map(|b| (b.offset, b.size)).collect();
    spans.sort_unstable();

    let mut heap = SpanningHeap::new();
    let total = spans.iter().map(|&(offset, size)| offset + size).max().unwrap_or(0);
    if total == 0 {
        return heap;
    }
    heap.append_new_block(total);
    let mut cursor = 0;
    for (offset, size) in spans {
        if offset > cursor {
            heap.deallocate(cursor, offset - cursor);
        }
        cursor = offset + size;
    }
    heap
}

/// Artifact collection backed by one archive entry. Reads go back to the
/// archive on demand; if the entry is committed again in the meantime the
/// collection is stale and its reads fail.
pub struct ArchiveEntryCollection {
    cache: Arc<ArchiveCache>,
    entry_id: u64,
    issued_change_id: u32,
    depval: DependencyValidation,
    state: AssetState,
    descriptive_name: String,
    _read_ref: Option<ReadRef>,
}

impl ArchiveEntryCollection {
    pub(crate) fn resolve_requests(
        &self,
        requests: &[ArtifactRequest],
    ) -> Result<Vec<ArtifactRequestResult>> {
        self.cache.resolve_entry(self.entry_id, self.issued_change_id, &self.depval, requests)
    }

    pub(crate) fn dependency_validation(&self) -> DependencyValidation {
        self.depval.clone()
    }

    pub(crate) fn asset_state(&self) -> AssetState {
        self.state
    }

    pub(crate) fn request_parameters(&self) -> &str {
        ""
    }

    pub fn descriptive_name(&self) -> &str {
        &self.descriptive_name
    }
}

/// Keyed set of archive caches sharing one filesystem and version.
pub struct ArchiveCacheSet {
    filesystem: Option<Arc<dyn FileSystem>>,
    base_directory: String,
    version: VersionDesc,
    depval: Arc<DepValSystem>,
    check_depvals: bool,
    archives: Mutex<HashMap<u64, Arc<ArchiveCache>>>,
}

impl ArchiveCacheSet {
    pub fn new(
        filesystem: Option<Arc<dyn FileSystem>>,
        base_directory: impl Into<String>,
        version: VersionDesc,
        depval: Arc<DepValSystem>,
        check_depvals: bool,
    ) -> Self {
        Self {
            filesystem,
            base_directory: base_directory.into(),
            version,
            depval,
            check_depvals,
            archives: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_archive(&self, archive_name: &str) -> Result<Arc<ArchiveCache>> {
        let path = if self.base_directory.is_empty() {
            archive_name.to_string()
        } else {
            format!("{}/{archive_name}", self.base_directory)
        };
        let key = utils::hash_filename(&path, utils::FilenameRules::default());
        let mut archives = self.archives.lock().unwrap();
        Ok(archives
            .entry(key)
            .or_insert_with(|| {
                ArchiveCache::new(
                    self.filesystem.clone(),
                    &path,
                    self.version.clone(),
                    self.depval.clone(),
                    self.check_depvals,
                )
            })
            .clone())
    }

    pub fn flush_to_disk(&self) {
        let archives: Vec<Arc<ArchiveCache>> =
            self.archives.lock().unwrap().values().cloned().collect();
        for archive in archives {
            archive.flush_to_disk();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{as_blob, vfs::os::OsFileSystem, AssetServices};
    use pretty_assertions::assert_eq;

    fn archive_fixture(
        dir: &std::path::Path,
    ) -> (AssetServices, Arc<ArchiveCache>) {
        let services = AssetServices::with_pool_size(1);
        let filesystem: Arc<dyn FileSystem> = Arc::new(OsFileSystem::new(dir.to_path_buf()));
        let cache = ArchiveCache::new(
            Some(filesystem),
            "shaders.pak",
            VersionDesc::new("v1", "today"),
            services.depval().clone(),
            false,
        );
        (services, cache)
    }

    fn entry_artifacts(payload: &str) -> Vec<Artifact> {
        vec![
            Artifact::new(0x0100, 1, "bytecode", as_blob(payload)),
            Artifact::new(0x0200, 1, "reflection", as_blob("reflection-data")),
        ]
    }

    fn read_chunk(collection: &ArtifactCollection, chunk: u64) -> Vec<u8> {
        let results = collection
            .resolve_requests(&[ArtifactRequest {
                name: "chunk",
                chunk_type_code: chunk,
                expected_version: artifact::VERSION_ANY,
                data_form: ArtifactDataForm::SharedBlob,
            }])
            .unwrap();
        results[0].shared_blob.as_ref().unwrap().to_vec()
    }

    #[test]
    fn pending_commits_serve_from_memory_then_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (_services, cache) = archive_fixture(dir.path());

        cache.commit(7, "entry-seven", entry_artifacts("payload-7"), AssetState::Ready, Vec::new(), None);
        let before_flush = cache.try_open_from_cache(7).unwrap().unwrap();
        assert_eq!(read_chunk(&before_flush, 0x0100), b"payload-7");

        cache.flush_to_disk();
        let after_flush = cache.try_open_from_cache(7).unwrap().unwrap();
        assert_eq!(read_chunk(&after_flush, 0x0100), b"payload-7");
        assert_eq!(read_chunk(&after_flush, 0x0200), b"reflection-data");
        assert!(dir.path().join("shaders.pak").exists());
        assert!(dir.path().join("shaders.pak.dir").exists());
    }

    #[test]
    fn reopened_archive_reproduces_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_services, cache) = archive_fixture(dir.path());
            cache.commit(1, "one", entry_artifacts("first"), AssetState::Ready, Vec::new(), None);
            cache.commit(2, "two", entry_artifacts("second"), AssetState::Ready, Vec::new(), None);
            cache.flush_to_disk();
        }

        let (_services, cache) = archive_fixture(dir.path());
        let one = cache.try_open_from_cache(1).unwrap().unwrap();
        let two = cache.try_open_from_cache(2).unwrap().unwrap();
        assert_eq!(read_chunk(&one, 0x0100), b"first");
        assert_eq!(read_chunk(&two, 0x0100), b"second");
        assert!(cache.try_open_from_cache(3).unwrap().is_none());
    }

    #[test]
    fn superseding_commit_invalidates_issued_collections() {
        let dir = tempfile::tempdir().unwrap();
        let (_services, cache) = archive_fixture(dir.path());

        cache.commit(9, "nine", entry_artifacts("old"), AssetState::Ready, Vec::new(), None);
        cache.flush_to_disk();
        let stale = cache.try_open_from_cache(9).unwrap().unwrap();

        cache.commit(9, "nine", entry_artifacts("new"), AssetState::Ready, Vec::new(), None);
        let err = stale
            .resolve_requests(&[ArtifactRequest {
                name: "bytecode",
                chunk_type_code: 0x0100,
                expected_version: 1,
                data_form: ArtifactDataForm::SharedBlob,
            }])
            .unwrap_err();
        assert!(matches!(err, AssetError::StaleReference(_)));

        let fresh = cache.try_open_from_cache(9).unwrap().unwrap();
        assert_eq!(read_chunk(&fresh, 0x0100), b"new");
    }

    #[test]
    fn rewrite_reuses_freed_space() {
        let dir = tempfile::tempdir().unwrap();
        let (_services, cache) = archive_fixture(dir.path());

        cache.commit(1, "a", entry_artifacts("aaaaaaaaaaaaaaaa"), AssetState::Ready, Vec::new(), None);
        cache.flush_to_disk();
        let size_before = cache.metrics().allocated_file_size;

        // same-size rewrite lands in the freed spans, not at the end
        cache.commit(1, "a", entry_artifacts("bbbbbbbbbbbbbbbb"), AssetState::Ready, Vec::new(), None);
        cache.flush_to_disk();
        let metrics = cache.metrics();
        assert_eq!(metrics.allocated_file_size, size_before);
        assert_eq!(metrics.used_space, size_before);
        assert_eq!(metrics.blocks.len(), 2);
        assert!(metrics.blocks.iter().all(|b| b.attached_string == "a"));
    }

    #[test]
    fn flush_callback_runs_on_flush() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let dir = tempfile::tempdir().unwrap();
        let (_services, cache) = archive_fixture(dir.path());

        let flushed = Arc::new(AtomicBool::new(false));
        let flag = flushed.clone();
        cache.commit(
            4,
            "four",
            entry_artifacts("x"),
            AssetState::Ready,
            Vec::new(),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        );
        assert!(!flushed.load(Ordering::SeqCst));
        cache.flush_to_disk();
        assert!(flushed.load(Ordering::SeqCst));
    }
}
