//! The intermediates store: persistent caching of compile products.
//!
//! A store answers two questions for the dispatcher: "do we already have
//! artifacts for this request?" and "record these artifacts so the next
//! process run can reuse them". Products are grouped by compiler identity
//! (short name + version), so one backend's outputs never collide with
//! another's, and a compiler upgrade naturally starts a fresh namespace.
//!
//! Storage is either loose files (one product per file plus a manifest
//! sidecar) or packed archive caches, chosen per group and per request.
//! Dependencies recorded at store time are re-validated on retrieve: an
//! entry whose recorded file snapshots no longer match the current state of
//! the filesystem is treated as absent.
//!
//! Concurrency: the group table is behind a readers-writer lock (group
//! registration takes the writer side, product traffic the reader side),
//! and per-fingerprint read/write reference counts enforce that a product
//! being written is not simultaneously read, and vice versa.

use crate::{
    artifact::{Artifact, ArtifactCollection},
    depval::{DependencyValidation, DependentFileState, DepValSystem},
    error::{AssetError, Result},
    utils,
    vfs::{os::OsFileSystem, FileSystem},
    AssetState,
};
use std::{
    collections::HashMap,
    fs,
    io::Read as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

pub mod archive;
pub mod loose;

pub use archive::{ArchiveCache, ArchiveCacheSet};
pub use loose::LooseFilesStorage;

/// Names a (compiler-short-name, compiler-version) namespace within a store.
pub type CompileProductsGroupId = u32;

/// Identity of the code that produced a set of artifacts. Products from
/// different versions are kept disjoint rather than migrated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionDesc {
    pub version_string: String,
    pub build_date_string: String,
}

impl VersionDesc {
    pub fn new(version_string: impl Into<String>, build_date_string: impl Into<String>) -> Self {
        Self {
            version_string: version_string.into(),
            build_date_string: build_date_string.into(),
        }
    }
}

/// Registers `state` on `depval` and reports whether the recorded snapshot
/// still matches the file's current one.
pub(crate) fn try_register_dependency(
    depval: &DependencyValidation,
    system: &DepValSystem,
    state: &DependentFileState,
) -> bool {
    let current = system.get_dependent_file_state(&state.filename);
    depval.register_file_state(state);
    let still_valid = current.snapshot == state.snapshot;
    if !still_valid {
        trace!(
            filename = %state.filename,
            "stored dependency superseded (recorded {:?}, current {:?})",
            state.snapshot,
            current.snapshot
        );
    }
    still_valid
}

/// Folds the dependent-file states of several validations into one list,
/// keeping the earliest modification time where a file repeats.
pub(crate) fn collate_dependencies(depvals: &[DependencyValidation]) -> Vec<DependentFileState> {
    let mut merged: Vec<DependentFileState> = Vec::new();
    for depval in depvals {
        for state in depval.collate_dependent_file_states() {
            match merged.iter_mut().find(|m| m.filename == state.filename) {
                Some(existing) => {
                    if state.snapshot.modification_time < existing.snapshot.modification_time {
                        existing.snapshot = state.snapshot;
                    }
                }
                None => merged.push(state),
            }
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// per-fingerprint read/write reference counts

#[derive(Default)]
struct RefCountsInner {
    readers: HashMap<u64, u32>,
    writers: HashMap<u64, ()>,
}

/// Global table enforcing, per fingerprint: at most one writer, no writer
/// while any reader, no reader while a writer.
#[derive(Default)]
pub struct StoreRefCounts {
    inner: Mutex<RefCountsInner>,
}

impl StoreRefCounts {
    fn acquire_read(self: &Arc<Self>, hash_code: u64, descriptive_name: &str) -> Result<ReadRef> {
        let mut inner = self.inner.lock().unwrap();
        if inner.writers.contains_key(&hash_code) {
            return Err(AssetError::msg(format!(
                "attempting to read compile products while a write is in flight: {descriptive_name}"
            )));
        }
        *inner.readers.entry(hash_code).or_insert(0) += 1;
        Ok(ReadRef { counts: self.clone(), hash_code })
    }

    fn acquire_write(self: &Arc<Self>, hash_code: u64, descriptive_name: &str) -> Result<WriteRef> {
        let mut inner = self.inner.lock().unwrap();
        if inner.writers.contains_key(&hash_code) {
            return Err(AssetError::msg(format!(
                "multiple writers attempting to store the same compile products: {descriptive_name}"
            )));
        }
        if inner.readers.get(&hash_code).copied().unwrap_or(0) != 0 {
            return Err(AssetError::msg(format!(
                "attempting to store compile products while readers are in flight: {descriptive_name}"
            )));
        }
        inner.writers.insert(hash_code, ());
        Ok(WriteRef { counts: self.clone(), hash_code })
    }

    #[cfg(test)]
    pub(crate) fn readers_in_flight(&self, hash_code: u64) -> u32 {
        self.inner.lock().unwrap().readers.get(&hash_code).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn writer_in_flight(&self, hash_code: u64) -> bool {
        self.inner.lock().unwrap().writers.contains_key(&hash_code)
    }
}

/// Held for the lifetime of every artifact collection handed out of a
/// store; keeps writers away from the products backing it.
pub(crate) struct ReadRef {
    counts: Arc<StoreRefCounts>,
    hash_code: u64,
}

impl Drop for ReadRef {
    fn drop(&mut self) {
        let mut inner = self.counts.inner.lock().unwrap();
        match inner.readers.get_mut(&self.hash_code) {
            Some(count) if *count > 0 => *count -= 1,
            _ => error!("missing read reference during store cleanup"),
        }
    }
}

pub(crate) struct WriteRef {
    counts: Arc<StoreRefCounts>,
    hash_code: u64,
}

impl Drop for WriteRef {
    fn drop(&mut self) {
        self.counts.inner.lock().unwrap().writers.remove(&self.hash_code);
    }
}

// ---------------------------------------------------------------------------
// store interface

/// Front-end over the loose-files and archive caches.
pub trait IntermediatesStore: Send + Sync {
    /// Writes `artifacts` under a synthesized loose-files name and returns
    /// a collection reading them back from the store.
    fn store_compile_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<Arc<ArtifactCollection>>;

    /// `None` when there is no entry, or the entry's recorded dependencies
    /// are stale. Missing cache entries are normal, not errors.
    fn retrieve_compile_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>>;

    /// Commits `artifacts` into an archive cache entry.
    fn store_compile_products_in_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        descriptive_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<()>;

    fn retrieve_compile_products_from_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>>;

    /// Registers (or refcounts an existing) products group for a compiler.
    fn register_compile_products_group(
        &self,
        short_name: &str,
        version: &VersionDesc,
        enable_archive: bool,
    ) -> Result<CompileProductsGroupId>;

    /// Drops one reference; the last deregistration flushes the group.
    fn deregister_compile_products_group(&self, group: CompileProductsGroupId);

    /// Whether this store accepts writes at all.
    fn allow_store(&self) -> bool;

    /// Applies pending archive commits.
    fn flush_to_disk(&self);
}

// ---------------------------------------------------------------------------
// shared group plumbing

struct Group {
    ref_count: u32,
    key: u64,
    loose: Option<Arc<LooseFilesStorage>>,
    archives: Option<Arc<ArchiveCacheSet>>,
}

#[derive(Default)]
struct Groups {
    map: HashMap<CompileProductsGroupId, Group>,
    by_key: HashMap<u64, CompileProductsGroupId>,
    next_id: CompileProductsGroupId,
}

struct StoreBase {
    groups: RwLock<Groups>,
    ref_counts: Arc<StoreRefCounts>,
    depval: Arc<DepValSystem>,
    allow_store: bool,
}

impl StoreBase {
    fn new(depval: Arc<DepValSystem>, allow_store: bool) -> Self {
        Self {
            groups: RwLock::new(Groups::default()),
            ref_counts: Arc::new(StoreRefCounts::default()),
            depval,
            allow_store,
        }
    }

    fn group_key(short_name: &str, version: &VersionDesc) -> u64 {
        utils::hash_combine(
            utils::fnv1a64(version.version_string.as_bytes(), utils::FNV_OFFSET_BASIS),
            utils::fnv1a64(short_name.as_bytes(), utils::FNV_OFFSET_BASIS),
        )
    }

    fn safe_group_name(short_name: &str, version: &VersionDesc) -> String {
        let mut name = utils::make_safe_name(short_name, 64);
        if !version.version_string.is_empty() {
            name.push('-');
            name.push_str(&utils::make_safe_name(&version.version_string, 32));
        }
        name
    }

    fn register_group(
        &self,
        short_name: &str,
        version: &VersionDesc,
        make: impl FnOnce(&str) -> Result<(Option<Arc<LooseFilesStorage>>, Option<Arc<ArchiveCacheSet>>)>,
    ) -> Result<CompileProductsGroupId> {
        let key = Self::group_key(short_name, version);
        let mut groups = self.groups.write().unwrap();
        if let Some(&id) = groups.by_key.get(&key) {
            groups.map.get_mut(&id).expect("indexed group exists").ref_count += 1;
            return Ok(id);
        }
        let safe_name = Self::safe_group_name(short_name, version);
        let (loose, archives) = make(&safe_name)?;
        let id = groups.next_id;
        groups.next_id += 1;
        groups.map.insert(id, Group { ref_count: 1, key, loose, archives });
        groups.by_key.insert(key, id);
        debug!(short_name, group = id, "registered compile products group");
        Ok(id)
    }

    fn deregister_group(&self, id: CompileProductsGroupId) {
        let removed = {
            let mut groups = self.groups.write().unwrap();
            let Some(group) = groups.map.get_mut(&id) else { return };
            group.ref_count -= 1;
            if group.ref_count != 0 {
                return;
            }
            let group = groups.map.remove(&id).expect("present above");
            groups.by_key.remove(&group.key);
            group
        };
        if let Some(archives) = &removed.archives {
            archives.flush_to_disk();
        }
    }

    fn products_hash(archivable_name: &str, group: CompileProductsGroupId) -> u64 {
        utils::hash_combine(
            utils::hash_filename(archivable_name, utils::FilenameRules::default()),
            group as u64,
        )
    }

    fn archive_hash(archive_name: &str, entry_id: u64, group: CompileProductsGroupId) -> u64 {
        utils::hash_combine(
            utils::hash_combine(
                utils::hash_filename(archive_name, utils::FilenameRules::default()),
                entry_id,
            ),
            group as u64,
        )
    }

    fn with_group<R>(
        &self,
        group: CompileProductsGroupId,
        operate: impl FnOnce(&Group) -> Result<R>,
    ) -> Result<R> {
        let groups = self.groups.read().unwrap();
        let entry = groups.map.get(&group).ok_or_else(|| {
            AssetError::msg(format!("compile products group {group} has never been registered"))
        })?;
        operate(entry)
    }

    fn store_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<Arc<ArtifactCollection>> {
        if !self.allow_store {
            return Err(AssetError::msg("this intermediates store does not allow writes"));
        }
        let hash_code = Self::products_hash(archivable_name, group);
        let recorded = collate_dependencies(dependencies);

        let (loose, products) = self.with_group(group, |entry| {
            let loose = entry
                .loose
                .clone()
                .ok_or_else(|| AssetError::msg("group has no loose-files storage"))?;
            let write_ref = self.ref_counts.acquire_write(hash_code, archivable_name)?;
            let products =
                loose.store_compile_products(archivable_name, artifacts, state, &recorded)?;
            drop(write_ref);
            Ok((loose, products))
        })?;

        // the read reference is taken only after the writer has retired
        let read_ref = self.ref_counts.acquire_read(hash_code, archivable_name)?;
        let collection = loose
            .make_collection(products, read_ref, false)?
            .expect("freshly stored products always materialize");
        Ok(collection)
    }

    fn retrieve_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        let hash_code = Self::products_hash(archivable_name, group);
        self.with_group(group, |entry| {
            let Some(loose) = entry.loose.clone() else { return Ok(None) };
            let read_ref = self.ref_counts.acquire_read(hash_code, archivable_name)?;
            let Some(products) = loose.retrieve_products_file(archivable_name)? else {
                return Ok(None);
            };
            loose.make_collection(products, read_ref, true)
        })
    }

    fn store_in_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        descriptive_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<()> {
        if !self.allow_store {
            return Err(AssetError::msg("this intermediates store does not allow writes"));
        }
        let hash_code = Self::archive_hash(archive_name, entry_id, group);
        let recorded = collate_dependencies(dependencies);
        self.with_group(group, |entry| {
            let archives = entry
                .archives
                .clone()
                .ok_or_else(|| AssetError::msg("group was registered without archive storage"))?;
            let _write_ref = self.ref_counts.acquire_write(hash_code, descriptive_name)?;
            let archive = archives.get_archive(archive_name)?;
            archive.commit(entry_id, descriptive_name, artifacts.to_vec(), state, recorded, None);
            Ok(())
        })
    }

    fn retrieve_from_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        let hash_code = Self::archive_hash(archive_name, entry_id, group);
        self.with_group(group, |entry| {
            let Some(archives) = entry.archives.clone() else { return Ok(None) };
            let read_ref = self.ref_counts.acquire_read(
                hash_code,
                &format!("{archive_name}-{entry_id:x}"),
            )?;
            let archive = archives.get_archive(archive_name)?;
            archive.try_open_internal(entry_id, Some(read_ref))
        })
    }

    fn flush(&self) {
        let groups = self.groups.read().unwrap();
        for group in groups.map.values() {
            if let Some(archives) = &group.archives {
                archives.flush_to_disk();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// progressive store

/// Configuration for [`ProgressiveStore`].
#[derive(Clone, Debug)]
pub struct ProgressiveStoreOptions {
    pub base_dir: PathBuf,
    /// Segregates caches produced by incompatible code versions.
    pub version_string: String,
    /// Encodes build flavor (debug/release, bitness) into the directory name.
    pub config_string: String,
    /// Skip versioning entirely and share one universal directory.
    pub universal: bool,
}

impl ProgressiveStoreOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            version_string: "0".to_string(),
            config_string: default_config_string().to_string(),
            universal: false,
        }
    }
}

impl Default for ProgressiveStoreOptions {
    /// Caches under the user cache directory (falling back to the system
    /// temp directory when none exists).
    fn default() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("asset-compilers"))
    }
}

/// `d64`/`r64`-style configuration tag, encoding build flavor and bitness
/// into the intermediate directory name.
pub fn default_config_string() -> &'static str {
    static CONFIG: once_cell::sync::Lazy<String> = once_cell::sync::Lazy::new(|| {
        let flavor = if cfg!(debug_assertions) { 'd' } else { 'r' };
        format!("{flavor}{}", std::mem::size_of::<usize>() * 8)
    });
    &CONFIG
}

struct ResolvedBase {
    root: PathBuf,
    /// Held open for the store's lifetime; other processes sharing the
    /// directory are expected to take a reader role only.
    _store_marker: fs::File,
}

/// The default writable store: versioned directories under
/// `<baseDir>/.int-<configString>/`, resolved lazily on first use.
///
/// Each numbered subdirectory carries a `.store` marker recording the
/// version string it was created for; a directory is reused only on an
/// exact version match, so incompatible code versions keep disjoint caches.
pub struct ProgressiveStore {
    base: StoreBase,
    options: ProgressiveStoreOptions,
    resolved: Mutex<Option<Arc<ResolvedBase>>>,
}

impl ProgressiveStore {
    pub fn new(depval: Arc<DepValSystem>, options: ProgressiveStoreOptions) -> Arc<Self> {
        Arc::new(Self {
            base: StoreBase::new(depval, true),
            options,
            resolved: Mutex::new(None),
        })
    }

    /// The directory this store resolved to (resolving it if needed).
    pub fn resolved_directory(&self) -> Result<PathBuf> {
        Ok(self.resolve_base()?.root.clone())
    }

    fn resolve_base(&self) -> Result<Arc<ResolvedBase>> {
        let mut resolved = self.resolved.lock().unwrap();
        if let Some(base) = &*resolved {
            return Ok(base.clone());
        }

        let base = if self.options.universal {
            self.prepare_directory(self.options.base_dir.join(".int").join("u"))?
        } else {
            self.resolve_versioned_directory()?
        };
        debug!(root = %base.root.display(), "resolved intermediates store directory");
        *resolved = Some(base.clone());
        Ok(base)
    }

    fn resolve_versioned_directory(&self) -> Result<Arc<ResolvedBase>> {
        let cfg_dir = self
            .options
            .base_dir
            .join(format!(".int-{}", self.options.config_string));
        fs::create_dir_all(&cfg_dir).map_err(|e| AssetError::io(e, &cfg_dir))?;

        // search existing numbered directories for a matching version marker
        let mut taken = Vec::new();
        if let Ok(entries) = fs::read_dir(&cfg_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Ok(index) = name.to_string_lossy().parse::<u32>() else { continue };
                taken.push(index);
                let marker_path = entry.path().join(".store");
                if let Some(version) = read_store_marker(&marker_path) {
                    if version == self.options.version_string {
                        return self.prepare_directory(entry.path());
                    }
                }
            }
        }

        // no match; claim the lowest free integer
        taken.sort_unstable();
        let mut index = 0u32;
        for existing in taken {
            if existing == index {
                index += 1;
            } else if existing > index {
                break;
            }
        }
        self.prepare_directory(cfg_dir.join(index.to_string()))
    }

    fn prepare_directory(&self, root: PathBuf) -> Result<Arc<ResolvedBase>> {
        fs::create_dir_all(&root).map_err(|e| AssetError::io(e, &root))?;
        let marker_path = root.join(".store");
        if read_store_marker(&marker_path).is_none() {
            let contents = format!("VersionString={}\n", self.options.version_string);
            fs::write(&marker_path, contents).map_err(|e| AssetError::io(e, &marker_path))?;
        }
        let marker = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&marker_path)
            .map_err(|e| AssetError::io(e, &marker_path))?;
        Ok(Arc::new(ResolvedBase { root, _store_marker: marker }))
    }
}

fn read_store_marker(path: &Path) -> Option<String> {
    let mut contents = String::new();
    fs::File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("VersionString="))
        .map(|version| version.trim().to_string())
}

impl IntermediatesStore for ProgressiveStore {
    fn store_compile_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<Arc<ArtifactCollection>> {
        self.base.store_products(archivable_name, group, artifacts, state, dependencies)
    }

    fn retrieve_compile_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        self.base.retrieve_products(archivable_name, group)
    }

    fn store_compile_products_in_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        descriptive_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<()> {
        self.base.store_in_archive(
            archive_name,
            entry_id,
            descriptive_name,
            group,
            artifacts,
            state,
            dependencies,
        )
    }

    fn retrieve_compile_products_from_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        self.base.retrieve_from_archive(archive_name, entry_id, group)
    }

    fn register_compile_products_group(
        &self,
        short_name: &str,
        version: &VersionDesc,
        enable_archive: bool,
    ) -> Result<CompileProductsGroupId> {
        let resolved = self.resolve_base()?;
        let depval = self.base.depval.clone();
        let version = version.clone();
        self.base.register_group(short_name, &version.clone(), move |safe_name| {
            let filesystem: Arc<dyn FileSystem> = Arc::new(OsFileSystem::new(resolved.root.clone()));
            let loose = Arc::new(LooseFilesStorage::new(
                filesystem.clone(),
                safe_name.to_string(),
                Some(resolved.root.clone()),
                depval.clone(),
            ));
            let archives = enable_archive.then(|| {
                Arc::new(ArchiveCacheSet::new(
                    Some(filesystem),
                    safe_name.to_string(),
                    version.clone(),
                    depval,
                    true,
                ))
            });
            Ok((Some(loose), archives))
        })
    }

    fn deregister_compile_products_group(&self, group: CompileProductsGroupId) {
        self.base.deregister_group(group);
    }

    fn allow_store(&self) -> bool {
        true
    }

    fn flush_to_disk(&self) {
        self.base.flush();
    }
}

// ---------------------------------------------------------------------------
// archived store

/// Read-only store over an already-built filesystem (typically a mounted
/// packed archive of shipped intermediates). Writes are refused.
pub struct ArchivedStore {
    base: StoreBase,
    filesystem: Arc<dyn FileSystem>,
    mount_point: String,
}

impl ArchivedStore {
    pub fn new(
        depval: Arc<DepValSystem>,
        filesystem: Arc<dyn FileSystem>,
        mount_point: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: StoreBase::new(depval, false),
            filesystem,
            mount_point: mount_point.into(),
        })
    }

    fn group_prefix(&self, safe_name: &str) -> String {
        if self.mount_point.is_empty() {
            safe_name.to_string()
        } else {
            format!("{}/{safe_name}", self.mount_point.trim_matches('/'))
        }
    }
}

impl IntermediatesStore for ArchivedStore {
    fn store_compile_products(
        &self,
        _archivable_name: &str,
        _group: CompileProductsGroupId,
        _artifacts: &[Artifact],
        _state: AssetState,
        _dependencies: &[DependencyValidation],
    ) -> Result<Arc<ArtifactCollection>> {
        Err(AssetError::msg("archived intermediates stores are read-only"))
    }

    fn retrieve_compile_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        self.base.retrieve_products(archivable_name, group)
    }

    fn store_compile_products_in_archive(
        &self,
        _archive_name: &str,
        _entry_id: u64,
        _descriptive_name: &str,
        _group: CompileProductsGroupId,
        _artifacts: &[Artifact],
        _state: AssetState,
        _dependencies: &[DependencyValidation],
    ) -> Result<()> {
        Err(AssetError::msg("archived intermediates stores are read-only"))
    }

    fn retrieve_compile_products_from_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        self.base.retrieve_from_archive(archive_name, entry_id, group)
    }

    fn register_compile_products_group(
        &self,
        short_name: &str,
        version: &VersionDesc,
        enable_archive: bool,
    ) -> Result<CompileProductsGroupId> {
        let filesystem = self.filesystem.clone();
        let depval = self.base.depval.clone();
        let version = version.clone();
        let prefix = |safe_name: &str| self.group_prefix(safe_name);
        self.base.register_group(short_name, &version.clone(), move |safe_name| {
            let base_directory = prefix(safe_name);
            let loose = Arc::new(LooseFilesStorage::new(
                filesystem.clone(),
                base_directory.clone(),
                None,
                depval.clone(),
            ));
            let archives = enable_archive.then(|| {
                Arc::new(ArchiveCacheSet::new(
                    Some(filesystem),
                    base_directory,
                    version.clone(),
                    depval,
                    true,
                ))
            });
            Ok((Some(loose), archives))
        })
    }

    fn deregister_compile_products_group(&self, group: CompileProductsGroupId) {
        self.base.deregister_group(group);
    }

    fn allow_store(&self) -> bool {
        false
    }

    fn flush_to_disk(&self) {}
}

// ---------------------------------------------------------------------------
// memory store

/// A store with no filesystem at all: every group is an archive cache with
/// null backing, so products live exactly as long as the store.
pub struct MemoryStore {
    base: StoreBase,
}

const MEMORY_ARCHIVE: &str = "memory";

impl MemoryStore {
    pub fn new(depval: Arc<DepValSystem>) -> Arc<Self> {
        Arc::new(Self { base: StoreBase::new(depval, true) })
    }
}

impl IntermediatesStore for MemoryStore {
    fn store_compile_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<Arc<ArtifactCollection>> {
        let entry_id = utils::hash_filename(archivable_name, utils::FilenameRules::default());
        self.base.store_in_archive(
            MEMORY_ARCHIVE,
            entry_id,
            archivable_name,
            group,
            artifacts,
            state,
            dependencies,
        )?;
        self.base
            .retrieve_from_archive(MEMORY_ARCHIVE, entry_id, group)?
            .ok_or_else(|| AssetError::msg("freshly stored products vanished from memory store"))
    }

    fn retrieve_compile_products(
        &self,
        archivable_name: &str,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        let entry_id = utils::hash_filename(archivable_name, utils::FilenameRules::default());
        self.base.retrieve_from_archive(MEMORY_ARCHIVE, entry_id, group)
    }

    fn store_compile_products_in_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        descriptive_name: &str,
        group: CompileProductsGroupId,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependencyValidation],
    ) -> Result<()> {
        self.base.store_in_archive(
            archive_name,
            entry_id,
            descriptive_name,
            group,
            artifacts,
            state,
            dependencies,
        )
    }

    fn retrieve_compile_products_from_archive(
        &self,
        archive_name: &str,
        entry_id: u64,
        group: CompileProductsGroupId,
    ) -> Result<Option<Arc<ArtifactCollection>>> {
        self.base.retrieve_from_archive(archive_name, entry_id, group)
    }

    fn register_compile_products_group(
        &self,
        short_name: &str,
        version: &VersionDesc,
        _enable_archive: bool,
    ) -> Result<CompileProductsGroupId> {
        let depval = self.base.depval.clone();
        let version = version.clone();
        self.base.register_group(short_name, &version.clone(), move |safe_name| {
            let archives = Arc::new(ArchiveCacheSet::new(
                None,
                safe_name.to_string(),
                version.clone(),
                depval,
                true,
            ));
            Ok((None, Some(archives)))
        })
    }

    fn deregister_compile_products_group(&self, group: CompileProductsGroupId) {
        self.base.deregister_group(group);
    }

    fn allow_store(&self) -> bool {
        true
    }

    fn flush_to_disk(&self) {
        self.base.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_references_exclude_each_other() {
        let counts = Arc::new(StoreRefCounts::default());
        let read = counts.acquire_read(42, "a").unwrap();
        let second = counts.acquire_read(42, "a").unwrap();
        assert_eq!(counts.readers_in_flight(42), 2);

        // a writer cannot start while readers are live
        assert!(counts.acquire_write(42, "a").is_err());
        drop(read);
        drop(second);

        let write = counts.acquire_write(42, "a").unwrap();
        assert!(counts.writer_in_flight(42));
        assert!(counts.acquire_read(42, "a").is_err());
        assert!(counts.acquire_write(42, "a").is_err());
        // a different fingerprint is unaffected
        assert!(counts.acquire_read(7, "b").is_ok());
        drop(write);
        assert!(counts.acquire_read(42, "a").is_ok());
    }

    #[test]
    fn version_segregated_directories() {
        let dir = tempfile::tempdir().unwrap();
        let services = crate::AssetServices::with_pool_size(1);

        let options = |version: &str| ProgressiveStoreOptions {
            base_dir: dir.path().to_path_buf(),
            version_string: version.to_string(),
            config_string: "r64".to_string(),
            universal: false,
        };

        let store_v1 = ProgressiveStore::new(services.depval().clone(), options("v1"));
        assert_eq!(
            store_v1.resolved_directory().unwrap(),
            dir.path().join(".int-r64").join("0")
        );
        let marker = std::fs::read_to_string(dir.path().join(".int-r64/0/.store")).unwrap();
        assert_eq!(marker.trim(), "VersionString=v1");
        drop(store_v1);

        let store_v2 = ProgressiveStore::new(services.depval().clone(), options("v2"));
        assert_eq!(
            store_v2.resolved_directory().unwrap(),
            dir.path().join(".int-r64").join("1")
        );
        drop(store_v2);

        // v1 reuses its original directory, leaving v2's untouched
        let store_v1_again = ProgressiveStore::new(services.depval().clone(), options("v1"));
        assert_eq!(
            store_v1_again.resolved_directory().unwrap(),
            dir.path().join(".int-r64").join("0")
        );
        let marker = std::fs::read_to_string(dir.path().join(".int-r64/1/.store")).unwrap();
        assert_eq!(marker.trim(), "VersionString=v2");
    }

    #[test]
    fn unregistered_group_is_an_error() {
        let services = crate::AssetServices::with_pool_size(1);
        let store = MemoryStore::new(services.depval().clone());
        assert!(store.retrieve_compile_products("anything", 99).is_err());
    }
}
