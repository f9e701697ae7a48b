//! Dependency validation.
//!
//! A refcounted DAG whose leaves are file snapshots and whose interior
//! nodes are asset-validity markers. Every asset that was built from files
//! holds a [`DependencyValidation`] handle; when a file changes, the change
//! propagates up through the graph and bumps the validation index of every
//! transitively dependent marker, exactly once per change event. An asset
//! is still valid iff its marker's validation index matches what it held at
//! load time, which for freshly created markers is zero.
//!
//! The tables are flat sorted vectors rather than trees: everything except
//! change propagation is a binary search or an append, and propagation is
//! allowed to be the expensive operation because file changes are rare.
//!
//! All state is behind one ordinary mutex. Queries are short and
//! propagation is write-heavy, so a readers-writer lock would buy nothing.

use crate::{
    heap::SpanningHeap,
    utils::{self, FilenameRules},
    vfs::{mount::MountingTree, FileMonitor, FileSnapshot},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
};

type DepValMarker = u32;
const MARKER_INVALID: DepValMarker = u32::MAX;

type MonitoredFileId = u32;

/// The unit of "I depended on this file and saw it in this state".
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DependentFileState {
    pub filename: String,
    pub snapshot: FileSnapshot,
}

impl DependentFileState {
    pub fn new(filename: impl Into<String>, snapshot: FileSnapshot) -> Self {
        Self { filename: filename.into(), snapshot }
    }
}

/// One stale dependency found by
/// [`DependencyValidation::collate_dependent_file_updates`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DependencyUpdateReport {
    pub filename: String,
    pub registered: FileSnapshot,
    pub current: FileSnapshot,
}

#[derive(Clone, Copy, Default)]
struct Entry {
    ref_count: u32,
    validation_index: u32,
}

struct MonitoredFile {
    filename: String,
    snapshots: Vec<FileSnapshot>,
    most_recent_snapshot_idx: usize,
    /// Keeps the registration with the mounting tree alive; backends hold
    /// only weak references to monitors.
    _watch: Arc<FileWatch>,
}

#[derive(Default)]
struct Inner {
    marker_heap: SpanningHeap,
    entries: Vec<Entry>,
    /// (path hash, file id), sorted by hash.
    monitored_files_by_hash: Vec<(u64, MonitoredFileId)>,
    monitored_files: Vec<MonitoredFile>,
    /// (dependent, dependency), sorted by dependent.
    asset_links: Vec<(DepValMarker, DepValMarker)>,
    /// (dependent, (file id, snapshot index)), sorted by dependent.
    file_links: Vec<(DepValMarker, (MonitoredFileId, u32))>,
}

/// The process-scoped registry of markers, monitored files and links.
///
/// Scoped to an explicit service context rather than a global: create one
/// per [`MountingTree`] namespace via [`DepValSystem::new`].
pub struct DepValSystem {
    tree: Arc<MountingTree>,
    inner: Mutex<Inner>,
    global_change_index: AtomicU32,
    self_weak: Weak<DepValSystem>,
    rules: FilenameRules,
}

impl DepValSystem {
    pub fn new(tree: Arc<MountingTree>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            tree,
            inner: Mutex::new(Inner::default()),
            global_change_index: AtomicU32::new(0),
            self_weak: weak.clone(),
            rules: FilenameRules::default(),
        })
    }

    /// A fresh marker with no dependencies; permanently valid until
    /// dependencies are registered against it.
    pub fn make(&self) -> DependencyValidation {
        let mut inner = self.inner.lock().unwrap();
        let marker = Self::make_locked(&mut inner);
        self.handle(marker)
    }

    /// A marker depending on each named file at its current snapshot.
    pub fn make_from_files<I, S>(&self, filenames: I) -> DependencyValidation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.inner.lock().unwrap();
        let marker = Self::make_locked(&mut inner);
        for filename in filenames {
            self.register_file_dependency_locked(&mut inner, marker, filename.as_ref(), None);
        }
        self.handle(marker)
    }

    /// A marker depending on each file at the given recorded snapshot. A
    /// recorded snapshot that is already superseded invalidates the new
    /// marker immediately.
    pub fn make_from_states<'a, I>(&self, states: I) -> DependencyValidation
    where
        I: IntoIterator<Item = &'a DependentFileState>,
    {
        let mut inner = self.inner.lock().unwrap();
        let marker = Self::make_locked(&mut inner);
        for state in states {
            self.register_file_dependency_locked(
                &mut inner,
                marker,
                &state.filename,
                Some(state.snapshot),
            );
        }
        self.handle(marker)
    }

    /// Combines several validations into one. A single non-empty input is
    /// reused directly (refcount bump, no new marker); several inputs get a
    /// fresh marker with asset-dependency edges to each.
    pub fn make_or_reuse(&self, inputs: &[&DependencyValidation]) -> DependencyValidation {
        let valid: Vec<DepValMarker> =
            inputs.iter().filter(|dv| !dv.is_empty()).map(|dv| dv.marker).collect();
        if valid.is_empty() {
            return DependencyValidation::empty();
        }

        let mut inner = self.inner.lock().unwrap();
        if let [single] = valid[..] {
            inner.entries[single as usize].ref_count += 1;
            return self.handle(single);
        }
        let marker = Self::make_locked(&mut inner);
        for dependency in valid {
            Self::register_asset_dependency_locked(&mut inner, marker, dependency);
        }
        self.handle(marker)
    }

    /// The current state of `filename`, registering it for monitoring.
    pub fn get_dependent_file_state(&self, filename: &str) -> DependentFileState {
        let mut inner = self.inner.lock().unwrap();
        let file_id = self.get_monitored_file_locked(&mut inner, filename);
        let file = &inner.monitored_files[file_id as usize];
        DependentFileState::new(&file.filename, file.snapshots[file.most_recent_snapshot_idx])
    }

    /// Monotonic counter incremented after every change propagation.
    pub fn global_change_index(&self) -> u32 {
        self.global_change_index.load(Ordering::Acquire)
    }

    fn handle(&self, marker: DepValMarker) -> DependencyValidation {
        DependencyValidation { system: self.self_weak.clone(), marker }
    }

    fn make_locked(inner: &mut Inner) -> DepValMarker {
        let marker = inner.marker_heap.allocate_or_append(1) as DepValMarker;
        if marker as usize >= inner.entries.len() {
            inner.entries.resize(marker as usize + 1, Entry::default());
        }
        inner.entries[marker as usize] = Entry { ref_count: 1, validation_index: 0 };
        marker
    }

    fn get_monitored_file_locked(&self, inner: &mut Inner, filename: &str) -> MonitoredFileId {
        let hash = utils::hash_filename(filename, self.rules);
        let idx = inner.monitored_files_by_hash.partition_point(|&(h, _)| h < hash);
        if let Some(&(h, id)) = inner.monitored_files_by_hash.get(idx) {
            if h == hash {
                return id;
            }
        }

        let file_id = inner.monitored_files.len() as MonitoredFileId;
        let watch = Arc::new(FileWatch {
            system: self.self_weak.clone(),
            file_id,
            filename: filename.to_string(),
        });
        let as_monitor: Arc<dyn FileMonitor> = watch.clone();
        // failure to begin monitoring is tolerated; the file simply never
        // produces change events
        let snapshot = self.tree.try_monitor(filename, &as_monitor);
        inner.monitored_files.push(MonitoredFile {
            filename: filename.to_string(),
            snapshots: vec![snapshot],
            most_recent_snapshot_idx: 0,
            _watch: watch,
        });
        inner.monitored_files_by_hash.insert(idx, (hash, file_id));
        file_id
    }

    fn find_or_add_snapshot(snapshots: &mut Vec<FileSnapshot>, search: FileSnapshot) -> usize {
        match snapshots.iter().position(|&s| s == search) {
            Some(idx) => idx,
            None => {
                snapshots.push(search);
                snapshots.len() - 1
            }
        }
    }

    /// `snapshot == None` registers against the file's current snapshot.
    fn register_file_dependency_locked(
        &self,
        inner: &mut Inner,
        marker: DepValMarker,
        filename: &str,
        snapshot: Option<FileSnapshot>,
    ) {
        let file_id = self.get_monitored_file_locked(inner, filename);

        let (snapshot_idx, most_recent_idx) = {
            let file = &mut inner.monitored_files[file_id as usize];
            let idx = match snapshot {
                Some(snapshot) => Self::find_or_add_snapshot(&mut file.snapshots, snapshot),
                None => file.most_recent_snapshot_idx,
            };
            (idx, file.most_recent_snapshot_idx)
        };

        let range_start = inner.file_links.partition_point(|&(d, _)| d < marker);
        let range_end = inner.file_links.partition_point(|&(d, _)| d <= marker);
        let mut already_registered = false;
        for link in &mut inner.file_links[range_start..range_end] {
            if link.1 .0 == file_id {
                // several registrations of one file fold to the snapshot
                // with the earlier modification time
                let file = &inner.monitored_files[file_id as usize];
                if file.snapshots[snapshot_idx].modification_time
                    < file.snapshots[link.1 .1 as usize].modification_time
                {
                    link.1 .1 = snapshot_idx as u32;
                }
                already_registered = true;
            }
        }
        if !already_registered {
            inner.file_links.insert(range_end, (marker, (file_id, snapshot_idx as u32)));
        }

        if snapshot_idx != most_recent_idx {
            // registered with a snapshot that is already superseded
            trace!(filename, "file dependency registered against stale snapshot");
            self.increase_validation_index_locked(inner, marker);
        }
    }

    fn register_asset_dependency_locked(
        inner: &mut Inner,
        dependent: DepValMarker,
        dependency: DepValMarker,
    ) {
        debug_assert!(inner.entries[dependent as usize].ref_count > 0);
        debug_assert!(inner.entries[dependency as usize].ref_count > 0);

        let range_start = inner.asset_links.partition_point(|&(d, _)| d < dependent);
        let range_end = inner.asset_links.partition_point(|&(d, _)| d <= dependent);
        if inner.asset_links[range_start..range_end].iter().any(|&(_, d)| d == dependency) {
            return;
        }

        // the dependency gets a refcount bump, but not the dependent
        inner.entries[dependency as usize].ref_count += 1;
        inner.asset_links.insert(range_start, (dependent, dependency));
    }

    fn add_ref(&self, marker: DepValMarker) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.entries[marker as usize].ref_count > 0);
        inner.entries[marker as usize].ref_count += 1;
    }

    fn release(&self, marker: DepValMarker) {
        let mut inner = self.inner.lock().unwrap();
        let mut pending = vec![marker];
        while let Some(marker) = pending.pop() {
            let entry = &mut inner.entries[marker as usize];
            debug_assert!(entry.ref_count > 0);
            entry.ref_count -= 1;
            if entry.ref_count != 0 {
                continue;
            }

            let start = inner.asset_links.partition_point(|&(d, _)| d < marker);
            let end = inner.asset_links.partition_point(|&(d, _)| d <= marker);
            let dependencies: Vec<DepValMarker> =
                inner.asset_links.drain(start..end).map(|(_, dep)| dep).collect();

            let start = inner.file_links.partition_point(|&(d, _)| d < marker);
            let end = inner.file_links.partition_point(|&(d, _)| d <= marker);
            inner.file_links.drain(start..end);

            inner.marker_heap.deallocate(marker as u64, 1);
            // release refs on dependencies after the link tables are updated
            pending.extend(dependencies);
        }
    }

    fn validation_index(&self, marker: DepValMarker) -> u32 {
        let inner = self.inner.lock().unwrap();
        debug_assert!(inner.entries[marker as usize].ref_count > 0);
        inner.entries[marker as usize].validation_index
    }

    /// Walks `asset_links` breadth-first from `frontier`, returning every
    /// transitively dependent marker (including the frontier) exactly once.
    fn collect_dependents(inner: &Inner, mut frontier: Vec<DepValMarker>) -> Vec<DepValMarker> {
        frontier.sort_unstable();
        frontier.dedup();
        let mut reached: Vec<DepValMarker> = Vec::new();
        let mut next = Vec::new();
        while !frontier.is_empty() {
            for &(dependent, dependency) in &inner.asset_links {
                if frontier.binary_search(&dependency).is_ok()
                    && frontier.binary_search(&dependent).is_err()
                    && reached.binary_search(&dependent).is_err()
                    && !next.contains(&dependent)
                {
                    next.push(dependent);
                }
            }
            reached.extend(frontier.iter().copied());
            reached.sort_unstable();
            frontier = std::mem::take(&mut next);
            frontier.sort_unstable();
        }
        reached
    }

    fn propagate_file_change_locked(&self, inner: &mut Inner, file_id: MonitoredFileId) {
        let direct: Vec<DepValMarker> = inner
            .file_links
            .iter()
            .filter(|&&(_, (id, _))| id == file_id)
            .map(|&(dependent, _)| dependent)
            .collect();
        let reached = Self::collect_dependents(inner, direct);
        for marker in &reached {
            inner.entries[*marker as usize].validation_index += 1;
        }
        trace!(file_id, invalidated = reached.len(), "propagated file change");
        // incremented last, so observers of the global index never miss a
        // propagation that already happened
        self.global_change_index.fetch_add(1, Ordering::Release);
    }

    fn increase_validation_index_locked(&self, inner: &mut Inner, marker: DepValMarker) {
        let direct: Vec<DepValMarker> = inner
            .asset_links
            .iter()
            .filter(|&&(_, dependency)| dependency == marker)
            .map(|&(dependent, _)| dependent)
            .collect();
        let reached = Self::collect_dependents(inner, direct);
        for dependent in &reached {
            if *dependent != marker {
                inner.entries[*dependent as usize].validation_index += 1;
            }
        }
        inner.entries[marker as usize].validation_index += 1;
        self.global_change_index.fetch_add(1, Ordering::Release);
    }

    fn increase_validation_index(&self, marker: DepValMarker) {
        let mut inner = self.inner.lock().unwrap();
        self.increase_validation_index_locked(&mut inner, marker);
    }

    /// Invoked from file watches when a backend reports a change.
    fn file_changed(&self, file_id: MonitoredFileId, filename: &str) {
        let current = self.tree.try_get_desc(filename).snapshot;
        let mut inner = self.inner.lock().unwrap();
        let file = &mut inner.monitored_files[file_id as usize];
        file.most_recent_snapshot_idx = Self::find_or_add_snapshot(&mut file.snapshots, current);
        self.propagate_file_change_locked(&mut inner, file_id);
    }

    /// Gathers every file link in the tree under `marker`, folding repeated
    /// references to one file onto the earliest modification time.
    fn gather_file_links(inner: &Inner, marker: DepValMarker) -> Vec<(MonitoredFileId, u32)> {
        let mut file_list: Vec<(MonitoredFileId, u32)> = Vec::new();
        let mut queue = vec![marker];
        while let Some(node) = queue.pop() {
            let start = inner.asset_links.partition_point(|&(d, _)| d < node);
            let end = inner.asset_links.partition_point(|&(d, _)| d <= node);
            queue.extend(inner.asset_links[start..end].iter().map(|&(_, dep)| dep));

            let start = inner.file_links.partition_point(|&(d, _)| d < node);
            let end = inner.file_links.partition_point(|&(d, _)| d <= node);
            file_list.extend(inner.file_links[start..end].iter().map(|&(_, link)| link));
        }
        file_list.sort_unstable_by_key(|&(file_id, _)| file_id);
        file_list
    }

    fn collate_dependent_file_states(&self, marker: DepValMarker) -> Vec<DependentFileState> {
        let inner = self.inner.lock().unwrap();
        let file_list = Self::gather_file_links(&inner, marker);

        let mut result = Vec::with_capacity(file_list.len());
        let mut i = 0;
        while i < file_list.len() {
            let (file_id, first_snapshot) = file_list[i];
            let file = &inner.monitored_files[file_id as usize];
            let mut modification_time =
                file.snapshots[first_snapshot as usize].modification_time;
            let mut j = i + 1;
            while j < file_list.len() && file_list[j].0 == file_id {
                modification_time = modification_time
                    .min(file.snapshots[file_list[j].1 as usize].modification_time);
                j += 1;
            }
            result.push(DependentFileState::new(
                &file.filename,
                FileSnapshot {
                    state: file.snapshots[first_snapshot as usize].state,
                    modification_time,
                },
            ));
            i = j;
        }
        result
    }

    fn collate_dependent_file_updates(&self, marker: DepValMarker) -> Vec<DependencyUpdateReport> {
        let inner = self.inner.lock().unwrap();
        let file_list = Self::gather_file_links(&inner, marker);

        let mut result = Vec::new();
        let mut i = 0;
        while i < file_list.len() {
            let (file_id, first_snapshot) = file_list[i];
            let file = &inner.monitored_files[file_id as usize];
            let mut modification_time =
                file.snapshots[first_snapshot as usize].modification_time;
            let mut j = i + 1;
            while j < file_list.len() && file_list[j].0 == file_id {
                modification_time = modification_time
                    .min(file.snapshots[file_list[j].1 as usize].modification_time);
                j += 1;
            }
            let registered = FileSnapshot {
                state: file.snapshots[first_snapshot as usize].state,
                modification_time,
            };
            let current = file.snapshots[file.most_recent_snapshot_idx];
            if registered != current {
                result.push(DependencyUpdateReport {
                    filename: file.filename.clone(),
                    registered,
                    current,
                });
            }
            i = j;
        }
        result
    }

    #[cfg(test)]
    fn ref_count(&self, marker: DepValMarker) -> u32 {
        self.inner.lock().unwrap().entries[marker as usize].ref_count
    }
}

struct FileWatch {
    system: Weak<DepValSystem>,
    file_id: MonitoredFileId,
    filename: String,
}

impl FileMonitor for FileWatch {
    fn on_change(&self) {
        if let Some(system) = self.system.upgrade() {
            system.file_changed(self.file_id, &self.filename);
        }
    }
}

/// Refcounting owner of a validity marker.
///
/// Cloning bumps the marker's refcount; dropping the last handle (and the
/// last asset-dependency edge pointing at it) frees the marker and releases
/// its own dependencies.
pub struct DependencyValidation {
    system: Weak<DepValSystem>,
    marker: DepValMarker,
}

impl DependencyValidation {
    /// A handle referencing nothing; permanently valid.
    pub fn empty() -> Self {
        Self { system: Weak::new(), marker: MARKER_INVALID }
    }

    pub fn is_empty(&self) -> bool {
        self.marker == MARKER_INVALID || self.system.strong_count() == 0
    }

    /// Zero for a freshly made marker; incremented by every change event
    /// that reaches it.
    pub fn validation_index(&self) -> u32 {
        match self.upgrade() {
            Some(system) => system.validation_index(self.marker),
            None => 0,
        }
    }

    /// Whether nothing this marker depends on has changed since creation.
    pub fn is_current(&self) -> bool {
        self.validation_index() == 0
    }

    /// Registers `dependency` as something this asset was built from.
    pub fn register_dependency(&self, dependency: &DependencyValidation) {
        let Some(system) = self.upgrade() else { return };
        if dependency.is_empty() {
            return;
        }
        let mut inner = system.inner.lock().unwrap();
        DepValSystem::register_asset_dependency_locked(&mut inner, self.marker, dependency.marker);
    }

    /// Registers a file dependency at the recorded snapshot.
    pub fn register_file_state(&self, state: &DependentFileState) {
        if let Some(system) = self.upgrade() {
            let mut inner = system.inner.lock().unwrap();
            system.register_file_dependency_locked(
                &mut inner,
                self.marker,
                &state.filename,
                Some(state.snapshot),
            );
        }
    }

    /// Registers a file dependency at the file's current snapshot.
    pub fn register_file(&self, filename: &str) {
        if let Some(system) = self.upgrade() {
            let mut inner = system.inner.lock().unwrap();
            system.register_file_dependency_locked(&mut inner, self.marker, filename, None);
        }
    }

    /// Fabricates an invalidation of this marker and its dependents.
    pub fn increase_validation_index(&self) {
        if let Some(system) = self.upgrade() {
            system.increase_validation_index(self.marker);
        }
    }

    /// Every file this asset transitively depends on, at the snapshot it
    /// was seen. This is what gets serialized beside a compile result so a
    /// later load can rebuild the same validation state.
    pub fn collate_dependent_file_states(&self) -> Vec<DependentFileState> {
        match self.upgrade() {
            Some(system) => system.collate_dependent_file_states(self.marker),
            None => Vec::new(),
        }
    }

    /// Diagnostic: dependencies whose current snapshot no longer matches
    /// the registered one.
    pub fn collate_dependent_file_updates(&self) -> Vec<DependencyUpdateReport> {
        match self.upgrade() {
            Some(system) => system.collate_dependent_file_updates(self.marker),
            None => Vec::new(),
        }
    }

    fn upgrade(&self) -> Option<Arc<DepValSystem>> {
        if self.marker == MARKER_INVALID {
            return None;
        }
        self.system.upgrade()
    }
}

impl Clone for DependencyValidation {
    fn clone(&self) -> Self {
        if let Some(system) = self.upgrade() {
            system.add_ref(self.marker);
        }
        Self { system: self.system.clone(), marker: self.marker }
    }
}

impl Drop for DependencyValidation {
    fn drop(&mut self) {
        // tolerate the system having shut down before outstanding handles
        if let Some(system) = self.upgrade() {
            system.release(self.marker);
        }
    }
}

impl PartialEq for DependencyValidation {
    fn eq(&self, other: &Self) -> bool {
        self.marker == other.marker && Weak::ptr_eq(&self.system, &other.system)
    }
}

impl Eq for DependencyValidation {}

impl fmt::Debug for DependencyValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.marker == MARKER_INVALID {
            write!(f, "DependencyValidation(empty)")
        } else {
            write!(f, "DependencyValidation({})", self.marker)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{as_blob, vfs::memory::MemoryFileSystem};
    use std::collections::BTreeMap;

    fn services() -> (Arc<MountingTree>, Arc<DepValSystem>, Arc<MemoryFileSystem>) {
        let tree = Arc::new(MountingTree::new());
        let mut files = BTreeMap::new();
        files.insert("x.txt".to_string(), as_blob("one"));
        files.insert("y.txt".to_string(), as_blob("two"));
        let memory = Arc::new(MemoryFileSystem::new(files));
        tree.mount("src", memory.clone());
        let system = DepValSystem::new(tree.clone());
        (tree, system, memory)
    }

    #[test]
    fn fresh_marker_is_permanently_valid() {
        let (_, system, _) = services();
        let dv = system.make();
        assert!(dv.is_current());
        assert!(dv.collate_dependent_file_states().is_empty());
    }

    #[test]
    fn file_change_increments_validation_index() {
        let (tree, system, _) = services();
        let dv = system.make_from_files(["src/x.txt"]);
        assert_eq!(dv.validation_index(), 0);

        tree.fake_change("src/x.txt");
        assert_eq!(dv.validation_index(), 1);

        tree.fake_change("src/x.txt");
        assert_eq!(dv.validation_index(), 2);
    }

    #[test]
    fn change_propagates_to_transitive_dependents() {
        let (tree, system, _) = services();
        let leaf = system.make_from_files(["src/x.txt"]);
        let middle = system.make();
        middle.register_dependency(&leaf);
        let root = system.make();
        root.register_dependency(&middle);

        tree.fake_change("src/x.txt");
        assert_eq!(leaf.validation_index(), 1);
        assert_eq!(middle.validation_index(), 1);
        assert_eq!(root.validation_index(), 1);
    }

    #[test]
    fn diamond_dependents_increment_exactly_once() {
        let (tree, system, _) = services();
        let leaf = system.make_from_files(["src/x.txt"]);
        let a = system.make();
        a.register_dependency(&leaf);
        let b = system.make();
        b.register_dependency(&leaf);
        let top = system.make();
        top.register_dependency(&a);
        top.register_dependency(&b);

        let index_before = system.global_change_index();
        tree.fake_change("src/x.txt");
        assert_eq!(top.validation_index(), 1);
        assert_eq!(system.global_change_index(), index_before + 1);
    }

    #[test]
    fn registering_stale_snapshot_invalidates_immediately() {
        let (tree, system, _) = services();
        let current = system.get_dependent_file_state("src/x.txt");
        tree.fake_change("src/x.txt");

        let dv = system.make_from_states([&current]);
        assert!(!dv.is_current());
    }

    #[test]
    fn make_or_reuse_single_input_is_same_marker() {
        let (_, system, _) = services();
        let a = system.make_from_files(["src/x.txt"]);
        let reused = system.make_or_reuse(&[&a, &DependencyValidation::empty()]);
        assert_eq!(a, reused);

        let b = system.make_from_files(["src/y.txt"]);
        let combined = system.make_or_reuse(&[&a, &b]);
        assert_ne!(combined, a);
        assert_ne!(combined, b);

        assert!(system.make_or_reuse(&[]).is_empty());
    }

    #[test]
    fn refcounts_track_handles_and_links() {
        let (_, system, _) = services();
        let a = system.make();
        let marker = a.marker;
        assert_eq!(system.ref_count(marker), 1);

        let copy = a.clone();
        assert_eq!(system.ref_count(marker), 2);

        let parent = system.make();
        parent.register_dependency(&a);
        assert_eq!(system.ref_count(marker), 3);

        drop(copy);
        drop(a);
        // the asset link keeps the marker alive until the parent releases
        assert_eq!(system.ref_count(marker), 1);
        drop(parent);
    }

    #[test]
    fn collate_folds_to_earliest_modification_time() {
        let (_, system, _) = services();
        let older = DependentFileState::new("src/x.txt", FileSnapshot::present(100));
        let newer = DependentFileState::new("src/x.txt", FileSnapshot::present(200));

        let child = system.make_from_states([&newer]);
        let parent = system.make_from_states([&older]);
        parent.register_dependency(&child);

        let states = parent.collate_dependent_file_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].snapshot.modification_time, 100);
    }

    #[test]
    fn updates_report_only_stale_entries() {
        let (tree, system, _) = services();
        let dv = system.make_from_files(["src/x.txt", "src/y.txt"]);
        assert!(dv.collate_dependent_file_updates().is_empty());

        tree.fake_change("src/x.txt");
        let updates = dv.collate_dependent_file_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].filename, "src/x.txt");
        assert!(updates[0].current.modification_time > updates[0].registered.modification_time);
    }
}
