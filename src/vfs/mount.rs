//! Prefix-indexed composition of filesystem backends.
//!
//! A mount attaches a backend under a path prefix; looking a path up asks
//! every mount whose prefix covers it to translate the remainder, in mount
//! order, first success winning. Paths no mount covers fall through to a
//! designated default backend (typically raw OS access), which is how
//! absolute paths keep working.
//!
//! Lookup enumeration is tolerant of concurrent mount and unmount: every
//! mutation bumps a version stamp, and in-flight candidate enumerators that
//! observe a stamp change restart from scratch.

use super::{
    FileDesc, FileInterface, FileMonitor, FileSnapshot, FileSystem, Marker, OpenMode,
    SearchableFileSystem, ShareMode, TranslateResult,
};
use crate::{
    error::{AssetError, Result},
    utils::{self, FilenameRules},
};
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

/// Identifies a mounted backend within one tree.
pub type FileSystemId = u32;

struct Mount {
    id: FileSystemId,
    prefix_sections: Vec<String>,
    filesystem: Arc<dyn FileSystem>,
}

#[derive(Default)]
struct Mounts {
    mounts: Vec<Mount>,
    default_filesystem: Option<Arc<dyn FileSystem>>,
    next_id: FileSystemId,
}

/// The composed namespace file requests resolve through.
pub struct MountingTree {
    inner: RwLock<Mounts>,
    rules: FilenameRules,
    change_version: AtomicU64,
}

impl MountingTree {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Mounts::default()),
            rules: FilenameRules::default(),
            change_version: AtomicU64::new(0),
        }
    }

    /// Mounts `filesystem` under `prefix` and returns its id. Later mounts
    /// are tried after earlier ones covering the same prefix.
    pub fn mount(&self, prefix: &str, filesystem: Arc<dyn FileSystem>) -> FileSystemId {
        let prefix_sections = utils::split_path(prefix)
            .simplify()
            .sections()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut inner = self.inner.write().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.mounts.push(Mount { id, prefix_sections, filesystem });
        self.change_version.fetch_add(1, Ordering::Release);
        debug!(prefix, id, "mounted filesystem");
        id
    }

    pub fn unmount(&self, id: FileSystemId) {
        let mut inner = self.inner.write().unwrap();
        inner.mounts.retain(|m| m.id != id);
        self.change_version.fetch_add(1, Ordering::Release);
        debug!(id, "unmounted filesystem");
    }

    /// The backend used for paths no mount covers.
    pub fn set_default_filesystem(&self, filesystem: Option<Arc<dyn FileSystem>>) {
        self.inner.write().unwrap().default_filesystem = filesystem;
        self.change_version.fetch_add(1, Ordering::Release);
    }

    pub fn filesystem(&self, id: FileSystemId) -> Option<Arc<dyn FileSystem>> {
        let inner = self.inner.read().unwrap();
        inner.mounts.iter().find(|m| m.id == id).map(|m| m.filesystem.clone())
    }

    fn snapshot_candidates(&self, path: &str) -> (Vec<Candidate>, u64) {
        let version = self.change_version.load(Ordering::Acquire);
        let split = utils::split_path(path).simplify();
        let sections = split.sections();

        let inner = self.inner.read().unwrap();
        let mut candidates = Vec::new();
        for mount in &inner.mounts {
            if mount.prefix_sections.len() > sections.len() {
                continue;
            }
            let matches = mount
                .prefix_sections
                .iter()
                .zip(sections)
                .all(|(prefix, section)| self.sections_equal(prefix, section));
            if !matches {
                continue;
            }
            let remainder = sections[mount.prefix_sections.len()..].join("/");
            candidates.push(Candidate {
                filesystem_id: mount.id,
                filesystem: mount.filesystem.clone(),
                remainder,
            });
        }
        if let Some(default) = &inner.default_filesystem {
            candidates.push(Candidate {
                filesystem_id: FileSystemId::MAX,
                filesystem: default.clone(),
                remainder: path.to_string(),
            });
        }
        (candidates, version)
    }

    fn sections_equal(&self, lhs: &str, rhs: &str) -> bool {
        if self.rules.case_sensitive {
            lhs == rhs
        } else {
            lhs.eq_ignore_ascii_case(rhs)
        }
    }

    /// Begins enumerating (backend, marker) candidates for `path`.
    pub fn lookup<'a>(&'a self, path: &str) -> LookupCandidates<'a> {
        let (candidates, version) = self.snapshot_candidates(path);
        LookupCandidates { tree: self, path: path.to_string(), candidates, next: 0, version }
    }

    /// First translating backend for `path`, if any.
    pub fn try_translate(&self, path: &str) -> Option<ResolvedFile> {
        self.lookup(path).next_success()
    }

    pub fn open(
        &self,
        path: &str,
        mode: OpenMode,
        share: ShareMode,
    ) -> Result<Box<dyn FileInterface>> {
        match self.try_translate(path) {
            Some(resolved) => resolved.filesystem.open(&resolved.marker, mode, share),
            None => Err(AssetError::io(
                io::Error::new(io::ErrorKind::NotFound, "no mounted filesystem resolves the path"),
                path,
            )),
        }
    }

    /// Registers `monitor` with *every* matching backend, so identical paths
    /// covered by multiple mounts all produce change events. Returns the
    /// snapshot from the first backend that resolved the path.
    pub fn try_monitor(&self, path: &str, monitor: &Arc<dyn FileMonitor>) -> FileSnapshot {
        let (candidates, _) = self.snapshot_candidates(path);
        let mut first_snapshot = None;
        for candidate in candidates {
            if let Some(marker) = candidate.filesystem.translate(&candidate.remainder).marker() {
                match candidate.filesystem.monitor(&marker, monitor) {
                    Ok(snapshot) => {
                        first_snapshot.get_or_insert(snapshot);
                    }
                    Err(err) => trace!("monitor failed for \"{path}\": {err}"),
                }
            }
        }
        first_snapshot.unwrap_or(FileSnapshot::missing())
    }

    /// Fabricates a change event on every matching backend.
    pub fn fake_change(&self, path: &str) {
        let (candidates, _) = self.snapshot_candidates(path);
        for candidate in candidates {
            if let Some(marker) = candidate.filesystem.translate(&candidate.remainder).marker() {
                if let Err(err) = candidate.filesystem.fake_change(&marker) {
                    trace!("fake change failed for \"{path}\": {err}");
                }
            }
        }
    }

    /// Description of the file at `path`; a `Missing` snapshot when nothing
    /// resolves it.
    pub fn try_get_desc(&self, path: &str) -> FileDesc {
        match self.try_translate(path) {
            Some(resolved) => match resolved.filesystem.describe(&resolved.marker) {
                Ok(desc) => desc,
                Err(_) => missing_desc(path),
            },
            None => missing_desc(path),
        }
    }

    /// Begins enumerating the subtree rooted at `base` across all mounts.
    pub fn walk(&self, base: &str) -> FileSystemWalker {
        let base_sections: Vec<String> = utils::split_path(base)
            .simplify()
            .sections()
            .iter()
            .map(|s| s.to_string())
            .collect();

        let inner = self.inner.read().unwrap();
        let mut starting = Vec::new();
        for mount in &inner.mounts {
            let shared = mount
                .prefix_sections
                .iter()
                .zip(&base_sections)
                .take_while(|(a, b)| self.sections_equal(a, b))
                .count();
            if shared == mount.prefix_sections.len() {
                // base is at or below the mount point; enumerate inside it
                let internal = base_sections[shared..].join("/");
                starting.push(WalkerStart {
                    filesystem_id: mount.id,
                    filesystem: mount.filesystem.clone(),
                    pending_directories: Vec::new(),
                    internal_point: internal,
                });
            } else if shared == base_sections.len() {
                // the mount point is below base; its remaining prefix
                // sections appear as virtual directories
                starting.push(WalkerStart {
                    filesystem_id: mount.id,
                    filesystem: mount.filesystem.clone(),
                    pending_directories: mount.prefix_sections[shared..].to_vec(),
                    internal_point: String::new(),
                });
            }
        }
        FileSystemWalker { rules: self.rules, starting }
    }
}

impl Default for MountingTree {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_desc(path: &str) -> FileDesc {
    FileDesc {
        natural_name: String::new(),
        mounted_name: path.to_string(),
        snapshot: FileSnapshot::missing(),
        size: 0,
    }
}

#[derive(Clone)]
struct Candidate {
    filesystem_id: FileSystemId,
    filesystem: Arc<dyn FileSystem>,
    remainder: String,
}

/// A successfully resolved path.
pub struct ResolvedFile {
    pub filesystem_id: FileSystemId,
    pub filesystem: Arc<dyn FileSystem>,
    pub marker: Marker,
}

/// Candidate enumerator returned by [`MountingTree::lookup`]. Restarts
/// automatically when mounts change underneath it.
pub struct LookupCandidates<'a> {
    tree: &'a MountingTree,
    path: String,
    candidates: Vec<Candidate>,
    next: usize,
    version: u64,
}

impl LookupCandidates<'_> {
    /// The next candidate whose backend translates the path.
    pub fn next_success(&mut self) -> Option<ResolvedFile> {
        loop {
            let current = self.tree.change_version.load(Ordering::Acquire);
            if current != self.version {
                let (candidates, version) = self.tree.snapshot_candidates(&self.path);
                self.candidates = candidates;
                self.version = version;
                self.next = 0;
            }
            let candidate = self.candidates.get(self.next)?.clone();
            self.next += 1;
            match candidate.filesystem.translate(&candidate.remainder) {
                TranslateResult::Success(marker) | TranslateResult::Pending(marker) => {
                    return Some(ResolvedFile {
                        filesystem_id: candidate.filesystem_id,
                        filesystem: candidate.filesystem,
                        marker,
                    });
                }
                TranslateResult::Invalid => {}
            }
        }
    }
}

struct WalkerStart {
    filesystem_id: FileSystemId,
    filesystem: Arc<dyn FileSystem>,
    /// Virtual directory chain still to descend before `filesystem` itself
    /// becomes enumerable.
    pending_directories: Vec<String>,
    internal_point: String,
}

/// A file yielded during a walk.
pub struct WalkedFile {
    pub filesystem_id: FileSystemId,
    pub marker: Marker,
    pub name: String,
}

/// Merged enumeration of one directory level across every mounted backend.
pub struct FileSystemWalker {
    rules: FilenameRules,
    starting: Vec<WalkerStart>,
}

impl FileSystemWalker {
    /// Immediate subdirectories, merged across backends and deduplicated.
    pub fn directories(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for start in &self.starting {
            if let Some(first) = start.pending_directories.first() {
                if seen.insert(utils::hash_filename(first, self.rules)) {
                    out.push(first.clone());
                }
                continue;
            }
            let Some(searchable) = start.filesystem.as_searchable() else { continue };
            for dir in searchable.find_subdirectories(&start.internal_point) {
                if seen.insert(utils::hash_filename(&dir, self.rules)) {
                    out.push(dir);
                }
            }
        }
        out
    }

    /// Files at this level, merged across backends; the first backend to
    /// claim a filename hash wins, mirroring lookup order.
    pub fn files(&self) -> Vec<WalkedFile> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for start in &self.starting {
            if !start.pending_directories.is_empty() {
                continue;
            }
            let Some(searchable) = start.filesystem.as_searchable() else { continue };
            for marker in searchable.find_files(&start.internal_point, "*") {
                let Ok(desc) = start.filesystem.describe(&marker) else { continue };
                let name = utils::split_file_name(&desc.natural_name);
                let file_name = &desc.natural_name[name.stem_and_path().len()..];
                if seen.insert(utils::hash_filename(file_name, self.rules)) {
                    out.push(WalkedFile {
                        filesystem_id: start.filesystem_id,
                        marker,
                        name: file_name.to_string(),
                    });
                }
            }
        }
        out
    }

    /// Descends into `sub_directory`.
    pub fn recurse(&self, sub_directory: &str) -> FileSystemWalker {
        let mut starting = Vec::new();
        for start in &self.starting {
            if let Some(first) = start.pending_directories.first() {
                if self.rules.case_sensitive && first == sub_directory
                    || !self.rules.case_sensitive && first.eq_ignore_ascii_case(sub_directory)
                {
                    starting.push(WalkerStart {
                        filesystem_id: start.filesystem_id,
                        filesystem: start.filesystem.clone(),
                        pending_directories: start.pending_directories[1..].to_vec(),
                        internal_point: start.internal_point.clone(),
                    });
                }
                continue;
            }
            let internal_point = if start.internal_point.is_empty() {
                sub_directory.to_string()
            } else {
                format!("{}/{sub_directory}", start.internal_point)
            };
            starting.push(WalkerStart {
                filesystem_id: start.filesystem_id,
                filesystem: start.filesystem.clone(),
                pending_directories: Vec::new(),
                internal_point,
            });
        }
        FileSystemWalker { rules: self.rules, starting }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{as_blob, vfs::memory::MemoryFileSystem, vfs::read_entire_file};
    use std::collections::BTreeMap;

    fn memory_fs(files: &[(&str, &str)]) -> Arc<MemoryFileSystem> {
        let map: BTreeMap<String, crate::Blob> =
            files.iter().map(|(n, c)| (n.to_string(), as_blob(c))).collect();
        Arc::new(MemoryFileSystem::new(map))
    }

    #[test]
    fn first_match_wins() {
        let tree = MountingTree::new();
        let lower = memory_fs(&[("x.txt", "from-lower")]);
        let upper = memory_fs(&[("x.txt", "from-upper")]);
        tree.mount("data", lower);
        tree.mount("data", upper);

        let resolved = tree.try_translate("data/x.txt").unwrap();
        let mut file =
            resolved.filesystem.open(&resolved.marker, OpenMode::Read, ShareMode::Read).unwrap();
        assert_eq!(read_entire_file(file.as_mut()).unwrap(), b"from-lower");
    }

    #[test]
    fn unmount_invalidates_in_flight_lookup() {
        let tree = MountingTree::new();
        let a = memory_fs(&[("x.txt", "a")]);
        let b = memory_fs(&[("x.txt", "b")]);
        let first = tree.mount("data", a);
        tree.mount("data", b);

        let mut lookup = tree.lookup("data/x.txt");
        tree.unmount(first);
        // restarted enumeration resolves through the surviving mount
        let resolved = lookup.next_success().unwrap();
        let mut file =
            resolved.filesystem.open(&resolved.marker, OpenMode::Read, ShareMode::Read).unwrap();
        assert_eq!(read_entire_file(file.as_mut()).unwrap(), b"b");
    }

    #[test]
    fn unmatched_paths_fall_through_to_default() {
        let tree = MountingTree::new();
        tree.mount("data", memory_fs(&[("x.txt", "mounted")]));
        tree.set_default_filesystem(Some(memory_fs(&[("other/y.txt", "default")])));

        assert!(tree.try_translate("other/y.txt").is_some());
        assert!(tree.try_translate("nowhere/z.txt").is_none());
    }

    #[test]
    fn fake_change_fans_out_to_all_mounts() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        struct Count(AtomicUsize);
        impl FileMonitor for Count {
            fn on_change(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let tree = MountingTree::new();
        tree.mount("data", memory_fs(&[("x.txt", "a")]));
        tree.mount("data", memory_fs(&[("x.txt", "b")]));

        let count = Arc::new(Count(AtomicUsize::new(0)));
        let as_dyn: Arc<dyn FileMonitor> = count.clone();
        let snapshot = tree.try_monitor("data/x.txt", &as_dyn);
        assert!(snapshot.exists());

        tree.fake_change("data/x.txt");
        // registered with both mounts, so both deliver an event
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn walker_merges_and_dedups() {
        let tree = MountingTree::new();
        tree.mount("assets", memory_fs(&[("tex/a.dds", "1"), ("tex/b.dds", "2")]));
        tree.mount("assets/tex", memory_fs(&[("b.dds", "shadowed"), ("c.dds", "3")]));

        let walker = tree.walk("assets");
        let dirs = walker.directories();
        assert_eq!(dirs, vec!["tex".to_string()]);

        let tex = walker.recurse("tex");
        let mut names: Vec<String> = tex.files().into_iter().map(|f| f.name).collect();
        names.sort();
        assert_eq!(names, vec!["a.dds", "b.dds", "c.dds"]);
    }
}
