//! Raw OS filesystem backend.
//!
//! Presents a root-prefixed view of the host filesystem. Translation is
//! purely lexical (no syscalls): the marker is the tagged, root-prefixed
//! path, and existence is only decided at open/describe time. An optional
//! directory cache flips that around for read-heavy namespaces, answering
//! `translate` as `Invalid` for known-missing files without touching the
//! OS.
//!
//! A shared change monitor watches the parent directories of monitored
//! files through the platform watcher and fans events into the registered
//! [`FileMonitor`]s, which is how file changes reach the dependency
//! validation graph.

use super::{
    FileDesc, FileInterface, FileMonitor, FileSnapshot, FileSystem, Marker, OpenMode,
    SearchableFileSystem, ShareMode, TranslateResult,
};
use crate::{
    error::{AssetError, Result},
    utils::{self, FilenameRules},
};
use notify::Watcher;
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
    time::UNIX_EPOCH,
};

const MARKER_TAG_UTF8: u8 = 1;

/// Construction options for [`OsFileSystem`].
#[derive(Clone, Copy, Debug, Default)]
pub struct OsFileSystemFlags {
    /// Refuse to translate absolute paths (everything must be root-relative).
    pub refuse_absolute: bool,
    /// Strip leading path components and look names up directly in the root.
    pub ignore_paths: bool,
    /// Maintain a per-directory listing cache so `translate` can answer
    /// `Invalid` for known-missing files without syscalls.
    pub cache_directories: bool,
}

pub struct OsFileSystem {
    root: PathBuf,
    rules: FilenameRules,
    flags: OsFileSystemFlags,
    directory_cache: Mutex<HashMap<u64, HashSet<u64>>>,
    monitor: Arc<ChangeMonitor>,
}

impl OsFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_flags(root, OsFileSystemFlags::default())
    }

    pub fn with_flags(root: impl Into<PathBuf>, flags: OsFileSystemFlags) -> Self {
        let root = dunce::simplified(&root.into()).to_path_buf();
        let rules = FilenameRules { separator: '/', case_sensitive: cfg!(not(windows)) };
        let monitor = ChangeMonitor::new();
        Self { root, rules, flags, directory_cache: Mutex::new(HashMap::new()), monitor }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn marker_path(&self, marker: &Marker) -> Result<PathBuf> {
        let bytes = marker.as_bytes();
        if bytes.first() != Some(&MARKER_TAG_UTF8) {
            return Err(AssetError::msg("foreign marker passed to OS filesystem"));
        }
        let path = std::str::from_utf8(&bytes[1..])
            .map_err(|_| AssetError::msg("malformed OS filesystem marker"))?;
        Ok(PathBuf::from(path))
    }

    fn make_marker(&self, full_path: &Path) -> Marker {
        let mut bytes = Vec::with_capacity(full_path.as_os_str().len() + 1);
        bytes.push(MARKER_TAG_UTF8);
        bytes.extend_from_slice(path_slash::PathExt::to_slash_lossy(full_path).as_bytes());
        Marker::from_bytes(bytes)
    }

    fn known_missing(&self, name: &str) -> bool {
        let split = utils::split_file_name(name);
        let directory = split.stem_and_path();
        let directory_hash = utils::hash_filename(directory, self.rules);
        let file_hash =
            utils::hash_filename(&name[directory.len()..], self.rules);

        let mut cache = self.directory_cache.lock().unwrap();
        let listing = cache.entry(directory_hash).or_insert_with(|| {
            let mut listing = HashSet::new();
            if let Ok(entries) = fs::read_dir(self.root.join(directory)) {
                for entry in entries.flatten() {
                    let file_name = entry.file_name();
                    listing.insert(utils::hash_filename(&file_name.to_string_lossy(), self.rules));
                }
            }
            listing
        });
        !listing.contains(&file_hash)
    }

    fn invalidate_directory_cache(&self) {
        self.directory_cache.lock().unwrap().clear();
    }
}

fn snapshot_of(path: &Path) -> FileSnapshot {
    match fs::metadata(path) {
        Ok(metadata) => {
            let modification_time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            FileSnapshot::present(modification_time)
        }
        Err(_) => FileSnapshot::missing(),
    }
}

impl FileSystem for OsFileSystem {
    fn translate(&self, name: &str) -> TranslateResult {
        if name.is_empty() {
            return TranslateResult::Invalid;
        }
        let mut name = name;
        if Path::new(name).is_absolute() {
            if self.flags.refuse_absolute {
                return TranslateResult::Invalid;
            }
        } else if self.flags.ignore_paths {
            let split = utils::split_file_name(name);
            name = &name[split.stem_and_path().len()..];
        }
        if self.flags.cache_directories && self.known_missing(name) {
            return TranslateResult::Invalid;
        }
        let full = if Path::new(name).is_absolute() {
            PathBuf::from(name)
        } else {
            self.root.join(name)
        };
        TranslateResult::Success(self.make_marker(&full))
    }

    fn open(
        &self,
        marker: &Marker,
        mode: OpenMode,
        _share: ShareMode,
    ) -> Result<Box<dyn FileInterface>> {
        let path = self.marker_path(marker)?;
        let file = match mode {
            OpenMode::Read => fs::File::open(&path),
            OpenMode::Write | OpenMode::ReadWrite => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| AssetError::io(e, &path))?;
                }
                self.invalidate_directory_cache();
                fs::OpenOptions::new()
                    .read(mode == OpenMode::ReadWrite)
                    .write(true)
                    .create(true)
                    .truncate(mode == OpenMode::Write)
                    .open(&path)
            }
        }
        .map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied && mode == OpenMode::Read {
                // a file locked by another process surfaces as an access
                // failure; let callers retry with backoff
                AssetError::ExclusiveLock(path.clone())
            } else {
                AssetError::io(e, &path)
            }
        })?;

        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        let snapshot = snapshot_of(&path);
        Ok(Box::new(OsFile { file, size, snapshot }))
    }

    fn monitor(&self, marker: &Marker, monitor: &Arc<dyn FileMonitor>) -> Result<FileSnapshot> {
        let path = self.marker_path(marker)?;
        self.monitor.register(&path, monitor);
        Ok(snapshot_of(&path))
    }

    fn fake_change(&self, marker: &Marker) -> Result<()> {
        let path = self.marker_path(marker)?;
        self.invalidate_directory_cache();
        self.monitor.notify(&path);
        Ok(())
    }

    fn describe(&self, marker: &Marker) -> Result<FileDesc> {
        let path = self.marker_path(marker)?;
        let natural_name = path_slash::PathExt::to_slash_lossy(path.as_path()).into_owned();
        let mounted_name = path
            .strip_prefix(&self.root)
            .map(|p| path_slash::PathExt::to_slash_lossy(p).into_owned())
            .unwrap_or_else(|_| natural_name.clone());
        let snapshot = snapshot_of(&path);
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(FileDesc { natural_name, mounted_name, snapshot, size })
    }

    fn as_searchable(&self) -> Option<&dyn SearchableFileSystem> {
        Some(self)
    }
}

impl SearchableFileSystem for OsFileSystem {
    fn find_files(&self, base_directory: &str, match_pattern: &str) -> Vec<Marker> {
        let pattern = match glob::Pattern::new(match_pattern) {
            Ok(pattern) => pattern,
            Err(_) => return Vec::new(),
        };
        let directory = self.root.join(base_directory);
        walkdir::WalkDir::new(&directory)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| pattern.matches(&e.file_name().to_string_lossy()))
            .map(|e| self.make_marker(e.path()))
            .collect()
    }

    fn find_subdirectories(&self, base_directory: &str) -> Vec<String> {
        let directory = self.root.join(base_directory);
        walkdir::WalkDir::new(&directory)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }
}

struct OsFile {
    file: fs::File,
    size: u64,
    snapshot: FileSnapshot,
}

impl io::Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.file, buf)
    }
}

impl io::Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.file, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.file)
    }
}

impl io::Seek for OsFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        io::Seek::seek(&mut self.file, pos)
    }
}

impl FileInterface for OsFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn snapshot(&self) -> FileSnapshot {
        self.snapshot
    }
}

/// Watches directories through the platform watcher and routes events to
/// per-file monitor registrations.
struct ChangeMonitor {
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    /// canonical file path -> registered monitors
    registrations: Mutex<HashMap<PathBuf, Vec<Weak<dyn FileMonitor>>>>,
    watched_directories: Mutex<HashSet<PathBuf>>,
}

impl ChangeMonitor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            watcher: Mutex::new(None),
            registrations: Mutex::new(HashMap::new()),
            watched_directories: Mutex::new(HashSet::new()),
        })
    }

    fn register(self: &Arc<Self>, path: &Path, monitor: &Arc<dyn FileMonitor>) {
        let key = canonical_key(path);
        self.registrations
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(Arc::downgrade(monitor));

        let Some(directory) = path.parent() else { return };
        if !self.watched_directories.lock().unwrap().insert(directory.to_path_buf()) {
            return;
        }

        let mut watcher_slot = self.watcher.lock().unwrap();
        if watcher_slot.is_none() {
            let weak = Arc::downgrade(self);
            let watcher = notify::recommended_watcher(
                move |event: std::result::Result<notify::Event, notify::Error>| {
                    let (Ok(event), Some(this)) = (event, weak.upgrade()) else { return };
                    for path in &event.paths {
                        this.notify(path);
                    }
                },
            );
            match watcher {
                Ok(watcher) => *watcher_slot = Some(watcher),
                Err(err) => {
                    trace!("failed to create filesystem watcher: {err}");
                    return;
                }
            }
        }
        if let Some(watcher) = watcher_slot.as_mut() {
            if let Err(err) = watcher.watch(directory, notify::RecursiveMode::NonRecursive) {
                trace!("failed to watch \"{}\": {err}", directory.display());
            }
        }
    }

    fn notify(&self, path: &Path) {
        let key = canonical_key(path);
        let monitors = {
            let mut registrations = self.registrations.lock().unwrap();
            let Some(entries) = registrations.get_mut(&key) else { return };
            entries.retain(|m| m.strong_count() != 0);
            entries.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };
        if !monitors.is_empty() {
            trace!("file change event for \"{}\"", path.display());
        }
        for monitor in monitors {
            monitor.on_change();
        }
    }
}

fn canonical_key(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| dunce::simplified(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::read_entire_file;
    use std::io::Write as _;

    #[test]
    fn translate_open_describe() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"payload").unwrap();

        let vfs = OsFileSystem::new(dir.path());
        let marker = vfs.translate("a.txt").marker().unwrap();
        let mut file = vfs.open(&marker, OpenMode::Read, ShareMode::Read).unwrap();
        assert_eq!(read_entire_file(file.as_mut()).unwrap(), b"payload");

        let desc = vfs.describe(&marker).unwrap();
        assert_eq!(desc.mounted_name, "a.txt");
        assert_eq!(desc.size, 7);
        assert!(desc.snapshot.exists());
    }

    #[test]
    fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = OsFileSystem::new(dir.path());
        let marker = vfs.translate("nested/deep/out.bin").marker().unwrap();
        let mut file = vfs.open(&marker, OpenMode::Write, ShareMode::None).unwrap();
        file.write_all(b"data").unwrap();
        drop(file);
        assert_eq!(fs::read(dir.path().join("nested/deep/out.bin")).unwrap(), b"data");
    }

    #[test]
    fn directory_cache_answers_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present.txt"), b"x").unwrap();
        let vfs = OsFileSystem::with_flags(
            dir.path(),
            OsFileSystemFlags { cache_directories: true, ..Default::default() },
        );
        assert!(matches!(vfs.translate("present.txt"), TranslateResult::Success(_)));
        assert!(matches!(vfs.translate("absent.txt"), TranslateResult::Invalid));
    }

    #[test]
    fn fake_change_reaches_monitors() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Count(AtomicUsize);
        impl FileMonitor for Count {
            fn on_change(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("watched.txt"), b"x").unwrap();
        let vfs = OsFileSystem::new(dir.path());
        let marker = vfs.translate("watched.txt").marker().unwrap();

        let count = Arc::new(Count(AtomicUsize::new(0)));
        let as_dyn: Arc<dyn FileMonitor> = count.clone();
        let snapshot = vfs.monitor(&marker, &as_dyn).unwrap();
        assert!(snapshot.exists());

        vfs.fake_change(&marker).unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }
}
