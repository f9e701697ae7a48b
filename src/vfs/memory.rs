//! In-memory blob filesystem.
//!
//! A fixed set of named blobs, useful for tests and for embedding generated
//! data. The name set is static after construction; contents and
//! modification times can be updated to drive change events.

use super::{
    FileDesc, FileInterface, FileMonitor, FileSnapshot, FileSystem, Marker, OpenMode,
    SearchableFileSystem, ShareMode, TranslateResult,
};
use crate::{
    error::{AssetError, Result},
    utils::{self, FilenameRules},
    Blob,
};
use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, Weak},
};

struct Entry {
    name: String,
    contents: Blob,
    modification_time: u64,
    monitors: Vec<Weak<dyn FileMonitor>>,
}

/// Filesystem over a static map from normalized name to blob.
pub struct MemoryFileSystem {
    rules: FilenameRules,
    /// path-hash -> entry index, fixed after construction.
    index: BTreeMap<u64, usize>,
    entries: Mutex<Vec<Entry>>,
}

impl MemoryFileSystem {
    /// All files report `modification_time` 1 until touched.
    pub fn new(files: BTreeMap<String, Blob>) -> Self {
        let mut index = BTreeMap::new();
        let rules = FilenameRules::default();
        let entries = files
            .into_iter()
            .enumerate()
            .map(|(idx, (name, contents))| {
                index.insert(utils::hash_filename(&name, rules), idx);
                Entry { name, contents, modification_time: 1, monitors: Vec::new() }
            })
            .collect();
        Self { rules, index, entries: Mutex::new(entries) }
    }

    fn entry_index(&self, marker: &Marker) -> Result<usize> {
        let bytes: [u8; 4] = marker
            .as_bytes()
            .try_into()
            .map_err(|_| AssetError::msg("foreign marker passed to memory filesystem"))?;
        Ok(u32::from_le_bytes(bytes) as usize)
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(&utils::hash_filename(name, self.rules)).copied()
    }

    /// Replaces the contents of an existing file, advancing its modification
    /// time and notifying monitors.
    pub fn set_contents(&self, name: &str, contents: Blob) -> Result<()> {
        let idx = self
            .lookup(name)
            .ok_or_else(|| AssetError::msg(format!("no memory file named \"{name}\"")))?;
        let monitors = {
            let mut entries = self.entries.lock().unwrap();
            let entry = &mut entries[idx];
            entry.contents = contents;
            entry.modification_time += 1;
            live_monitors(&mut entry.monitors)
        };
        notify(monitors);
        Ok(())
    }
}

fn live_monitors(monitors: &mut Vec<Weak<dyn FileMonitor>>) -> Vec<Arc<dyn FileMonitor>> {
    monitors.retain(|m| m.strong_count() != 0);
    monitors.iter().filter_map(Weak::upgrade).collect()
}

fn notify(monitors: Vec<Arc<dyn FileMonitor>>) {
    for monitor in monitors {
        monitor.on_change();
    }
}

impl FileSystem for MemoryFileSystem {
    fn translate(&self, name: &str) -> TranslateResult {
        match self.lookup(name) {
            Some(idx) => {
                TranslateResult::Success(Marker::from_bytes((idx as u32).to_le_bytes().to_vec()))
            }
            None => TranslateResult::Invalid,
        }
    }

    fn open(
        &self,
        marker: &Marker,
        mode: OpenMode,
        _share: ShareMode,
    ) -> Result<Box<dyn FileInterface>> {
        let idx = self.entry_index(marker)?;
        if mode != OpenMode::Read {
            let entries = self.entries.lock().unwrap();
            return Err(AssetError::io(
                io::Error::new(io::ErrorKind::PermissionDenied, "memory filesystem is read-only"),
                &entries[idx].name,
            ));
        }
        let entries = self.entries.lock().unwrap();
        let entry = &entries[idx];
        Ok(Box::new(MemoryFile {
            cursor: io::Cursor::new(entry.contents.clone()),
            snapshot: FileSnapshot::present(entry.modification_time),
        }))
    }

    fn monitor(&self, marker: &Marker, monitor: &Arc<dyn FileMonitor>) -> Result<FileSnapshot> {
        let idx = self.entry_index(marker)?;
        let mut entries = self.entries.lock().unwrap();
        let entry = &mut entries[idx];
        entry.monitors.push(Arc::downgrade(monitor));
        Ok(FileSnapshot::present(entry.modification_time))
    }

    fn fake_change(&self, marker: &Marker) -> Result<()> {
        let idx = self.entry_index(marker)?;
        let monitors = {
            let mut entries = self.entries.lock().unwrap();
            let entry = &mut entries[idx];
            entry.modification_time += 1;
            live_monitors(&mut entry.monitors)
        };
        notify(monitors);
        Ok(())
    }

    fn describe(&self, marker: &Marker) -> Result<FileDesc> {
        let idx = self.entry_index(marker)?;
        let entries = self.entries.lock().unwrap();
        let entry = &entries[idx];
        Ok(FileDesc {
            natural_name: entry.name.clone(),
            mounted_name: entry.name.clone(),
            snapshot: FileSnapshot::present(entry.modification_time),
            size: entry.contents.len() as u64,
        })
    }

    fn as_searchable(&self) -> Option<&dyn SearchableFileSystem> {
        Some(self)
    }
}

impl SearchableFileSystem for MemoryFileSystem {
    fn find_files(&self, base_directory: &str, match_pattern: &str) -> Vec<Marker> {
        let pattern = match glob::Pattern::new(match_pattern) {
            Ok(pattern) => pattern,
            Err(_) => return Vec::new(),
        };
        let prefix = directory_prefix(base_directory);
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                let Some(rest) = entry.name.strip_prefix(&prefix) else { return false };
                !rest.contains('/') && pattern.matches(rest)
            })
            .map(|(idx, _)| Marker::from_bytes((idx as u32).to_le_bytes().to_vec()))
            .collect()
    }

    fn find_subdirectories(&self, base_directory: &str) -> Vec<String> {
        let prefix = directory_prefix(base_directory);
        let entries = self.entries.lock().unwrap();
        let mut subdirs: Vec<String> = entries
            .iter()
            .filter_map(|entry| {
                let rest = entry.name.strip_prefix(&prefix)?;
                let (dir, _) = rest.split_once('/')?;
                Some(dir.to_string())
            })
            .collect();
        subdirs.sort();
        subdirs.dedup();
        subdirs
    }
}

fn directory_prefix(base_directory: &str) -> String {
    let trimmed = base_directory.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

struct MemoryFile {
    cursor: io::Cursor<Blob>,
    snapshot: FileSnapshot,
}

impl io::Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.cursor, buf)
    }
}

impl io::Write for MemoryFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "memory file opened for reading"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for MemoryFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        io::Seek::seek(&mut self.cursor, pos)
    }
}

impl FileInterface for MemoryFile {
    fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn snapshot(&self) -> FileSnapshot {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::as_blob;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> MemoryFileSystem {
        let mut files = BTreeMap::new();
        files.insert("src/x.txt".to_string(), as_blob("alpha"));
        files.insert("src/nested/y.txt".to_string(), as_blob("beta"));
        MemoryFileSystem::new(files)
    }

    struct CountingMonitor(AtomicUsize);
    impl FileMonitor for CountingMonitor {
        fn on_change(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn translate_and_read() {
        let fs = fixture();
        let marker = fs.translate("src/x.txt").marker().unwrap();
        let mut file = fs.open(&marker, OpenMode::Read, ShareMode::Read).unwrap();
        let contents = super::super::read_entire_file(file.as_mut()).unwrap();
        assert_eq!(contents, b"alpha");
        assert!(matches!(fs.translate("src/missing.txt"), TranslateResult::Invalid));
    }

    #[test]
    fn fake_change_notifies_and_advances_snapshot() {
        let fs = fixture();
        let marker = fs.translate("src/x.txt").marker().unwrap();
        let monitor: Arc<CountingMonitor> = Arc::new(CountingMonitor(AtomicUsize::new(0)));
        let as_dyn: Arc<dyn FileMonitor> = monitor.clone();
        let before = fs.monitor(&marker, &as_dyn).unwrap();

        fs.fake_change(&marker).unwrap();
        assert_eq!(monitor.0.load(Ordering::SeqCst), 1);
        let after = fs.describe(&marker).unwrap().snapshot;
        assert!(after.modification_time > before.modification_time);
    }

    #[test]
    fn enumeration() {
        let fs = fixture();
        assert_eq!(fs.find_files("src", "*.txt").len(), 1);
        assert_eq!(fs.find_subdirectories("src"), vec!["nested".to_string()]);
    }
}
