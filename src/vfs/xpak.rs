//! XPAK packed-archive filesystem.
//!
//! A read-only backend over a single memory-mapped archive file. The layout
//! (all integers little-endian):
//!
//! ```text
//! header   { magic='XPAK', version=0, fileCount,
//!            fileEntriesOffset, hashTableOffset, stringTableOffset,
//!            reserved[8] }
//! fileEntries[fileCount] { offset, compressedSize, decompressedSize,
//!                          contentsHash, stringTableOffset, flags }
//! hashTable[fileCount]   sorted ascending, parallel to fileEntries
//! stringTable            null-terminated UTF-8 filenames
//! payload blobs          raw, or block-compressed iff smaller than raw
//! ```
//!
//! `translate` is O(log n): hash the name under the archive's filename
//! rules and binary-search the hash table. Compressed payloads decompress
//! into a bounded resident cache; concurrent requests for one entry share
//! a single decompression, and a resident blob stays pinned while any
//! reader holds it.

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
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, Weak},
};

pub const XPAK_MAGIC: [u8; 4] = *b"XPAK";
pub const XPAK_VERSION: u32 = 0;

const HEADER_SIZE: usize = 4 + 4 + 4 + 8 * 3 + 8 * 8;
const FILE_ENTRY_SIZE: usize = 8 * 4 + 4 + 4;

/// Default residency budget for decompressed payloads.
pub const DEFAULT_MAX_RESIDENCY: usize = 16 * 1024 * 1024;
/// Decompression cache page granularity.
pub const CACHE_PAGE_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug)]
struct FileEntry {
    offset: u64,
    compressed_size: u64,
    decompressed_size: u64,
    contents_hash: u64,
    string_table_offset: u32,
    #[allow(dead_code)]
    flags: u32,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

struct Shared {
    map: memmap2::Mmap,
    path: PathBuf,
    file_count: usize,
    entries_offset: usize,
    hash_table_offset: usize,
    string_table_offset: usize,
    snapshot: FileSnapshot,
    cache: ResidentCache,
}

impl Shared {
    fn entry(&self, idx: usize) -> FileEntry {
        let base = self.entries_offset + idx * FILE_ENTRY_SIZE;
        let bytes = &self.map[..];
        FileEntry {
            offset: read_u64(bytes, base),
            compressed_size: read_u64(bytes, base + 8),
            decompressed_size: read_u64(bytes, base + 16),
            contents_hash: read_u64(bytes, base + 24),
            string_table_offset: read_u32(bytes, base + 32),
            flags: read_u32(bytes, base + 36),
        }
    }

    fn hash_at(&self, idx: usize) -> u64 {
        read_u64(&self.map, self.hash_table_offset + idx * 8)
    }

    fn entry_name(&self, entry: &FileEntry) -> &str {
        let start = self.string_table_offset + entry.string_table_offset as usize;
        let tail = &self.map[start..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    fn payload(self: &Arc<Self>, idx: usize) -> Result<Blob> {
        let entry = self.entry(idx);
        let raw = &self.map[entry.offset as usize..(entry.offset + entry.compressed_size) as usize];
        if entry.compressed_size == entry.decompressed_size {
            return Ok(crate::as_blob(raw));
        }
        self.cache.fetch(idx as u32, || {
            lz4_flex::block::decompress(raw, entry.decompressed_size as usize)
                .map(Blob::from)
                .map_err(|e| {
                    AssetError::msg(format!(
                        "corrupt compressed payload in \"{}\": {e}",
                        self.path.display()
                    ))
                })
        })
    }
}

/// Read-only filesystem over one packed archive.
pub struct XPakFileSystem {
    shared: Arc<Shared>,
    rules: FilenameRules,
    monitors: Mutex<HashMap<u32, Vec<Weak<dyn FileMonitor>>>>,
}

impl XPakFileSystem {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_residency(path, DEFAULT_MAX_RESIDENCY)
    }

    pub fn open_with_residency(path: impl AsRef<Path>, max_residency: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path).map_err(|e| AssetError::io(e, &path))?;
        let snapshot = {
            let metadata = file.metadata().map_err(|e| AssetError::io(e, &path))?;
            let modification_time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            FileSnapshot::present(modification_time)
        };
        let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| AssetError::io(e, &path))?;

        let corrupt = |what: &str| AssetError::msg(format!("\"{}\": {what}", path.display()));

        if map.len() < HEADER_SIZE {
            return Err(corrupt("archive too small for header"));
        }
        if map[0..4] != XPAK_MAGIC {
            return Err(corrupt("bad magic, not an XPAK archive"));
        }
        if read_u32(&map, 4) != XPAK_VERSION {
            return Err(corrupt("unsupported archive version"));
        }
        let file_count = read_u32(&map, 8) as usize;
        let entries_offset = read_u64(&map, 12) as usize;
        let hash_table_offset = read_u64(&map, 20) as usize;
        let string_table_offset = read_u64(&map, 28) as usize;

        let entries_end = entries_offset.checked_add(file_count * FILE_ENTRY_SIZE);
        let hashes_end = hash_table_offset.checked_add(file_count * 8);
        match (entries_end, hashes_end) {
            (Some(e), Some(h)) if e <= map.len() && h <= map.len() => {}
            _ => return Err(corrupt("file tables extend past end of archive")),
        }
        if string_table_offset > map.len() {
            return Err(corrupt("string table extends past end of archive"));
        }

        let shared = Arc::new(Shared {
            map,
            path,
            file_count,
            entries_offset,
            hash_table_offset,
            string_table_offset,
            snapshot,
            cache: ResidentCache::new(max_residency),
        });

        // payload spans are validated up-front so open() can index freely
        for idx in 0..file_count {
            let entry = shared.entry(idx);
            let end = entry.offset.checked_add(entry.compressed_size);
            if end.map_or(true, |e| e > shared.map.len() as u64) {
                return Err(AssetError::msg(format!(
                    "\"{}\": payload {idx} extends past end of archive",
                    shared.path.display()
                )));
            }
        }

        Ok(Self {
            shared,
            rules: FilenameRules::default(),
            monitors: Mutex::new(HashMap::new()),
        })
    }

    pub fn file_count(&self) -> usize {
        self.shared.file_count
    }

    fn entry_index(&self, marker: &Marker) -> Result<u32> {
        let bytes: [u8; 4] = marker
            .as_bytes()
            .try_into()
            .map_err(|_| AssetError::msg("foreign marker passed to packed archive"))?;
        let idx = u32::from_le_bytes(bytes);
        if idx as usize >= self.shared.file_count {
            return Err(AssetError::msg("marker out of range for packed archive"));
        }
        Ok(idx)
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        let shared = &self.shared;
        if shared.file_count == 0 {
            return None;
        }
        let hash = utils::hash_filename(name, self.rules);
        let mut low = 0usize;
        let mut high = shared.file_count;
        while low < high {
            let mid = (low + high) / 2;
            match shared.hash_at(mid).cmp(&hash) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(mid as u32),
            }
        }
        None
    }
}

impl FileSystem for XPakFileSystem {
    fn translate(&self, name: &str) -> TranslateResult {
        match self.lookup(name) {
            Some(idx) => TranslateResult::Success(Marker::from_bytes(idx.to_le_bytes().to_vec())),
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
            return Err(AssetError::io(
                io::Error::new(io::ErrorKind::PermissionDenied, "packed archives are read-only"),
                &self.shared.path,
            ));
        }
        let payload = self.shared.payload(idx as usize)?;
        Ok(Box::new(ArchivedFile {
            cursor: io::Cursor::new(payload),
            snapshot: self.shared.snapshot,
        }))
    }

    fn monitor(&self, marker: &Marker, monitor: &Arc<dyn FileMonitor>) -> Result<FileSnapshot> {
        let idx = self.entry_index(marker)?;
        self.monitors.lock().unwrap().entry(idx).or_default().push(Arc::downgrade(monitor));
        Ok(self.shared.snapshot)
    }

    fn fake_change(&self, marker: &Marker) -> Result<()> {
        let idx = self.entry_index(marker)?;
        let monitors: Vec<_> = {
            let mut map = self.monitors.lock().unwrap();
            let Some(entries) = map.get_mut(&idx) else { return Ok(()) };
            entries.retain(|m| m.strong_count() != 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };
        for monitor in monitors {
            monitor.on_change();
        }
        Ok(())
    }

    fn describe(&self, marker: &Marker) -> Result<FileDesc> {
        let idx = self.entry_index(marker)? as usize;
        let entry = self.shared.entry(idx);
        let name = self.shared.entry_name(&entry).to_string();
        Ok(FileDesc {
            natural_name: name.clone(),
            mounted_name: name,
            snapshot: self.shared.snapshot,
            size: entry.decompressed_size,
        })
    }

    fn as_searchable(&self) -> Option<&dyn SearchableFileSystem> {
        Some(self)
    }
}

impl SearchableFileSystem for XPakFileSystem {
    fn find_files(&self, base_directory: &str, match_pattern: &str) -> Vec<Marker> {
        let pattern = match glob::Pattern::new(match_pattern) {
            Ok(pattern) => pattern,
            Err(_) => return Vec::new(),
        };
        let prefix = normalized_prefix(base_directory);
        (0..self.shared.file_count)
            .filter(|&idx| {
                let entry = self.shared.entry(idx);
                let name = self.shared.entry_name(&entry);
                match name.strip_prefix(&prefix) {
                    Some(rest) => !rest.contains('/') && pattern.matches(rest),
                    None => false,
                }
            })
            .map(|idx| Marker::from_bytes((idx as u32).to_le_bytes().to_vec()))
            .collect()
    }

    fn find_subdirectories(&self, base_directory: &str) -> Vec<String> {
        let prefix = normalized_prefix(base_directory);
        let mut subdirs: Vec<String> = (0..self.shared.file_count)
            .filter_map(|idx| {
                let entry = self.shared.entry(idx);
                let rest = self.shared.entry_name(&entry).strip_prefix(&prefix)?;
                let (dir, _) = rest.split_once('/')?;
                Some(dir.to_string())
            })
            .collect();
        subdirs.sort();
        subdirs.dedup();
        subdirs
    }
}

fn normalized_prefix(base_directory: &str) -> String {
    let trimmed = base_directory.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

struct ArchivedFile {
    cursor: io::Cursor<Blob>,
    snapshot: FileSnapshot,
}

impl io::Read for ArchivedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.cursor, buf)
    }
}

impl io::Write for ArchivedFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "packed archives are read-only"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for ArchivedFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        io::Seek::seek(&mut self.cursor, pos)
    }
}

impl FileInterface for ArchivedFile {
    fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn snapshot(&self) -> FileSnapshot {
        self.snapshot
    }
}

/// Bounded cache of decompressed payloads.
///
/// Entries are charged against a byte budget in page-size units. Eviction is
/// least-recently-used and skips entries that still have readers outstanding
/// (their blob is shared with an open file), so a resident reservation stays
/// stable while it is being read. Concurrent fetches of one entry share a
/// single decompression.
struct ResidentCache {
    max_residency: usize,
    inner: Mutex<ResidentCacheInner>,
    decompressed: Condvar,
}

#[derive(Default)]
struct ResidentCacheInner {
    entries: HashMap<u32, ResidentEntry>,
    clock: u64,
}

enum ResidentEntry {
    Decompressing,
    Resident { payload: Blob, charged: usize, last_use: u64 },
}

impl ResidentCache {
    fn new(max_residency: usize) -> Self {
        Self {
            max_residency,
            inner: Mutex::new(ResidentCacheInner::default()),
            decompressed: Condvar::new(),
        }
    }

    fn fetch(&self, idx: u32, decompress: impl FnOnce() -> Result<Blob>) -> Result<Blob> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            inner.clock += 1;
            let clock = inner.clock;
            match inner.entries.get_mut(&idx) {
                Some(ResidentEntry::Resident { payload, last_use, .. }) => {
                    *last_use = clock;
                    return Ok(payload.clone());
                }
                Some(ResidentEntry::Decompressing) => {
                    inner = self.decompressed.wait(inner).unwrap();
                }
                None => {
                    inner.entries.insert(idx, ResidentEntry::Decompressing);
                    drop(inner);

                    let outcome = decompress();

                    let mut inner = self.inner.lock().unwrap();
                    match outcome {
                        Ok(payload) => {
                            let charged = payload.len().div_ceil(CACHE_PAGE_SIZE).max(1)
                                * CACHE_PAGE_SIZE;
                            inner.clock += 1;
                            let last_use = inner.clock;
                            inner.entries.insert(
                                idx,
                                ResidentEntry::Resident { payload: payload.clone(), charged, last_use },
                            );
                            Self::evict_to_budget(&mut inner, self.max_residency, idx);
                            self.decompressed.notify_all();
                            return Ok(payload);
                        }
                        Err(err) => {
                            inner.entries.remove(&idx);
                            self.decompressed.notify_all();
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn evict_to_budget(inner: &mut ResidentCacheInner, budget: usize, keep: u32) {
        let mut total: usize = inner
            .entries
            .values()
            .map(|e| match e {
                ResidentEntry::Resident { charged, .. } => *charged,
                ResidentEntry::Decompressing => 0,
            })
            .sum();
        while total > budget {
            let victim = inner
                .entries
                .iter()
                .filter_map(|(&idx, entry)| match entry {
                    // strong_count == 1 means no reader holds the blob
                    ResidentEntry::Resident { payload, charged, last_use }
                        if idx != keep && Arc::strong_count(payload) == 1 =>
                    {
                        Some((idx, *last_use, *charged))
                    }
                    _ => None,
                })
                .min_by_key(|&(_, last_use, _)| last_use);
            let Some((idx, _, charged)) = victim else { break };
            inner.entries.remove(&idx);
            total -= charged;
        }
    }
}

/// Builds an XPAK archive from named payloads.
pub struct XPakWriter {
    rules: FilenameRules,
    files: Vec<(String, Vec<u8>)>,
}

impl XPakWriter {
    pub fn new() -> Self {
        Self { rules: FilenameRules::default(), files: Vec::new() }
    }

    pub fn add_file(&mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> &mut Self {
        self.files.push((name.into(), contents.into()));
        self
    }

    /// Adds every file under `root`, named by its root-relative path.
    pub fn add_directory(&mut self, root: impl AsRef<Path>) -> Result<&mut Self> {
        let root = root.as_ref();
        for entry in walkdir::WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|e| AssetError::msg(e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("walkdir yields paths under its root");
            let name = path_slash::PathExt::to_slash_lossy(relative).into_owned();
            let contents =
                fs::read(entry.path()).map_err(|e| AssetError::io(e, entry.path()))?;
            self.files.push((name, contents));
        }
        Ok(self)
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        fs::write(path, bytes).map_err(|e| AssetError::io(e, path))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        // sort by filename hash; the on-disk hash table must be ascending
        let mut ordered: Vec<(u64, &String, &Vec<u8>)> = self
            .files
            .iter()
            .map(|(name, contents)| (utils::hash_filename(name, self.rules), name, contents))
            .collect();
        ordered.sort_by_key(|&(hash, ..)| hash);
        for window in ordered.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(AssetError::msg(format!(
                    "filename hash collision between \"{}\" and \"{}\"",
                    window[0].1, window[1].1
                )));
            }
        }

        let file_count = ordered.len();
        let entries_offset = HEADER_SIZE;
        let hash_table_offset = entries_offset + file_count * FILE_ENTRY_SIZE;
        let string_table_offset = hash_table_offset + file_count * 8;

        let mut string_table = Vec::new();
        let mut string_offsets = Vec::with_capacity(file_count);
        for (_, name, _) in &ordered {
            string_offsets.push(string_table.len() as u32);
            string_table.extend_from_slice(name.as_bytes());
            string_table.push(0);
        }

        let payload_base = string_table_offset + string_table.len();
        let mut payloads = Vec::new();
        let mut entries = Vec::with_capacity(file_count);
        for ((_, _, contents), string_offset) in ordered.iter().zip(&string_offsets) {
            let compressed = lz4_flex::block::compress(contents);
            let stored: &[u8] =
                if compressed.len() < contents.len() { &compressed } else { contents };
            entries.push(FileEntry {
                offset: (payload_base + payloads.len()) as u64,
                compressed_size: stored.len() as u64,
                decompressed_size: contents.len() as u64,
                contents_hash: xxhash_rust::xxh3::xxh3_64(contents),
                string_table_offset: *string_offset,
                flags: 0,
            });
            payloads.extend_from_slice(stored);
        }

        let mut out = Vec::with_capacity(payload_base + payloads.len());
        out.extend_from_slice(&XPAK_MAGIC);
        out.extend_from_slice(&XPAK_VERSION.to_le_bytes());
        out.extend_from_slice(&(file_count as u32).to_le_bytes());
        out.extend_from_slice(&(entries_offset as u64).to_le_bytes());
        out.extend_from_slice(&(hash_table_offset as u64).to_le_bytes());
        out.extend_from_slice(&(string_table_offset as u64).to_le_bytes());
        out.extend_from_slice(&[0u8; 8 * 8]);
        debug_assert_eq!(out.len(), HEADER_SIZE);

        for entry in &entries {
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.compressed_size.to_le_bytes());
            out.extend_from_slice(&entry.decompressed_size.to_le_bytes());
            out.extend_from_slice(&entry.contents_hash.to_le_bytes());
            out.extend_from_slice(&entry.string_table_offset.to_le_bytes());
            out.extend_from_slice(&entry.flags.to_le_bytes());
        }
        for (hash, ..) in &ordered {
            out.extend_from_slice(&hash.to_le_bytes());
        }
        out.extend_from_slice(&string_table);
        out.extend_from_slice(&payloads);
        Ok(out)
    }
}

impl Default for XPakWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::read_entire_file;

    fn write_archive(dir: &Path, files: &[(&str, Vec<u8>)]) -> PathBuf {
        let mut writer = XPakWriter::new();
        for (name, contents) in files {
            writer.add_file(*name, contents.clone());
        }
        let path = dir.join("test.xpak");
        writer.write_to_path(&path).unwrap();
        path
    }

    #[test]
    fn round_trips_compressed_and_raw_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let compressible = b"abcabcabc".repeat(300);
        let files = [
            ("a.txt", b"tiny payload".to_vec()),
            ("b/c.txt", compressible.clone()),
            ("d.bin", (0u8..100).collect::<Vec<_>>()),
        ];
        let path = write_archive(dir.path(), &files);

        let archive = XPakFileSystem::open(&path).unwrap();
        assert_eq!(archive.file_count(), 3);
        for (name, contents) in &files {
            let marker = archive.translate(name).marker().unwrap();
            let mut file = archive.open(&marker, OpenMode::Read, ShareMode::Read).unwrap();
            assert_eq!(&read_entire_file(file.as_mut()).unwrap(), contents);
            assert_eq!(archive.describe(&marker).unwrap().natural_name, *name);
        }
        assert!(matches!(archive.translate("missing.txt"), TranslateResult::Invalid));
    }

    #[test]
    fn hash_table_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(
            dir.path(),
            &[
                ("z.txt", b"z".to_vec()),
                ("a.txt", b"a".to_vec()),
                ("m/n.txt", b"m".to_vec()),
            ],
        );
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"XPAK");
        let file_count = read_u32(&bytes, 8) as usize;
        let hash_table_offset = read_u64(&bytes, 20) as usize;
        let hashes: Vec<u64> =
            (0..file_count).map(|i| read_u64(&bytes, hash_table_offset + i * 8)).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn empty_archive_rejects_all_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), &[]);
        let archive = XPakFileSystem::open(&path).unwrap();
        assert_eq!(archive.file_count(), 0);
        assert!(matches!(archive.translate("anything"), TranslateResult::Invalid));
        assert!(archive.find_files("", "*").is_empty());
    }

    #[test]
    fn rejects_truncated_archives() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), &[("a.txt", b"payload".to_vec())]);
        let bytes = fs::read(&path).unwrap();
        let truncated = dir.path().join("truncated.xpak");
        fs::write(&truncated, &bytes[..HEADER_SIZE + 4]).unwrap();
        assert!(XPakFileSystem::open(&truncated).is_err());

        let mut bad_magic = bytes;
        bad_magic[0] = b'Y';
        let bad = dir.path().join("bad.xpak");
        fs::write(&bad, &bad_magic).unwrap();
        assert!(XPakFileSystem::open(&bad).is_err());
    }

    #[test]
    fn enumeration_within_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(
            dir.path(),
            &[
                ("tex/a.dds", b"a".to_vec()),
                ("tex/b.dds", b"b".to_vec()),
                ("tex/hi/c.dds", b"c".to_vec()),
                ("root.txt", b"r".to_vec()),
            ],
        );
        let archive = XPakFileSystem::open(&path).unwrap();
        assert_eq!(archive.find_files("tex", "*.dds").len(), 2);
        assert_eq!(archive.find_subdirectories("tex"), vec!["hi".to_string()]);
    }
}
