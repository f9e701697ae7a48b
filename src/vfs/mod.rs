//! Virtual filesystem interface and backends.
//!
//! A [`FileSystem`] provides a uniform way to resolve, open and monitor
//! file-like objects: raw OS files, in-memory blobs, or entries inside a
//! packed archive. Backends are composed into a namespace by the
//! [`mount::MountingTree`].
//!
//! Resolution is a two-step protocol: [`FileSystem::translate`] maps a name
//! onto an opaque [`Marker`], and the marker is then passed to `open`,
//! `monitor` or `describe`. Markers are private to the backend that issued
//! them; callers never interpret their contents.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::{fmt, io, sync::Arc};

pub mod memory;
pub mod mount;
pub mod os;
pub mod xpak;

/// Existence state observed for a file at a point in time.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum FileState {
    Missing,
    Present,
    /// The file is being produced and not yet readable.
    Pending,
}

/// An observation of a file's (existence, modification-time) state.
///
/// Two snapshots compare equal iff both fields match; this is the minimum
/// unit of freshness comparison for the whole invalidation system.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub state: FileState,
    pub modification_time: u64,
}

impl FileSnapshot {
    pub const fn missing() -> Self {
        Self { state: FileState::Missing, modification_time: 0 }
    }

    pub const fn present(modification_time: u64) -> Self {
        Self { state: FileState::Present, modification_time }
    }

    pub fn exists(&self) -> bool {
        self.state != FileState::Missing
    }
}

/// Opaque identifier of a file within the backend that produced it.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Marker(Vec<u8>);

impl Marker {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Marker({} bytes)", self.0.len())
    }
}

/// Outcome of name translation.
#[derive(Clone, Debug)]
pub enum TranslateResult {
    Success(Marker),
    /// The object is expected to exist but is not yet resolvable.
    Pending(Marker),
    Invalid,
}

impl TranslateResult {
    pub fn marker(self) -> Option<Marker> {
        match self {
            TranslateResult::Success(marker) | TranslateResult::Pending(marker) => Some(marker),
            TranslateResult::Invalid => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    /// Create if missing, preserve existing contents; for in-place updates.
    ReadWrite,
}

/// What concurrent access other openers are permitted while a file is held.
/// Backends without mandatory locking treat this as advisory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShareMode {
    /// Exclusive; no other opener allowed.
    None,
    Read,
    ReadWrite,
}

impl Default for ShareMode {
    fn default() -> Self {
        ShareMode::Read
    }
}

/// An opened file-like object.
pub trait FileInterface: io::Read + io::Write + io::Seek + Send {
    fn size(&self) -> u64;
    fn snapshot(&self) -> FileSnapshot;
}

/// Reads the remaining contents of a file interface.
pub fn read_entire_file(file: &mut dyn FileInterface) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Description of a file object within a filesystem.
///
/// `natural_name` is the form closest to how the backend stores the object;
/// `mounted_name` is the name it resolves to under the mounting tree, when
/// known. Backends that map several spellings onto one object (for example
/// case-insensitive ones) report the stored spelling as natural.
#[derive(Clone, Debug)]
pub struct FileDesc {
    pub natural_name: String,
    pub mounted_name: String,
    pub snapshot: FileSnapshot,
    pub size: u64,
}

/// Receives change events for a monitored file. Implementations are invoked
/// from monitor threads and must be cheap and non-blocking.
pub trait FileMonitor: Send + Sync {
    fn on_change(&self);
}

/// Interface for a mountable virtual filesystem.
///
/// Intended mostly for input; there are no operations for creating or
/// removing directories. Writable backends simply honor
/// [`OpenMode::Write`].
pub trait FileSystem: Send + Sync {
    fn translate(&self, name: &str) -> TranslateResult;

    fn open(&self, marker: &Marker, mode: OpenMode, share: ShareMode)
        -> Result<Box<dyn FileInterface>>;

    /// Registers `monitor` for change events on the file and returns the
    /// current snapshot.
    fn monitor(&self, marker: &Marker, monitor: &Arc<dyn FileMonitor>) -> Result<FileSnapshot>;

    /// Fabricates a change event, as if the file had been modified.
    fn fake_change(&self, marker: &Marker) -> Result<()>;

    fn describe(&self, marker: &Marker) -> Result<FileDesc>;

    /// Backends that support enumeration return themselves here.
    fn as_searchable(&self) -> Option<&dyn SearchableFileSystem> {
        None
    }
}

/// Enumeration support for backends that can list their contents.
pub trait SearchableFileSystem: FileSystem {
    /// Finds files directly under `base_directory` whose names match
    /// `match_pattern` (glob-style, case-sensitive).
    fn find_files(&self, base_directory: &str, match_pattern: &str) -> Vec<Marker>;

    fn find_subdirectories(&self, base_directory: &str) -> Vec<String>;
}

/// Convenience: translate + open in one step.
pub fn open_file(
    fs: &dyn FileSystem,
    name: &str,
    mode: OpenMode,
    share: ShareMode,
) -> Result<Box<dyn FileInterface>> {
    match fs.translate(name) {
        TranslateResult::Success(marker) => fs.open(&marker, mode, share),
        TranslateResult::Pending(_) | TranslateResult::Invalid => Err(crate::error::AssetError::io(
            io::Error::new(io::ErrorKind::NotFound, "name did not translate"),
            name,
        )),
    }
}
