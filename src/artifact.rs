//! Artifacts and artifact collections.
//!
//! A compiler produces [`Artifact`]s: named, typed, versioned blobs. An
//! [`ArtifactCollection`] is the addressable bundle a client gets back: a
//! set of artifacts plus validity state and the dependency validation that
//! tells the client when the bundle goes stale.
//!
//! Collections come in four closed forms (in-memory blobs, loose compile
//! products on disk, archive-cache entries, and error-only bundles), so the
//! type is a tagged variant rather than a trait object; every operation is
//! a small match with closed knowledge of the implementations.

use crate::{
    depval::DependencyValidation,
    error::{AssetError, ConstructionKind, Result},
    store::{archive::ArchiveEntryCollection, loose::CompileProductsCollection},
    vfs::FileInterface,
    AssetState, Blob, CHUNK_TYPE_LOG,
};
use std::{io, io::Read as _, io::Seek as _, sync::Arc};

/// Version wildcard: any stored version satisfies the request.
pub const VERSION_ANY: u32 = u32::MAX;

/// A single named, typed, versioned payload produced by a compiler backend.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub chunk_type_code: u64,
    pub version: u32,
    pub name: String,
    pub data: Blob,
}

impl Artifact {
    pub fn new(
        chunk_type_code: u64,
        version: u32,
        name: impl Into<String>,
        data: Blob,
    ) -> Self {
        Self { chunk_type_code, version, name: name.into(), data }
    }
}

/// One output of a compile operation: the artifact set for a single target,
/// plus whatever dependencies were discovered while serializing it.
#[derive(Default)]
pub struct SerializedTarget {
    pub artifacts: Vec<Artifact>,
    pub depval: Option<DependencyValidation>,
}

/// How a requested artifact should be returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArtifactDataForm {
    /// Copy into an 8-byte-aligned heap buffer.
    Raw,
    /// As `Raw`, for block-serialized payloads that the caller will
    /// reinterpret in place.
    TypedBlock,
    /// The payload by reference, no copy.
    SharedBlob,
    /// A closure that reopens the underlying file, for streaming large
    /// artifacts.
    ReopenFunction,
    /// The on-disk filename; only valid for loose-files storage.
    Filename,
}

/// A request for one chunk out of a collection.
#[derive(Clone, Copy, Debug)]
pub struct ArtifactRequest {
    /// For diagnostics only; makes failed requests easier to track down.
    pub name: &'static str,
    pub chunk_type_code: u64,
    /// Exact version required, or [`VERSION_ANY`].
    pub expected_version: u32,
    pub data_form: ArtifactDataForm,
}

pub type ReopenFunction = Arc<dyn Fn() -> Result<Box<dyn FileInterface>> + Send + Sync>;

/// An 8-byte-aligned owned byte buffer, for payloads that embed types with
/// alignment requirements.
pub struct AlignedBuffer {
    storage: Vec<u64>,
    len: usize,
}

impl AlignedBuffer {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut storage = vec![0u64; bytes.len().div_ceil(8)];
        // view the u64 backing store as bytes for the copy
        let dst = unsafe {
            std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast::<u8>(), storage.len() * 8)
        };
        dst[..bytes.len()].copy_from_slice(bytes);
        Self { storage, len: bytes.len() }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AlignedBuffer({} bytes)", self.len)
    }
}

/// The realized form of one fulfilled [`ArtifactRequest`].
#[derive(Default)]
pub struct ArtifactRequestResult {
    pub buffer: Option<AlignedBuffer>,
    pub shared_blob: Option<Blob>,
    pub reopen: Option<ReopenFunction>,
    pub artifact_filename: Option<String>,
}

impl std::fmt::Debug for ArtifactRequestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRequestResult")
            .field("buffer", &self.buffer)
            .field("shared_blob", &self.shared_blob)
            .field("reopen", &self.reopen.as_ref().map(|_| "<fn>"))
            .field("artifact_filename", &self.artifact_filename)
            .finish()
    }
}

impl ArtifactRequestResult {
    pub(crate) fn from_blob(blob: Blob) -> Self {
        Self { shared_blob: Some(blob), ..Default::default() }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self { buffer: Some(AlignedBuffer::from_slice(bytes)), ..Default::default() }
    }

    pub(crate) fn from_reopen(reopen: ReopenFunction) -> Self {
        Self { reopen: Some(reopen), ..Default::default() }
    }

    pub(crate) fn from_filename(filename: impl Into<String>) -> Self {
        Self { artifact_filename: Some(filename.into()), ..Default::default() }
    }
}

/// The set a compile future resolves to: one collection per target code.
pub type ArtifactCollectionSet = Vec<(u64, Arc<ArtifactCollection>)>;

/// An addressable bundle of artifacts plus validity metadata; the unit of
/// caching.
pub enum ArtifactCollection {
    /// Artifacts held in memory, straight from a compile.
    Blobs(BlobCollection),
    /// A loose-files store entry, resolved through its products manifest.
    StoreProducts(CompileProductsCollection),
    /// An entry in an archive cache, re-read from disk on demand.
    ArchiveEntry(ArchiveEntryCollection),
    /// A failed compile; carries only the error log.
    CompilerException(ExceptionCollection),
}

impl ArtifactCollection {
    /// Fulfills `requests` against this collection, atomically: every
    /// request resolves or the whole call fails.
    ///
    /// Each chunk-type code may appear only once. A missing chunk fails
    /// with a [`ConstructionKind::MissingFile`] error carrying this
    /// collection's dependency validation, so the caller can monitor for
    /// changes and retry; a version mismatch fails with
    /// [`ConstructionKind::UnsupportedVersion`].
    pub fn resolve_requests(
        &self,
        requests: &[ArtifactRequest],
    ) -> Result<Vec<ArtifactRequestResult>> {
        validate_unique_type_codes(requests)?;
        match self {
            ArtifactCollection::Blobs(blobs) => blobs.resolve_requests(requests),
            ArtifactCollection::StoreProducts(products) => products.resolve_requests(requests),
            ArtifactCollection::ArchiveEntry(entry) => entry.resolve_requests(requests),
            ArtifactCollection::CompilerException(exception) => {
                exception.resolve_requests(requests)
            }
        }
    }

    pub fn dependency_validation(&self) -> DependencyValidation {
        match self {
            ArtifactCollection::Blobs(c) => c.depval.clone(),
            ArtifactCollection::StoreProducts(c) => c.dependency_validation(),
            ArtifactCollection::ArchiveEntry(c) => c.dependency_validation(),
            ArtifactCollection::CompilerException(c) => c.depval.clone(),
        }
    }

    pub fn asset_state(&self) -> AssetState {
        match self {
            ArtifactCollection::Blobs(c) => c.state,
            ArtifactCollection::StoreProducts(c) => c.asset_state(),
            ArtifactCollection::ArchiveEntry(c) => c.asset_state(),
            ArtifactCollection::CompilerException(_) => AssetState::Invalid,
        }
    }

    /// Parameters to pass through to the asset when it is actually loaded
    /// from the stored payload (e.g. the `:entrypoint` suffix of the
    /// original request).
    pub fn request_parameters(&self) -> &str {
        match self {
            ArtifactCollection::Blobs(c) => &c.request_parameters,
            ArtifactCollection::StoreProducts(_) => "",
            ArtifactCollection::ArchiveEntry(c) => c.request_parameters(),
            ArtifactCollection::CompilerException(_) => "",
        }
    }

    /// The diagnostic log carried by this collection, if it has one.
    pub fn error_message(&self) -> Option<String> {
        if let ArtifactCollection::CompilerException(exception) = self {
            return Some(crate::blob_to_string(&exception.log));
        }
        let requests = [ArtifactRequest {
            name: "error-log",
            chunk_type_code: CHUNK_TYPE_LOG,
            expected_version: VERSION_ANY,
            data_form: ArtifactDataForm::SharedBlob,
        }];
        let resolved = self.resolve_requests(&requests).ok()?;
        resolved[0].shared_blob.as_ref().map(crate::blob_to_string)
    }
}

pub(crate) fn validate_unique_type_codes(requests: &[ArtifactRequest]) -> Result<()> {
    for (idx, request) in requests.iter().enumerate() {
        if requests[..idx].iter().any(|r| r.chunk_type_code == request.chunk_type_code) {
            return Err(AssetError::msg(format!(
                "chunk type code {:#x} is repeated in one resolve call (request \"{}\")",
                request.chunk_type_code, request.name
            )));
        }
    }
    Ok(())
}

pub(crate) fn missing_chunk_error(
    collection_name: &str,
    request: &ArtifactRequest,
    depval: &DependencyValidation,
) -> AssetError {
    AssetError::construction(
        ConstructionKind::MissingFile,
        format!(
            "missing chunk {:#x} (\"{}\") in artifact collection \"{collection_name}\"",
            request.chunk_type_code, request.name
        ),
        Some(depval.clone()),
    )
}

pub(crate) fn version_mismatch_error(
    request: &ArtifactRequest,
    got: u32,
    depval: &DependencyValidation,
) -> AssetError {
    AssetError::construction(
        ConstructionKind::UnsupportedVersion,
        format!(
            "chunk {:#x} (\"{}\") has version {got}, but version {} was requested",
            request.chunk_type_code, request.name, request.expected_version
        ),
        Some(depval.clone()),
    )
}

/// In-memory artifacts, as produced by a compile operation before (or
/// instead of) being stored.
pub struct BlobCollection {
    pub(crate) chunks: Vec<Artifact>,
    pub(crate) state: AssetState,
    pub(crate) depval: DependencyValidation,
    pub(crate) collection_name: String,
    pub(crate) request_parameters: String,
}

impl BlobCollection {
    pub fn new(
        chunks: Vec<Artifact>,
        state: AssetState,
        depval: DependencyValidation,
        collection_name: impl Into<String>,
    ) -> Self {
        Self {
            chunks,
            state,
            depval,
            collection_name: collection_name.into(),
            request_parameters: String::new(),
        }
    }

    pub fn with_request_parameters(mut self, request_parameters: impl Into<String>) -> Self {
        self.request_parameters = request_parameters.into();
        self
    }

    fn resolve_requests(&self, requests: &[ArtifactRequest]) -> Result<Vec<ArtifactRequestResult>> {
        resolve_from_artifacts(&self.chunks, &self.collection_name, &self.depval, requests)
    }
}

/// Fulfills `requests` from in-memory artifacts; shared by blob collections
/// and archive entries that have not been flushed yet.
pub(crate) fn resolve_from_artifacts(
    chunks: &[Artifact],
    collection_name: &str,
    depval: &DependencyValidation,
    requests: &[ArtifactRequest],
) -> Result<Vec<ArtifactRequestResult>> {
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        let chunk = chunks
            .iter()
            .find(|c| c.chunk_type_code == request.chunk_type_code)
            .ok_or_else(|| missing_chunk_error(collection_name, request, depval))?;
        if request.expected_version != VERSION_ANY && chunk.version != request.expected_version {
            return Err(version_mismatch_error(request, chunk.version, depval));
        }
        results.push(match request.data_form {
            ArtifactDataForm::Raw | ArtifactDataForm::TypedBlock => {
                ArtifactRequestResult::from_bytes(&chunk.data)
            }
            ArtifactDataForm::SharedBlob => ArtifactRequestResult::from_blob(chunk.data.clone()),
            ArtifactDataForm::ReopenFunction => {
                let data = chunk.data.clone();
                ArtifactRequestResult::from_reopen(Arc::new(move || {
                    Ok(Box::new(BlobFile::new(data.clone())) as Box<dyn FileInterface>)
                }))
            }
            ArtifactDataForm::Filename => {
                return Err(AssetError::construction(
                    ConstructionKind::FormatError,
                    "filename requests are only valid for loose-files storage",
                    Some(depval.clone()),
                ));
            }
        });
    }
    Ok(results)
}

/// A failed compile. Resolving anything but the log chunk reports the
/// captured error.
pub struct ExceptionCollection {
    pub(crate) log: Blob,
    pub(crate) depval: DependencyValidation,
}

impl ExceptionCollection {
    pub fn new(log: Blob, depval: DependencyValidation) -> Self {
        Self { log, depval }
    }

    fn resolve_requests(&self, requests: &[ArtifactRequest]) -> Result<Vec<ArtifactRequestResult>> {
        if let [request] = requests {
            if request.chunk_type_code == CHUNK_TYPE_LOG
                && request.data_form == ArtifactDataForm::SharedBlob
            {
                return Ok(vec![ArtifactRequestResult::from_blob(self.log.clone())]);
            }
        }
        Err(AssetError::construction(
            ConstructionKind::Unknown,
            format!("compile operation failed with error: {}", crate::blob_to_string(&self.log)),
            Some(self.depval.clone()),
        ))
    }
}

/// An in-memory file view over a blob, backing reopen requests for
/// collections that never touched disk.
pub(crate) struct BlobFile {
    cursor: io::Cursor<Blob>,
}

impl BlobFile {
    pub(crate) fn new(data: Blob) -> Self {
        Self { cursor: io::Cursor::new(data) }
    }
}

impl io::Read for BlobFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl io::Write for BlobFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "blob files are read-only"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for BlobFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl FileInterface for BlobFile {
    fn size(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn snapshot(&self) -> crate::vfs::FileSnapshot {
        crate::vfs::FileSnapshot::present(0)
    }
}

// ---------------------------------------------------------------------------
// chunk-file container

const CHUNK_FILE_MAGIC: [u8; 4] = *b"XCHU";
const CHUNK_FILE_VERSION: u32 = 0;
const CHUNK_FILE_HEADER_SIZE: usize = 4 + 4 + 4;
const CHUNK_ENTRY_SIZE: usize = 8 + 4 + 4 + 8 + 8;

/// One entry in a chunk-file's table of contents.
#[derive(Clone, Debug)]
pub(crate) struct ChunkTableEntry {
    pub chunk_type_code: u64,
    pub version: u32,
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

/// Serializes several artifacts into one self-describing container file,
/// used when loose-files storage packs multiple chunks together.
pub(crate) fn write_chunk_file(out: &mut dyn io::Write, artifacts: &[Artifact]) -> Result<()> {
    let mut string_table = Vec::new();
    let mut name_offsets = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        name_offsets.push(string_table.len() as u32);
        string_table.extend_from_slice(artifact.name.as_bytes());
        string_table.push(0);
    }

    let payload_base =
        CHUNK_FILE_HEADER_SIZE + artifacts.len() * CHUNK_ENTRY_SIZE + 4 + string_table.len();

    let write = |out: &mut dyn io::Write, bytes: &[u8]| {
        out.write_all(bytes).map_err(|e| AssetError::io(e, "chunk file"))
    };

    write(out, &CHUNK_FILE_MAGIC)?;
    write(out, &CHUNK_FILE_VERSION.to_le_bytes())?;
    write(out, &(artifacts.len() as u32).to_le_bytes())?;

    let mut offset = payload_base as u64;
    for (artifact, name_offset) in artifacts.iter().zip(&name_offsets) {
        write(out, &artifact.chunk_type_code.to_le_bytes())?;
        write(out, &artifact.version.to_le_bytes())?;
        write(out, &name_offset.to_le_bytes())?;
        write(out, &offset.to_le_bytes())?;
        write(out, &(artifact.data.len() as u64).to_le_bytes())?;
        offset += artifact.data.len() as u64;
    }
    write(out, &(string_table.len() as u32).to_le_bytes())?;
    write(out, &string_table)?;
    for artifact in artifacts {
        write(out, &artifact.data)?;
    }
    Ok(())
}

/// Reads the table of contents of a chunk file.
pub(crate) fn read_chunk_table(file: &mut dyn FileInterface) -> Result<Vec<ChunkTableEntry>> {
    let err = |what: &str| AssetError::construction(ConstructionKind::FormatError, what, None);

    file.seek(io::SeekFrom::Start(0)).map_err(|e| AssetError::io(e, "chunk file"))?;
    let mut header = [0u8; CHUNK_FILE_HEADER_SIZE];
    file.read_exact(&mut header).map_err(|_| err("chunk file too small for header"))?;
    if header[0..4] != CHUNK_FILE_MAGIC {
        return Err(err("bad magic, not a chunk file"));
    }
    if u32::from_le_bytes(header[4..8].try_into().unwrap()) != CHUNK_FILE_VERSION {
        return Err(err("unsupported chunk file version"));
    }
    let count = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;

    let mut table = vec![0u8; count * CHUNK_ENTRY_SIZE];
    file.read_exact(&mut table).map_err(|_| err("chunk file table truncated"))?;
    let mut string_table_size = [0u8; 4];
    file.read_exact(&mut string_table_size).map_err(|_| err("chunk file table truncated"))?;
    let mut string_table = vec![0u8; u32::from_le_bytes(string_table_size) as usize];
    file.read_exact(&mut string_table).map_err(|_| err("chunk file string table truncated"))?;

    let entry_name = |offset: u32| -> String {
        let tail = &string_table[(offset as usize).min(string_table.len())..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).into_owned()
    };

    Ok((0..count)
        .map(|idx| {
            let base = idx * CHUNK_ENTRY_SIZE;
            ChunkTableEntry {
                chunk_type_code: u64::from_le_bytes(table[base..base + 8].try_into().unwrap()),
                version: u32::from_le_bytes(table[base + 8..base + 12].try_into().unwrap()),
                name: entry_name(u32::from_le_bytes(
                    table[base + 12..base + 16].try_into().unwrap(),
                )),
                offset: u64::from_le_bytes(table[base + 16..base + 24].try_into().unwrap()),
                size: u64::from_le_bytes(table[base + 24..base + 32].try_into().unwrap()),
            }
        })
        .collect())
}

/// Resolves `requests` against an open chunk file.
pub(crate) fn resolve_from_chunk_file(
    file: &mut dyn FileInterface,
    collection_name: &str,
    depval: &DependencyValidation,
    requests: &[ArtifactRequest],
    reopen: impl Fn() -> ReopenFunction,
    filename: Option<&str>,
) -> Result<Vec<ArtifactRequestResult>> {
    let table = read_chunk_table(file)?;
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        let entry = table
            .iter()
            .find(|e| e.chunk_type_code == request.chunk_type_code)
            .ok_or_else(|| missing_chunk_error(collection_name, request, depval))?;
        if request.expected_version != VERSION_ANY && entry.version != request.expected_version {
            return Err(version_mismatch_error(request, entry.version, depval));
        }
        results.push(match request.data_form {
            ArtifactDataForm::Raw
            | ArtifactDataForm::TypedBlock
            | ArtifactDataForm::SharedBlob => {
                file.seek(io::SeekFrom::Start(entry.offset))
                    .map_err(|e| AssetError::io(e, collection_name))?;
                let mut data = vec![0u8; entry.size as usize];
                file.read_exact(&mut data).map_err(|e| AssetError::io(e, collection_name))?;
                if request.data_form == ArtifactDataForm::SharedBlob {
                    ArtifactRequestResult::from_blob(Blob::from(data))
                } else {
                    ArtifactRequestResult::from_bytes(&data)
                }
            }
            ArtifactDataForm::ReopenFunction => ArtifactRequestResult::from_reopen(reopen()),
            ArtifactDataForm::Filename => match filename {
                Some(filename) => ArtifactRequestResult::from_filename(filename),
                None => {
                    return Err(AssetError::construction(
                        ConstructionKind::FormatError,
                        "filename requests are only valid for loose-files storage",
                        Some(depval.clone()),
                    ));
                }
            },
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::as_blob;

    fn sample_chunks() -> Vec<Artifact> {
        vec![
            Artifact::new(0x1111, 1, "main", as_blob("hello")),
            Artifact::new(0x2222, 3, "extra", as_blob("world")),
        ]
    }

    fn blob_collection(state: AssetState) -> ArtifactCollection {
        ArtifactCollection::Blobs(BlobCollection::new(
            sample_chunks(),
            state,
            DependencyValidation::empty(),
            "test-collection",
        ))
    }

    #[test]
    fn resolves_shared_blobs() {
        let collection = blob_collection(AssetState::Ready);
        let results = collection
            .resolve_requests(&[ArtifactRequest {
                name: "main",
                chunk_type_code: 0x1111,
                expected_version: 1,
                data_form: ArtifactDataForm::SharedBlob,
            }])
            .unwrap();
        assert_eq!(results[0].shared_blob.as_deref(), Some(b"hello".as_slice()));
    }

    #[test]
    fn missing_chunk_is_construction_error() {
        let collection = blob_collection(AssetState::Ready);
        let err = collection
            .resolve_requests(&[ArtifactRequest {
                name: "nope",
                chunk_type_code: 0x9999,
                expected_version: VERSION_ANY,
                data_form: ArtifactDataForm::SharedBlob,
            }])
            .unwrap_err();
        assert!(matches!(
            err,
            AssetError::Construction { kind: ConstructionKind::MissingFile, .. }
        ));
    }

    #[test]
    fn version_mismatch_is_distinct_error() {
        let collection = blob_collection(AssetState::Ready);
        let err = collection
            .resolve_requests(&[ArtifactRequest {
                name: "main",
                chunk_type_code: 0x1111,
                expected_version: 2,
                data_form: ArtifactDataForm::SharedBlob,
            }])
            .unwrap_err();
        assert!(matches!(
            err,
            AssetError::Construction { kind: ConstructionKind::UnsupportedVersion, .. }
        ));
    }

    #[test]
    fn duplicate_type_codes_rejected() {
        let collection = blob_collection(AssetState::Ready);
        let request = ArtifactRequest {
            name: "main",
            chunk_type_code: 0x1111,
            expected_version: VERSION_ANY,
            data_form: ArtifactDataForm::SharedBlob,
        };
        assert!(collection.resolve_requests(&[request, request]).is_err());
    }

    #[test]
    fn raw_form_copies_into_aligned_buffer() {
        let collection = blob_collection(AssetState::Ready);
        let results = collection
            .resolve_requests(&[ArtifactRequest {
                name: "main",
                chunk_type_code: 0x1111,
                expected_version: 1,
                data_form: ArtifactDataForm::Raw,
            }])
            .unwrap();
        let buffer = results[0].buffer.as_ref().unwrap();
        assert_eq!(buffer.as_slice(), b"hello");
        assert_eq!(buffer.as_slice().as_ptr() as usize % 8, 0);
    }

    #[test]
    fn exception_collection_surfaces_log_only() {
        let collection = ArtifactCollection::CompilerException(ExceptionCollection::new(
            as_blob("shader failed to parse"),
            DependencyValidation::empty(),
        ));
        assert_eq!(collection.asset_state(), AssetState::Invalid);
        assert_eq!(collection.error_message().unwrap(), "shader failed to parse");

        let err = collection
            .resolve_requests(&[ArtifactRequest {
                name: "payload",
                chunk_type_code: 0x1111,
                expected_version: VERSION_ANY,
                data_form: ArtifactDataForm::SharedBlob,
            }])
            .unwrap_err();
        assert!(err.to_string().contains("shader failed to parse"));
    }

    #[test]
    fn chunk_file_round_trip() {
        let chunks = sample_chunks();
        let mut bytes = Vec::new();
        write_chunk_file(&mut bytes, &chunks).unwrap();

        let mut file = BlobFile::new(Blob::from(bytes));
        let table = read_chunk_table(&mut file).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].name, "main");
        assert_eq!(table[1].version, 3);

        let depval = DependencyValidation::empty();
        let results = resolve_from_chunk_file(
            &mut file,
            "chunk-test",
            &depval,
            &[
                ArtifactRequest {
                    name: "extra",
                    chunk_type_code: 0x2222,
                    expected_version: 3,
                    data_form: ArtifactDataForm::SharedBlob,
                },
                ArtifactRequest {
                    name: "main",
                    chunk_type_code: 0x1111,
                    expected_version: VERSION_ANY,
                    data_form: ArtifactDataForm::Raw,
                },
            ],
            || -> ReopenFunction { Arc::new(|| Err(AssetError::msg("no reopen in test"))) },
            None,
        )
        .unwrap();
        assert_eq!(results[0].shared_blob.as_deref(), Some(b"world".as_slice()));
        assert_eq!(results[1].buffer.as_ref().unwrap().as_slice(), b"hello");
    }
}
