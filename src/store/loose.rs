//! Loose-files compile products cache.
//!
//! Each compile's artifacts are written as individual files beside a text
//! manifest describing them: metrics and log chunks go to `.metrics`/`.log`
//! sidecars, a single remaining artifact becomes a file of its own, and
//! several remaining artifacts are packed into one `.chunk` container.
//!
//! The write protocol keeps readers consistent without locks: every output
//! is first written to `<name>.s` and then renamed into place, and the
//! manifest is renamed last. A reader that observes the manifest therefore
//! sees either the previous complete product set or the new one, never a
//! partial write.

use super::{try_register_dependency, ReadRef};
use crate::{
    artifact::{
        self, Artifact, ArtifactDataForm, ArtifactRequest, ArtifactRequestResult, ReopenFunction,
    },
    depval::{DependencyValidation, DependentFileState, DepValSystem},
    error::{retry_exclusive, AssetError, Result},
    utils,
    vfs::{open_file, FileState, FileSnapshot, FileSystem, OpenMode, ShareMode},
    AssetState, Blob, CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS, CHUNK_TYPE_MULTI_CHUNK,
};
use std::{
    io::Write as _,
    path::PathBuf,
    sync::Arc,
};

/// Conservative OS path limit; names are shortened below this, minus the
/// margin reserved for sidecar suffixes.
const OS_PATH_LIMIT: usize = 260;

/// One product recorded in a manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Product {
    pub chunk_type_code: u64,
    pub filename: String,
}

/// Parsed form of a products manifest.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct CompileProductsFile {
    pub base_path: String,
    pub state: AssetState,
    pub products: Vec<Product>,
    pub dependencies: Vec<DependentFileState>,
}

// -- manifest text format ---------------------------------------------------

const DEPENDENCY_MISSING: &str = "doesnotexist";
const DEPENDENCY_SHADOWED: &str = "shadowed";

pub(crate) fn write_manifest(products: &CompileProductsFile) -> String {
    let mut out = String::new();
    if !products.base_path.is_empty() {
        out.push_str(&format!("BasePath = {}\n", products.base_path));
    }
    out.push_str(&format!(
        "Invalid = {}\n",
        if products.state == AssetState::Ready { '0' } else { '1' }
    ));
    for product in &products.products {
        out.push_str(&format!("{} = ~\n", product.chunk_type_code));
        out.push_str(&format!("    Artifact = {}\n", product.filename));
    }
    out.push_str("Dependencies = ~\n");
    for dependency in &products.dependencies {
        let value = match dependency.snapshot.state {
            FileState::Missing => DEPENDENCY_MISSING.to_string(),
            FileState::Pending => DEPENDENCY_SHADOWED.to_string(),
            FileState::Present => dependency.snapshot.modification_time.to_string(),
        };
        out.push_str(&format!("    {} = {}\n", dependency.filename, value));
    }
    out
}

pub(crate) fn parse_manifest(text: &str) -> Result<CompileProductsFile> {
    enum Element {
        None,
        Product(u64),
        Dependencies,
    }

    let bad = |line: &str| {
        AssetError::construction(
            crate::ConstructionKind::FormatError,
            format!("malformed products manifest line: \"{line}\""),
            None,
        )
    };

    let mut result = CompileProductsFile::default();
    let mut element = Element::None;
    for raw_line in text.lines() {
        if raw_line.trim().is_empty() {
            continue;
        }
        let nested = raw_line.starts_with(' ') || raw_line.starts_with('\t');
        let line = raw_line.trim_start();
        let (key, value) = line.split_once(" = ").ok_or_else(|| bad(line))?;

        if nested {
            match element {
                Element::Product(chunk_type_code) if key == "Artifact" => {
                    result
                        .products
                        .push(Product { chunk_type_code, filename: value.to_string() });
                }
                Element::Dependencies => {
                    let snapshot = match value {
                        DEPENDENCY_MISSING => FileSnapshot::missing(),
                        DEPENDENCY_SHADOWED => {
                            FileSnapshot { state: FileState::Pending, modification_time: 0 }
                        }
                        modtime => FileSnapshot::present(
                            modtime.parse().map_err(|_| bad(line))?,
                        ),
                    };
                    result.dependencies.push(DependentFileState::new(key, snapshot));
                }
                _ => return Err(bad(line)),
            }
            continue;
        }

        match key {
            "BasePath" => {
                result.base_path = value.to_string();
                element = Element::None;
            }
            "Invalid" => {
                if value.trim() == "1" {
                    result.state = AssetState::Invalid;
                }
                element = Element::None;
            }
            "Dependencies" => element = Element::Dependencies,
            type_code => {
                let chunk_type_code = type_code.parse().map_err(|_| bad(line))?;
                element = Element::Product(chunk_type_code);
            }
        }
    }
    Ok(result)
}

// -- storage ----------------------------------------------------------------

/// Writes and reads loose compile products through a filesystem backend.
///
/// Writing additionally needs the OS root of that backend for the staging
/// renames; storage constructed without one (e.g. over a packed archive) is
/// read-only.
pub struct LooseFilesStorage {
    filesystem: Arc<dyn FileSystem>,
    base_directory: String,
    os_root: Option<PathBuf>,
    depval: Arc<DepValSystem>,
}

impl LooseFilesStorage {
    pub fn new(
        filesystem: Arc<dyn FileSystem>,
        base_directory: String,
        os_root: Option<PathBuf>,
        depval: Arc<DepValSystem>,
    ) -> Self {
        Self { filesystem, base_directory, os_root, depval }
    }

    /// Maps an archivable name onto the products-file path, sanitized and
    /// shortened to stay under the OS limit with room for sidecar suffixes.
    fn make_products_file_name(&self, archivable_name: &str) -> String {
        let mut name = String::with_capacity(self.base_directory.len() + archivable_name.len() + 1);
        if !self.base_directory.is_empty() {
            name.push_str(&self.base_directory);
            name.push('/');
        }
        for c in archivable_name.chars() {
            name.push(if c == ':' || c == '*' { '-' } else { c });
        }
        utils::shorten_with_hash(&name, OS_PATH_LIMIT - utils::PATH_LIMIT_MARGIN)
    }

    fn write_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        let mut file = open_file(&*self.filesystem, name, OpenMode::Write, ShareMode::None)?;
        file.write_all(contents).map_err(|e| AssetError::io(e, name))?;
        file.flush().map_err(|e| AssetError::io(e, name))?;
        Ok(())
    }

    /// Writes every artifact plus the manifest, staging-then-rename, and
    /// returns the manifest that was committed.
    pub(crate) fn store_compile_products(
        &self,
        archivable_name: &str,
        artifacts: &[Artifact],
        state: AssetState,
        dependencies: &[DependentFileState],
    ) -> Result<CompileProductsFile> {
        let Some(os_root) = &self.os_root else {
            return Err(AssetError::msg("loose files storage over this filesystem is read-only"));
        };

        let mut products_file = CompileProductsFile {
            state,
            ..Default::default()
        };
        for dependency in dependencies {
            let simplified = utils::split_path(&dependency.filename)
                .simplify()
                .rebuild(utils::FilenameRules::default());
            products_file
                .dependencies
                .push(DependentFileState::new(simplified, dependency.snapshot));
        }

        let products_name = self.make_products_file_name(archivable_name);
        let mut rename_ops: Vec<(String, String)> = Vec::new();

        // one chunk file carries most artifacts, but metrics and logs become
        // separate sidecar files so they stay greppable on disk
        let mut chunks_in_main_file: Vec<&Artifact> = Vec::new();
        for artifact in artifacts {
            let sidecar_extension = match artifact.chunk_type_code {
                code if code == CHUNK_TYPE_METRICS => Some("metrics"),
                code if code == CHUNK_TYPE_LOG => Some("log"),
                _ => None,
            };
            match sidecar_extension {
                Some(extension) => {
                    let sidecar_name = if artifact.name.is_empty() {
                        format!("{products_name}.{extension}")
                    } else {
                        format!(
                            "{products_name}-{}.{extension}",
                            utils::make_safe_name(&artifact.name, 9)
                        )
                    };
                    self.write_file(&format!("{sidecar_name}.s"), &artifact.data)?;
                    products_file.products.push(Product {
                        chunk_type_code: artifact.chunk_type_code,
                        filename: sidecar_name.clone(),
                    });
                    rename_ops.push((format!("{sidecar_name}.s"), sidecar_name));
                }
                None => chunks_in_main_file.push(artifact),
            }
        }

        if let [artifact] = chunks_in_main_file[..] {
            let main_name =
                format!("{products_name}-{}", utils::make_safe_name(&artifact.name, 9));
            self.write_file(&format!("{main_name}.s"), &artifact.data)?;
            products_file.products.push(Product {
                chunk_type_code: artifact.chunk_type_code,
                filename: main_name.clone(),
            });
            rename_ops.push((format!("{main_name}.s"), main_name));
        } else if !chunks_in_main_file.is_empty() {
            let main_name = format!("{products_name}.chunk");
            let mut contents = Vec::new();
            let owned: Vec<Artifact> = chunks_in_main_file.iter().map(|a| (*a).clone()).collect();
            artifact::write_chunk_file(&mut contents, &owned)?;
            self.write_file(&format!("{main_name}.s"), &contents)?;
            products_file.products.push(Product {
                chunk_type_code: CHUNK_TYPE_MULTI_CHUNK,
                filename: main_name.clone(),
            });
            rename_ops.push((format!("{main_name}.s"), main_name));
        }

        // manifest last, so its appearance publishes a complete product set
        self.write_file(
            &format!("{products_name}.s"),
            write_manifest(&products_file).as_bytes(),
        )?;
        rename_ops.push((format!("{products_name}.s"), products_name.clone()));

        if cfg!(debug_assertions) {
            for (idx, op) in rename_ops.iter().enumerate() {
                for earlier in &rename_ops[..idx] {
                    debug_assert!(
                        op.0 != earlier.0 && op.1 != earlier.1,
                        "duplicated rename target in loose files cache: {}",
                        op.1
                    );
                }
            }
        }

        for (from, to) in rename_ops {
            let from = os_root.join(from);
            let to = os_root.join(&to);
            let _ = std::fs::remove_file(&to);
            std::fs::rename(&from, &to).map_err(|e| AssetError::io(e, &to))?;
        }

        trace!(name = %products_name, products = products_file.products.len(), "stored compile products");
        Ok(products_file)
    }

    /// Reads and parses the manifest, or `None` when absent. A manifest
    /// held under an exclusive lock by a writer is retried briefly.
    pub(crate) fn retrieve_products_file(
        &self,
        archivable_name: &str,
    ) -> Result<Option<CompileProductsFile>> {
        let products_name = self.make_products_file_name(archivable_name);
        let contents = retry_exclusive(|| {
            match open_file(&*self.filesystem, &products_name, OpenMode::Read, ShareMode::Read) {
                Ok(mut file) => crate::vfs::read_entire_file(file.as_mut())
                    .map(Some)
                    .map_err(|e| AssetError::io(e, &products_name)),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            }
        });
        let contents = match contents {
            Ok(Some(contents)) => contents,
            Ok(None) => return Ok(None),
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        match parse_manifest(&String::from_utf8_lossy(&contents)) {
            Ok(products) => Ok(Some(products)),
            Err(err) => {
                // a corrupt manifest behaves like a cache miss
                warn!(name = %products_name, "discarding unreadable products manifest: {err}");
                Ok(None)
            }
        }
    }

    /// Builds the artifact collection for a parsed manifest, registering
    /// its recorded dependencies. With `enforce_dependencies`, a stale
    /// recording yields `None` (the caller treats it as a cache miss).
    pub(crate) fn make_collection(
        &self,
        products: CompileProductsFile,
        read_ref: ReadRef,
        enforce_dependencies: bool,
    ) -> Result<Option<Arc<crate::artifact::ArtifactCollection>>> {
        let depval = self.depval.make();
        let mut still_valid = true;
        for dependency in &products.dependencies {
            let adjusted = if products.base_path.is_empty() {
                dependency.clone()
            } else {
                DependentFileState::new(
                    format!("{}/{}", products.base_path, dependency.filename),
                    dependency.snapshot,
                )
            };
            still_valid &= try_register_dependency(&depval, &self.depval, &adjusted);
        }
        if enforce_dependencies && !still_valid {
            return Ok(None);
        }
        Ok(Some(Arc::new(crate::artifact::ArtifactCollection::StoreProducts(
            CompileProductsCollection {
                products,
                filesystem: self.filesystem.clone(),
                depval,
                _read_ref: read_ref,
            },
        ))))
    }
}

/// Artifact collection reading loose products back through their manifest.
///
/// Holds a store read-reference for its lifetime, which keeps writers away
/// from the files it may still read.
pub struct CompileProductsCollection {
    products: CompileProductsFile,
    filesystem: Arc<dyn FileSystem>,
    depval: DependencyValidation,
    _read_ref: ReadRef,
}

impl CompileProductsCollection {
    pub(crate) fn dependency_validation(&self) -> DependencyValidation {
        self.depval.clone()
    }

    pub(crate) fn asset_state(&self) -> AssetState {
        self.products.state
    }

    fn load_blob(&self, filename: &str) -> Result<Blob> {
        let mut file = open_file(&*self.filesystem, filename, OpenMode::Read, ShareMode::Read)?;
        let contents = crate::vfs::read_entire_file(file.as_mut())
            .map_err(|e| AssetError::io(e, filename))?;
        Ok(Blob::from(contents))
    }

    fn reopen_fn(&self, filename: &str) -> ReopenFunction {
        let filesystem = self.filesystem.clone();
        let filename = filename.to_string();
        Arc::new(move || open_file(&*filesystem, &filename, OpenMode::Read, ShareMode::Read))
    }

    pub(crate) fn resolve_requests(
        &self,
        requests: &[ArtifactRequest],
    ) -> Result<Vec<ArtifactRequestResult>> {
        let mut results: Vec<Option<ArtifactRequestResult>> = Vec::new();
        results.resize_with(requests.len(), || None);
        let mut leftover: Vec<(usize, ArtifactRequest)> = Vec::new();

        // first pass: exact matches in the products list (this is how log
        // and metrics sidecars are retrieved)
        for (idx, request) in requests.iter().enumerate() {
            let product = self
                .products
                .products
                .iter()
                .find(|p| p.chunk_type_code == request.chunk_type_code);
            let Some(product) = product else {
                leftover.push((idx, *request));
                continue;
            };
            results[idx] = Some(match request.data_form {
                ArtifactDataForm::SharedBlob => {
                    ArtifactRequestResult::from_blob(self.load_blob(&product.filename)?)
                }
                ArtifactDataForm::Raw | ArtifactDataForm::TypedBlock => {
                    ArtifactRequestResult::from_bytes(&self.load_blob(&product.filename)?)
                }
                ArtifactDataForm::ReopenFunction => {
                    ArtifactRequestResult::from_reopen(self.reopen_fn(&product.filename))
                }
                ArtifactDataForm::Filename => {
                    ArtifactRequestResult::from_filename(&product.filename)
                }
            });
        }

        // second pass: whatever remains must come out of the multi-chunk
        // container
        if !leftover.is_empty() {
            let multi = self
                .products
                .products
                .iter()
                .find(|p| p.chunk_type_code == CHUNK_TYPE_MULTI_CHUNK)
                .ok_or_else(|| {
                    artifact::missing_chunk_error("loose compile products", &leftover[0].1, &self.depval)
                })?;
            let mut file =
                open_file(&*self.filesystem, &multi.filename, OpenMode::Read, ShareMode::Read)?;
            let leftover_requests: Vec<ArtifactRequest> =
                leftover.iter().map(|&(_, request)| request).collect();
            let resolved = artifact::resolve_from_chunk_file(
                file.as_mut(),
                &multi.filename,
                &self.depval,
                &leftover_requests,
                || self.reopen_fn(&multi.filename),
                Some(&multi.filename),
            )?;
            for ((idx, _), result) in leftover.into_iter().zip(resolved) {
                results[idx] = Some(result);
            }
        }

        Ok(results.into_iter().map(|r| r.expect("all requests resolved or errored")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_products() -> CompileProductsFile {
        CompileProductsFile {
            base_path: String::new(),
            state: AssetState::Invalid,
            products: vec![
                Product { chunk_type_code: 4369, filename: "group/asset-main".into() },
                Product { chunk_type_code: CHUNK_TYPE_LOG, filename: "group/asset.log".into() },
            ],
            dependencies: vec![
                DependentFileState::new("src/x.txt", FileSnapshot::present(1000)),
                DependentFileState::new("src/gone.txt", FileSnapshot::missing()),
                DependentFileState::new(
                    "src/shadow.txt",
                    FileSnapshot { state: FileState::Pending, modification_time: 0 },
                ),
            ],
        }
    }

    #[test]
    fn manifest_round_trip() {
        let products = sample_products();
        let text = write_manifest(&products);
        let parsed = parse_manifest(&text).unwrap();
        assert_eq!(parsed, products);
    }

    #[test]
    fn manifest_text_shape() {
        let text = write_manifest(&sample_products());
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Invalid = 1"));
        assert_eq!(lines.next(), Some("4369 = ~"));
        assert_eq!(lines.next(), Some("    Artifact = group/asset-main"));
        assert!(text.contains("    src/gone.txt = doesnotexist"));
        assert!(text.contains("    src/shadow.txt = shadowed"));
        assert!(text.contains("    src/x.txt = 1000"));
    }

    #[test]
    fn manifest_rejects_garbage() {
        assert!(parse_manifest("what even is this").is_err());
        assert!(parse_manifest("NotANumber = ~\n    Artifact = x\n").is_err());
    }
}
