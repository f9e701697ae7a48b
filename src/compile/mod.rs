//! Compiler registry and dispatch.
//!
//! Backends register themselves with a display name, a short name (their
//! namespace in the intermediates store), a version, and a dependency
//! validation on the backend itself. Associations then declare which
//! target codes a backend produces and which initializer patterns it
//! accepts.
//!
//! [`CompilerRegistry::prepare`] fingerprints a request and returns its
//! [`CompileMarker`]: the same marker object for every concurrent requestor
//! of one fingerprint. The marker consults the store first and
//! only schedules a compile task when no valid cached products exist;
//! concurrent `get_artifact` calls on one marker share a single in-flight
//! task and its result.

use crate::{
    artifact::{
        Artifact, ArtifactCollection, ArtifactCollectionSet, BlobCollection, ExceptionCollection,
    },
    as_blob,
    depval::{DependencyValidation, DepValSystem},
    error::{AssetError, Result},
    pool::{Promise, SharedFuture, ThreadPool, WeakSharedFuture},
    store::{CompileProductsGroupId, IntermediatesStore, VersionDesc},
    utils, AssetServices, AssetState, CHUNK_TYPE_LOG,
};
use semver::Version;
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

mod operation;
pub use operation::{simple_compiler, CompileOperation, SimpleCompileOperation, TargetDesc};

/// One element of a compile request's initializer tuple.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Initializer {
    /// By convention the first initializer is a filename-like string used
    /// for pattern matching.
    Text(String),
    Integer(u64),
}

impl fmt::Display for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initializer::Text(text) => f.write_str(text),
            Initializer::Integer(value) => write!(f, "{value:#x}"),
        }
    }
}

/// The variant-typed argument list of a compile request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InitializerPack {
    values: Vec<Initializer>,
}

impl InitializerPack {
    pub fn new(values: Vec<Initializer>) -> Self {
        Self { values }
    }

    pub fn of_text(initializer: impl Into<String>) -> Self {
        Self { values: vec![Initializer::Text(initializer.into())] }
    }

    pub fn and_text(mut self, initializer: impl Into<String>) -> Self {
        self.values.push(Initializer::Text(initializer.into()));
        self
    }

    pub fn and_integer(mut self, initializer: u64) -> Self {
        self.values.push(Initializer::Integer(initializer));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn first_text(&self) -> Option<&str> {
        match self.values.first() {
            Some(Initializer::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Flattened human-readable name, also used to synthesize loose-files
    /// cache names.
    pub fn archivable_name(&self) -> String {
        let mut out = String::new();
        for (idx, value) in self.values.iter().enumerate() {
            if idx != 0 {
                out.push('-');
            }
            out.push_str(&value.to_string());
        }
        out
    }

    /// Stable hash of the tuple contents; combined with a target code this
    /// is the request fingerprint.
    pub fn archivable_hash(&self) -> u64 {
        let mut hash = utils::FNV_OFFSET_BASIS;
        for value in &self.values {
            hash = match value {
                Initializer::Text(text) => utils::fnv1a64(text.as_bytes(), hash),
                Initializer::Integer(value) => utils::fnv1a64(&value.to_le_bytes(), hash),
            };
            hash = utils::fnv1a64(&[0xff], hash);
        }
        hash
    }
}

/// String-keyed values a host can attach to a marker; handed to the
/// backend on the next compile.
pub type Conduit = BTreeMap<String, String>;

/// Identity a backend registers under.
#[derive(Clone, Debug)]
pub struct CompilerDesc {
    pub name: String,
    /// Store group key; keep it short and filesystem-safe.
    pub short_name: String,
    pub version: Version,
    pub build_date: String,
}

impl CompilerDesc {
    pub fn new(name: impl Into<String>, short_name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            short_name: short_name.into(),
            version,
            build_date: String::new(),
        }
    }

    pub fn with_build_date(mut self, build_date: impl Into<String>) -> Self {
        self.build_date = build_date.into();
        self
    }

    fn version_desc(&self) -> VersionDesc {
        VersionDesc::new(self.version.to_string(), self.build_date.clone())
    }
}

pub type CompileFn =
    dyn Fn(&InitializerPack) -> Result<Box<dyn CompileOperation>> + Send + Sync;
/// Variant receiving the marker's conduit alongside the initializers.
pub type CompileWithConduitFn =
    dyn Fn(&InitializerPack, &Conduit) -> Result<Box<dyn CompileOperation>> + Send + Sync;

/// How a backend's compile entry point is shaped.
#[derive(Clone)]
pub enum CompileDelegate {
    Simple(Arc<CompileFn>),
    WithConduit(Arc<CompileWithConduitFn>),
}

/// A backend's election of archive storage for one target.
#[derive(Clone, Debug, Default)]
pub struct ArchiveNameEntry {
    pub archive: String,
    pub entry_id: u64,
    pub descriptive_name: String,
}

/// Optional callback electing archive storage; returning `None` (or an
/// empty archive name) selects loose-files storage with a synthesized name.
pub type ArchiveNameFn =
    dyn Fn(u64, &InitializerPack) -> Option<ArchiveNameEntry> + Send + Sync;

/// Host-provided progress surface. `begin` is called as a compile starts;
/// the returned token is dropped when the compile resolves.
pub trait OperationContext: Send + Sync {
    fn begin(&self, description: &str) -> Box<dyn Any + Send>;
}

pub type CompilerId = u32;

struct RegisteredCompiler {
    name: String,
    delegate: CompileDelegate,
    archive_name_fn: Option<Arc<ArchiveNameFn>>,
    compiler_depval: DependencyValidation,
    store_group: Option<CompileProductsGroupId>,
    shutting_down: AtomicBool,
    active_operations: AtomicU32,
}

#[derive(Clone)]
struct RequestAssociation {
    compiler: CompilerId,
    target_codes: Vec<u64>,
    match_pattern: String,
}

impl RequestAssociation {
    fn matches(&self, target_code: u64, first_initializer: Option<&str>) -> bool {
        if !self.target_codes.contains(&target_code) {
            return false;
        }
        if self.match_pattern.is_empty() {
            return true;
        }
        let Some(first_initializer) = first_initializer else { return false };
        glob::Pattern::new(&self.match_pattern)
            .map(|pattern| pattern.matches(first_initializer))
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct RegistryState {
    compilers: Vec<(CompilerId, Arc<RegisteredCompiler>)>,
    associations: Vec<RequestAssociation>,
    extensions: Vec<(CompilerId, String)>,
    markers: HashMap<u64, Arc<CompileMarker>>,
    next_id: CompilerId,
}

/// Registers compiler backends and dispatches compile requests to them.
pub struct CompilerRegistry {
    state: Mutex<RegistryState>,
    pool: Arc<ThreadPool>,
    depval: Arc<DepValSystem>,
    store: Option<Arc<dyn IntermediatesStore>>,
}

impl CompilerRegistry {
    pub fn new(services: &AssetServices, store: Option<Arc<dyn IntermediatesStore>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            pool: services.pool().clone(),
            depval: services.depval().clone(),
            store,
        })
    }

    /// Registers a backend and returns a guard that deregisters it on drop.
    pub fn register(
        self: &Arc<Self>,
        desc: CompilerDesc,
        compiler_depval: DependencyValidation,
        delegate: CompileDelegate,
        archive_name_fn: Option<Arc<ArchiveNameFn>>,
    ) -> Result<CompilerRegistration> {
        let store_group = match &self.store {
            Some(store) => Some(store.register_compile_products_group(
                &desc.short_name,
                &desc.version_desc(),
                archive_name_fn.is_some(),
            )?),
            None => None,
        };
        let compiler = Arc::new(RegisteredCompiler {
            name: desc.name.clone(),
            delegate,
            archive_name_fn,
            compiler_depval,
            store_group,
            shutting_down: AtomicBool::new(false),
            active_operations: AtomicU32::new(0),
        });
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.compilers.push((id, compiler));
        debug!(name = %desc.name, id, "registered compiler");
        Ok(CompilerRegistration { registry: Arc::downgrade(self), id })
    }

    /// Removes the backend: cached markers for it are dropped, new compile
    /// requests fail fast, and the call blocks until in-flight operations
    /// complete.
    pub fn deregister_compiler(&self, id: CompilerId) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.extensions.retain(|(compiler, _)| *compiler != id);
            state.associations.retain(|a| a.compiler != id);
            state.markers.retain(|_, marker| marker.compiler_id != id);
            let position = state.compilers.iter().position(|(compiler, _)| *compiler == id);
            position.map(|idx| {
                let (_, compiler) = state.compilers.remove(idx);
                compiler.shutting_down.store(true, Ordering::Release);
                compiler
            })
        };
        let Some(compiler) = removed else { return };

        while compiler.active_operations.load(Ordering::Acquire) != 0 {
            if !self.pool.wait_idle(Duration::from_millis(100)) {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        if let (Some(store), Some(group)) = (&self.store, compiler.store_group) {
            store.deregister_compile_products_group(group);
        }
        debug!(id, "deregistered compiler");
    }

    /// Declares that `compiler` accepts requests for any of `target_codes`
    /// when the first initializer matches `match_pattern` (glob-style,
    /// case-sensitive; empty matches everything). A compiler may carry any
    /// number of associations.
    pub fn associate_request(
        &self,
        compiler: CompilerId,
        target_codes: &[u64],
        match_pattern: impl Into<String>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.associations.push(RequestAssociation {
            compiler,
            target_codes: target_codes.to_vec(),
            match_pattern: match_pattern.into(),
        });
    }

    /// Records file extensions for open-dialog UIs. Not consulted during
    /// dispatch.
    pub fn associate_extensions(&self, compiler: CompilerId, comma_separated_extensions: &str) {
        let mut state = self.state.lock().unwrap();
        for token in comma_separated_extensions.split(',') {
            let token = token.trim();
            let token = token.strip_prefix('.').unwrap_or(token);
            if !token.is_empty() {
                state.extensions.push((compiler, token.to_string()));
            }
        }
    }

    pub fn get_extensions_for_target_code(&self, target_code: u64) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (id, compiler) in &state.compilers {
            let accepts = state
                .associations
                .iter()
                .any(|a| a.compiler == *id && a.target_codes.contains(&target_code));
            if !accepts {
                continue;
            }
            for (ext_compiler, extension) in &state.extensions {
                if ext_compiler == id {
                    out.push((extension.clone(), compiler.name.clone()));
                }
            }
        }
        out
    }

    pub fn get_target_codes_for_extension(&self, extension: &str) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (compiler, registered) in &state.extensions {
            // extensions compare case-insensitively, by convention
            if !registered.eq_ignore_ascii_case(extension) {
                continue;
            }
            for association in state.associations.iter().filter(|a| a.compiler == *compiler) {
                for &target_code in &association.target_codes {
                    if !out.contains(&target_code) {
                        out.push(target_code);
                    }
                }
            }
        }
        out
    }

    pub fn has_associated_compiler(&self, target_code: u64, first_initializer: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.associations.iter().any(|a| a.matches(target_code, Some(first_initializer)))
    }

    /// Matches the request to a compiler and returns its marker. Two
    /// prepares with identical fingerprint return the same marker object.
    pub fn prepare(
        &self,
        target_code: u64,
        initializers: InitializerPack,
    ) -> Result<Arc<CompileMarker>> {
        if initializers.is_empty() {
            return Err(AssetError::MissingBackend { target_code, initializer: String::new() });
        }
        let initializer_hash = initializers.archivable_hash();
        let fingerprint = utils::hash_combine(initializer_hash, target_code);

        let mut state = self.state.lock().unwrap();
        if let Some(marker) = state.markers.get(&fingerprint) {
            return Ok(marker.clone());
        }

        let first = initializers.first_text().map(str::to_string);
        let association = state
            .associations
            .iter()
            .find(|a| a.matches(target_code, first.as_deref()))
            .cloned()
            .ok_or_else(|| AssetError::MissingBackend {
                target_code,
                initializer: first.clone().unwrap_or_default(),
            })?;
        let compiler = state
            .compilers
            .iter()
            .find(|(id, _)| *id == association.compiler)
            .map(|(_, compiler)| compiler.clone())
            .ok_or_else(|| AssetError::MissingBackend {
                target_code,
                initializer: first.unwrap_or_default(),
            })?;

        let marker = Arc::new(CompileMarker {
            compiler: Arc::downgrade(&compiler),
            compiler_id: association.compiler,
            initializers,
            store: self.store.clone(),
            pool: self.pool.clone(),
            depval: self.depval.clone(),
            conduit: Mutex::new(Conduit::new()),
            active_future: Mutex::new(WeakSharedFuture::new()),
        });
        // cache under every sibling target code so requests for the other
        // products of this compile share the marker
        for &sibling in &association.target_codes {
            state
                .markers
                .insert(utils::hash_combine(initializer_hash, sibling), marker.clone());
        }
        trace!(
            fingerprint,
            compiler = association.compiler,
            "prepared compile marker for {}",
            marker.initializers.archivable_name()
        );
        Ok(marker)
    }

    /// Drops all cached markers; in-flight compiles are unaffected.
    pub fn flush_cached_markers(&self) {
        self.state.lock().unwrap().markers.clear();
    }
}

/// RAII registration: deregisters the compiler (waiting on its in-flight
/// operations) when dropped.
pub struct CompilerRegistration {
    registry: Weak<CompilerRegistry>,
    id: CompilerId,
}

impl CompilerRegistration {
    pub fn id(&self) -> CompilerId {
        self.id
    }
}

impl Drop for CompilerRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister_compiler(self.id);
        }
    }
}

/// The result of [`CompileMarker::get_artifact`]: either a collection that
/// already existed in the store, or a view on the (possibly shared)
/// in-flight compile.
pub enum ArtifactOutcome {
    Existing(Arc<ArtifactCollection>),
    Pending(ArtifactFuture),
}

impl std::fmt::Debug for ArtifactOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactOutcome::Existing(_) => f.debug_tuple("Existing").finish(),
            ArtifactOutcome::Pending(_) => f.debug_tuple("Pending").finish(),
        }
    }
}

impl ArtifactOutcome {
    pub fn wait(self) -> Result<Arc<ArtifactCollection>> {
        match self {
            ArtifactOutcome::Existing(collection) => Ok(collection),
            ArtifactOutcome::Pending(future) => future.wait(),
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, ArtifactOutcome::Existing(_))
    }
}

/// A view on a shared compile future, narrowed to one target code.
#[derive(Clone)]
pub struct ArtifactFuture {
    future: SharedFuture<ArtifactCollectionSet>,
    target_code: u64,
}

impl ArtifactFuture {
    pub fn wait(&self) -> Result<Arc<ArtifactCollection>> {
        let set = self.future.wait().map_err(AssetError::Shared)?;
        Self::select(&set, self.target_code)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Arc<ArtifactCollection>>> {
        let outcome = self.future.wait_timeout(timeout)?;
        Some(
            outcome
                .map_err(AssetError::Shared)
                .and_then(|set| Self::select(&set, self.target_code)),
        )
    }

    pub fn try_get(&self) -> Option<Result<Arc<ArtifactCollection>>> {
        let outcome = self.future.try_get()?;
        Some(
            outcome
                .map_err(AssetError::Shared)
                .and_then(|set| Self::select(&set, self.target_code)),
        )
    }

    /// The underlying future over every target of the compile.
    pub fn share(&self) -> SharedFuture<ArtifactCollectionSet> {
        self.future.clone()
    }

    fn select(set: &ArtifactCollectionSet, target_code: u64) -> Result<Arc<ArtifactCollection>> {
        set.iter()
            .find(|(code, _)| *code == target_code)
            .map(|(_, collection)| collection.clone())
            .ok_or_else(|| {
                AssetError::msg(format!(
                    "the compile completed but produced no collection for target code {target_code:#x}"
                ))
            })
    }
}

/// Dispatcher-cached handle for one fingerprinted request: "there is (or
/// will be) an artifact collection for this".
pub struct CompileMarker {
    compiler: Weak<RegisteredCompiler>,
    compiler_id: CompilerId,
    initializers: InitializerPack,
    store: Option<Arc<dyn IntermediatesStore>>,
    pool: Arc<ThreadPool>,
    depval: Arc<DepValSystem>,
    conduit: Mutex<Conduit>,
    active_future: Mutex<WeakSharedFuture<ArtifactCollectionSet>>,
}

impl std::fmt::Debug for CompileMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileMarker")
            .field("compiler_id", &self.compiler_id)
            .finish_non_exhaustive()
    }
}

impl CompileMarker {
    /// Returns the cached collection when the store has a valid one, and
    /// otherwise begins (or joins) the compile.
    pub fn get_artifact(
        &self,
        target_code: u64,
        op_context: Option<&dyn OperationContext>,
    ) -> Result<ArtifactOutcome> {
        let compiler = self.compiler.upgrade().ok_or(AssetError::CompilerShutdown)?;

        // everything under the marker lock: concurrent requestors of the
        // same fingerprint must observe one shared future
        let mut active = self.active_future.lock().unwrap();
        if let Some(future) = active.upgrade() {
            return Ok(ArtifactOutcome::Pending(ArtifactFuture { future, target_code }));
        }

        if let Some(store) = &self.store {
            let group = compiler.store_group.expect("stores always register groups");
            let existing = match archive_entry_for(&compiler, target_code, &self.initializers) {
                Some(entry) => store.retrieve_compile_products_from_archive(
                    &entry.archive,
                    entry.entry_id,
                    group,
                )?,
                None => store.retrieve_compile_products(
                    &format!("{}-{target_code:x}", self.initializers.archivable_name()),
                    group,
                )?,
            };
            if let Some(collection) = existing {
                trace!(
                    target_code,
                    "store satisfied request for {}",
                    self.initializers.archivable_name()
                );
                return Ok(ArtifactOutcome::Existing(collection));
            }
            if !store.allow_store() {
                return Err(AssetError::msg(
                    "no valid cached copy exists and the intermediate store does not allow compilation",
                ));
            }
        }

        let future = self.invoke_compile_locked(&compiler, op_context);
        *active = future.downgrade();
        Ok(ArtifactOutcome::Pending(ArtifactFuture { future, target_code }))
    }

    /// Unconditionally begins (or joins) a compile, bypassing the store
    /// lookup.
    pub fn invoke_compile(
        &self,
        target_code: u64,
        op_context: Option<&dyn OperationContext>,
    ) -> Result<ArtifactFuture> {
        let compiler = self.compiler.upgrade().ok_or(AssetError::CompilerShutdown)?;
        let mut active = self.active_future.lock().unwrap();
        if let Some(future) = active.upgrade() {
            return Ok(ArtifactFuture { future, target_code });
        }
        let future = self.invoke_compile_locked(&compiler, op_context);
        *active = future.downgrade();
        Ok(ArtifactFuture { future, target_code })
    }

    /// Attaches key/value state handed to the backend on the next compile.
    pub fn attach_conduit(&self, conduit: Conduit) {
        *self.conduit.lock().unwrap() = conduit;
    }

    pub fn compiler_description(&self) -> String {
        self.compiler.upgrade().map(|c| c.name.clone()).unwrap_or_default()
    }

    pub fn initializers(&self) -> &InitializerPack {
        &self.initializers
    }

    fn invoke_compile_locked(
        &self,
        compiler: &Arc<RegisteredCompiler>,
        op_context: Option<&dyn OperationContext>,
    ) -> SharedFuture<ArtifactCollectionSet> {
        let (promise, future) = Promise::new();

        let op_scope = op_context.map(|ctx| {
            ctx.begin(&format!(
                "Compiling ({}) with compiler ({})",
                self.initializers.archivable_name(),
                compiler.name
            ))
        });
        let conduit = std::mem::take(&mut *self.conduit.lock().unwrap());

        // the marker can be reused after this compile resolves, so the task
        // captures a copy of the initializers rather than borrowing
        let weak_compiler = Weak::clone(&self.compiler);
        let initializers = self.initializers.clone();
        let store = self.store.clone();
        let depval = self.depval.clone();
        self.pool.enqueue(move || {
            let _op_scope = op_scope;
            let Some(compiler) = weak_compiler.upgrade() else {
                promise.set_error(AssetError::CompilerShutdown);
                return;
            };
            compiler.active_operations.fetch_add(1, Ordering::AcqRel);
            if compiler.shutting_down.load(Ordering::Acquire) {
                promise.set_error(AssetError::CompilerShutdown);
            } else {
                match perform_compile(&compiler, &initializers, conduit, &depval, store.as_deref())
                {
                    Ok(collections) => promise.set_value(collections),
                    Err(err) => promise.set_error(err),
                }
            }
            compiler.active_operations.fetch_sub(1, Ordering::AcqRel);
        });

        future
    }
}

fn archive_entry_for(
    compiler: &RegisteredCompiler,
    target_code: u64,
    initializers: &InitializerPack,
) -> Option<ArchiveNameEntry> {
    let entry = compiler.archive_name_fn.as_ref()?(target_code, initializers)?;
    (!entry.archive.is_empty()).then_some(entry)
}

/// Runs a panicky backend callback, converting a panic into an error so it
/// surfaces as a log artifact like any other compiler failure.
fn catch_backend<R>(operation: impl FnOnce() -> Result<R>) -> Result<R> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic in compiler backend".to_string());
            Err(AssetError::msg(format!("compiler backend panicked: {message}")))
        }
    }
}

/// The compile task body, off the requestor's thread.
fn perform_compile(
    compiler: &RegisteredCompiler,
    initializers: &InitializerPack,
    conduit: Conduit,
    depval_system: &Arc<DepValSystem>,
    store: Option<&dyn IntermediatesStore>,
) -> Result<ArtifactCollectionSet> {
    debug_assert!(!initializers.is_empty());
    let archivable_name = initializers.archivable_name();

    let mut operation = catch_backend(|| match &compiler.delegate {
        CompileDelegate::Simple(compile) => compile(initializers),
        CompileDelegate::WithConduit(compile) => compile(initializers, &conduit),
    })
    .map_err(|err| {
        AssetError::construction(
            crate::ConstructionKind::Unknown,
            format!("compiler \"{}\" failed on {archivable_name}: {err}", compiler.name),
            Some(compiler.compiler_depval.clone()),
        )
    })?;

    let targets = operation.targets();
    let mut collections = ArtifactCollectionSet::with_capacity(targets.len());

    for (idx, target) in targets.iter().enumerate() {
        let mut target_depvals = vec![compiler.compiler_depval.clone()];
        if let Some(depval) = operation.dependency_validation() {
            target_depvals.push(depval);
        }

        // a failed target is localized: it becomes a log-only invalid
        // collection while sibling targets proceed
        let (artifacts, state) = match catch_backend(|| operation.serialize_target(idx)) {
            Ok(serialized) => {
                if let Some(depval) = serialized.depval {
                    target_depvals.push(depval);
                }
                let log_only = serialized.artifacts.is_empty()
                    || (serialized.artifacts.len() == 1
                        && serialized.artifacts[0].chunk_type_code == CHUNK_TYPE_LOG);
                let state = if log_only { AssetState::Invalid } else { AssetState::Ready };
                (serialized.artifacts, state)
            }
            Err(err) => {
                if let Some(depval) = err.dependency_validation() {
                    target_depvals.push(depval.clone());
                }
                warn!(
                    "compiler \"{}\" failed serializing target \"{}\" of {archivable_name}: {err}",
                    compiler.name, target.name
                );
                let log =
                    Artifact::new(CHUNK_TYPE_LOG, 0, "compiler-exception", as_blob(err.to_string()));
                (vec![log], AssetState::Invalid)
            }
        };

        let depval_refs: Vec<&DependencyValidation> = target_depvals.iter().collect();
        let combined_depval = depval_system.make_or_reuse(&depval_refs);

        let mut collection: Option<Arc<ArtifactCollection>> = None;
        if let Some(store) = store {
            let group = compiler.store_group.expect("stores always register groups");
            match archive_entry_for(compiler, target.target_code, initializers) {
                Some(entry) => {
                    store.store_compile_products_in_archive(
                        &entry.archive,
                        entry.entry_id,
                        &entry.descriptive_name,
                        group,
                        &artifacts,
                        state,
                        &target_depvals,
                    )?;
                }
                None => {
                    // several targets may share a code; disambiguate the
                    // synthesized file names with the target name
                    let share_code =
                        targets.iter().filter(|t| t.target_code == target.target_code).count();
                    let name = if share_code == 1 {
                        format!("{archivable_name}-{:x}", target.target_code)
                    } else {
                        format!("{archivable_name}-{}-{:x}", target.name, target.target_code)
                    };
                    collection = Some(store.store_compile_products(
                        &name,
                        group,
                        &artifacts,
                        state,
                        &target_depvals,
                    )?);
                }
            }
        }

        let collection = collection.unwrap_or_else(|| {
            let log_only =
                artifacts.len() == 1 && artifacts[0].chunk_type_code == CHUNK_TYPE_LOG;
            if state == AssetState::Invalid && log_only {
                Arc::new(ArtifactCollection::CompilerException(ExceptionCollection::new(
                    artifacts[0].data.clone(),
                    combined_depval.clone(),
                )))
            } else {
                Arc::new(ArtifactCollection::Blobs(BlobCollection::new(
                    artifacts,
                    state,
                    combined_depval.clone(),
                    archivable_name.clone(),
                )))
            }
        });
        collections.push((target.target_code, collection));
    }

    Ok(collections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializer_pack_hash_and_name() {
        let pack = InitializerPack::of_text("shaders/basic.hlsl:main").and_integer(5);
        assert_eq!(pack.archivable_name(), "shaders/basic.hlsl:main-0x5");
        assert_eq!(pack.first_text(), Some("shaders/basic.hlsl:main"));

        let same = InitializerPack::of_text("shaders/basic.hlsl:main").and_integer(5);
        assert_eq!(pack.archivable_hash(), same.archivable_hash());
        let different = InitializerPack::of_text("shaders/basic.hlsl:other").and_integer(5);
        assert_ne!(pack.archivable_hash(), different.archivable_hash());
    }

    #[test]
    fn association_pattern_matching() {
        let association = RequestAssociation {
            compiler: 1,
            target_codes: vec![0x10, 0x20],
            match_pattern: "*.hlsl*".to_string(),
        };
        assert!(association.matches(0x10, Some("shaders/a.hlsl")));
        assert!(association.matches(0x20, Some("a.hlsl:vs_main")));
        assert!(!association.matches(0x30, Some("shaders/a.hlsl")));
        assert!(!association.matches(0x10, Some("model.fbx")));
        assert!(!association.matches(0x10, None));

        let match_all = RequestAssociation {
            compiler: 1,
            target_codes: vec![0x10],
            match_pattern: String::new(),
        };
        assert!(match_all.matches(0x10, Some("anything")));
    }

    #[test]
    fn extension_parsing() {
        let services = AssetServices::with_pool_size(1);
        let registry = CompilerRegistry::new(&services, None);
        let registration = registry
            .register(
                CompilerDesc::new("Test", "test", Version::new(1, 0, 0)),
                DependencyValidation::empty(),
                CompileDelegate::Simple(simple_compiler(0x10, |_| Ok((Vec::new(), None)))),
                None,
            )
            .unwrap();
        registry.associate_request(registration.id(), &[0x10], "*");
        registry.associate_extensions(registration.id(), " .hlsl, fx ,, .HLSLi ");

        assert_eq!(registry.get_target_codes_for_extension("hlsl"), vec![0x10]);
        assert_eq!(registry.get_target_codes_for_extension("FX"), vec![0x10]);
        assert!(registry.get_target_codes_for_extension("png").is_empty());

        let extensions = registry.get_extensions_for_target_code(0x10);
        assert_eq!(extensions.len(), 3);
        assert!(extensions.iter().all(|(_, name)| name == "Test"));
    }

    #[test]
    fn prepare_without_association_fails() {
        let services = AssetServices::with_pool_size(1);
        let registry = CompilerRegistry::new(&services, None);
        let err = registry.prepare(0x99, InitializerPack::of_text("nothing.xyz")).unwrap_err();
        assert!(matches!(err, AssetError::MissingBackend { .. }));

        // a zero-initializer request cannot be dispatched at all
        let err = registry.prepare(0x99, InitializerPack::default()).unwrap_err();
        assert!(matches!(err, AssetError::MissingBackend { .. }));
    }
}
