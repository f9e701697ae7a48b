//! The compile-operation interface backends implement.

use super::InitializerPack;
use crate::{
    artifact::{Artifact, SerializedTarget},
    depval::DependencyValidation,
    error::Result,
};
use std::sync::Arc;

/// One product a compile operation can yield, identified by target code.
/// A single invocation may produce several (e.g. skeleton and animation
/// from one model file).
#[derive(Clone, Debug)]
pub struct TargetDesc {
    pub target_code: u64,
    pub name: String,
}

/// An in-progress compile returned by a backend: an opaque iterator over
/// targets, serialized one at a time.
pub trait CompileOperation: Send {
    fn targets(&self) -> Vec<TargetDesc>;

    /// Produces the artifact set for one target. Failures here are
    /// localized: other targets of the same operation may still succeed.
    fn serialize_target(&mut self, idx: usize) -> Result<SerializedTarget>;

    /// Dependencies the backend discovered while preparing the operation
    /// (source files read before any target was serialized).
    fn dependency_validation(&self) -> Option<DependencyValidation> {
        None
    }
}

/// Adapter wrapping a single-target compile function into the full
/// [`CompileOperation`] interface.
pub struct SimpleCompileOperation {
    target_code: u64,
    name: String,
    artifacts: Vec<Artifact>,
    depval: Option<DependencyValidation>,
}

impl SimpleCompileOperation {
    pub fn new(
        target_code: u64,
        artifacts: Vec<Artifact>,
        depval: Option<DependencyValidation>,
    ) -> Self {
        let name = artifacts.first().map(|a| a.name.clone()).unwrap_or_default();
        Self { target_code, name, artifacts, depval }
    }
}

impl CompileOperation for SimpleCompileOperation {
    fn targets(&self) -> Vec<TargetDesc> {
        if self.artifacts.is_empty() {
            return Vec::new();
        }
        vec![TargetDesc { target_code: self.target_code, name: self.name.clone() }]
    }

    fn serialize_target(&mut self, idx: usize) -> Result<SerializedTarget> {
        debug_assert_eq!(idx, 0);
        Ok(SerializedTarget {
            artifacts: std::mem::take(&mut self.artifacts),
            depval: self.depval.clone(),
        })
    }

    fn dependency_validation(&self) -> Option<DependencyValidation> {
        self.depval.clone()
    }
}

/// Wraps `(initializers) -> (artifacts, depval)` into a compile delegate
/// for backends that only ever produce one target.
pub fn simple_compiler<F>(target_code: u64, compile: F) -> Arc<super::CompileFn>
where
    F: Fn(&InitializerPack) -> Result<(Vec<Artifact>, Option<DependencyValidation>)>
        + Send
        + Sync
        + 'static,
{
    Arc::new(move |initializers: &InitializerPack| {
        let (artifacts, depval) = compile(initializers)?;
        Ok(Box::new(SimpleCompileOperation::new(target_code, artifacts, depval))
            as Box<dyn CompileOperation>)
    })
}
