//! Error types shared by the asset pipeline.

use crate::depval::DependencyValidation;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub type Result<T, E = AssetError> = std::result::Result<T, E>;

/// How an asset failed to be constructed from the data provided.
///
/// Construction errors always carry the dependency validation of whatever was
/// being built, so that a caller can install a change monitor and retry once
/// the inputs update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConstructionKind {
    MissingFile,
    UnsupportedVersion,
    FormatError,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error(transparent)]
    Io(#[from] AssetIoError),
    #[error("{message}")]
    Construction {
        kind: ConstructionKind,
        message: String,
        depval: Option<DependencyValidation>,
    },
    /// The file is locked by another process. Callers may retry with
    /// [`retry_exclusive`].
    #[error("file is exclusively locked: \"{0}\"")]
    ExclusiveLock(PathBuf),
    /// No compiler is associated with the (target-code, initializer) pair.
    #[error("no compiler associated with target code {target_code:#x} and initializer \"{initializer}\"")]
    MissingBackend { target_code: u64, initializer: String },
    /// An archive-cache collection was used after a subsequent commit to the
    /// same entry.
    #[error("stale artifact collection reference: {0}")]
    StaleReference(String),
    #[error("compiler was deregistered before the request completed")]
    CompilerShutdown,
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
    /// An error observed through a shared compile future. The original error
    /// is refcounted so every requestor of the same fingerprint sees it.
    #[error(transparent)]
    Shared(#[from] Arc<AssetError>),
}

impl AssetError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        AssetIoError::new(err, path).into()
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        AssetError::Message(msg.to_string())
    }

    pub fn construction(
        kind: ConstructionKind,
        msg: impl std::fmt::Display,
        depval: Option<DependencyValidation>,
    ) -> Self {
        AssetError::Construction { kind, message: msg.to_string(), depval }
    }

    /// The dependency validation attached to this error, if any.
    pub fn dependency_validation(&self) -> Option<&DependencyValidation> {
        match self {
            AssetError::Construction { depval, .. } => depval.as_ref(),
            AssetError::Shared(inner) => inner.dependency_validation(),
            _ => None,
        }
    }

    /// Whether this error represents "not found" on a retrieve path, which is
    /// normal for a cold cache and must not surface to clients.
    pub fn is_not_found(&self) -> bool {
        match self {
            AssetError::Io(err) => err.source.kind() == io::ErrorKind::NotFound,
            AssetError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

/// An io error paired with the path on which it occurred.
#[derive(Debug, thiserror::Error)]
#[error("\"{path}\": {source}")]
pub struct AssetIoError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

impl AssetIoError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), source }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> &io::Error {
        &self.source
    }
}

/// Runs `op`, retrying while it reports [`AssetError::ExclusiveLock`].
///
/// Spacing between attempts grows quadratically and the attempt count is
/// capped, so a persistently held lock fails within roughly a second.
pub fn retry_exclusive<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    const MAX_ATTEMPTS: u32 = 5;
    const BASE: Duration = Duration::from_millis(10);

    let mut attempt = 0;
    loop {
        match op() {
            Err(AssetError::ExclusiveLock(path)) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(AssetError::ExclusiveLock(path));
                }
                std::thread::sleep(BASE * (attempt * attempt));
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_gives_up_after_capped_attempts() {
        let mut calls = 0;
        let result: Result<()> = retry_exclusive(|| {
            calls += 1;
            Err(AssetError::ExclusiveLock("locked.bin".into()))
        });
        assert!(matches!(result, Err(AssetError::ExclusiveLock(_))));
        assert_eq!(calls, 5);
    }

    #[test]
    fn retry_returns_first_success() {
        let mut calls = 0;
        let result = retry_exclusive(|| {
            calls += 1;
            if calls < 3 {
                Err(AssetError::ExclusiveLock("locked.bin".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }
}
