use crate::backup::planner::SpecConflict;
use crate::backup::protocol::CycleStep;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use derive_more::Display;
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

static MISSING_DATASET: &str = "dataset does not exist";

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error("{pattern}: {reason}; skip this backup section")]
    SpecInvalid {
        pattern: Arc<str>,
        reason: SpecConflict,
    },
    #[error("listing {:?} failed:\n{}", pattern, indent::indent_all_with("  ", error.to_string()))]
    ListingFailed { pattern: Arc<str>, error: Box<Error> },
    #[error("[{task_id}] {snapshot} already exists, wait next minute and run again")]
    GuardDuplicate { task_id: usize, snapshot: String },
    #[error("[{}] {} -> {}: {} failed:\n{}", task_id, src, dst, step, indent::indent_all_with("  ", error.to_string()))]
    TransferFailed {
        task_id: usize,
        src: Arc<str>,
        dst: Arc<str>,
        step: CycleStep,
        error: Box<Error>,
    },
    #[error("[{}] pruning {} failed:\n{}", task_id, dst, indent::indent_all_with("  ", error.to_string()))]
    PruneFailed {
        task_id: usize,
        dst: Arc<str>,
        error: Box<Error>,
    },
    #[error("`{}` exited with {}: {}", command, code.map_or("signal".to_string(), |c| c.to_string()), stderr.trim())]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("invalid retention policy {0:?}, expected \"lastone\" or a duration like \"24h\"")]
    InvalidRetentionPolicy(String),
    #[error("cannot run: pidfile {0:?} already exists")]
    PidfileExists(PathBuf),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send + Sync>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

/// Coarse classification of [`Error`], looking through context wrappers.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    SpecInvalid,
    ListingFailed,
    GuardDuplicate,
    TransferFailed,
    PruneFailed,
    Command,
    Other,
}

impl<S: Into<String>, O: Debug + Send + Sync + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Whether a `zfs` command failed only because its target is absent.
    pub fn is_missing_dataset(&self) -> bool {
        match self {
            Error::CommandFailed { stderr, .. } => stderr.contains(MISSING_DATASET),
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.is_missing_dataset()
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ValidationError(_) | Error::SerdeYml(_) | Error::InvalidRetentionPolicy(_) => {
                ErrorKind::Config
            }
            Error::SpecInvalid { .. } => ErrorKind::SpecInvalid,
            Error::ListingFailed { .. } => ErrorKind::ListingFailed,
            Error::GuardDuplicate { .. } => ErrorKind::GuardDuplicate,
            Error::TransferFailed { .. } => ErrorKind::TransferFailed,
            Error::PruneFailed { .. } => ErrorKind::PruneFailed,
            Error::CommandFailed { .. } => ErrorKind::Command,
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.kind()
            }
            Error::LotsOfError(v) => v.first().map_or(ErrorKind::Other, Error::kind),
            Error::Io(_) | Error::ThreadPoolBuildError(_) | Error::PidfileExists(_) => {
                ErrorKind::Other
            }
        }
    }
}
