use crate::backup::naming::Naming;
use crate::backup::result_error::error::Error;
use crate::backup::retention::RetentionPolicy;
use crate::backup::task::BackupTask;
use crate::backup::zfs::runner::{Runner, ZfsRunner};
use crate::backup::zfs::{DatasetKind, SharedZfs};
use bon::Builder;
use derive_more::Display;
use getset::{CopyGetters, Getters};
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SpecConflict {
    #[display("'remote_prefix' and 'recursive' are mutually exclusive")]
    PrefixWithRecursive,
    #[display("'remote_prefix' and wildcard patterns are mutually exclusive")]
    PrefixWithWildcard,
}

/// One backup section after configuration has been resolved.
#[derive(Clone, Debug, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct BackupSpec {
    /// Dataset name, or a pattern when it contains `*`
    #[builder(into)]
    #[getset(get = "pub")]
    source_pattern: Arc<str>,
    #[builder(default)]
    #[getset(get_copy = "pub")]
    recursive: bool,
    /// Destination pool or parent dataset
    #[builder(into)]
    #[getset(get = "pub")]
    destination_root: Arc<str>,
    /// Fixed destination name under the root instead of the derived one
    #[builder(into)]
    #[getset(get = "pub")]
    destination_prefix: Option<Arc<str>>,
    #[getset(get_copy = "pub")]
    retention: Option<RetentionPolicy>,
    #[builder(default = Runner::Local)]
    #[getset(get = "pub")]
    destination: Runner,
}

impl BackupSpec {
    /// A fixed destination name only makes sense for a single source.
    pub fn conflict(&self) -> Option<SpecConflict> {
        self.destination_prefix.as_ref()?;
        if self.recursive {
            Some(SpecConflict::PrefixWithRecursive)
        } else if self.source_pattern.contains('*') {
            Some(SpecConflict::PrefixWithWildcard)
        } else {
            None
        }
    }

    fn destination_for(&self, naming: &Naming, source: &str) -> String {
        match &self.destination_prefix {
            Some(prefix) => format!("{}/{}", self.destination_root, prefix),
            None => naming.destination_for(&self.destination_root, source),
        }
    }
}

type Connect = Box<dyn Fn(&Runner) -> SharedZfs + Send + Sync>;

/// Expands [`BackupSpec`]s into concrete [`BackupTask`]s.
pub struct Planner {
    naming: Arc<Naming>,
    source: SharedZfs,
    connect: Connect,
}

impl Debug for Planner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("naming", &self.naming)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Planner {
    pub fn new<F>(naming: Arc<Naming>, source: SharedZfs, connect: F) -> Self
    where
        F: Fn(&Runner) -> SharedZfs + Send + Sync + 'static,
    {
        Self {
            naming,
            source,
            connect: Box::new(connect),
        }
    }

    /// Local destinations reuse the source handle, remote ones go over ssh.
    pub fn with_zfs_runner(naming: Arc<Naming>) -> Self {
        let source: SharedZfs = Arc::new(ZfsRunner::local());
        let local = source.clone();
        Self::new(naming, source, move |runner: &Runner| -> SharedZfs {
            match runner {
                Runner::Local => local.clone(),
                remote => Arc::new(ZfsRunner::new(remote.clone())),
            }
        })
    }

    /// Builds the task list.
    ///
    /// Invalid specs and specs whose source cannot be listed are logged and
    /// skipped, they never abort planning. A source dataset, or a
    /// destination dataset, already claimed by an earlier spec is skipped
    /// too, so no two tasks ever write to the same place. Task ids are
    /// assigned in order, starting at 0.
    pub fn plan(&self, specs: &[BackupSpec]) -> Vec<BackupTask> {
        let mut tasks: Vec<BackupTask> = Vec::new();
        let mut handles: HashMap<&Runner, SharedZfs> = HashMap::new();
        let mut sources: HashSet<String> = HashSet::new();
        let mut destinations: HashSet<(&Runner, String)> = HashSet::new();

        for spec in specs {
            let pattern = spec.source_pattern();
            if let Some(reason) = spec.conflict() {
                error!(
                    "{}",
                    Error::SpecInvalid {
                        pattern: pattern.clone(),
                        reason,
                    }
                );
                continue;
            }

            let datasets = match self
                .source
                .list(pattern, DatasetKind::Filesystem, spec.recursive())
            {
                Ok(datasets) => datasets,
                Err(e) => {
                    error!(
                        "{}",
                        Error::ListingFailed {
                            pattern: pattern.clone(),
                            error: Box::new(e),
                        }
                    );
                    continue;
                }
            };
            if datasets.is_empty() {
                warn!("{pattern}: no filesystem matched, skip this backup section");
                continue;
            }
            if let Some(prefix) = spec.destination_prefix() {
                warn!(
                    "{pattern}: 'remote_prefix' is set, {}/{prefix} will be overwritten if it already exists",
                    spec.destination_root()
                );
            }

            let destination_zfs = handles
                .entry(spec.destination())
                .or_insert_with(|| (self.connect)(spec.destination()))
                .clone();
            let local_destination = matches!(spec.destination(), Runner::Local);

            for source in datasets {
                if sources.contains(&source) {
                    warn!("{source}: already planned by an earlier backup section, skipping");
                    continue;
                }
                let destination = spec.destination_for(&self.naming, &source);
                if !destinations.insert((spec.destination(), destination.clone())) {
                    warn!("{source}: {destination} is already the target of another backup, skipping");
                    continue;
                }
                sources.insert(source.clone());

                let id = tasks.len();
                debug!("[{id}] planned {source} -> {destination}");
                tasks.push(
                    BackupTask::builder()
                        .id(id)
                        .source(source)
                        .destination(destination)
                        .maybe_retention(spec.retention())
                        .source_zfs(self.source.clone())
                        .destination_zfs(destination_zfs.clone())
                        .local_destination(local_destination)
                        .build(),
                );
            }
        }

        info!("{} backup task(s) planned from {} section(s)", tasks.len(), specs.len());
        tasks
    }
}
