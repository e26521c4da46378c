use crate::backup::naming::Naming;
use crate::backup::protocol::{Cycle, CycleReport};
use crate::backup::result_error::result::Result;
use crate::backup::retention::{prune, PruneReport, RetentionPolicy};
use crate::backup::zfs::SharedZfs;
use bon::Builder;
use chrono::{DateTime, Local};
use getset::{CopyGetters, Getters};
use std::sync::Arc;

/// One source dataset bound to the destination it is replicated into.
///
/// Tasks are produced by the planner and are independent of each other:
/// the only things two tasks may share are the dataset handles.
#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
pub struct BackupTask {
    #[getset(get_copy = "pub")]
    id: usize,
    #[builder(into)]
    #[getset(get = "pub")]
    source: Arc<str>,
    #[builder(into)]
    #[getset(get = "pub")]
    destination: Arc<str>,
    #[getset(get_copy = "pub")]
    retention: Option<RetentionPolicy>,
    #[getset(get = "pub")]
    source_zfs: SharedZfs,
    #[getset(get = "pub")]
    destination_zfs: SharedZfs,
    /// Destination pool lives on the same machine as the source
    #[builder(default)]
    #[getset(get_copy = "pub")]
    local_destination: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    pub cycle: CycleReport,
    pub prune: PruneReport,
}

impl BackupTask {
    /// Runs one snapshot cycle, then prunes the destination if the cycle
    /// succeeded.
    pub fn execute(&self, naming: &Naming, now: DateTime<Local>) -> Result<TaskReport> {
        let cycle = Cycle::new(self, naming, now).run()?;
        let prune = prune(self, naming, now)?;
        Ok(TaskReport { cycle, prune })
    }
}
