use crate::backup::naming::{split_snapshot, Naming};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::task::BackupTask;
use crate::backup::zfs::DatasetKind;
use chrono::{DateTime, Local, TimeDelta, TimeZone};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

static LAST_ONE: &str = "lastone";

/// Which tool-owned destination snapshots to destroy after a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RetentionPolicy {
    /// Keep only the most recent tagged snapshot
    LastOne,
    /// Destroy tagged snapshots older than this
    MaxAge(Duration),
}

impl RetentionPolicy {
    /// Like [`FromStr`], but an empty string means "keep everything".
    pub fn parse_optional(s: &str) -> Result<Option<Self>> {
        let s = s.trim();
        if s.is_empty() {
            Ok(None)
        } else {
            s.parse().map(Some)
        }
    }

    /// Reads an optional policy where null and `""` both mean none.
    pub fn deserialize_optional<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Self>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => Self::parse_optional(&s).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    /// Picks the items to delete, newest first.
    ///
    /// Items are ordered by `(date_time, item)`, so `LastOne` keeps the same
    /// item whatever order they come in.
    pub fn get_delete<R, T, I>(&self, iter: I, now: DateTime<Local>) -> Vec<ItemWithDateTime<R, T>>
    where
        R: Ord,
        T: TimeZone,
        I: IntoIterator<Item = ItemWithDateTime<R, T>>,
    {
        let newest_first = iter
            .into_iter()
            .sorted_unstable_by(|a, b| (&b.date_time, &b.item).cmp(&(&a.date_time, &a.item)));

        match self {
            RetentionPolicy::LastOne => newest_first.skip(1).collect(),
            RetentionPolicy::MaxAge(max_age) => {
                let max_age = TimeDelta::from_std(*max_age).unwrap_or(TimeDelta::MAX);
                newest_first
                    .filter(|i| now.signed_duration_since(&i.date_time) > max_age)
                    .collect()
            }
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == LAST_ONE {
            return Ok(RetentionPolicy::LastOne);
        }
        humantime_serde::re::humantime::parse_duration(s)
            .map(RetentionPolicy::MaxAge)
            .map_err(|_| Error::InvalidRetentionPolicy(s.to_string()))
    }
}

impl TryFrom<String> for RetentionPolicy {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RetentionPolicy> for String {
    fn from(value: RetentionPolicy) -> Self {
        value.to_string()
    }
}

impl Display for RetentionPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::LastOne => f.write_str(LAST_ONE),
            RetentionPolicy::MaxAge(d) => {
                write!(f, "{}", humantime_serde::re::humantime::format_duration(*d))
            }
        }
    }
}

#[derive(Clone, Hash, Eq, PartialEq)]
pub struct ItemWithDateTime<R, T: TimeZone> {
    pub item: R,
    pub date_time: DateTime<T>,
}

impl<R, T: TimeZone> From<(R, DateTime<T>)> for ItemWithDateTime<R, T> {
    fn from(value: (R, DateTime<T>)) -> Self {
        Self {
            item: value.0,
            date_time: value.1,
        }
    }
}

impl<R: Debug, T: TimeZone> Debug for ItemWithDateTime<R, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({:?})", self.item, self.date_time)
    }
}

/// What a pruning pass did, for logs and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub destroyed: Vec<String>,
    pub failed: Vec<String>,
    /// Snapshots without the ownership tag, never touched
    pub untagged: usize,
    /// Tagged snapshots we could not read or date
    pub skipped: usize,
}

/// Destroys the destination snapshots of `task` that fall outside its
/// retention policy.
///
/// Only snapshots of the destination itself carrying the ownership tag are
/// candidates. Individual
/// destroy failures are logged and counted, never fatal: the pass always
/// goes through every candidate. Only failing to list the destination is an
/// error.
pub fn prune(task: &BackupTask, naming: &Naming, now: DateTime<Local>) -> Result<PruneReport> {
    let id = task.id();
    let dst = task.destination();
    let zfs = task.destination_zfs();
    let mut report = PruneReport::default();

    let Some(policy) = task.retention() else {
        info!("[{id}] expire is not set, will not delete old backups");
        return Ok(report);
    };
    debug!("[{id}] cleaning expired snapshots of {dst}, expire: {policy}");

    // descendants of dst may be the destinations of other tasks
    let snapshots = zfs
        .list(dst, DatasetKind::Snapshot, true)
        .map_err(|e| Error::PruneFailed {
            task_id: id,
            dst: dst.clone(),
            error: Box::new(e),
        })?
        .into_iter()
        .filter(|s| split_snapshot(s).is_some_and(|(ds, _)| ds == &**dst))
        .collect_vec();
    if snapshots.len() <= 1 {
        info!("[{id}] only {} snapshot on {dst}, nothing to delete", snapshots.len());
        return Ok(report);
    }

    let mut candidates = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        match zfs.get_property(&snapshot, naming.tag_property()) {
            Ok(value) if naming.is_tagged(&value) => {}
            Ok(_) => {
                debug!("[{id}] {snapshot} is not created by zbackup, skipping");
                report.untagged += 1;
                continue;
            }
            Err(e) => {
                warn!("[{id}] cannot read {} of {snapshot}, skipping: {e}", naming.tag_property());
                report.skipped += 1;
                continue;
            }
        }
        match split_snapshot(&snapshot).and_then(|(_, name)| naming.parse_cycle_name(name)) {
            Some(date_time) => candidates.push(ItemWithDateTime::from((snapshot, date_time))),
            None => {
                warn!("[{id}] {snapshot} is tagged but has no timestamp, skipping");
                report.skipped += 1;
            }
        }
    }

    for expired in policy.get_delete(candidates, now) {
        let snapshot = expired.item;
        debug!("[{id}] {snapshot} will be destroyed ({policy})");
        match zfs.destroy(&snapshot) {
            Ok(()) => {
                info!("[{id}] destroyed {snapshot}");
                report.destroyed.push(snapshot);
            }
            Err(e) => {
                error!("[{id}] error destroying {snapshot}: {e}");
                report.failed.push(snapshot);
            }
        }
    }

    Ok(report)
}
