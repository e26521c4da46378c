//! Snapshot naming conventions.
//!
//! A single immutable [`Naming`] value is built at startup and handed to the
//! planner, the snapshot protocol and the retention manager, so every
//! component agrees on marker names, the timestamp format and the ownership
//! tag without any process-wide state.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use bon::Builder;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use getset::Getters;
use std::sync::Arc;

/// Snapshot holding the last state successfully sent to the destination
pub static DEFAULT_BASELINE_MARKER: &str = "zbackup_curr";
/// Snapshot holding the head of an in-flight incremental send
pub static DEFAULT_PENDING_MARKER: &str = "zbackup_new";
/// User property set on every destination snapshot this tool creates
pub static DEFAULT_TAG_PROPERTY: &str = "zbackup:";
pub static TAG_VALUE: &str = "true";
/// Fixed width and zero padded, so lexicographic order is chronological
pub static DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Clone, Debug, Builder, Getters, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct Naming {
    #[builder(into)]
    hostname: Arc<str>,
    #[builder(default = Arc::from(DEFAULT_BASELINE_MARKER))]
    baseline_marker: Arc<str>,
    #[builder(default = Arc::from(DEFAULT_PENDING_MARKER))]
    pending_marker: Arc<str>,
    #[builder(default = Arc::from(DEFAULT_TAG_PROPERTY))]
    tag_property: Arc<str>,
    #[builder(default = Arc::from(DEFAULT_TIMESTAMP_FORMAT))]
    timestamp_format: Arc<str>,
}

impl Naming {
    /// Default conventions, tagged with the name of the machine we run on.
    pub fn for_local_host() -> Result<Self> {
        let hostname = hostname::get()
            .map_err(Error::from)
            .with_msg("Cannot determine local hostname")?;
        Ok(Naming::builder()
            .hostname(hostname.to_string_lossy().into_owned())
            .build())
    }

    pub fn cycle_name(&self, now: &DateTime<Local>) -> String {
        now.format(&self.timestamp_format).to_string()
    }

    /// Parses the part after `@` back into a point in time. Marker snapshots
    /// and foreign names yield `None`.
    pub fn parse_cycle_name(&self, name: &str) -> Option<DateTime<Local>> {
        let naive = NaiveDateTime::parse_from_str(name, &self.timestamp_format).ok()?;
        Local.from_local_datetime(&naive).earliest()
    }

    /// `root/<hostname>-<source with '/' replaced by '-'>`
    pub fn destination_for(&self, root: &str, source: &str) -> String {
        format!("{}/{}-{}", root, self.hostname, source.replace('/', "-"))
    }

    pub fn is_tagged(&self, value: &str) -> bool {
        value == TAG_VALUE
    }
}

pub fn snapshot_path(dataset: &str, name: &str) -> String {
    format!("{dataset}@{name}")
}

/// Splits `dataset@name`, returning `None` for plain datasets.
pub fn split_snapshot(snapshot: &str) -> Option<(&str, &str)> {
    snapshot.split_once('@')
}
