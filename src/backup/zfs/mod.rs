//! Dataset capability consumed by the backup engine.
//!
//! Everything the planner, the snapshot protocol and the retention manager do
//! to a pool goes through the [`Zfs`] trait. The production implementation is
//! [`runner::ZfsRunner`], which shells out to `zfs` either directly or over
//! `ssh`; tests use an in-memory pool.

#[cfg(test)]
pub(crate) mod memory;
pub mod runner;

use crate::backup::finish::Finish;
use crate::backup::result_error::result::Result;
use derive_more::Display;
use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::Arc;

pub type SharedZfs = Arc<dyn Zfs>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    #[display("filesystem")]
    Filesystem,
    #[display("snapshot")]
    Snapshot,
}

/// Producing end of a transfer: the output of `zfs send`.
pub trait SnapshotStream: Read + Finish + Send {
    /// Stops the producer without waiting for it to drain, used when the
    /// consumer went away and nobody will read the rest of the stream.
    fn abort(self: Box<Self>) -> Result<()>;
}

/// Consuming end of a transfer: the input of `zfs recv`.
pub trait SnapshotSink: Write + Finish + Send {}

pub trait Zfs: Debug + Send + Sync {
    /// Lists datasets of `kind` matching `pattern`.
    ///
    /// A pattern containing `*` is a substring match over every dataset of
    /// that kind, `recursive` includes the whole subtree below `pattern`, and
    /// an empty pattern lists everything.
    fn list(&self, pattern: &str, kind: DatasetKind, recursive: bool) -> Result<Vec<String>>;

    fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()>;

    /// Destroys a dataset or snapshot together with its descendants.
    fn destroy(&self, target: &str) -> Result<()>;

    fn rename(&self, old: &str, new: &str) -> Result<()>;

    fn exists_snapshot(&self, dataset: &str, name: &str) -> Result<bool>;

    /// Sends `dataset@base` in full when `head` is `None`, otherwise the
    /// delta from `dataset@base` to `dataset@head`.
    fn send_snapshot(
        &self,
        dataset: &str,
        base: &str,
        head: Option<&str>,
    ) -> Result<Box<dyn SnapshotStream>>;

    /// Starts receiving into `dataset@snapshot`, rolling back local changes.
    fn receive_snapshot(&self, dataset: &str, snapshot: &str) -> Result<Box<dyn SnapshotSink>>;

    /// Returns the raw value, `-` when the property is not set.
    fn get_property(&self, target: &str, key: &str) -> Result<String>;

    fn set_property(&self, target: &str, key: &str, value: &str) -> Result<()>;
}
