//! One replication cycle for one task.
//!
//! The source keeps at most two marker snapshots: the baseline, holding
//! the last state known to be on the destination, and the pending one,
//! holding the head of an incremental send that has not been rotated yet.
//! Which of them exist when a cycle starts tells whether the previous cycle
//! completed, and if not, where it stopped:
//!
//! | baseline | pending | meaning                                           |
//! |----------|---------|---------------------------------------------------|
//! | no       | no      | never backed up, send everything                  |
//! | yes      | no      | previous cycle completed, send the delta          |
//! | yes      | yes     | stopped during the transfer or before the destroy |
//! | no       | yes     | stopped between the destroy and the rename        |
//!
//! A baseline only counts when the destination holds the snapshot it was
//! received as, matched by `guid`. A baseline left by a failed full send
//! is dropped and the dataset sent in full again.
//!
//! The destination snapshot of a cycle is named after the cycle's minute,
//! so running twice in the same minute is refused before anything is
//! touched.

use crate::backup::naming::{snapshot_path, split_snapshot, Naming, TAG_VALUE};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{join_results, Result};
use crate::backup::task::BackupTask;
use crate::backup::zfs::{DatasetKind, SharedZfs};
use chrono::{DateTime, Local};
use derive_more::Display;
use std::io;
use tracing::{debug, info, warn};

/// Native property preserved by send/receive, identifies a snapshot across pools.
static GUID_PROPERTY: &str = "guid";
static READONLY_PROPERTY: &str = "readonly";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CycleStep {
    #[display("guard check")]
    GuardCheck,
    #[display("baseline detection")]
    DetectBaseline,
    #[display("recovery")]
    Recover,
    #[display("snapshot")]
    CreateSnapshot,
    #[display("transfer")]
    Transfer,
    #[display("rotate")]
    Rotate,
    #[display("tag")]
    Tag,
}

/// State of the source markers when a cycle starts.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    #[display("fresh")]
    Fresh,
    #[display("baseline")]
    Present,
    #[display("interrupted transfer")]
    InterruptedTransfer,
    #[display("interrupted rotation")]
    InterruptedRotation,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport {
    /// Destination snapshot created by this cycle
    pub snapshot: String,
    pub baseline: Baseline,
    pub mode: TransferMode,
    pub bytes: u64,
}

pub struct Cycle<'a> {
    task: &'a BackupTask,
    naming: &'a Naming,
    name: String,
}

impl<'a> Cycle<'a> {
    pub fn new(task: &'a BackupTask, naming: &'a Naming, now: DateTime<Local>) -> Self {
        Self {
            task,
            naming,
            name: naming.cycle_name(&now),
        }
    }

    /// Runs the cycle up to and including tagging the new destination
    /// snapshot. Every failure is reported as the step it happened in.
    pub fn run(&self) -> Result<CycleReport> {
        let id = self.task.id();
        self.guard_check()?;

        let baseline = self
            .detect_baseline()
            .map_err(|e| self.fail(CycleStep::DetectBaseline, e))?;
        debug!("[{id}] {} is in state: {baseline}", self.task.source());
        self.recover(baseline)
            .map_err(|e| self.fail(CycleStep::Recover, e))?;
        let mode = self
            .transfer_mode(baseline)
            .map_err(|e| self.fail(CycleStep::Recover, e))?;

        let bytes = match mode {
            TransferMode::Full => self.full_send()?,
            TransferMode::Incremental => self.incremental_send()?,
        };

        let snapshot = self.destination_snapshot();
        self.tag(&snapshot)
            .map_err(|e| self.fail(CycleStep::Tag, e))?;
        info!("[{id}] {mode} backup {} -> {snapshot} done, {bytes} bytes", self.task.source());

        Ok(CycleReport {
            snapshot,
            baseline,
            mode,
            bytes,
        })
    }

    fn src(&self) -> &SharedZfs {
        self.task.source_zfs()
    }

    fn dst(&self) -> &SharedZfs {
        self.task.destination_zfs()
    }

    fn baseline_marker(&self) -> &str {
        self.naming.baseline_marker()
    }

    fn pending_marker(&self) -> &str {
        self.naming.pending_marker()
    }

    fn destination_snapshot(&self) -> String {
        snapshot_path(self.task.destination(), &self.name)
    }

    fn fail(&self, step: CycleStep, error: Error) -> Error {
        Error::TransferFailed {
            task_id: self.task.id(),
            src: self.task.source().clone(),
            dst: self.task.destination().clone(),
            step,
            error: Box::new(error),
        }
    }

    fn guard_check(&self) -> Result<()> {
        let exists = self
            .dst()
            .exists_snapshot(self.task.destination(), &self.name)
            .map_err(|e| self.fail(CycleStep::GuardCheck, e))?;
        if exists {
            return Err(Error::GuardDuplicate {
                task_id: self.task.id(),
                snapshot: self.destination_snapshot(),
            });
        }
        Ok(())
    }

    fn detect_baseline(&self) -> Result<Baseline> {
        let src = self.task.source();
        let has_baseline = self.src().exists_snapshot(src, self.baseline_marker())?;
        let has_pending = self.src().exists_snapshot(src, self.pending_marker())?;
        Ok(match (has_baseline, has_pending) {
            (false, false) => Baseline::Fresh,
            (true, false) => Baseline::Present,
            (true, true) => Baseline::InterruptedTransfer,
            (false, true) => Baseline::InterruptedRotation,
        })
    }

    /// Brings the markers back to the `Present` state.
    ///
    /// A pending snapshot whose guid is already on the destination was
    /// received: the previous cycle only missed its rotation, so the
    /// rotation is completed and the received snapshot tagged. Otherwise the
    /// pending snapshot never made it and is discarded.
    fn recover(&self, baseline: Baseline) -> Result<()> {
        let id = self.task.id();
        let pending = snapshot_path(self.task.source(), self.pending_marker());
        match baseline {
            Baseline::Fresh | Baseline::Present => Ok(()),
            Baseline::InterruptedTransfer => match self.find_on_destination(&pending)? {
                Some(received) => {
                    warn!("[{id}] {pending} already reached the destination as {received}, completing rotation");
                    self.rotate()?;
                    self.tag(&received)
                }
                None => {
                    warn!("[{id}] {pending} left by an interrupted transfer, destroying it");
                    self.src().destroy(&pending)
                }
            },
            Baseline::InterruptedRotation => {
                warn!("[{id}] {pending} left by an interrupted rotation, promoting it to baseline");
                let received = self.find_on_destination(&pending)?;
                self.src().rename(
                    &pending,
                    &snapshot_path(self.task.source(), self.baseline_marker()),
                )?;
                match received {
                    Some(received) => self.tag(&received),
                    None => Ok(()),
                }
            }
        }
    }

    /// Picks a full send when there is no usable baseline. A baseline
    /// missing from the destination is destroyed first.
    fn transfer_mode(&self, baseline: Baseline) -> Result<TransferMode> {
        if baseline == Baseline::Fresh {
            return Ok(TransferMode::Full);
        }
        let current = snapshot_path(self.task.source(), self.baseline_marker());
        if self.find_on_destination(&current)?.is_some() {
            return Ok(TransferMode::Incremental);
        }
        warn!(
            "[{}] {current} never reached {}, destroying it for a full backup",
            self.task.id(),
            self.task.destination()
        );
        self.src().destroy(&current)?;
        Ok(TransferMode::Full)
    }

    /// Looks for the destination snapshot sharing the guid of the source
    /// `snapshot`. A destination that does not exist yet holds nothing.
    fn find_on_destination(&self, snapshot: &str) -> Result<Option<String>> {
        let dst = self.task.destination();
        let guid = self.src().get_property(snapshot, GUID_PROPERTY)?;
        let snapshots = match self.dst().list(dst, DatasetKind::Snapshot, true) {
            Ok(snapshots) => snapshots,
            Err(e) if e.is_missing_dataset() => {
                debug!("[{}] {dst} does not exist yet", self.task.id());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        for snapshot in snapshots {
            if !split_snapshot(&snapshot).is_some_and(|(ds, _)| ds == &**dst) {
                continue;
            }
            if self.dst().get_property(&snapshot, GUID_PROPERTY)? == guid {
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }

    fn full_send(&self) -> Result<u64> {
        let src = self.task.source();
        debug!("[{}] no {} on {src}, full backup", self.task.id(), self.baseline_marker());
        self.src()
            .create_snapshot(src, self.baseline_marker())
            .map_err(|e| self.fail(CycleStep::CreateSnapshot, e))?;
        self.transfer(None)
            .map_err(|e| self.fail(CycleStep::Transfer, e))
    }

    fn incremental_send(&self) -> Result<u64> {
        let src = self.task.source();
        debug!("[{}] incremental backup of {src} since {}", self.task.id(), self.baseline_marker());
        self.src()
            .create_snapshot(src, self.pending_marker())
            .map_err(|e| self.fail(CycleStep::CreateSnapshot, e))?;
        let bytes = self
            .transfer(Some(self.pending_marker()))
            .map_err(|e| self.fail(CycleStep::Transfer, e))?;
        self.rotate()
            .map_err(|e| self.fail(CycleStep::Rotate, e))?;
        Ok(bytes)
    }

    /// Pipes `zfs send` into `zfs recv`. Both processes are always reaped
    /// and a failure on either side fails the transfer.
    fn transfer(&self, head: Option<&str>) -> Result<u64> {
        let mut sink = self
            .dst()
            .receive_snapshot(self.task.destination(), &self.name)?;
        let mut stream = match self
            .src()
            .send_snapshot(self.task.source(), self.baseline_marker(), head)
        {
            Ok(stream) => stream,
            Err(e) => return join_results(Err(e), sink.finish()).map(|_| 0),
        };

        match io::copy(&mut stream, &mut sink) {
            Ok(bytes) => join_results(sink.finish(), stream.finish()).map(|_| bytes),
            Err(e) => {
                let copied = Err(Error::from(e));
                join_results(join_results(copied, stream.abort()), sink.finish()).map(|_| 0)
            }
        }
    }

    /// Destroys the baseline, then promotes the pending snapshot to baseline.
    fn rotate(&self) -> Result<()> {
        let src = self.task.source();
        let baseline = snapshot_path(src, self.baseline_marker());
        self.src().destroy(&baseline)?;
        self.src()
            .rename(&snapshot_path(src, self.pending_marker()), &baseline)
    }

    /// Marks the destination read-only and the snapshot as ours.
    fn tag(&self, snapshot: &str) -> Result<()> {
        self.dst()
            .set_property(self.task.destination(), READONLY_PROPERTY, "on")?;
        self.dst()
            .set_property(snapshot, self.naming.tag_property(), TAG_VALUE)
    }
}
