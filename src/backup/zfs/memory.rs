//! In-memory pool used by the unit tests.
//!
//! Keeps datasets, snapshots and properties in a map, records every call so
//! tests can assert on what was (not) mutated, and lets a test inject a
//! failure for a given operation and target.

use crate::backup::finish::Finish;
use crate::backup::naming::{snapshot_path, split_snapshot};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::zfs::{DatasetKind, SnapshotSink, SnapshotStream, Zfs};
use derive_more::Display;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const GUID: &str = "guid";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    #[display("list")]
    List,
    #[display("snapshot")]
    Create,
    #[display("destroy")]
    Destroy,
    #[display("rename")]
    Rename,
    #[display("exists")]
    Exists,
    #[display("send")]
    Send,
    #[display("recv")]
    Receive,
    #[display("get")]
    GetProperty,
    #[display("set")]
    SetProperty,
}

impl Op {
    fn is_mutation(self) -> bool {
        matches!(
            self,
            Op::Create | Op::Destroy | Op::Rename | Op::Receive | Op::SetProperty
        )
    }
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeSet<String>,
    snapshots: BTreeSet<String>,
    properties: BTreeMap<String, BTreeMap<String, String>>,
    calls: Vec<(Op, String)>,
    failures: Vec<(Op, String)>,
    in_flight: usize,
    peak_in_flight: usize,
    next_guid: u64,
}

impl State {
    /// Gives a new snapshot the identity `zfs send` carries to the receiver.
    fn assign_guid(&mut self, snapshot: &str) {
        self.next_guid += 1;
        let guid = self.next_guid.to_string();
        self.properties
            .entry(snapshot.to_string())
            .or_default()
            .insert(GUID.to_string(), guid);
    }

    fn guid(&self, snapshot: &str) -> String {
        self.properties
            .get(snapshot)
            .and_then(|p| p.get(GUID))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryZfs {
    state: Arc<Mutex<State>>,
    delay: Option<Duration>,
}

fn missing(op: Op, target: &str) -> Error {
    Error::CommandFailed {
        command: format!("zfs {op} {target}"),
        code: Some(1),
        stderr: format!("cannot open '{target}': dataset does not exist"),
    }
}

fn failed(op: Op, target: &str, why: &str) -> Error {
    Error::CommandFailed {
        command: format!("zfs {op} {target}"),
        code: Some(1),
        stderr: why.to_string(),
    }
}

struct InFlight<'a> {
    zfs: &'a MemoryZfs,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.zfs.lock().in_flight -= 1;
    }
}

impl MemoryZfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datasets<I: IntoIterator<Item = S>, S: Into<String>>(datasets: I) -> Self {
        let zfs = Self::new();
        zfs.lock()
            .datasets
            .extend(datasets.into_iter().map(Into::into));
        zfs
    }

    /// Makes every call sleep, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Fails every `op` whose target contains `needle`.
    pub fn fail_on<S: Into<String>>(&self, op: Op, needle: S) {
        self.lock().failures.push((op, needle.into()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn add_snapshot(&self, snapshot: &str) {
        let mut state = self.lock();
        if let Some((dataset, _)) = split_snapshot(snapshot) {
            state.datasets.insert(dataset.to_string());
        }
        if state.snapshots.insert(snapshot.to_string()) {
            state.assign_guid(snapshot);
        }
    }

    pub fn add_tagged_snapshot(&self, snapshot: &str, key: &str) {
        self.add_snapshot(snapshot);
        self.lock()
            .properties
            .entry(snapshot.to_string())
            .or_default()
            .insert(key.to_string(), "true".to_string());
    }

    pub fn snapshots_of(&self, dataset: &str) -> Vec<String> {
        self.lock()
            .snapshots
            .iter()
            .filter(|s| split_snapshot(s).is_some_and(|(ds, _)| ds == dataset))
            .cloned()
            .collect()
    }

    pub fn has_snapshot(&self, snapshot: &str) -> bool {
        self.lock().snapshots.contains(snapshot)
    }

    pub fn property(&self, target: &str, key: &str) -> Option<String> {
        self.lock()
            .properties
            .get(target)
            .and_then(|p| p.get(key))
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(|(op, target)| format!("{op} {target}"))
            .collect()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| op.is_mutation())
            .map(|(op, target)| format!("{op} {target}"))
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    fn enter(&self, op: Op, target: &str) -> Result<InFlight<'_>> {
        {
            let mut state = self.lock();
            state.calls.push((op, target.to_string()));
            // receive failures surface when the stream is finished
            if op != Op::Receive
                && state
                    .failures
                    .iter()
                    .any(|(o, needle)| *o == op && target.contains(needle.as_str()))
            {
                return Err(failed(op, target, "injected failure"));
            }
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
        }
        let guard = InFlight { zfs: self };
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(guard)
    }

    fn exists(&self, target: &str) -> bool {
        let state = self.lock();
        state.datasets.contains(target) || state.snapshots.contains(target)
    }
}

fn under(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl Zfs for MemoryZfs {
    fn list(&self, pattern: &str, kind: DatasetKind, recursive: bool) -> Result<Vec<String>> {
        let _guard = self.enter(Op::List, pattern)?;
        let state = self.lock();
        let names: Vec<&String> = match kind {
            DatasetKind::Filesystem => state.datasets.iter().collect(),
            DatasetKind::Snapshot => state.snapshots.iter().collect(),
        };
        if pattern.contains('*') {
            let needle = pattern.trim_matches('*');
            return Ok(names
                .into_iter()
                .filter(|n| n.contains(needle))
                .cloned()
                .collect());
        }
        if pattern.is_empty() {
            return Ok(names.into_iter().cloned().collect());
        }
        if !state.datasets.contains(pattern) && !state.snapshots.contains(pattern) {
            return Err(missing(Op::List, pattern));
        }
        Ok(names
            .into_iter()
            .filter(|n| {
                let dataset = split_snapshot(n).map_or(n.as_str(), |(ds, _)| ds);
                match kind {
                    DatasetKind::Filesystem if recursive => under(dataset, pattern),
                    DatasetKind::Filesystem => dataset == pattern,
                    DatasetKind::Snapshot if recursive => under(dataset, pattern),
                    DatasetKind::Snapshot => dataset == pattern || n.as_str() == pattern,
                }
            })
            .cloned()
            .collect())
    }

    fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        let snapshot = snapshot_path(dataset, name);
        let _guard = self.enter(Op::Create, &snapshot)?;
        let mut state = self.lock();
        if !state.datasets.contains(dataset) {
            return Err(missing(Op::Create, dataset));
        }
        if !state.snapshots.insert(snapshot.clone()) {
            return Err(failed(Op::Create, &snapshot, "dataset already exists"));
        }
        state.assign_guid(&snapshot);
        Ok(())
    }

    fn destroy(&self, target: &str) -> Result<()> {
        let _guard = self.enter(Op::Destroy, target)?;
        if !self.exists(target) {
            return Err(missing(Op::Destroy, target));
        }
        let mut state = self.lock();
        if state.snapshots.remove(target) {
            state.properties.remove(target);
            return Ok(());
        }
        state.datasets.retain(|ds| !under(ds, target));
        state
            .snapshots
            .retain(|s| split_snapshot(s).is_some_and(|(ds, _)| !under(ds, target)));
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let _guard = self.enter(Op::Rename, &format!("{old} {new}"))?;
        let mut state = self.lock();
        if !state.snapshots.contains(old) {
            return Err(missing(Op::Rename, old));
        }
        if state.snapshots.contains(new) {
            return Err(failed(Op::Rename, new, "dataset already exists"));
        }
        state.snapshots.remove(old);
        state.snapshots.insert(new.to_string());
        if let Some(props) = state.properties.remove(old) {
            state.properties.insert(new.to_string(), props);
        }
        Ok(())
    }

    fn exists_snapshot(&self, dataset: &str, name: &str) -> Result<bool> {
        let snapshot = snapshot_path(dataset, name);
        let _guard = self.enter(Op::Exists, &snapshot)?;
        let exists = self.lock().snapshots.contains(&snapshot);
        Ok(exists)
    }

    fn send_snapshot(
        &self,
        dataset: &str,
        base: &str,
        head: Option<&str>,
    ) -> Result<Box<dyn SnapshotStream>> {
        let base = snapshot_path(dataset, base);
        let payload = match head {
            None => format!("full {base}"),
            Some(head) => format!("delta {base} {}", snapshot_path(dataset, head)),
        };
        let _guard = self.enter(Op::Send, &payload)?;
        let state = self.lock();
        let head = head.map(|h| snapshot_path(dataset, h));
        for snapshot in std::iter::once(&base).chain(head.as_ref()) {
            if !state.snapshots.contains(snapshot) {
                return Err(missing(Op::Send, snapshot));
            }
        }
        let guid = state.guid(head.as_ref().unwrap_or(&base));
        Ok(Box::new(MemoryStream {
            data: Cursor::new(format!("{payload} guid={guid}").into_bytes()),
        }))
    }

    fn receive_snapshot(&self, dataset: &str, snapshot: &str) -> Result<Box<dyn SnapshotSink>> {
        let target = snapshot_path(dataset, snapshot);
        let _guard = self.enter(Op::Receive, &target)?;
        Ok(Box::new(MemorySink {
            zfs: self.clone(),
            dataset: dataset.to_string(),
            target,
            received: Vec::new(),
        }))
    }

    fn get_property(&self, target: &str, key: &str) -> Result<String> {
        let _guard = self.enter(Op::GetProperty, target)?;
        if !self.exists(target) {
            return Err(missing(Op::GetProperty, target));
        }
        Ok(self.property(target, key).unwrap_or_else(|| "-".to_string()))
    }

    fn set_property(&self, target: &str, key: &str, value: &str) -> Result<()> {
        let _guard = self.enter(Op::SetProperty, &format!("{key}={value} {target}"))?;
        if !self.exists(target) {
            return Err(missing(Op::SetProperty, target));
        }
        self.lock()
            .properties
            .entry(target.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

struct MemoryStream {
    data: Cursor<Vec<u8>>,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Finish for MemoryStream {
    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl SnapshotStream for MemoryStream {
    fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MemorySink {
    zfs: MemoryZfs,
    dataset: String,
    target: String,
    received: Vec<u8>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.received.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Finish for MemorySink {
    /// The snapshot only appears once the whole stream arrived, like `zfs recv`.
    fn finish(self: Box<Self>) -> Result<()> {
        let mut state = self.zfs.lock();
        if state
            .failures
            .iter()
            .any(|(op, needle)| *op == Op::Receive && self.target.contains(needle.as_str()))
        {
            return Err(failed(Op::Receive, &self.target, "injected failure"));
        }
        if self.received.is_empty() {
            return Err(failed(Op::Receive, &self.target, "invalid backup stream"));
        }
        let stream = String::from_utf8_lossy(&self.received);
        let guid = stream.rsplit_once("guid=").map_or("", |(_, g)| g).to_string();
        state.datasets.insert(self.dataset.clone());
        state.snapshots.insert(self.target.clone());
        state
            .properties
            .entry(self.target.clone())
            .or_default()
            .insert(GUID.to_string(), guid);
        Ok(())
    }
}

impl SnapshotSink for MemorySink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_modes() {
        let zfs = MemoryZfs::with_datasets(["tank", "tank/a", "tank/a/b", "tank/ab", "other/a"]);

        assert_eq!(zfs.list("tank/a", DatasetKind::Filesystem, false).unwrap(), vec!["tank/a"]);
        assert_eq!(
            zfs.list("tank/a", DatasetKind::Filesystem, true).unwrap(),
            vec!["tank/a", "tank/a/b"]
        );
        assert_eq!(
            zfs.list("*/a*", DatasetKind::Filesystem, false).unwrap(),
            vec!["other/a", "tank/a", "tank/a/b", "tank/ab"]
        );
        assert!(zfs.list("tank/missing", DatasetKind::Filesystem, false).is_err());
    }

    #[test]
    fn test_receive_commits_on_finish() {
        let zfs = MemoryZfs::new();
        let mut sink = zfs.receive_snapshot("backup/x", "2024-06-15T12:00").unwrap();
        assert!(!zfs.has_snapshot("backup/x@2024-06-15T12:00"));
        sink.write_all(b"bytes").unwrap();
        sink.finish().unwrap();
        assert!(zfs.has_snapshot("backup/x@2024-06-15T12:00"));
        assert_eq!(zfs.mutations(), vec!["recv backup/x@2024-06-15T12:00"]);
    }

    #[test]
    fn test_guid_travels_with_stream() {
        let src = MemoryZfs::with_datasets(["tank/a"]);
        let dst = MemoryZfs::new();
        src.create_snapshot("tank/a", "zbackup_curr").unwrap();

        let mut stream = src.send_snapshot("tank/a", "zbackup_curr", None).unwrap();
        let mut sink = dst.receive_snapshot("backup/a", "2024-06-15T12:00").unwrap();
        io::copy(&mut stream, &mut sink).unwrap();
        sink.finish().unwrap();
        stream.finish().unwrap();

        let sent = src.property("tank/a@zbackup_curr", GUID).unwrap();
        assert!(!sent.is_empty());
        assert_eq!(dst.property("backup/a@2024-06-15T12:00", GUID), Some(sent));
    }

    #[test]
    fn test_every_call_releases_the_pool() {
        let zfs = MemoryZfs::with_datasets(["tank/a"]);
        let worker = zfs.clone();
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            worker.create_snapshot("tank/a", "zbackup_curr").unwrap();
            let exists = worker.exists_snapshot("tank/a", "zbackup_curr").unwrap();
            let guid = worker.get_property("tank/a@zbackup_curr", GUID).unwrap();
            worker.set_property("tank/a", "readonly", "on").unwrap();
            let listed = worker.list("tank/a", DatasetKind::Snapshot, true).unwrap();
            worker.destroy("tank/a@zbackup_curr").unwrap();
            done.send((exists, guid, listed)).unwrap();
        });

        let (exists, guid, listed) = finished.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(exists);
        assert!(!guid.is_empty());
        assert_eq!(listed, vec!["tank/a@zbackup_curr"]);
        assert_eq!(zfs.lock().in_flight, 0);
    }

    #[test]
    fn test_injected_failure() {
        let zfs = MemoryZfs::with_datasets(["tank/a"]);
        zfs.fail_on(Op::Create, "tank/a@");
        assert!(zfs.create_snapshot("tank/a", "zbackup_curr").is_err());
        assert!(zfs.snapshots_of("tank/a").is_empty());
    }
}
