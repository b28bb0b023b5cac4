#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracekit::config::{LoadParams, ProbeKind};
use tracekit::ebpf::events::{DecodedEvent, RecordKind};
use tracekit::ebpf::maps::{CounterSnapshot, RawTable};
use tracekit::ebpf::ringbuf::FrameSource;
use tracekit::ebpf::{LinkId, ProbeBackend};
use tracekit::error::AttachFailure;
use tracekit::output::EventSink;
use tracekit::{Result, TracekitError};
use tracekit_common::{CHROOT_COMM_LEN, CHROOT_PATH_LEN};

pub type CallLog = Arc<Mutex<Vec<String>>>;

/// In-memory kernel: records every call, serves canned tables and one
/// frame source
#[derive(Default)]
pub struct MockBackend {
    calls: CallLog,
    tables: HashMap<String, Vec<(Vec<u8>, Vec<u8>)>>,
    sources: HashMap<String, Box<dyn FrameSource>>,
    fail_attach: HashSet<String>,
    next_link: u64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    pub fn with_table(mut self, name: &str, entries: &[(u32, u64)]) -> Self {
        let raw = entries
            .iter()
            .map(|(k, v)| (k.to_ne_bytes().to_vec(), v.to_ne_bytes().to_vec()))
            .collect();
        self.tables.insert(name.to_string(), raw);
        self
    }

    pub fn with_frame_source(mut self, map: &str, source: impl FrameSource + 'static) -> Self {
        self.sources.insert(map.to_string(), Box::new(source));
        self
    }

    /// Make attaching `entry_point` fail as if the kernel refused it
    pub fn failing_attach(mut self, entry_point: &str) -> Self {
        self.fail_attach.insert(entry_point.to_string());
        self
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RawTable for MockBackend {
    fn raw_entries(&self, name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.record(format!("read {}", name));
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| TracekitError::Table {
                table: name.to_string(),
                reason: "map not found in object".to_string(),
            })
    }
}

impl ProbeBackend for MockBackend {
    fn load_program(&mut self, entry_point: &str, kind: ProbeKind, _params: &LoadParams) -> Result<()> {
        self.record(format!("load {} {}", entry_point, kind));
        Ok(())
    }

    fn attach_program(&mut self, entry_point: &str, _kind: ProbeKind, target: &str) -> Result<LinkId> {
        self.record(format!("attach {} {}", entry_point, target));
        if self.fail_attach.contains(entry_point) {
            return Err(TracekitError::Attach {
                entry_point: entry_point.to_string(),
                target: target.to_string(),
                kind: AttachFailure::SymbolRejected,
                reason: "Invalid argument (os error 22)".to_string(),
            });
        }
        self.next_link += 1;
        Ok(LinkId(self.next_link))
    }

    fn detach_program(&mut self, entry_point: &str, _link: LinkId) -> Result<()> {
        self.record(format!("detach {}", entry_point));
        Ok(())
    }

    fn unload_program(&mut self, entry_point: &str) -> Result<()> {
        self.record(format!("unload {}", entry_point));
        Ok(())
    }

    fn take_frame_source(&mut self, map: &str) -> Result<Box<dyn FrameSource>> {
        self.record(format!("take {}", map));
        self.sources
            .remove(map)
            .ok_or_else(|| TracekitError::RingBuffer {
                map: map.to_string(),
                reason: "map not found in object".to_string(),
            })
    }
}

/// Observers shared with a [`ScriptedSource`] after it is handed over
#[derive(Clone, Default)]
pub struct SourceWatch {
    /// Notified once every scripted batch has been returned
    pub exhausted: Arc<Notify>,
    dropped: Arc<AtomicBool>,
}

impl SourceWatch {
    /// Whether the reader let go of the source
    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Returns scripted batches, then blocks like an idle ring buffer
pub struct ScriptedSource {
    batches: VecDeque<io::Result<Vec<Bytes>>>,
    watch: SourceWatch,
}

impl ScriptedSource {
    pub fn new(batches: Vec<Vec<Vec<u8>>>) -> (Self, SourceWatch) {
        let batches = batches
            .into_iter()
            .map(|batch| Ok(batch.into_iter().map(Bytes::from).collect()))
            .collect();
        Self::from_results(batches)
    }

    pub fn from_results(batches: VecDeque<io::Result<Vec<Bytes>>>) -> (Self, SourceWatch) {
        let watch = SourceWatch::default();
        (
            Self {
                batches,
                watch: watch.clone(),
            },
            watch,
        )
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_batch(&mut self) -> io::Result<Vec<Bytes>> {
        match self.batches.pop_front() {
            Some(batch) => batch,
            None => {
                self.watch.exhausted.notify_one();
                std::future::pending().await
            }
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.watch.dropped.store(true, Ordering::SeqCst);
    }
}

/// Keeps everything a session writes
#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<(RecordKind, DecodedEvent)>,
    pub counters: Vec<(String, CounterSnapshot)>,
}

impl EventSink for RecordingSink {
    fn event(&mut self, record: RecordKind, event: &DecodedEvent) -> io::Result<()> {
        self.events.push((record, event.clone()));
        Ok(())
    }

    fn counters(&mut self, header: &str, _unit: &str, snapshot: &CounterSnapshot) -> io::Result<()> {
        self.counters.push((header.to_string(), snapshot.clone()));
        Ok(())
    }
}

pub fn symbols(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub fn chroot_frame(pid: u32, comm: &str, filename: &str) -> Vec<u8> {
    let mut frame = pid.to_le_bytes().to_vec();
    let mut field = [0u8; CHROOT_COMM_LEN];
    field[..comm.len()].copy_from_slice(comm.as_bytes());
    frame.extend_from_slice(&field);
    let mut field = [0u8; CHROOT_PATH_LEN];
    field[..filename.len()].copy_from_slice(filename.as_bytes());
    frame.extend_from_slice(&field);
    frame
}

/// Position of the first call starting with `prefix`
pub fn call_index(calls: &CallLog, prefix: &str) -> Option<usize> {
    calls
        .lock()
        .unwrap()
        .iter()
        .position(|call| call.starts_with(prefix))
}
