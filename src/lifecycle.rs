//! Session lifecycle: attach, run until shutdown, clean up exactly once
//!
//! ```text
//! Idle -> Attaching -> Running -> Detaching -> Stopped
//!             |           |
//!             +-----------+-----> Failed
//! ```
//!
//! The failed path runs the same cleanup as detaching: stop and join the
//! reader, drain buffered frames, detach every live handle.

use crate::config::{OutputSpec, ProbeSpec};
use crate::ebpf::events::{decode, RecordShape};
use crate::ebpf::loader::{AttachmentHandle, AttachmentManager};
use crate::ebpf::maps::{snapshot, CounterSnapshot};
use crate::ebpf::ringbuf::{ConsumerHandle, ReaderStats, RingBufferConsumer};
use crate::ebpf::symbols::SymbolResolver;
use crate::ebpf::ProbeBackend;
use crate::output::EventSink;
use crate::{Result, TracekitError};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Attaching,
    Running,
    Detaching,
    Stopped,
    Failed,
}

impl SessionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Attaching => "attaching",
            SessionState::Running => "running",
            SessionState::Detaching => "detaching",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a finished session did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Frames decoded and written to the sink
    pub events: u64,
    /// Frames skipped because they did not match the record shape
    pub malformed: u64,
    /// `primary -> fallback (entry point)` for every attachment that used
    /// its fallback symbol
    pub fallbacks: Vec<String>,
    pub reader: Option<ReaderStats>,
    /// Last snapshot of a counters session
    pub final_counters: Option<CounterSnapshot>,
    /// Records the kernel could not reserve, when the probe counts them
    pub lost_events: Option<u64>,
    /// Detach failures; reported, never fatal
    pub detach_errors: Vec<String>,
}

/// Process exit status for a session result
pub fn exit_status<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

type EventStream = (ConsumerHandle, mpsc::Receiver<Bytes>, RecordShape);

/// One probe session over one opened program object
pub struct ProbeSession<B, R> {
    spec: ProbeSpec,
    manager: AttachmentManager<B, R>,
    handles: Vec<AttachmentHandle>,
    state: SessionState,
}

impl<B: ProbeBackend, R: SymbolResolver> ProbeSession<B, R> {
    pub fn new(spec: ProbeSpec, backend: B, resolver: R) -> Self {
        let load_params = spec.load;
        Self {
            spec,
            manager: AttachmentManager::new(backend, resolver, load_params),
            handles: Vec::new(),
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn backend(&self) -> &B {
        self.manager.backend()
    }

    /// Attach every declared point, stream output until `shutdown`
    /// resolves, then detach.
    pub async fn run<F>(&mut self, sink: &mut dyn EventSink, shutdown: F) -> Result<SessionReport>
    where
        F: Future<Output = ()>,
    {
        if self.state != SessionState::Idle {
            return Err(TracekitError::Configuration(format!(
                "session {} already {}",
                self.spec.name, self.state
            )));
        }

        let mut report = SessionReport::default();

        self.state = SessionState::Attaching;
        let stream = match self.attach_all(&mut report) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Session {} failed while attaching: {}", self.spec.name, e);
                self.state = SessionState::Failed;
                let _ = self.clean_up(None, sink, &mut report, false).await;
                return Err(e);
            }
        };

        self.state = SessionState::Running;
        info!("Session {} running, waiting for SIGINT/SIGTERM", self.spec.name);

        let (stream, outcome) = stream_until(stream, sink, shutdown, &mut report).await;

        let outcome = match outcome {
            Ok(()) => {
                self.state = SessionState::Detaching;
                self.clean_up(stream, sink, &mut report, true).await
            }
            Err(e) => {
                error!("Session {} failed while running: {}", self.spec.name, e);
                self.state = SessionState::Failed;
                let cleaned = self.clean_up(stream, sink, &mut report, false).await;
                // A reader that gave up knows why; otherwise keep the first error.
                match (e, cleaned) {
                    (
                        TracekitError::RingBuffer { .. },
                        Err(reader @ TracekitError::RingBuffer { .. }),
                    ) => Err(reader),
                    (e, _) => Err(e),
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.state = SessionState::Stopped;
                info!(
                    "Session {} stopped: {} events, {} malformed",
                    self.spec.name, report.events, report.malformed
                );
                Ok(report)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    fn attach_all(&mut self, report: &mut SessionReport) -> Result<Option<EventStream>> {
        for point in &self.spec.attach {
            let handle = self.manager.attach(point)?;
            if let Some(primary) = handle.fallback_from() {
                report.fallbacks.push(format!(
                    "{} -> {} ({})",
                    primary,
                    handle.target(),
                    handle.entry_point()
                ));
            }
            self.handles.push(handle);
        }

        match &self.spec.output {
            OutputSpec::Events {
                map,
                record,
                channel_capacity,
                ..
            } => {
                let source = self.manager.backend_mut().take_frame_source(map)?;
                let (consumer, rx) = RingBufferConsumer::start(map, source, *channel_capacity);
                Ok(Some((consumer, rx, RecordShape::new(*record))))
            }
            OutputSpec::Counters { .. } | OutputSpec::None => Ok(None),
        }
    }

    /// Stop the reader, drain, detach, then take final readings
    async fn clean_up(
        &mut self,
        stream: Option<EventStream>,
        sink: &mut dyn EventSink,
        report: &mut SessionReport,
        graceful: bool,
    ) -> Result<()> {
        let mut outcome = Ok(());

        if let Some((consumer, mut rx, shape)) = stream {
            match consumer.stop().await {
                Ok(stats) => report.reader = Some(stats),
                Err(e) => {
                    warn!("{}", e);
                    outcome = Err(e);
                }
            }

            let mut drained = 0u64;
            while let Ok(frame) = rx.try_recv() {
                drained += 1;
                if let Err(e) = consume_frame(&frame, &shape, sink, report) {
                    warn!("Dropping remaining frames: {}", e);
                    break;
                }
            }
            if drained > 0 {
                debug!("Drained {} buffered frames", drained);
            }
        }

        for handle in self.handles.iter_mut() {
            if let Err(e) = self.manager.detach(handle) {
                warn!("{}", e);
                report.detach_errors.push(e.to_string());
            }
        }
        self.handles.clear();

        match &self.spec.output {
            OutputSpec::Counters { map, header, unit } if graceful && outcome.is_ok() => {
                match snapshot(self.manager.backend(), map) {
                    Ok(counters) => {
                        if let Err(e) = sink.counters(header, unit, &counters) {
                            outcome = Err(e.into());
                        }
                        report.final_counters = Some(counters);
                    }
                    Err(e) => outcome = Err(e),
                }
            }
            OutputSpec::Events {
                lost_counter: Some(map),
                ..
            } => match snapshot(self.manager.backend(), map) {
                Ok(lost) => {
                    let total = lost.total();
                    if total > 0 {
                        warn!("Kernel could not reserve {} records ({})", total, map);
                    }
                    report.lost_events = Some(total);
                }
                Err(e) => debug!("Lost-event counter unavailable: {}", e),
            },
            _ => {}
        }

        outcome
    }
}

/// Forward frames to the sink until `shutdown` resolves or the reader stops
async fn stream_until<F>(
    mut stream: Option<EventStream>,
    sink: &mut dyn EventSink,
    shutdown: F,
    report: &mut SessionReport,
) -> (Option<EventStream>, Result<()>)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let shape = stream.as_ref().map(|(_, _, shape)| *shape);

    let outcome = loop {
        let next_frame = async {
            match stream.as_mut() {
                Some((_, rx, _)) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break Ok(());
            }
            frame = next_frame => match (frame, &shape) {
                (Some(frame), Some(shape)) => {
                    if let Err(e) = consume_frame(&frame, shape, sink, report) {
                        break Err(e);
                    }
                }
                _ => {
                    let map = stream
                        .as_ref()
                        .map(|(consumer, _, _)| consumer.map().to_string())
                        .unwrap_or_default();
                    break Err(TracekitError::RingBuffer {
                        map,
                        reason: "reader stopped unexpectedly".to_string(),
                    });
                }
            },
        }
    };

    (stream, outcome)
}

/// Decode one frame and hand it to the sink. Malformed frames are skipped.
fn consume_frame(
    frame: &[u8],
    shape: &RecordShape,
    sink: &mut dyn EventSink,
    report: &mut SessionReport,
) -> Result<()> {
    match decode(frame, shape) {
        Ok(event) => {
            sink.event(shape.kind, &event)?;
            report.events += 1;
        }
        Err(e) => {
            warn!("Skipping frame: {}", e);
            report.malformed += 1;
        }
    }
    Ok(())
}
