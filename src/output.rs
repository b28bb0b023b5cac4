//! Trace output written to stdout
//!
//! Only trace lines go here; diagnostics go through `tracing` to stderr.

use crate::ebpf::events::{DecodedEvent, RecordKind};
use crate::ebpf::maps::CounterSnapshot;
use std::io::{self, Write};

/// Destination for what a session produces
pub trait EventSink {
    fn event(&mut self, record: RecordKind, event: &DecodedEvent) -> io::Result<()>;

    /// Final snapshot of a counter table. Zero counters are not shown.
    fn counters(&mut self, header: &str, unit: &str, snapshot: &CounterSnapshot) -> io::Result<()>;
}

/// One line per event, flushed as it is written
pub struct LineSink<W: Write> {
    out: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl LineSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> EventSink for LineSink<W> {
    fn event(&mut self, record: RecordKind, event: &DecodedEvent) -> io::Result<()> {
        match record {
            RecordKind::Chroot => writeln!(
                self.out,
                "pid {} application {} called chroot(2) on {}",
                event.pid, event.comm, event.arg
            )?,
            RecordKind::TcpConnect => writeln!(
                self.out,
                "pid {} ({}) connected to {}",
                event.pid, event.comm, event.arg
            )?,
        }
        self.out.flush()
    }

    fn counters(&mut self, header: &str, unit: &str, snapshot: &CounterSnapshot) -> io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "{}", header)?;
        for (key, value) in snapshot.non_zero() {
            writeln!(self.out, "{}: {} {}", key, value, unit)?;
        }
        self.out.flush()
    }
}
