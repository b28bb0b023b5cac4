//! Graceful shutdown on SIGINT or SIGTERM

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

/// Both termination signals, registered up front so a signal arriving
/// while probes are being attached is not lost
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first of SIGINT or SIGTERM
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => debug!("Received SIGINT"),
            _ = self.terminate.recv() => debug!("Received SIGTERM"),
        }
    }
}
