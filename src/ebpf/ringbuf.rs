//! Ring buffer consumer
//!
//! A dedicated task waits for the kernel ring buffer to become readable and
//! forwards every frame, in commit order, into a bounded channel. A full
//! channel makes the task wait; frames are never dropped on the userspace
//! side while the session runs. Frames still held by the task when it is
//! cancelled are pushed into whatever channel space is left and the rest
//! are counted in [`ReaderStats::discarded`]. Decoding happens on the
//! receiving end.

use crate::{Result, TracekitError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on frames taken from the kernel per wakeup
pub const MAX_BATCH_SIZE: usize = 1024;

/// Consecutive poll failures after which the reader gives up
pub const MAX_POLL_FAILURES: u32 = 8;

const POLL_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Where raw frames come from
#[async_trait]
pub trait FrameSource: Send {
    /// Wait until at least one frame may be available, then return what
    /// is there. An empty batch is allowed and simply polled again.
    async fn next_batch(&mut self) -> io::Result<Vec<Bytes>>;
}

/// Counters reported by the reader task when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub frames: u64,
    pub batches: u64,
    /// Frames taken from the kernel that never reached the channel
    pub discarded: u64,
}

pub struct RingBufferConsumer;

impl RingBufferConsumer {
    /// Spawn the reader task for `map`
    pub fn start(
        map: &str,
        source: Box<dyn FrameSource>,
        capacity: usize,
    ) -> (ConsumerHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_loop(
            map.to_string(),
            source,
            tx,
            cancel.child_token(),
        ));
        debug!("Started ring buffer reader for {} (capacity {})", map, capacity);

        (
            ConsumerHandle {
                map: map.to_string(),
                cancel,
                task,
            },
            rx,
        )
    }
}

/// Owner of a running reader task
pub struct ConsumerHandle {
    map: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<ReaderStats>>,
}

impl ConsumerHandle {
    pub fn map(&self) -> &str {
        &self.map
    }

    /// Whether the reader has exited on its own (poll failures, receiver gone)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the reader and wait for it to exit
    pub async fn stop(self) -> Result<ReaderStats> {
        self.cancel.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TracekitError::RingBuffer {
                map: self.map,
                reason: format!("reader task failed: {}", e),
            }),
        }
    }
}

async fn read_loop(
    map: String,
    mut source: Box<dyn FrameSource>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<ReaderStats> {
    let mut stats = ReaderStats::default();
    let mut failures = 0u32;

    'poll: loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = source.next_batch() => batch,
        };

        let frames = match batch {
            Ok(frames) => {
                failures = 0;
                frames
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Ring buffer {} poll error ({}/{}): {}",
                    map, failures, MAX_POLL_FAILURES, e
                );
                if failures >= MAX_POLL_FAILURES {
                    return Err(TracekitError::RingBuffer {
                        map,
                        reason: format!("giving up after {} poll errors: {}", failures, e),
                    });
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                }
            }
        };

        if frames.is_empty() {
            continue;
        }
        stats.batches += 1;

        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    hand_off_remaining(&tx, frame, &mut frames, &mut stats);
                    break 'poll;
                }
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("Receiver for {} closed, reader exiting", map);
                        stats.discarded += 1 + frames.len() as u64;
                        break 'poll;
                    }
                },
            };
            permit.send(frame);
            stats.frames += 1;
        }
    }

    if stats.discarded > 0 {
        warn!(
            "Ring buffer {}: {} frames read from the kernel were discarded on exit",
            map, stats.discarded
        );
    }
    debug!(
        "Ring buffer reader for {} exited after {} frames in {} batches",
        map, stats.frames, stats.batches
    );
    Ok(stats)
}

/// Queue what is left of a batch without waiting, count what does not fit
fn hand_off_remaining(
    tx: &mpsc::Sender<Bytes>,
    first: Bytes,
    rest: &mut impl Iterator<Item = Bytes>,
    stats: &mut ReaderStats,
) {
    for frame in std::iter::once(first).chain(rest) {
        match tx.try_send(frame) {
            Ok(()) => stats.frames += 1,
            Err(_) => stats.discarded += 1,
        }
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::RingBufSource;

#[cfg(target_os = "linux")]
mod linux {
    use super::{FrameSource, MAX_BATCH_SIZE};
    use async_trait::async_trait;
    use aya::maps::{MapData, RingBuf};
    use bytes::Bytes;
    use std::io;
    use tokio::io::unix::AsyncFd;

    /// BPF ring buffer map driven by epoll readiness
    pub struct RingBufSource {
        fd: AsyncFd<RingBuf<MapData>>,
    }

    impl RingBufSource {
        pub fn new(ring: RingBuf<MapData>) -> io::Result<Self> {
            Ok(Self {
                fd: AsyncFd::new(ring)?,
            })
        }
    }

    #[async_trait]
    impl FrameSource for RingBufSource {
        async fn next_batch(&mut self) -> io::Result<Vec<Bytes>> {
            let mut guard = self.fd.readable_mut().await?;
            let ring = guard.get_inner_mut();

            let mut frames = Vec::new();
            while frames.len() < MAX_BATCH_SIZE {
                match ring.next() {
                    Some(item) => frames.push(Bytes::copy_from_slice(&item)),
                    None => break,
                }
            }

            // Leave readiness set when capped so the rest is read next call.
            if frames.len() < MAX_BATCH_SIZE {
                guard.clear_ready();
            }
            Ok(frames)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Yields queued results, then waits forever
    struct QueuedSource(VecDeque<io::Result<Vec<Bytes>>>);

    #[async_trait]
    impl FrameSource for QueuedSource {
        async fn next_batch(&mut self) -> io::Result<Vec<Bytes>> {
            match self.0.pop_front() {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn frames(values: &[&'static str]) -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from_static(v.as_bytes())).collect()
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order() {
        let source = QueuedSource(VecDeque::from(vec![
            Ok(frames(&["a", "b"])),
            Ok(Vec::new()),
            Ok(frames(&["c"])),
        ]));
        let (handle, mut rx) = RingBufferConsumer::start("EVENTS", Box::new(source), 8);

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, frames(&["a", "b", "c"]));

        let stats = handle.stop().await.unwrap();
        assert_eq!(stats, ReaderStats {
                frames: 3,
                batches: 2,
                discarded: 0
            });
    }

    #[tokio::test]
    async fn test_full_channel_waits_instead_of_dropping() {
        let source = QueuedSource(VecDeque::from(vec![Ok(frames(&["1", "2", "3", "4", "5"]))]));
        let (handle, mut rx) = RingBufferConsumer::start("EVENTS", Box::new(source), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut received = Vec::new();
        while received.len() < 5 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, frames(&["1", "2", "3", "4", "5"]));
        assert_eq!(handle.stop().await.unwrap().frames, 5);
    }

    #[tokio::test]
    async fn test_stop_while_blocked_on_send() {
        let source = QueuedSource(VecDeque::from(vec![Ok(frames(&["x", "y", "z"]))]));
        let (handle, mut rx) = RingBufferConsumer::start("EVENTS", Box::new(source), 1);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"x"));
        let stats = tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("reader did not exit")
            .unwrap();
        assert_eq!(stats.frames + stats.discarded, 3);
    }

    #[tokio::test]
    async fn test_stop_mid_batch_accounts_for_every_frame() {
        let batch = frames(&["1", "2", "3", "4", "5"]);
        let source = QueuedSource(VecDeque::from(vec![Ok(batch)]));
        let (handle, mut rx) = RingBufferConsumer::start("EVENTS", Box::new(source), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first, Bytes::from_static(b"1"));
        let stats = handle.stop().await.unwrap();

        let mut drained = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            drained.push(frame);
        }
        assert_eq!(drained, frames(&["2"]));
        assert_eq!(
            stats,
            ReaderStats {
                frames: 2,
                batches: 1,
                discarded: 3
            }
        );
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_data() {
        let source = QueuedSource(VecDeque::new());
        let (handle, _rx) = RingBufferConsumer::start("EVENTS", Box::new(source), 4);

        assert!(!handle.is_finished());
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats, ReaderStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_poll_errors() {
        let errors = (0..MAX_POLL_FAILURES)
            .map(|_| Err(io::Error::new(io::ErrorKind::Other, "epoll failed")))
            .collect();
        let source = Box::new(QueuedSource(errors));
        let (handle, mut rx) = RingBufferConsumer::start("EVENTS", source, 4);

        assert!(rx.recv().await.is_none());
        let err = handle.stop().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("EVENTS"));
        assert!(message.contains("giving up after 8 poll errors"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_then_recovery() {
        let source = QueuedSource(VecDeque::from(vec![
            Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted")),
            Ok(frames(&["ok"])),
        ]));
        let (handle, mut rx) = RingBufferConsumer::start("EVENTS", Box::new(source), 4);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(handle.stop().await.unwrap().frames, 1);
    }
}
