pub mod events;
pub mod loader;
pub mod maps;
pub mod ringbuf;
pub mod symbols;

#[cfg(target_os = "linux")]
pub mod aya_backend;
#[cfg(target_os = "linux")]
pub mod preflight;

use crate::config::{LoadParams, ProbeKind};
use crate::Result;
use maps::RawTable;
use ringbuf::FrameSource;
use std::fmt;

/// Opaque identifier of one live kernel link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Kernel-facing operations on one opened program object
///
/// The attachment manager drives these in order (load, attach, detach,
/// unload); implementations do not track attachment policy themselves.
pub trait ProbeBackend: RawTable {
    /// Load `entry_point` into the kernel as a program of `kind`
    fn load_program(&mut self, entry_point: &str, kind: ProbeKind, params: &LoadParams)
        -> Result<()>;

    /// Attach a loaded program to a resolved symbol or an interface
    fn attach_program(&mut self, entry_point: &str, kind: ProbeKind, target: &str)
        -> Result<LinkId>;

    fn detach_program(&mut self, entry_point: &str, link: LinkId) -> Result<()>;

    fn unload_program(&mut self, entry_point: &str) -> Result<()>;

    /// Hand over the named ring buffer. Can only be taken once.
    fn take_frame_source(&mut self, map: &str) -> Result<Box<dyn FrameSource>>;
}
