//! Probe session descriptors
//!
//! A [`ProbeSpec`] is built once at startup, either from the built-in
//! [`catalog`] or from a YAML file, and is never mutated afterwards.

use crate::ebpf::events::RecordKind;
use crate::{Result, TracekitError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default directory holding compiled probe objects
pub const DEFAULT_PROBES_DIR: &str = "/usr/lib/tracekit/probes";

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub const DEFAULT_LOG_SIZE: usize = 65536;

/// How a program hooks into the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Instrument function entry
    EntryProbe,
    /// Instrument function return, offset 0
    ReturnProbe,
    /// Run on a network interface's ingress path
    IngressProgram,
}

impl ProbeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::EntryProbe => "entry probe",
            ProbeKind::ReturnProbe => "return probe",
            ProbeKind::IngressProgram => "ingress program",
        }
    }

    /// Whether this kind attaches to a kernel symbol (as opposed to a device)
    pub const fn is_symbol_probe(&self) -> bool {
        matches!(self, ProbeKind::EntryProbe | ProbeKind::ReturnProbe)
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel symbol to instrument, with an optional documented alternate
///
/// The fallback is used when the primary is not exported by the running
/// kernel. It may cover a broader or differently-shaped entry point, so
/// using it is always reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTarget {
    pub primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl SymbolTarget {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachTarget {
    Symbol(SymbolTarget),
    Interface(String),
}

impl AttachTarget {
    /// Name used for logging and duplicate detection before resolution
    pub fn display_name(&self) -> &str {
        match self {
            AttachTarget::Symbol(symbol) => &symbol.primary,
            AttachTarget::Interface(device) => device,
        }
    }
}

/// One program entry point bound to one kernel hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachPoint {
    pub entry_point: String,
    pub kind: ProbeKind,
    pub target: AttachTarget,
    /// Program to attach instead when the target's fallback symbol is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_entry_point: Option<String>,
}

impl AttachPoint {
    pub fn entry(entry_point: impl Into<String>, symbol: SymbolTarget) -> Self {
        Self {
            entry_point: entry_point.into(),
            kind: ProbeKind::EntryProbe,
            target: AttachTarget::Symbol(symbol),
            fallback_entry_point: None,
        }
    }

    pub fn ret(entry_point: impl Into<String>, symbol: SymbolTarget) -> Self {
        Self {
            entry_point: entry_point.into(),
            kind: ProbeKind::ReturnProbe,
            target: AttachTarget::Symbol(symbol),
            fallback_entry_point: None,
        }
    }

    pub fn ingress(entry_point: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            kind: ProbeKind::IngressProgram,
            target: AttachTarget::Interface(device.into()),
            fallback_entry_point: None,
        }
    }

    pub fn with_fallback_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.fallback_entry_point = Some(entry_point.into());
        self
    }
}

/// Program load parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    /// Verifier log level: 0 off, 1 debug, 2 verbose
    #[serde(default)]
    pub log_level: u32,
    /// Bytes of verifier output kept when a load fails
    #[serde(default = "default_log_size")]
    pub log_size: usize,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            log_level: 0,
            log_size: DEFAULT_LOG_SIZE,
        }
    }
}

fn default_log_size() -> usize {
    DEFAULT_LOG_SIZE
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

/// What a running session produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputSpec {
    /// Stream decoded records from a ring buffer
    Events {
        map: String,
        record: RecordKind,
        #[serde(default = "default_channel_capacity")]
        channel_capacity: usize,
        /// Kernel-side counter of records that could not be reserved
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lost_counter: Option<String>,
    },
    /// Print a final snapshot of a counter table at shutdown
    Counters {
        map: String,
        header: String,
        unit: String,
    },
    /// Attach, wait for a signal, detach
    None,
}

/// Immutable descriptor of one tracing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub name: String,
    /// Compiled program object
    pub program: PathBuf,
    pub attach: Vec<AttachPoint>,
    #[serde(default)]
    pub load: LoadParams,
    pub output: OutputSpec,
}

impl ProbeSpec {
    /// Read a spec from a YAML file and validate it
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TracekitError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let spec: ProbeSpec =
            serde_yaml::from_str(&text).map_err(|source| TracekitError::SpecParse {
                path: path.to_path_buf(),
                source,
            })?;
        spec.validate()?;
        debug!("Loaded probe spec {} from {}", spec.name, path.display());
        Ok(spec)
    }

    /// Check the spec is internally consistent before anything touches the kernel
    pub fn validate(&self) -> Result<()> {
        if self.attach.is_empty() {
            return Err(self.invalid("no attach points declared"));
        }

        let mut seen = HashSet::new();
        for point in &self.attach {
            if point.entry_point.is_empty() {
                return Err(self.invalid("attach point with an empty entry point"));
            }
            match (&point.target, point.kind.is_symbol_probe()) {
                (AttachTarget::Symbol(symbol), true) if symbol.primary.is_empty() => {
                    return Err(self.invalid(&format!(
                        "{} has an empty symbol",
                        point.entry_point
                    )));
                }
                (AttachTarget::Interface(device), false) if device.is_empty() => {
                    return Err(self.invalid(&format!(
                        "{} has an empty interface name",
                        point.entry_point
                    )));
                }
                (AttachTarget::Symbol(_), true) | (AttachTarget::Interface(_), false) => {}
                _ => {
                    return Err(self.invalid(&format!(
                        "{} is an {} but targets {:?}",
                        point.entry_point, point.kind, point.target
                    )));
                }
            }
            if let Some(alternate) = &point.fallback_entry_point {
                let has_fallback = matches!(
                    &point.target,
                    AttachTarget::Symbol(SymbolTarget { fallback: Some(_), .. })
                );
                if alternate.is_empty() || !has_fallback {
                    return Err(self.invalid(&format!(
                        "{} names a fallback entry point but its target has no fallback symbol",
                        point.entry_point
                    )));
                }
            }
            if !seen.insert((point.target.display_name(), point.kind)) {
                return Err(self.invalid(&format!(
                    "{} {} is declared twice",
                    point.kind,
                    point.target.display_name()
                )));
            }
        }

        match &self.output {
            OutputSpec::Events {
                map,
                channel_capacity,
                lost_counter,
                ..
            } => {
                if map.is_empty() {
                    return Err(self.invalid("events output needs a map name"));
                }
                if *channel_capacity == 0 {
                    return Err(self.invalid("channel capacity must be at least 1"));
                }
                if lost_counter.as_deref() == Some("") {
                    return Err(self.invalid("lost counter map name is empty"));
                }
            }
            OutputSpec::Counters { map, .. } if map.is_empty() => {
                return Err(self.invalid("counters output needs a map name"));
            }
            OutputSpec::Counters { .. } | OutputSpec::None => {}
        }

        Ok(())
    }

    /// Whether any attach point needs kernel symbol resolution
    pub fn needs_symbols(&self) -> bool {
        self.attach.iter().any(|p| p.kind.is_symbol_probe())
    }

    fn invalid(&self, reason: &str) -> TracekitError {
        TracekitError::Configuration(format!("probe spec {}: {}", self.name, reason))
    }
}

/// Built-in probe sessions
pub mod catalog {
    use super::*;
    use tracekit_common::{maps, programs};

    /// Prefix the running architecture puts in front of syscall entry points
    #[cfg(target_arch = "x86_64")]
    pub const SYSCALL_PREFIX: &str = "__x64_sys_";
    #[cfg(target_arch = "aarch64")]
    pub const SYSCALL_PREFIX: &str = "__arm64_sys_";
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub const SYSCALL_PREFIX: &str = "sys_";

    /// `sys_<name>` with the arch-specific wrapper as fallback
    ///
    /// Newer kernels no longer export the bare `sys_*` handlers. The
    /// wrapper receives a `struct pt_regs *` instead of the syscall
    /// arguments, so attach points reading arguments pair this with a
    /// fallback entry point that unpacks them.
    pub fn syscall(name: &str) -> SymbolTarget {
        SymbolTarget::new(format!("sys_{}", name))
            .with_fallback(format!("{}{}", SYSCALL_PREFIX, name))
    }

    pub fn default_object(probe: &str) -> PathBuf {
        Path::new(DEFAULT_PROBES_DIR).join(probe)
    }

    /// chroot(2) callers, streamed as events
    pub fn chroot(program: PathBuf, channel_capacity: usize) -> ProbeSpec {
        ProbeSpec {
            name: "chroot".to_string(),
            program,
            attach: vec![
                AttachPoint::entry(programs::CHROOT_ENTRY, syscall("chroot"))
                    .with_fallback_entry_point(programs::CHROOT_ENTRY_WRAPPER),
            ],
            load: LoadParams::default(),
            output: OutputSpec::Events {
                map: maps::EVENTS.to_string(),
                record: RecordKind::Chroot,
                channel_capacity,
                lost_counter: Some(maps::EVENTS_LOST.to_string()),
            },
        }
    }

    /// Successful IPv4 TCP connects, streamed as events
    pub fn tcp_connect(program: PathBuf, channel_capacity: usize) -> ProbeSpec {
        let symbol = SymbolTarget::new("tcp_v4_connect");
        ProbeSpec {
            name: "tcp-connect".to_string(),
            program,
            attach: vec![
                AttachPoint::entry(programs::TCP_CONNECT_ENTRY, symbol.clone()),
                AttachPoint::ret(programs::TCP_CONNECT_RETURN, symbol),
            ],
            load: LoadParams::default(),
            output: OutputSpec::Events {
                map: maps::EVENTS.to_string(),
                record: RecordKind::TcpConnect,
                channel_capacity,
                lost_counter: Some(maps::EVENTS_LOST.to_string()),
            },
        }
    }

    /// Drop every packet arriving on `device`, report drops per protocol
    pub fn xdp_drop(program: PathBuf, device: &str) -> ProbeSpec {
        ProbeSpec {
            name: "xdp-drop".to_string(),
            program,
            attach: vec![AttachPoint::ingress(programs::XDP_DROP, device)],
            load: LoadParams {
                log_level: 1,
                log_size: DEFAULT_LOG_SIZE,
            },
            output: OutputSpec::Counters {
                map: maps::DROP_COUNT.to_string(),
                header: "{IP protocol-number}: {total dropped pkts}".to_string(),
                unit: "pkts".to_string(),
            },
        }
    }

    /// Attach a pass-through ingress program to `device` until interrupted
    pub fn xdp_attach(program: PathBuf, device: &str) -> ProbeSpec {
        ProbeSpec {
            name: "xdp-attach".to_string(),
            program,
            attach: vec![AttachPoint::ingress(programs::XDP_PASS, device)],
            load: LoadParams::default(),
            output: OutputSpec::None,
        }
    }
}
