//! Kernel backend built on aya

use super::maps::RawTable;
use super::ringbuf::{FrameSource, RingBufSource};
use super::{LinkId, ProbeBackend};
use crate::config::{LoadParams, ProbeKind};
use crate::error::AttachFailure;
use crate::{Result, TracekitError};
use aya::maps::{HashMap as AyaHashMap, MapData, RingBuf};
use aya::programs::{
    kprobe::KProbeLinkId, xdp::XdpLinkId, KProbe, ProbeKind as AyaProbeKind, Program,
    ProgramError, Xdp, XdpFlags,
};
use aya::{Ebpf, EbpfLoader, VerifierLogLevel};
use aya_log::EbpfLogger;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

enum AyaLink {
    Probe(KProbeLinkId),
    Ingress(XdpLinkId),
}

/// One opened program object
pub struct AyaBackend {
    ebpf: Ebpf,
    links: HashMap<LinkId, AyaLink>,
    next_link: u64,
}

impl AyaBackend {
    /// Read and parse a compiled object. Programs are not loaded yet.
    pub fn open(path: &Path, params: &LoadParams) -> Result<Self> {
        info!("Opening program object {}", path.display());

        let data = std::fs::read(path).map_err(|source| TracekitError::ProgramSource {
            path: path.to_path_buf(),
            source,
        })?;

        let ebpf = EbpfLoader::new()
            .verifier_log_level(verifier_log_level(params.log_level))
            .load(&data)
            .map_err(|e| TracekitError::Load {
                entry_point: path.display().to_string(),
                reason: cap_log(e.to_string(), params.log_size),
            })?;

        Ok(Self {
            ebpf,
            links: HashMap::new(),
            next_link: 0,
        })
    }

    /// Forward kernel-side log records to tracing, when the object has any
    pub fn init_logger(&mut self) {
        if let Err(e) = EbpfLogger::init(&mut self.ebpf) {
            warn!(
                "Failed to initialize EbpfLogger: {}. eBPF probe logs will not be visible.",
                e
            );
        }
    }

    fn kprobe(&mut self, entry_point: &str) -> std::result::Result<&mut KProbe, String> {
        let program = self
            .ebpf
            .program_mut(entry_point)
            .ok_or_else(|| String::from("program not found in object"))?;
        program.try_into().map_err(|e: ProgramError| e.to_string())
    }

    fn xdp(&mut self, entry_point: &str) -> std::result::Result<&mut Xdp, String> {
        let program = self
            .ebpf
            .program_mut(entry_point)
            .ok_or_else(|| String::from("program not found in object"))?;
        program.try_into().map_err(|e: ProgramError| e.to_string())
    }
}

impl ProbeBackend for AyaBackend {
    fn load_program(
        &mut self,
        entry_point: &str,
        kind: ProbeKind,
        params: &LoadParams,
    ) -> Result<()> {
        let load_error = |reason: String| TracekitError::Load {
            entry_point: entry_point.to_string(),
            reason: cap_log(reason, params.log_size),
        };

        let loaded = match kind {
            ProbeKind::EntryProbe | ProbeKind::ReturnProbe => {
                let probe = self.kprobe(entry_point).map_err(load_error)?;
                let kind_matches = match kind {
                    ProbeKind::ReturnProbe => matches!(probe.kind(), AyaProbeKind::KRetProbe),
                    _ => matches!(probe.kind(), AyaProbeKind::KProbe),
                };
                if !kind_matches {
                    return Err(load_error(format!(
                        "program is a {:?}, expected an {}",
                        probe.kind(),
                        kind
                    )));
                }
                probe.load()
            }
            ProbeKind::IngressProgram => self.xdp(entry_point).map_err(load_error)?.load(),
        };

        loaded.map_err(|e| load_error(e.to_string()))?;
        debug!("Loaded {} ({})", entry_point, kind);
        Ok(())
    }

    fn attach_program(
        &mut self,
        entry_point: &str,
        kind: ProbeKind,
        target: &str,
    ) -> Result<LinkId> {
        let attach_error = |kind: AttachFailure, reason: String| TracekitError::Attach {
            entry_point: entry_point.to_string(),
            target: target.to_string(),
            kind,
            reason,
        };

        let link = match kind {
            ProbeKind::EntryProbe | ProbeKind::ReturnProbe => {
                let probe = self
                    .kprobe(entry_point)
                    .map_err(|reason| attach_error(AttachFailure::SymbolRejected, reason))?;
                probe.attach(target, 0).map(AyaLink::Probe).map_err(|e| {
                    attach_error(classify(&e, AttachFailure::SymbolRejected), e.to_string())
                })?
            }
            ProbeKind::IngressProgram => {
                let xdp = self
                    .xdp(entry_point)
                    .map_err(|reason| attach_error(AttachFailure::InterfaceNotFound, reason))?;
                xdp.attach(target, XdpFlags::default())
                    .map(AyaLink::Ingress)
                    .map_err(|e| {
                        attach_error(classify(&e, AttachFailure::InterfaceNotFound), e.to_string())
                    })?
            }
        };

        self.next_link += 1;
        let id = LinkId(self.next_link);
        self.links.insert(id, link);
        Ok(id)
    }

    fn detach_program(&mut self, entry_point: &str, link: LinkId) -> Result<()> {
        let detach_error = |reason: String| TracekitError::Detach {
            entry_point: entry_point.to_string(),
            target: link.to_string(),
            reason,
        };

        match self.links.remove(&link) {
            Some(AyaLink::Probe(id)) => self
                .kprobe(entry_point)
                .map_err(detach_error)?
                .detach(id)
                .map_err(|e| detach_error(e.to_string())),
            Some(AyaLink::Ingress(id)) => self
                .xdp(entry_point)
                .map_err(detach_error)?
                .detach(id)
                .map_err(|e| detach_error(e.to_string())),
            None => Err(detach_error("unknown link".to_string())),
        }
    }

    fn unload_program(&mut self, entry_point: &str) -> Result<()> {
        let unload_error = |reason: String| TracekitError::Load {
            entry_point: entry_point.to_string(),
            reason,
        };

        let result = if matches!(self.ebpf.program(entry_point), Some(Program::KProbe(_))) {
            self.kprobe(entry_point).map_err(unload_error)?.unload()
        } else {
            self.xdp(entry_point).map_err(unload_error)?.unload()
        };
        result.map_err(|e| unload_error(format!("unload failed: {}", e)))?;
        debug!("Unloaded {}", entry_point);
        Ok(())
    }

    fn take_frame_source(&mut self, map: &str) -> Result<Box<dyn FrameSource>> {
        let ring_error = |reason: String| TracekitError::RingBuffer {
            map: map.to_string(),
            reason,
        };

        let available: Vec<_> = self.ebpf.maps().map(|(name, _)| name.to_string()).collect();
        let raw = self.ebpf.take_map(map).ok_or_else(|| {
            ring_error(format!("map not found in object. Available maps: {:?}", available))
        })?;
        let ring = RingBuf::try_from(raw).map_err(|e| ring_error(e.to_string()))?;
        let source = RingBufSource::new(ring).map_err(|e| ring_error(e.to_string()))?;
        Ok(Box::new(source))
    }
}

impl RawTable for AyaBackend {
    fn raw_entries(&self, name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let table_error = |reason: String| TracekitError::Table {
            table: name.to_string(),
            reason,
        };

        let map = self
            .ebpf
            .map(name)
            .ok_or_else(|| table_error("map not found in object".to_string()))?;
        let table: AyaHashMap<&MapData, [u8; 4], [u8; 8]> =
            AyaHashMap::try_from(map).map_err(|e| table_error(e.to_string()))?;

        table
            .iter()
            .map(|entry| {
                entry
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| table_error(e.to_string()))
            })
            .collect()
    }
}

fn verifier_log_level(level: u32) -> VerifierLogLevel {
    match level {
        0 => VerifierLogLevel::DISABLE,
        1 => VerifierLogLevel::DEBUG,
        _ => VerifierLogLevel::VERBOSE,
    }
}

/// Map an aya error to the attach failure it stands for
fn classify(error: &ProgramError, default: AttachFailure) -> AttachFailure {
    if matches!(error, ProgramError::UnknownInterface { .. }) {
        return AttachFailure::InterfaceNotFound;
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::PermissionDenied {
                return AttachFailure::PermissionDenied;
            }
        }
        source = err.source();
    }
    default
}

/// Keep at most `limit` bytes of verifier output
fn cap_log(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str(" [verifier log truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_log_keeps_short_text() {
        assert_eq!(cap_log("rejected".to_string(), 64), "rejected");
    }

    #[test]
    fn test_cap_log_truncates_on_char_boundary() {
        let capped = cap_log("ééé".to_string(), 3);
        assert!(capped.starts_with('é'));
        assert!(capped.ends_with("[verifier log truncated]"));
    }

    #[test]
    fn test_unknown_interface_classified() {
        let err = ProgramError::UnknownInterface {
            name: "nope0".to_string(),
        };
        assert_eq!(
            classify(&err, AttachFailure::SymbolRejected),
            AttachFailure::InterfaceNotFound
        );
    }

    #[test]
    fn test_open_missing_object_is_source_error() {
        let err = AyaBackend::open(Path::new("/nonexistent/chroot"), &LoadParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, TracekitError::ProgramSource { .. }));
        assert!(err.to_string().contains("/nonexistent/chroot"));
    }
}
