//! Checks run before any program object is opened

use crate::{Result, TracekitError};
use std::path::Path;
use tracing::{info, warn};

const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";
const BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

/// First release with BPF ring buffers
pub const MIN_RINGBUF_KERNEL: (u32, u32) = (5, 8);

/// Validate the system can run the probes of one session.
///
/// `require_ringbuf` turns an old kernel from a warning into an error.
pub fn run_preflight_checks(require_ringbuf: bool) -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version(require_ringbuf)?;
    check_btf();
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

fn check_kernel_version(require_ringbuf: bool) -> Result<()> {
    let release = std::fs::read_to_string(OSRELEASE_PATH).map_err(|e| {
        TracekitError::Configuration(format!("cannot read {}: {}", OSRELEASE_PATH, e))
    })?;
    let release = release.trim();
    let version = parse_kernel_version(release)?;

    if version < MIN_RINGBUF_KERNEL {
        let min_version = format!("{}.{}", MIN_RINGBUF_KERNEL.0, MIN_RINGBUF_KERNEL.1);
        if require_ringbuf {
            return Err(TracekitError::KernelVersionTooOld {
                version: release.to_string(),
                min_version,
            });
        }
        warn!(
            "Kernel {} predates {}; only table and ingress probes will work",
            release, min_version
        );
        return Ok(());
    }

    info!("Kernel version: {} (supported)", release);
    Ok(())
}

/// Parse `major.minor` out of a kernel release string such as `6.8.0-45-generic`
pub fn parse_kernel_version(release: &str) -> Result<(u32, u32)> {
    let invalid = || {
        TracekitError::Configuration(format!("could not parse kernel version: {}", release))
    };

    let mut parts = release.trim().split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(invalid)?;
    let minor = parts
        .next()
        .map(|p| p.split(|c: char| !c.is_ascii_digit()).next().unwrap_or(p))
        .and_then(|p| p.parse().ok())
        .ok_or_else(invalid)?;

    Ok((major, minor))
}

fn check_btf() {
    if !Path::new(BTF_PATH).exists() {
        warn!("BTF not found at {}", BTF_PATH);
        warn!("Some eBPF features may not work. Consider rebuilding kernel with CONFIG_DEBUG_INFO_BTF=y");
        return;
    }
    info!("BTF available");
}

fn check_capabilities() {
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!("Not running as root (euid={}). Ensure CAP_BPF, CAP_PERFMON and CAP_NET_ADMIN are granted.", euid);
    } else {
        info!("Running with root privileges");
    }
}
