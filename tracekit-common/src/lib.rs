//! Shared record layouts between eBPF (kernel) and userspace
//!
//! Every record here is:
//! - `#[repr(C)]` so the kernel writes exactly the bytes userspace expects
//! - `no_std` compatible for the probe crate
//! - mirrored by a byte-level decoder in userspace (the structs are never
//!   reinterpreted from raw frames there)

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Length of the kernel's `task_struct::comm`
pub const TASK_COMM_LEN: usize = 16;

/// Length of the process-name field in [`ChrootEvent`]
pub const CHROOT_COMM_LEN: usize = 128;

/// Length of the path field in [`ChrootEvent`]
pub const CHROOT_PATH_LEN: usize = 128;

/// Emitted by the chroot entry probe
///
/// Layout (260 bytes, 4-byte aligned):
/// - pid: Thread group id of the caller (little-endian)
/// - comm: Process name, NUL-terminated when shorter than the field
/// - filename: Requested root directory, NUL-terminated when shorter than the field
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct ChrootEvent {
    pub pid: u32,
    pub comm: [u8; CHROOT_COMM_LEN],
    pub filename: [u8; CHROOT_PATH_LEN],
}

/// Emitted by the TCP connect return probe for connects that succeeded
///
/// Layout (28 bytes, 4-byte aligned):
/// - pid: Thread group id of the caller (little-endian)
/// - comm: Process name
/// - daddr: Destination IPv4 address, network byte order
/// - dport: Destination port, network byte order
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct ConnectEvent {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub daddr: [u8; 4],
    pub dport: u16,
    pub _padding: u16,
}

/// Map names the probes export
pub mod maps {
    /// Ring buffer carrying event records
    pub const EVENTS: &str = "EVENTS";
    /// Counter of records the kernel failed to reserve (key 0)
    pub const EVENTS_LOST: &str = "EVENTS_LOST";
    /// Per-protocol drop counters of the XDP drop program
    pub const DROP_COUNT: &str = "dropcnt";
    /// Socket pointers stashed between connect entry and return
    pub const CONNECT_SOCKETS: &str = "CONNECT_SOCKETS";
}

/// Entry-point names inside the compiled objects
pub mod programs {
    pub const CHROOT_ENTRY: &str = "chroot_entry";
    /// Same record as [`CHROOT_ENTRY`], for the arch `__<arch>_sys_chroot` wrapper
    pub const CHROOT_ENTRY_WRAPPER: &str = "chroot_entry_wrapper";
    pub const TCP_CONNECT_ENTRY: &str = "tcp_connect_entry";
    pub const TCP_CONNECT_RETURN: &str = "tcp_connect_return";
    pub const XDP_DROP: &str = "xdp_drop";
    pub const XDP_PASS: &str = "xdp_pass";
}

/// Ring buffer size in bytes. 256KB holds ~1000 chroot records.
pub const RING_BUF_SIZE: u32 = 256 * 1024;

/// Key of the single slot in [`maps::EVENTS_LOST`]
pub const EVENTS_LOST_KEY: u32 = 0;

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<ChrootEvent>() == 260,
        "ChrootEvent must be exactly 260 bytes"
    );
    assert!(
        core::mem::align_of::<ChrootEvent>() == 4,
        "ChrootEvent must be 4-byte aligned"
    );
};

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<ConnectEvent>() == 28,
        "ConnectEvent must be exactly 28 bytes"
    );
    assert!(
        core::mem::align_of::<ConnectEvent>() == 4,
        "ConnectEvent must be 4-byte aligned"
    );
};
