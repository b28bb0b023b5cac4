//! chroot(2) entry probe
//!
//! Records pid, process name and requested root for every chroot call and
//! submits them on the EVENTS ring buffer. Reservation failures are counted
//! in EVENTS_LOST so userspace can report them.
//!
//! `chroot_entry` hooks `sys_chroot` directly. Kernels that only export the
//! arch wrapper (`__x64_sys_chroot`, `__arm64_sys_chroot`) pass it a pointer
//! to the user `pt_regs`; `chroot_entry_wrapper` unpacks the path from there.

#![no_std]
#![no_main]

use aya_ebpf::{
    args::PtRegs,
    bindings::pt_regs,
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_user_str_bytes},
    macros::{kprobe, map},
    maps::{HashMap, RingBuf},
    programs::ProbeContext,
};
use tracekit_common::{
    ChrootEvent, CHROOT_COMM_LEN, CHROOT_PATH_LEN, EVENTS_LOST_KEY, RING_BUF_SIZE, TASK_COMM_LEN,
};

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

#[map]
static EVENTS_LOST: HashMap<u32, u64> = HashMap::with_max_entries(1, 0);

#[kprobe]
pub fn chroot_entry(ctx: ProbeContext) -> u32 {
    match ctx.arg::<*const u8>(0) {
        Some(filename) => record_chroot(filename),
        None => 0,
    }
}

#[kprobe]
pub fn chroot_entry_wrapper(ctx: ProbeContext) -> u32 {
    let Some(regs) = ctx.arg::<*mut pt_regs>(0) else {
        return 0;
    };
    // PtRegs reads through bpf_probe_read, which accepts the kernel pointer.
    match PtRegs::new(regs).arg::<*const u8>(0) {
        Some(filename) => record_chroot(filename),
        None => 0,
    }
}

fn record_chroot(filename: *const u8) -> u32 {
    let Some(mut entry) = EVENTS.reserve::<ChrootEvent>(0) else {
        count_lost();
        return 0;
    };

    let event = entry.as_mut_ptr();
    // SAFETY: the reservation is sized for ChrootEvent and owned until submit.
    unsafe {
        (*event).pid = (bpf_get_current_pid_tgid() >> 32) as u32;
        (*event).comm = [0; CHROOT_COMM_LEN];
        (*event).filename = [0; CHROOT_PATH_LEN];

        if let Ok(comm) = bpf_get_current_comm() {
            (*event).comm[..TASK_COMM_LEN].copy_from_slice(&comm);
        }
        // A failed read leaves an empty path rather than dropping the event.
        let _ = bpf_probe_read_user_str_bytes(filename, &mut (*event).filename);
    }

    entry.submit(0);
    0
}

fn count_lost() {
    match EVENTS_LOST.get_ptr_mut(&EVENTS_LOST_KEY) {
        // SAFETY: map values stay valid for the duration of the program.
        Some(lost) => unsafe { *lost += 1 },
        None => {
            let _ = EVENTS_LOST.insert(&EVENTS_LOST_KEY, &1, 0);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
