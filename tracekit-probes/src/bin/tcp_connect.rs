//! tcp_v4_connect tracing
//!
//! The entry probe stashes the socket pointer per thread; the return probe
//! picks it up, and for connects that returned 0 reads the destination from
//! `struct sock` and submits a ConnectEvent.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_probe_read_kernel},
    macros::{kprobe, kretprobe, map},
    maps::{HashMap, RingBuf},
    programs::{ProbeContext, RetProbeContext},
};
use tracekit_common::{ConnectEvent, EVENTS_LOST_KEY, RING_BUF_SIZE, TASK_COMM_LEN};

const MAX_PENDING_CONNECTS: u32 = 10240;

/// Leading fields of the kernel's `struct sock_common`
#[repr(C)]
struct SockCommon {
    skc_daddr: u32,
    skc_rcv_saddr: u32,
    skc_hash: u32,
    skc_dport: u16,
    skc_num: u16,
}

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

#[map]
static EVENTS_LOST: HashMap<u32, u64> = HashMap::with_max_entries(1, 0);

#[map]
static CONNECT_SOCKETS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_PENDING_CONNECTS, 0);

#[kprobe]
pub fn tcp_connect_entry(ctx: ProbeContext) -> u32 {
    let Some(sk) = ctx.arg::<u64>(0) else {
        return 0;
    };
    let tid = bpf_get_current_pid_tgid() as u32;
    let _ = CONNECT_SOCKETS.insert(&tid, &sk, 0);
    0
}

#[kretprobe]
pub fn tcp_connect_return(ctx: RetProbeContext) -> u32 {
    match try_connect_return(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_connect_return(ctx: &RetProbeContext) -> Result<u32, i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let tid = pid_tgid as u32;

    // SAFETY: the value is copied out before the entry is removed.
    let sk = match unsafe { CONNECT_SOCKETS.get(&tid) } {
        Some(sk) => *sk,
        None => return Ok(0), // missed entry
    };
    let _ = CONNECT_SOCKETS.remove(&tid);

    let ret: i32 = ctx.ret().unwrap_or(-1);
    if ret != 0 {
        return Ok(0);
    }

    // SAFETY: sk came from the kernel's own tcp_v4_connect argument.
    let common = unsafe { bpf_probe_read_kernel(sk as *const SockCommon) }?;

    let Some(mut entry) = EVENTS.reserve::<ConnectEvent>(0) else {
        count_lost();
        return Ok(0);
    };
    entry.write(ConnectEvent {
        pid: (pid_tgid >> 32) as u32,
        comm: bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN]),
        daddr: common.skc_daddr.to_ne_bytes(),
        dport: common.skc_dport,
        _padding: 0,
    });
    entry.submit(0);
    Ok(0)
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
