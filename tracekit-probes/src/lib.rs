//! eBPF probes for tracekit
//!
//! Kernel-side programs loaded by the `tracekit` userspace tool:
//! - chroot(2) entry probe (ring buffer events)
//! - tcp_v4_connect entry/return probe pair (ring buffer events)
//! - XDP drop counter (per-protocol table)
//! - XDP pass-through program
//!
//! Record layouts come from `tracekit-common`. Each program lives in
//! src/bin/ and builds to its own object for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo +nightly build --release --target bpfel-unknown-none -Z build-std=core
//! ```

#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
