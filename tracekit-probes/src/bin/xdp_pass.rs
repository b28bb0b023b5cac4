//! Minimal XDP program: passes every packet and logs its length through
//! aya-log. Used to check that attach/detach works on an interface.

#![no_std]
#![no_main]

use aya_ebpf::{bindings::xdp_action, macros::xdp, programs::XdpContext};
use aya_log_ebpf::debug;

#[xdp]
pub fn xdp_pass(ctx: XdpContext) -> u32 {
    debug!(&ctx, "packet len={}", ctx.data_end() - ctx.data());
    xdp_action::XDP_PASS
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
