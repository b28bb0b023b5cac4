//! XDP program that drops every incoming packet and counts drops per IP
//! protocol number in `dropcnt`. Non-IP frames are counted under key 0.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::HashMap,
    programs::XdpContext,
};
use core::sync::atomic::{AtomicU64, Ordering};

const ETH_HDR_LEN: usize = 14;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
/// Offset of the protocol byte in an IPv4 header
const IPV4_PROTO_OFFSET: usize = 9;
/// Offset of the next-header byte in an IPv6 header
const IPV6_NEXT_HDR_OFFSET: usize = 6;

#[map(name = "dropcnt")]
static DROP_COUNT: HashMap<u32, u64> = HashMap::with_max_entries(256, 0);

#[xdp]
pub fn xdp_drop(ctx: XdpContext) -> u32 {
    let protocol = ip_protocol(&ctx).unwrap_or(0);
    count_drop(protocol);
    xdp_action::XDP_DROP
}

fn ip_protocol(ctx: &XdpContext) -> Option<u32> {
    let ethertype = u16::from_be(read_at::<u16>(ctx, 12)?);
    let offset = match ethertype {
        ETH_P_IP => ETH_HDR_LEN + IPV4_PROTO_OFFSET,
        ETH_P_IPV6 => ETH_HDR_LEN + IPV6_NEXT_HDR_OFFSET,
        _ => return None,
    };
    read_at::<u8>(ctx, offset).map(u32::from)
}

#[inline(always)]
fn read_at<T: Copy>(ctx: &XdpContext, offset: usize) -> Option<T> {
    let start = ctx.data();
    let end = ctx.data_end();
    if start + offset + core::mem::size_of::<T>() > end {
        return None;
    }
    // SAFETY: bounds checked against data_end above.
    Some(unsafe { core::ptr::read_unaligned((start + offset) as *const T) })
}

fn count_drop(protocol: u32) {
    match DROP_COUNT.get_ptr_mut(&protocol) {
        // SAFETY: the value pointer is valid and 8-byte aligned.
        Some(value) => unsafe {
            AtomicU64::from_ptr(value).fetch_add(1, Ordering::Relaxed);
        },
        None => {
            let _ = DROP_COUNT.insert(&protocol, &1, 0);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
