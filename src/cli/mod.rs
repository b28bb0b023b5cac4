pub mod commands;

use crate::config::DEFAULT_CHANNEL_CAPACITY;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tracekit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Attach eBPF probes to kernel events and stream what they see", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Report every chroot(2) call")]
    Chroot {
        #[arg(long, help = "Compiled probe object (default: installed chroot probe)")]
        object: Option<PathBuf>,

        #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY, help = "Events buffered between reader and output")]
        channel_capacity: usize,
    },
    #[command(about = "Report successful IPv4 TCP connects")]
    TcpConnect {
        #[arg(long, help = "Compiled probe object (default: installed tcp_connect probe)")]
        object: Option<PathBuf>,

        #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY, help = "Events buffered between reader and output")]
        channel_capacity: usize,
    },
    #[command(about = "Drop all packets on a device and count them per IP protocol")]
    XdpDrop {
        #[arg(help = "Network device, e.g. eth0")]
        device: String,

        #[arg(long, help = "Compiled probe object (default: installed xdp_drop probe)")]
        object: Option<PathBuf>,
    },
    #[command(about = "Attach a pass-through XDP program until interrupted")]
    XdpAttach {
        #[arg(short, long, default_value = "lo", help = "Network device")]
        device: String,

        #[arg(long, help = "Compiled probe object (default: installed xdp_pass probe)")]
        object: Option<PathBuf>,
    },
    #[command(about = "Run a probe session described in a YAML file")]
    Run {
        #[arg(help = "Probe spec file")]
        spec: PathBuf,
    },
}
