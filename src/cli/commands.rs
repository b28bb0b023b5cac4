use crate::cli::Commands;
use crate::config::{catalog, OutputSpec, ProbeSpec};
use crate::lifecycle::SessionReport;
use crate::Result;
use tracing::{info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    let spec = build_spec(command)?;
    info!(
        "Probe {}: {} attach point(s) from {}",
        spec.name,
        spec.attach.len(),
        spec.program.display()
    );
    run_session(spec).await
}

/// Turn a subcommand into a validated probe spec
pub fn build_spec(command: Commands) -> Result<ProbeSpec> {
    let spec = match command {
        Commands::Chroot {
            object,
            channel_capacity,
        } => catalog::chroot(
            object.unwrap_or_else(|| catalog::default_object("chroot")),
            channel_capacity,
        ),
        Commands::TcpConnect {
            object,
            channel_capacity,
        } => catalog::tcp_connect(
            object.unwrap_or_else(|| catalog::default_object("tcp_connect")),
            channel_capacity,
        ),
        Commands::XdpDrop { device, object } => catalog::xdp_drop(
            object.unwrap_or_else(|| catalog::default_object("xdp_drop")),
            &device,
        ),
        Commands::XdpAttach { device, object } => catalog::xdp_attach(
            object.unwrap_or_else(|| catalog::default_object("xdp_pass")),
            &device,
        ),
        Commands::Run { spec } => return ProbeSpec::from_yaml_file(&spec),
    };
    spec.validate()?;
    Ok(spec)
}

#[cfg(target_os = "linux")]
async fn run_session(spec: ProbeSpec) -> Result<()> {
    use crate::ebpf::aya_backend::AyaBackend;
    use crate::ebpf::preflight::run_preflight_checks;
    use crate::ebpf::symbols::KernelSymbols;
    use crate::lifecycle::ProbeSession;
    use crate::output::LineSink;
    use crate::signal::ShutdownSignal;

    let streams_events = matches!(spec.output, OutputSpec::Events { .. });
    run_preflight_checks(streams_events)?;

    let mut shutdown = ShutdownSignal::install()?;

    let mut backend = AyaBackend::open(&spec.program, &spec.load)?;
    backend.init_logger();

    let symbols = if spec.needs_symbols() {
        KernelSymbols::load()?
    } else {
        KernelSymbols::default()
    };

    match &spec.output {
        OutputSpec::Events { .. } => info!("Tracing {}... hit CTRL+C to stop", spec.name),
        OutputSpec::Counters { .. } => info!("Counting in {}, hit CTRL+C to stop", spec.name),
        OutputSpec::None => info!("{} attached, hit CTRL+C to detach", spec.name),
    }

    let mut sink = LineSink::stdout();
    let mut session = ProbeSession::new(spec, backend, symbols);
    let report = session.run(&mut sink, shutdown.recv()).await?;
    log_report(&report);
    Ok(())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn log_report(report: &SessionReport) {
    if !report.fallbacks.is_empty() {
        info!("Fallback symbols used: {}", report.fallbacks.join(", "));
    }
    for error in &report.detach_errors {
        warn!("Detach reported: {}", error);
    }
}

#[cfg(not(target_os = "linux"))]
async fn run_session(spec: ProbeSpec) -> Result<()> {
    Err(crate::TracekitError::UnsupportedPlatform(format!(
        "probe {} needs Linux to load eBPF programs",
        spec.name
    )))
}
