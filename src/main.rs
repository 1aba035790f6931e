mod buffer;
mod config;
mod connection;
mod data_dir;
mod dataset;
mod decode;
mod extractor;
mod monitor;
mod pipeline;
mod retry;
mod sample;
mod session;
mod signals;
mod status;
mod transport;

use clap::Parser;
use connection::{ConnectionManager, ConnectionState};
use data_dir::DataDir;
use dataset::DatasetWriter;
use monitor::Monitor;
use pipeline::CapturePipeline;
use sample::CollectionComplete;
use session::{CollectionSession, SessionParams};
use signals::SignalHandler;
use status::{CaptureState, StatusTracker};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use transport::simulated::{SimPattern, SimulatedTransport};
use transport::{DeviceFilter, DeviceTransport};

/// Capture labeled sensor sessions from a serial device: connect, collect for
/// a fixed duration, and export each session as an ML-ready dataset.
#[derive(Parser, Debug)]
#[command(name = "serial-capture", version, about)]
pub struct Cli {
    /// Config file path (default: .serial-capture/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device path (overrides config)
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// USB vendor id filter in hex, e.g. 2886 (overrides config)
    #[arg(long, value_parser = parse_hex_u16)]
    vendor_id: Option<u16>,

    /// Baud rate (overrides config)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Label attached to every captured session
    #[arg(short, long)]
    label: Option<String>,

    /// Session duration in milliseconds (1000-30000)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Target sample rate in Hz (10-1000), recorded as metadata
    #[arg(long)]
    rate_hz: Option<u32>,

    /// Number of back-to-back sessions to capture
    #[arg(short = 'n', long)]
    sessions: Option<u32>,

    /// Text sent to the device (newline-terminated) after connecting
    #[arg(long)]
    send: Option<String>,

    /// Use a simulated device instead of real hardware
    #[arg(long, value_enum)]
    simulate: Option<SimPattern>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// List available devices and exit
    #[arg(long)]
    list: bool,

    /// Validate config and print resolved settings, don't connect
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (read retries, extraction details)
    #[arg(short, long)]
    verbose: bool,

    /// Hide raw device output, show only status lines
    #[arg(short, long)]
    quiet: bool,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex vendor id '{s}': {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "serial_capture=debug"
    } else {
        "serial_capture=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<config::CaptureConfig, config::ConfigError> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| DataDir::new(config::StorageConfig::default().data_dir).config());
    let mut config = config::load_config(&path)?;

    if let Some(device) = &cli.device {
        config.device.path = Some(device.clone());
    }
    if let Some(vid) = cli.vendor_id {
        config.device.vendor_id = Some(vid);
    }
    if let Some(baud) = cli.baud {
        config.device.baud_rate = baud;
    }
    if let Some(label) = &cli.label {
        config.session.label = label.clone();
    }
    if let Some(duration_ms) = cli.duration_ms {
        config.session.duration_ms = duration_ms;
    }
    if let Some(rate) = cli.rate_hz {
        config.session.sample_rate_hz = rate;
    }
    if let Some(sessions) = cli.sessions {
        config.session.sessions = sessions;
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}

fn build_transport(
    cli: &Cli,
    config: &config::CaptureConfig,
) -> Result<Arc<dyn DeviceTransport>, Box<dyn std::error::Error>> {
    if let Some(pattern) = cli.simulate {
        return Ok(Arc::new(SimulatedTransport::pattern(
            pattern,
            config.session.sample_rate_hz,
        )));
    }

    #[cfg(all(unix, feature = "tty"))]
    {
        Ok(Arc::new(transport::tty::TtyTransport::new(
            Duration::from_millis(config.device.hotplug_poll_ms),
        )))
    }
    #[cfg(not(all(unix, feature = "tty")))]
    {
        Err("no hardware transport in this build; use --simulate".into())
    }
}

/// How one session's wait ended.
enum SessionEnd {
    Finished,
    Interrupted,
    LinkLost,
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&cli)?;

    if cli.dry_run {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let transport = build_transport(&cli, &config)?;

    if cli.list {
        let devices = transport.list_devices().await?;
        if devices.is_empty() {
            println!("No {} devices found", transport.name());
        }
        for device in devices {
            println!("{}", device.label());
        }
        return Ok(());
    }

    let data_dir = DataDir::new(&config.storage.data_dir);
    if data_dir.init()? {
        tracing::info!(dir = %data_dir.root().display(), "initialized data directory");
    }
    let mut tracker = StatusTracker::new(data_dir.status(), config.session.sessions);
    tracker.update(CaptureState::Starting);

    let (monitor, monitor_rx) = Monitor::channel();
    let printer = monitor::spawn_printer(monitor_rx, !cli.quiet);

    let manager =
        ConnectionManager::new(Arc::clone(&transport), config.device.clone(), monitor.clone());
    let events = manager.watch_device_events();

    let (session, completions) = CollectionSession::new(
        manager.subscribe(),
        monitor.clone(),
        config.session.progress_every,
    );
    let pipeline = CapturePipeline::new(&config.extractor, session.clone(), monitor.clone())?;
    manager.set_consumer(Arc::new(pipeline));

    let result = capture(
        &cli,
        &config,
        &data_dir,
        &manager,
        &session,
        completions,
        &monitor,
        &mut tracker,
    )
    .await;

    session.stop();
    manager.disconnect().await;
    tracker.update(CaptureState::ShuttingDown);
    events.abort();

    // The printer exits once every Monitor clone is gone.
    drop(session);
    drop(manager);
    drop(monitor);
    if tokio::time::timeout(Duration::from_millis(250), printer)
        .await
        .is_err()
    {
        tracing::debug!("monitor printer still running at exit");
    }

    if result.is_ok() {
        tracker.remove();
    } else {
        tracker.update(CaptureState::Disconnected);
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn capture(
    cli: &Cli,
    config: &config::CaptureConfig,
    data_dir: &DataDir,
    manager: &ConnectionManager,
    session: &CollectionSession,
    mut completions: mpsc::UnboundedReceiver<CollectionComplete>,
    monitor: &Monitor,
    tracker: &mut StatusTracker,
) -> Result<(), Box<dyn std::error::Error>> {
    let available = manager.list_devices().await?;
    monitor.status(format!("{} serial device(s) available", available.len()));

    tracker.update(CaptureState::Connecting);
    let filter = DeviceFilter {
        path: config.device.path.clone(),
        vendor_id: config.device.vendor_id,
    };
    let device = manager.connect(&filter).await?;
    tracker.set_device(Some(device.path.display().to_string()));
    tracker.update(CaptureState::Connected);

    if let Some(text) = &cli.send {
        // Reported on the monitor; a failed send does not stop the capture.
        if let Err(e) = manager.send(text.as_bytes(), true).await {
            tracing::debug!(error = %e, "initial send failed, continuing");
        }
    }

    let mut signals = SignalHandler::install()?;
    let writer = DatasetWriter::new(data_dir.datasets_dir(), config.export.clone());
    let mut link = manager.subscribe();
    let mut finished = session.subscribe_finished();

    for n in 1..=config.session.sessions {
        if signals.shutdown_requested() {
            break;
        }

        let params = SessionParams {
            label: config.session.label.clone(),
            duration_ms: config.session.duration_ms,
            sample_rate_hz: config.session.sample_rate_hz,
        };
        let done_at = *finished.borrow_and_update() + 1;
        session.start(params.clone())?;
        tracker.begin_session(n, &params.label);
        tracker.update(CaptureState::Collecting);

        let end = tokio::select! {
            _ = finished.wait_for(|count| *count >= done_at) => SessionEnd::Finished,
            _ = signals.requested() => SessionEnd::Interrupted,
            _ = link.wait_for(|s| *s == ConnectionState::Disconnected) => SessionEnd::LinkLost,
        };
        // Finalizes the run if the wait ended for any other reason.
        session.stop();

        tracker.update(CaptureState::Exporting);
        while let Ok(event) = completions.try_recv() {
            export(&writer, &event, monitor, tracker);
        }

        match end {
            SessionEnd::Finished => {}
            SessionEnd::Interrupted => {
                monitor.status("Shutdown requested");
                break;
            }
            SessionEnd::LinkLost => {
                tracker.update(CaptureState::Disconnected);
                monitor.status("Connection lost during collection");
                return Err(connection::ConnectionError::NotConnected.into());
            }
        }
        tracker.update(CaptureState::Connected);
    }

    Ok(())
}

fn export(
    writer: &DatasetWriter,
    event: &CollectionComplete,
    monitor: &Monitor,
    tracker: &mut StatusTracker,
) {
    match writer.write(event) {
        Ok(written) => {
            let shown = written.acquisition.as_ref().unwrap_or(&written.samples);
            monitor.status(format!(
                "Saved {} samples for '{}' to {}",
                event.samples.len(),
                event.label,
                shown.display()
            ));
            tracker.set_last_result(event.samples.len(), Some(shown.as_path()));
        }
        Err(e) => {
            tracing::error!(error = %e, label = %event.label, "failed to export session");
            monitor.status(format!("Export failed: {e}"));
            tracker.set_last_result(event.samples.len(), None);
        }
    }
}
