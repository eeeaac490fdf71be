use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use swu_push::config::OutputConfig;
use swu_push::{
    CancellationToken, Config, FirmwareAsset, HttpDeviceApi, OrchestratorSettings, StagePhase, UpdateError,
    UpdateEvent, UpdateOutcome, UploadOrchestrator, WebSocketConnector,
};

const BYTES_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) ETA: {eta} - {msg}";
const STAGE_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% - {msg}";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML format)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Device address, overrides `device.host`
    #[arg(long)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a .swu package and follow its installation
    Upload {
        /// Path to the firmware package
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Follow an update the device is already running
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let mut config = Config::load_or_create(&cli.config)?;
    if let Some(host) = cli.host {
        config.device.host = host;
        config.validate()?;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting update");
            on_interrupt.cancel();
        }
    });

    let outcome = match cli.command {
        Commands::Upload { file } => run_upload(&config, file, cancel).await,
        Commands::Watch => run_watch(&config, cancel).await,
    };

    match outcome {
        Ok(UpdateOutcome::Succeeded { stage, message }) => {
            info!("{} [{}]", message, stage);
            Ok(())
        }
        Ok(UpdateOutcome::RolledBack { message, .. }) => {
            error!("{}", message);
            Err(message.into())
        }
        Ok(UpdateOutcome::Aborted) => {
            info!("Update aborted by user");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

fn build_orchestrator(config: &Config) -> Result<(UploadOrchestrator, mpsc::UnboundedReceiver<UpdateEvent>), UpdateError> {
    let connector = Arc::new(WebSocketConnector::new(config.upload.connect_timeout()));
    let device = Arc::new(HttpDeviceApi::from_config(
        &config.device,
        config.monitor.request_timeout(),
        config.monitor.install_timeout(),
    )?);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let orchestrator =
        UploadOrchestrator::new(connector, device, config.device.upload_url(), OrchestratorSettings::from(config))
            .with_events(events_tx);
    Ok((orchestrator, events_rx))
}

async fn run_upload(config: &Config, file: PathBuf, cancel: CancellationToken) -> Result<UpdateOutcome, UpdateError> {
    let asset = FirmwareAsset::open(&file)?;
    info!("Pushing {} to {}", file.display(), config.device.upload_url());

    let (mut orchestrator, events) = build_orchestrator(config)?;
    let renderer = tokio::spawn(render(events, config.output.clone()));
    let result = orchestrator.run(asset, cancel).await;
    drop(orchestrator);
    let _ = renderer.await;
    result
}

async fn run_watch(config: &Config, cancel: CancellationToken) -> Result<UpdateOutcome, UpdateError> {
    info!("Watching update state of {}", config.device.http_base());

    let (mut orchestrator, events) = build_orchestrator(config)?;
    let renderer = tokio::spawn(render(events, config.output.clone()));
    let result = orchestrator.watch(cancel).await;
    drop(orchestrator);
    let _ = renderer.await;
    result
}

fn styled(bar: ProgressBar, template: &str) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    bar.set_style(style);
    bar
}

/// Render session events as progress bars, or as log lines when bars are off.
async fn render(mut events: mpsc::UnboundedReceiver<UpdateEvent>, output: OutputConfig) {
    let multi_progress = MultiProgress::new();
    let mut upload_bar: Option<ProgressBar> = None;
    let mut stage_bar: Option<ProgressBar> = None;

    while let Some(event) = events.recv().await {
        match event {
            UpdateEvent::UploadStarted { name, size, sha256 } => {
                info!("Uploading {} ({} bytes, sha256 {})", name, size, sha256);
                if output.progress_bar_enabled {
                    let pb = styled(multi_progress.add(ProgressBar::new(size)), BYTES_TEMPLATE);
                    pb.set_message(format!("Uploading: {}", name));
                    upload_bar = Some(pb);
                }
            }
            UpdateEvent::ChunkSent { offset, len, stats } => {
                if let Some(pb) = &upload_bar {
                    pb.set_position(offset + len as u64);
                    if let Some(progress) = stats.server_progress {
                        pb.set_message(format!("server at {:.1}%", progress));
                    }
                }
                if output.detailed_logging {
                    info!(
                        "Sent {} bytes at {} ({:.0} B/s effective, {:.0} B/s on the wire, ETA {:.0}s)",
                        len, offset, stats.effective_rate, stats.real_rate, stats.eta_secs
                    );
                } else {
                    debug!("Sent {} bytes at {}", len, offset);
                }
            }
            UpdateEvent::EndOfFileSignalled { offset } => {
                warn!("Server asked for offset {} past the end of the package", offset);
            }
            UpdateEvent::LivenessChanged { alive } => {
                let text = if alive { "device reachable" } else { "device not reachable" };
                match stage_bar.as_ref().or(upload_bar.as_ref()) {
                    Some(pb) => pb.set_message(text.to_string()),
                    None => info!("{}", text),
                }
            }
            UpdateEvent::Reconnecting { attempt, reason } => {
                warn!("Reconnecting upload socket (attempt {}): {}", attempt, reason);
            }
            UpdateEvent::TransferCompleted { bytes } => {
                if let Some(pb) = upload_bar.take() {
                    pb.finish_with_message("✅ Upload complete".to_string());
                }
                info!("Upload of {} bytes confirmed by device", bytes);
            }
            UpdateEvent::InstallRequested { name } => {
                info!("Installation of {} requested", name);
            }
            UpdateEvent::StageChanged(progress) => {
                let message = match progress.phase {
                    StagePhase::RollingBack => format!("↩ {}", progress.message),
                    StagePhase::Updating => progress.message.clone(),
                };
                if output.progress_bar_enabled {
                    let pb = stage_bar
                        .get_or_insert_with(|| styled(multi_progress.add(ProgressBar::new(100)), STAGE_TEMPLATE));
                    pb.set_position(u64::from(progress.percent));
                    pb.set_message(message);
                } else {
                    info!("{}% {} [{}]", progress.percent, message, progress.stage);
                }
            }
            UpdateEvent::Finished { success, message } => {
                for pb in [upload_bar.take(), stage_bar.take()].into_iter().flatten() {
                    if success {
                        pb.finish_with_message(format!("✅ {}", message));
                    } else {
                        pb.abandon_with_message(format!("❌ {}", message));
                    }
                }
            }
        }
    }
}
