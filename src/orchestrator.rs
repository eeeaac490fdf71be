//! Drives one firmware update session end to end.
//!
//! The transfer phase answers the server's chunk requests over the upload
//! socket while a heartbeat, a reconnect timer and a stall watchdog keep the
//! link honest. Once the server confirms the upload, the socket is released,
//! installation is requested over HTTP and the device's validation stages
//! are followed until a terminal stage, a stage timeout or cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::asset::FirmwareAsset;
use crate::config::Config;
use crate::device_api::DeviceApi;
use crate::engine::{ChunkReply, ChunkTransferEngine, TransferStats};
use crate::error::UpdateError;
use crate::heartbeat::HeartbeatMonitor;
use crate::monitor::{Observation, StageProgress, StageReport, UpdateProgressStateMachine};
use crate::protocol::{ClientMessage, ServerMessage, WireMessage};
use crate::stage::UpdateStage;
use crate::transport::{Connector, TransportEvent, TransportSession};
use crate::watchdog::{StallCheck, StallWatchdog};

/// Timing and retry limits of a session.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub heartbeat_interval: Duration,
    pub slow_heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub reconnect_interval: Duration,
    pub stall_check_interval: Duration,
    pub stall_threshold: u32,
    pub max_stall_recoveries: u32,
    pub max_connection_errors: u32,
    pub poll_interval: Duration,
    pub default_stage_timeout: Duration,
    pub request_timeout: Duration,
    pub install_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.upload.heartbeat_interval(),
            slow_heartbeat_interval: config.upload.slow_heartbeat_interval(),
            heartbeat_miss_threshold: config.upload.heartbeat_miss_threshold,
            reconnect_interval: config.upload.reconnect_interval(),
            stall_check_interval: config.upload.stall_check_interval(),
            stall_threshold: config.upload.stall_threshold,
            max_stall_recoveries: config.upload.max_stall_recoveries,
            max_connection_errors: config.upload.max_connection_errors,
            poll_interval: config.monitor.poll_interval(),
            default_stage_timeout: config.monitor.default_stage_timeout(),
            request_timeout: config.monitor.request_timeout(),
            install_timeout: config.monitor.install_timeout(),
        }
    }
}

/// Progress notifications for whoever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    UploadStarted { name: String, size: u64, sha256: String },
    ChunkSent { offset: u64, len: usize, stats: TransferStats },
    EndOfFileSignalled { offset: u64 },
    LivenessChanged { alive: bool },
    Reconnecting { attempt: u32, reason: String },
    TransferCompleted { bytes: u64 },
    InstallRequested { name: String },
    StageChanged(StageProgress),
    Finished { success: bool, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Succeeded { stage: UpdateStage, message: String },
    /// The device rejected the new image and is running the previous one.
    RolledBack { stage: UpdateStage, cause: UpdateStage, message: String },
    /// The operator cancelled; not a failure.
    Aborted,
}

enum TransferPhase {
    Completed,
    Aborted,
}

/// Result of a REST call made off the validation loop.
enum DeviceProbe {
    Poll(Result<String, UpdateError>),
    Ping(Result<(), UpdateError>),
}

pub struct UploadOrchestrator {
    connector: Arc<dyn Connector>,
    device: Arc<dyn DeviceApi>,
    target: String,
    settings: OrchestratorSettings,
    heartbeat: HeartbeatMonitor,
    events: Option<mpsc::UnboundedSender<UpdateEvent>>,
}

impl UploadOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        device: Arc<dyn DeviceApi>,
        target: impl Into<String>,
        settings: OrchestratorSettings,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::new(settings.heartbeat_interval, settings.heartbeat_miss_threshold);
        Self { connector, device, target: target.into(), settings, heartbeat, events: None }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<UpdateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Push `asset`, trigger installation and follow validation to the end.
    ///
    /// Taking `&mut self` keeps a single session active per orchestrator.
    pub async fn run(&mut self, asset: FirmwareAsset, cancel: CancellationToken) -> Result<UpdateOutcome, UpdateError> {
        let session_id = Uuid::new_v4();
        let span = info_span!("update", %session_id, asset = %asset.name());
        let result = self.run_session(asset, &cancel).instrument(span).await;
        self.finish(&result);
        result
    }

    /// Follow a device that is already validating an image.
    pub async fn watch(&mut self, cancel: CancellationToken) -> Result<UpdateOutcome, UpdateError> {
        let session_id = Uuid::new_v4();
        self.heartbeat.reset();
        let result = self.follow_validation(&cancel).instrument(info_span!("watch", %session_id)).await;
        self.finish(&result);
        result
    }

    async fn run_session(&mut self, asset: FirmwareAsset, cancel: &CancellationToken) -> Result<UpdateOutcome, UpdateError> {
        self.heartbeat.reset();
        let name = asset.name().to_string();
        info!("uploading {} ({} bytes, sha256 {}) to {}", name, asset.size(), asset.sha256(), self.target);
        self.emit(UpdateEvent::UploadStarted { name: name.clone(), size: asset.size(), sha256: asset.sha256().to_string() });

        match self.transfer(asset, cancel).await? {
            TransferPhase::Aborted => return Ok(UpdateOutcome::Aborted),
            TransferPhase::Completed => {}
        }

        let install = self.request_install(&name);
        let result = self.follow_validation(cancel).await;
        if cancel.is_cancelled() {
            install.abort();
        }
        result
    }

    async fn transfer(&mut self, asset: FirmwareAsset, cancel: &CancellationToken) -> Result<TransferPhase, UpdateError> {
        let mut engine = ChunkTransferEngine::new(asset);
        let mut watchdog = StallWatchdog::new(self.settings.stall_threshold);
        let (mut transport, mut notices) = TransportSession::new(Arc::clone(&self.connector), self.target.clone());

        engine.begin(Instant::now());
        watchdog.start();
        transport.connect();

        let mut heartbeat_timer = ticker(self.heartbeat.interval());
        let mut reconnect_timer = ticker(self.settings.reconnect_interval);
        let mut stall_timer = ticker(self.settings.stall_check_interval);
        let mut connection_errors = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if transport.is_connected() {
                        transport.send(&ClientMessage::abort())?;
                    }
                    watchdog.stop();
                    engine.fail();
                    transport.close();
                    let change = self.heartbeat.set_connected(false);
                    self.note_liveness(change);
                    info!("upload aborted by operator");
                    return Ok(TransferPhase::Aborted);
                }
                Some(notice) = notices.recv() => {
                    let Some(event) = transport.accept(notice) else { continue };
                    match event {
                        TransportEvent::Connected => {
                            info!("upload socket connected");
                            let change = self.heartbeat.set_connected(true);
                            self.note_liveness(change);
                            if let Some(start) = engine.on_open() {
                                transport.send(&start)?;
                            }
                        }
                        TransportEvent::Disconnected => {
                            let change = self.heartbeat.set_connected(false);
                            self.note_liveness(change);
                            connection_errors += 1;
                            warn!("upload socket dropped ({} of {})", connection_errors, self.settings.max_connection_errors);
                            self.check_connection_errors(connection_errors, "connection dropped")?;
                        }
                        TransportEvent::ConnectFailed(reason) => {
                            connection_errors += 1;
                            warn!("connect failed ({} of {}): {}", connection_errors, self.settings.max_connection_errors, reason);
                            self.check_connection_errors(connection_errors, &reason)?;
                        }
                        TransportEvent::Message(WireMessage::Binary(data)) => {
                            return Err(UpdateError::ProtocolViolation(format!(
                                "unexpected {} byte binary frame from server",
                                data.len()
                            )));
                        }
                        TransportEvent::Message(WireMessage::Text(text)) => match ServerMessage::parse(&text)? {
                            ServerMessage::Pong => {
                                let change = self.heartbeat.on_pong();
                                self.note_liveness(change);
                            }
                            ServerMessage::RequestChunk(request) => match engine.on_chunk_request(&request)? {
                                ChunkReply::Frame { offset, payload_len, frame } => {
                                    transport.send_binary(frame);
                                    let stats = engine.stats(Instant::now());
                                    self.emit(UpdateEvent::ChunkSent { offset, len: payload_len, stats });
                                }
                                ChunkReply::EndOfFile(status) => {
                                    transport.send(&status)?;
                                    self.emit(UpdateEvent::EndOfFileSignalled { offset: request.offset });
                                }
                            },
                            ServerMessage::StopDownload(stop) => {
                                watchdog.stop();
                                transport.close();
                                let change = self.heartbeat.set_connected(false);
                                self.note_liveness(change);
                                engine.on_stop(&stop)?;
                                let bytes = engine.asset().size();
                                info!("server confirmed upload of {} bytes", bytes);
                                self.emit(UpdateEvent::TransferCompleted { bytes });
                                return Ok(TransferPhase::Completed);
                            }
                            ServerMessage::Statistic(statistic) => {
                                debug!("server statistic: {}", statistic);
                            }
                            ServerMessage::Unrecognized(keys) => {
                                debug!("ignoring server message with keys {:?}", keys);
                            }
                        },
                    }
                }
                _ = heartbeat_timer.tick() => {
                    let change = self.heartbeat.tick();
                    self.note_liveness(change);
                    transport.send(&ClientMessage::ping())?;
                }
                _ = reconnect_timer.tick() => {
                    if !transport.is_connected() {
                        debug!("upload socket down, reconnecting");
                        transport.reconnect_if_needed();
                    }
                }
                _ = stall_timer.tick() => {
                    if watchdog.tick(engine.last_requested_offset()) == StallCheck::Stalled {
                        let attempt = watchdog.recoveries();
                        let reason = match engine.last_requested_offset() {
                            Some(offset) => format!("no chunk request after offset {}", offset),
                            None => "no chunk request received".to_string(),
                        };
                        if attempt > self.settings.max_stall_recoveries {
                            return Err(UpdateError::TransferStalled { attempts: attempt, reason });
                        }
                        warn!("transfer stalled ({}), recycling the upload socket", reason);
                        self.emit(UpdateEvent::Reconnecting { attempt, reason });
                        let change = self.heartbeat.set_connected(false);
                        self.note_liveness(change);
                        transport.connect();
                    }
                }
            }
        }
    }

    fn check_connection_errors(&self, errors: u32, reason: &str) -> Result<(), UpdateError> {
        if errors > self.settings.max_connection_errors {
            return Err(UpdateError::TransferStalled { attempts: errors, reason: reason.to_string() });
        }
        Ok(())
    }

    /// Fire the install trigger without waiting for it; the device answers
    /// only once extraction is done, and the outcome is read from polling.
    fn request_install(&self, name: &str) -> JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let name = name.to_string();
        let limit = self.settings.install_timeout;
        self.emit(UpdateEvent::InstallRequested { name: name.clone() });
        info!("requesting installation of {}", name);

        tokio::spawn(
            async move {
                match timeout(limit, device.start_install(&name)).await {
                    Ok(Ok(())) => debug!("install trigger for {} acknowledged", name),
                    Ok(Err(e)) => warn!("install trigger for {} failed: {}", name, e),
                    Err(_) => debug!("install trigger for {} still pending after {:?}", name, limit),
                }
            }
            .in_current_span(),
        )
    }

    async fn follow_validation(&mut self, cancel: &CancellationToken) -> Result<UpdateOutcome, UpdateError> {
        self.heartbeat.set_interval(self.settings.slow_heartbeat_interval);
        let result = self.poll_stages(cancel).await;
        self.heartbeat.restore_baseline();
        result
    }

    async fn poll_stages(&mut self, cancel: &CancellationToken) -> Result<UpdateOutcome, UpdateError> {
        let mut machine = UpdateProgressStateMachine::new(self.settings.default_stage_timeout);
        machine.begin(Instant::now());

        let mut heartbeat_timer = ticker(self.heartbeat.interval());
        let mut poll_timer = tokio::time::interval(self.settings.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // REST calls run on their own tasks so a slow device never holds
        // back the stage deadline.
        let (probe_tx, mut probes) = mpsc::unbounded_channel();
        let mut poll_task: Option<JoinHandle<()>> = None;
        let mut ping_task: Option<JoinHandle<()>> = None;

        let result = loop {
            let deadline = machine.deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("validation watch cancelled by operator");
                    break Ok(UpdateOutcome::Aborted);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(error) = machine.check_deadline(Instant::now()) {
                        break Err(error);
                    }
                }
                _ = heartbeat_timer.tick() => {
                    let change = self.heartbeat.tick();
                    self.note_liveness(change);
                    if ping_task.as_ref().map_or(true, JoinHandle::is_finished) {
                        ping_task = Some(self.spawn_ping(probe_tx.clone()));
                    }
                }
                _ = poll_timer.tick() => {
                    if poll_task.as_ref().map_or(true, JoinHandle::is_finished) {
                        poll_task = Some(self.spawn_poll(probe_tx.clone()));
                    }
                }
                Some(probe) = probes.recv() => match probe {
                    DeviceProbe::Ping(Ok(())) => {
                        let change = self.heartbeat.set_connected(true);
                        self.note_liveness(change);
                        let change = self.heartbeat.on_pong();
                        self.note_liveness(change);
                    }
                    DeviceProbe::Ping(Err(e)) => debug!("device ping failed: {}", e),
                    DeviceProbe::Poll(Err(e)) => debug!("state poll failed, retrying: {}", e),
                    DeviceProbe::Poll(Ok(body)) => {
                        let report = match StageReport::parse(&body) {
                            Ok(Some(report)) => report,
                            Ok(None) => continue,
                            Err(e) => break Err(e),
                        };
                        match machine.observe(&report, Instant::now()) {
                            Ok(Observation::Unchanged) => {}
                            Ok(Observation::Progress(progress)) => self.emit(UpdateEvent::StageChanged(progress)),
                            Ok(Observation::Succeeded { stage, message }) => {
                                break Ok(UpdateOutcome::Succeeded { stage, message });
                            }
                            Ok(Observation::RolledBack { stage, cause, message }) => {
                                break Ok(UpdateOutcome::RolledBack { stage, cause, message });
                            }
                            Err(e) => break Err(e),
                        }
                    }
                },
            }
        };

        for task in [poll_task, ping_task].into_iter().flatten() {
            task.abort();
        }
        result
    }

    fn spawn_poll(&self, results: mpsc::UnboundedSender<DeviceProbe>) -> JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let limit = self.settings.request_timeout;
        tokio::spawn(
            async move {
                let reply = timeout(limit, device.poll_state()).await.unwrap_or_else(|elapsed| Err(elapsed.into()));
                let _ = results.send(DeviceProbe::Poll(reply));
            }
            .in_current_span(),
        )
    }

    fn spawn_ping(&self, results: mpsc::UnboundedSender<DeviceProbe>) -> JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let limit = self.settings.request_timeout;
        tokio::spawn(
            async move {
                let reply = timeout(limit, device.ping()).await.unwrap_or_else(|elapsed| Err(elapsed.into()));
                let _ = results.send(DeviceProbe::Ping(reply));
            }
            .in_current_span(),
        )
    }

    fn note_liveness(&self, change: Option<bool>) {
        if let Some(alive) = change {
            if alive {
                info!("device link alive");
            } else {
                warn!("device link not alive");
            }
            self.emit(UpdateEvent::LivenessChanged { alive });
        }
    }

    fn finish(&self, result: &Result<UpdateOutcome, UpdateError>) {
        let (success, message) = match result {
            Ok(UpdateOutcome::Succeeded { message, .. }) => (true, message.clone()),
            Ok(UpdateOutcome::RolledBack { message, .. }) => (false, message.clone()),
            Ok(UpdateOutcome::Aborted) => (false, "Update aborted by user".to_string()),
            Err(e) => (false, e.to_string()),
        };
        self.emit(UpdateEvent::Finished { success, message });
    }

    fn emit(&self, event: UpdateEvent) {
        if let Some(events) = &self.events {
            // A closed receiver only means nobody is rendering.
            let _ = events.send(event);
        }
    }
}

/// Interval whose first tick is one period from now.
fn ticker(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
