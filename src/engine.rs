use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::asset::FirmwareAsset;
use crate::error::UpdateError;
use crate::protocol::{encode_chunk_frame, ChunkRequest, ClientMessage, StopDownload, FRAME_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingOpen,
    Uploading,
    Completed,
    Errored,
}

/// What to put on the wire in answer to a chunk request.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkReply {
    Frame { offset: u64, payload_len: usize, frame: Bytes },
    /// The request started at or past the end of the asset.
    EndOfFile(ClientMessage),
}

/// Snapshot of local throughput figures plus the server's advisory numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStats {
    pub total_bytes: u64,
    pub last_offset: Option<u64>,
    pub frames_sent: u64,
    pub payload_bytes: u64,
    pub wire_bytes: u64,
    /// Payload bytes per second.
    pub effective_rate: f64,
    /// Payload plus frame headers per second.
    pub real_rate: f64,
    /// Seconds left at the effective rate, NaN when the rate is zero.
    pub eta_secs: f64,
    pub server_progress: Option<f64>,
    pub server_eta_secs: Option<f64>,
}

impl TransferStats {
    /// Local completion estimate in percent.
    pub fn local_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        let acknowledged = self.last_offset.unwrap_or(0).min(self.total_bytes);
        acknowledged as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Answers the server's pull requests from one firmware asset.
///
/// The server drives the transfer. The engine only validates each request,
/// cuts the requested range out of the asset and frames it.
pub struct ChunkTransferEngine {
    asset: FirmwareAsset,
    state: EngineState,
    started_at: Option<Instant>,
    last_requested_offset: Option<u64>,
    frames_sent: u64,
    payload_bytes: u64,
    wire_bytes: u64,
    server_progress: Option<f64>,
    server_eta_secs: Option<f64>,
}

impl ChunkTransferEngine {
    pub fn new(asset: FirmwareAsset) -> Self {
        Self {
            asset,
            state: EngineState::Idle,
            started_at: None,
            last_requested_offset: None,
            frames_sent: 0,
            payload_bytes: 0,
            wire_bytes: 0,
            server_progress: None,
            server_eta_secs: None,
        }
    }

    pub fn asset(&self) -> &FirmwareAsset {
        &self.asset
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// True until the server stopped the transfer one way or another.
    pub fn is_active(&self) -> bool {
        matches!(self.state, EngineState::AwaitingOpen | EngineState::Uploading)
    }

    pub fn begin(&mut self, now: Instant) {
        self.state = EngineState::AwaitingOpen;
        self.started_at = Some(now);
        self.last_requested_offset = None;
        self.frames_sent = 0;
        self.payload_bytes = 0;
        self.wire_bytes = 0;
        self.server_progress = None;
        self.server_eta_secs = None;
    }

    /// The transport (re)opened. Returns the start handshake to send while
    /// a transfer is pending.
    pub fn on_open(&mut self) -> Option<ClientMessage> {
        if !self.is_active() {
            return None;
        }
        self.state = EngineState::Uploading;
        Some(ClientMessage::start(self.asset.name(), self.asset.size()))
    }

    pub fn on_chunk_request(&mut self, request: &ChunkRequest) -> Result<ChunkReply, UpdateError> {
        if self.state != EngineState::Uploading {
            return Err(UpdateError::ProtocolViolation(format!(
                "chunk request for offset {} while {:?}",
                request.offset, self.state
            )));
        }

        if let Some(progress) = request.progress.as_ref().and_then(|p| p.value()) {
            self.server_progress = Some(progress);
        }
        if let Some(eta) = request.eta_sec.as_ref().and_then(|e| e.value()) {
            self.server_eta_secs = Some(eta);
        }

        let Some(payload) = self.asset.slice(request.offset, u64::from(request.size)) else {
            debug!("server requested offset {} at or past end ({} bytes)", request.offset, self.asset.size());
            return Ok(ChunkReply::EndOfFile(ClientMessage::end_of_file()));
        };

        let payload_len = payload.len();
        let frame = encode_chunk_frame(request.offset, payload)?;

        self.last_requested_offset = Some(request.offset);
        self.frames_sent += 1;
        self.payload_bytes += payload_len as u64;
        self.wire_bytes += (payload_len + FRAME_HEADER_LEN) as u64;
        trace!("framed {} bytes at offset {}", payload_len, request.offset);

        Ok(ChunkReply::Frame { offset: request.offset, payload_len, frame })
    }

    pub fn on_stop(&mut self, stop: &StopDownload) -> Result<(), UpdateError> {
        if stop.success {
            self.state = EngineState::Completed;
            Ok(())
        } else {
            self.state = EngineState::Errored;
            let reason = if stop.reason.is_empty() { "no reason given".to_string() } else { stop.reason.clone() };
            Err(UpdateError::TransferRejected(reason))
        }
    }

    pub fn fail(&mut self) {
        self.state = EngineState::Errored;
    }

    /// Offset of the most recent framed request, the stall marker.
    pub fn last_requested_offset(&self) -> Option<u64> {
        self.last_requested_offset
    }

    pub fn stats(&self, now: Instant) -> TransferStats {
        let elapsed = self
            .started_at
            .map(|start| now.saturating_duration_since(start).as_secs_f64())
            .unwrap_or(0.0);
        let (effective_rate, real_rate) = if elapsed > 0.0 {
            (self.payload_bytes as f64 / elapsed, self.wire_bytes as f64 / elapsed)
        } else {
            (0.0, 0.0)
        };
        let remaining = self.asset.remaining(self.last_requested_offset.unwrap_or(0));
        let eta_secs = if effective_rate > 0.0 { remaining as f64 / effective_rate } else { f64::NAN };

        TransferStats {
            total_bytes: self.asset.size(),
            last_offset: self.last_requested_offset,
            frames_sent: self.frames_sent,
            payload_bytes: self.payload_bytes,
            wire_bytes: self.wire_bytes,
            effective_rate,
            real_rate,
            eta_secs,
            server_progress: self.server_progress,
            server_eta_secs: self.server_eta_secs,
        }
    }
}
