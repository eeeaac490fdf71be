pub mod asset;
pub mod config;
pub mod device_api;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;
pub mod stage;
pub mod transport;
pub mod watchdog;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use asset::FirmwareAsset;
pub use config::Config;
pub use device_api::{DeviceApi, HttpDeviceApi};
pub use engine::{ChunkTransferEngine, TransferStats};
pub use error::UpdateError;
pub use heartbeat::HeartbeatMonitor;
pub use monitor::{StageProgress, StageReport, UpdateProgressStateMachine};
pub use orchestrator::{OrchestratorSettings, UpdateEvent, UpdateOutcome, UploadOrchestrator};
pub use stage::{StagePhase, UpdateStage};
pub use transport::{Connector, Link, TransportSession};
pub use watchdog::StallWatchdog;
pub use websocket::WebSocketConnector;

// Re-export commonly used types
pub use tokio_util::sync::CancellationToken;
