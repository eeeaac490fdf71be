use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::UpdateError;

/// The device's REST worker, as seen by the update client.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Raw body of the current software update state.
    async fn poll_state(&self) -> Result<String, UpdateError>;

    /// Ask the device to start installing the uploaded package.
    async fn start_install(&self, asset_name: &str) -> Result<(), UpdateError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), UpdateError>;
}

pub struct HttpDeviceApi {
    client: Client,
    endpoint: String,
    request_timeout: Duration,
    install_timeout: Duration,
}

impl HttpDeviceApi {
    pub fn new(
        base_url: &str,
        worker_path: &str,
        request_timeout: Duration,
        install_timeout: Duration,
    ) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .user_agent(concat!("swu_push/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let endpoint = format!("{}/{}", base_url.trim_end_matches('/'), worker_path.trim_start_matches('/'));
        Ok(Self { client, endpoint, request_timeout, install_timeout })
    }

    pub fn from_config(device: &DeviceConfig, request_timeout: Duration, install_timeout: Duration) -> Result<Self, UpdateError> {
        Self::new(&device.http_base(), &device.rest_worker_path, request_timeout, install_timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get(&self, query: &[(&str, &str)], timeout: Duration) -> Result<String, UpdateError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(query)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn poll_state(&self) -> Result<String, UpdateError> {
        self.get(&[("get_sw_update_state", "")], self.request_timeout).await
    }

    async fn start_install(&self, asset_name: &str) -> Result<(), UpdateError> {
        let body = self.get(&[("start_fw_update", asset_name)], self.install_timeout).await?;
        debug!("install trigger answered: {}", body.trim());
        Ok(())
    }

    async fn ping(&self) -> Result<(), UpdateError> {
        let body = self.get(&[("ping", "")], self.request_timeout).await?;
        if body.trim() != "pong" {
            return Err(UpdateError::Communication(format!("unexpected ping reply: {}", body.trim())));
        }
        Ok(())
    }
}
