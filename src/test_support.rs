//! In-process stand-ins for the upload server and the device REST worker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::device_api::DeviceApi;
use crate::error::UpdateError;
use crate::transport::{Connector, Link};

/// Hands the far end of every accepted connection to the test.
pub struct ScriptedConnector {
    peers: mpsc::UnboundedSender<Link>,
    refuse: AtomicU32,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Link>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self { peers, refuse: AtomicU32::new(0), attempts: AtomicU32::new(0) });
        (connector, peer_rx)
    }

    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _target: &str) -> Result<Link, UpdateError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(UpdateError::Communication("connection refused".to_string()));
        }
        let (client, peer) = Link::pair();
        self.peers
            .send(peer)
            .map_err(|_| UpdateError::Communication("test dropped the peer receiver".to_string()))?;
        Ok(client)
    }
}

/// Replays a scripted sequence of poll replies; the last one repeats.
pub struct ScriptedDevice {
    polls: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    installs: Mutex<Vec<String>>,
    delays: Mutex<HashMap<u32, Duration>>,
    ping_delay: Mutex<Option<Duration>>,
    pings: AtomicU32,
    poll_count: AtomicU32,
}

impl ScriptedDevice {
    pub fn new<I, S>(states: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let polls = states
            .into_iter()
            .map(|s| {
                let state: String = s.into();
                Ok(flat_state(&state))
            })
            .collect();
        Self::with_replies(polls)
    }

    /// Raw bodies, `Err` for a failed request.
    pub fn with_replies(polls: VecDeque<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            polls: Mutex::new(polls),
            last: Mutex::new(None),
            installs: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            ping_delay: Mutex::new(None),
            pings: AtomicU32::new(0),
            poll_count: AtomicU32::new(0),
        })
    }

    /// Hold the reply to the `poll`-th request (1-based) for `delay`.
    pub fn delay_poll(&self, poll: u32, delay: Duration) {
        self.delays.lock().unwrap().insert(poll, delay);
    }

    pub fn slow_pings(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = Some(delay);
    }

    pub fn installs(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }

    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> u32 {
        self.poll_count.load(Ordering::SeqCst)
    }
}

/// Body of the device's state file for `state`.
pub fn flat_state(state: &str) -> String {
    format!(r#"{{"Process":"swupdate","State":"{}","ErrorReason":"","timeout":0}}"#, state)
}

#[async_trait]
impl DeviceApi for ScriptedDevice {
    async fn poll_state(&self) -> Result<String, UpdateError> {
        let count = self.poll_count.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.delays.lock().unwrap().remove(&count);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.polls.lock().unwrap().pop_front();
        let reply = match next {
            Some(reply) => {
                *self.last.lock().unwrap() = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("no scripted reply".to_string())),
        };
        reply.map_err(UpdateError::Communication)
    }

    async fn start_install(&self, asset_name: &str) -> Result<(), UpdateError> {
        self.installs.lock().unwrap().push(asset_name.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<(), UpdateError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ping_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
