//! In-process mesh bridge for tests and demos.
//!
//! [`LoopbackMesh::create_pair`] returns two radios that only see each
//! other: once both are enabled and connected, messages sent on one are
//! delivered to the other's listeners.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::mesh::{DeviceInfo, MeshBridge, MeshError, MeshMessage, MeshPayload};

/// Signal strength reported for the paired radio.
const LOOPBACK_SIGNAL: i32 = -40;

#[derive(Debug)]
struct Radio {
    id: String,
    enabled: bool,
    connected: HashSet<String>,
    listeners: Vec<mpsc::UnboundedSender<MeshMessage>>,
}

impl Radio {
    fn new(id: String) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            id,
            enabled: false,
            connected: HashSet::new(),
            listeners: Vec::new(),
        }))
    }
}

/// One end of an in-process radio pair.
#[derive(Debug)]
pub struct LoopbackMesh {
    local: Arc<Mutex<Radio>>,
    remote: Arc<Mutex<Radio>>,
}

impl LoopbackMesh {
    /// Creates two radios, `id_a` and `id_b`, in range of each other.
    ///
    /// Both start disabled.
    #[must_use]
    pub fn create_pair(id_a: impl Into<String>, id_b: impl Into<String>) -> (Self, Self) {
        let a = Radio::new(id_a.into());
        let b = Radio::new(id_b.into());
        (
            Self {
                local: Arc::clone(&a),
                remote: Arc::clone(&b),
            },
            Self {
                local: b,
                remote: a,
            },
        )
    }

    /// This radio's peer id.
    #[must_use]
    pub fn id(&self) -> String {
        self.local.lock().id.clone()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.local.lock().listeners.len()
    }

    fn deliver(&self, peer_id: &str, payload: MeshPayload) -> Result<(), MeshError> {
        let from = {
            let local = self.local.lock();
            if !local.enabled {
                return Err(MeshError::Disabled);
            }
            if !local.connected.contains(peer_id) {
                return Err(MeshError::NotConnected(peer_id.to_string()));
            }
            local.id.clone()
        };

        let mut remote = self.remote.lock();
        if !remote.enabled {
            return Err(MeshError::NotConnected(peer_id.to_string()));
        }
        let msg = MeshMessage { from, payload };
        remote
            .listeners
            .retain(|listener| listener.send(msg.clone()).is_ok());
        Ok(())
    }
}

impl MeshBridge for LoopbackMesh {
    async fn enable(&self) -> Result<(), MeshError> {
        self.local.lock().enabled = true;
        Ok(())
    }

    async fn is_enabled(&self) -> bool {
        self.local.lock().enabled
    }

    async fn scan(&self, _duration: Duration) -> Result<Vec<DeviceInfo>, MeshError> {
        if !self.local.lock().enabled {
            return Err(MeshError::Disabled);
        }
        let remote = self.remote.lock();
        if !remote.enabled {
            return Ok(Vec::new());
        }
        Ok(vec![DeviceInfo {
            id: remote.id.clone(),
            name: Some(format!("loopback {}", remote.id)),
            signal_strength: Some(LOOPBACK_SIGNAL),
        }])
    }

    async fn connect(&self, peer_id: &str) -> Result<bool, MeshError> {
        let reachable = {
            let remote = self.remote.lock();
            remote.enabled && remote.id == peer_id
        };
        let mut local = self.local.lock();
        if !local.enabled {
            return Err(MeshError::Disabled);
        }
        if reachable {
            local.connected.insert(peer_id.to_string());
        }
        Ok(reachable)
    }

    async fn disconnect(&self, peer_id: &str) -> Result<(), MeshError> {
        self.local.lock().connected.remove(peer_id);
        Ok(())
    }

    async fn send_message(&self, peer_id: &str, payload: MeshPayload) -> Result<(), MeshError> {
        self.deliver(peer_id, payload)
    }

    async fn send_file(&self, peer_id: &str, bytes_base64: &str, name: &str) -> Result<(), MeshError> {
        self.deliver(
            peer_id,
            MeshPayload {
                bytes_base64: Some(bytes_base64.to_string()),
                name: Some(name.to_string()),
                text: None,
            },
        )
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<MeshMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local.lock().listeners.push(tx);
        rx
    }

    fn remove_all_listeners(&self) {
        self.local.lock().listeners.clear();
    }
}
