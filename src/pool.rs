//! Registry of live engine clients.
//!
//! One shared client is created lazily and kept for the life of the process;
//! exclusive clients are created per job and released when the job is done.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OnceCell, RwLock};
use tracing::{error, info, warn};

use crate::engine::{EngineApi, EngineLauncher, EngineProcess, LaunchSpec};
use crate::error::SpawnError;
use crate::ports::{PortAllocator, PortRange};
use crate::types::{ClientId, ClientKind};

/// An API handle bound to one engine process.
#[derive(Debug)]
pub struct EngineClient {
    id: ClientId,
    kind: ClientKind,
    port: u16,
    api: EngineApi,
    live: AtomicBool,
    process: Mutex<Option<EngineProcess>>,
}

impl EngineClient {
    fn new(id: ClientId, kind: ClientKind, port: u16, api: EngineApi, process: EngineProcess) -> Self {
        Self {
            id,
            kind,
            port,
            api,
            live: AtomicBool::new(true),
            process: Mutex::new(Some(process)),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn api(&self) -> &EngineApi {
        &self.api
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn retire(&self) -> Option<EngineProcess> {
        self.live.store(false, Ordering::Release);
        self.process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Summary of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub kind: ClientKind,
    pub port: u16,
}

pub struct ClientPool {
    launcher: Arc<dyn EngineLauncher>,
    clients: RwLock<HashMap<ClientId, Arc<EngineClient>>>,
    ports: Mutex<PortAllocator>,
    shared: OnceCell<ClientId>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("shared", &self.shared.get())
            .finish_non_exhaustive()
    }
}

impl ClientPool {
    pub fn new(launcher: Arc<dyn EngineLauncher>, ports: PortRange) -> Self {
        Self {
            launcher,
            clients: RwLock::new(HashMap::new()),
            ports: Mutex::new(PortAllocator::new(ports)),
            shared: OnceCell::new(),
        }
    }

    /// The shared client, spawning it on first use.
    ///
    /// Passive scanning is switched off once at creation so crawl jobs on the
    /// shared engine behave the same regardless of what ran before.
    pub async fn get_or_create_shared_client(&self) -> Result<Arc<EngineClient>, SpawnError> {
        let id = *self
            .shared
            .get_or_try_init(|| async {
                let client = self.spawn_client(ClientKind::Shared).await?;
                if let Err(e) = client.api().passive_set_enabled(false).await {
                    error!(client_id = %client.id(), error = %e, "failed to disable passive scan of shared engine");
                }
                Ok::<_, SpawnError>(client.id())
            })
            .await?;
        self.client(id).await.ok_or(SpawnError::ExitedEarly {
            kind: ClientKind::Shared.as_str(),
            code: None,
        })
    }

    pub fn shared_client_id(&self) -> Option<ClientId> {
        self.shared.get().copied()
    }

    /// Spawn a fresh engine owned by a single job.
    pub async fn new_exclusive_client(&self) -> Result<Arc<EngineClient>, SpawnError> {
        self.spawn_client(ClientKind::Exclusive).await
    }

    async fn spawn_client(&self, kind: ClientKind) -> Result<Arc<EngineClient>, SpawnError> {
        let port = self.allocate_port()?;
        let id = ClientId::new();
        let process = match self
            .launcher
            .launch(LaunchSpec {
                client_id: id,
                kind,
                port,
            })
            .await
        {
            Ok(process) => process,
            Err(e) => {
                self.return_port(port);
                return Err(e);
            }
        };

        let api = EngineApi::new(self.launcher.connect(port));
        let client = Arc::new(EngineClient::new(id, kind, port, api, process));
        self.clients.write().await.insert(id, client.clone());
        info!(client_id = %id, port, kind = kind.as_str(), "engine client registered");
        Ok(client)
    }

    /// Next port to bind: a released one if any, else the next unused one.
    pub fn allocate_port(&self) -> Result<u16, SpawnError> {
        let mut ports = self.ports.lock().unwrap_or_else(|p| p.into_inner());
        ports.allocate().ok_or_else(|| {
            let range = ports.range();
            SpawnError::PortsExhausted {
                first: range.first(),
                last: range.last(),
            }
        })
    }

    fn return_port(&self, port: u16) {
        let mut ports = self.ports.lock().unwrap_or_else(|p| p.into_inner());
        ports.release(port);
    }

    pub async fn client(&self, id: ClientId) -> Option<Arc<EngineClient>> {
        self.clients.read().await.get(&id).cloned()
    }

    pub async fn is_live(&self, id: ClientId) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    pub async fn live_clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| ClientInfo {
                id: c.id(),
                kind: c.kind(),
                port: c.port(),
            })
            .collect()
    }

    /// Shut an exclusive client down and return its port.
    ///
    /// Releasing an unknown (or already released) id only logs a warning. The
    /// shared client is left alone; see [`ClientPool::release_all_clients`].
    pub async fn release_client(&self, id: ClientId) -> bool {
        let client = {
            let mut clients = self.clients.write().await;
            match clients.get(&id) {
                None => {
                    warn!(client_id = %id, "release of unknown engine client");
                    return false;
                }
                Some(c) if c.kind() == ClientKind::Shared => {
                    warn!(client_id = %id, "refusing to release the shared engine client");
                    return false;
                }
                Some(_) => clients.remove(&id),
            }
        };
        match client {
            Some(client) => {
                self.shut_down(client).await;
                true
            }
            None => false,
        }
    }

    /// Best-effort shutdown of every client, shared included.
    pub async fn release_all_clients(&self) {
        let drained: Vec<_> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        info!(count = drained.len(), "shutting down all engine clients");
        futures::future::join_all(drained.into_iter().map(|c| self.shut_down(c))).await;
    }

    async fn shut_down(&self, client: Arc<EngineClient>) {
        match client.api().shutdown().await {
            Ok(()) => info!(client_id = %client.id(), "engine client shut down"),
            Err(e) => error!(client_id = %client.id(), error = %e, "error while shutting down engine client"),
        }
        drop(client.retire());
        self.return_port(client.port());
    }
}
