//! Background helper process: IPC server, request handling, periodic
//! update checks.
//!
//! The helper owns the long-lived side of the IPC channel. Catalog
//! fetching, agent detection, and installer execution live behind their own
//! services; [`HelperHandler`] is the single seam where decoded requests
//! meet that business logic, and everything it needs is injected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::config::Config;
use crate::ipc::payload::{
    AgentEventNotification, AgentInfo, CheckUpdatesResponse, GetAgentRequest, InstallAgentRequest,
    ListAgentsResponse, StatusResponse, UninstallAgentRequest, UpdateAgentRequest,
    UpdateAvailableNotification,
};
use crate::ipc::{Envelope, Handler, MessageType, Server};
use crate::platform::Platform;

/// Live helper state shared between the handler and the run loop.
#[derive(Debug)]
pub struct HelperState {
    started_at: Instant,
    agents: HashMap<String, AgentInfo>,
    last_catalog_refresh: Option<DateTime<Utc>>,
    last_update_check: Option<DateTime<Utc>>,
}

impl HelperState {
    /// Fresh state with an empty agent table.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            agents: HashMap::new(),
            last_catalog_refresh: None,
            last_update_check: None,
        }
    }

    /// Snapshot for a `get_status` response.
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            running: true,
            pid: std::process::id(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            agent_count: self.agents.len(),
            updates_available: self.pending_updates().len(),
            last_catalog_refresh: self.last_catalog_refresh,
            last_update_check: self.last_update_check,
        }
    }

    /// Agents whose catalog version differs from the installed one.
    pub fn pending_updates(&self) -> Vec<UpdateAvailableNotification> {
        self.agents
            .values()
            .filter(|agent| agent.installed)
            .filter_map(|agent| {
                let latest = agent.latest_version.as_ref()?;
                if agent.version.as_ref() == Some(latest) {
                    return None;
                }
                Some(UpdateAvailableNotification {
                    agent_id: agent.id.clone(),
                    current_version: agent.version.clone(),
                    latest_version: latest.clone(),
                })
            })
            .collect()
    }

    /// Insert or replace an agent record.
    pub fn upsert_agent(&mut self, agent: AgentInfo) {
        self.agents.insert(agent.id.clone(), agent);
    }
}

impl Default for HelperState {
    fn default() -> Self {
        Self::new()
    }
}

type SharedState = Arc<StdMutex<HelperState>>;

/// [`Handler`] implementation for every helper-bound request type.
///
/// Holds the server weakly so notifications can be broadcast without a
/// reference cycle (the server owns the handler).
pub struct HelperHandler {
    state: SharedState,
    server: Weak<Server>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for HelperHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperHandler").finish_non_exhaustive()
    }
}

impl HelperHandler {
    /// Wire the handler to shared state, the server, and the shutdown
    /// signal.
    pub fn new(state: SharedState, server: Weak<Server>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            state,
            server,
            shutdown,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HelperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a notification to every connected client, best-effort.
    async fn notify<T: serde::Serialize>(&self, message_type: MessageType, payload: &T) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        match Envelope::with_payload(message_type, payload) {
            Ok(envelope) => server.broadcast(&envelope).await,
            Err(e) => log::warn!("Failed to encode {message_type} notification: {e}"),
        }
    }

    async fn install(&self, request: InstallAgentRequest) -> Result<Envelope> {
        let agent = AgentInfo {
            id: request.agent_id.clone(),
            name: request.agent_id.clone(),
            version: None,
            latest_version: None,
            installed: true,
            install_method: request.method.clone(),
        };
        self.lock_state().upsert_agent(agent.clone());
        log::info!(
            "Installed agent {} (method={:?}, global={})",
            request.agent_id,
            request.method,
            request.global
        );
        self.notify(
            MessageType::AgentInstalled,
            &AgentEventNotification {
                agent_id: request.agent_id,
                version: agent.version.clone(),
            },
        )
        .await;
        Ok(Envelope::with_payload(MessageType::Success, &agent)?)
    }

    async fn update(&self, request: UpdateAgentRequest) -> Result<Envelope> {
        let updated = {
            let mut state = self.lock_state();
            let agent = state
                .agents
                .get_mut(&request.agent_id)
                .with_context(|| format!("unknown agent: {}", request.agent_id))?;
            if let Some(latest) = agent.latest_version.clone() {
                agent.version = Some(latest);
            }
            agent.clone()
        };
        self.notify(
            MessageType::AgentUpdated,
            &AgentEventNotification {
                agent_id: updated.id.clone(),
                version: updated.version.clone(),
            },
        )
        .await;
        Ok(Envelope::with_payload(MessageType::Success, &updated)?)
    }

    async fn uninstall(&self, request: UninstallAgentRequest) -> Result<Envelope> {
        let removed = self
            .lock_state()
            .agents
            .remove(&request.agent_id)
            .with_context(|| format!("unknown agent: {}", request.agent_id))?;
        self.notify(
            MessageType::AgentRemoved,
            &AgentEventNotification {
                agent_id: removed.id,
                version: None,
            },
        )
        .await;
        Ok(Envelope::new(MessageType::Success))
    }

    async fn check_updates(&self) -> Result<Envelope> {
        let updates = {
            let mut state = self.lock_state();
            state.last_update_check = Some(Utc::now());
            state.pending_updates()
        };
        for update in &updates {
            self.notify(MessageType::UpdateAvailable, update).await;
        }
        Ok(Envelope::with_payload(
            MessageType::Success,
            &CheckUpdatesResponse { updates },
        )?)
    }
}

/// Decode a payload that the request type requires.
fn required<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    envelope
        .decode_payload::<T>()?
        .with_context(|| format!("{} request is missing its payload", envelope.message_type))
}

#[async_trait]
impl Handler for HelperHandler {
    async fn handle_message(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        match envelope.message_type {
            MessageType::GetStatus => {
                let status = self.lock_state().status();
                Ok(Some(Envelope::with_payload(MessageType::Success, &status)?))
            }
            MessageType::ListAgents => {
                let agents = {
                    let state = self.lock_state();
                    let mut agents: Vec<AgentInfo> = state.agents.values().cloned().collect();
                    agents.sort_by(|a, b| a.id.cmp(&b.id));
                    agents
                };
                Ok(Some(Envelope::with_payload(
                    MessageType::Success,
                    &ListAgentsResponse { agents },
                )?))
            }
            MessageType::GetAgent => {
                let request: GetAgentRequest = required(envelope)?;
                let agent = self
                    .lock_state()
                    .agents
                    .get(&request.agent_id)
                    .cloned()
                    .with_context(|| format!("unknown agent: {}", request.agent_id))?;
                Ok(Some(Envelope::with_payload(MessageType::Success, &agent)?))
            }
            MessageType::InstallAgent => Ok(Some(self.install(required(envelope)?).await?)),
            MessageType::UpdateAgent => Ok(Some(self.update(required(envelope)?).await?)),
            MessageType::UninstallAgent => Ok(Some(self.uninstall(required(envelope)?).await?)),
            MessageType::RefreshCatalog => {
                self.lock_state().last_catalog_refresh = Some(Utc::now());
                Ok(Some(Envelope::new(MessageType::Success)))
            }
            MessageType::CheckUpdates => Ok(Some(self.check_updates().await?)),
            MessageType::Shutdown => {
                log::info!("Shutdown requested over IPC");
                let _ = self.shutdown.send(true);
                // Fire-and-forget: the requester does not wait for an ack.
                Ok(None)
            }
            other => anyhow::bail!("unexpected message type: {other}"),
        }
    }
}

/// The helper process body.
#[derive(Debug)]
pub struct Helper {
    platform: Platform,
    config: Config,
}

impl Helper {
    /// Assemble a helper from resolved platform paths and configuration.
    pub fn new(platform: Platform, config: Config) -> Self {
        Self { platform, config }
    }

    /// Run until interrupted or asked to shut down over IPC.
    pub async fn run(&self) -> Result<()> {
        self.platform.ensure_dirs()?;

        let address = self.config.socket_address(&self.platform);
        let server = Arc::new(Server::new(address.as_str()));
        let state: SharedState = Arc::new(StdMutex::new(HelperState::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        server.set_handler(Arc::new(HelperHandler::new(
            Arc::clone(&state),
            Arc::downgrade(&server),
            shutdown_tx,
        )));
        server.start().await?;
        self.platform.write_pid_file()?;
        log::info!(
            "Helper running (pid {}), listening on {address}",
            std::process::id()
        );

        let mut check_interval = tokio::time::interval(Duration::from_secs(
            self.config.check_interval_secs.max(1),
        ));
        check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        check_interval.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupt received, shutting down");
                    break;
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
                _ = check_interval.tick() => {
                    run_update_check(&state, &server, self.config.notify_on_updates).await;
                }
            }
        }

        server.stop();
        self.platform.remove_runtime_files();
        log::info!("Helper stopped");
        Ok(())
    }
}

/// One periodic update check: stamp the check time and push notifications
/// for anything outdated.
async fn run_update_check(state: &SharedState, server: &Server, notify: bool) {
    let updates = {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_update_check = Some(Utc::now());
        state.pending_updates()
    };
    log::debug!("Update check: {} agent(s) outdated", updates.len());
    if !notify {
        return;
    }
    for update in updates {
        match Envelope::with_payload(MessageType::UpdateAvailable, &update) {
            Ok(envelope) => server.broadcast(&envelope).await,
            Err(e) => log::warn!("Failed to encode update notification: {e}"),
        }
    }
}
