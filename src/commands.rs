//! CLI subcommand implementations.
//!
//! Each command dials the helper over IPC, exchanges typed envelopes, and
//! prints for humans. Commands degrade gracefully when the helper is not
//! running; `stop` in particular is best-effort by design.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::ipc::payload::{
    AgentInfo, CheckUpdatesResponse, ErrorResponse, GetAgentRequest, InstallAgentRequest,
    ListAgentsResponse, StatusResponse, UninstallAgentRequest, UpdateAgentRequest,
};
use crate::ipc::{Client, Envelope, IpcError, MessageType};
use crate::platform::Platform;

/// Bound on dialing the helper socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on one request/response round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial the helper, or explain how to start it.
async fn connect(platform: &Platform, config: &Config) -> Result<Client> {
    let address = config.socket_address(platform);
    let client = Client::new(address);
    match client.connect(CONNECT_TIMEOUT).await {
        Ok(()) => Ok(client),
        Err(IpcError::Dial { .. }) => {
            bail!("The helper is not running. Start it with: agenthub helper")
        }
        Err(e) => Err(e.into()),
    }
}

/// Round trip one request and insist on a `success` response.
async fn request(client: &Client, envelope: &Envelope) -> Result<Envelope> {
    let response = client.send_timeout(envelope, REQUEST_TIMEOUT).await?;
    match response.message_type {
        MessageType::Success => Ok(response),
        MessageType::Error => {
            let error: Option<ErrorResponse> = response.decode_payload()?;
            match error {
                Some(error) => bail!("helper error ({}): {}", error.code, error.message),
                None => bail!("helper returned an error with no detail"),
            }
        }
        other => bail!("unexpected response type: {other}"),
    }
}

fn print_agent(agent: &AgentInfo) {
    let version = agent.version.as_deref().unwrap_or("-");
    let latest = agent.latest_version.as_deref().unwrap_or("-");
    let installed = if agent.installed { "installed" } else { "available" };
    println!("  {:<24} {:<10} {:<12} latest {latest}", agent.id, installed, version);
}

/// `agenthub status`
pub async fn status(platform: &Platform, config: &Config) -> Result<()> {
    let client = connect(platform, config).await?;
    let response = request(&client, &Envelope::new(MessageType::GetStatus)).await?;
    let status: StatusResponse = response
        .decode_payload()?
        .context("status response had no payload")?;
    println!("Helper is running (pid {})", status.pid);
    println!("  uptime:            {}s", status.uptime_seconds);
    println!("  agents:            {}", status.agent_count);
    println!("  updates available: {}", status.updates_available);
    if let Some(refreshed) = status.last_catalog_refresh {
        println!("  catalog refreshed: {}", refreshed.to_rfc3339());
    }
    if let Some(checked) = status.last_update_check {
        println!("  updates checked:   {}", checked.to_rfc3339());
    }
    client.disconnect();
    Ok(())
}

/// `agenthub list`
pub async fn list(platform: &Platform, config: &Config) -> Result<()> {
    let client = connect(platform, config).await?;
    let response = request(&client, &Envelope::new(MessageType::ListAgents)).await?;
    let list: ListAgentsResponse = response
        .decode_payload()?
        .context("list response had no payload")?;
    if list.agents.is_empty() {
        println!("No agents known to the helper.");
    } else {
        println!("Agents ({}):", list.agents.len());
        for agent in &list.agents {
            print_agent(agent);
        }
    }
    client.disconnect();
    Ok(())
}

/// `agenthub show <agent>`
pub async fn show(platform: &Platform, config: &Config, agent_id: &str) -> Result<()> {
    let client = connect(platform, config).await?;
    let payload = GetAgentRequest {
        agent_id: agent_id.to_string(),
    };
    let envelope = Envelope::with_payload(MessageType::GetAgent, &payload)?;
    let response = request(&client, &envelope).await?;
    let agent: AgentInfo = response
        .decode_payload()?
        .context("agent response had no payload")?;
    print_agent(&agent);
    client.disconnect();
    Ok(())
}

/// `agenthub install <agent>`
pub async fn install(
    platform: &Platform,
    config: &Config,
    agent_id: &str,
    method: Option<String>,
    global: bool,
) -> Result<()> {
    let client = connect(platform, config).await?;
    let payload = InstallAgentRequest {
        agent_id: agent_id.to_string(),
        method,
        global,
    };
    let envelope = Envelope::with_payload(MessageType::InstallAgent, &payload)?;
    request(&client, &envelope).await?;
    println!("Installed {agent_id}.");
    client.disconnect();
    Ok(())
}

/// `agenthub update <agent>`
pub async fn update(platform: &Platform, config: &Config, agent_id: &str) -> Result<()> {
    let client = connect(platform, config).await?;
    let payload = UpdateAgentRequest {
        agent_id: agent_id.to_string(),
    };
    let envelope = Envelope::with_payload(MessageType::UpdateAgent, &payload)?;
    request(&client, &envelope).await?;
    println!("Updated {agent_id}.");
    client.disconnect();
    Ok(())
}

/// `agenthub uninstall <agent>`
pub async fn uninstall(platform: &Platform, config: &Config, agent_id: &str) -> Result<()> {
    let client = connect(platform, config).await?;
    let payload = UninstallAgentRequest {
        agent_id: agent_id.to_string(),
    };
    let envelope = Envelope::with_payload(MessageType::UninstallAgent, &payload)?;
    request(&client, &envelope).await?;
    println!("Uninstalled {agent_id}.");
    client.disconnect();
    Ok(())
}

/// `agenthub refresh`
pub async fn refresh(platform: &Platform, config: &Config) -> Result<()> {
    let client = connect(platform, config).await?;
    request(&client, &Envelope::new(MessageType::RefreshCatalog)).await?;
    println!("Catalog refreshed.");
    client.disconnect();
    Ok(())
}

/// `agenthub check-updates`
pub async fn check_updates(platform: &Platform, config: &Config) -> Result<()> {
    let client = connect(platform, config).await?;
    let response = request(&client, &Envelope::new(MessageType::CheckUpdates)).await?;
    let check: CheckUpdatesResponse = response
        .decode_payload()?
        .context("check response had no payload")?;
    if check.updates.is_empty() {
        println!("All agents are up to date.");
    } else {
        println!("Updates available ({}):", check.updates.len());
        for entry in &check.updates {
            let current = entry.current_version.as_deref().unwrap_or("-");
            println!("  {:<24} {current} -> {}", entry.agent_id, entry.latest_version);
        }
    }
    client.disconnect();
    Ok(())
}

/// `agenthub stop`
///
/// Best-effort: the helper tears down without acknowledging, so dial and
/// send failures are reported as warnings, not errors.
pub async fn stop(platform: &Platform, config: &Config) -> Result<()> {
    let address = config.socket_address(platform);
    let client = Client::new(address);
    if let Err(e) = client.connect(CONNECT_TIMEOUT).await {
        log::debug!("Stop: dial failed: {e}");
        println!("Helper is not running.");
        return Ok(());
    }
    match client.send_async(&Envelope::new(MessageType::Shutdown)).await {
        Ok(()) => println!("Stop request sent."),
        Err(e) => {
            log::debug!("Stop: send failed: {e}");
            println!("Helper may have shut down before acknowledging the stop request.");
        }
    }
    client.disconnect();
    Ok(())
}

/// `agenthub watch`
///
/// Subscribes to helper notifications and prints them until interrupted.
pub async fn watch(platform: &Platform, config: &Config) -> Result<()> {
    let client = connect(platform, config).await?;
    client.subscribe(|envelope| {
        let detail = envelope
            .payload
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!("[{}] {} {detail}", envelope.timestamp.to_rfc3339(), envelope.message_type);
    });
    println!("Watching helper notifications (Ctrl-C to exit)...");
    tokio::signal::ctrl_c().await?;
    client.disconnect();
    Ok(())
}
