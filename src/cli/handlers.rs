use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::client::{ActiveAgentsFeed, AgentClient, AuthErrorState, AuthMonitor, TcpConnectivity};
use crate::core::{Role, Session};
use crate::session::{AttachOutcome, CoordinatorHandle, InputState, SendOutcome, SessionHub, StoreEvent};
use crate::{Config, Result};

fn build_client(config: &Config) -> Result<AgentClient> {
    let connectivity = TcpConnectivity::new(
        config.connectivity.probe_addr.clone(),
        config.connectivity.timeout(),
    );
    let auth = AuthMonitor::new(Arc::new(connectivity));
    Ok(AgentClient::from_config(config, auth)?)
}

async fn connect(config: &Config) -> Result<(AgentClient, SessionHub)> {
    let client = build_client(config)?;
    if !client.is_server_running().await {
        anyhow::bail!(
            "Backend at {} is not reachable. Check the URL or pass --server.",
            client.base_url()
        );
    }
    let hub = SessionHub::from_client(client.clone(), config);
    Ok((client, hub))
}

pub async fn send_message(config: Config, session_id: String, message: String) -> Result<()> {
    let (_client, hub) = connect(&config).await?;
    hub.set_viewing(Some(&session_id)).await;

    let events = hub.store().subscribe();
    let outcome = hub.send(&session_id, &message).await;
    let result = match outcome {
        Ok(SendOutcome::Enqueued) => {
            println!("📨 Message queued for the running agent");
            Ok(())
        }
        Ok(outcome) => {
            if let SendOutcome::Resumed { from } = outcome {
                tracing::info!(
                    "Agent was already running, resumed at chunk {} / step {}",
                    from.chunks_delivered,
                    from.steps_delivered
                );
            }
            render_until_idle(&hub, &hub.coordinator(&session_id), events).await
        }
        Err(e) => Err(e.into()),
    };

    report_auth_state(hub.auth());
    hub.shutdown().await;
    result
}

pub async fn attach_session(config: Config, session_id: String) -> Result<()> {
    let (_client, hub) = connect(&config).await?;
    hub.set_viewing(Some(&session_id)).await;

    let events = hub.store().subscribe();
    let result = match hub.attach(&session_id).await {
        Ok(AttachOutcome::Resumed { from }) => {
            println!(
                "🔄 Reattached at chunk {} / step {}",
                from.chunks_delivered, from.steps_delivered
            );
            render_until_idle(&hub, &hub.coordinator(&session_id), events).await
        }
        Ok(AttachOutcome::Idle) => {
            println!("💤 No agent is running in session {}", session_id);
            Ok(())
        }
        Err(e) => Err(e.into()),
    };

    report_auth_state(hub.auth());
    hub.shutdown().await;
    result
}

pub async fn abort_session(config: Config, session_id: String) -> Result<()> {
    let (_client, hub) = connect(&config).await?;
    hub.abort(&session_id).await?;
    println!("🛑 Abort sent to session {}", session_id);
    hub.shutdown().await;
    Ok(())
}

pub async fn disconnect_session(config: Config, session_id: String) -> Result<()> {
    let client = build_client(&config)?;
    let outcome = client.disconnect(&session_id).await?;
    if outcome.deferred {
        println!("⏸️  Agent still running, {} will disconnect when it finishes", session_id);
    } else if outcome.success {
        println!("🔌 Disconnected session {}", session_id);
    } else {
        println!("❓ Backend did not confirm the disconnect");
    }
    Ok(())
}

pub async fn show_messages(config: Config, session_id: String) -> Result<()> {
    let client = build_client(&config)?;
    let session = client.get_session(&session_id).await?;

    println!("💬 {} ({})", session.session.session_name, session.session.session_id);
    if session.messages.is_empty() {
        println!("   No messages yet");
    }
    for message in session.messages {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "agent",
        };
        println!("\n[{}] {}", speaker, message.timestamp.format("%Y-%m-%d %H:%M:%S"));
        for step in message.steps.iter().flatten() {
            println!("  ▸ {}", step.title);
        }
        println!("{}", message.content);
    }
    Ok(())
}

pub async fn list_sessions(config: Config) -> Result<()> {
    let (client, hub) = connect(&config).await?;
    let sessions = client.list_sessions().await?;

    match client.viewed_timestamps().await {
        Ok(viewed) => hub.store().apply_viewed_timestamps(&viewed),
        Err(e) => tracing::debug!("Could not load viewed timestamps: {}", e),
    }
    for session in &sessions {
        hub.store().upsert_session(session.clone());
    }
    if let Ok(agents) = client.fetch_active_agents().await {
        hub.store().sync_active_agents(&agents);
    }

    println!("📋 Sessions:");
    if sessions.is_empty() {
        println!("   No sessions found");
    }
    for session in &sessions {
        let view = hub.store().snapshot(&session.session_id);
        let marker = if view.agent_active {
            "🚀"
        } else if view.is_unread() {
            "🔵"
        } else {
            "  "
        };
        println!("{} {} {}", marker, session.session_id, describe(session));
    }
    Ok(())
}

fn describe(session: &Session) -> String {
    let mut line = session.session_name.clone();
    if let Some(cwd) = &session.cwd {
        line.push_str(&format!(" [{}]", cwd));
    }
    line.push_str(&format!(" - updated {}", session.updated_at.format("%Y-%m-%d %H:%M")));
    line
}

pub async fn set_cwd(config: Config, session_id: String, cwd: String) -> Result<()> {
    let (_client, hub) = connect(&config).await?;
    let session = hub.change_context(&session_id, &cwd).await?;
    println!(
        "📁 {} now runs in {}",
        session.session_name,
        session.cwd.as_deref().unwrap_or(&cwd)
    );
    println!("💡 The next message will re-establish the session first");
    Ok(())
}

pub async fn watch_agents(config: Config) -> Result<()> {
    let (client, hub) = connect(&config).await?;

    let agents = client.fetch_active_agents().await?;
    println!("👀 Watching agents ({} running). Ctrl+C to stop.", agents.count);
    for agent in &agents.sessions {
        println!("   🚀 {} {}", agent.session_id, agent.status.as_deref().unwrap_or("running"));
    }
    hub.store().sync_active_agents(&agents);

    let mut events = hub.store().subscribe();
    let mut auth = hub.auth().subscribe();
    hub.watch_active_agents();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = auth.changed() => {
                if changed.is_err() {
                    break;
                }
                report_auth_state(hub.auth());
            }
            event = events.recv() => match event {
                Ok(StoreEvent::AgentActivityChanged { session_id, active }) => {
                    if active {
                        println!("🚀 {} started", session_id);
                    } else {
                        println!("✅ {} finished", session_id);
                    }
                }
                Ok(StoreEvent::UnreadChanged { session_id, unread: true }) => {
                    println!("🔵 {} has new output", session_id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} store events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    hub.shutdown().await;
    Ok(())
}

pub async fn login(mut config: Config, token: String) -> Result<()> {
    let mut client = build_client(&config)?;
    client.set_token(Some(token.clone()));
    config.server.token = Some(token);

    match client.list_sessions().await {
        Ok(sessions) => println!("✅ Token accepted ({} sessions visible)", sessions.len()),
        Err(e) => {
            println!("❌ Token check failed: {}", e);
            anyhow::bail!("not saving a token the backend rejected");
        }
    }

    config.save()?;
    if let Some(path) = Config::config_file() {
        println!("💾 Saved to {}", path.display());
    }
    Ok(())
}

pub async fn show_status(config: Config) -> Result<()> {
    let client = build_client(&config)?;
    println!("🌐 Backend: {}", client.base_url());

    if !client.is_server_running().await {
        println!("❌ Not reachable");
        return Ok(());
    }
    println!("✅ Reachable");

    match client.fetch_active_agents().await {
        Ok(agents) => {
            println!("🤖 Active agents: {}", agents.count);
            for agent in agents.sessions {
                let step = agent
                    .current_step
                    .map(|step| format!(" ({})", step.title))
                    .unwrap_or_default();
                println!(
                    "   🚀 {} - {} chunks, {} steps{}",
                    agent.session_id, agent.chunks_delivered, agent.steps_delivered, step
                );
            }
        }
        Err(e) => println!("❌ Failed to load active agents: {}", e),
    }
    report_auth_state(client.auth());
    Ok(())
}

fn report_auth_state(auth: &AuthMonitor) {
    match auth.current() {
        Some(AuthErrorState::Unauthorized) => {
            println!("🔑 The backend rejected the stored token");
            println!("💡 Re-pair and run: agentlink login --token <token>");
        }
        Some(AuthErrorState::Network) => {
            println!("📡 Backend unreachable while this machine is online");
        }
        None => {}
    }
}

/// Print the session's store events until the coordinator goes idle.
/// Ctrl+C aborts the running agent.
async fn render_until_idle(
    hub: &SessionHub,
    handle: &CoordinatorHandle,
    mut events: broadcast::Receiver<StoreEvent>,
) -> Result<()> {
    let session_id = handle.session_id().to_string();
    let mut failed = None;

    {
        let idle = handle.wait_idle();
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = &mut idle => break,
                _ = tokio::signal::ctrl_c() => {
                    println!("\n🛑 Aborting...");
                    hub.abort(&session_id).await?;
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => render_event(&session_id, &event, &mut failed),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Output fell behind, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        render_event(&session_id, &event, &mut failed);
    }
    println!();

    match failed {
        Some(message) => anyhow::bail!("response failed: {}", message),
        None => Ok(()),
    }
}

fn render_event(session_id: &str, event: &StoreEvent, failed: &mut Option<String>) {
    if event.session_id() != session_id {
        return;
    }
    match event {
        StoreEvent::ContentAppended { content, .. } => {
            print!("{}", content);
            let _ = std::io::stdout().flush();
        }
        StoreEvent::StepAppended { step, .. } => match &step.detail {
            Some(detail) => println!("\n  ▸ {} ({})", step.title, detail),
            None => println!("\n  ▸ {}", step.title),
        },
        StoreEvent::InputChanged {
            input: InputState::Activating { placeholder },
            ..
        } => println!("⏳ {}", placeholder),
        StoreEvent::SessionRenamed { name, .. } => println!("\n📝 Session named \"{}\"", name),
        StoreEvent::ResponseFailed { message, .. } => {
            println!("\n❌ {}", message);
            *failed = Some(message.clone());
        }
        _ => {}
    }
}
