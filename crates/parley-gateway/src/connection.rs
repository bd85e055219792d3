use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_types::events::ClientCommand;
use parley_types::models::Identity;

use crate::error::HubError;
use crate::hub::Hub;

/// Drive an admitted WebSocket connection until it closes.
///
/// Three tasks run per connection: `send` drains the outbound queue and
/// keeps the heartbeat, `recv` decodes frames into the bounded inbound queue,
/// and `dispatch` applies commands in arrival order. Commands already queued
/// when the socket closes still run before the hub cleans up.
pub async fn handle_connection(socket: WebSocket, hub: Hub, identity: Identity) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", identity.display_name, identity.id);

    let (session, mut outbound) = hub.connect(identity).await;
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientCommand>(hub.config().inbound_queue);
    let heartbeat_interval = hub.config().heartbeat_interval;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward outbound events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        // Bounded: a flooding client waits here, not the hub.
                        if cmd_tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_session.identity.display_name,
                            recv_session.user_id(),
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        recv_session.handle.send(
                            HubError::validation(format!("malformed command: {}", e)).to_event(),
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Apply commands in order
    let dispatch_hub = hub.clone();
    let dispatch_session = session.clone();
    let dispatch_task = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            dispatch_hub.dispatch(&dispatch_session, cmd).await;
        }
    });

    // Wait for either side of the socket to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {},
    }

    // The inbound queue is closed now; let accepted commands finish.
    if let Err(e) = dispatch_task.await {
        warn!("Dispatch task for {} ended abnormally: {}", session.user_id(), e);
    }
    send_task.abort();

    hub.disconnect(&session).await;
}
