//! WebSocket transport: one reader processing inbound messages sequentially
//! per connection, one writer task draining the per-connection fan-out
//! channel, and the background jobs that keep the world ticking.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use persona_core::Result;

use crate::dispatcher::Dispatcher;
use crate::state::AppState;

/// Outbound frames buffered per connection before backpressure kicks in.
const OUTBOUND_CAPACITY: usize = 256;

/// Serve the JSON-RPC socket until the shutdown channel fires.
pub async fn run_server(state: Arc<AppState>, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let address = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|err| persona_core::Error::Internal(format!("failed to bind {address}: {err}")))?;
    info!(%address, "persona server listening on ws://{address}/mcp");

    spawn_background_tasks(&state, shutdown_rx.clone());

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, state).await {
                        error!(%peer, %err, "connection handler failed");
                    }
                });
            }
        }
    }

    info!("server shutting down");
    Ok(())
}

fn spawn_background_tasks(state: &Arc<AppState>, shutdown_rx: watch::Receiver<bool>) {
    // State regeneration tick: energy, fatigue, and emotional drift.
    {
        let state = state.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval =
            std::time::Duration::from_secs(state.config.session.tick_interval_seconds.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = state.engine.regenerate_states().await {
                            warn!(%err, "state regeneration tick failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    // Session sweep every 5 minutes.
    {
        let state = state.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(300);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        state.sessions.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    // Background decay, when enabled.
    if state.config.memory.decay_enabled {
        let decay = state.decay.clone();
        tokio::spawn(async move {
            decay.start().await;
        });
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> Result<()> {
    // Only the MCP path upgrades; anything else is turned away during the
    // handshake.
    let callback = |request: &Request, response: Response| {
        if request.uri().path() == "/mcp" {
            Ok(response)
        } else {
            Err(ErrorResponse::new(Some("expected path /mcp".to_string())))
        }
    };

    let websocket = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|err| persona_core::Error::Internal(format!("handshake failed: {err}")))?;
    let (mut sink, mut reader) = websocket.split();

    let connection_id = Uuid::new_v4().to_string();
    info!(connection = %connection_id, "client connected");

    // Writer task: the single ordered sink shared by responses and stream
    // frames.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
        info!(connection = %writer_connection, "writer closed");
    });

    let dispatcher = Dispatcher::new(state.clone());

    // Inbound messages are processed sequentially; only transport errors end
    // the loop.
    while let Some(message) = reader.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(connection = %connection_id, %err, "transport error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                dispatcher
                    .handle_message(text.as_str(), &connection_id, &out_tx)
                    .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
        }
    }

    state.sessions.cleanup_connection(&connection_id);
    drop(out_tx);
    let _ = writer.await;
    info!(connection = %connection_id, "client disconnected");
    Ok(())
}
