//! The per-connection read and write pumps.
//!
//! Every upgraded connection runs two cooperative tasks. The read pump owns
//! the read half: it enforces the keepalive deadline, answers Pings,
//! absorbs Pongs, and routes application frames to the `on_message`
//! callback or the context's inbound queue. The write pump owns the write
//! half: it drains the outbound queue under the write deadline, pings on a
//! ticker, and emits a Close frame exactly once on the way out. Both exit
//! within a bounded time of the connection closing — the write deadline
//! guarantees it even when the peer stops reading.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use lattice_core::UpgradeData;

use crate::config::WsConfig;
use crate::context::WsContext;
use crate::error::{WsError, WsResult};
use crate::message::{BoxWsSink, BoxWsSource, CloseFrame, WsMessage, close_code};
use crate::upgrade::WsEndpoint;

/// Capacity of the inbound queue between the read pump and
/// `WsContext::read_message`.
const INBOUND_QUEUE: usize = 32;

/// Drives one upgraded connection to completion.
///
/// Called by an adapter after its engine handshake. Spawns the write pump,
/// runs the `on_connect` hook, starts the user handler, and runs the read
/// pump inline; returns once the connection has fully torn down and
/// `on_disconnect` has run.
pub async fn run_connection(
    transport: Box<dyn crate::message::WsTransport>,
    endpoint: Arc<WsEndpoint>,
    upgrade_data: Arc<UpgradeData>,
    queries: HashMap<String, String>,
) {
    let config = &endpoint.config;
    let (sink, source) = transport.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let close_signal = CancellationToken::new();
    let connection_id = uuid::Uuid::new_v4().to_string();

    let ctx = Arc::new(WsContext::new(
        connection_id.clone(),
        outbound_tx,
        inbound_rx,
        upgrade_data,
        queries,
        close_signal.clone(),
    ));

    info!(connection = %connection_id, "websocket connection established");

    let write_task = tokio::spawn(write_pump(
        sink,
        outbound_rx,
        close_signal.clone(),
        config.clone(),
        connection_id.clone(),
    ));

    let mut hook_failed = false;
    if let Some(on_connect) = &config.on_connect {
        if let Err(err) = on_connect(ctx.clone()).await {
            warn!(connection = %connection_id, error = %err, "on_connect hook failed");
            let _ = ctx
                .close_with_status(close_code::INTERNAL_ERROR, "connect hook failed")
                .await;
            hook_failed = true;
        }
    }

    let (handler_task, result) = if hook_failed {
        (None, Ok(()))
    } else {
        let handler = endpoint.handler.clone();
        let handler_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = handler(handler_ctx).await {
                warn!(error = %err, "websocket handler returned error");
            }
        });
        let result = read_pump(source, &ctx, &endpoint, &inbound_tx).await;
        (Some(task), result)
    };

    // Signal the write pump, release any reader blocked on the inbound
    // queue, and wait for the write half to flush its Close frame.
    ctx.mark_closing();
    drop(inbound_tx);
    close_signal.cancel();
    let _ = write_task.await;
    ctx.mark_closed();

    if let Some(on_disconnect) = &endpoint.config.on_disconnect {
        on_disconnect(ctx.clone(), result.err()).await;
    }
    if let Some(task) = handler_task {
        let _ = task.await;
    }
    info!(connection = %connection_id, "websocket connection closed");
}

/// Reads frames until the connection ends.
///
/// The deadline for each read is `pong_wait` (or `read_timeout` when
/// keepalive is disabled); any inbound frame refreshes it. Control frames
/// are handled here and never reach application code.
async fn read_pump(
    mut source: BoxWsSource,
    ctx: &Arc<WsContext>,
    endpoint: &Arc<WsEndpoint>,
    inbound: &mpsc::Sender<WsMessage>,
) -> WsResult<()> {
    let config = &endpoint.config;
    let deadline = if config.ping_period.is_zero() {
        config.read_timeout
    } else {
        config.pong_wait
    };

    loop {
        let frame = match timeout(deadline, source.recv()).await {
            Err(_) => {
                info!(connection = %ctx.connection_id(), "keepalive window elapsed, disconnecting");
                return Err(WsError::Timeout("no frame within pong wait".into()));
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(err))) => {
                debug!(connection = %ctx.connection_id(), error = %err, "read error");
                return Err(err);
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Ping(payload) => {
                trace!(connection = %ctx.connection_id(), "ping, answering pong");
                // Control frames must not be lost to backpressure; a full
                // queue here means the peer is about to be disconnected
                // anyway.
                let _ = ctx.try_send(WsMessage::Pong(payload));
            }
            WsMessage::Pong(_) => {
                trace!(connection = %ctx.connection_id(), "pong");
            }
            WsMessage::Close(frame) => {
                debug!(
                    connection = %ctx.connection_id(),
                    code = frame.as_ref().map(|f| f.code),
                    "peer sent close"
                );
                ctx.mark_closing();
                return Ok(());
            }
            frame @ (WsMessage::Text(_) | WsMessage::Binary(_)) => {
                if let Some(on_message) = &config.on_message {
                    on_message(ctx.clone(), frame).await?;
                } else if inbound.send(frame).await.is_err() {
                    // Reader side gone; treat as a normal end.
                    return Ok(());
                }
            }
        }
    }
}

/// Drains the outbound queue and keeps the connection alive with Pings.
async fn write_pump(
    mut sink: BoxWsSink,
    mut outbound: mpsc::Receiver<WsMessage>,
    close_signal: CancellationToken,
    config: WsConfig,
    connection_id: String,
) {
    let ping_enabled = !config.ping_period.is_zero();
    let period = if ping_enabled {
        config.ping_period
    } else {
        std::time::Duration::from_secs(3600)
    };
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut close_sent = false;

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(frame) = maybe else { break };
                let is_close = matches!(frame, WsMessage::Close(_));
                match timeout(config.write_timeout, sink.send(frame)).await {
                    Err(_) => {
                        warn!(connection = %connection_id, "write deadline elapsed");
                        break;
                    }
                    Ok(Err(err)) => {
                        debug!(connection = %connection_id, error = %err, "write failed");
                        break;
                    }
                    Ok(Ok(())) => {
                        if is_close {
                            close_sent = true;
                            break;
                        }
                    }
                }
            }
            _ = ticker.tick(), if ping_enabled => {
                trace!(connection = %connection_id, "ping");
                match timeout(config.write_timeout, sink.send(WsMessage::Ping(Bytes::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        warn!(connection = %connection_id, "ping write failed");
                        break;
                    }
                }
            }
            () = close_signal.cancelled() => break,
        }
    }

    if !close_sent {
        let _ = timeout(
            config.write_timeout,
            sink.send(WsMessage::Close(Some(CloseFrame::normal()))),
        )
        .await;
    }
    let _ = timeout(config.write_timeout, sink.close()).await;
    close_signal.cancel();
}
