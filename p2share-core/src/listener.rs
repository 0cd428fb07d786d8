//! Inbound connection loop: every accepted connection gets its own serving task.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointContext};
use crate::events::EngineEvent;
use crate::transport::{Inbound, Transport};

/// First pause after an accept error; doubles on each consecutive error up to the retry
/// back-off.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Sleep for `period` unless cancelled first. Returns true if cancelled.
pub(crate) async fn wait_or_cancel(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(period) => false,
    }
}

/// Accept connections until cancelled. Accept errors are logged and followed by a growing
/// pause; if the binding stops listening, listen again after the retry back-off.
pub async fn run_listener(transport: Arc<dyn Transport>, ctx: EndpointContext) {
    let backoff = ctx.config.retry_backoff();
    while !ctx.cancel.is_cancelled() {
        let listening = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            listening = transport.listen() => listening,
        };
        match listening {
            Ok(mut incoming) => {
                info!("accepting connections");
                let mut pause = ACCEPT_ERROR_PAUSE;
                loop {
                    let next = tokio::select! {
                        _ = ctx.cancel.cancelled() => return,
                        next = incoming.next() => next,
                    };
                    match next {
                        Some(Ok(inbound)) => {
                            pause = ACCEPT_ERROR_PAUSE;
                            accept(inbound, &ctx);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, retry_in = ?pause, "accept failed");
                            if wait_or_cancel(&ctx.cancel, pause).await {
                                return;
                            }
                            pause = (pause * 2).min(backoff.max(ACCEPT_ERROR_PAUSE));
                        }
                        None => {
                            warn!("inbound stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "listen failed"),
        }
        if wait_or_cancel(&ctx.cancel, backoff).await {
            break;
        }
    }
    debug!("listener stopped");
}

fn accept(inbound: Inbound, ctx: &EndpointContext) {
    let Inbound { peer, connection } = inbound;
    info!(peer = %peer, "inbound connection");
    ctx.events.emit(EngineEvent::InboundConnection { peer: peer.clone() });
    let mut ctx = ctx.clone();
    ctx.cancel = ctx.cancel.child_token();
    let endpoint = Endpoint::new(peer, connection, ctx);
    tokio::spawn(async move {
        // serve() logs its own outcome.
        let _ = endpoint.serve().await;
    });
}
