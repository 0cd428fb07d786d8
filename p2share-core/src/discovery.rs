//! Discovery loops: the scanner keeps the peer registry fresh, the advertiser keeps the
//! local service registered. Failures become status events and are retried; neither loop
//! ends before the engine is cancelled.

use std::sync::Arc;

use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::{DiscoveryStatus, EngineEvent, EventSender};
use crate::listener::wait_or_cancel;
use crate::protocol::{PROTOCOL_VERSION, SERVICE_ID};
use crate::registry::{PeerRecord, PeerRegistry};
use crate::transport::{ServiceRecord, Transport, TransportError};

/// Run one scan: upsert every device exposing the service, then prune stale peers.
/// Pruning happens even when the scan fails so an unreachable transport still ages peers out.
/// Returns the number of matching devices seen.
pub async fn scan_once(
    transport: &dyn Transport,
    registry: &PeerRegistry,
    config: &EngineConfig,
    events: &EventSender,
) -> Result<usize, TransportError> {
    let mut changed = false;
    let scanned = collect_devices(transport, registry, events, config, &mut changed).await;

    for lost in registry.prune(config.staleness(), Instant::now()).await {
        info!(peer = %lost.address, name = %lost.display_name, "peer lost");
        events.emit(EngineEvent::PeerLost(lost));
        changed = true;
    }
    if changed {
        events.emit(EngineEvent::PeersChanged(registry.snapshot().await));
    }
    scanned
}

async fn collect_devices(
    transport: &dyn Transport,
    registry: &PeerRegistry,
    events: &EventSender,
    config: &EngineConfig,
    changed: &mut bool,
) -> Result<usize, TransportError> {
    let deadline = Instant::now() + config.scan_timeout();
    let mut devices = tokio::time::timeout_at(deadline, transport.scan())
        .await
        .map_err(|_| TransportError::Unavailable("scan did not start in time".into()))??;

    let mut hits = 0;
    loop {
        let device = match tokio::time::timeout_at(deadline, devices.next()).await {
            Ok(Some(device)) => device,
            Ok(None) => break,
            Err(_) => {
                debug!("scan window elapsed");
                break;
            }
        };
        if !device.service_ids.contains(&SERVICE_ID) {
            continue;
        }
        hits += 1;
        let record = PeerRecord {
            address: device.address,
            display_name: device.name,
            service_id: SERVICE_ID,
            last_seen: Instant::now(),
        };
        if registry.upsert(record.clone()).await {
            info!(peer = %record.address, name = %record.display_name, "peer found");
            events.emit(EngineEvent::PeerFound(record));
            *changed = true;
        }
    }
    Ok(hits)
}

/// Scan every `scan_interval` (first scan immediately) until cancelled.
pub async fn run_scanner(
    transport: Arc<dyn Transport>,
    registry: Arc<PeerRegistry>,
    config: Arc<EngineConfig>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let scanned = tokio::select! {
            _ = cancel.cancelled() => break,
            scanned = scan_once(transport.as_ref(), &registry, &config, &events) => scanned,
        };
        match scanned {
            Ok(hits) => {
                debug!(hits, "scan completed");
                events.emit(EngineEvent::Discovery(DiscoveryStatus::ScanCompleted { hits }));
            }
            Err(e) => {
                warn!(error = %e, "scan failed");
                events.emit(EngineEvent::Discovery(DiscoveryStatus::ScanFailed(e.to_string())));
            }
        }
    }
    debug!("scanner stopped");
}

/// Register the local service, refresh it every `advertise_refresh`, retry failures after
/// the back-off.
pub async fn run_advertiser(
    transport: Arc<dyn Transport>,
    config: Arc<EngineConfig>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let record = ServiceRecord {
        service_id: SERVICE_ID,
        protocol_version: PROTOCOL_VERSION,
        service_name: config.service_name.clone(),
        display_name: config.display_name.clone(),
    };
    loop {
        let advertised = tokio::select! {
            _ = cancel.cancelled() => break,
            advertised = transport.advertise(&record) => advertised,
        };
        let wait = match advertised {
            Ok(()) => {
                debug!(name = %record.display_name, "service registered");
                events.emit(EngineEvent::Discovery(DiscoveryStatus::Advertised));
                config.advertise_refresh()
            }
            Err(e) => {
                warn!(error = %e, "service registration failed");
                events.emit(EngineEvent::Discovery(DiscoveryStatus::AdvertiseFailed(
                    e.to_string(),
                )));
                config.retry_backoff()
            }
        };
        if wait_or_cancel(&cancel, wait).await {
            break;
        }
    }
    debug!("advertiser stopped");
}
