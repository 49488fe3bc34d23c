//! Reachability-gated service management
//!
//! Both operations return `Ok(false)` when the supervisor's socket is not up
//! yet, which the orchestrator turns into a deferred event; actual Pebble
//! API failures are hard errors.

use tracing::{debug, info};

use crate::config::PortainerConfig;
use crate::controller::error::Result;
use crate::pebble::layer::{build_layer, PEBBLE_SERVICE};
use crate::pebble::Pebble;

/// Ensure the dashboard service is registered and running.
///
/// The layer is only registered when the service is not yet known to the
/// supervisor; an already-registered service keeps its current definition.
pub async fn start_service<P: Pebble + ?Sized>(
    pebble: &P,
    config: &PortainerConfig,
) -> Result<bool> {
    if !pebble.can_connect().await {
        return Ok(false);
    }
    match pebble.get_service(PEBBLE_SERVICE).await? {
        None => {
            pebble
                .add_layer(PEBBLE_SERVICE, &build_layer(config))
                .await?;
            pebble.start(PEBBLE_SERVICE).await?;
            info!("{} service started", PEBBLE_SERVICE);
        }
        Some(svc) if !svc.is_running() => {
            pebble.start(PEBBLE_SERVICE).await?;
            info!("{} service started", PEBBLE_SERVICE);
        }
        Some(_) => debug!("{} service already running", PEBBLE_SERVICE),
    }
    Ok(true)
}

/// Re-register the command definition and restart the dashboard.
///
/// Used when the configured command line changed; the layer replaces the
/// existing definition unconditionally.
pub async fn update_service<P: Pebble + ?Sized>(
    pebble: &P,
    config: &PortainerConfig,
) -> Result<bool> {
    if !pebble.can_connect().await {
        return Ok(false);
    }
    pebble
        .add_layer(PEBBLE_SERVICE, &build_layer(config))
        .await?;
    pebble.restart(PEBBLE_SERVICE).await?;
    info!("{} service restarted", PEBBLE_SERVICE);
    Ok(true)
}
