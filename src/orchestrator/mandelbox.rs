//! Region latency ping and mandelbox assignment

use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SessionContext;
use crate::gateway::Gateway;
use crate::state::StatePatch;
use crate::trigger::{Trigger, TriggerId, combine_latest, exhaust_map};

/// Ping every region concurrently and order them fastest first.
///
/// Regions that failed to answer keep their configured order, after all
/// regions that answered.
pub async fn rank_regions(gateway: &dyn Gateway, regions: &[String]) -> Vec<String> {
    let pings = regions.iter().map(|region| async move {
        let latency = match gateway.ping_region(region).await {
            Ok(latency) => Some(latency),
            Err(e) => {
                debug!(region = %region, error = %e, "Region ping failed");
                None
            }
        };
        (region.clone(), latency)
    });

    let mut measured: Vec<(String, Option<Duration>)> = join_all(pings).await;
    // stable sort keeps configured order among failures
    measured.sort_by_key(|(_, latency)| latency.map_or((1, Duration::ZERO), |l| (0, l)));
    measured.into_iter().map(|(region, _)| region).collect()
}

pub(super) fn spawn_region_ping(ctx: &SessionContext) -> JoinHandle<()> {
    let mut ready = ctx.bus.from_trigger(TriggerId::AppReady);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        while ready.next().await.is_some() {
            let regions = rank_regions(ctx.gateway.as_ref(), &ctx.config.regions).await;
            info!(regions = ?regions, "Regions ranked by latency");
            ctx.state.apply(StatePatch {
                regions: Some(regions.clone()),
                ..StatePatch::default()
            });
            ctx.bus.emit(Trigger::RegionPingSuccess { regions });
        }
    })
}

/// Assign a mandelbox once both credentials and regions are known. Pairs
/// arriving during an assignment are dropped.
pub(super) fn spawn_assignment(ctx: &SessionContext) -> JoinHandle<()> {
    let auth = ctx.bus.from_trigger(TriggerId::AuthFlowSuccess);
    let regions = ctx.bus.from_trigger(TriggerId::RegionPingSuccess);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let assignments = exhaust_map(combine_latest(auth, regions), move |(auth, regions)| {
            let ctx = ctx.clone();
            async move { assign(&ctx, auth, regions).await }
        });
        futures::pin_mut!(assignments);
        while assignments.next().await.is_some() {}
    })
}

async fn assign(ctx: &SessionContext, auth: Trigger, regions: Trigger) {
    let (Trigger::AuthFlowSuccess { email, access_token, .. }, Trigger::RegionPingSuccess { regions }) =
        (auth, regions)
    else {
        return;
    };

    debug!(email = %email, "Requesting mandelbox");
    match ctx.gateway.assign_mandelbox(&access_token, &email, &regions).await {
        Ok(assignment) => {
            info!(
                mandelbox = %assignment.mandelbox_id,
                region = %assignment.region,
                "Mandelbox assigned"
            );
            ctx.state.apply(StatePatch {
                mandelbox_id: Some(Some(assignment.mandelbox_id.clone())),
                mandelbox_ip: Some(Some(assignment.ip.clone())),
                mandelbox_region: Some(Some(assignment.region.clone())),
                ..StatePatch::default()
            });
            ctx.bus.emit(Trigger::MandelboxAssignSuccess {
                mandelbox_id: assignment.mandelbox_id,
                ip: assignment.ip,
                region: assignment.region,
            });
        }
        Err(e) => {
            warn!(email = %email, error = %e, "Mandelbox assignment failed");
            ctx.bus.emit(Trigger::MandelboxAssignFailure {
                reason: e.to_string(),
            });
        }
    }
}
