//! Periodic triggers driving the lifecycle orchestrator.
//!
//! Every trigger runs until the shutdown channel flips. A failed pass is
//! logged and the next one runs on schedule.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vmgrid_core::epoch_secs;
use vmgrid_lifecycle::{ApplianceManager, LifecycleResult};
use vmgrid_state::VirtualMachine;

pub async fn billing(manager: ApplianceManager, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "billing trigger started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match manager.bill_tick(epoch_secs()).await {
                    Ok(report) => debug!(
                        charged = report.billing.total(),
                        expired = report.dropped_deployments.len(),
                        released = report.released_vms.len(),
                        "billing tick"
                    ),
                    Err(e) => error!(error = %e, "billing tick failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("billing trigger shutting down");
                break;
            }
        }
    }
}

pub async fn vm_monitoring(
    manager: ApplianceManager,
    sites: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), sites = sites.len(), "vm monitoring trigger started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for site in &sites {
                    match manager.refresh_vms(site, epoch_secs()).await {
                        Ok(report) if !report.vanished.is_empty() => warn!(
                            site = %site,
                            vanished = report.vanished.len(),
                            "vms vanished"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(site = %site, error = %e, "vm refresh failed"),
                    }
                }
                if let Err(e) = collect_loads(&manager).await {
                    error!(error = %e, "load collection failed");
                }
            }
            _ = shutdown.changed() => {
                info!("vm monitoring trigger shutting down");
                break;
            }
        }
    }
}

pub async fn template_monitoring(
    manager: ApplianceManager,
    sites: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), sites = sites.len(), "template monitoring trigger started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for site in &sites {
                    if let Err(e) = manager.refresh_templates(site, epoch_secs()).await {
                        error!(site = %site, error = %e, "template refresh failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("template monitoring trigger shutting down");
                break;
            }
        }
    }
}

async fn collect_loads(manager: &ApplianceManager) -> LifecycleResult<()> {
    let monitored = manager
        .store()
        .list::<VirtualMachine>()?
        .into_iter()
        .filter(|vm| vm.managed && vm.monitoring_id.is_some());
    for vm_id in monitored.map(|vm| vm.id) {
        match manager.collect_load(vm_id).await {
            Ok(samples) => {
                for sample in samples {
                    debug!(vm = vm_id, metric = %sample.name, value = sample.value, "load sample");
                }
            }
            Err(e) => warn!(vm = vm_id, error = %e, "load not collected"),
        }
    }
    Ok(())
}
