//! Standalone mode: one process, simulated providers, persistent state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use vmgrid_cloud::Clouds;
use vmgrid_cloud::sim::{SimComputeSite, SimDnat, SimMonitoring};
use vmgrid_core::VmGridConfig;
use vmgrid_lifecycle::ApplianceManager;
use vmgrid_state::StateStore;

use crate::triggers;

/// Public address every simulated DNAT gateway hands out.
const SIM_PUBLIC_IP: &str = "127.0.0.1";

pub async fn run(config: VmGridConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    info!(data_dir = %data_dir.display(), sites = config.sites.len(), "starting vmgridd standalone");

    std::fs::create_dir_all(&data_dir)?;
    let store = StateStore::open(&data_dir.join("vmgrid.redb"))?;

    let mut clouds = Clouds::new(Arc::new(SimMonitoring::new()), config.provider.timeout());
    for site in &config.sites {
        clouds.add_site(
            &site.id,
            Arc::new(SimComputeSite::new()),
            Arc::new(SimDnat::new(SIM_PUBLIC_IP)),
        );
    }

    let manager = ApplianceManager::new(store, clouds, &config);
    let sites = manager.upsert_sites(&config)?;
    info!(sites = sites.len(), "compute sites registered");
    let site_ids: Vec<String> = sites.into_iter().map(|s| s.site_id).collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let schedule = &config.schedule;

    let handles = vec![
        tokio::spawn(triggers::billing(
            manager.clone(),
            Duration::from_secs(schedule.billing_interval_secs),
            shutdown_rx.clone(),
        )),
        tokio::spawn(triggers::vm_monitoring(
            manager.clone(),
            site_ids.clone(),
            Duration::from_secs(schedule.vm_monitoring_interval_secs),
            shutdown_rx.clone(),
        )),
        tokio::spawn(triggers::template_monitoring(
            manager,
            site_ids,
            Duration::from_secs(schedule.template_monitoring_interval_secs),
            shutdown_rx,
        )),
    ];

    info!("vmgridd ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        handle.await?;
    }
    info!("vmgridd stopped");
    Ok(())
}
