//! Refresh of VMs and templates from the provider's view of a site.
//!
//! Both passes list what the provider reports, reconcile the store in one
//! transaction and run provider-facing follow-ups afterwards. A site the
//! provider cannot be reached at is skipped for this cycle.

use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};
use vmgrid_cloud::{ImageInfo, ServerInfo};
use vmgrid_placement::PlacementOutcome;
use vmgrid_state::registry::remove_vm_in;
use vmgrid_state::*;

use crate::error::LifecycleResult;
use crate::manager::{ApplianceManager, mark_lost_in};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmRefreshReport {
    /// The provider could not be listed; nothing changed.
    pub skipped: bool,
    pub updated: usize,
    /// Servers found at the provider and recorded as unmanaged VMs.
    pub registered: Vec<VmId>,
    /// VMs the provider no longer reports, removed from the registry.
    pub vanished: Vec<VmId>,
    /// Placement outcomes of appliances that ran on vanished VMs.
    pub replaced: Vec<(ApplianceId, PlacementOutcome)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateRefreshReport {
    pub skipped: bool,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    /// Templates of an appliance type that became active.
    pub activated: usize,
    pub retried: Vec<(ApplianceId, PlacementOutcome)>,
    pub released_vms: Vec<VmId>,
}

#[derive(Default)]
struct VmSync {
    updated: usize,
    registered: Vec<VmId>,
    vanished: Vec<VirtualMachine>,
    ip_changes: Vec<(VmId, Option<String>)>,
}

#[derive(Default)]
struct TemplateSync {
    created: usize,
    updated: usize,
    removed: usize,
    activated: usize,
    /// VMs whose template capture finished.
    saved_vms: Vec<VmId>,
}

impl ApplianceManager {
    /// Bring the VMs of a site in line with the servers its provider
    /// reports.
    ///
    /// Known VMs take the reported state, address and flavor; an address
    /// change regenerates port mappings and monitoring. Unknown servers
    /// become unmanaged VMs. VMs the provider lost are final-billed,
    /// dropped without a provider destroy, and their appliances placed
    /// again.
    pub async fn refresh_vms(&self, site_id: &str, now: u64) -> LifecycleResult<VmRefreshReport> {
        let site = self.site(site_id)?;
        let servers = match self.clouds.list_servers(site_id).await {
            Ok(servers) => servers,
            Err(e) => {
                error!(site = %site_id, error = %e, "vm refresh skipped");
                return Ok(VmRefreshReport {
                    skipped: true,
                    ..Default::default()
                });
            }
        };

        let sync = self
            .store
            .write(|txn| sync_vms_in(txn, &site, &servers, now))?;
        for (vm_id, old_ip) in &sync.ip_changes {
            self.after_ip_change(*vm_id, old_ip.as_deref()).await;
        }

        let mut report = VmRefreshReport {
            updated: sync.updated,
            registered: sync.registered,
            ..Default::default()
        };
        for vm in sync.vanished {
            report.vanished.push(vm.id);
            let replaced = self.forget_vanished(&site, vm, now).await?;
            report.replaced.extend(replaced);
        }
        debug!(
            site = %site_id,
            servers = servers.len(),
            updated = report.updated,
            registered = report.registered.len(),
            vanished = report.vanished.len(),
            "vms refreshed"
        );
        Ok(report)
    }

    async fn forget_vanished(
        &self,
        site: &ComputeSite,
        vm: VirtualMachine,
        now: u64,
    ) -> LifecycleResult<Vec<(ApplianceId, PlacementOutcome)>> {
        let appliance_ids = self.store.read(|txn| {
            Ok::<_, StateError>(
                txn.deployments_on_vm(vm.id)?
                    .iter()
                    .map(|d| d.appliance_id)
                    .collect::<BTreeSet<_>>(),
            )
        })?;
        for &appliance_id in &appliance_ids {
            if let Err(e) = self
                .billing
                .bill_appliance(appliance_id, now, "vm vanished", true)
            {
                warn!(appliance = appliance_id, vm = vm.id, error = %e, "final billing failed");
            }
        }

        let removed = self.store.write(|txn| {
            let removed = remove_vm_in(txn, vm.id)?;
            mark_lost_in(txn, appliance_ids.iter().copied())?;
            Ok::<_, StateError>(removed)
        })?;
        warn!(
            vm = vm.id,
            site = %site.site_id,
            server = vm.id_at_site.as_deref().unwrap_or_default(),
            deployments = removed.deployments.len(),
            "vm vanished at provider"
        );

        if let Some(host_id) = vm.monitoring_id
            && let Err(e) = self.clouds.unregister_host(host_id).await
        {
            warn!(vm = vm.id, host = host_id, error = %e, "monitoring unregister failed");
        }
        if let Err(e) = self.network.release_vm(&vm).await {
            warn!(vm = vm.id, error = %e, "dnat rules of vanished vm not removed");
        }

        let mut replaced = Vec::new();
        for appliance_id in appliance_ids {
            if self.store.get::<Appliance>(appliance_id)?.is_none() {
                continue;
            }
            let outcome = self.place_and_map(appliance_id, now).await?;
            replaced.push((appliance_id, outcome));
        }
        Ok(replaced)
    }

    /// Bring the templates of a site in line with the images its provider
    /// reports. Unsatisfied appliances are retried when a template of an
    /// appliance type becomes active, and VMs whose capture finished are
    /// re-evaluated for release.
    pub async fn refresh_templates(
        &self,
        site_id: &str,
        now: u64,
    ) -> LifecycleResult<TemplateRefreshReport> {
        let site = self.site(site_id)?;
        let images = match self.clouds.list_images(site_id).await {
            Ok(images) => images,
            Err(e) => {
                error!(site = %site_id, error = %e, "template refresh skipped");
                return Ok(TemplateRefreshReport {
                    skipped: true,
                    ..Default::default()
                });
            }
        };

        let sync = self
            .store
            .write(|txn| sync_templates_in(txn, &site, &images, now))?;
        let mut report = TemplateRefreshReport {
            created: sync.created,
            updated: sync.updated,
            removed: sync.removed,
            activated: sync.activated,
            ..Default::default()
        };
        report.released_vms = self.release_vms(&sync.saved_vms).await?;
        if report.activated > 0 {
            report.retried = self.retry_unsatisfied(now).await?;
        }
        if report.created + report.updated + report.removed > 0 {
            info!(
                site = %site_id,
                created = report.created,
                updated = report.updated,
                removed = report.removed,
                activated = report.activated,
                "templates refreshed"
            );
        }
        Ok(report)
    }
}

fn sync_vms_in(
    txn: &WriteTxn,
    site: &ComputeSite,
    servers: &[ServerInfo],
    now: u64,
) -> StateResult<VmSync> {
    let flavors = txn.list_where(|f: &VmFlavor| f.site_id == site.id)?;
    let templates = txn.list_where(|t: &VmTemplate| t.site_id == site.id)?;
    let flavor_of = |server: &ServerInfo| {
        let wanted = server.flavor_id_at_site.as_deref()?;
        flavors.iter().find(|f| f.id_at_site == wanted).map(|f| f.id)
    };
    let template_of = |server: &ServerInfo| {
        let wanted = server.image_id_at_site.as_deref()?;
        templates.iter().find(|t| t.id_at_site == wanted).map(|t| t.id)
    };

    let known = txn.vms_on_site(site.id)?;
    let mut sync = VmSync::default();
    for server in servers {
        let state = VmState::from_provider(&server.status);
        let existing = known
            .iter()
            .find(|vm| vm.id_at_site.as_deref() == Some(server.id_at_site.as_str()));
        match existing {
            Some(vm) => {
                let flavor_id = flavor_of(server).or(vm.flavor_id);
                if vm.state == state && vm.ip == server.ip && vm.flavor_id == flavor_id {
                    continue;
                }
                let mut vm = vm.clone();
                if vm.ip != server.ip {
                    sync.ip_changes.push((vm.id, vm.ip.clone()));
                }
                vm.state = state;
                vm.ip = server.ip.clone();
                vm.flavor_id = flavor_id;
                txn.put(&vm)?;
                sync.updated += 1;
            }
            None => {
                let vm = txn.insert_with(|id| VirtualMachine {
                    id,
                    site_id: site.id,
                    id_at_site: Some(server.id_at_site.clone()),
                    name: server.name.clone(),
                    state,
                    ip: server.ip.clone(),
                    flavor_id: flavor_of(server),
                    template_id: template_of(server),
                    managed: false,
                    monitoring_id: None,
                    release_pending: false,
                    created_at: now,
                })?;
                debug!(vm = vm.id, server = %server.id_at_site, "unmanaged vm registered");
                sync.registered.push(vm.id);
            }
        }
    }

    let reported: BTreeSet<&str> = servers.iter().map(|s| s.id_at_site.as_str()).collect();
    for vm in known {
        // Still booting, or already being destroyed by us.
        let Some(id_at_site) = vm.id_at_site.as_deref() else {
            continue;
        };
        if vm.release_pending || reported.contains(id_at_site) {
            continue;
        }
        sync.vanished.push(vm);
    }
    Ok(sync)
}

fn sync_templates_in(
    txn: &WriteTxn,
    site: &ComputeSite,
    images: &[ImageInfo],
    now: u64,
) -> StateResult<TemplateSync> {
    let known = txn.list_where(|t: &VmTemplate| t.site_id == site.id)?;
    let mut sync = TemplateSync::default();

    for image in images {
        let state = TemplateState::from_provider(&image.status);
        match known.iter().find(|t| t.id_at_site == image.id_at_site) {
            Some(template) => {
                if template.state == state && template.name == image.name {
                    continue;
                }
                let mut template = template.clone();
                if state == TemplateState::Active
                    && template.state != TemplateState::Active
                    && template.appliance_type_id.is_some()
                {
                    sync.activated += 1;
                }
                if template.state == TemplateState::Saving
                    && state != TemplateState::Saving
                    && let Some(vm_id) = template.source_vm_id
                {
                    sync.saved_vms.push(vm_id);
                }
                template.state = state;
                template.name = image.name.clone();
                txn.put(&template)?;
                sync.updated += 1;
            }
            None => {
                txn.insert_with(|id| VmTemplate {
                    id,
                    site_id: site.id,
                    id_at_site: image.id_at_site.clone(),
                    name: image.name.clone(),
                    state,
                    appliance_type_id: None,
                    source_vm_id: None,
                    created_at: now,
                })?;
                sync.created += 1;
            }
        }
    }

    let reported: BTreeSet<&str> = images.iter().map(|i| i.id_at_site.as_str()).collect();
    for template in known {
        if reported.contains(template.id_at_site.as_str()) {
            continue;
        }
        txn.delete::<VmTemplate>(template.id)?;
        sync.removed += 1;
        if template.state == TemplateState::Saving
            && let Some(vm_id) = template.source_vm_id
        {
            sync.saved_vms.push(vm_id);
        }
    }
    Ok(sync)
}
