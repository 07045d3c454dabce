//! Port mapping manager — bridges the state store to the DNAT service.
//!
//! `PortMappingManager` derives the DNAT mappings a VM needs from the port
//! mapping templates of the appliances it hosts, and reconciles them when
//! the VM's IP changes or a template changes. Provider calls run outside
//! store transactions; their results are recorded afterwards.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};
use vmgrid_cloud::{Clouds, DnatTarget};
use vmgrid_state::*;

use crate::error::NetworkResult;

/// VMs hosting an appliance whose mappings come from templates of `owner`.
pub fn affected_vms_in(txn: &impl Snapshot, owner: PmtOwner) -> StateResult<Vec<VmId>> {
    let appliances = txn.list_where(|a: &Appliance| match owner {
        PmtOwner::ApplianceType(type_id) => {
            a.appliance_type_id == type_id && a.dev_mode_property_set_id.is_none()
        }
        PmtOwner::DevModePropertySet(dev_id) => a.dev_mode_property_set_id == Some(dev_id),
    })?;
    let mut vms = BTreeSet::new();
    for appliance in appliances {
        for deployment in txn.deployments_of_appliance(appliance.id)? {
            vms.insert(deployment.vm_id);
        }
    }
    Ok(vms.into_iter().collect())
}

/// DNAT templates in force on a VM, one entry per template.
///
/// This is the union over every appliance on the VM. Co-tenants share one
/// type and configuration, so they contribute the same type templates;
/// development-mode co-tenants each contribute their own property set.
fn dnat_templates_in(txn: &impl Snapshot, vm_id: VmId) -> StateResult<Vec<PortMappingTemplate>> {
    let mut seen = BTreeSet::new();
    let mut templates = Vec::new();
    for appliance in txn.appliances_on_vm(vm_id)? {
        for template in txn.port_mapping_templates_for(&appliance)? {
            if template.is_dnat() && seen.insert(template.id) {
                templates.push(template);
            }
        }
    }
    Ok(templates)
}

/// External id of the site whose DNAT service fronts `site_id`.
fn site_key_in(txn: &impl Snapshot, site_id: SiteId) -> StateResult<String> {
    Ok(txn.require::<ComputeSite>(site_id)?.site_id)
}

/// Keeps `PortMapping` records and DNAT rules consistent.
#[derive(Clone)]
pub struct PortMappingManager {
    store: StateStore,
    clouds: Clouds,
}

impl PortMappingManager {
    pub fn new(store: StateStore, clouds: Clouds) -> Self {
        Self { store, clouds }
    }

    /// Add the mappings a VM lacks. Templates already mapped on the VM
    /// are left alone. A VM without an IP gets nothing.
    pub async fn add_mappings(&self, vm_id: VmId) -> NetworkResult<Vec<PortMapping>> {
        let plan = self.store.read(|txn| {
            let Some(vm) = txn.get::<VirtualMachine>(vm_id)? else {
                return Ok(None);
            };
            let Some(ip) = vm.ip.clone() else {
                return Ok(None);
            };
            let site = site_key_in(txn, vm.site_id)?;
            let mapped: BTreeSet<PortMappingTemplateId> = txn
                .port_mappings_of_vm(vm_id)?
                .iter()
                .map(|m| m.template_id)
                .collect();
            let targets: Vec<DnatTarget> = dnat_templates_in(txn, vm_id)?
                .into_iter()
                .filter(|t| !mapped.contains(&t.id))
                .map(|t| DnatTarget {
                    template_id: t.id,
                    target_port: t.target_port,
                    transport: t.transport_protocol,
                })
                .collect();
            Ok::<_, StateError>(Some((site, ip, targets)))
        })?;
        let Some((site, ip, targets)) = plan else {
            return Ok(Vec::new());
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let rules = self.clouds.add_dnat_for_vm(&site, &ip, &targets).await?;

        let recorded = self.store.write(|txn| {
            let still_there = txn
                .get::<VirtualMachine>(vm_id)?
                .is_some_and(|vm| vm.ip.as_deref() == Some(ip.as_str()));
            if !still_there {
                return Ok::<_, StateError>(None);
            }
            let mut mappings = Vec::with_capacity(rules.len());
            for rule in &rules {
                mappings.push(txn.insert_with(|id| PortMapping {
                    id,
                    template_id: rule.template_id,
                    vm_id,
                    public_ip: rule.public_ip.clone(),
                    source_port: rule.source_port,
                })?);
            }
            Ok(Some(mappings))
        })?;

        match recorded {
            Some(mappings) => {
                debug!(vm = vm_id, ip = %ip, added = mappings.len(), "port mappings added");
                Ok(mappings)
            }
            None => {
                // The VM moved or vanished while the rules were installed.
                warn!(vm = vm_id, ip = %ip, "vm changed during mapping, dropping new rules");
                for rule in &rules {
                    self.remove_rule(&site, &rule.public_ip, rule.source_port)
                        .await;
                }
                Ok(Vec::new())
            }
        }
    }

    /// Drop every mapping of a VM reachable at `ip`.
    ///
    /// The records are deleted even when the DNAT call fails, since they
    /// no longer describe a route to the VM; the failure is returned.
    pub async fn remove_mappings(&self, vm_id: VmId, ip: &str) -> NetworkResult<usize> {
        let (site, removed) = self.store.write(|txn| {
            let vm = txn.require::<VirtualMachine>(vm_id)?;
            let mappings = txn.port_mappings_of_vm(vm_id)?;
            for mapping in &mappings {
                txn.delete::<PortMapping>(mapping.id)?;
            }
            Ok::<_, StateError>((site_key_in(txn, vm.site_id)?, mappings.len()))
        })?;
        self.clouds.remove_dnat_for_vm(&site, ip).await?;
        debug!(vm = vm_id, ip = %ip, removed, "port mappings removed");
        Ok(removed)
    }

    /// Clear DNAT rules of a VM already gone from the registry.
    pub async fn release_vm(&self, vm: &VirtualMachine) -> NetworkResult<()> {
        if let Some(ip) = vm.ip.as_deref() {
            let site = self.store.read(|txn| site_key_in(txn, vm.site_id))?;
            self.clouds.remove_dnat_for_vm(&site, ip).await?;
        }
        Ok(())
    }

    /// React to a VM address change. Mappings at the old address are
    /// never carried over; the new address gets a fresh set.
    pub async fn on_ip_change(
        &self,
        vm_id: VmId,
        old_ip: Option<&str>,
    ) -> NetworkResult<Vec<PortMapping>> {
        if let Some(old_ip) = old_ip
            && let Err(e) = self.remove_mappings(vm_id, old_ip).await
        {
            warn!(vm = vm_id, ip = %old_ip, error = %e, "stale dnat rules not removed");
        }
        let added = self.add_mappings(vm_id).await?;
        info!(vm = vm_id, mappings = added.len(), "port mappings regenerated");
        Ok(added)
    }

    /// Map a new template on every VM it applies to.
    pub async fn on_template_created(&self, template: &PortMappingTemplate) -> NetworkResult<usize> {
        if !template.is_dnat() {
            return Ok(0);
        }
        let vms = self.store.read(|txn| affected_vms_in(txn, template.owner))?;
        let mut added = 0;
        for vm_id in vms {
            added += self.add_mappings(vm_id).await?.len();
        }
        Ok(added)
    }

    /// Reconcile mappings after a template update.
    ///
    /// A port or transport change recreates the template's mappings, a
    /// switch away from `none` drops them, a switch to `none` adds them.
    pub async fn on_template_updated(
        &self,
        old: &PortMappingTemplate,
        new: &PortMappingTemplate,
    ) -> NetworkResult<()> {
        match (old.is_dnat(), new.is_dnat()) {
            (false, false) => {}
            (true, false) => {
                self.remove_template_mappings(new.id).await?;
            }
            (false, true) => {
                self.on_template_created(new).await?;
            }
            (true, true) => {
                if old.target_port != new.target_port
                    || old.transport_protocol != new.transport_protocol
                {
                    self.remove_template_mappings(new.id).await?;
                    self.on_template_created(new).await?;
                }
            }
        }
        Ok(())
    }

    /// Drop every mapping created from a template.
    pub async fn remove_template_mappings(
        &self,
        template_id: PortMappingTemplateId,
    ) -> NetworkResult<usize> {
        let mappings = self.store.write(|txn| {
            let mut located = Vec::new();
            for mapping in txn.port_mappings_of_template(template_id)? {
                txn.delete::<PortMapping>(mapping.id)?;
                let site = match txn.get::<VirtualMachine>(mapping.vm_id)? {
                    Some(vm) => Some(site_key_in(txn, vm.site_id)?),
                    None => None,
                };
                located.push((site, mapping));
            }
            Ok::<_, StateError>(located)
        })?;
        for (site, mapping) in &mappings {
            match site {
                Some(site) => {
                    self.remove_rule(site, &mapping.public_ip, mapping.source_port)
                        .await
                }
                None => warn!(
                    mapping = mapping.id,
                    vm = mapping.vm_id,
                    "mapping of unknown vm, dnat rule left in place"
                ),
            }
        }
        debug!(template = template_id, removed = mappings.len(), "template mappings removed");
        Ok(mappings.len())
    }

    async fn remove_rule(&self, site: &str, public_ip: &str, source_port: u16) {
        if let Err(e) = self
            .clouds
            .remove_port_mapping(site, public_ip, source_port)
            .await
        {
            warn!(site = %site, public_ip = %public_ip, port = source_port, error = %e, "dnat rule not removed");
        }
    }
}
