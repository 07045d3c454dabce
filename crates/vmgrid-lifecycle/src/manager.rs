//! Appliance manager — the entity-lifecycle orchestrator.
//!
//! Every change to appliances, deployments and VMs goes through here as an
//! explicit sequence: the state transition commits first, then placement,
//! billing, release and port mapping follow as separate steps. Business
//! rejections (conflicts, unmanaged VMs) happen before anything is
//! written. Provider failures in the follow-up steps are logged and leave
//! the entity for the next trigger.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};
use vmgrid_billing::{BillingError, BillingReport, BillingService, FundLedger, NewFund};
use vmgrid_cloud::{Clouds, MetricSample};
use vmgrid_core::VmGridConfig;
use vmgrid_network::PortMappingManager;
use vmgrid_placement::{Optimizer, PlacementError, PlacementOutcome};
use vmgrid_state::registry::{RemovedVm, ensure_destroyable};
use vmgrid_state::*;

use crate::error::{LifecycleError, LifecycleResult};

/// Request to create an appliance.
#[derive(Debug, Clone)]
pub struct NewAppliance {
    pub appliance_set_id: ApplianceSetId,
    pub appliance_type_id: ApplianceTypeId,
    /// Configuration template the payload was rendered from.
    pub config_template_id: u64,
    pub payload: String,
    pub fund_id: FundId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedAppliance {
    pub appliance: Appliance,
    pub placement: PlacementOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestroyedAppliance {
    /// Amount charged by the final billing run.
    pub billed: Amount,
    pub released_vms: Vec<VmId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestroyedVm {
    /// Whether the provider destroyed the VM.
    pub destroyed: bool,
    /// Where each surviving appliance of the VM went.
    pub replaced: Vec<(ApplianceId, PlacementOutcome)>,
}

/// Result of one billing tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub billing: BillingReport,
    /// Expired deployments removed after billing.
    pub dropped_deployments: Vec<DeploymentId>,
    pub released_vms: Vec<VmId>,
}

/// Orchestrates appliances, deployments and VMs across the optimizer,
/// billing engine and port mapping manager.
#[derive(Clone)]
pub struct ApplianceManager {
    pub(crate) store: StateStore,
    pub(crate) clouds: Clouds,
    pub(crate) optimizer: Optimizer,
    pub(crate) billing: BillingService,
    pub(crate) ledger: FundLedger,
    pub(crate) network: PortMappingManager,
}

impl ApplianceManager {
    pub fn new(store: StateStore, clouds: Clouds, config: &VmGridConfig) -> Self {
        Self {
            optimizer: Optimizer::new(store.clone(), clouds.clone(), config),
            billing: BillingService::new(store.clone(), config.billing.clone()),
            ledger: FundLedger::new(store.clone()),
            network: PortMappingManager::new(store.clone(), clouds.clone()),
            clouds,
            store,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn billing(&self) -> &BillingService {
        &self.billing
    }

    pub fn network(&self) -> &PortMappingManager {
        &self.network
    }

    // ── Sites and funds ────────────────────────────────────────────

    /// Create or update the compute sites declared in `config`.
    pub fn upsert_sites(&self, config: &VmGridConfig) -> LifecycleResult<Vec<ComputeSite>> {
        let sites = self.store.write(|txn| {
            let mut sites = Vec::with_capacity(config.sites.len());
            for declared in &config.sites {
                let site = match txn.find_site(&declared.id)? {
                    Some(mut site) => {
                        site.name = declared.name.clone();
                        site.site_type = declared.site_type;
                        site.technology = declared.technology;
                        txn.put(&site)?;
                        site
                    }
                    None => txn.insert_with(|id| ComputeSite {
                        id,
                        site_id: declared.id.clone(),
                        name: declared.name.clone(),
                        site_type: declared.site_type,
                        technology: declared.technology,
                    })?,
                };
                sites.push(site);
            }
            Ok::<_, StateError>(sites)
        })?;
        info!(sites = sites.len(), "compute sites loaded");
        Ok(sites)
    }

    /// Open a fund. A negative overdraft limit is rejected.
    pub fn create_fund(&self, new: NewFund) -> LifecycleResult<Fund> {
        Ok(self.ledger.create_fund(new)?)
    }

    /// Credit a fund, then retry the fund's unsatisfied appliances.
    pub async fn top_up(&self, fund_id: FundId, amount: Amount, now: u64) -> LifecycleResult<Fund> {
        let fund = self.ledger.top_up(fund_id, amount)?;
        self.retry_where(now, |appliance| appliance.fund_id == fund_id)
            .await?;
        Ok(fund)
    }

    // ── Appliance sets ─────────────────────────────────────────────

    /// Create an appliance set. A user owns at most one development set.
    pub fn create_appliance_set(
        &self,
        user_id: UserId,
        name: &str,
        kind: ApplianceSetKind,
    ) -> LifecycleResult<ApplianceSet> {
        let set = self.store.write(|txn| {
            if kind == ApplianceSetKind::Development
                && !txn
                    .list_where(|s: &ApplianceSet| s.user_id == user_id && s.is_development())?
                    .is_empty()
            {
                return Err(LifecycleError::Conflict(format!(
                    "user {user_id} already has a development appliance set"
                )));
            }
            Ok(txn.insert_with(|id| ApplianceSet {
                id,
                user_id,
                name: name.to_string(),
                kind,
            })?)
        })?;
        info!(set = set.id, user = user_id, kind = ?kind, "appliance set created");
        Ok(set)
    }

    /// Destroy every appliance of a set, then the set.
    pub async fn destroy_appliance_set(
        &self,
        set_id: ApplianceSetId,
        now: u64,
    ) -> LifecycleResult<DestroyedAppliance> {
        self.store.require::<ApplianceSet>(set_id)?;
        let appliances = self
            .store
            .read(|txn| txn.list_where(|a: &Appliance| a.appliance_set_id == set_id))?;

        let mut summary = DestroyedAppliance::default();
        for appliance in appliances {
            let destroyed = self.destroy_appliance(appliance.id, now).await?;
            summary.billed += destroyed.billed;
            summary.released_vms.extend(destroyed.released_vms);
        }
        self.store.delete::<ApplianceSet>(set_id)?;
        info!(set = set_id, billed = summary.billed, "appliance set destroyed");
        Ok(summary)
    }

    // ── Appliances ─────────────────────────────────────────────────

    /// Create an appliance and place it.
    ///
    /// A production set may not hold two appliances of one type with the
    /// same configuration; that request is a `Conflict` and writes
    /// nothing. Placement that finds no template leaves the appliance
    /// unsatisfied, which is not an error.
    pub async fn create_appliance(
        &self,
        request: NewAppliance,
        now: u64,
    ) -> LifecycleResult<CreatedAppliance> {
        let appliance = self
            .store
            .write(|txn| insert_appliance_in(txn, &request, now))?;
        info!(
            appliance = appliance.id,
            set = appliance.appliance_set_id,
            appliance_type = appliance.appliance_type_id,
            "appliance created"
        );

        let placement = self.place_and_map(appliance.id, now).await?;
        let appliance = self.store.get::<Appliance>(appliance.id)?.unwrap_or(appliance);
        Ok(CreatedAppliance {
            appliance,
            placement,
        })
    }

    /// Final-bill an appliance, delete it with its deployments, then
    /// release the VMs it leaves empty.
    pub async fn destroy_appliance(
        &self,
        appliance_id: ApplianceId,
        now: u64,
    ) -> LifecycleResult<DestroyedAppliance> {
        let appliance = self.store.require::<Appliance>(appliance_id)?;
        let billed = self.final_bill(appliance_id, now, "destroy")?;

        if let Some(dev_id) = appliance.dev_mode_property_set_id {
            let templates = self
                .store
                .read(|txn| txn.templates_for_owner(PmtOwner::DevModePropertySet(dev_id)))?;
            for template in templates {
                self.network.remove_template_mappings(template.id).await?;
            }
        }

        let vm_ids = self.store.write(|txn| remove_appliance_in(txn, &appliance))?;
        let released_vms = self.release_vms(&vm_ids).await?;
        info!(
            appliance = appliance_id,
            billed,
            released = released_vms.len(),
            "appliance destroyed"
        );
        Ok(DestroyedAppliance {
            billed,
            released_vms,
        })
    }

    /// Re-place every unsatisfied appliance that has no deployment.
    pub async fn retry_unsatisfied(
        &self,
        now: u64,
    ) -> LifecycleResult<Vec<(ApplianceId, PlacementOutcome)>> {
        self.retry_where(now, |_| true).await
    }

    async fn retry_where(
        &self,
        now: u64,
        filter: impl Fn(&Appliance) -> bool,
    ) -> LifecycleResult<Vec<(ApplianceId, PlacementOutcome)>> {
        let waiting = self.store.read(|txn| {
            let mut waiting = Vec::new();
            let unsatisfied = txn
                .list_where(|a: &Appliance| a.state == ApplianceState::Unsatisfied && filter(a))?;
            for appliance in unsatisfied {
                if txn.deployments_of_appliance(appliance.id)?.is_empty() {
                    waiting.push(appliance.id);
                }
            }
            Ok::<_, StateError>(waiting)
        })?;

        let mut results = Vec::with_capacity(waiting.len());
        for appliance_id in waiting {
            let outcome = self.place_and_map(appliance_id, now).await?;
            results.push((appliance_id, outcome));
        }
        if !results.is_empty() {
            let placed = results
                .iter()
                .filter(|(_, outcome)| {
                    matches!(
                        outcome,
                        PlacementOutcome::Reused { .. } | PlacementOutcome::Created { .. }
                    )
                })
                .count();
            info!(retried = results.len(), placed, "unsatisfied appliances retried");
        }
        Ok(results)
    }

    /// Place an appliance and map the ports of the VM it lands on.
    ///
    /// A provider failure during placement leaves the appliance
    /// unsatisfied for a later retry and is reported as that outcome.
    pub(crate) async fn place_and_map(
        &self,
        appliance_id: ApplianceId,
        now: u64,
    ) -> LifecycleResult<PlacementOutcome> {
        let outcome = match self.optimizer.place(appliance_id, now).await {
            Ok(outcome) => outcome,
            Err(PlacementError::Cloud(e)) => {
                warn!(appliance = appliance_id, error = %e, "placement deferred after provider failure");
                return Ok(PlacementOutcome::Unsatisfied);
            }
            Err(e) => return Err(e.into()),
        };
        if let PlacementOutcome::Reused { vm_id, .. } | PlacementOutcome::Created { vm_id, .. } =
            outcome
            && let Err(e) = self.network.add_mappings(vm_id).await
        {
            warn!(appliance = appliance_id, vm = vm_id, error = %e, "port mappings not added");
        }
        Ok(outcome)
    }

    fn final_bill(&self, appliance_id: ApplianceId, now: u64, reason: &str) -> LifecycleResult<Amount> {
        match self.billing.bill_appliance(appliance_id, now, reason, true) {
            Ok(billing) => Ok(billing.total()),
            Err(BillingError::NoPrice { vm, os_family }) => {
                warn!(appliance = appliance_id, vm, os_family = %os_family, "no price, final billing skipped");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Billing ────────────────────────────────────────────────────

    /// One billing trigger: bill every prepaid deployment, drop the ones
    /// that expired, then release VMs left without deployments.
    ///
    /// The release pass covers every empty managed VM, so a VM whose
    /// destroy failed earlier is retried here.
    pub async fn bill_tick(&self, now: u64) -> LifecycleResult<TickReport> {
        let billing = self.billing.bill_all(now)?;
        let dropped_deployments = self.store.write(drop_expired_in)?;
        if !dropped_deployments.is_empty() {
            info!(dropped = dropped_deployments.len(), "expired deployments removed");
        }
        let removed = self.optimizer.release_unused().await?;
        let released_vms = self.after_release(removed).await;
        Ok(TickReport {
            billing,
            dropped_deployments,
            released_vms,
        })
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Record a new address for a VM and regenerate what depends on it.
    pub async fn vm_ip_changed(&self, vm_id: VmId, new_ip: Option<String>) -> LifecycleResult<()> {
        let old_ip = self.store.write(|txn| {
            let mut vm = txn.require::<VirtualMachine>(vm_id)?;
            let old_ip = std::mem::replace(&mut vm.ip, new_ip.clone());
            txn.put(&vm)?;
            Ok::<_, StateError>(old_ip)
        })?;
        if old_ip != new_ip {
            self.after_ip_change(vm_id, old_ip.as_deref()).await;
        }
        Ok(())
    }

    /// Follow-up of an address change already in the store: port mappings
    /// first, then monitoring registration.
    pub(crate) async fn after_ip_change(&self, vm_id: VmId, old_ip: Option<&str>) {
        if let Err(e) = self.network.on_ip_change(vm_id, old_ip).await {
            warn!(vm = vm_id, error = %e, "port mappings not regenerated");
        }
        if let Err(e) = self.refresh_monitoring(vm_id).await {
            warn!(vm = vm_id, error = %e, "monitoring not refreshed");
        }
    }

    async fn refresh_monitoring(&self, vm_id: VmId) -> LifecycleResult<()> {
        let Some(vm) = self.store.get::<VirtualMachine>(vm_id)? else {
            return Ok(());
        };
        if !vm.managed {
            return Ok(());
        }
        if vm.ip.is_some() {
            self.optimizer.register_monitoring(vm_id).await;
            return Ok(());
        }
        if let Some(host_id) = vm.monitoring_id {
            self.clouds.unregister_host(host_id).await?;
            self.store.write(|txn| {
                if let Some(mut current) = txn.get::<VirtualMachine>(vm_id)? {
                    current.monitoring_id = None;
                    txn.put(&current)?;
                }
                Ok::<_, StateError>(())
            })?;
            debug!(vm = vm_id, host = host_id, "vm without address left monitoring");
        }
        Ok(())
    }

    /// Reboot a managed VM at its provider.
    pub async fn reboot_vm(&self, vm_id: VmId) -> LifecycleResult<()> {
        let (vm, site) = self.vm_with_site(vm_id)?;
        ensure_managed(&vm)?;
        let Some(id_at_site) = vm.id_at_site.as_deref() else {
            return Err(LifecycleError::Invariant(format!(
                "vm {vm_id} is still being created"
            )));
        };
        self.clouds.reboot_server(&site.site_id, id_at_site).await?;
        self.store.write(|txn| {
            if let Some(mut current) = txn.get::<VirtualMachine>(vm_id)? {
                current.state = VmState::Reboot;
                txn.put(&current)?;
            }
            Ok::<_, StateError>(())
        })?;
        info!(vm = vm_id, site = %site.site_id, server = %id_at_site, "vm rebooted");
        Ok(())
    }

    /// Take a managed VM away from its appliances and release it.
    ///
    /// The appliances are final-billed, lose their deployment on the VM
    /// and are placed again. A refused or failed destroy leaves the empty
    /// VM for a later release pass.
    pub async fn destroy_vm(&self, vm_id: VmId, now: u64) -> LifecycleResult<DestroyedVm> {
        let vm = self.store.require::<VirtualMachine>(vm_id)?;
        ensure_managed(&vm)?;
        if vm.is_pending() {
            return Err(LifecycleError::Invariant(format!(
                "vm {vm_id} is still being created"
            )));
        }

        let appliance_ids = self.store.read(|txn| {
            Ok::<_, StateError>(
                txn.deployments_on_vm(vm_id)?
                    .iter()
                    .map(|d| d.appliance_id)
                    .collect::<BTreeSet<_>>(),
            )
        })?;
        for &appliance_id in &appliance_ids {
            self.final_bill(appliance_id, now, "vm destroyed")?;
        }
        self.store.write(|txn| {
            for deployment in txn.deployments_on_vm(vm_id)? {
                txn.delete::<Deployment>(deployment.id)?;
            }
            mark_lost_in(txn, appliance_ids.iter().copied())
        })?;

        let released = self.release_vms(&[vm_id]).await?;

        let mut replaced = Vec::new();
        for appliance_id in appliance_ids {
            if self.store.get::<Appliance>(appliance_id)?.is_none() {
                continue;
            }
            let outcome = self.place_and_map(appliance_id, now).await?;
            replaced.push((appliance_id, outcome));
        }
        info!(vm = vm_id, replaced = replaced.len(), "vm destroyed");
        Ok(DestroyedVm {
            destroyed: !released.is_empty(),
            replaced,
        })
    }

    /// Current load samples of a VM from monitoring. A VM not registered
    /// in monitoring has none.
    pub async fn collect_load(&self, vm_id: VmId) -> LifecycleResult<Vec<MetricSample>> {
        let vm = self.store.require::<VirtualMachine>(vm_id)?;
        let Some(host_id) = vm.monitoring_id else {
            debug!(vm = vm_id, "vm not in monitoring, no load");
            return Ok(Vec::new());
        };
        Ok(self.clouds.fetch_metrics(host_id).await?)
    }

    pub(crate) async fn release_vms(&self, vm_ids: &[VmId]) -> LifecycleResult<Vec<VmId>> {
        if vm_ids.is_empty() {
            return Ok(Vec::new());
        }
        let removed = self.optimizer.reconcile(vm_ids).await?;
        Ok(self.after_release(removed).await)
    }

    async fn after_release(&self, removed: Vec<RemovedVm>) -> Vec<VmId> {
        let mut released = Vec::with_capacity(removed.len());
        for vm in removed.into_iter().filter_map(|r| r.vm) {
            if let Err(e) = self.network.release_vm(&vm).await {
                warn!(vm = vm.id, error = %e, "dnat rules of released vm not removed");
            }
            released.push(vm.id);
        }
        released
    }

    pub(crate) fn site(&self, site_id: &str) -> LifecycleResult<ComputeSite> {
        self.store
            .read(|txn| txn.find_site(site_id))?
            .ok_or_else(|| LifecycleError::State(StateError::NotFound(format!("compute site {site_id}"))))
    }

    fn vm_with_site(&self, vm_id: VmId) -> LifecycleResult<(VirtualMachine, ComputeSite)> {
        Ok(self.store.read(|txn| {
            let vm = txn.require::<VirtualMachine>(vm_id)?;
            let site = txn.require::<ComputeSite>(vm.site_id)?;
            Ok::<_, StateError>((vm, site))
        })?)
    }
}

fn ensure_managed(vm: &VirtualMachine) -> LifecycleResult<()> {
    ensure_destroyable(vm).map_err(|_| {
        LifecycleError::Invariant(format!("vm {} is not managed by the platform", vm.id))
    })
}

fn insert_appliance_in(
    txn: &WriteTxn,
    request: &NewAppliance,
    now: u64,
) -> LifecycleResult<Appliance> {
    let set = txn.require::<ApplianceSet>(request.appliance_set_id)?;
    let appliance_type = txn.require::<ApplianceType>(request.appliance_type_id)?;
    txn.require::<Fund>(request.fund_id)?;

    let requested = ApplianceConfigurationInstance {
        id: 0,
        config_template_id: request.config_template_id,
        payload: request.payload.clone(),
    };
    if set.is_production() {
        let siblings = txn.list_where(|a: &Appliance| {
            a.appliance_set_id == set.id && a.appliance_type_id == appliance_type.id
        })?;
        for sibling in siblings {
            let config = txn.require::<ApplianceConfigurationInstance>(sibling.config_instance_id)?;
            if config.same_identity(&requested) {
                return Err(LifecycleError::Conflict(format!(
                    "appliance set {} already runs {} with this configuration",
                    set.id, appliance_type.name
                )));
            }
        }
    }

    let existing = txn
        .list_where(|c: &ApplianceConfigurationInstance| c.same_identity(&requested))?
        .into_iter()
        .next();
    let config = match existing {
        Some(config) => config,
        None => txn.insert_with(|id| ApplianceConfigurationInstance { id, ..requested })?,
    };

    let mut appliance = txn.insert_with(|id| Appliance {
        id,
        appliance_set_id: set.id,
        appliance_type_id: appliance_type.id,
        config_instance_id: config.id,
        fund_id: request.fund_id,
        name: request.name.clone(),
        state: ApplianceState::New,
        dev_mode_property_set_id: None,
        amount_billed: 0,
        created_at: now,
    })?;

    if set.is_development() {
        let dev = txn.insert_with(|id| DevModePropertySet {
            id,
            appliance_id: appliance.id,
            name: appliance_type.name.clone(),
            preferences: appliance_type.preferences,
        })?;
        for template in txn.templates_for_owner(PmtOwner::ApplianceType(appliance_type.id))? {
            txn.insert_with(|id| PortMappingTemplate {
                id,
                owner: PmtOwner::DevModePropertySet(dev.id),
                ..template
            })?;
        }
        appliance.dev_mode_property_set_id = Some(dev.id);
        txn.put(&appliance)?;
    }
    Ok(appliance)
}

/// Delete an appliance, its deployments, its dev-mode property set and a
/// configuration instance nobody else uses. Returns the VMs it ran on.
fn remove_appliance_in(txn: &WriteTxn, appliance: &Appliance) -> StateResult<Vec<VmId>> {
    let mut vm_ids = BTreeSet::new();
    for deployment in txn.deployments_of_appliance(appliance.id)? {
        txn.delete::<Deployment>(deployment.id)?;
        vm_ids.insert(deployment.vm_id);
    }
    txn.delete::<Appliance>(appliance.id)?;

    let config_in_use = txn
        .list::<Appliance>()?
        .iter()
        .any(|a| a.config_instance_id == appliance.config_instance_id);
    if !config_in_use {
        txn.delete::<ApplianceConfigurationInstance>(appliance.config_instance_id)?;
    }

    if let Some(dev_id) = appliance.dev_mode_property_set_id {
        for template in txn.templates_for_owner(PmtOwner::DevModePropertySet(dev_id))? {
            for mapping in txn.port_mappings_of_template(template.id)? {
                txn.delete::<PortMapping>(mapping.id)?;
            }
            txn.delete::<PortMappingTemplate>(template.id)?;
        }
        txn.delete::<DevModePropertySet>(dev_id)?;
    }
    Ok(vm_ids.into_iter().collect())
}

/// Delete expired deployments; appliances left with none are marked.
fn drop_expired_in(txn: &WriteTxn) -> StateResult<Vec<DeploymentId>> {
    let expired = txn.list_where(|d: &Deployment| d.billing_state == BillingState::Expired)?;
    let mut appliance_ids = BTreeSet::new();
    for deployment in &expired {
        txn.delete::<Deployment>(deployment.id)?;
        appliance_ids.insert(deployment.appliance_id);
    }
    mark_lost_in(txn, appliance_ids)?;
    Ok(expired.iter().map(|d| d.id).collect())
}

pub(crate) fn mark_lost_in(
    txn: &WriteTxn,
    appliance_ids: impl IntoIterator<Item = ApplianceId>,
) -> StateResult<()> {
    for appliance_id in appliance_ids {
        let Some(mut appliance) = txn.get::<Appliance>(appliance_id)? else {
            continue;
        };
        if txn.deployments_of_appliance(appliance_id)?.is_empty() {
            appliance.state = appliance.state.on(ApplianceEvent::DeploymentsLost);
            txn.put(&appliance)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use vmgrid_cloud::sim::{SimComputeSite, SimDnat, SimMonitoring};

    fn manager() -> ApplianceManager {
        let store = StateStore::open_in_memory().unwrap();
        let clouds = Clouds::new(Arc::new(SimMonitoring::new()), Duration::from_secs(5)).with_site(
            "s1",
            Arc::new(SimComputeSite::new()),
            Arc::new(SimDnat::new("149.156.10.1")),
        );
        store
            .put(&ApplianceType {
                id: 900,
                name: "jupyter".to_string(),
                shared: false,
                scalable: false,
                preferences: ResourcePreferences::default(),
                os_family: "Linux".to_string(),
            })
            .unwrap();
        store
            .put(&Fund {
                id: 901,
                name: "grant".to_string(),
                balance: 100,
                overdraft_limit: 0,
                site_ids: Default::default(),
            })
            .unwrap();
        ApplianceManager::new(store, clouds, &VmGridConfig::default())
    }

    fn request(set: ApplianceSetId, payload: &str) -> NewAppliance {
        NewAppliance {
            appliance_set_id: set,
            appliance_type_id: 900,
            config_template_id: 1,
            payload: payload.to_string(),
            fund_id: 901,
            name: None,
        }
    }

    #[test]
    fn second_development_set_conflicts() {
        let manager = manager();
        manager
            .create_appliance_set(7, "dev", ApplianceSetKind::Development)
            .unwrap();
        manager
            .create_appliance_set(7, "portal", ApplianceSetKind::Portal)
            .unwrap();
        let err = manager
            .create_appliance_set(7, "dev again", ApplianceSetKind::Development)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        manager
            .create_appliance_set(8, "dev", ApplianceSetKind::Development)
            .unwrap();
    }

    #[test]
    fn sites_are_upserted_by_identifier() {
        let manager = manager();
        let mut config = VmGridConfig::default();
        config.sites.push(vmgrid_core::config::SiteConfig {
            id: "cyfronet".to_string(),
            name: "Cyfronet".to_string(),
            site_type: SiteType::Private,
            technology: Technology::Openstack,
        });
        let first = manager.upsert_sites(&config).unwrap();
        config.sites[0].name = "Cyfronet Krakow".to_string();
        let second = manager.upsert_sites(&config).unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(manager.store().list::<ComputeSite>().unwrap().len(), 1);
        assert_eq!(second[0].name, "Cyfronet Krakow");
    }

    #[tokio::test]
    async fn duplicate_production_appliance_is_rejected_before_writing() {
        let manager = manager();
        let set = manager
            .create_appliance_set(7, "portal", ApplianceSetKind::Portal)
            .unwrap();
        let created = manager.create_appliance(request(set.id, "a=1"), 0).await.unwrap();
        // No template anywhere: placed nowhere, but created.
        assert_eq!(created.placement, PlacementOutcome::Unsatisfied);

        let err = manager.create_appliance(request(set.id, "a=1"), 0).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert_eq!(manager.store().list::<Appliance>().unwrap().len(), 1);
        assert_eq!(
            manager
                .store()
                .list::<ApplianceConfigurationInstance>()
                .unwrap()
                .len(),
            1
        );

        manager.create_appliance(request(set.id, "a=2"), 0).await.unwrap();
        assert_eq!(manager.store().list::<Appliance>().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn workflow_sets_may_repeat_configurations() {
        let manager = manager();
        let set = manager
            .create_appliance_set(7, "wf", ApplianceSetKind::Workflow)
            .unwrap();
        let a = manager.create_appliance(request(set.id, "a=1"), 0).await.unwrap();
        let b = manager.create_appliance(request(set.id, "a=1"), 0).await.unwrap();
        assert_eq!(a.appliance.config_instance_id, b.appliance.config_instance_id);

        manager.destroy_appliance(a.appliance.id, 10).await.unwrap();
        assert!(
            manager
                .store()
                .get::<ApplianceConfigurationInstance>(b.appliance.config_instance_id)
                .unwrap()
                .is_some()
        );
        manager.destroy_appliance(b.appliance.id, 10).await.unwrap();
        assert!(
            manager
                .store()
                .list::<ApplianceConfigurationInstance>()
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn development_appliance_copies_type_settings() {
        let manager = manager();
        manager
            .store()
            .put(&PortMappingTemplate {
                id: 950,
                owner: PmtOwner::ApplianceType(900),
                service_name: "ssh".to_string(),
                transport_protocol: TransportProtocol::Tcp,
                application_protocol: ApplicationProtocol::None,
                target_port: 22,
            })
            .unwrap();
        let set = manager
            .create_appliance_set(7, "dev", ApplianceSetKind::Development)
            .unwrap();
        let created = manager.create_appliance(request(set.id, "a=1"), 0).await.unwrap();
        let dev_id = created.appliance.dev_mode_property_set_id.unwrap();

        let copies = manager
            .store()
            .read(|txn| txn.templates_for_owner(PmtOwner::DevModePropertySet(dev_id)))
            .unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].service_name, "ssh");
        assert_ne!(copies[0].id, 950);

        manager.destroy_appliance(created.appliance.id, 0).await.unwrap();
        assert!(manager.store().get::<DevModePropertySet>(dev_id).unwrap().is_none());
        assert_eq!(manager.store().list::<PortMappingTemplate>().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_references_are_state_errors() {
        let manager = manager();
        let err = manager.create_appliance(request(404, "a=1"), 0).await.unwrap_err();
        assert!(matches!(err, LifecycleError::State(StateError::NotFound(_))));
        assert!(manager.store().list::<Appliance>().unwrap().is_empty());
    }
}
