//! Placement optimizer — coordinates reuse, VM creation and VM release.
//!
//! Store transactions hold only the state transitions. Provider calls run
//! between transactions: a new VM is first reserved as a pending record
//! (no provider id yet), the provider is asked to boot it, and the outcome
//! is applied in a second transaction. A failed boot removes the
//! reservation. If the appliance disappeared while the boot was in flight,
//! the fresh VM is released straight away. If the boot cannot be recorded,
//! the server is destroyed again.

use tracing::{debug, error, info, warn};
use vmgrid_cloud::{Clouds, ServerInfo, ServerSpec};
use vmgrid_core::VmGridConfig;
use vmgrid_state::registry::{RemovedVm, VmRegistry, remove_vm_in};
use vmgrid_state::*;

use crate::candidates::{pick_reuse_in, select_template_in};
use crate::error::PlacementResult;

/// How an appliance was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// A deployment was added to a VM that already hosts the same
    /// configuration.
    Reused { vm_id: VmId, deployment_id: DeploymentId },
    /// A new VM was started for the appliance.
    Created { vm_id: VmId, deployment_id: DeploymentId },
    /// No template or flavor could host the appliance right now.
    Unsatisfied,
    /// The appliance was destroyed before placement finished.
    Abandoned,
}

enum Decision {
    Done(PlacementOutcome),
    Boot {
        vm: VirtualMachine,
        site: ComputeSite,
        spec: ServerSpec,
    },
}

/// The placement optimizer.
#[derive(Clone)]
pub struct Optimizer {
    store: StateStore,
    registry: VmRegistry,
    clouds: Clouds,
    max_appliances_per_vm: u32,
    grace_secs: u64,
}

impl Optimizer {
    pub fn new(store: StateStore, clouds: Clouds, config: &VmGridConfig) -> Self {
        Self {
            registry: VmRegistry::new(store.clone()),
            store,
            clouds,
            max_appliances_per_vm: config.optimizer.max_appliances_per_vm,
            grace_secs: config.billing.grace_secs,
        }
    }

    pub fn clouds(&self) -> &Clouds {
        &self.clouds
    }

    /// Place an appliance at `now`.
    ///
    /// Provider failures are returned as errors after the reservation is
    /// rolled back and the appliance is marked unsatisfied.
    pub async fn place(
        &self,
        appliance_id: ApplianceId,
        now: u64,
    ) -> PlacementResult<PlacementOutcome> {
        let decision = self.store.write(|txn| self.decide_in(txn, appliance_id, now))?;
        let (vm, site, spec) = match decision {
            Decision::Done(outcome) => {
                log_outcome(appliance_id, outcome);
                return Ok(outcome);
            }
            Decision::Boot { vm, site, spec } => (vm, site, spec),
        };

        let server = match self.clouds.create_server(&site.site_id, &spec).await {
            Ok(server) => server,
            Err(e) => {
                error!(
                    appliance = appliance_id,
                    site = %site.site_id,
                    error = %e,
                    "vm creation failed"
                );
                self.roll_back_reservation(appliance_id, vm.id)?;
                return Err(e.into());
            }
        };

        let outcome = match self
            .store
            .write(|txn| self.apply_boot_in(txn, appliance_id, vm.id, &server, now))
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    appliance = appliance_id,
                    vm = vm.id,
                    server = %server.id_at_site,
                    error = %e,
                    "booted vm could not be recorded, destroying server"
                );
                self.discard_server(&site, &server.id_at_site).await;
                if let Err(rollback) = self.roll_back_reservation(appliance_id, vm.id) {
                    warn!(vm = vm.id, error = %rollback, "reservation rollback failed");
                }
                return Err(e);
            }
        };
        match outcome {
            PlacementOutcome::Created { vm_id, .. } => {
                self.register_monitoring(vm_id).await;
            }
            PlacementOutcome::Abandoned => {
                info!(
                    appliance = appliance_id,
                    vm = vm.id,
                    "appliance gone before its vm booted, releasing vm"
                );
                if let Some(vm) = self.store.get::<VirtualMachine>(vm.id)? {
                    self.release_marked(vm).await?;
                }
            }
            _ => {}
        }
        log_outcome(appliance_id, outcome);
        Ok(outcome)
    }

    /// Drop a reservation that never got a server and mark the appliance
    /// unsatisfied.
    fn roll_back_reservation(&self, appliance_id: ApplianceId, vm_id: VmId) -> PlacementResult<()> {
        self.store.write(|txn| {
            if txn
                .get::<VirtualMachine>(vm_id)?
                .is_some_and(|vm| vm.id_at_site.is_none())
            {
                txn.delete::<VirtualMachine>(vm_id)?;
            }
            if let Some(mut appliance) = txn.get::<Appliance>(appliance_id)? {
                appliance.state = appliance.state.on(ApplianceEvent::PlacementFailed);
                txn.put(&appliance)?;
            }
            Ok::<_, StateError>(())
        })?;
        Ok(())
    }

    /// Best-effort destroy of a server the store does not know about.
    async fn discard_server(&self, site: &ComputeSite, id_at_site: &str) {
        match self.clouds.destroy_server(&site.site_id, id_at_site).await {
            Ok(true) => debug!(site = %site.site_id, server = %id_at_site, "server discarded"),
            Ok(false) => {
                warn!(site = %site.site_id, server = %id_at_site, "provider refused server destroy");
            }
            Err(e) => {
                warn!(site = %site.site_id, server = %id_at_site, error = %e, "server destroy failed");
            }
        }
    }

    fn decide_in(
        &self,
        txn: &WriteTxn,
        appliance_id: ApplianceId,
        now: u64,
    ) -> PlacementResult<Decision> {
        let Some(mut appliance) = txn.get::<Appliance>(appliance_id)? else {
            return Ok(Decision::Done(PlacementOutcome::Abandoned));
        };
        let appliance_type = txn.require::<ApplianceType>(appliance.appliance_type_id)?;
        let fund = txn.require::<Fund>(appliance.fund_id)?;

        if appliance_type.is_shareable()
            && let Some(load) = pick_reuse_in(txn, &appliance, &fund, self.max_appliances_per_vm)?
        {
            let deployment = self.deploy_in(txn, &mut appliance, load.vm.id, now)?;
            return Ok(Decision::Done(PlacementOutcome::Reused {
                vm_id: load.vm.id,
                deployment_id: deployment.id,
            }));
        }

        let Some(choice) = select_template_in(txn, &appliance)? else {
            appliance.state = appliance.state.on(ApplianceEvent::PlacementFailed);
            txn.put(&appliance)?;
            return Ok(Decision::Done(PlacementOutcome::Unsatisfied));
        };

        let name = appliance
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", appliance_type.name, appliance.id));
        let vm = txn.insert_with(|id| VirtualMachine {
            id,
            site_id: choice.site.id,
            id_at_site: None,
            name: name.clone(),
            state: VmState::Build,
            ip: None,
            flavor_id: Some(choice.flavor.id),
            template_id: Some(choice.template.id),
            managed: true,
            monitoring_id: None,
            release_pending: false,
            created_at: now,
        })?;
        let spec = ServerSpec {
            name,
            image_id_at_site: choice.template.id_at_site.clone(),
            flavor_id_at_site: choice.flavor.id_at_site.clone(),
        };
        debug!(
            appliance = appliance_id,
            vm = vm.id,
            site = %choice.site.site_id,
            flavor = %choice.flavor.name,
            hourly_cost = choice.hourly_cost,
            "vm reserved"
        );
        Ok(Decision::Boot {
            vm,
            site: choice.site,
            spec,
        })
    }

    fn apply_boot_in(
        &self,
        txn: &WriteTxn,
        appliance_id: ApplianceId,
        vm_id: VmId,
        server: &ServerInfo,
        now: u64,
    ) -> PlacementResult<PlacementOutcome> {
        let mut vm = txn.require::<VirtualMachine>(vm_id)?;
        // A refresh may have seen the server first and recorded it as unmanaged.
        if let Some(twin) = txn.find_vm_by_id_at_site(vm.site_id, &server.id_at_site)?
            && !twin.managed
        {
            remove_vm_in(txn, twin.id)?;
        }
        vm.id_at_site = Some(server.id_at_site.clone());
        vm.state = VmState::from_provider(&server.status);
        vm.ip = server.ip.clone();

        let Some(mut appliance) = txn.get::<Appliance>(appliance_id)? else {
            vm.release_pending = true;
            txn.put(&vm)?;
            return Ok(PlacementOutcome::Abandoned);
        };
        txn.put(&vm)?;
        let deployment = self.deploy_in(txn, &mut appliance, vm_id, now)?;
        Ok(PlacementOutcome::Created {
            vm_id,
            deployment_id: deployment.id,
        })
    }

    fn deploy_in(
        &self,
        txn: &WriteTxn,
        appliance: &mut Appliance,
        vm_id: VmId,
        now: u64,
    ) -> PlacementResult<Deployment> {
        let deployment = txn.insert_with(|id| Deployment {
            id,
            appliance_id: appliance.id,
            vm_id,
            billing_state: BillingState::Prepaid,
            prepaid_until: now + self.grace_secs,
        })?;
        appliance.state = appliance.state.on(ApplianceEvent::Placed);
        txn.put(appliance)?;
        Ok(deployment)
    }

    // ── Monitoring ─────────────────────────────────────────────────

    /// Register a managed VM with an IP in monitoring. Failures are logged.
    pub async fn register_monitoring(&self, vm_id: VmId) {
        if let Err(e) = self.try_register_monitoring(vm_id).await {
            warn!(vm = vm_id, error = %e, "monitoring registration failed");
        }
    }

    async fn try_register_monitoring(&self, vm_id: VmId) -> PlacementResult<()> {
        let (vm, site) = self.store.read(|txn| {
            let vm = txn.require::<VirtualMachine>(vm_id)?;
            let site = txn.require::<ComputeSite>(vm.site_id)?;
            Ok::<_, StateError>((vm, site))
        })?;
        let Some(ip) = vm.ip.as_deref().filter(|_| vm.managed) else {
            return Ok(());
        };
        if let Some(old) = vm.monitoring_id {
            self.clouds.unregister_host(old).await?;
        }
        let host_id = self.clouds.register_host(&vm.uuid(&site), ip).await?;
        self.store.write(|txn| {
            if let Some(mut current) = txn.get::<VirtualMachine>(vm_id)? {
                current.monitoring_id = Some(host_id);
                txn.put(&current)?;
            }
            Ok::<_, StateError>(())
        })?;
        debug!(vm = vm_id, host = host_id, "vm registered in monitoring");
        Ok(())
    }

    // ── Release ────────────────────────────────────────────────────

    /// Re-evaluate VMs that may have lost their last deployment and
    /// release those that did. Returns what was removed from the registry.
    pub async fn reconcile(&self, vm_ids: &[VmId]) -> PlacementResult<Vec<RemovedVm>> {
        let mut released = Vec::new();
        for &vm_id in vm_ids {
            let Some(vm) = self.registry.mark_release_pending(vm_id)? else {
                continue;
            };
            if let Some(removed) = self.release_marked(vm).await? {
                released.push(removed);
            }
        }
        Ok(released)
    }

    /// Release every managed VM without deployments.
    pub async fn release_unused(&self) -> PlacementResult<Vec<RemovedVm>> {
        let ids: Vec<VmId> = self.registry.orphans()?.iter().map(|vm| vm.id).collect();
        self.reconcile(&ids).await
    }

    /// Destroy a VM already flagged `release_pending` at its provider.
    ///
    /// On success the VM leaves monitoring and the registry. On failure
    /// the flag is cleared so a later pass retries; the failure is logged,
    /// not returned.
    async fn release_marked(&self, vm: VirtualMachine) -> PlacementResult<Option<RemovedVm>> {
        let site = self.store.require::<ComputeSite>(vm.site_id)?;
        let Some(id_at_site) = vm.id_at_site.as_deref() else {
            self.registry.clear_release_pending(vm.id)?;
            return Ok(None);
        };

        match self.clouds.destroy_server(&site.site_id, id_at_site).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(vm = vm.id, site = %site.site_id, server = %id_at_site, "provider refused vm destroy");
                self.registry.clear_release_pending(vm.id)?;
                return Ok(None);
            }
            Err(e) => {
                error!(vm = vm.id, site = %site.site_id, server = %id_at_site, error = %e, "vm destroy failed");
                self.registry.clear_release_pending(vm.id)?;
                return Ok(None);
            }
        }

        if let Some(host_id) = vm.monitoring_id
            && let Err(e) = self.clouds.unregister_host(host_id).await
        {
            warn!(vm = vm.id, host = host_id, error = %e, "monitoring unregister failed");
        }
        let removed = self.registry.remove_vm(vm.id)?;
        info!(vm = vm.id, site = %site.site_id, server = %id_at_site, "vm released");
        Ok(Some(removed))
    }
}

fn log_outcome(appliance_id: ApplianceId, outcome: PlacementOutcome) {
    match outcome {
        PlacementOutcome::Reused { vm_id, .. } => {
            info!(appliance = appliance_id, vm = vm_id, "appliance placed on shared vm");
        }
        PlacementOutcome::Created { vm_id, .. } => {
            info!(appliance = appliance_id, vm = vm_id, "appliance placed on new vm");
        }
        PlacementOutcome::Unsatisfied => {
            info!(appliance = appliance_id, "no template available, appliance unsatisfied");
        }
        PlacementOutcome::Abandoned => {
            debug!(appliance = appliance_id, "placement abandoned");
        }
    }
}
