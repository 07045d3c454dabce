//! VM registry: the known VMs per compute site and what runs on them.
//!
//! Queries here answer the two questions placement and release ask about
//! a VM: which VMs may take another co-tenant, and which VMs no longer
//! host anything. The `_in` variants run inside a caller's transaction so
//! the answer and the decision built on it commit together.

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{Snapshot, StateStore, WriteTxn};
use crate::types::*;

/// A VM together with its current deployment count.
#[derive(Debug, Clone, PartialEq)]
pub struct VmLoad {
    pub vm: VirtualMachine,
    pub deployment_count: usize,
}

/// Records removed together with a VM.
#[derive(Debug, Clone, Default)]
pub struct RemovedVm {
    pub vm: Option<VirtualMachine>,
    pub deployments: Vec<Deployment>,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Clone)]
pub struct VmRegistry {
    store: StateStore,
}

impl VmRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Every known VM with its deployment count, in creation order.
    pub fn loads(&self) -> StateResult<Vec<VmLoad>> {
        self.store.read(|txn| {
            let mut loads = Vec::new();
            for vm in txn.list::<VirtualMachine>()? {
                let deployment_count = txn.deployments_on_vm(vm.id)?.len();
                loads.push(VmLoad { vm, deployment_count });
            }
            Ok(loads)
        })
    }

    /// Managed VMs that host nothing and may be released.
    pub fn orphans(&self) -> StateResult<Vec<VirtualMachine>> {
        self.store.read(|txn| {
            let mut orphans = Vec::new();
            for vm in txn.list::<VirtualMachine>()? {
                if is_releasable_in(txn, &vm)? {
                    orphans.push(vm);
                }
            }
            Ok(orphans)
        })
    }

    /// Flag an orphaned VM for release. Returns `None` when the VM has
    /// gained a deployment, is already being released, or is being saved.
    pub fn mark_release_pending(&self, vm_id: VmId) -> StateResult<Option<VirtualMachine>> {
        self.store.write(|txn| {
            let Some(mut vm) = txn.get::<VirtualMachine>(vm_id)? else {
                return Ok(None);
            };
            if !is_releasable_in(txn, &vm)? {
                return Ok(None);
            }
            vm.release_pending = true;
            txn.put(&vm)?;
            debug!(vm = vm.id, "vm marked for release");
            Ok(Some(vm))
        })
    }

    /// Undo [`mark_release_pending`](Self::mark_release_pending) after a
    /// failed provider destroy, leaving the VM as a later release candidate.
    pub fn clear_release_pending(&self, vm_id: VmId) -> StateResult<()> {
        self.store.write(|txn| {
            if let Some(mut vm) = txn.get::<VirtualMachine>(vm_id)? {
                vm.release_pending = false;
                txn.put(&vm)?;
            }
            Ok(())
        })
    }

    pub fn remove_vm(&self, vm_id: VmId) -> StateResult<RemovedVm> {
        self.store.write(|txn| remove_vm_in(txn, vm_id))
    }
}

/// Refuse to destroy a VM the platform does not manage.
pub fn ensure_destroyable(vm: &VirtualMachine) -> StateResult<()> {
    if vm.managed {
        Ok(())
    } else {
        Err(StateError::Invalid(format!(
            "virtual machine {} is not managed by the platform",
            vm.id
        )))
    }
}

/// Whether `vm` is managed, settled, empty and not being saved.
pub fn is_releasable_in(txn: &impl Snapshot, vm: &VirtualMachine) -> StateResult<bool> {
    if !vm.managed || vm.release_pending || vm.is_pending() {
        return Ok(false);
    }
    if !txn.deployments_on_vm(vm.id)?.is_empty() {
        return Ok(false);
    }
    Ok(!txn.is_saving(vm.id)?)
}

/// VMs that may host `appliance` as another co-tenant, least loaded first,
/// oldest first among equals.
///
/// A candidate is a managed, settled VM on a site the fund is bound to,
/// hosting at least one appliance whose configuration instance has the
/// same identity as the new appliance's, with fewer than `max_per_vm`
/// deployments.
pub fn reuse_candidates_in(
    txn: &impl Snapshot,
    appliance: &Appliance,
    fund: &Fund,
    max_per_vm: u32,
) -> StateResult<Vec<VmLoad>> {
    let config = txn.require::<ApplianceConfigurationInstance>(appliance.config_instance_id)?;
    let mut candidates = Vec::new();

    for vm in txn.list::<VirtualMachine>()? {
        if !vm.managed || vm.release_pending || vm.is_pending() || !vm.state.accepts_appliances() {
            continue;
        }
        if !fund.is_bound_to(vm.site_id) {
            continue;
        }
        let deployments = txn.deployments_on_vm(vm.id)?;
        if deployments.is_empty() || deployments.len() >= max_per_vm as usize {
            continue;
        }
        let mut same_config = false;
        for hosted in txn.appliances_on_vm(vm.id)? {
            if hosted.id == appliance.id {
                continue;
            }
            let hosted_config =
                txn.require::<ApplianceConfigurationInstance>(hosted.config_instance_id)?;
            if hosted.appliance_type_id == appliance.appliance_type_id
                && hosted_config.same_identity(&config)
            {
                same_config = true;
                break;
            }
        }
        if same_config {
            candidates.push(VmLoad {
                deployment_count: deployments.len(),
                vm,
            });
        }
    }

    candidates.sort_by_key(|load| (load.deployment_count, load.vm.id));
    Ok(candidates)
}

/// Delete a VM together with its deployments and port mappings.
pub fn remove_vm_in(txn: &WriteTxn, vm_id: VmId) -> StateResult<RemovedVm> {
    let mut removed = RemovedVm {
        vm: txn.get::<VirtualMachine>(vm_id)?,
        ..Default::default()
    };
    for deployment in txn.deployments_on_vm(vm_id)? {
        txn.delete::<Deployment>(deployment.id)?;
        removed.deployments.push(deployment);
    }
    for mapping in txn.port_mappings_of_vm(vm_id)? {
        txn.delete::<PortMapping>(mapping.id)?;
        removed.port_mappings.push(mapping);
    }
    txn.delete::<VirtualMachine>(vm_id)?;
    debug!(
        vm = vm_id,
        deployments = removed.deployments.len(),
        port_mappings = removed.port_mappings.len(),
        "vm removed from registry"
    );
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct Fixture {
        store: StateStore,
        fund: Fund,
        config: ApplianceConfigurationInstance,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let fund = Fund {
            id: 1,
            name: "fund".to_string(),
            balance: 100,
            overdraft_limit: 0,
            site_ids: BTreeSet::from([10]),
        };
        let config = ApplianceConfigurationInstance {
            id: 2,
            config_template_id: 3,
            payload: "a=1".to_string(),
        };
        store.put(&fund).unwrap();
        store.put(&config).unwrap();
        Fixture { store, fund, config }
    }

    fn appliance(id: u64, config_instance_id: u64) -> Appliance {
        Appliance {
            id,
            appliance_set_id: 1,
            appliance_type_id: 4,
            config_instance_id,
            fund_id: 1,
            name: None,
            state: ApplianceState::Satisfied,
            dev_mode_property_set_id: None,
            amount_billed: 0,
            created_at: 0,
        }
    }

    fn vm(id: u64, site_id: u64) -> VirtualMachine {
        VirtualMachine {
            id,
            site_id,
            id_at_site: Some(format!("srv-{id}")),
            name: format!("vm-{id}"),
            state: VmState::Active,
            ip: None,
            flavor_id: None,
            template_id: None,
            managed: true,
            monitoring_id: None,
            release_pending: false,
            created_at: 0,
        }
    }

    fn host(store: &StateStore, deployment_id: u64, appliance: &Appliance, vm_id: u64) {
        store.put(appliance).unwrap();
        store
            .put(&Deployment {
                id: deployment_id,
                appliance_id: appliance.id,
                vm_id,
                billing_state: BillingState::Prepaid,
                prepaid_until: 0,
            })
            .unwrap();
    }

    fn candidate_ids(f: &Fixture, new: &Appliance, max: u32) -> Vec<u64> {
        f.store
            .read(|txn| reuse_candidates_in(txn, new, &f.fund, max))
            .unwrap()
            .iter()
            .map(|load| load.vm.id)
            .collect()
    }

    #[test]
    fn candidates_share_config_identity() {
        let f = fixture();
        f.store.put(&vm(100, 10)).unwrap();
        f.store.put(&vm(101, 10)).unwrap();
        // Different instance record, same identity.
        let twin = ApplianceConfigurationInstance {
            id: 5,
            ..f.config.clone()
        };
        let other = ApplianceConfigurationInstance {
            id: 6,
            payload: "a=2".to_string(),
            ..f.config.clone()
        };
        f.store.put(&twin).unwrap();
        f.store.put(&other).unwrap();
        host(&f.store, 50, &appliance(20, twin.id), 100);
        host(&f.store, 51, &appliance(21, other.id), 101);

        assert_eq!(candidate_ids(&f, &appliance(30, f.config.id), 5), vec![100]);
    }

    #[test]
    fn candidates_respect_fund_sites_and_limit() {
        let f = fixture();
        f.store.put(&vm(100, 10)).unwrap();
        f.store.put(&vm(101, 99)).unwrap();
        host(&f.store, 50, &appliance(20, f.config.id), 100);
        host(&f.store, 51, &appliance(21, f.config.id), 101);

        let new = appliance(30, f.config.id);
        assert_eq!(candidate_ids(&f, &new, 5), vec![100]);
        assert!(candidate_ids(&f, &new, 1).is_empty());
    }

    #[test]
    fn candidates_least_loaded_then_oldest() {
        let f = fixture();
        for id in [100, 101, 102] {
            f.store.put(&vm(id, 10)).unwrap();
        }
        host(&f.store, 50, &appliance(20, f.config.id), 100);
        host(&f.store, 51, &appliance(21, f.config.id), 100);
        host(&f.store, 52, &appliance(22, f.config.id), 101);
        host(&f.store, 53, &appliance(23, f.config.id), 102);

        assert_eq!(
            candidate_ids(&f, &appliance(30, f.config.id), 5),
            vec![101, 102, 100]
        );
    }

    #[test]
    fn unsettled_vms_are_not_candidates() {
        let f = fixture();
        let mut releasing = vm(100, 10);
        releasing.release_pending = true;
        let mut pending = vm(101, 10);
        pending.id_at_site = None;
        let mut unmanaged = vm(102, 10);
        unmanaged.managed = false;
        let mut broken = vm(103, 10);
        broken.state = VmState::Error;
        for (i, v) in [releasing, pending, unmanaged, broken].into_iter().enumerate() {
            let id = v.id;
            f.store.put(&v).unwrap();
            host(&f.store, 50 + i as u64, &appliance(20 + i as u64, f.config.id), id);
        }

        assert!(candidate_ids(&f, &appliance(30, f.config.id), 5).is_empty());
    }

    #[test]
    fn orphans_and_release_flag() {
        let f = fixture();
        let registry = VmRegistry::new(f.store.clone());
        f.store.put(&vm(100, 10)).unwrap();
        f.store.put(&vm(101, 10)).unwrap();
        host(&f.store, 50, &appliance(20, f.config.id), 101);

        let orphan_ids: Vec<u64> = registry.orphans().unwrap().iter().map(|v| v.id).collect();
        assert_eq!(orphan_ids, vec![100]);

        assert!(registry.mark_release_pending(100).unwrap().is_some());
        // Second attempt sees the flag.
        assert!(registry.mark_release_pending(100).unwrap().is_none());
        assert!(registry.mark_release_pending(101).unwrap().is_none());
        assert!(registry.orphans().unwrap().is_empty());

        registry.clear_release_pending(100).unwrap();
        assert_eq!(registry.orphans().unwrap().len(), 1);
    }

    #[test]
    fn saving_vm_is_not_released() {
        let f = fixture();
        let registry = VmRegistry::new(f.store.clone());
        f.store.put(&vm(100, 10)).unwrap();
        f.store
            .put(&VmTemplate {
                id: 7,
                site_id: 10,
                id_at_site: "img".to_string(),
                name: "capture".to_string(),
                state: TemplateState::Saving,
                appliance_type_id: Some(4),
                source_vm_id: Some(100),
                created_at: 0,
            })
            .unwrap();

        assert!(registry.orphans().unwrap().is_empty());
        assert!(registry.mark_release_pending(100).unwrap().is_none());
    }

    #[test]
    fn remove_vm_takes_mappings_and_deployments() {
        let f = fixture();
        let registry = VmRegistry::new(f.store.clone());
        f.store.put(&vm(100, 10)).unwrap();
        host(&f.store, 50, &appliance(20, f.config.id), 100);
        f.store
            .put(&PortMapping {
                id: 60,
                template_id: 70,
                vm_id: 100,
                public_ip: "1.2.3.4".to_string(),
                source_port: 30022,
            })
            .unwrap();

        let removed = registry.remove_vm(100).unwrap();
        assert_eq!(removed.vm.map(|v| v.id), Some(100));
        assert_eq!(removed.deployments.len(), 1);
        assert_eq!(removed.port_mappings.len(), 1);
        assert!(f.store.list::<PortMapping>().unwrap().is_empty());
        assert_eq!(registry.loads().unwrap().len(), 0);
    }

    #[test]
    fn unmanaged_vm_is_not_destroyable() {
        let mut v = vm(1, 10);
        assert!(ensure_destroyable(&v).is_ok());
        v.managed = false;
        assert!(matches!(ensure_destroyable(&v), Err(StateError::Invalid(_))));
    }
}
