//! Candidate selection for placement decisions.
//!
//! Two choices are made here, both inside the caller's transaction:
//! - **Reuse**: the least loaded VM that already hosts the appliance's
//!   configuration and that the fund can pay a share of
//! - **New VM**: the cheapest affordable flavor that meets the resource
//!   preferences, on a site holding an active template for the type

use tracing::debug;
use vmgrid_billing::service::{can_afford_flavor_in, can_afford_vm_in};
use vmgrid_state::registry::{VmLoad, reuse_candidates_in};
use vmgrid_state::*;

use crate::error::PlacementResult;

/// Where a new VM for an appliance would be started.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateChoice {
    pub site: ComputeSite,
    pub template: VmTemplate,
    pub flavor: VmFlavor,
    pub hourly_cost: Amount,
}

/// Resource preferences in force: a dev-mode property set overrides the
/// appliance type.
pub fn effective_preferences_in(
    txn: &impl Snapshot,
    appliance: &Appliance,
) -> PlacementResult<ResourcePreferences> {
    if let Some(dev_id) = appliance.dev_mode_property_set_id
        && let Some(dev) = txn.get::<DevModePropertySet>(dev_id)?
    {
        return Ok(dev.preferences);
    }
    Ok(txn
        .require::<ApplianceType>(appliance.appliance_type_id)?
        .preferences)
}

/// First reuse candidate the fund can afford a share of.
pub fn pick_reuse_in(
    txn: &impl Snapshot,
    appliance: &Appliance,
    fund: &Fund,
    max_per_vm: u32,
) -> PlacementResult<Option<VmLoad>> {
    for load in reuse_candidates_in(txn, appliance, fund, max_per_vm)? {
        if can_afford_vm_in(txn, appliance, &load.vm)? {
            return Ok(Some(load));
        }
        debug!(
            appliance = appliance.id,
            vm = load.vm.id,
            "reuse candidate not affordable"
        );
    }
    Ok(None)
}

/// Cheapest affordable (template, flavor) pair for a new VM.
///
/// Ties on price go to the flavor with less memory, then the lower flavor
/// id, then the lower template id.
pub fn select_template_in(
    txn: &impl Snapshot,
    appliance: &Appliance,
) -> PlacementResult<Option<TemplateChoice>> {
    let fund = txn.require::<Fund>(appliance.fund_id)?;
    let appliance_type = txn.require::<ApplianceType>(appliance.appliance_type_id)?;
    let preferences = effective_preferences_in(txn, appliance)?;

    let templates = txn.list_where(|t: &VmTemplate| {
        t.appliance_type_id == Some(appliance_type.id)
            && t.state == TemplateState::Active
            && fund.is_bound_to(t.site_id)
    })?;
    if templates.is_empty() {
        debug!(appliance = appliance.id, "no active template on any eligible site");
        return Ok(None);
    }

    let flavors = txn.list::<VmFlavor>()?;
    let mut best: Option<(TemplateChoice, (Amount, u64, u64, u64))> = None;
    for template in templates {
        for flavor in flavors.iter().filter(|f| f.site_id == template.site_id) {
            if !flavor.satisfies(&preferences) {
                continue;
            }
            let Some(cost) = flavor.hourly_cost(&appliance_type.os_family) else {
                continue;
            };
            if !can_afford_flavor_in(txn, appliance, flavor)? {
                continue;
            }
            let rank = (cost, flavor.memory_mb, flavor.id, template.id);
            if best.as_ref().is_some_and(|(_, best_rank)| *best_rank <= rank) {
                continue;
            }
            let Some(site) = txn.get::<ComputeSite>(template.site_id)? else {
                continue;
            };
            best = Some((
                TemplateChoice {
                    site,
                    template: template.clone(),
                    flavor: flavor.clone(),
                    hourly_cost: cost,
                },
                rank,
            ));
        }
    }
    Ok(best.map(|(choice, _)| choice))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn store_with_fund(balance: Amount, sites: &[u64]) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for &id in sites.iter().chain([2].iter()) {
            store
                .put(&ComputeSite {
                    id,
                    site_id: format!("site-{id}"),
                    name: format!("Site {id}"),
                    site_type: SiteType::Private,
                    technology: Technology::Openstack,
                })
                .unwrap();
        }
        store
            .put(&Fund {
                id: 10,
                name: "grant".to_string(),
                balance,
                overdraft_limit: 0,
                site_ids: sites.iter().copied().collect::<BTreeSet<_>>(),
            })
            .unwrap();
        store
            .put(&ApplianceType {
                id: 20,
                name: "ubuntu".to_string(),
                shared: false,
                scalable: false,
                preferences: ResourcePreferences {
                    cpu: Some(2),
                    memory_mb: None,
                    disk_gb: None,
                },
                os_family: "Linux".to_string(),
            })
            .unwrap();
        store
    }

    fn template(store: &StateStore, id: u64, site_id: u64, state: TemplateState) {
        store
            .put(&VmTemplate {
                id,
                site_id,
                id_at_site: format!("img-{id}"),
                name: format!("img-{id}"),
                state,
                appliance_type_id: Some(20),
                source_vm_id: None,
                created_at: 0,
            })
            .unwrap();
    }

    fn flavor(store: &StateStore, id: u64, site_id: u64, cpu: u32, memory_mb: u64, cost: Amount) {
        store
            .put(&VmFlavor {
                id,
                site_id,
                id_at_site: format!("flavor-{id}"),
                name: format!("flavor-{id}"),
                cpu,
                memory_mb,
                hdd_gb: 20,
                hourly_costs: BTreeMap::from([("Linux".to_string(), cost)]),
            })
            .unwrap();
    }

    fn appliance() -> Appliance {
        Appliance {
            id: 30,
            appliance_set_id: 1,
            appliance_type_id: 20,
            config_instance_id: 1,
            fund_id: 10,
            name: None,
            state: ApplianceState::New,
            dev_mode_property_set_id: None,
            amount_billed: 0,
            created_at: 0,
        }
    }

    fn choose(store: &StateStore) -> Option<(u64, u64)> {
        store
            .read(|txn| select_template_in(txn, &appliance()))
            .unwrap()
            .map(|c| (c.template.id, c.flavor.id))
    }

    #[test]
    fn cheapest_satisfying_flavor_wins() {
        let store = store_with_fund(100, &[1]);
        template(&store, 40, 1, TemplateState::Active);
        flavor(&store, 50, 1, 1, 1024, 1); // too few cpus
        flavor(&store, 51, 1, 2, 4096, 8);
        flavor(&store, 52, 1, 4, 8192, 5);
        assert_eq!(choose(&store), Some((40, 52)));
    }

    #[test]
    fn price_ties_go_to_less_memory() {
        let store = store_with_fund(100, &[1]);
        template(&store, 40, 1, TemplateState::Active);
        flavor(&store, 50, 1, 2, 8192, 5);
        flavor(&store, 51, 1, 2, 2048, 5);
        assert_eq!(choose(&store), Some((40, 51)));
    }

    #[test]
    fn only_active_templates_on_bound_sites() {
        let store = store_with_fund(100, &[1]);
        template(&store, 40, 1, TemplateState::Saving);
        template(&store, 41, 2, TemplateState::Active);
        flavor(&store, 50, 1, 2, 1024, 1);
        flavor(&store, 51, 2, 2, 1024, 1);
        assert_eq!(choose(&store), None);

        template(&store, 40, 1, TemplateState::Active);
        assert_eq!(choose(&store), Some((40, 50)));
    }

    #[test]
    fn unaffordable_flavors_are_skipped() {
        let store = store_with_fund(6, &[1]);
        template(&store, 40, 1, TemplateState::Active);
        flavor(&store, 50, 1, 2, 1024, 7);
        assert_eq!(choose(&store), None);
        flavor(&store, 51, 1, 8, 65536, 6);
        assert_eq!(choose(&store), Some((40, 51)));
    }

    #[test]
    fn dev_mode_preferences_override_type() {
        let store = store_with_fund(100, &[1]);
        store
            .put(&DevModePropertySet {
                id: 60,
                appliance_id: 30,
                name: "dev".to_string(),
                preferences: ResourcePreferences {
                    cpu: Some(8),
                    memory_mb: None,
                    disk_gb: None,
                },
            })
            .unwrap();
        template(&store, 40, 1, TemplateState::Active);
        flavor(&store, 50, 1, 2, 1024, 1);
        flavor(&store, 51, 1, 8, 1024, 9);

        let mut dev = appliance();
        dev.dev_mode_property_set_id = Some(60);
        let chosen = store
            .read(|txn| select_template_in(txn, &dev))
            .unwrap()
            .map(|c| c.flavor.id);
        assert_eq!(chosen, Some(51));
    }
}
