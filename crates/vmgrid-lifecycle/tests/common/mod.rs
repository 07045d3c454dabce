//! Shared fixture for lifecycle integration tests: one simulated compute
//! site "s1" with a shareable and a dedicated appliance type, an active
//! template for each, a single flavor and a fund bound to the site.
//! A second site "s2" with its own DNAT gateway can be seeded on request.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use vmgrid_cloud::Clouds;
use vmgrid_cloud::sim::{SimComputeSite, SimDnat, SimMonitoring};
use vmgrid_core::VmGridConfig;
use vmgrid_lifecycle::{ApplianceManager, CreatedAppliance, NewAppliance};
use vmgrid_placement::PlacementOutcome;
use vmgrid_state::*;

pub const T0: u64 = 1_700_000_000;
pub const HOUR: u64 = 3600;

pub const SITE: SiteId = 1;
pub const SHARED_TYPE: ApplianceTypeId = 2;
pub const DEDICATED_TYPE: ApplianceTypeId = 3;
pub const SHARED_TEMPLATE: TemplateId = 4;
pub const DEDICATED_TEMPLATE: TemplateId = 5;
pub const FLAVOR: FlavorId = 6;
pub const FUND: FundId = 7;
pub const PUBLIC_IP: &str = "149.156.10.1";

pub const SITE2: SiteId = 8;
pub const SITE2_TEMPLATE: TemplateId = 9;
pub const SITE2_FLAVOR: FlavorId = 10;
pub const SITE2_PUBLIC_IP: &str = "149.156.20.1";

pub struct Grid {
    pub manager: ApplianceManager,
    pub site: Arc<SimComputeSite>,
    pub monitoring: Arc<SimMonitoring>,
    pub dnat: Arc<SimDnat>,
    pub site2: Arc<SimComputeSite>,
    pub dnat2: Arc<SimDnat>,
}

pub struct GridBuilder {
    balance: Amount,
    overdraft_limit: Amount,
    hourly_cost: Amount,
    max_per_vm: u32,
    second_site: bool,
}

impl Default for GridBuilder {
    fn default() -> Self {
        Self {
            balance: 1_000,
            overdraft_limit: 0,
            hourly_cost: 10,
            max_per_vm: 5,
            second_site: false,
        }
    }
}

impl GridBuilder {
    pub fn balance(mut self, balance: Amount) -> Self {
        self.balance = balance;
        self
    }

    pub fn overdraft(mut self, limit: Amount) -> Self {
        self.overdraft_limit = limit;
        self
    }

    pub fn hourly_cost(mut self, cost: Amount) -> Self {
        self.hourly_cost = cost;
        self
    }

    pub fn max_per_vm(mut self, max: u32) -> Self {
        self.max_per_vm = max;
        self
    }

    /// Seed site "s2" with a template of the dedicated type and a flavor.
    /// The fund stays bound to "s1" only.
    pub fn second_site(mut self) -> Self {
        self.second_site = true;
        self
    }

    pub fn build(self) -> Grid {
        self.build_on(StateStore::open_in_memory().unwrap())
    }

    pub fn build_on(self, store: StateStore) -> Grid {
        seed(&store, &self);
        let site = Arc::new(SimComputeSite::new());
        site.add_image("img-tomcat", "tomcat", "ACTIVE");
        site.add_image("img-ubuntu", "ubuntu", "ACTIVE");
        let monitoring = Arc::new(SimMonitoring::new());
        let dnat = Arc::new(SimDnat::new(PUBLIC_IP));
        let site2 = Arc::new(SimComputeSite::new());
        site2.add_image("img-ubuntu", "ubuntu", "ACTIVE");
        let dnat2 = Arc::new(SimDnat::new(SITE2_PUBLIC_IP));
        let clouds = Clouds::new(monitoring.clone(), Duration::from_secs(5))
            .with_site("s1", site.clone(), dnat.clone())
            .with_site("s2", site2.clone(), dnat2.clone());

        let mut config = VmGridConfig::default();
        config.optimizer.max_appliances_per_vm = self.max_per_vm;
        Grid {
            manager: ApplianceManager::new(store, clouds, &config),
            site,
            monitoring,
            dnat,
            site2,
            dnat2,
        }
    }
}

fn seed(store: &StateStore, b: &GridBuilder) {
    if store.get::<ComputeSite>(SITE).unwrap().is_some() {
        return;
    }
    store
        .put(&ComputeSite {
            id: SITE,
            site_id: "s1".to_string(),
            name: "Site one".to_string(),
            site_type: SiteType::Private,
            technology: Technology::Openstack,
        })
        .unwrap();
    for (id, name, shareable) in [(SHARED_TYPE, "tomcat", true), (DEDICATED_TYPE, "ubuntu", false)] {
        store
            .put(&ApplianceType {
                id,
                name: name.to_string(),
                shared: shareable,
                scalable: shareable,
                preferences: ResourcePreferences::default(),
                os_family: "Linux".to_string(),
            })
            .unwrap();
    }
    for (id, type_id, image) in [
        (SHARED_TEMPLATE, SHARED_TYPE, "img-tomcat"),
        (DEDICATED_TEMPLATE, DEDICATED_TYPE, "img-ubuntu"),
    ] {
        store
            .put(&VmTemplate {
                id,
                site_id: SITE,
                id_at_site: image.to_string(),
                name: image.trim_start_matches("img-").to_string(),
                state: TemplateState::Active,
                appliance_type_id: Some(type_id),
                source_vm_id: None,
                created_at: 0,
            })
            .unwrap();
    }
    store
        .put(&VmFlavor {
            id: FLAVOR,
            site_id: SITE,
            id_at_site: "m1.small".to_string(),
            name: "m1.small".to_string(),
            cpu: 1,
            memory_mb: 2048,
            hdd_gb: 20,
            hourly_costs: BTreeMap::from([("Linux".to_string(), b.hourly_cost)]),
        })
        .unwrap();
    store
        .put(&Fund {
            id: FUND,
            name: "grant".to_string(),
            balance: b.balance,
            overdraft_limit: b.overdraft_limit,
            site_ids: BTreeSet::from([SITE]),
        })
        .unwrap();
    if b.second_site {
        seed_second_site(store, b);
    }
    // Keep generated ids clear of the fixture ids.
    store
        .write(|txn| {
            while txn.next_id()? < 100 {}
            Ok::<_, StateError>(())
        })
        .unwrap();
}

fn seed_second_site(store: &StateStore, b: &GridBuilder) {
    store
        .put(&ComputeSite {
            id: SITE2,
            site_id: "s2".to_string(),
            name: "Site two".to_string(),
            site_type: SiteType::Private,
            technology: Technology::Openstack,
        })
        .unwrap();
    store
        .put(&VmTemplate {
            id: SITE2_TEMPLATE,
            site_id: SITE2,
            id_at_site: "img-ubuntu".to_string(),
            name: "ubuntu".to_string(),
            state: TemplateState::Active,
            appliance_type_id: Some(DEDICATED_TYPE),
            source_vm_id: None,
            created_at: 0,
        })
        .unwrap();
    store
        .put(&VmFlavor {
            id: SITE2_FLAVOR,
            site_id: SITE2,
            id_at_site: "m1.small".to_string(),
            name: "m1.small".to_string(),
            cpu: 1,
            memory_mb: 2048,
            hdd_gb: 20,
            hourly_costs: BTreeMap::from([("Linux".to_string(), b.hourly_cost)]),
        })
        .unwrap();
}

impl Grid {
    pub fn builder() -> GridBuilder {
        GridBuilder::default()
    }

    pub fn store(&self) -> &StateStore {
        self.manager.store()
    }

    pub fn set(&self, kind: ApplianceSetKind) -> ApplianceSetId {
        self.manager
            .create_appliance_set(42, &format!("{kind:?}"), kind)
            .unwrap()
            .id
    }

    pub async fn create(
        &self,
        set: ApplianceSetId,
        appliance_type: ApplianceTypeId,
        payload: &str,
        now: u64,
    ) -> CreatedAppliance {
        self.manager
            .create_appliance(
                NewAppliance {
                    appliance_set_id: set,
                    appliance_type_id: appliance_type,
                    config_template_id: 1,
                    payload: payload.to_string(),
                    fund_id: FUND,
                    name: None,
                },
                now,
            )
            .await
            .unwrap()
    }

    pub fn balance(&self) -> Amount {
        self.store().require::<Fund>(FUND).unwrap().balance
    }

    pub fn set_balance(&self, balance: Amount) {
        let mut fund = self.store().require::<Fund>(FUND).unwrap();
        fund.balance = balance;
        self.store().put(&fund).unwrap();
    }

    /// Rebind the fund to exactly `sites`.
    pub fn bind_fund(&self, sites: &[SiteId]) {
        let mut fund = self.store().require::<Fund>(FUND).unwrap();
        fund.site_ids = sites.iter().copied().collect();
        self.store().put(&fund).unwrap();
    }

    pub fn vm(&self, vm_id: VmId) -> VirtualMachine {
        self.store().require::<VirtualMachine>(vm_id).unwrap()
    }

    pub fn appliance(&self, id: ApplianceId) -> Appliance {
        self.store().require::<Appliance>(id).unwrap()
    }
}

/// VM an appliance landed on.
pub fn vm_of(outcome: PlacementOutcome) -> VmId {
    match outcome {
        PlacementOutcome::Reused { vm_id, .. } | PlacementOutcome::Created { vm_id, .. } => vm_id,
        other => panic!("appliance not placed: {other:?}"),
    }
}
