//! Placement, reuse and release driven through the appliance manager.

mod common;

use std::collections::BTreeSet;

use common::*;
use vmgrid_placement::PlacementOutcome;
use vmgrid_state::*;

#[tokio::test]
async fn identical_configurations_share_a_vm_until_the_limit() {
    let grid = Grid::builder().max_per_vm(3).build();
    let set = grid.set(ApplianceSetKind::Workflow);

    let mut vms = Vec::new();
    for _ in 0..4 {
        let created = grid.create(set, SHARED_TYPE, "port=8080", T0).await;
        vms.push(vm_of(created.placement));
    }

    assert_eq!(vms[0], vms[1]);
    assert_eq!(vms[0], vms[2]);
    assert_ne!(vms[0], vms[3]);
    assert_eq!(grid.site.created_count(), 2);
    let on_first = grid
        .store()
        .read(|txn| txn.deployments_on_vm(vms[0]))
        .unwrap();
    assert_eq!(on_first.len(), 3);
}

#[tokio::test]
async fn different_configurations_do_not_share() {
    let grid = Grid::builder().build();
    let set = grid.set(ApplianceSetKind::Workflow);

    let a = grid.create(set, SHARED_TYPE, "port=8080", T0).await;
    let b = grid.create(set, SHARED_TYPE, "port=9090", T0).await;
    assert_ne!(vm_of(a.placement), vm_of(b.placement));
}

#[tokio::test]
async fn non_shareable_appliances_get_dedicated_vms() {
    let grid = Grid::builder().build();
    let set = grid.set(ApplianceSetKind::Workflow);

    let mut vms = BTreeSet::new();
    for _ in 0..4 {
        let created = grid.create(set, DEDICATED_TYPE, "same", T0).await;
        assert!(matches!(created.placement, PlacementOutcome::Created { .. }));
        assert_eq!(created.appliance.state, ApplianceState::Satisfied);
        vms.insert(vm_of(created.placement));
    }
    assert_eq!(vms.len(), 4);
}

#[tokio::test]
async fn least_loaded_vm_is_reused_first() {
    let grid = Grid::builder().max_per_vm(3).build();
    let set = grid.set(ApplianceSetKind::Workflow);

    // Fill the first VM and open a second one.
    let mut first = Vec::new();
    for _ in 0..3 {
        first.push(grid.create(set, SHARED_TYPE, "cfg", T0).await);
    }
    let second = grid.create(set, SHARED_TYPE, "cfg", T0).await;
    let first_vm = vm_of(first[0].placement);
    let second_vm = vm_of(second.placement);

    // Free two slots on the first VM: it now holds one, the second one.
    // Ties go to the older VM.
    grid.manager
        .destroy_appliance(first[1].appliance.id, T0)
        .await
        .unwrap();
    grid.manager
        .destroy_appliance(first[2].appliance.id, T0)
        .await
        .unwrap();
    let next = grid.create(set, SHARED_TYPE, "cfg", T0).await;
    assert_eq!(vm_of(next.placement), first_vm);

    let after = grid.create(set, SHARED_TYPE, "cfg", T0).await;
    assert_eq!(vm_of(after.placement), second_vm);
}

#[tokio::test]
async fn destroying_the_last_appliance_releases_the_vm() {
    let grid = Grid::builder().build();
    let set = grid.set(ApplianceSetKind::Workflow);
    let a = grid.create(set, SHARED_TYPE, "cfg", T0).await;
    let b = grid.create(set, SHARED_TYPE, "cfg", T0).await;
    let vm_id = vm_of(a.placement);
    let server = grid.vm(vm_id).id_at_site.unwrap();

    let first = grid.manager.destroy_appliance(a.appliance.id, T0).await.unwrap();
    assert!(first.released_vms.is_empty());
    assert!(grid.store().get::<VirtualMachine>(vm_id).unwrap().is_some());

    let last = grid.manager.destroy_appliance(b.appliance.id, T0).await.unwrap();
    assert_eq!(last.released_vms, vec![vm_id]);
    assert!(grid.store().get::<VirtualMachine>(vm_id).unwrap().is_none());
    assert_eq!(grid.site.destroyed(), vec![server]);
    assert!(grid.monitoring.hosts().is_empty());
    assert!(grid.store().list::<Deployment>().unwrap().is_empty());
}

#[tokio::test]
async fn refused_destroy_is_retried_by_the_next_tick() {
    let grid = Grid::builder().build();
    let set = grid.set(ApplianceSetKind::Workflow);
    let a = grid.create(set, DEDICATED_TYPE, "cfg", T0).await;
    let vm_id = vm_of(a.placement);

    grid.site.set_refuse_destroy(true);
    let destroyed = grid.manager.destroy_appliance(a.appliance.id, T0).await.unwrap();
    assert!(destroyed.released_vms.is_empty());
    let vm = grid.vm(vm_id);
    assert!(!vm.release_pending);

    grid.site.set_refuse_destroy(false);
    let tick = grid.manager.bill_tick(T0 + 10).await.unwrap();
    assert_eq!(tick.released_vms, vec![vm_id]);
    assert!(grid.store().get::<VirtualMachine>(vm_id).unwrap().is_none());
}

#[tokio::test]
async fn missing_template_is_retried_when_one_becomes_active() {
    let grid = Grid::builder().build();
    let mut template = grid.store().require::<VmTemplate>(DEDICATED_TEMPLATE).unwrap();
    template.state = TemplateState::Saving;
    grid.store().put(&template).unwrap();
    grid.site.add_image("img-ubuntu", "ubuntu", "SAVING");

    let set = grid.set(ApplianceSetKind::Workflow);
    let created = grid.create(set, DEDICATED_TYPE, "cfg", T0).await;
    assert_eq!(created.placement, PlacementOutcome::Unsatisfied);
    assert_eq!(created.appliance.state, ApplianceState::Unsatisfied);
    assert!(grid.store().list::<VirtualMachine>().unwrap().is_empty());

    grid.site.add_image("img-ubuntu", "ubuntu", "ACTIVE");
    let report = grid.manager.refresh_templates("s1", T0 + 60).await.unwrap();
    assert_eq!(report.activated, 1);
    assert_eq!(report.retried.len(), 1);
    assert!(matches!(report.retried[0].1, PlacementOutcome::Created { .. }));
    assert_eq!(
        grid.appliance(created.appliance.id).state,
        ApplianceState::Satisfied
    );
}

#[tokio::test]
async fn provider_outage_defers_placement() {
    let grid = Grid::builder().build();
    let set = grid.set(ApplianceSetKind::Workflow);

    grid.site.set_unavailable(true);
    let created = grid.create(set, DEDICATED_TYPE, "cfg", T0).await;
    assert_eq!(created.placement, PlacementOutcome::Unsatisfied);
    assert!(grid.store().list::<VirtualMachine>().unwrap().is_empty());

    grid.site.set_unavailable(false);
    let retried = grid.manager.retry_unsatisfied(T0 + 30).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert!(matches!(retried[0].1, PlacementOutcome::Created { .. }));
}

#[tokio::test]
async fn unaffordable_appliance_is_unsatisfied_until_top_up() {
    let grid = Grid::builder().balance(5).hourly_cost(10).build();
    let set = grid.set(ApplianceSetKind::Workflow);

    let created = grid.create(set, DEDICATED_TYPE, "cfg", T0).await;
    assert_eq!(created.placement, PlacementOutcome::Unsatisfied);

    let fund = grid.manager.top_up(FUND, 20, T0 + 5).await.unwrap();
    assert_eq!(fund.balance, 25);
    assert_eq!(
        grid.appliance(created.appliance.id).state,
        ApplianceState::Satisfied
    );
}

#[tokio::test]
async fn destroying_an_appliance_set_destroys_its_appliances() {
    let grid = Grid::builder().build();
    let set = grid.set(ApplianceSetKind::Portal);
    grid.create(set, DEDICATED_TYPE, "a", T0).await;
    grid.create(set, SHARED_TYPE, "b", T0).await;

    let destroyed = grid
        .manager
        .destroy_appliance_set(set, T0 + 10)
        .await
        .unwrap();
    assert_eq!(destroyed.released_vms.len(), 2);
    assert!(grid.store().list::<Appliance>().unwrap().is_empty());
    assert!(grid.store().get::<ApplianceSet>(set).unwrap().is_none());
    assert!(grid.site.servers().is_empty());
}
