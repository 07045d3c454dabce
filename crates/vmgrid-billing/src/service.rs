//! Billing engine: affordability checks and prorated charging.

use tracing::{debug, info, warn};
use vmgrid_core::config::BillingConfig;
use vmgrid_core::time::SECS_PER_HOUR;
use vmgrid_state::*;

use crate::error::{BillingError, BillingResult};
use crate::ledger::debit_in;

/// Share of `hourly_cost` owed for `elapsed_secs` when `sharers`
/// deployments split the VM, rounded half up.
pub fn prorate(hourly_cost: Amount, elapsed_secs: u64, sharers: usize) -> Amount {
    let denominator = i128::from(SECS_PER_HOUR) * sharers.max(1) as i128;
    let numerator = i128::from(hourly_cost) * i128::from(elapsed_secs);
    let rounded = (2 * numerator + denominator).div_euclid(2 * denominator);
    Amount::try_from(rounded).unwrap_or(Amount::MAX)
}

/// Outcome of billing one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentCharge {
    /// The fund paid `amount`; `prepaid_until` moved to now.
    Billed { amount: Amount },
    /// Nothing owed yet.
    NotDue,
    /// The fund could not cover the charge; the deployment is now expired.
    Expired,
    /// The deployment was expired before this run.
    AlreadyExpired,
}

/// Charges applied to one appliance's deployments.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplianceBilling {
    pub appliance_id: ApplianceId,
    pub charges: Vec<(DeploymentId, DeploymentCharge)>,
}

impl ApplianceBilling {
    pub fn total(&self) -> Amount {
        self.charges
            .iter()
            .map(|(_, charge)| match charge {
                DeploymentCharge::Billed { amount } => *amount,
                _ => 0,
            })
            .sum()
    }

    /// Deployments that expired in this run.
    pub fn newly_expired(&self) -> Vec<DeploymentId> {
        self.charges
            .iter()
            .filter(|(_, charge)| *charge == DeploymentCharge::Expired)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Result of one [`BillingService::bill_all`] cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillingReport {
    pub appliances: Vec<ApplianceBilling>,
    /// Appliances whose billing failed and was skipped this cycle.
    pub failed: Vec<ApplianceId>,
}

impl BillingReport {
    pub fn total(&self) -> Amount {
        self.appliances.iter().map(ApplianceBilling::total).sum()
    }

    pub fn newly_expired(&self) -> Vec<DeploymentId> {
        self.appliances
            .iter()
            .flat_map(ApplianceBilling::newly_expired)
            .collect()
    }
}

/// Hourly price of `vm` for the OS family of `appliance`'s type.
pub fn hourly_cost_in(
    txn: &impl Snapshot,
    vm: &VirtualMachine,
    appliance: &Appliance,
) -> BillingResult<Amount> {
    let appliance_type = txn.require::<ApplianceType>(appliance.appliance_type_id)?;
    let no_price = || BillingError::NoPrice {
        vm: vm.id,
        os_family: appliance_type.os_family.clone(),
    };
    let flavor_id = vm.flavor_id.ok_or_else(no_price)?;
    let flavor = txn.require::<VmFlavor>(flavor_id)?;
    flavor
        .hourly_cost(&appliance_type.os_family)
        .ok_or_else(no_price)
}

/// Whether the appliance's fund can pay one hour of `flavor` alone.
pub fn can_afford_flavor_in(
    txn: &impl Snapshot,
    appliance: &Appliance,
    flavor: &VmFlavor,
) -> BillingResult<bool> {
    let fund = txn.require::<Fund>(appliance.fund_id)?;
    if !fund.is_bound_to(flavor.site_id) {
        return Ok(false);
    }
    let appliance_type = txn.require::<ApplianceType>(appliance.appliance_type_id)?;
    let Some(cost) = flavor.hourly_cost(&appliance_type.os_family) else {
        return Ok(false);
    };
    Ok(fund.can_cover(prorate(cost, SECS_PER_HOUR, 1)))
}

/// Deployments on a VM that still pay their share. Expired ones wait to
/// be dropped and no longer divide the cost.
fn paying_sharers_in(txn: &impl Snapshot, vm_id: VmId) -> BillingResult<Vec<Deployment>> {
    Ok(txn
        .deployments_on_vm(vm_id)?
        .into_iter()
        .filter(|d| d.billing_state == BillingState::Prepaid)
        .collect())
}

/// Whether the appliance's fund can pay its share of one hour on `vm`,
/// counting the appliance as a sharer if it is not deployed there yet.
pub fn can_afford_vm_in(
    txn: &impl Snapshot,
    appliance: &Appliance,
    vm: &VirtualMachine,
) -> BillingResult<bool> {
    let fund = txn.require::<Fund>(appliance.fund_id)?;
    if !fund.is_bound_to(vm.site_id) {
        return Ok(false);
    }
    let cost = match hourly_cost_in(txn, vm, appliance) {
        Ok(cost) => cost,
        Err(BillingError::NoPrice { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    let others = paying_sharers_in(txn, vm.id)?
        .iter()
        .filter(|d| d.appliance_id != appliance.id)
        .count();
    let sharers = others + 1;
    Ok(fund.can_cover(prorate(cost, SECS_PER_HOUR, sharers)))
}

/// The billing engine.
#[derive(Clone)]
pub struct BillingService {
    store: StateStore,
    config: BillingConfig,
}

impl BillingService {
    pub fn new(store: StateStore, config: BillingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn can_afford_flavor(&self, appliance: &Appliance, flavor: &VmFlavor) -> BillingResult<bool> {
        self.store
            .read(|txn| can_afford_flavor_in(txn, appliance, flavor))
    }

    pub fn can_afford_vm(&self, appliance: &Appliance, vm: &VirtualMachine) -> BillingResult<bool> {
        self.store.read(|txn| can_afford_vm_in(txn, appliance, vm))
    }

    /// Bill every deployment of an appliance up to `now`.
    ///
    /// Routine runs only charge deployments whose unbilled interval has
    /// reached one billing period. A final run charges whatever remains.
    pub fn bill_appliance(
        &self,
        appliance_id: ApplianceId,
        now: u64,
        reason: &str,
        is_final: bool,
    ) -> BillingResult<ApplianceBilling> {
        let period = self.config.period_secs;
        let billing = self.store.write(|txn| {
            bill_appliance_in(txn, appliance_id, now, reason, is_final, period)
        })?;
        let total = billing.total();
        if total > 0 {
            debug!(appliance = appliance_id, total, reason, "appliance billed");
        }
        for deployment in billing.newly_expired() {
            warn!(
                appliance = appliance_id,
                deployment, "fund exhausted, deployment expired"
            );
        }
        Ok(billing)
    }

    /// Run one routine billing cycle over every appliance with a prepaid
    /// deployment. Safe to repeat: a second run with the same `now`
    /// charges nothing.
    pub fn bill_all(&self, now: u64) -> BillingResult<BillingReport> {
        let due: Vec<ApplianceId> = self.store.read(|txn| {
            let mut ids: Vec<ApplianceId> = txn
                .list_where(|d: &Deployment| d.billing_state == BillingState::Prepaid)?
                .into_iter()
                .map(|d| d.appliance_id)
                .collect();
            ids.sort_unstable();
            ids.dedup();
            Ok::<_, StateError>(ids)
        })?;

        let mut report = BillingReport::default();
        for appliance_id in due {
            match self.bill_appliance(appliance_id, now, "routine", false) {
                Ok(billing) => report.appliances.push(billing),
                Err(e) => {
                    warn!(appliance = appliance_id, error = %e, "billing skipped");
                    report.failed.push(appliance_id);
                }
            }
        }
        if report.total() > 0 || !report.newly_expired().is_empty() {
            info!(
                appliances = report.appliances.len(),
                total = report.total(),
                expired = report.newly_expired().len(),
                "billing cycle finished"
            );
        }
        Ok(report)
    }
}

/// Bill one appliance inside `txn`. Fund, deployments, the appliance's
/// running total and the billing log change together or not at all.
pub fn bill_appliance_in(
    txn: &WriteTxn,
    appliance_id: ApplianceId,
    now: u64,
    reason: &str,
    is_final: bool,
    period_secs: u64,
) -> BillingResult<ApplianceBilling> {
    let mut appliance = txn.require::<Appliance>(appliance_id)?;
    let mut charges = Vec::new();

    for mut deployment in txn.deployments_of_appliance(appliance_id)? {
        if deployment.billing_state == BillingState::Expired {
            charges.push((deployment.id, DeploymentCharge::AlreadyExpired));
            continue;
        }
        let elapsed = now.saturating_sub(deployment.prepaid_until);
        if elapsed == 0 || (!is_final && elapsed < period_secs) {
            charges.push((deployment.id, DeploymentCharge::NotDue));
            continue;
        }

        let vm = txn.require::<VirtualMachine>(deployment.vm_id)?;
        let cost = hourly_cost_in(txn, &vm, &appliance)?;
        let sharers = paying_sharers_in(txn, vm.id)?.len();
        let amount = prorate(cost, elapsed, sharers);

        let charge = match debit_in(txn, appliance.fund_id, amount)? {
            Some(_) => {
                deployment.prepaid_until = now;
                appliance.amount_billed = appliance.amount_billed.saturating_add(amount);
                if amount > 0 {
                    txn.insert_with(|id| BillingLog {
                        id,
                        fund_id: appliance.fund_id,
                        appliance_id,
                        deployment_id: deployment.id,
                        amount,
                        timestamp: now,
                        reason: reason.to_string(),
                    })?;
                }
                DeploymentCharge::Billed { amount }
            }
            None => DeploymentCharge::Expired,
        };
        deployment.billing_state = deployment
            .billing_state
            .after_charge(charge != DeploymentCharge::Expired);
        txn.put(&deployment)?;
        charges.push((deployment.id, charge));
    }

    txn.put(&appliance)?;
    Ok(ApplianceBilling {
        appliance_id,
        charges,
    })
}
