//! Fund ledger: single-value balances with an overdraft floor.

use std::collections::BTreeSet;

use tracing::{debug, info};
use vmgrid_state::{Amount, Fund, FundId, SiteId, Snapshot, StateStore, WriteTxn};

use crate::error::{BillingError, BillingResult};

/// Debit `amount` from a fund inside `txn`.
///
/// Returns the updated fund, or `None` when the debit would take the
/// balance below `-overdraft_limit`. A refused debit leaves the fund
/// untouched.
pub fn debit_in(txn: &WriteTxn, fund_id: FundId, amount: Amount) -> BillingResult<Option<Fund>> {
    if amount < 0 {
        return Err(BillingError::InvalidAmount(amount));
    }
    let mut fund = txn.require::<Fund>(fund_id)?;
    if !fund.can_cover(amount) {
        debug!(fund = fund_id, amount, balance = fund.balance, "debit refused");
        return Ok(None);
    }
    fund.balance -= amount;
    txn.put(&fund)?;
    Ok(Some(fund))
}

pub fn credit_in(txn: &WriteTxn, fund_id: FundId, amount: Amount) -> BillingResult<Fund> {
    if amount <= 0 {
        return Err(BillingError::InvalidAmount(amount));
    }
    let mut fund = txn.require::<Fund>(fund_id)?;
    fund.balance = fund.balance.saturating_add(amount);
    txn.put(&fund)?;
    Ok(fund)
}

/// Request to open a fund.
#[derive(Debug, Clone)]
pub struct NewFund {
    pub name: String,
    pub balance: Amount,
    pub overdraft_limit: Amount,
    pub site_ids: BTreeSet<SiteId>,
}

/// Store-backed access to fund balances.
#[derive(Clone)]
pub struct FundLedger {
    store: StateStore,
}

impl FundLedger {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Open a fund. The overdraft limit is a distance below zero and
    /// cannot be negative.
    pub fn create_fund(&self, new: NewFund) -> BillingResult<Fund> {
        if new.overdraft_limit < 0 {
            return Err(BillingError::NegativeOverdraft(new.overdraft_limit));
        }
        let fund = self.store.insert_with(|id| Fund {
            id,
            name: new.name,
            balance: new.balance,
            overdraft_limit: new.overdraft_limit,
            site_ids: new.site_ids,
        })?;
        info!(fund = fund.id, balance = fund.balance, overdraft = fund.overdraft_limit, "fund created");
        Ok(fund)
    }

    pub fn balance(&self, fund_id: FundId) -> BillingResult<Amount> {
        Ok(self.store.require::<Fund>(fund_id)?.balance)
    }

    pub fn debit(&self, fund_id: FundId, amount: Amount) -> BillingResult<Option<Fund>> {
        self.store.write(|txn| debit_in(txn, fund_id, amount))
    }

    /// Add money to a fund.
    pub fn top_up(&self, fund_id: FundId, amount: Amount) -> BillingResult<Fund> {
        let fund = self.store.write(|txn| credit_in(txn, fund_id, amount))?;
        info!(fund = fund_id, amount, balance = fund.balance, "fund topped up");
        Ok(fund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(balance: Amount, overdraft_limit: Amount) -> FundLedger {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&Fund {
                id: 1,
                name: "grant".to_string(),
                balance,
                overdraft_limit,
                site_ids: BTreeSet::new(),
            })
            .unwrap();
        FundLedger::new(store)
    }

    #[test]
    fn debit_within_balance() {
        let ledger = ledger_with(100, 0);
        let fund = ledger.debit(1, 10).unwrap().unwrap();
        assert_eq!(fund.balance, 90);
        assert_eq!(ledger.balance(1).unwrap(), 90);
    }

    #[test]
    fn debit_into_overdraft_stops_at_floor() {
        let ledger = ledger_with(5, 10);
        assert!(ledger.debit(1, 15).unwrap().is_some());
        assert_eq!(ledger.balance(1).unwrap(), -10);
        assert!(ledger.debit(1, 1).unwrap().is_none());
        assert_eq!(ledger.balance(1).unwrap(), -10);
    }

    #[test]
    fn refused_debit_leaves_balance() {
        let ledger = ledger_with(5, 0);
        assert!(ledger.debit(1, 10).unwrap().is_none());
        assert_eq!(ledger.balance(1).unwrap(), 5);
    }

    #[test]
    fn top_up_credits() {
        let ledger = ledger_with(-3, 10);
        assert_eq!(ledger.top_up(1, 20).unwrap().balance, 17);
        assert!(matches!(
            ledger.top_up(1, 0),
            Err(BillingError::InvalidAmount(0))
        ));
    }

    #[test]
    fn negative_overdraft_is_rejected_at_creation() {
        let ledger = FundLedger::new(StateStore::open_in_memory().unwrap());
        let new = |overdraft_limit| NewFund {
            name: "grant".to_string(),
            balance: 10,
            overdraft_limit,
            site_ids: BTreeSet::from([1]),
        };

        assert!(matches!(
            ledger.create_fund(new(-5)),
            Err(BillingError::NegativeOverdraft(-5))
        ));
        let fund = ledger.create_fund(new(5)).unwrap();
        assert!(fund.is_bound_to(1));
        assert!(ledger.debit(fund.id, 15).unwrap().is_some());
        assert_eq!(ledger.balance(fund.id).unwrap(), -5);
    }

    #[test]
    fn unknown_fund_is_an_error() {
        let ledger = ledger_with(0, 0);
        assert!(matches!(ledger.debit(9, 1), Err(BillingError::State(_))));
    }
}
