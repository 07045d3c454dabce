//! vmgrid-billing — fund ledger and billing engine for VMGrid.
//!
//! A VM's hourly cost comes from its flavor and the OS family of the
//! appliance type deployed on it. Every deployment on a VM pays an even
//! share of that cost, split by the number of prepaid deployments on the
//! VM at the moment of billing. Charges are taken from the appliance's fund inside
//! one store transaction together with the deployment update and the
//! billing log entry.

pub mod error;
pub mod ledger;
pub mod service;

pub use error::{BillingError, BillingResult};
pub use ledger::{FundLedger, NewFund};
pub use service::{ApplianceBilling, BillingReport, BillingService, DeploymentCharge, prorate};
