//! vmgrid-cloud — adapter contracts for the external collaborators of the
//! VMGrid control plane.
//!
//! - [`ComputeSiteClient`]: list/create/destroy/reboot servers, list images.
//! - [`MonitoringClient`]: register hosts and fetch load metrics.
//! - [`DnatClient`]: transport-level port forwarding for VMs.
//!
//! [`Clouds`] routes calls to the adapter of a compute site and wraps each
//! call in a timeout. The [`sim`] module provides in-memory drivers.

pub mod adapter;
pub mod clouds;
pub mod error;
pub mod sim;

pub use adapter::*;
pub use clouds::{Clouds, with_timeout};
pub use error::{CloudError, CloudResult};
