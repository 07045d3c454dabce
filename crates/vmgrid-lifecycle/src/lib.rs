//! vmgrid-lifecycle — the appliance lifecycle orchestrator.
//!
//! [`ApplianceManager`] is the single entry point callers use: it creates
//! and destroys appliance sets, appliances and port mapping templates,
//! runs billing ticks, and refreshes VMs and templates from providers.
//! Each operation commits its state change first and then drives the
//! optimizer, the billing engine and the port mapping manager in a fixed
//! order.

pub mod error;
pub mod manager;
pub mod port_mappings;
pub mod refresh;

pub use error::{LifecycleError, LifecycleResult};
pub use manager::{ApplianceManager, CreatedAppliance, DestroyedAppliance, DestroyedVm, NewAppliance, TickReport};
pub use port_mappings::NewPortMappingTemplate;
pub use refresh::{TemplateRefreshReport, VmRefreshReport};
