//! vmgrid-placement — decides where appliances run.
//!
//! For a new appliance the optimizer either reuses a VM already hosting
//! the same configuration (shareable and scalable appliance types only),
//! or boots a new VM from the cheapest affordable template and flavor.
//! When nothing fits, the appliance becomes unsatisfied. VMs left without
//! deployments are released at the provider.
//!
//! # Components
//!
//! - **`candidates`** — reuse candidate choice, template/flavor selection
//! - **`optimizer`** — placement and release, provider calls included

pub mod candidates;
pub mod error;
pub mod optimizer;

pub use candidates::{TemplateChoice, effective_preferences_in, pick_reuse_in, select_template_in};
pub use error::{PlacementError, PlacementResult};
pub use optimizer::{Optimizer, PlacementOutcome};
