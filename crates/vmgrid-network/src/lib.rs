//! vmgrid-network — keeps DNAT port mappings in line with VM addresses
//! and port mapping templates.
//!
//! Only templates with application protocol `none` produce DNAT
//! mappings; HTTP-routed templates belong to a reverse proxy layer.

pub mod error;
pub mod mappings;

pub use error::{NetworkError, NetworkResult};
pub use mappings::{PortMappingManager, affected_vms_in};
