//! Shared types used across VMGrid crates.

use serde::{Deserialize, Serialize};

/// Visibility of a compute site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    #[default]
    Public,
    Private,
}

/// Cloud technology backing a compute site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technology {
    #[default]
    Openstack,
    Amazon,
}

/// Cost expressed in indivisible billing units.
pub type Amount = i64;
