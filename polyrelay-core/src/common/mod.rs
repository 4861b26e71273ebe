//! Shared helpers used across the workspace.

pub mod duration_serde;
