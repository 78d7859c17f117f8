//! Shared runtime utilities.

pub mod bootstrap;
pub mod retry;
