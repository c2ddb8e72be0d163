//! Command implementations for the `chexray` CLI.

pub mod status;
pub mod train;
pub mod unlock;
