//! Chat gateway core: HTTP surface and CLI.

pub mod cli;
pub mod router;
