//! Registry module
//!
//! This module contains service discovery and process wiring split into logical components:
//! - `types`: instance selection and self-registration helpers
//! - `client`: single-shot healthy-instance lookup facade
//! - `manager`: discovery + connections + config center entry point
//! - `bootstrap`: lazy, retry-on-failure construction of the manager

pub mod bootstrap;
pub mod client;
pub mod manager;
pub mod types;

// Re-export public types for easier access
pub use bootstrap::RegistryBootstrap;
pub use client::RegistryClient;
pub use manager::RegistryManager;
pub use types::{select_weighted, self_registration};
