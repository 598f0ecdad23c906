//! Service registration, discovery, dynamic configuration and pooled gRPC
//! connections against a Nacos-compatible registry.

pub mod config;
pub mod services;

pub use config::{AppConfig, ConnectionConfig, RegistryConfig, RpcConfig};
pub use services::*;
