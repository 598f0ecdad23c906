pub mod backend;
pub mod config_store;
pub mod connection;
pub mod error;
pub mod registry;

pub use backend::{
    BackendConnector, BackendError, ConfigBackend, ConfigChange, ConfigKey, ConfigListener,
    InMemoryBackend, InMemoryConnector, Instance, InstanceQuery, InstanceRegistration,
    NacosConnector, NacosHttpBackend, NamingBackend,
};
pub use config_store::{ConfigCoordinator, ConfigEvent, ConfigEventKind, ConfigWatchStore};
pub use connection::{
    ConnectionManager, ConnectionManagerConfig, ConnectivityState, Dialer, ManagedConnection,
    ServiceEndpoint, TonicDialer,
};
pub use error::RegistryError;
pub use registry::{RegistryBootstrap, RegistryClient, RegistryManager};
