pub mod connection;
pub mod dialer;
pub mod manager;
pub mod monitor;
pub mod types;

pub use connection::*;
pub use dialer::*;
pub use manager::*;
pub use types::*;
