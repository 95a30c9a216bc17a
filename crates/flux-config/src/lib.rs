pub mod global;
pub mod loader;
pub mod protocol;

pub use global::{GlobalConfig, SystemConfig};
pub use loader::ConfigLoader;
pub use protocol::ProtocolConfig;
