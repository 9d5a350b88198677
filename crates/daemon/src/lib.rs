// Service modules (daemon functionality)
pub mod acl;
pub mod admin;
pub mod app_config;
pub mod broker;
pub mod database;
pub mod http_server;
pub mod process;
pub mod service_config;
pub mod signer;
pub mod state;

// Re-exports for consumers
pub use process::{spawn_service, start_service, ShutdownHandle};
pub use service_config::Config as ServiceConfig;
pub use state::State as ServiceState;
