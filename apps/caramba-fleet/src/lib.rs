//! Fleet health monitoring, node selection and subscriber failover for
//! VPN edge servers managed through their panels.

pub mod alerts;
pub mod balancer;
pub mod cli;
pub mod config;
pub mod error;
pub mod failover;
pub mod health;
pub mod http;
pub mod monitor;
pub mod panel;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod sync;

pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use monitor::FleetMonitor;
pub use scheduler::Scheduler;
