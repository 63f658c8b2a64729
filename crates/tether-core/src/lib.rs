pub mod approvals;
pub mod cancellation;
pub mod catalog;
pub mod collaborators;
pub mod config;
pub mod event_bus;
pub mod orchestrator;
pub mod polling;
pub mod router;
pub mod runtime;
pub mod steps;
pub mod webhook_bridge;

pub use approvals::*;
pub use cancellation::*;
pub use catalog::*;
pub use collaborators::*;
pub use config::*;
pub use event_bus::*;
pub use orchestrator::*;
pub use polling::*;
pub use router::*;
pub use runtime::*;
pub use steps::*;
pub use webhook_bridge::*;
