pub mod audit;
pub mod context;
pub mod ctia;
pub mod framework;
pub mod gdpr;
pub mod hipaa;
pub mod soc2;
pub mod tcpa;

pub use audit::*;
pub use context::*;
pub use ctia::*;
pub use framework::*;
pub use gdpr::*;
pub use hipaa::*;
pub use soc2::*;
pub use tcpa::*;
