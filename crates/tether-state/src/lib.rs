pub mod audit;
pub mod checksum;
pub mod store;

pub use audit::*;
pub use checksum::*;
pub use store::*;
