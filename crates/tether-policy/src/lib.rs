pub mod conditions;
pub mod engine;
pub mod model;
pub mod quality;

pub use conditions::*;
pub use engine::*;
pub use model::*;
pub use quality::*;
