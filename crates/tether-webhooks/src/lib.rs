pub mod generic;
pub mod replay;
pub mod router;
pub mod signature;
pub mod sinch;
pub mod stripe;
pub mod twilio;
pub mod verifier;

pub use generic::*;
pub use replay::*;
pub use router::*;
pub use signature::*;
pub use sinch::*;
pub use stripe::*;
pub use twilio::*;
pub use verifier::*;
