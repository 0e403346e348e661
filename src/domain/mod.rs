//! Domain layer - identity, naming and port definitions
//!
//! Nothing here talks to an appliance. The ports define what the transport
//! must provide; the codec and naming engine are pure functions.

pub mod identifier;
pub mod naming;
pub mod ports;

pub use identifier::*;
pub use naming::*;
pub use ports::*;
