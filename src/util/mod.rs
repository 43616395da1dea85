pub mod backoff;
pub mod gate;

pub use backoff::{Backoff, Deadline};
pub use gate::{ClosedGate, ReleaseGate};
