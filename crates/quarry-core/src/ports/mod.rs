//! Ports: trait seams the engine is generic over.
//!
//! The persistence seam ([`crate::store::Backend`]) lives with the store
//! module; only the clock lives here.

mod clock;

pub use clock::{Clock, FixedClock, SystemClock};
