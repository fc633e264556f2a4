//! Relay HTTP surface.

mod router;
mod state;

pub use router::{build_router, report_body};
pub use state::{BeaconForwarder, ServeState};
