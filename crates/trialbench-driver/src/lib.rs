//! Trial orchestration for trialbench.
//!
//! [`TrialDriver::start_stop`] measures startup, footprint and shutdown over
//! several rounds; [`TrialDriver::load`] measures footprint growth under a
//! burst of requests. Both always clean up after themselves.

pub mod load;
pub mod trial;

pub use load::{HttpRequestSpec, LoadSummary};
pub use trial::{TrialContext, TrialDriver, TrialSummary, PORT_CLOSE_TIMEOUT};
