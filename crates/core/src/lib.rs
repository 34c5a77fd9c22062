pub mod change_event;
pub mod config;
pub mod correlation;
pub mod error;
pub mod result;
pub mod tracking;

pub use change_event::*;
pub use config::{Config, TimeoutSettings};
pub use correlation::CorrelationId;
pub use error::*;
pub use result::*;
pub use tracking::{TrackingManager, TrackingToken};
