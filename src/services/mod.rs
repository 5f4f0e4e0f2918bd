//! Background services that ride on the MQTT client
//!
//! Each service owns its own task and is started and stopped by the
//! application shell; none of them is required for the client itself to
//! function.

pub mod heartbeat;
pub mod stats;

pub use heartbeat::{Heartbeat, HeartbeatService};
pub use stats::{StatSource, StatsError, StatsTracker};
