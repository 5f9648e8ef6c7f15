//! Network subsystem: uplink socket, send stage and liveness monitor

pub(crate) mod monitor;
pub(crate) mod sender;
pub(crate) mod socket;
