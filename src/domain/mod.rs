//! Domain types and the ports the application layer talks through.

pub mod clock;
pub mod fingerprint;
pub mod fraud;
pub mod money;
pub mod payment_event;
pub mod ports;
pub mod subscription;
pub mod trial;
