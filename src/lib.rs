//! Trial activation gate and subscription lifecycle engine.
//!
//! Trials are granted behind a fraud score and tracked as bounded tokens;
//! paid subscriptions are mirrored from signed payment-processor webhooks.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod telemetry;
