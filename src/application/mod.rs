//! Application layer: the services that orchestrate domain rules over the ports.
//!
//! `activation` gates trial grants behind the `fraud_rules` scorer and hands
//! accepted attempts to the `ledger`. `ingress` verifies and deduplicates
//! processor webhooks before `lifecycle` applies them. `query` serves the
//! read side, and `maintenance` runs the background sweeps. `engine` wires
//! them all over one storage backend.

pub mod activation;
pub mod engine;
pub mod fraud_rules;
pub mod ingress;
pub mod ledger;
pub mod lifecycle;
pub mod maintenance;
pub mod query;
