//! Axis — the job and message substrate.
//!
//! - registry:    named component handler table
//! - router:      envelopes, middleware, correlated dispatch, broadcasts
//! - audit:       hash-chained audit trail
//! - queue:       durable job queue and state machine
//! - idempotency: per-(job, step) execution log
//! - worker:      claim-dispatch worker pool
//! - dag:         layered plan executor
//! - condition:   condition operators and path walker
//! - refs:        $ref:step parameter resolution
//! - sentinel:    rule-based plan validator
//! - approval:    nonce-gated approval coordinator
//! - rules:       standing auto-decision rules
//! - breaker:     per-gear circuit breaker
//! - gauge:       resource backpressure gauge
//! - pipeline:    per-job phase driver
//! - lifecycle:   ordered startup and shutdown

pub mod approval;
pub mod audit;
pub mod breaker;
pub mod condition;
pub mod dag;
pub mod gauge;
pub mod idempotency;
pub mod lifecycle;
pub mod pipeline;
pub mod queue;
pub mod refs;
pub mod registry;
pub mod router;
pub mod rules;
pub mod sentinel;
pub mod worker;
