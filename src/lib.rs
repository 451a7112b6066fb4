//! Meridian — a local-first agentic runtime.
//!
//! Turns a single user's natural-language request into a durable,
//! validated, user-approved, auditable workflow: jobs move through a
//! restricted state machine, a planner proposes an execution plan, an
//! information-barriered validator judges it, an approval coordinator
//! gates risky plans behind a single-use nonce, and a layered plan
//! executor runs the steps with idempotency and circuit protection.
//!
//! The planner ("scout"), the memory collaborator ("journal"), the gear
//! runtime, and the user-facing transport are external: they attach via
//! the component registry and the [`axis::pipeline::StepRunner`] seam.

pub mod axis;
pub mod config;
pub mod crypto;
pub mod heartbeat;
pub mod ids;
pub mod logging;
pub mod store;
pub mod types;
