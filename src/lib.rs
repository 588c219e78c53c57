// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # cognit-kernel
//!
//! A production-rule cognitive kernel: an incremental matching network,
//! preference-based decisions with automatic sub-goaling, and chunking.
//!
//! ## Architecture
//!
//! - **Symbols** (`symbol`): per-agent interning of identifiers and constants
//! - **Rules** (`production`): rule definitions, compilation and condition ordering
//! - **Matching** (`rete`): shared alpha/beta network with negations and incremental add/remove
//! - **Working memory** (`memory`): reference-counted elements, preferences and instantiations
//! - **Decisions** (`decide`): preference semantics, impasses and the goal stack
//! - **Cycle** (`cycle`, `recmem`): INPUT → PROPOSE → DECISION → APPLY → OUTPUT
//! - **Learning** (`learning`): backtracing sub-goal results into chunks
//! - **Persistence** (`persist`): bincode snapshots and a redb snapshot store
//! - **Runtime** (`runtime`): threaded agents with a between-phase command queue
//!
//! ## Library usage
//!
//! ```no_run
//! use cognit_kernel::agent::Agent;
//! use cognit_kernel::config::AgentConfig;
//! use cognit_kernel::cycle::RunUnit;
//! use cognit_kernel::production::ast::{Cond, RuleDef};
//!
//! let mut agent = Agent::new(AgentConfig::default());
//! agent
//!     .add_rule(
//!         &RuleDef::new("greet")
//!             .when(Cond::state("<s>", "superstate", "nil"))
//!             .then_call("write", vec!["hello".into()]),
//!     )
//!     .unwrap();
//! let outcome = agent.run_for(1, RunUnit::Decision).unwrap();
//! println!("{}", outcome.stop.unwrap());
//! ```

pub mod agent;
pub mod config;
pub mod cycle;
pub mod decide;
pub mod error;
pub mod io;
pub mod learning;
pub mod memory;
pub mod persist;
pub mod production;
pub mod recmem;
pub mod rete;
pub mod rhs;
pub mod runtime;
pub mod symbol;
