//! Explicit state machine for the member verification lifecycle.
//!
//! This module implements a pure functional state machine for gating group
//! members. The design separates:
//! - **State**: What the system knows about a member (`MemberStatus`)
//! - **Events**: What happened (`Event`)
//! - **Effects**: What to do (`Effect`)
//! - **Transition**: Pure function `(Status, Event, Policy) -> (Status, Vec<Effect>)`
//!
//! The interpreter executes effects against the messenger, the identity
//! provider and the repository, and returns result events. The engine drives
//! the loop and persists the final status.

pub mod effect;
pub mod engine;
pub mod event;
pub mod interpreter;
pub mod repository;
pub mod state;
pub mod transition;

pub use effect::*;
pub use engine::{Engine, EngineError, Outcome};
pub use event::*;
pub use state::*;
pub use transition::*;
