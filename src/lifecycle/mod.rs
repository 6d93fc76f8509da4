//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Drain (drain.rs):
//!     Operator or shutdown → draining = true
//!     → HTTP/1: `connection: close` on every response
//!     → HTTP/2: GOAWAY to downstream peers
//!     → upstream pools: no new streams on existing connections
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain → Wait for connections → Exit
//! ```
//!
//! # Design Decisions
//! - Drain is a watch channel so late subscribers still see the current state
//! - Shutdown has timeout: forced exit after deadline

pub mod drain;
pub mod shutdown;

pub use drain::DrainCoordinator;
pub use shutdown::Shutdown;
