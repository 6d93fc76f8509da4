//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream attempt fails or returns a retryable status:
//!     → retries.rs (policy: is this failure a trigger? budget left?
//!                   state: was anything forwarded? is the body replayable?)
//!     → backoff.rs (delay before the next attempt)
//!     → router picks a new host and replays the buffered request
//! ```
//!
//! # Design Decisions
//! - Retries only inside the window before response headers go downstream
//! - Attempt budget always comes from config or request headers, never open-ended
//! - The replay buffer is bounded; overflowing it turns retries off for that request
//! - Jittered backoff prevents thundering herd

pub mod backoff;
pub mod retries;

pub use backoff::Backoff;
pub use retries::{AttemptFailure, RetryPolicy, RetryState};
