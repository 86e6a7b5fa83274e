//! Recovery requests for ORGANIZATION surveys.
//!
//! A request moves through the closed state machine in [`state`]. The
//! [`RecoveryWorkflow`] performs every human-driven transition; only the
//! time-delay processor completes or fails a request.

pub mod request;
pub mod state;
pub mod workflow;

pub use request::{pending_kek_path, Claim, RecoveryRequest};
pub use state::{Approval, Completion, RecoveryState, TransitionError};
pub use workflow::{RecoveryError, RecoveryWorkflow};
