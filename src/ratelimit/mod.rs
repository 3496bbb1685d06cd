//! Quota windows, abuse escalation, and the admission decision.

mod abuse;
mod guard;
mod locks;
mod window;

pub use abuse::{AbuseTracker, BlockState, ViolationOutcome};
pub use guard::{AdmissionGuard, AdmissionVerdict, Rejection, UsageSnapshot};
pub use locks::{IdentityGuard, IdentityLocks};
pub use window::{WindowCounter, WindowKey, WindowKind, WindowOutcome};
