pub mod approllout;
pub mod assemble;
pub mod clock;
pub mod cluster;
pub mod dispatch;
pub mod events;
pub mod labels;
pub mod plan;

pub use approllout::{error_policy, reconcile, Context, ReconcileError};
