//! Execution observation: live log streaming, identity-based merging and
//! the live-or-historical watch built on both.

pub mod reconcile;
pub mod stream;
pub mod watch;

pub use reconcile::LogReconciler;
pub use stream::{LogStream, StreamEvent};
pub use watch::{CompletionHook, DeploymentWatch, WatchEvent, WatchSlot};
