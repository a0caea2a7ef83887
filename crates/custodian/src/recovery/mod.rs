//! Delay-and-notify recovery: replace a lost app or hardware factor after a waiting period
//! during which the account owner is notified and can cancel.
//!
//! The server record is authoritative. The app keeps a local shadow ([`LocalRecovery`]) so a
//! recovery survives restarts, and reconciles it against the server before every step that
//! rotates keys or moves funds.

pub mod canceler;
pub mod completer;
pub mod dao;
pub mod error;
pub mod initiator;
pub mod model;
pub mod service;
pub mod state;
pub mod syncer;

pub use completer::RecoveryCompletion;
pub use dao::RecoveryDao;
pub use error::RecoveryError;
pub use model::{CompletionProgress, LocalRecovery, RecoveryConflictData};
pub use service::{DelayNotifyRecovery, RecoveryDeps};
pub use state::{reconcile, InvalidTransition, RecoveryEvent, RecoveryState, RecoveryStatus};
pub use syncer::{launch_recovery_sync, RecoverySyncer};
