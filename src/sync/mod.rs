//! Sync coordinator: merges per-chain checkpoint streams into one globally
//! ordered stream and tracks the safe-to-process and finality frontiers.

pub mod coordinator;

pub use coordinator::SyncCoordinator;
