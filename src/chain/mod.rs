//! Live chain tail tracking and historical backfilling.

pub mod backfill;
pub mod tail;

pub use tail::{ChainTail, TailUpdate};
