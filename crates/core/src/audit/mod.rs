//! Append-only audit trail of every operation transition.

mod events;
mod sqlite;
mod store;

pub use events::*;
pub use sqlite::*;
pub use store::*;
