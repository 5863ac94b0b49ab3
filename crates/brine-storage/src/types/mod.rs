//! Record types for brine storage.

mod ids;
mod jobs;
mod keys;

pub use ids::*;
pub use jobs::*;
pub use keys::*;
