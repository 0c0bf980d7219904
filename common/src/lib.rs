//! RateKeeper Common Types
//!
//! This crate contains shared types used across RateKeeper, including
//! identifiers, currency types, the clock abstraction and the persistence
//! error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
pub use time::*;
