//! hostmaster core library — table identifiers, party sets, invalidation sets.
//!
//! - [`tables`]: [`TableId`] and its cascade map
//! - [`types`]: [`AccountId`], [`HostId`], [`PartySet`]
//! - [`invalidation`]: [`InvalidationSet`]
//! - [`error`]: [`CoreError`]

pub mod error;
pub mod invalidation;
pub mod tables;
pub mod types;

pub use error::CoreError;
pub use invalidation::InvalidationSet;
pub use tables::TableId;
pub use types::{AccountId, HostId, PartySet};
