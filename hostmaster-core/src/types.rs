//! Party identifiers and the ALL-dominant party set.
//!
//! Accounts and hosts are the two dimensions an invalidation is scoped by.
//! Both are plain string newtypes; a blank identifier is considered
//! malformed and is rejected by [`AccountId::validate`] / [`HostId::validate`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed account (tenant) name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    /// Returns an error when the identifier is empty or only whitespace.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.0.trim().is_empty() {
            return Err(CoreError::BlankIdentifier { kind: "account" });
        }
        Ok(())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed managed host name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl HostId {
    /// Returns an error when the identifier is empty or only whitespace.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.0.trim().is_empty() {
            return Err(CoreError::BlankIdentifier { kind: "host" });
        }
        Ok(())
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// PartySet
// ---------------------------------------------------------------------------

/// Either every party or an explicit set of them.
///
/// `All` dominates: merging anything into `All` leaves it `All`, and merging
/// `All` into an explicit set replaces it. An empty `Only` set means
/// "touched, but no specific party recorded", which callers must not confuse
/// with an untouched table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartySet<T: Ord> {
    All,
    Only(BTreeSet<T>),
}

impl<T: Ord> PartySet<T> {
    pub fn empty() -> Self {
        PartySet::Only(BTreeSet::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, PartySet::All)
    }

    /// The explicit members, or `None` for `All`.
    pub fn explicit(&self) -> Option<&BTreeSet<T>> {
        match self {
            PartySet::All => None,
            PartySet::Only(set) => Some(set),
        }
    }

    /// True when `party` is covered, either explicitly or through `All`.
    pub fn covers(&self, party: &T) -> bool {
        match self {
            PartySet::All => true,
            PartySet::Only(set) => set.contains(party),
        }
    }
}

impl<T: Ord + Clone> PartySet<T> {
    /// Merge `other` into `self` under ALL dominance.
    pub fn merge(&mut self, other: &PartySet<T>) {
        match (&mut *self, other) {
            (PartySet::All, _) => {}
            (_, PartySet::All) => *self = PartySet::All,
            (PartySet::Only(mine), PartySet::Only(theirs)) => {
                mine.extend(theirs.iter().cloned());
            }
        }
    }
}

impl<T: Ord> Default for PartySet<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Ord> FromIterator<T> for PartySet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        PartySet::Only(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(AccountId::from("acme").to_string(), "acme");
        assert_eq!(HostId::from("web1.example.net").to_string(), "web1.example.net");
    }

    #[test]
    fn blank_identifiers_are_rejected() {
        assert!(AccountId::from("  ").validate().is_err());
        assert!(HostId::from("").validate().is_err());
        assert!(AccountId::from("acme").validate().is_ok());
    }

    #[test]
    fn merge_all_dominates_both_ways() {
        let mut explicit: PartySet<AccountId> = [AccountId::from("a")].into_iter().collect();
        explicit.merge(&PartySet::All);
        assert!(explicit.is_all());

        let mut all: PartySet<AccountId> = PartySet::All;
        all.merge(&[AccountId::from("b")].into_iter().collect());
        assert!(all.is_all());
    }

    #[test]
    fn covers_respects_all() {
        let set: PartySet<HostId> = [HostId::from("h1")].into_iter().collect();
        assert!(set.covers(&HostId::from("h1")));
        assert!(!set.covers(&HostId::from("h2")));
        assert!(PartySet::<HostId>::All.covers(&HostId::from("h2")));
    }

    #[test]
    fn serde_shape_is_tagged() {
        let json = serde_json::to_string(&PartySet::<HostId>::All).expect("serialize");
        assert_eq!(json, "\"all\"");
        let only: PartySet<HostId> = [HostId::from("h1")].into_iter().collect();
        let json = serde_json::to_string(&only).expect("serialize");
        assert_eq!(json, r#"{"only":["h1"]}"#);
    }
}
