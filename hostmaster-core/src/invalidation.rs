//! Per-transaction invalidation accumulator.
//!
//! Business handlers call [`InvalidationSet::add_table`] after each
//! successful mutation. Once the surrounding transaction commits the set is
//! handed, by value, to the session registry for fanout; a rolled back
//! transaction simply drops it.

use std::collections::{BTreeMap, BTreeSet};

use crate::tables::TableId;
use crate::types::{AccountId, HostId, PartySet};

/// Tables touched by one transaction, with the affected accounts and hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationSet {
    accounts: BTreeMap<TableId, PartySet<AccountId>>,
    hosts: BTreeMap<TableId, PartySet<HostId>>,
}

impl InvalidationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `table` changed for `accounts` and `hosts`.
    ///
    /// Blank identifiers are logged and skipped. When `recurse` is set every
    /// table in [`TableId::cascades`] receives the same parties, transitively.
    pub fn add_table(
        &mut self,
        table: TableId,
        accounts: &PartySet<AccountId>,
        hosts: &PartySet<HostId>,
        recurse: bool,
    ) {
        let accounts = sanitize(table, accounts, AccountId::validate);
        let hosts = sanitize(table, hosts, HostId::validate);
        self.merge_recursive(table, &accounts, &hosts, recurse);
    }

    /// Shorthand for an invalidation scoped by accounts only; hosts are `All`.
    pub fn add_accounts<I>(&mut self, table: TableId, accounts: I, recurse: bool)
    where
        I: IntoIterator<Item = AccountId>,
    {
        let accounts: PartySet<AccountId> = accounts.into_iter().collect();
        self.add_table(table, &accounts, &PartySet::All, recurse);
    }

    /// Shorthand for an invalidation scoped by hosts only; accounts are `All`.
    pub fn add_hosts<I>(&mut self, table: TableId, hosts: I, recurse: bool)
    where
        I: IntoIterator<Item = HostId>,
    {
        let hosts: PartySet<HostId> = hosts.into_iter().collect();
        self.add_table(table, &PartySet::All, &hosts, recurse);
    }

    /// Invalidate `table` for every account and every host.
    pub fn add_all(&mut self, table: TableId, recurse: bool) {
        self.merge_recursive(table, &PartySet::All, &PartySet::All, recurse);
    }

    fn merge_recursive(
        &mut self,
        table: TableId,
        accounts: &PartySet<AccountId>,
        hosts: &PartySet<HostId>,
        recurse: bool,
    ) {
        self.accounts
            .entry(table)
            .and_modify(|current| current.merge(accounts))
            .or_insert_with(|| accounts.clone());
        self.hosts
            .entry(table)
            .and_modify(|current| current.merge(hosts))
            .or_insert_with(|| hosts.clone());

        if recurse {
            for dependent in table.cascades() {
                self.merge_recursive(*dependent, accounts, hosts, true);
            }
        }
    }

    /// `None` if the table was never touched.
    pub fn affected_accounts(&self, table: TableId) -> Option<&PartySet<AccountId>> {
        self.accounts.get(&table)
    }

    /// `None` if the table was never touched.
    pub fn affected_hosts(&self, table: TableId) -> Option<&PartySet<HostId>> {
        self.hosts.get(&table)
    }

    pub fn is_invalid(&self, table: TableId) -> bool {
        self.accounts.contains_key(&table) || self.hosts.contains_key(&table)
    }

    /// Every touched table, sorted and de-duplicated.
    pub fn tables(&self) -> Vec<TableId> {
        self.accounts
            .keys()
            .chain(self.hosts.keys())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables().len()
    }
}

fn sanitize<T, F>(table: TableId, parties: &PartySet<T>, validate: F) -> PartySet<T>
where
    T: Ord + Clone + std::fmt::Debug,
    F: Fn(&T) -> Result<(), crate::CoreError>,
{
    match parties {
        PartySet::All => PartySet::All,
        PartySet::Only(set) => PartySet::Only(
            set.iter()
                .filter(|party| match validate(party) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(%table, party = ?party, error = %err, "skipping malformed invalidation party");
                        false
                    }
                })
                .cloned()
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts(names: &[&str]) -> PartySet<AccountId> {
        names.iter().map(|n| AccountId::from(*n)).collect()
    }

    fn hosts(names: &[&str]) -> PartySet<HostId> {
        names.iter().map(|n| HostId::from(*n)).collect()
    }

    #[test]
    fn untouched_table_reports_none() {
        let set = InvalidationSet::new();
        assert!(set.affected_accounts(TableId::Accounts).is_none());
        assert!(set.affected_hosts(TableId::Accounts).is_none());
        assert!(!set.is_invalid(TableId::Accounts));
        assert!(set.is_empty());
    }

    #[test]
    fn empty_explicit_set_is_touched() {
        let mut set = InvalidationSet::new();
        set.add_table(TableId::DnsZones, &PartySet::empty(), &PartySet::empty(), false);
        assert!(set.is_invalid(TableId::DnsZones));
        assert_eq!(set.affected_accounts(TableId::DnsZones), Some(&PartySet::empty()));
    }

    #[test]
    fn blank_parties_are_skipped_without_dropping_others() {
        let mut set = InvalidationSet::new();
        set.add_table(
            TableId::EmailDomains,
            &accounts(&["acme", " "]),
            &hosts(&["", "mail1"]),
            false,
        );
        assert_eq!(set.affected_accounts(TableId::EmailDomains), Some(&accounts(&["acme"])));
        assert_eq!(set.affected_hosts(TableId::EmailDomains), Some(&hosts(&["mail1"])));
    }

    #[test]
    fn non_recursive_add_leaves_dependents_alone() {
        let mut set = InvalidationSet::new();
        set.add_table(TableId::DnsZones, &accounts(&["acme"]), &hosts(&["ns1"]), false);
        assert!(!set.is_invalid(TableId::DnsRecords));
    }

    #[test]
    fn tables_are_sorted_and_unique() {
        let mut set = InvalidationSet::new();
        set.add_hosts(TableId::NetBinds, [HostId::from("h1")], false);
        set.add_accounts(TableId::Accounts, [AccountId::from("acme")], false);
        set.add_all(TableId::NetBinds, false);
        assert_eq!(set.tables(), vec![TableId::Accounts, TableId::NetBinds]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn shorthand_leaves_other_dimension_all() {
        let mut set = InvalidationSet::new();
        set.add_accounts(TableId::Tickets, [AccountId::from("acme")], false);
        assert_eq!(set.affected_hosts(TableId::Tickets), Some(&PartySet::All));
    }
}
