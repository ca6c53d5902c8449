//! Schema table identifiers and the hand-authored cascade map.
//!
//! The cascade map encodes which derived tables must also be invalidated
//! when a base table changes. It is domain knowledge and is kept as explicit
//! data; the graph is a DAG (checked by the tests below).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

macro_rules! tables {
    ($($variant:ident => $name:literal,)+) => {
        /// A logical schema table of the master database.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "&'static str")]
        pub enum TableId {
            $($variant,)+
        }

        impl TableId {
            /// Every table, in declaration order.
            pub const ALL: &'static [TableId] = &[$(TableId::$variant,)+];

            /// Wire and display name (`snake_case`).
            pub fn name(self) -> &'static str {
                match self {
                    $(TableId::$variant => $name,)+
                }
            }
        }

        impl FromStr for TableId {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(TableId::$variant),)+
                    other => Err(CoreError::UnknownTable(other.to_string())),
                }
            }
        }
    };
}

tables! {
    // accounts and billing
    Accounts => "accounts",
    Profiles => "profiles",
    AccountHosts => "account_hosts",
    AccountBalances => "account_balances",
    Administrators => "administrators",
    AdministratorRoles => "administrator_roles",
    Usernames => "usernames",
    Packages => "packages",
    PackageDefinitions => "package_definitions",
    PackageDefinitionLimits => "package_definition_limits",
    Resources => "resources",
    MonthlyCharges => "monthly_charges",
    Transactions => "transactions",
    BankTransactions => "bank_transactions",
    CreditCards => "credit_cards",
    CreditCardProcessors => "credit_card_processors",
    CreditCardTransactions => "credit_card_transactions",
    DisableLog => "disable_log",
    // infrastructure
    ServerFarms => "server_farms",
    Servers => "servers",
    Hosts => "hosts",
    DaemonKeys => "daemon_keys",
    NetDevices => "net_devices",
    IpAddresses => "ip_addresses",
    NetBinds => "net_binds",
    FirewallZones => "firewall_zones",
    NetBindFirewallZones => "net_bind_firewall_zones",
    MasterHosts => "master_hosts",
    MasterServers => "master_servers",
    // dns
    DnsZones => "dns_zones",
    DnsRecords => "dns_records",
    DnsForbiddenZones => "dns_forbidden_zones",
    // mail
    EmailDomains => "email_domains",
    EmailAddresses => "email_addresses",
    EmailForwarding => "email_forwarding",
    EmailLists => "email_lists",
    EmailListAddresses => "email_list_addresses",
    EmailPipes => "email_pipes",
    EmailPipeAddresses => "email_pipe_addresses",
    EmailSmtpRelays => "email_smtp_relays",
    MajordomoServers => "majordomo_servers",
    // linux accounts
    LinuxAccounts => "linux_accounts",
    LinuxGroups => "linux_groups",
    LinuxGroupAccounts => "linux_group_accounts",
    LinuxHostAccounts => "linux_host_accounts",
    LinuxHostGroups => "linux_host_groups",
    LinuxAccAddresses => "linux_acc_addresses",
    FtpGuestUsers => "ftp_guest_users",
    PrivateFtpServers => "private_ftp_servers",
    CvsRepositories => "cvs_repositories",
    // mysql
    MysqlServers => "mysql_servers",
    MysqlDatabases => "mysql_databases",
    MysqlUsers => "mysql_users",
    MysqlServerUsers => "mysql_server_users",
    MysqlDbUsers => "mysql_db_users",
    // postgresql
    PostgresServers => "postgres_servers",
    PostgresDatabases => "postgres_databases",
    PostgresUsers => "postgres_users",
    PostgresServerUsers => "postgres_server_users",
    // web
    HttpdServers => "httpd_servers",
    HttpdSites => "httpd_sites",
    HttpdSiteBinds => "httpd_site_binds",
    HttpdSiteUrls => "httpd_site_urls",
    HttpdSiteAuthenticatedLocations => "httpd_site_authenticated_locations",
    HttpdSharedTomcats => "httpd_shared_tomcats",
    HttpdTomcatSites => "httpd_tomcat_sites",
    HttpdStaticSites => "httpd_static_sites",
    SslCertificates => "ssl_certificates",
    SslCertificateNames => "ssl_certificate_names",
    // backups
    BackupPartitions => "backup_partitions",
    BackupRetentions => "backup_retentions",
    FileReplications => "file_replications",
    FileReplicationSchedules => "file_replication_schedules",
    FileReplicationLogs => "file_replication_logs",
    // support and signup
    Tickets => "tickets",
    TicketActions => "ticket_actions",
    TicketAssignments => "ticket_assignments",
    SignupRequests => "signup_requests",
    SignupRequestOptions => "signup_request_options",
}

impl TableId {
    /// Tables derived from `self` that must be invalidated along with it.
    pub fn cascades(self) -> &'static [TableId] {
        use TableId::*;
        match self {
            Accounts => &[Profiles, AccountHosts, AccountBalances, Packages, Usernames],
            AccountHosts => &[MasterServers],
            Administrators => &[AdministratorRoles, MasterHosts, MasterServers],
            Usernames => &[Administrators, LinuxAccounts, MysqlUsers, PostgresUsers],
            Packages => &[MonthlyCharges, Resources],
            PackageDefinitions => &[PackageDefinitionLimits, Packages],
            Transactions => &[AccountBalances],
            BankTransactions => &[Transactions],
            CreditCards => &[CreditCardTransactions],
            CreditCardProcessors => &[CreditCards, CreditCardTransactions],
            DisableLog => &[
                Usernames,
                EmailLists,
                EmailPipes,
                EmailSmtpRelays,
                HttpdSites,
                HttpdSharedTomcats,
                CvsRepositories,
            ],
            ServerFarms => &[Servers],
            Servers => &[Hosts, NetDevices],
            Hosts => &[AccountHosts, MasterServers, NetDevices],
            NetDevices => &[IpAddresses],
            IpAddresses => &[NetBinds],
            NetBinds => &[
                NetBindFirewallZones,
                HttpdSiteBinds,
                MysqlServers,
                PostgresServers,
                PrivateFtpServers,
            ],
            FirewallZones => &[NetBindFirewallZones],
            DnsZones => &[DnsRecords],
            EmailDomains => &[EmailAddresses, MajordomoServers],
            EmailAddresses => &[
                EmailForwarding,
                EmailListAddresses,
                EmailPipeAddresses,
                LinuxAccAddresses,
            ],
            EmailLists => &[EmailListAddresses],
            EmailPipes => &[EmailPipeAddresses],
            MajordomoServers => &[EmailLists],
            LinuxAccounts => &[LinuxHostAccounts, LinuxGroupAccounts, FtpGuestUsers],
            LinuxGroups => &[LinuxHostGroups, LinuxGroupAccounts],
            LinuxHostAccounts => &[LinuxAccAddresses, CvsRepositories],
            LinuxHostGroups => &[HttpdSharedTomcats],
            MysqlServers => &[MysqlDatabases, MysqlServerUsers],
            MysqlDatabases => &[MysqlDbUsers],
            MysqlUsers => &[MysqlServerUsers],
            MysqlServerUsers => &[MysqlDbUsers],
            PostgresServers => &[PostgresDatabases, PostgresServerUsers],
            PostgresUsers => &[PostgresServerUsers],
            PostgresServerUsers => &[PostgresDatabases],
            HttpdServers => &[HttpdSiteBinds],
            HttpdSites => &[
                HttpdSiteBinds,
                HttpdSiteAuthenticatedLocations,
                HttpdStaticSites,
                HttpdTomcatSites,
            ],
            HttpdSiteBinds => &[HttpdSiteUrls],
            HttpdSharedTomcats => &[HttpdTomcatSites],
            SslCertificates => &[SslCertificateNames, HttpdSiteBinds],
            BackupPartitions => &[FileReplications],
            BackupRetentions => &[FileReplications],
            FileReplications => &[FileReplicationSchedules, FileReplicationLogs],
            Tickets => &[TicketActions, TicketAssignments],
            SignupRequests => &[SignupRequestOptions],
            _ => &[],
        }
    }

    /// Tables whose changes alter how the master reaches a daemon
    /// (address, port, host record or key).
    pub fn affects_daemon_connectors(self) -> bool {
        matches!(
            self,
            TableId::Hosts
                | TableId::Servers
                | TableId::IpAddresses
                | TableId::NetBinds
                | TableId::NetDevices
                | TableId::DaemonKeys
        )
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for TableId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TableId> for &'static str {
    fn from(table: TableId) -> Self {
        table.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn visit(table: TableId, path: &mut Vec<TableId>, done: &mut HashSet<TableId>) {
        if done.contains(&table) {
            return;
        }
        assert!(
            !path.contains(&table),
            "cascade cycle: {:?} -> {table}",
            path.iter().map(|t| t.name()).collect::<Vec<_>>()
        );
        path.push(table);
        for next in table.cascades() {
            visit(*next, path, done);
        }
        path.pop();
        done.insert(table);
    }

    #[test]
    fn cascade_graph_is_acyclic() {
        let mut done = HashSet::new();
        for table in TableId::ALL {
            visit(*table, &mut Vec::new(), &mut done);
        }
        assert_eq!(done.len(), TableId::ALL.len());
    }

    #[test]
    fn names_are_unique_and_parse_back() {
        let mut seen = HashSet::new();
        for table in TableId::ALL {
            assert!(seen.insert(table.name()), "duplicate name {}", table.name());
            assert_eq!(table.name().parse::<TableId>(), Ok(*table));
        }
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert_eq!(
            "no_such_table".parse::<TableId>(),
            Err(CoreError::UnknownTable("no_such_table".to_string()))
        );
    }

    #[test]
    fn serializes_as_wire_name() {
        let json = serde_json::to_string(&TableId::NetBinds).expect("serialize");
        assert_eq!(json, "\"net_binds\"");
        let back: TableId = serde_json::from_str("\"httpd_site_urls\"").expect("deserialize");
        assert_eq!(back, TableId::HttpdSiteUrls);
        assert!(serde_json::from_str::<TableId>("\"bogus\"").is_err());
    }

    #[test]
    fn connector_tables_are_infrastructure() {
        assert!(TableId::NetBinds.affects_daemon_connectors());
        assert!(TableId::Hosts.affects_daemon_connectors());
        assert!(!TableId::Accounts.affects_daemon_connectors());
    }
}
