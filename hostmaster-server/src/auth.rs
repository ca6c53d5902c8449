//! Principals and the authentication seam used by the handshake.

use std::collections::{BTreeSet, HashMap};

use hostmaster_core::HostId;

use crate::config::UserConfig;

/// The effective identity of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub master: bool,
    pub daemon_hosts: BTreeSet<HostId>,
}

impl Principal {
    /// Only a principal with daemon privilege over exactly this host may bind
    /// a session to it.
    pub fn can_bind(&self, host: &HostId) -> bool {
        self.daemon_hosts.contains(host)
    }
}

pub trait Authenticator: Send + Sync {
    /// `None` means the credentials were not accepted.
    fn authenticate(&self, username: &str, secret: &str) -> Option<Principal>;
}

/// Users declared in the master config.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, UserConfig>,
}

impl StaticAuthenticator {
    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            users: users
                .iter()
                .map(|user| (user.username.clone(), user.clone()))
                .collect(),
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, username: &str, secret: &str) -> Option<Principal> {
        let user = self.users.get(username)?;
        if user.secret != secret {
            return None;
        }
        Some(Principal {
            username: user.username.clone(),
            master: user.master,
            daemon_hosts: user.daemon_hosts.clone(),
        })
    }
}
