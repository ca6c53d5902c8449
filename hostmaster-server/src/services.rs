//! Process-wide state shared by every connection.

use std::sync::Arc;

use hostmaster_core::InvalidationSet;

use crate::auth::{Authenticator, StaticAuthenticator};
use crate::barrier::SyncBarrier;
use crate::config::MasterConfig;
use crate::handler::{NoCommands, RequestHandler};
use crate::pool::{DaemonConnectionPool, DaemonDirectory, StaticDirectory};
use crate::registry::{PublishSummary, SessionRegistry};

pub struct Services {
    pub config: MasterConfig,
    pub registry: SessionRegistry,
    pub barrier: Arc<SyncBarrier>,
    pub pool: Arc<DaemonConnectionPool>,
    pub authenticator: Arc<dyn Authenticator>,
    pub handler: Arc<dyn RequestHandler>,
}

impl Services {
    /// Config-backed users and daemons, no business commands.
    pub fn from_config(config: MasterConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: MasterConfig) -> ServicesBuilder {
        ServicesBuilder {
            config,
            authenticator: None,
            directory: None,
            handler: None,
        }
    }

    pub fn publish(&self, invalidations: InvalidationSet) -> PublishSummary {
        self.registry.publish(invalidations)
    }
}

pub struct ServicesBuilder {
    config: MasterConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    directory: Option<Arc<dyn DaemonDirectory>>,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl ServicesBuilder {
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn DaemonDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Arc<Services> {
        let config = self.config;
        let authenticator: Arc<dyn Authenticator> = match self.authenticator {
            Some(authenticator) => authenticator,
            None => Arc::new(StaticAuthenticator::new(&config.users)),
        };
        let directory: Arc<dyn DaemonDirectory> = match self.directory {
            Some(directory) => directory,
            None => Arc::new(StaticDirectory::new(&config.daemons)),
        };
        let handler: Arc<dyn RequestHandler> = match self.handler {
            Some(handler) => handler,
            None => Arc::new(NoCommands),
        };

        let barrier = Arc::new(SyncBarrier::new(config.barrier.ceiling()));
        let registry = SessionRegistry::new(barrier.clone());
        let pool = Arc::new(DaemonConnectionPool::new(directory, config.pool.clone()));
        registry.add_listener(pool.clone());

        Arc::new(Services {
            config,
            registry,
            barrier,
            pool,
            authenticator,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostmaster_core::{HostId, TableId};

    use crate::config::DaemonConfig;

    #[test]
    fn pool_listens_for_connector_tables() {
        let mut config = MasterConfig::default();
        config.daemons.push(DaemonConfig {
            host: HostId::from("web1"),
            address: "127.0.0.1".to_string(),
            port: 1,
            key: "k".to_string(),
            protocol_version: 2,
        });
        let services = Services::from_config(config);
        services
            .pool
            .get_connector(&HostId::from("web1"))
            .expect("connector");
        assert_eq!(services.pool.cached_connectors(), 1);

        let mut set = InvalidationSet::new();
        set.add_all(TableId::Hosts, false);
        services.publish(set);
        assert_eq!(services.pool.cached_connectors(), 0);
    }
}
