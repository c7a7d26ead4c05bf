//! Embedded database: a [`DbServer`] on a local directory plus one client
//! session on top of it.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use basedb_core::{Config, Result};
use basedb_storage::DbServer;

use crate::client::DbClient;

pub struct BasedDb {
    server: DbServer,
    client: DbClient,
}

impl BasedDb {
    /// Open or create a database at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Config::default();
        config.storage.data_dir = path.as_ref().to_path_buf();
        Self::open_with_config(config).await
    }

    /// Open with custom configuration
    pub async fn open_with_config(config: Config) -> Result<Self> {
        let server = DbServer::open(config.clone()).await?;
        let client = DbClient::with_config(Arc::new(server.clone()), &config)?;
        Ok(Self { server, client })
    }

    /// Another session on the same server, with its own modify batch.
    pub fn client(&self) -> Result<DbClient> {
        DbClient::with_config(Arc::new(self.server.clone()), self.server.config())
    }

    pub fn server(&self) -> &DbServer {
        &self.server
    }

    /// Flush buffered modifies and write dirty blocks to disk.
    pub async fn save(&self) -> Result<usize> {
        self.client.drain().await?;
        self.server.save().await
    }

    /// Flush, save and stop the background save task.
    pub async fn stop(&self) -> Result<()> {
        self.client.drain().await?;
        self.server.stop().await
    }
}

impl Deref for BasedDb {
    type Target = DbClient;

    fn deref(&self) -> &DbClient {
        &self.client
    }
}
