use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::schema::core_schema_sql;

#[derive(Clone)]
pub struct IdsDb {
    client: Arc<Mutex<Client>>,
}

impl IdsDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "marketplace ids postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    /// Creates the `ids` schema, tables and indexes if they are missing.
    pub async fn apply_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(core_schema_sql())
            .await
            .context("apply ids schema")?;
        tracing::info!("ids schema applied");
        Ok(())
    }
}
