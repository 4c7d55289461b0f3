//! PostgreSQL implementation of [`ChangeAdapter`].
//!
//! Setup installs one shared notification function plus one row trigger per
//! selected table, all inside a single transaction. Notifications are
//! received by a dedicated [`NotificationListener`]; the pool is only used
//! for setup, teardown and connection probes.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::NoTls;
use tracing::{debug, error, info, warn};

use super::listener::NotificationListener;
use super::triggers::{
    create_trigger_sql, drop_trigger_sql, notify_function_sql, TriggerDefinition,
    NOTIFICATION_CHANNEL, NOTIFY_FUNCTION,
};
use super::types::{NotificationPayload, TriggerRecord};
use crate::adapter::{AdapterHandlers, ChangeAdapter, ChangeEventHandler, ErrorHandler};
use crate::config::DatabaseConfig;
use crate::filter::{TableFilter, TableRef};
use crate::{Error, Result};

const CATALOG_TABLES_QUERY: &str = "SELECT n.nspname::text, c.relname::text \
     FROM pg_catalog.pg_class c \
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     WHERE c.relkind IN ('r', 'p') \
       AND NOT c.relispartition \
       AND n.nspname = ANY($1::text[]) \
     ORDER BY 1, 2";

pub struct PostgresAdapter {
    pool: deadpool_postgres::Pool,
    pg_config: tokio_postgres::Config,
    database_name: String,
    handlers: AdapterHandlers,
    listener: Option<NotificationListener>,
    triggers: Vec<TriggerRecord>,
    initialized: bool,
}

impl PostgresAdapter {
    /// Builds the connection pool. No connection is opened until first use.
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let pg_config = config.pg_config();

        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr = deadpool_postgres::Manager::from_config(pg_config.clone(), NoTls, mgr_config);
        let pool = deadpool_postgres::Pool::builder(mgr)
            .max_size(config.pool_max_size)
            .build()?;

        Ok(Self {
            pool,
            pg_config,
            database_name: config.database.clone(),
            handlers: AdapterHandlers::new(),
            listener: None,
            triggers: Vec::new(),
            initialized: false,
        })
    }

    pub fn is_setup(&self) -> bool {
        self.initialized
    }

    async fn install(&self, filter: &TableFilter) -> Result<Vec<TriggerRecord>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        match install_triggers(&tx, filter).await {
            Ok(records) => {
                tx.commit().await?;
                Ok(records)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback of trigger setup failed");
                }
                Err(e)
            }
        }
    }

    async fn uninstall(&self) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let mut result = Ok(());
        for record in &self.triggers {
            let sql = drop_trigger_sql(&record.name, &record.schema, &record.table);
            if let Err(e) = tx.batch_execute(&sql).await {
                result = Err(Error::wrap(
                    format!("Failed to drop trigger {}", record.name),
                    e,
                ));
                break;
            }
        }

        match result {
            Ok(()) => Ok(tx.commit().await?),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback of trigger teardown failed");
                }
                Err(e)
            }
        }
    }
}

async fn install_triggers(
    tx: &tokio_postgres::Transaction<'_>,
    filter: &TableFilter,
) -> Result<Vec<TriggerRecord>> {
    tx.batch_execute(&notify_function_sql(NOTIFY_FUNCTION, NOTIFICATION_CHANNEL))
        .await?;

    let rows = tx.query(CATALOG_TABLES_QUERY, &[&filter.schemas]).await?;
    let catalog = rows
        .iter()
        .map(|row| TableRef::new(row.get::<_, String>(0), row.get::<_, String>(1)));
    let tables = filter.resolve(catalog);

    let mut records = Vec::with_capacity(tables.len());
    for table in tables {
        let def = TriggerDefinition::change_capture(&table.schema, &table.name);
        tx.batch_execute(&create_trigger_sql(&def)?)
            .await
            .map_err(|e| {
                Error::wrap(
                    format!("Failed to create trigger on {}", table.qualified_name()),
                    e,
                )
            })?;
        debug!(table = %table.qualified_name(), trigger = %def.trigger_name, "Trigger created");
        records.push(TriggerRecord {
            name: def.trigger_name,
            table: table.name,
            schema: table.schema,
        });
    }
    Ok(records)
}

/// Turns one raw notification into an event for the registered consumer.
/// Malformed payloads are logged and dropped.
fn handle_payload(handlers: &AdapterHandlers, database_name: &str, raw: &str) {
    let payload = match NotificationPayload::parse(raw) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, payload_len = raw.len(), "Dropping malformed notification payload");
            return;
        }
    };
    let event = payload.into_event(database_name);
    debug!(
        event_id = %event.id,
        table = %event.source.table,
        operation = %event.operation,
        "Received change notification"
    );
    handlers.emit_change(event);
}

#[async_trait]
impl ChangeAdapter for PostgresAdapter {
    fn database_type(&self) -> &'static str {
        "postgres"
    }

    async fn test_connection(&self) -> bool {
        let client = match self.pool.get().await {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Database connection test failed");
                return false;
            }
        };
        match client.query_one("SELECT 1", &[]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Database connection test query failed");
                false
            }
        }
    }

    async fn setup_change_notifications(&mut self, filter: &TableFilter) -> Result<()> {
        if self.initialized {
            debug!("Change notifications already set up");
            return Ok(());
        }

        let records = self
            .install(filter)
            .await
            .map_err(|e| Error::wrap("Failed to set up change notifications", e))?;

        info!(
            tables = records.len(),
            schemas = ?filter.schemas,
            "Change notifications set up"
        );
        self.triggers = records;
        self.initialized = true;
        Ok(())
    }

    async fn teardown_change_notifications(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }

        self.uninstall()
            .await
            .map_err(|e| Error::wrap("Failed to tear down change notifications", e))?;

        info!(triggers = self.triggers.len(), "Change notifications removed");
        self.triggers.clear();
        self.initialized = false;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if let Some(listener) = &self.listener {
            return listener.connect().await;
        }

        let handlers = self.handlers.clone();
        let database_name = self.database_name.clone();
        let on_payload = Arc::new(move |raw: String| {
            handle_payload(&handlers, &database_name, &raw);
        });
        let handlers = self.handlers.clone();
        let on_error = Arc::new(move |e: &Error| handlers.emit_error(e));

        let listener = NotificationListener::new(
            self.pg_config.clone(),
            NOTIFICATION_CHANNEL,
            on_payload,
            on_error,
        );
        if let Err(e) = listener.connect().await {
            // no background reconnects for a listener that never started
            listener.disconnect().await?;
            return Err(e);
        }
        self.listener = Some(listener);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(listener) = self.listener.take() {
            listener.disconnect().await?;
        }
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .map(NotificationListener::is_connected)
            .unwrap_or(false)
    }

    fn triggers(&self) -> Vec<TriggerRecord> {
        self.triggers.clone()
    }

    fn on_change_event(&self, handler: ChangeEventHandler) {
        self.handlers.set_change_handler(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.handlers.add_error_handler(handler);
    }
}
