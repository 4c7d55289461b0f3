pub mod adapter;
pub mod listener;
pub mod triggers;
pub mod types;

pub use adapter::PostgresAdapter;
pub use listener::{backoff_delay, ConnectionState, NotificationListener};
pub use triggers::{
    create_trigger_sql, drop_trigger_sql, notify_function_sql, TriggerDefinition,
    TriggerOperation, TriggerTiming, NOTIFICATION_CHANNEL,
};
pub use types::*;
