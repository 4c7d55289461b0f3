pub mod adapter;
pub mod batch;
pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod filter;
pub mod notifier;
pub mod stats;
pub mod transform;

pub mod postgres;

pub use adapter::ChangeAdapter;
pub use config::{Config, DatabaseConfig, DeliveryConfig};
pub use error::{Error, Result};
pub use event::{ChangeEvent, Operation};
pub use notifier::{ChangeNotifier, NotifierState};
pub use stats::NotifierStats;
