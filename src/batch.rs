//! Size- and time-bounded event batching.
//!
//! The buffer flushes as soon as it holds `size` events. Otherwise the first
//! event buffered after a flush arms a single deadline `window` in the
//! future; the owner flushes when it expires. A size-triggered flush
//! disarms the deadline.

use crate::event::ChangeEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub size: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_batch_size(),
            window_ms: default_window_ms(),
        }
    }
}

impl BatchConfig {
    pub fn enabled(size: usize, window: Duration) -> Self {
        Self {
            enabled: true,
            size,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_window_ms() -> u64 {
    1000
}

#[derive(Debug)]
pub struct EventBatcher {
    size: usize,
    window: Duration,
    buffer: Vec<ChangeEvent>,
    deadline: Option<Instant>,
}

impl EventBatcher {
    pub fn new(config: &BatchConfig) -> Self {
        let size = config.size.max(1);
        Self {
            size,
            window: config.window(),
            buffer: Vec::with_capacity(size),
            deadline: None,
        }
    }

    /// Buffers an event. Returns the full batch when the size bound is hit.
    pub fn push(&mut self, event: ChangeEvent) -> Option<Vec<ChangeEvent>> {
        if self.buffer.is_empty() {
            self.deadline = Some(Instant::now() + self.window);
        }
        self.buffer.push(event);

        if self.buffer.len() >= self.size {
            Some(self.take())
        } else {
            None
        }
    }

    /// When the current buffering cycle must be flushed, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Empties the buffer and disarms the deadline.
    pub fn take(&mut self) -> Vec<ChangeEvent> {
        self.deadline = None;
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.size))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DatabaseInfo, EventData, EventSource, Operation};

    fn event(n: usize) -> ChangeEvent {
        ChangeEvent::new(
            Operation::Insert,
            DatabaseInfo {
                kind: "postgres".to_string(),
                name: "app".to_string(),
            },
            EventSource {
                table: "t".to_string(),
                schema: None,
            },
            EventData::default(),
        )
        .with_id(format!("e{}", n))
    }

    #[tokio::test]
    async fn test_size_flush_returns_events_in_order() {
        let mut batcher = EventBatcher::new(&BatchConfig::enabled(3, Duration::from_secs(1)));

        assert!(batcher.push(event(1)).is_none());
        assert!(batcher.push(event(2)).is_none());
        assert_eq!(batcher.len(), 2);
        let batch = batcher.push(event(3)).unwrap();

        let ids: Vec<_> = batch.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert!(batcher.is_empty());
        assert_eq!(batcher.len(), 0);
        assert!(batcher.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_armed_once_per_cycle() {
        let mut batcher = EventBatcher::new(&BatchConfig::enabled(10, Duration::from_millis(500)));
        assert!(batcher.deadline().is_none());

        batcher.push(event(1));
        let first = batcher.deadline().unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        batcher.push(event(2));
        assert_eq!(batcher.deadline(), Some(first));

        let drained = batcher.take();
        assert_eq!(drained.len(), 2);
        assert!(batcher.deadline().is_none());

        tokio::time::advance(Duration::from_millis(100)).await;
        batcher.push(event(3));
        assert!(batcher.deadline().unwrap() > first);
    }

    #[test]
    fn test_config_defaults() {
        let config: BatchConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert_eq!(config.size, 100);
        assert_eq!(config.window(), Duration::from_millis(1000));
    }
}
