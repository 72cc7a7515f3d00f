//! Event handler that records delivery outcomes for assertions.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_core::{DeliveryEvent, EventHandler};
use tokio::sync::{Mutex, Notify};

/// Records every delivery event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<DeliveryEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates a shared recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a snapshot of the recorded events.
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().await.clone()
    }

    /// Waits until at least `count` events were recorded.
    ///
    /// # Panics
    ///
    /// Panics when the events do not arrive within `timeout`.
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Vec<DeliveryEvent> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                {
                    let events = self.events.lock().await;
                    if events.len() >= count {
                        return events.clone();
                    }
                }
                notified.await;
            }
        })
        .await;

        match result {
            Ok(events) => events,
            Err(_) => panic!(
                "expected {count} delivery events within {timeout:?}, got {}",
                self.events.lock().await.len()
            ),
        }
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().await.push(event);
        self.notify.notify_waiters();
    }
}
