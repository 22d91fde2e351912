//! In-process lifecycle notifications
//!
//! Delivery is best effort. A subscriber that falls behind is told how many
//! events it missed and must reload from the store instead of trusting its
//! cached copy.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Schedule, ScheduleStatus, ServiceOrderStatus};
use crate::store::Collection;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    #[serde(rename_all = "camelCase")]
    ScheduleChanged {
        schedule_id: String,
        status: ScheduleStatus,
        schedule: Option<Box<Schedule>>,
    },
    #[serde(rename_all = "camelCase")]
    ScheduleDeleted { schedule_id: String },
    #[serde(rename_all = "camelCase")]
    ServiceOrderChanged {
        order_id: String,
        schedule_id: String,
        status: ServiceOrderStatus,
    },
    CollectionReloaded { collection: Collection },
}

impl AppEvent {
    pub fn schedule_changed(schedule: &Schedule) -> Self {
        Self::ScheduleChanged {
            schedule_id: schedule.id.clone(),
            status: schedule.status,
            schedule: Some(Box::new(schedule.clone())),
        }
    }
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(AppEvent),
    /// Events were dropped; the cached view is stale
    ReloadRequired { missed: u64 },
    Closed,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that will see the event
    pub fn publish(&self, event: AppEvent) -> usize {
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<AppEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Delivery {
        match self.rx.recv().await {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Delivery::ReloadRequired { missed },
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }

    /// Non-blocking variant, `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(Delivery::ReloadRequired { missed })
            }
            Err(broadcast::error::TryRecvError::Closed) => Some(Delivery::Closed),
            Err(broadcast::error::TryRecvError::Empty) => None,
        }
    }
}

/// Logs every notification until the bus closes
pub async fn log_events(mut subscription: Subscription) {
    loop {
        match subscription.recv().await {
            Delivery::Event(event) => tracing::debug!(?event, "Lifecycle event"),
            Delivery::ReloadRequired { missed } => {
                tracing::debug!(missed, "Event log lagged behind")
            }
            Delivery::Closed => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted(id: &str) -> AppEvent {
        AppEvent::ScheduleDeleted {
            schedule_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(deleted("s1")), 2);
        assert_eq!(a.recv().await, Delivery::Event(deleted("s1")));
        assert_eq!(b.recv().await, Delivery::Event(deleted("s1")));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(deleted("s1")), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_to_reload() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        for i in 0..5 {
            bus.publish(deleted(&format!("s{i}")));
        }

        assert_eq!(slow.recv().await, Delivery::ReloadRequired { missed: 3 });
        assert_eq!(slow.recv().await, Delivery::Event(deleted("s3")));
    }

    #[tokio::test]
    async fn closed_bus_ends_subscription() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, Delivery::Closed);
    }

    #[test]
    fn payload_uses_camel_case_keys() {
        let value = serde_json::to_value(AppEvent::ServiceOrderChanged {
            order_id: "o1".into(),
            schedule_id: "s1".into(),
            status: ServiceOrderStatus::InProgress,
        })
        .unwrap();
        assert_eq!(value["type"], "service_order_changed");
        assert_eq!(value["scheduleId"], "s1");
        assert_eq!(value["status"], "in_progress");
    }
}
