//! In-memory broker for tests/dev.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::broker::{Broker, BrokerError, BrokerSubscription, Delivery};

/// In-memory broker with consumer-group semantics.
///
/// - No IO / no async
/// - Append-only topic logs, retained for the life of the broker
/// - Per-group cursor; uncommitted deliveries of a dropped subscription are
///   redelivered to the group
/// - `set_available(false)` simulates an unreachable broker: publishes fail
///   and subscriptions report connection loss
///
/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    arrived: Condvar,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    next_token: u64,
    topics: HashMap<String, TopicLog>,
}

#[derive(Debug, Default)]
struct TopicLog {
    messages: Vec<Vec<u8>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    next_offset: usize,
    redeliver: VecDeque<usize>,
    /// offset -> token of the subscription holding it
    in_flight: HashMap<usize, u64>,
    committed: BTreeSet<usize>,
    delivery_counts: HashMap<usize, u32>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle broker reachability (failure injection).
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.available = available;
        }
        self.shared.arrived.notify_all();
    }

    /// Number of messages ever published to `topic`.
    pub fn published_count(&self, topic: &str) -> usize {
        self.with_group(topic, None, |log, _| log.messages.len())
    }

    /// Number of offsets `group` has committed on `topic`.
    pub fn committed_count(&self, topic: &str, group: &str) -> usize {
        self.with_group(topic, Some(group), |_, g| g.map_or(0, |g| g.committed.len()))
    }

    /// Number of deliveries handed out to `group` and not committed yet.
    pub fn in_flight_count(&self, topic: &str, group: &str) -> usize {
        self.with_group(topic, Some(group), |_, g| g.map_or(0, |g| g.in_flight.len()))
    }

    fn with_group<R>(
        &self,
        topic: &str,
        group: Option<&str>,
        f: impl FnOnce(&TopicLog, Option<&GroupState>) -> R,
    ) -> R {
        let empty = TopicLog::default();
        let state = self.shared.state.lock();
        match state {
            Ok(state) => {
                let log = state.topics.get(topic).unwrap_or(&empty);
                let g = group.and_then(|name| log.groups.get(name));
                f(log, g)
            }
            Err(_) => f(&empty, None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.shared
            .state
            .lock()
            .map_err(|_| BrokerError::Connection("in-memory broker lock poisoned".to_string()))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    available: true,
                    next_token: 1,
                    topics: HashMap::new(),
                }),
                arrived: Condvar::new(),
            }),
        }
    }
}

impl BrokerState {
    fn take_next(&mut self, topic: &str, group: &str, token: u64) -> Option<Delivery> {
        let log = self.topics.entry(topic.to_string()).or_default();
        let TopicLog { messages, groups } = log;
        let g = groups.entry(group.to_string()).or_default();

        let offset = loop {
            if let Some(offset) = g.redeliver.pop_front() {
                if g.committed.contains(&offset) {
                    continue;
                }
                break offset;
            }
            if g.next_offset < messages.len() {
                let offset = g.next_offset;
                g.next_offset += 1;
                break offset;
            }
            return None;
        };

        g.in_flight.insert(offset, token);
        let count = g.delivery_counts.entry(offset).or_insert(0);
        *count += 1;

        Some(Delivery {
            topic: topic.to_string(),
            id: offset.to_string(),
            payload: messages[offset].clone(),
            delivery_count: *count,
        })
    }
}

impl Broker for InMemoryBroker {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| BrokerError::Unavailable("in-memory broker lock poisoned".to_string()))?;

        if !state.available {
            return Err(BrokerError::Unavailable(
                "in-memory broker is unreachable".to_string(),
            ));
        }

        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .messages
            .push(payload);
        drop(state);

        self.shared.arrived.notify_all();
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
        let mut state = self.lock()?;
        if !state.available {
            return Err(BrokerError::Connection(
                "in-memory broker is unreachable".to_string(),
            ));
        }

        // Joining creates the group at the earliest offset.
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();

        let token = state.next_token;
        state.next_token += 1;

        Ok(Box::new(InMemorySubscription {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            token,
        }))
    }
}

/// A group member of an [`InMemoryBroker`] topic.
#[derive(Debug)]
pub struct InMemorySubscription {
    broker: InMemoryBroker,
    topic: String,
    group: String,
    consumer: String,
    token: u64,
}

impl InMemorySubscription {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

impl BrokerSubscription for InMemorySubscription {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock()?;

        loop {
            if !state.available {
                return Err(BrokerError::Connection(
                    "in-memory broker is unreachable".to_string(),
                ));
            }

            if let Some(delivery) = state.take_next(&self.topic, &self.group, self.token) {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (guard, _) = self
                .broker
                .shared
                .arrived
                .wait_timeout(state, deadline - now)
                .map_err(|_| {
                    BrokerError::Connection("in-memory broker lock poisoned".to_string())
                })?;
            state = guard;
        }
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let offset: usize = delivery
            .id
            .parse()
            .map_err(|_| BrokerError::Protocol(format!("bad offset: {}", delivery.id)))?;

        let mut state = self.broker.lock()?;
        if !state.available {
            return Err(BrokerError::Connection(
                "in-memory broker is unreachable".to_string(),
            ));
        }

        let g = state
            .topics
            .entry(self.topic.clone())
            .or_default()
            .groups
            .entry(self.group.clone())
            .or_default();

        g.in_flight.remove(&offset);
        g.committed.insert(offset);
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        // Hand uncommitted deliveries back to the group.
        if let Ok(mut state) = self.broker.shared.state.lock() {
            if let Some(g) = state
                .topics
                .get_mut(&self.topic)
                .and_then(|log| log.groups.get_mut(&self.group))
            {
                let mut orphaned: Vec<usize> = g
                    .in_flight
                    .iter()
                    .filter(|(_, token)| **token == self.token)
                    .map(|(offset, _)| *offset)
                    .collect();
                orphaned.sort_unstable();
                if !orphaned.is_empty() {
                    debug!(
                        topic = %self.topic,
                        group = %self.group,
                        consumer = %self.consumer,
                        count = orphaned.len(),
                        "returning uncommitted deliveries to the group"
                    );
                }

                for offset in orphaned.into_iter().rev() {
                    g.in_flight.remove(&offset);
                    g.redeliver.push_front(offset);
                }
            }
        }
        self.broker.shared.arrived.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "new_order";
    const GROUP: &str = "order_consumer_group";

    fn short() -> Duration {
        Duration::from_millis(20)
    }

    #[test]
    fn group_starts_from_earliest_message() {
        let broker = InMemoryBroker::new();
        broker.publish(TOPIC, b"first".to_vec()).unwrap();

        let mut sub = broker.subscribe(TOPIC, GROUP, "c-1").unwrap();
        let delivery = sub.poll(short()).unwrap().unwrap();

        assert_eq!(delivery.payload, b"first");
        assert_eq!(delivery.delivery_count, 1);
    }

    #[test]
    fn each_message_goes_to_one_member_of_a_group() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe(TOPIC, GROUP, "a").unwrap();
        let mut b = broker.subscribe(TOPIC, GROUP, "b").unwrap();

        broker.publish(TOPIC, b"1".to_vec()).unwrap();
        broker.publish(TOPIC, b"2".to_vec()).unwrap();

        let first = a.poll(short()).unwrap().unwrap();
        let second = b.poll(short()).unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert!(a.poll(short()).unwrap().is_none());
        assert!(b.poll(short()).unwrap().is_none());
    }

    #[test]
    fn separate_groups_each_see_every_message() {
        let broker = InMemoryBroker::new();
        broker.publish(TOPIC, b"1".to_vec()).unwrap();

        let mut a = broker.subscribe(TOPIC, "group-a", "a").unwrap();
        let mut b = broker.subscribe(TOPIC, "group-b", "b").unwrap();

        assert!(a.poll(short()).unwrap().is_some());
        assert!(b.poll(short()).unwrap().is_some());
    }

    #[test]
    fn uncommitted_delivery_is_redelivered_after_drop() {
        let broker = InMemoryBroker::new();
        broker.publish(TOPIC, b"1".to_vec()).unwrap();

        let mut crashed = broker.subscribe(TOPIC, GROUP, "c-1").unwrap();
        let original = crashed.poll(short()).unwrap().unwrap();
        drop(crashed);

        let mut restarted = broker.subscribe(TOPIC, GROUP, "c-1").unwrap();
        let again = restarted.poll(short()).unwrap().unwrap();

        assert_eq!(again.id, original.id);
        assert!(again.is_redelivery());
        assert_eq!(broker.in_flight_count(TOPIC, GROUP), 1);
    }

    #[test]
    fn committed_delivery_is_not_redelivered() {
        let broker = InMemoryBroker::new();
        broker.publish(TOPIC, b"1".to_vec()).unwrap();

        let mut sub = broker.subscribe(TOPIC, GROUP, "c-1").unwrap();
        let delivery = sub.poll(short()).unwrap().unwrap();
        sub.commit(&delivery).unwrap();
        drop(sub);

        let mut sub = broker.subscribe(TOPIC, GROUP, "c-1").unwrap();
        assert!(sub.poll(short()).unwrap().is_none());
        assert_eq!(broker.committed_count(TOPIC, GROUP), 1);
        assert_eq!(broker.in_flight_count(TOPIC, GROUP), 0);
    }

    #[test]
    fn unavailable_broker_rejects_publish_and_breaks_polls() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe(TOPIC, GROUP, "c-1").unwrap();

        broker.set_available(false);

        assert!(matches!(
            broker.publish(TOPIC, b"1".to_vec()),
            Err(BrokerError::Unavailable(_))
        ));
        let err = sub.poll(short()).unwrap_err();
        assert!(err.is_connection_loss());
    }

    #[test]
    fn poll_wakes_up_on_publish() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe(TOPIC, GROUP, "c-1").unwrap();

        let publisher = broker.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish(TOPIC, b"late".to_vec()).unwrap();
        });

        let delivery = sub.poll(Duration::from_secs(2)).unwrap();
        t.join().unwrap();
        assert_eq!(delivery.unwrap().payload, b"late");
    }
}
