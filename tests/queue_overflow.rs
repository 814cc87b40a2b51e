mod common;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use common::{expired, ids, memory_queue, notifying_queue, publish, stored_topics};
use sessionq::{ClientId, DropNotifier, Message, QoSLevel, Queue};

#[derive(Default)]
struct Recorder {
    dropped: Mutex<Vec<String>>,
}

impl DropNotifier for Recorder {
    fn on_dropped(&self, client_id: &ClientId, message: &Message) -> anyhow::Result<()> {
        assert_eq!(client_id.as_str(), common::CLIENT);
        self.dropped.lock().unwrap().push(message.topic.clone());
        Ok(())
    }
}

fn recorded(recorder: &Recorder) -> Vec<String> {
    recorder.dropped.lock().unwrap().clone()
}

#[test]
fn full_queue_drops_oldest_pending_for_acknowledged_message() {
    let recorder = Arc::new(Recorder::default());
    let (queue, store) = notifying_queue(3, recorder.clone());
    queue.init(false).unwrap();

    for topic in ["A", "B", "C"] {
        queue.add(publish(topic, QoSLevel::AtLeastOnce)).unwrap();
    }
    assert_eq!(queue.stats().len, 3);

    queue.add(publish("D", QoSLevel::AtLeastOnce)).unwrap();

    assert_eq!(stored_topics(&store), vec!["B", "C", "D"]);
    assert_eq!(recorded(&recorder), vec!["A"]);
    let stats = queue.stats();
    assert_eq!(stats.len, 3);
    assert_eq!(stats.dropped_total, 1);
}

#[test]
fn at_most_once_incoming_is_dropped_when_nothing_else_qualifies() {
    let recorder = Arc::new(Recorder::default());
    let (queue, store) = notifying_queue(3, recorder.clone());
    queue.init(false).unwrap();

    for topic in ["B", "C", "D"] {
        queue.add(publish(topic, QoSLevel::ExactlyOnce)).unwrap();
    }
    queue.add(publish("E", QoSLevel::AtMostOnce)).unwrap();

    assert_eq!(stored_topics(&store), vec!["B", "C", "D"]);
    assert_eq!(recorded(&recorder), vec!["E"]);
    assert_eq!(queue.stats().len, 3);
}

#[test]
fn expired_element_is_preferred_victim() {
    let (queue, store) = memory_queue(3);
    queue.init(false).unwrap();

    queue.add(publish("A", QoSLevel::AtMostOnce)).unwrap();
    queue.add(expired("B", QoSLevel::AtLeastOnce)).unwrap();
    queue.add(publish("C", QoSLevel::AtLeastOnce)).unwrap();

    queue.add(publish("D", QoSLevel::AtLeastOnce)).unwrap();
    assert_eq!(stored_topics(&store), vec!["A", "C", "D"]);
}

#[test]
fn stored_at_most_once_is_dropped_before_acknowledged_ones() {
    let (queue, store) = memory_queue(3);
    queue.init(false).unwrap();

    queue.add(publish("A", QoSLevel::AtLeastOnce)).unwrap();
    queue.add(publish("B", QoSLevel::AtMostOnce)).unwrap();
    queue.add(publish("C", QoSLevel::AtMostOnce)).unwrap();

    queue.add(publish("D", QoSLevel::AtMostOnce)).unwrap();
    assert_eq!(stored_topics(&store), vec!["A", "C", "D"]);
}

#[test]
fn dispatched_elements_are_never_dropped() {
    let (queue, store) = memory_queue(3);
    queue.init(false).unwrap();

    for topic in ["A", "B", "C"] {
        queue.add(publish(topic, QoSLevel::AtLeastOnce)).unwrap();
    }
    queue.read_inflight(3).unwrap();
    queue.read(&ids(&[1, 2])).unwrap();

    // Only "C" is still pending.
    queue.add(publish("D", QoSLevel::AtLeastOnce)).unwrap();
    assert_eq!(stored_topics(&store), vec!["A", "B", "D"]);

    queue.read(&ids(&[3])).unwrap();

    // Everything is in flight and the in-flight region was drained.
    queue.add(publish("E", QoSLevel::AtLeastOnce)).unwrap();
    assert_eq!(stored_topics(&store), vec!["A", "B", "D"]);
    let stats = queue.stats();
    assert_eq!((stats.len, stats.current), (3, 3));
    assert_eq!(stats.dropped_total, 2);
}

#[test]
fn undrained_queue_skips_dispatched_elements_when_choosing_a_victim() {
    let (queue, store) = memory_queue(2);
    queue.init(false).unwrap();
    queue.add(publish("A", QoSLevel::AtLeastOnce)).unwrap();
    queue.add(publish("B", QoSLevel::AtLeastOnce)).unwrap();
    queue.read_inflight(1).unwrap();
    queue.read(&ids(&[1])).unwrap();

    // Reconnect: "A" is dispatched, "B" pending, nothing replayed yet.
    queue.init(false).unwrap();
    queue.add(publish("C", QoSLevel::AtLeastOnce)).unwrap();

    assert_eq!(stored_topics(&store), vec!["A", "C"]);
}

#[test]
fn failing_notifier_does_not_fail_add() {
    let notifier = |_: &ClientId, _: &Message| -> anyhow::Result<()> {
        anyhow::bail!("downstream unavailable")
    };
    let (queue, store) = notifying_queue(1, Arc::new(notifier));
    queue.init(false).unwrap();

    queue.add(publish("A", QoSLevel::AtLeastOnce)).unwrap();
    queue.add(publish("B", QoSLevel::AtLeastOnce)).unwrap();

    assert_eq!(stored_topics(&store), vec!["B"]);
    assert_eq!(queue.stats().dropped_total, 1);
}

#[test]
fn length_never_exceeds_capacity() {
    let (queue, store) = memory_queue(4);
    queue.init(false).unwrap();

    for i in 0..50 {
        let qos = match i % 3 {
            0 => QoSLevel::AtMostOnce,
            1 => QoSLevel::AtLeastOnce,
            _ => QoSLevel::ExactlyOnce,
        };
        queue.add(publish(&format!("m{i}"), qos)).unwrap();
        assert!(queue.stats().len <= 4);
        assert_eq!(queue.stats().len, store.snapshot(common::CLIENT).len());
    }
}

#[test]
fn add_before_first_init_respects_stored_length() {
    let (queue, store) = memory_queue(3);
    queue.init(false).unwrap();
    for topic in ["A", "B", "C"] {
        queue.add(publish(topic, QoSLevel::AtLeastOnce)).unwrap();
    }

    // A fresh queue over the same storage, as after a broker restart.
    let restarted = Queue::new(
        ClientId::new(common::CLIENT),
        NonZeroUsize::new(3).unwrap(),
        Arc::new(store.clone()),
    );
    restarted.add(publish("D", QoSLevel::AtLeastOnce)).unwrap();
    restarted.add(publish("E", QoSLevel::AtLeastOnce)).unwrap();

    assert_eq!(stored_topics(&store), vec!["C", "D", "E"]);
    let stats = restarted.stats();
    assert_eq!(stats.len, 3);
    assert_eq!(stats.dropped_total, 2);

    restarted.init(false).unwrap();
    assert_eq!(restarted.stats().len, 3);
}
