#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::sync::{Arc, Once};

use sessionq::{ClientId, DropNotifier, Elem, MemoryStore, Message, QoSLevel, Queue};

pub const CLIENT: &str = "client-1";

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = sessionq::logging::init_logging("debug");
    });
}

pub fn memory_queue(max: usize) -> (Arc<Queue<MemoryStore>>, MemoryStore) {
    build_queue(max, None)
}

pub fn notifying_queue(
    max: usize,
    notifier: Arc<dyn DropNotifier>,
) -> (Arc<Queue<MemoryStore>>, MemoryStore) {
    build_queue(max, Some(notifier))
}

fn build_queue(
    max: usize,
    notifier: Option<Arc<dyn DropNotifier>>,
) -> (Arc<Queue<MemoryStore>>, MemoryStore) {
    init_logging();
    let store = MemoryStore::new();
    let mut queue = Queue::new(
        ClientId::new(CLIENT),
        NonZeroUsize::new(max).expect("capacity must be positive"),
        Arc::new(store.clone()),
    );
    if let Some(notifier) = notifier {
        queue = queue.with_notifier(notifier);
    }
    (Arc::new(queue), store)
}

pub fn publish(topic: &str, qos: QoSLevel) -> Elem {
    Elem::publish(Message::new(topic, format!("payload-{topic}"), qos))
}

/// A publish whose expiry lies a minute in the past.
pub fn expired(topic: &str, qos: QoSLevel) -> Elem {
    let elem = publish(topic, qos);
    let past = elem.at.saturating_sub(60_000);
    elem.with_expiry(past)
}

pub fn topic_of(elem: &Elem) -> String {
    elem.as_message()
        .map(|m| m.topic.clone())
        .unwrap_or_else(|| format!("pubrel#{}", elem.packet_id()))
}

/// Decoded view of the stored list as (topic, packet id) pairs.
pub fn stored(store: &MemoryStore) -> Vec<(String, u16)> {
    store
        .snapshot(CLIENT)
        .iter()
        .map(|raw| {
            let elem = Elem::decode(raw).expect("stored element must decode");
            (topic_of(&elem), elem.packet_id().value())
        })
        .collect()
}

pub fn stored_topics(store: &MemoryStore) -> Vec<String> {
    stored(store).into_iter().map(|(topic, _)| topic).collect()
}

pub fn ids(values: &[u16]) -> Vec<sessionq::PacketId> {
    values.iter().copied().map(sessionq::PacketId::new).collect()
}
