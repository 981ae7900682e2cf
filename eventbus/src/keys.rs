//! Store key layout.
//!
//! These names are shared with every producer and consumer talking to the
//! same store, in any language, so they must not change:
//!
//! | Key | Type | Holds |
//! |---|---|---|
//! | `<event_name>` | set | subscribing service ids |
//! | `<service>:partition_count` | string | partition count |
//! | `<service>:<index>` | list | partition queue, head = newest |
//! | `<service>:<index>:dead_letter` | list | failed items |
//! | `<service>:<consumer>:alive` | string, PX ttl | liveness record |
//!
//! The coordinator additionally keeps `<service>:consumers` (set of known
//! consumer ids), `<service>:owners` (hash `index -> consumer`) and
//! `<service>:owners:epoch` (compare-and-swap token).

/// Set of services subscribed to an event name.
pub fn subscribers(event_name: &str) -> String {
    event_name.to_string()
}

pub fn partition_count(service: &str) -> String {
    format!("{service}:partition_count")
}

pub fn partition_queue(service: &str, partition: u32) -> String {
    format!("{service}:{partition}")
}

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}:dead_letter")
}

pub fn alive(service: &str, consumer_id: &str) -> String {
    format!("{service}:{consumer_id}:alive")
}

pub fn consumers(service: &str) -> String {
    format!("{service}:consumers")
}

pub fn owners(service: &str) -> String {
    format!("{service}:owners")
}

pub fn owners_epoch(service: &str) -> String {
    format!("{service}:owners:epoch")
}
