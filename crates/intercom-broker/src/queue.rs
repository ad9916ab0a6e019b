//! Bounded per-topic priority queue.
//!
//! Entries are keyed by `(Reverse(priority), message id)`, so the first entry
//! is always the highest-priority, earliest-published message. Message ids
//! increase monotonically, which makes the id a FIFO tie-break.

use intercom_core::{Message, OverflowPolicy, Priority};
use std::cmp::Reverse;
use std::collections::BTreeMap;

type QueueKey = (Reverse<Priority>, u64);

/// What happened to a pushed message.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queued, and this older message was evicted to make room.
    Evicted(Message),
    /// The queue was full and the pushed message was dropped.
    Rejected(Message),
}

#[derive(Debug)]
pub struct TopicQueue {
    entries: BTreeMap<QueueKey, Message>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl TopicQueue {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            overflow,
        }
    }

    pub fn push(&mut self, message: Message) -> PushOutcome {
        if self.entries.len() < self.capacity {
            self.insert(message);
            return PushOutcome::Queued;
        }

        match self.overflow {
            OverflowPolicy::DropNewest => PushOutcome::Rejected(message),
            OverflowPolicy::DropOldest => {
                let Some(lowest) = self.lowest_priority() else {
                    self.insert(message);
                    return PushOutcome::Queued;
                };
                // The incoming message would itself be the oldest of the lowest priority.
                if message.priority < lowest {
                    return PushOutcome::Rejected(message);
                }
                let victim = self
                    .entries
                    .range((Reverse(lowest), 0)..)
                    .next()
                    .map(|(key, _)| *key);
                let evicted = victim.and_then(|key| self.entries.remove(&key));
                self.insert(message);
                match evicted {
                    Some(old) => PushOutcome::Evicted(old),
                    None => PushOutcome::Queued,
                }
            }
        }
    }

    /// Highest priority first, FIFO within a priority.
    pub fn pop(&mut self) -> Option<Message> {
        self.entries.pop_first().map(|(_, message)| message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn insert(&mut self, message: Message) {
        self.entries
            .insert((Reverse(message.priority), message.id.0), message);
    }

    fn lowest_priority(&self) -> Option<Priority> {
        self.entries.keys().next_back().map(|(Reverse(p), _)| *p)
    }
}
