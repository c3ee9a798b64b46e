use std::collections::VecDeque;

use serde_json::Value;

/// One server-to-client message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct OutgoingArray {
    pub id: u64,
    pub payload: Value,
    pub byte_size: usize,
}

/// Ordered buffer of unacknowledged outgoing arrays. Ids are assigned at
/// enqueue time, start at 1, and never repeat within a session; entries leave
/// the queue only through acknowledgement.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    items: VecDeque<OutgoingArray>,
    next_id: u64,
    total_bytes: usize,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            next_id: 1,
            total_bytes: 0,
        }
    }

    pub fn enqueue(&mut self, payload: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let byte_size = payload.to_string().len();
        self.total_bytes += byte_size;
        self.items.push_back(OutgoingArray {
            id,
            payload,
            byte_size,
        });
        id
    }

    /// Drops every array with id <= `up_to`. Idempotent; an `up_to` behind
    /// the head is ignored.
    pub fn acknowledge(&mut self, up_to: u64) {
        while let Some(front) = self.items.front() {
            if front.id > up_to {
                break;
            }
            self.total_bytes -= front.byte_size;
            self.items.pop_front();
        }
    }

    /// Snapshot of everything unacknowledged, in id order. Entries are not
    /// removed; only `acknowledge` removes.
    pub fn drain(&self) -> impl Iterator<Item = &OutgoingArray> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
