//! FIFO of raised notifications awaiting queued delivery.

use std::collections::VecDeque;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::protocol::ModuleName;

/// A notification raised by a model but not yet delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingNotification {
    /// External notification id the raise resolved to.
    pub id: i32,
    pub module: ModuleName,
    pub irq: u32,
    /// Raise order, starting at 1.
    pub sequence: u64,
}

/// Unbounded FIFO preserving raise order.
pub struct PendingQueue {
    queue: Mutex<VecDeque<PendingNotification>>,
    sequence: AtomicU64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn push(&self, id: i32, module: ModuleName, irq: u32) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back(PendingNotification {
            id,
            module,
            irq,
            sequence,
        });
        sequence
    }

    pub fn pop(&self) -> Option<PendingNotification> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::module_name;

    #[test]
    fn test_queue_is_fifo() {
        let q = PendingQueue::new();
        let uart = module_name("uart").unwrap();
        assert_eq!(q.push(34, uart, 5), 1);
        assert_eq!(q.push(35, uart, 6), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().irq, 5);
        let second = q.pop().unwrap();
        assert_eq!((second.id, second.sequence), (35, 2));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_queue_clear() {
        let q = PendingQueue::new();
        let dma = module_name("dma").unwrap();
        q.push(1, dma, 10);
        q.push(2, dma, 11);
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }
}
