use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Mutex;

/// An item waiting for a dispatch slot. Higher priority first, then arrival order.
#[derive(Debug)]
pub struct ScheduledTask<T> {
  pub priority: u8,
  pub sequence: u64,
  pub item: T,
}

impl<T> Eq for ScheduledTask<T> {}

impl<T> PartialEq for ScheduledTask<T> {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.sequence == other.sequence
  }
}

impl<T> PartialOrd for ScheduledTask<T> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl<T> Ord for ScheduledTask<T> {
  fn cmp(&self, other: &Self) -> Ordering {
    self.priority
      .cmp(&other.priority)
      .then_with(|| other.sequence.cmp(&self.sequence))
  }
}

pub struct Scheduler<T> {
  queue: Mutex<BinaryHeap<ScheduledTask<T>>>,
  next_sequence: AtomicU64,
}

impl<T> Default for Scheduler<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Scheduler<T> {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(BinaryHeap::new()),
      next_sequence: AtomicU64::new(0),
    }
  }

  pub async fn add_task(&self, priority: u8, item: T) {
    let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
    self.queue.lock().await.push(ScheduledTask { priority, sequence, item });
  }

  pub async fn get_next(&self) -> Option<T> {
    self.queue.lock().await.pop().map(|scheduled| scheduled.item)
  }
}
