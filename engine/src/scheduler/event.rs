use std::{cmp::Ordering, time::Duration, time::SystemTime};

/// Work performed when an [Event] fires.
pub(super) enum Action {
    Once(Box<dyn FnOnce() + Send>),
    /// Re-enqueued by the worker `interval` after each firing.
    Repeat {
        interval: Duration,
        callback: Box<dyn FnMut() + Send>,
    },
}

impl Action {
    pub(super) fn is_repeating(&self) -> bool {
        matches!(self, Action::Repeat { .. })
    }
}

/// A pending occurrence in the scheduler's queue.
pub(super) struct Event {
    pub time: SystemTime,
    pub priority: i32,
    pub sequence: u64,
    pub id: String,
    pub action: Action,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    /// The event that must fire first compares greatest (for use in a max-heap): earliest
    /// time, then highest priority, then earliest submission.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BinaryHeap, time::UNIX_EPOCH};

    fn event(time_ms: u64, priority: i32, sequence: u64) -> Event {
        Event {
            time: UNIX_EPOCH + Duration::from_millis(time_ms),
            priority,
            sequence,
            id: format!("{time_ms}/{priority}/{sequence}"),
            action: Action::Once(Box::new(|| {})),
        }
    }

    #[test]
    fn test_heap_order() {
        let mut heap = BinaryHeap::new();
        heap.push(event(20, 0, 0));
        heap.push(event(10, 0, 1));
        heap.push(event(20, 5, 2));
        heap.push(event(20, 5, 3));
        heap.push(event(20, -1, 4));
        heap.push(event(5, -100, 5));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|e| e.id).collect();
        assert_eq!(
            order,
            vec!["5/-100/5", "10/0/1", "20/5/2", "20/5/3", "20/0/0", "20/-1/4"]
        );
    }

    #[test]
    fn test_is_repeating() {
        assert!(!event(0, 0, 0).action.is_repeating());
        let repeat = Action::Repeat {
            interval: Duration::from_millis(1),
            callback: Box::new(|| {}),
        };
        assert!(repeat.is_repeating());
    }
}
