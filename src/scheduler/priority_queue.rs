//! Stable descending-priority queue.

use std::collections::VecDeque;

struct Slot<T> {
    priority: i32,
    item: T,
}

/// Queue ordered by descending priority, FIFO among equal priorities.
pub(crate) struct PriorityQueue<T> {
    slots: VecDeque<Slot<T>>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            slots: VecDeque::new(),
        }
    }
}

impl<T> PriorityQueue<T> {
    pub(crate) fn enqueue(&mut self, item: T, priority: i32) {
        let slot = Slot { priority, item };

        // Uniform priorities always take this path.
        if self
            .slots
            .back()
            .is_some_and(|last| last.priority >= priority)
        {
            self.slots.push_back(slot);
            return;
        }

        // Lower bound: first slot with a strictly lower priority.
        let index = self.slots.partition_point(|queued| queued.priority >= priority);
        self.slots.insert(index, slot);
    }

    pub(crate) fn dequeue(&mut self) -> Option<T> {
        self.slots.pop_front().map(|slot| slot.item)
    }

    /// Removes the first item matching `predicate`.
    pub(crate) fn remove_first(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.slots.iter().position(|slot| predicate(&slot.item))?;
        self.slots.remove(index).map(|slot| slot.item)
    }

    pub(crate) fn clear(&mut self) -> Vec<T> {
        self.slots.drain(..).map(|slot| slot.item).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
