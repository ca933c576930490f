//! 触发队列
//!
//! 最小堆，按 (trigger_time, 优先级高者在前, run_id) 排序。
//! 删除是惰性的：条目可能已过期（实例被取消、重试改期等），
//! 出队后由引擎对照当前实例状态校验，过期条目直接丢弃。

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub trigger_time: i64,
    pub priority: i32,
    pub run_id: i64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap是最大堆，这里反转得到最小堆；
        // 同一时刻优先级数值大的先出队
        other
            .trigger_time
            .cmp(&self.trigger_time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.run_id.cmp(&self.run_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TriggerQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, run_id: i64, trigger_time: i64, priority: i32) {
        self.heap.push(QueueEntry {
            trigger_time,
            priority,
            run_id,
        });
    }

    /// 弹出所有已到期的条目
    pub fn pop_due(&mut self, now: i64) -> Vec<QueueEntry> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|entry| entry.trigger_time <= now)
        {
            if let Some(entry) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    pub fn next_trigger_time(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.trigger_time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_time_order() {
        let mut queue = TriggerQueue::new();
        queue.push(1, 300, 0);
        queue.push(2, 100, 0);
        queue.push(3, 200, 0);
        let due = queue.pop_due(300);
        let ids: Vec<i64> = due.iter().map(|e| e.run_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn higher_priority_first_at_same_time() {
        let mut queue = TriggerQueue::new();
        queue.push(1, 100, 1);
        queue.push(2, 100, 9);
        queue.push(3, 100, 5);
        let due = queue.pop_due(100);
        let ids: Vec<i64> = due.iter().map(|e| e.run_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn future_entries_stay_queued() {
        let mut queue = TriggerQueue::new();
        queue.push(1, 100, 0);
        queue.push(2, 500, 0);
        let due = queue.pop_due(200);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].run_id, 1);
        assert_eq!(queue.next_trigger_time(), Some(500));
        assert_eq!(queue.len(), 1);
    }
}
