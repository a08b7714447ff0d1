//! Fleet completion tracking.
//!
//! The barrier is owned by the fleet task and only mutated from its event
//! loop, so it needs no locking. `on_bot_finished` hands back a
//! `FleetSummary` exactly once: on the call that completes the last bot.

use std::collections::{BTreeMap, BTreeSet};

use crate::bot::BotExit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Collecting,
    Complete,
}

/// What happened to a completion signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Counted; the fleet is still running.
    Counted { completed: usize, total: usize },
    /// Counted, and it was the last one.
    Complete(FleetSummary),
    /// Duplicate, out of range, or arrived after completion.
    Ignored,
}

/// Outcome of a whole fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSummary {
    pub total: usize,
    /// Exit of every bot, by index.
    pub exits: Vec<(usize, BotExit)>,
}

impl FleetSummary {
    pub fn abnormal(&self) -> usize {
        self.exits.iter().filter(|(_, exit)| !exit.is_success()).count()
    }
}

#[derive(Debug)]
pub struct CompletionBarrier {
    total: usize,
    launched: BTreeSet<usize>,
    finished: BTreeMap<usize, BotExit>,
    state: BarrierState,
}

impl CompletionBarrier {
    /// A barrier over `total` bots. With `total == 0` it never completes.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            launched: BTreeSet::new(),
            finished: BTreeMap::new(),
            state: BarrierState::Collecting,
        }
    }

    /// Records a launch. False for out-of-range or already launched bots.
    pub fn mark_launched(&mut self, index: usize) -> bool {
        index < self.total && self.launched.insert(index)
    }

    pub fn on_bot_finished(&mut self, index: usize, exit: BotExit) -> Progress {
        if self.state == BarrierState::Complete || index >= self.total {
            return Progress::Ignored;
        }
        if self.finished.contains_key(&index) {
            return Progress::Ignored;
        }
        self.finished.insert(index, exit);

        let completed = self.finished.len();
        if completed < self.total {
            return Progress::Counted {
                completed,
                total: self.total,
            };
        }
        self.state = BarrierState::Complete;
        Progress::Complete(FleetSummary {
            total: self.total,
            exits: self
                .finished
                .iter()
                .map(|(index, exit)| (*index, exit.clone()))
                .collect(),
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> BarrierState {
        self.state
    }

    pub fn completed(&self) -> usize {
        self.finished.len()
    }

    pub fn launched(&self) -> usize {
        self.launched.len()
    }

    /// Bots that were launched and have not finished yet.
    pub fn running(&self) -> impl Iterator<Item = usize> + '_ {
        self.launched
            .iter()
            .copied()
            .filter(|index| !self.finished.contains_key(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> BotExit {
        BotExit::Exited { code: Some(0) }
    }

    fn completions(barrier: &mut CompletionBarrier, order: &[usize]) -> usize {
        order
            .iter()
            .filter(|index| matches!(barrier.on_bot_finished(**index, ok()), Progress::Complete(_)))
            .count()
    }

    fn permutations(items: Vec<usize>) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items];
        }
        let mut out = Vec::new();
        for (pos, item) in items.iter().enumerate() {
            let mut rest = items.clone();
            rest.remove(pos);
            for mut tail in permutations(rest) {
                tail.insert(0, *item);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn fires_once_for_every_order() {
        for order in permutations(vec![0, 1, 2, 3]) {
            let mut barrier = CompletionBarrier::new(4);
            let mut fired_at = None;
            for (step, index) in order.iter().enumerate() {
                if let Progress::Complete(_) = barrier.on_bot_finished(*index, ok()) {
                    assert!(fired_at.is_none());
                    fired_at = Some(step);
                }
            }
            assert_eq!(fired_at, Some(3), "order {:?}", order);
            assert_eq!(barrier.state(), BarrierState::Complete);
        }
    }

    #[test]
    fn duplicates_and_strays_do_not_count() {
        let mut barrier = CompletionBarrier::new(3);
        assert_eq!(
            barrier.on_bot_finished(1, ok()),
            Progress::Counted { completed: 1, total: 3 }
        );
        assert_eq!(barrier.on_bot_finished(1, ok()), Progress::Ignored);
        assert_eq!(barrier.on_bot_finished(7, ok()), Progress::Ignored);
        assert_eq!(barrier.completed(), 1);
        assert_eq!(completions(&mut barrier, &[0, 2, 2, 0]), 1);
        assert_eq!(barrier.on_bot_finished(0, ok()), Progress::Ignored);
    }

    #[test]
    fn empty_fleet_never_completes() {
        let mut barrier = CompletionBarrier::new(0);
        assert_eq!(barrier.on_bot_finished(0, ok()), Progress::Ignored);
        assert_eq!(barrier.state(), BarrierState::Collecting);
    }

    #[test]
    fn completion_before_later_launches() {
        let mut barrier = CompletionBarrier::new(3);
        assert!(barrier.mark_launched(0));
        assert!(!barrier.mark_launched(0));
        assert!(!barrier.mark_launched(3));
        assert!(matches!(barrier.on_bot_finished(0, ok()), Progress::Counted { .. }));
        barrier.mark_launched(1);
        barrier.mark_launched(2);
        assert_eq!(barrier.running().collect::<Vec<_>>(), vec![1, 2]);
        assert!(matches!(barrier.on_bot_finished(2, ok()), Progress::Counted { .. }));
        assert!(matches!(barrier.on_bot_finished(1, ok()), Progress::Complete(_)));
    }

    #[test]
    fn abnormal_exits_still_complete() {
        let mut barrier = CompletionBarrier::new(2);
        barrier.on_bot_finished(0, BotExit::Exited { code: Some(1) });
        let Progress::Complete(summary) = barrier.on_bot_finished(
            1,
            BotExit::Failed {
                error: "spawn failed".into(),
            },
        ) else {
            panic!("expected completion");
        };
        assert_eq!(summary.total, 2);
        assert_eq!(summary.abnormal(), 2);
        assert_eq!(summary.exits[0].0, 0);
    }
}
