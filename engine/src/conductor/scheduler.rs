//! Scheduler
//!
//! Orders a batch into a dispatch sequence (priority descending, emission
//! order on ties), splits it into per-kind queues and drives execution.
//!
//! The driver keeps a bounded number of tasks in flight per kind. A task is
//! taken from its queue only once every dependency has a result, success or
//! failure; within a queue the first ready task in sequence order goes next.
//! Results are tagged with their sequence index so the final order never
//! depends on completion order.

use crate::conductor::types::{ExecutorKind, Task, TaskResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use tracing::{debug, warn};

/// A task annotated with its place in the dispatch sequence
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    /// Position in the dispatch sequence; final results are ordered by it
    pub sequence: usize,

    /// Position in the original batch; dependencies refer to it
    pub index: usize,

    pub task: Task,
}

/// Ordered dispatch plan for one batch
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Every task, in dispatch order
    pub sequence: Vec<ScheduledTask>,

    /// Per-kind queues in first-seen kind order, each preserving sequence order
    pub queues: Vec<(ExecutorKind, Vec<ScheduledTask>)>,
}

impl Schedule {
    /// Build the schedule for a batch
    pub fn new(tasks: &[Task]) -> Self {
        let mut order: Vec<usize> = (0..tasks.len()).collect();
        // sort_by is stable, so equal priorities keep emission order
        order.sort_by(|a, b| tasks[*b].priority.cmp(&tasks[*a].priority));

        let sequence: Vec<ScheduledTask> = order
            .into_iter()
            .enumerate()
            .map(|(sequence, index)| ScheduledTask {
                sequence,
                index,
                task: tasks[index].clone(),
            })
            .collect();

        let mut queues: Vec<(ExecutorKind, Vec<ScheduledTask>)> = Vec::new();
        for scheduled in &sequence {
            match queues.iter_mut().find(|(k, _)| k == &scheduled.task.agent) {
                Some((_, queue)) => queue.push(scheduled.clone()),
                None => queues.push((scheduled.task.agent.clone(), vec![scheduled.clone()])),
            }
        }

        Self { sequence, queues }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Run every task through `run`, honoring dependencies and the per-kind
    /// in-flight limit. Returns `(sequence, result)` pairs in completion order.
    pub async fn drive<F, Fut>(self, max_in_flight_per_kind: usize, run: F) -> Vec<(usize, TaskResult)>
    where
        F: Fn(ScheduledTask) -> Fut,
        Fut: Future<Output = TaskResult>,
    {
        let limit = max_in_flight_per_kind.max(1);
        let mut queues: Vec<(ExecutorKind, VecDeque<ScheduledTask>)> = self
            .queues
            .into_iter()
            .map(|(kind, queue)| (kind, queue.into_iter().collect()))
            .collect();

        let mut busy: HashMap<ExecutorKind, usize> = HashMap::new();
        let mut finished: HashSet<usize> = HashSet::new();
        let mut results = Vec::with_capacity(self.sequence.len());
        let mut in_flight = FuturesUnordered::new();

        loop {
            for (kind, queue) in queues.iter_mut() {
                while busy.get(kind).copied().unwrap_or(0) < limit {
                    let ready = queue.iter().position(|s| {
                        s.task.dependencies.iter().all(|d| finished.contains(d))
                    });
                    let Some(position) = ready else { break };
                    let Some(scheduled) = queue.remove(position) else { break };

                    debug!(
                        sequence = scheduled.sequence,
                        index = scheduled.index,
                        kind = %kind,
                        "dispatching task"
                    );
                    *busy.entry(kind.clone()).or_insert(0) += 1;

                    let sequence = scheduled.sequence;
                    let index = scheduled.index;
                    let task_kind = kind.clone();
                    let fut = run(scheduled);
                    in_flight.push(async move { (sequence, index, task_kind, fut.await) });
                }
            }

            let Some((sequence, index, kind, result)) = in_flight.next().await else {
                break;
            };

            finished.insert(index);
            if let Some(count) = busy.get_mut(&kind) {
                *count = count.saturating_sub(1);
            }
            results.push((sequence, result));
        }

        // Only reachable with dependencies that bypassed validation
        for (_, queue) in queues {
            for scheduled in queue {
                warn!(
                    index = scheduled.index,
                    "task dependencies can never be satisfied"
                );
                results.push((
                    scheduled.sequence,
                    TaskResult::failure(scheduled.task, "unsatisfiable dependency"),
                ));
            }
        }

        results
    }
}
