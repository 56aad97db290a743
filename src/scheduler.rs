//! # Tick Scheduler
//!
//! Fixed pool of solver threads driven once per tick by the coordinator
//! (the thread calling `run_tick`).
//!
//! ## Protocol
//!
//! 1. The coordinator owns the `TickFrame` (agent snapshots plus kd-tree) and
//!    rebuilds it single-threaded.
//! 2. The frame is frozen behind an `Arc` and every worker gets its own
//!    `Compute` command with a contiguous agent range. The coordinator solves
//!    range 0 itself.
//! 3. Each worker sends exactly one report back and drops its frame handle
//!    first. The coordinator waits for one report per dispatched command.
//! 4. With all handles gone the coordinator takes the frame back for the next
//!    tick, so the agent buffer and node arena are reused.
//!
//! Workers never write shared state. They return velocities for their range
//! and the coordinator writes them into the result vector, so slices cannot
//! overlap.

use crate::kdtree::KdTree;
use crate::orca::{compute_new_velocity, SolverScratch};
use crate::structs::{AgentCategory, AgentState, Vector3D};
use log::{debug, error};
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Everything the solvers read during one tick.
#[derive(Debug, Clone, Default)]
pub struct TickFrame {
    pub agents: Vec<AgentState>,
    pub tree: KdTree,
}

impl TickFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grows the node arena if needed and rebuilds the kd-tree, reordering
    /// `agents` in place.
    pub fn rebuild_index(&mut self) {
        self.tree.reserve_for(self.agents.len());
        self.tree.build(&mut self.agents);
    }
}

enum WorkerCommand {
    Compute { frame: Arc<TickFrame>, range: Range<usize> },
    Exit,
}

struct WorkerReport {
    worker: usize,
    range: Range<usize>,
    velocities: Vec<Option<Vector3D>>,
}

struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

/// Splits `count` agents into one contiguous range per thread. Every range
/// gets `count / threads` agents; the last one also takes the remainder.
pub fn partition_agents(count: usize, threads: usize) -> Vec<Range<usize>> {
    let threads = threads.max(1);
    let per_thread = count / threads;
    (0..threads)
        .map(|k| {
            let start = k * per_thread;
            let end = if k == threads - 1 { count } else { start + per_thread };
            start..end
        })
        .collect()
}

/// Solves every Reciprocal agent in `range`. OneSided agents yield `None`.
fn solve_range(frame: &TickFrame, range: Range<usize>, scratch: &mut SolverScratch, out: &mut Vec<Option<Vector3D>>) {
    out.clear();
    for index in range {
        if frame.agents[index].category() == AgentCategory::OneSided {
            out.push(None);
        } else {
            out.push(Some(compute_new_velocity(index, &frame.agents, &frame.tree, scratch)));
        }
    }
}

fn worker_loop(worker: usize, commands: Receiver<WorkerCommand>, reports: Sender<WorkerReport>) {
    let mut scratch = SolverScratch::new();

    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Compute { frame, range } => {
                let mut velocities = Vec::with_capacity(range.len());
                let solved = panic::catch_unwind(AssertUnwindSafe(|| {
                    solve_range(&frame, range.clone(), &mut scratch, &mut velocities)
                }));
                if solved.is_err() {
                    error!("solver worker {} panicked; {} agents keep their previous velocities", worker, range.len());
                    velocities.clear();
                    velocities.resize(range.len(), None);
                    scratch = SolverScratch::new();
                }
                // Release the frame before the coordinator is told we are done
                drop(frame);

                if reports.send(WorkerReport { worker, range, velocities }).is_err() {
                    break;
                }
            }
            WorkerCommand::Exit => break,
        }
    }
}

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    reports: Receiver<WorkerReport>,
    scratch: SolverScratch,
    partitions: Vec<Range<usize>>,
    partitioned_for: Option<usize>,
}

impl WorkerPool {
    /// Starts `thread_count - 1` background workers; the coordinator is the
    /// remaining thread. Workers that fail to spawn are logged and their
    /// share falls to the others.
    pub fn new(thread_count: usize) -> Self {
        let (report_tx, reports) = mpsc::channel();
        let mut workers = Vec::new();

        for k in 1..thread_count.max(1) {
            let (commands, command_rx) = mpsc::channel();
            let report_tx = report_tx.clone();
            // Worker ids follow successful spawns so partitions stay contiguous
            let worker = workers.len() + 1;
            let spawned = thread::Builder::new()
                .name(format!("orca-worker-{}", worker))
                .spawn(move || worker_loop(worker, command_rx, report_tx));
            match spawned {
                Ok(handle) => workers.push(WorkerHandle {
                    commands,
                    thread: Some(handle),
                }),
                Err(err) => error!("failed to spawn solver worker {}: {}", k, err),
            }
        }

        WorkerPool {
            workers,
            reports,
            scratch: SolverScratch::new(),
            partitions: Vec::new(),
            partitioned_for: None,
        }
    }

    /// Solving threads, coordinator included.
    pub fn thread_count(&self) -> usize {
        self.workers.len() + 1
    }

    pub fn partitions(&self) -> &[Range<usize>] {
        &self.partitions
    }

    /// Recomputes the per-thread ranges if the agent count changed.
    pub fn repartition(&mut self, agent_count: usize) {
        if self.partitioned_for == Some(agent_count) {
            return;
        }
        self.partitions = partition_agents(agent_count, self.thread_count());
        self.partitioned_for = Some(agent_count);
        debug!(
            "repartitioned {} agents over {} threads: {:?}",
            agent_count,
            self.thread_count(),
            self.partitions
        );
    }

    /// Solves one tick over a frame whose index is already built.
    ///
    /// Returns the frame for reuse and one entry per agent, aligned with
    /// `frame.agents`: `Some` for each solved Reciprocal agent, `None` for
    /// OneSided agents and for slices whose worker was lost.
    pub fn run_tick(&mut self, frame: TickFrame) -> (TickFrame, Vec<Option<Vector3D>>) {
        let count = frame.agents.len();
        self.repartition(count);

        let frame = Arc::new(frame);
        let mut results: Vec<Option<Vector3D>> = vec![None; count];

        // Fan out
        let mut dispatched = 0;
        for (k, worker) in self.workers.iter().enumerate() {
            let range = self.partitions[k + 1].clone();
            if range.is_empty() {
                continue;
            }
            let len = range.len();
            let command = WorkerCommand::Compute {
                frame: Arc::clone(&frame),
                range,
            };
            if worker.commands.send(command).is_err() {
                error!("solver worker {} is gone; {} agents keep their previous velocities", k + 1, len);
            } else {
                dispatched += 1;
            }
        }

        // Coordinator share
        let own_range = self.partitions[0].clone();
        let mut own = Vec::with_capacity(own_range.len());
        solve_range(&frame, own_range.clone(), &mut self.scratch, &mut own);
        results[own_range].copy_from_slice(&own);

        // Barrier
        for _ in 0..dispatched {
            match self.reports.recv() {
                Ok(report) => {
                    if report.velocities.len() == report.range.len() {
                        results[report.range].copy_from_slice(&report.velocities);
                    } else {
                        error!("solver worker {} returned a malformed report", report.worker);
                    }
                }
                Err(_) => {
                    error!("all solver workers disconnected during a tick");
                    break;
                }
            }
        }

        (Arc::unwrap_or_clone(frame), results)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.commands.send(WorkerCommand::Exit);
        }
        for (k, worker) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    error!("solver worker {} terminated abnormally", k + 1);
                }
            }
        }
    }
}
