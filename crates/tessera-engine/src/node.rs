// Node — A submitted operation inside the dependency graph
//
// Life cycle:
//
//   Pending ──(last predecessor finished)──► Ready ──(lane picks it up)──►
//   Running ──► Completed | Failed
//
// `pending` counts unfinished predecessors plus one submission guard, so a
// node cannot become ready while the engine is still wiring its edges.
//
// When a node finishes it publishes its outcome, wakes waiters, and
// notifies every successor. A failed node still notifies: successors reached
// through a data edge inherit the failure and skip their kernel, so the
// graph drains instead of deadlocking.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tessera_core::{Device, Error, Result};

use crate::engine::Shared;
use crate::op::{Kernel, LaneKind, RunContext};
use crate::var::Var;

/// Execution state of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Pending = 0,
    Ready = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeState::Pending,
            1 => NodeState::Ready,
            2 => NodeState::Running,
            3 => NodeState::Completed,
            _ => NodeState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed)
    }

    pub fn is_completed(&self) -> bool {
        *self == NodeState::Completed
    }
}

/// Why a successor waits on a predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeKind {
    /// The successor consumes or overwrites what the predecessor wrote
    /// (read-after-write, write-after-write). Failures flow along it.
    Data,
    /// The successor overwrites what the predecessor reads
    /// (write-after-read). Ordering only.
    Order,
}

struct Links {
    successors: Vec<(Arc<Node>, EdgeKind)>,
    inherited: Option<Error>,
    outcome: Option<Result<()>>,
}

struct Accesses {
    reads: Vec<Arc<Var>>,
    writes: Vec<Arc<Var>>,
}

pub(crate) struct Node {
    seq: u64,
    name: String,
    device: Device,
    lane: LaneKind,
    state: AtomicU8,
    pending: AtomicUsize,
    kernel: Mutex<Option<Kernel>>,
    accesses: Mutex<Accesses>,
    links: Mutex<Links>,
    done: Condvar,
    shared: Arc<Shared>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        seq: u64,
        name: String,
        device: Device,
        lane: LaneKind,
        kernel: Kernel,
        reads: Vec<Arc<Var>>,
        writes: Vec<Arc<Var>>,
        shared: Arc<Shared>,
    ) -> Self {
        Node {
            seq,
            name,
            device,
            lane,
            state: AtomicU8::new(NodeState::Pending as u8),
            pending: AtomicUsize::new(1),
            kernel: Mutex::new(Some(kernel)),
            accesses: Mutex::new(Accesses { reads, writes }),
            links: Mutex::new(Links {
                successors: Vec::new(),
                inherited: None,
                outcome: None,
            }),
            done: Condvar::new(),
            shared,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn device(&self) -> Device {
        self.device
    }

    pub(crate) fn lane_kind(&self) -> LaneKind {
        self.lane
    }

    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    // Graph wiring

    /// Make `succ` wait for this node.
    ///
    /// If this node already finished, no edge is needed; a failure is
    /// handed over immediately when the edge would have carried it.
    pub(crate) fn add_successor(&self, succ: &Arc<Node>, kind: EdgeKind) {
        let mut links = self.links.lock();
        match &links.outcome {
            None => {
                succ.pending.fetch_add(1, Ordering::AcqRel);
                links.successors.push((Arc::clone(succ), kind));
            }
            Some(Ok(())) => {}
            Some(Err(e)) => {
                if kind == EdgeKind::Data {
                    succ.inherit(e);
                }
            }
        }
    }

    /// Record an upstream failure. The first one wins.
    fn inherit(&self, upstream: &Error) {
        let mut links = self.links.lock();
        if links.inherited.is_none() {
            log::debug!(
                "op #{} '{}' inherits upstream failure: {}",
                self.seq,
                self.name,
                upstream
            );
            links.inherited = Some(upstream.propagate_to(&self.name));
        }
    }

    /// Drop one predecessor (or the submission guard). The node that reaches
    /// zero becomes ready and is handed to the dispatcher.
    pub(crate) fn release(self: &Arc<Self>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(NodeState::Ready);
            self.shared.dispatch(Arc::clone(self));
        }
    }

    // Execution

    /// Run the node on the current lane and publish its outcome.
    pub(crate) fn run(self: &Arc<Self>, ctx: &RunContext) {
        self.set_state(NodeState::Running);
        let inherited = self.links.lock().inherited.take();
        let kernel = self.kernel.lock().take();
        let started = Instant::now();

        let result = match (inherited, kernel) {
            (Some(err), _) => Err(err),
            (None, Some(kernel)) => invoke(&self.name, kernel, ctx),
            (None, None) => Err(Error::msg(format!("op '{}' has no kernel", self.name))),
        };

        if let Some(profiler) = self.shared.profiler() {
            profiler.record(&self.name, ctx.lane(), started.elapsed());
        }
        self.finish(result);
    }

    /// Publish `result` without running the kernel.
    pub(crate) fn abort(self: &Arc<Self>, err: Error) {
        self.set_state(NodeState::Running);
        self.kernel.lock().take();
        self.finish(Err(err));
    }

    fn finish(self: &Arc<Self>, result: Result<()>) {
        let accesses = mem::replace(
            &mut *self.accesses.lock(),
            Accesses {
                reads: Vec::new(),
                writes: Vec::new(),
            },
        );
        match &result {
            Ok(()) => {
                for var in &accesses.writes {
                    var.bump_version();
                }
            }
            Err(Error::DependencyPropagated { .. }) => {}
            Err(e) => log::warn!("op #{} '{}' failed: {}", self.seq, self.name, e),
        }
        drop(accesses);

        let successors = {
            let mut links = self.links.lock();
            links.outcome = Some(result.clone());
            self.set_state(if result.is_ok() {
                NodeState::Completed
            } else {
                NodeState::Failed
            });
            self.done.notify_all();
            mem::take(&mut links.successors)
        };

        for (succ, kind) in successors {
            if let Err(e) = &result {
                if kind == EdgeKind::Data {
                    succ.inherit(e);
                }
            }
            succ.release();
        }

        self.shared.on_finished(&result);
    }

    // Synchronization

    /// Block until the node is terminal and return its outcome.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut links = self.links.lock();
        loop {
            if let Some(outcome) = &links.outcome {
                return outcome.clone();
            }
            self.done.wait(&mut links);
        }
    }

    /// The outcome, if the node is terminal.
    pub(crate) fn outcome(&self) -> Option<Result<()>> {
        self.links.lock().outcome.clone()
    }
}

/// Call a kernel, turning both returned errors and panics into
/// `KernelExecution` failures.
fn invoke(name: &str, kernel: Kernel, ctx: &RunContext) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| kernel(ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into_kernel_error(name)),
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "kernel panicked".to_string()
            };
            Err(Error::KernelExecution {
                op: name.to_string(),
                message,
            })
        }
    }
}
