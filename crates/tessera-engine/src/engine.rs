// Engine — Dependency-tracking asynchronous executor
//
// The engine accepts OpDescriptors, orders them by their read/write sets and
// runs each one as soon as everything it depends on has finished:
//
//   submit(op)    non-blocking; wires edges and returns an OpHandle
//   wait_for(v)   blocks until the last submitted writer of v finished
//   wait_to_write(v)  additionally waits for the pending readers of v
//   wait_all()    blocks until nothing is in flight
//
// SUBMISSION
//
//   A submission locks every var it touches in ascending VarId order and
//   holds those locks while wiring edges. Two concurrent submissions that
//   share vars are therefore ordered the same way on every shared var, so
//   edges can never form a cycle, and submissions on disjoint vars never
//   contend.
//
// LIFETIME
//
//   `Engine` is a cheap handle. The lanes stop when `shutdown()` is called
//   or the last handle is dropped; either way, work already submitted is
//   drained first. Work that reaches a stopped lane fails with
//   EngineShutdown instead of being dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tessera_core::{Device, DeviceKind, Error, Result};

use crate::config::EngineConfig;
use crate::dispatch::{self, Dispatcher};
use crate::node::{EdgeKind, Node, NodeState};
use crate::op::OpDescriptor;
use crate::profiler::{ProfileReport, Profiler};
use crate::var::Var;

// Counters

/// Snapshot of the engine's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Operations accepted by `submit`.
    pub submitted: u64,
    /// Operations whose kernel ran successfully.
    pub completed: u64,
    /// Operations that failed or inherited a failure.
    pub failed: u64,
    /// Operations submitted but not yet finished.
    pub in_flight: usize,
}

// Shared state (owned jointly by the handle and every live node)

pub(crate) struct Shared {
    config: EngineConfig,
    dispatcher: Dispatcher,
    profiler: Option<Profiler>,
    next_seq: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    unobserved: Mutex<Option<Error>>,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn dispatch(&self, node: Arc<Node>) {
        self.dispatcher.dispatch(node);
    }

    pub(crate) fn profiler(&self) -> Option<&Profiler> {
        self.profiler.as_ref()
    }

    pub(crate) fn on_finished(&self, result: &Result<()>) {
        match result {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let mut slot = self.unobserved.lock();
                if slot.is_none() {
                    *slot = Some(e.clone());
                }
            }
        }
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock();
        while self.in_flight.load(Ordering::Acquire) != 0 {
            self.idle.wait(&mut guard);
        }
    }

    fn check_device(&self, device: Device) -> Result<()> {
        let ok = match device.kind() {
            DeviceKind::Cpu => device.index() == 0,
            DeviceKind::Gpu => device.index() < self.config.gpus,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::DeviceNotFound(device))
        }
    }
}

// Public handles

/// Handle to a submitted operation.
#[derive(Clone)]
pub struct OpHandle {
    node: Arc<Node>,
}

impl OpHandle {
    /// Submission sequence number (unique per engine, increasing).
    pub fn seq(&self) -> u64 {
        self.node.seq()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn state(&self) -> NodeState {
        self.node.state()
    }

    pub fn is_done(&self) -> bool {
        self.node.state().is_terminal()
    }

    /// Block until the operation finished; return its outcome.
    pub fn wait(&self) -> Result<()> {
        self.node.wait()
    }

    /// The outcome, if the operation already finished.
    pub fn try_outcome(&self) -> Option<Result<()>> {
        self.node.outcome()
    }
}

impl std::fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpHandle")
            .field("seq", &self.node.seq())
            .field("name", &self.node.name())
            .field("state", &self.node.state())
            .finish()
    }
}

struct EngineInner {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl EngineInner {
    fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if dispatch::on_lane() {
            // The last handle was dropped by a kernel: waiting here would
            // wait on ourselves. Stop the lanes and let them exit on their own;
            // anything not yet run is aborted.
            log::warn!("engine released from inside a kernel; ops not yet queued are aborted");
            self.shared.dispatcher.stop_lanes();
            return;
        }
        self.shared.wait_idle();
        self.shared.dispatcher.stop_lanes();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        log::info!("tessera engine shut down");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The dependency engine. Cloning yields another handle to the same engine.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use tessera_core::Device;
/// use tessera_engine::{Engine, EngineConfig, OpDescriptor, Var};
///
/// let engine = Engine::new(EngineConfig::default().cpu_workers(2)).unwrap();
/// let var = Var::new();
/// let cell = Arc::new(Mutex::new(0));
///
/// let c = cell.clone();
/// engine
///     .submit(OpDescriptor::new("set", Device::cpu(), move |_| {
///         *c.lock() = 42;
///         Ok(())
///     }).write(&var))
///     .unwrap();
///
/// engine.wait_for(&var).unwrap();
/// assert_eq!(*cell.lock(), 42);
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Validate `config` and start the engine's lanes.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (dispatcher, workers) = Dispatcher::new(&config)?;
        log::info!(
            "tessera engine started: {:?}, {} cpu lanes, {} gpus ({} compute + {} copy lanes each)",
            config.kind,
            config.cpu_workers,
            config.gpus,
            config.gpu_compute_lanes,
            config.gpu_copy_lanes
        );
        let profiler = config.profiling.then(Profiler::new);
        let shared = Arc::new(Shared {
            config,
            dispatcher,
            profiler,
            next_seq: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            unobserved: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        Ok(Engine {
            inner: Arc::new(EngineInner {
                shared,
                workers: Mutex::new(workers),
            }),
        })
    }

    /// Engine built from [`EngineConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Self::new(EngineConfig::from_env()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    /// Whether two handles refer to the same engine.
    pub fn same_engine(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create a fresh var. Equivalent to [`Var::new`].
    pub fn new_var(&self) -> Arc<Var> {
        Var::new()
    }

    /// Queue an operation. Never blocks on execution.
    ///
    /// Fails only if the engine is shut down or has no lanes for the
    /// target device; the kernel's own failure is reported through the
    /// returned handle and every var it writes.
    pub fn submit(&self, mut op: OpDescriptor) -> Result<OpHandle> {
        let shared = &self.inner.shared;
        if shared.shut_down.load(Ordering::Acquire) {
            return Err(Error::EngineShutdown);
        }
        shared.check_device(op.device)?;
        op.normalize();

        let OpDescriptor {
            name,
            device,
            lane,
            reads,
            writes,
            kernel,
        } = op;

        // Lock order: ascending VarId across both sets
        let mut touched: Vec<(&Arc<Var>, bool)> = reads
            .iter()
            .map(|v| (v, false))
            .chain(writes.iter().map(|v| (v, true)))
            .collect();
        touched.sort_by_key(|(v, _)| v.id());

        let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(Node::new(
            seq,
            name,
            device,
            lane,
            kernel,
            reads.clone(),
            writes.clone(),
            Arc::clone(shared),
        ));
        shared.submitted.fetch_add(1, Ordering::Relaxed);
        shared.in_flight.fetch_add(1, Ordering::AcqRel);

        let mut guards = Vec::with_capacity(touched.len());
        for (var, is_write) in &touched {
            let mut deps = var.deps.lock();
            deps.prune();
            if let Some(writer) = &deps.last_writer {
                writer.add_successor(&node, EdgeKind::Data);
            }
            if *is_write {
                for reader in deps.readers.drain(..) {
                    reader.add_successor(&node, EdgeKind::Order);
                }
                deps.last_writer = Some(Arc::clone(&node));
            } else {
                deps.readers.push(Arc::clone(&node));
            }
            guards.push(deps);
        }
        drop(guards);

        log::debug!(
            "submit op #{} '{}' on {} (reads {:?}, writes {:?})",
            seq,
            node.name(),
            device,
            reads.iter().map(|v| v.id().as_u64()).collect::<Vec<_>>(),
            writes.iter().map(|v| v.id().as_u64()).collect::<Vec<_>>()
        );

        // Drop the submission guard; the node may run right away
        node.release();
        Ok(OpHandle { node })
    }

    /// Block until the most recently submitted writer of `var` finished.
    ///
    /// Returns that writer's failure (or the failure it inherited) instead
    /// of hanging when something upstream went wrong. Must not be called
    /// from inside a kernel.
    pub fn wait_for(&self, var: &Var) -> Result<()> {
        let writer = var.deps.lock().last_writer.clone();
        match writer {
            Some(writer) => writer.wait(),
            None => Ok(()),
        }
    }

    /// Like [`wait_for`](Self::wait_for), but also waits for every pending
    /// reader of `var`, after which the buffer may be overwritten directly.
    pub fn wait_to_write(&self, var: &Var) -> Result<()> {
        let (writer, readers) = {
            let deps = var.deps.lock();
            (deps.last_writer.clone(), deps.readers.clone())
        };
        for reader in readers {
            // Write-after-read edges carry no failure
            let _ = reader.wait();
        }
        match writer {
            Some(writer) => writer.wait(),
            None => Ok(()),
        }
    }

    /// Block until every submitted operation finished.
    ///
    /// Returns the first failure recorded since the previous `wait_all`.
    pub fn wait_all(&self) -> Result<()> {
        let shared = &self.inner.shared;
        shared.wait_idle();
        match shared.unobserved.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let shared = &self.inner.shared;
        EngineStats {
            submitted: shared.submitted.load(Ordering::Relaxed),
            completed: shared.completed.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            in_flight: shared.in_flight.load(Ordering::Acquire),
        }
    }

    /// Aggregated kernel timings, if profiling is enabled.
    pub fn profile_report(&self) -> Option<ProfileReport> {
        self.inner.shared.profiler.as_ref().map(|p| p.report())
    }

    /// Drain outstanding work, stop all lanes and join their threads.
    /// Later submissions fail with [`Error::EngineShutdown`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shared.shut_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}
