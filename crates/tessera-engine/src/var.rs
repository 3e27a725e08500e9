// Var — Resource identity tracked by the engine
//
// A Var stands for one block of device memory (the backing buffer of an
// NDArray). The engine never sees the memory itself, only the Var, and uses
// it to order operations:
//
//   last_writer — the most recently submitted operation that writes the var
//   readers     — operations submitted after last_writer that read the var
//
// A new reader depends on last_writer (read-after-write). A new writer
// depends on last_writer (write-after-write) and on every reader
// (write-after-read), then replaces last_writer and clears readers.
//
// Each Var carries its own lock; there is no engine-wide graph lock.
// Finished nodes are pruned lazily the next time the var is touched, except
// a failed last writer, which stays so later readers inherit the failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::Node;

/// Unique identifier for a Var. Also defines the global lock order used
/// when one submission touches several vars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

impl VarId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        VarId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Dependency bookkeeping for one var, guarded by the var's lock.
#[derive(Default)]
pub(crate) struct VarDeps {
    pub(crate) last_writer: Option<Arc<Node>>,
    pub(crate) readers: Vec<Arc<Node>>,
}

impl VarDeps {
    /// Drop references to operations that no longer constrain anything.
    pub(crate) fn prune(&mut self) {
        if self
            .last_writer
            .as_ref()
            .is_some_and(|w| w.state().is_completed())
        {
            self.last_writer = None;
        }
        self.readers.retain(|r| !r.state().is_terminal());
    }
}

/// A resource whose accesses are ordered by the engine.
///
/// Create one per buffer with [`Var::new`] and list it in the read or write
/// set of every [`OpDescriptor`](crate::OpDescriptor) that touches the
/// buffer.
pub struct Var {
    id: VarId,
    version: AtomicU64,
    pub(crate) deps: Mutex<VarDeps>,
}

impl Var {
    pub fn new() -> Arc<Var> {
        Arc::new(Var {
            id: VarId::next(),
            version: AtomicU64::new(0),
            deps: Mutex::new(VarDeps::default()),
        })
    }

    pub fn id(&self) -> VarId {
        self.id
    }

    /// Number of write operations on this var that completed successfully.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether any submitted operation on this var has not finished yet.
    pub fn has_pending(&self) -> bool {
        let deps = self.deps.lock();
        deps.last_writer
            .as_ref()
            .is_some_and(|w| !w.state().is_terminal())
            || deps.readers.iter().any(|r| !r.state().is_terminal())
    }
}

impl std::fmt::Debug for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.id.0)
            .field("version", &self.version())
            .finish()
    }
}
