// OpDescriptor — One deferred computation
//
// A descriptor bundles everything the engine needs to order and run an
// operation: a name (used in logs, errors and profiles), the vars it reads,
// the vars it writes, the device it targets and the kernel closure itself.
//
// The kernel is opaque. It receives a RunContext naming the lane it runs on
// and returns Ok(()) or an error; anything it captures (buffers, shapes,
// scalars) is its own business.

use std::fmt;
use std::sync::Arc;

use tessera_core::{Device, Result};

use crate::var::Var;

/// The deferred work of an operation.
pub type Kernel = Box<dyn FnOnce(&RunContext) -> Result<()> + Send + 'static>;

/// Which family of lanes on a device should run an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LaneKind {
    /// Regular compute work.
    #[default]
    Compute,
    /// Memory transfers between devices. GPUs keep these on dedicated copy
    /// lanes so transfers overlap with compute; on the CPU they share the
    /// worker pool.
    Copy,
}

/// Identity of one execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneId {
    pub device: Device,
    pub kind: LaneKind,
    pub index: usize,
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LaneKind::Compute => "compute",
            LaneKind::Copy => "copy",
        };
        write!(f, "{}/{}#{}", self.device, kind, self.index)
    }
}

/// Passed to every kernel: where it is running.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    lane: LaneId,
}

impl RunContext {
    pub(crate) fn new(lane: LaneId) -> Self {
        RunContext { lane }
    }

    pub fn device(&self) -> Device {
        self.lane.device
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }
}

/// A deferred operation ready to be submitted to an [`Engine`](crate::Engine).
///
/// ```ignore
/// let op = OpDescriptor::new("axpy", Device::cpu(), move |_ctx| {
///     // read x, update y
///     Ok(())
/// })
/// .read(&x_var)
/// .write(&y_var);
/// engine.submit(op)?;
/// ```
pub struct OpDescriptor {
    pub(crate) name: String,
    pub(crate) device: Device,
    pub(crate) lane: LaneKind,
    pub(crate) reads: Vec<Arc<Var>>,
    pub(crate) writes: Vec<Arc<Var>>,
    pub(crate) kernel: Kernel,
}

impl OpDescriptor {
    pub fn new<F>(name: impl Into<String>, device: Device, kernel: F) -> Self
    where
        F: FnOnce(&RunContext) -> Result<()> + Send + 'static,
    {
        OpDescriptor {
            name: name.into(),
            device,
            lane: LaneKind::Compute,
            reads: Vec::new(),
            writes: Vec::new(),
            kernel: Box::new(kernel),
        }
    }

    /// Add a var to the read set.
    pub fn read(mut self, var: &Arc<Var>) -> Self {
        self.reads.push(Arc::clone(var));
        self
    }

    /// Add a var to the write set.
    pub fn write(mut self, var: &Arc<Var>) -> Self {
        self.writes.push(Arc::clone(var));
        self
    }

    pub fn reads<'a>(mut self, vars: impl IntoIterator<Item = &'a Arc<Var>>) -> Self {
        self.reads.extend(vars.into_iter().cloned());
        self
    }

    pub fn writes<'a>(mut self, vars: impl IntoIterator<Item = &'a Arc<Var>>) -> Self {
        self.writes.extend(vars.into_iter().cloned());
        self
    }

    /// Run on the given lane family (compute by default).
    pub fn on_lane(mut self, lane: LaneKind) -> Self {
        self.lane = lane;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Collapse duplicate vars. A var that is both read and written is
    /// treated as written only.
    pub(crate) fn normalize(&mut self) {
        self.writes.sort_by_key(|v| v.id());
        self.writes.dedup_by_key(|v| v.id());
        let writes = &self.writes;
        self.reads
            .retain(|r| writes.binary_search_by_key(&r.id(), |w| w.id()).is_err());
        self.reads.sort_by_key(|v| v.id());
        self.reads.dedup_by_key(|v| v.id());
    }
}

impl fmt::Debug for OpDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDescriptor")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("lane", &self.lane)
            .field("reads", &self.reads.iter().map(|v| v.id()).collect::<Vec<_>>())
            .field("writes", &self.writes.iter().map(|v| v.id()).collect::<Vec<_>>())
            .finish()
    }
}
