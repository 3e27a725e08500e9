// Dispatcher — Maps ready operations onto execution lanes
//
// A lane is one worker thread draining a FIFO channel. Work sent to the same
// lane runs in the order it was dispatched; different lanes run in parallel.
//
//   cpu(0)  : cpu_workers lanes            (compute and copy share them)
//   gpu(i)  : gpu_compute_lanes lanes      (compute)
//             gpu_copy_lanes lanes         (copy)
//
// Within a lane family, operations are spread round-robin. The dispatcher
// never orders anything itself: by the time a node arrives here, all of its
// dependencies have finished.
//
// Lanes are spawned once at engine construction and stopped by an explicit
// Shutdown message. On Shutdown a lane closes its sender, then aborts with
// EngineShutdown whatever is still queued behind the message. Nodes that
// become ready after that are aborted by `dispatch`.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tessera_core::{Device, DeviceKind, Error, Result};

use crate::config::{EngineConfig, EngineKind};
use crate::node::Node;
use crate::op::{LaneId, LaneKind, RunContext};

enum LaneMsg {
    Run(Arc<Node>),
    Shutdown,
}

/// The sending side of a lane; `None` once the lane has closed.
type LaneTx = Arc<Mutex<Option<mpsc::Sender<LaneMsg>>>>;

/// One serial execution context.
struct Lane {
    id: LaneId,
    tx: LaneTx,
}

/// Lanes of one family with a round-robin cursor.
struct LanePool {
    lanes: Vec<Lane>,
    next: AtomicUsize,
}

impl LanePool {
    fn spawn(
        device: Device,
        kind: LaneKind,
        count: usize,
        handles: &mut Vec<thread::JoinHandle<()>>,
    ) -> Result<Self> {
        let mut lanes = Vec::with_capacity(count);
        for index in 0..count {
            let id = LaneId {
                device,
                kind,
                index,
            };
            let (tx, rx) = mpsc::channel::<LaneMsg>();
            let tx: LaneTx = Arc::new(Mutex::new(Some(tx)));
            let own_tx = Arc::clone(&tx);
            let handle = thread::Builder::new()
                .name(format!("tessera-{id}"))
                .spawn(move || lane_main(id, rx, own_tx))?;
            handles.push(handle);
            lanes.push(Lane { id, tx });
        }
        Ok(LanePool {
            lanes,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self) -> &Lane {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        &self.lanes[i]
    }
}

struct GpuLanes {
    compute: LanePool,
    copy: LanePool,
}

pub(crate) enum Dispatcher {
    /// Run inline on whichever thread made the node ready.
    Naive,
    Threaded {
        cpu: LanePool,
        gpus: Vec<GpuLanes>,
    },
}

impl Dispatcher {
    /// Build the dispatcher for `config`, spawning lane threads if needed.
    pub(crate) fn new(config: &EngineConfig) -> Result<(Self, Vec<thread::JoinHandle<()>>)> {
        let mut handles = Vec::new();
        if config.kind == EngineKind::Naive {
            return Ok((Dispatcher::Naive, handles));
        }

        let cpu = LanePool::spawn(
            Device::cpu(),
            LaneKind::Compute,
            config.cpu_workers,
            &mut handles,
        )?;
        let mut gpus = Vec::with_capacity(config.gpus);
        for i in 0..config.gpus {
            let device = Device::gpu(i);
            gpus.push(GpuLanes {
                compute: LanePool::spawn(
                    device,
                    LaneKind::Compute,
                    config.gpu_compute_lanes,
                    &mut handles,
                )?,
                copy: LanePool::spawn(device, LaneKind::Copy, config.gpu_copy_lanes, &mut handles)?,
            });
        }
        Ok((Dispatcher::Threaded { cpu, gpus }, handles))
    }

    /// Hand a ready node to a lane.
    pub(crate) fn dispatch(&self, node: Arc<Node>) {
        match self {
            Dispatcher::Naive => {
                let ctx = RunContext::new(LaneId {
                    device: node.device(),
                    kind: node.lane_kind(),
                    index: 0,
                });
                node.run(&ctx);
            }
            Dispatcher::Threaded { cpu, gpus } => {
                let device = node.device();
                let pool = match device.kind() {
                    DeviceKind::Cpu => Some(cpu),
                    DeviceKind::Gpu => gpus.get(device.index()).map(|g| match node.lane_kind() {
                        LaneKind::Compute => &g.compute,
                        LaneKind::Copy => &g.copy,
                    }),
                };
                let Some(pool) = pool else {
                    node.abort(Error::DeviceNotFound(device));
                    return;
                };
                let lane = pool.pick();
                log::trace!("dispatch op #{} '{}' -> {}", node.seq(), node.name(), lane.id);
                let rejected = match lane.tx.lock().as_ref() {
                    Some(tx) => match tx.send(LaneMsg::Run(node)) {
                        Ok(()) => None,
                        Err(mpsc::SendError(LaneMsg::Run(node))) => Some(node),
                        Err(mpsc::SendError(LaneMsg::Shutdown)) => None,
                    },
                    None => Some(node),
                };
                // Aborting releases successors, which dispatch again: the lane
                // lock must not be held here.
                if let Some(node) = rejected {
                    node.abort(Error::EngineShutdown);
                }
            }
        }
    }

    /// Ask every lane to stop after the work already queued on it.
    pub(crate) fn stop_lanes(&self) {
        if let Dispatcher::Threaded { cpu, gpus } = self {
            let gpu_pools = gpus.iter().flat_map(|g| [&g.compute, &g.copy]);
            for pool in std::iter::once(cpu).chain(gpu_pools) {
                for lane in &pool.lanes {
                    if let Some(tx) = lane.tx.lock().as_ref() {
                        let _ = tx.send(LaneMsg::Shutdown);
                    }
                }
            }
        }
    }
}

thread_local! {
    static ON_LANE: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is one of the engine's lane workers.
pub(crate) fn on_lane() -> bool {
    ON_LANE.with(|f| f.get())
}

fn lane_main(id: LaneId, rx: mpsc::Receiver<LaneMsg>, tx: LaneTx) {
    ON_LANE.with(|f| f.set(true));
    log::trace!("lane {id} started");
    let ctx = RunContext::new(id);
    let mut open = true;
    // Ends once the queue is empty and the sender is gone
    while let Ok(msg) = rx.recv() {
        match msg {
            LaneMsg::Run(node) if open => node.run(&ctx),
            LaneMsg::Run(node) => node.abort(Error::EngineShutdown),
            LaneMsg::Shutdown => {
                tx.lock().take();
                open = false;
            }
        }
    }
    log::trace!("lane {id} stopped");
}
