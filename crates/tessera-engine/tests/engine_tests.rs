// Engine tests — ordering, parallelism, failure propagation, shutdown

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tessera_core::{Device, Error};
use tessera_engine::{
    Engine, EngineConfig, EngineKind, LaneId, LaneKind, NodeState, OpDescriptor, Var,
};

fn engine(cpu_workers: usize) -> Engine {
    Engine::new(EngineConfig::default().cpu_workers(cpu_workers)).expect("engine")
}

/// A fake buffer: the engine only sees the var, kernels see the cell.
fn cell(v: f32) -> Arc<Mutex<f32>> {
    Arc::new(Mutex::new(v))
}

fn set_op(
    name: &str,
    var: &Arc<Var>,
    target: &Arc<Mutex<f32>>,
    value: f32,
    delay_ms: u64,
) -> OpDescriptor {
    let target = target.clone();
    OpDescriptor::new(name, Device::cpu(), move |_| {
        thread::sleep(Duration::from_millis(delay_ms));
        *target.lock() = value;
        Ok(())
    })
    .write(var)
}

// Ordering

#[test]
fn test_reader_waits_for_writer() {
    let engine = engine(4);
    let var = Var::new();
    let buf = cell(0.0);
    let seen = cell(-1.0);

    engine.submit(set_op("write", &var, &buf, 1.0, 50)).unwrap();
    let (b, s) = (buf.clone(), seen.clone());
    engine
        .submit(
            OpDescriptor::new("read", Device::cpu(), move |_| {
                *s.lock() = *b.lock();
                Ok(())
            })
            .read(&var),
        )
        .unwrap();

    engine.wait_all().unwrap();
    assert_eq!(*seen.lock(), 1.0);
}

#[test]
fn test_write_read_write_scenario() {
    let engine = engine(4);
    let var = Var::new();
    let buf = cell(0.0);
    let observed = cell(-1.0);

    engine.submit(set_op("w1", &var, &buf, 2.0, 30)).unwrap();
    let (b, o) = (buf.clone(), observed.clone());
    engine
        .submit(
            OpDescriptor::new("r1", Device::cpu(), move |_| {
                // Linger so an unordered w2 would overtake us
                thread::sleep(Duration::from_millis(30));
                *o.lock() = *b.lock();
                Ok(())
            })
            .read(&var),
        )
        .unwrap();
    engine.submit(set_op("w2", &var, &buf, 5.0, 0)).unwrap();

    engine.wait_for(&var).unwrap();
    assert_eq!(*buf.lock(), 5.0);
    assert_eq!(*observed.lock(), 2.0);
    assert_eq!(var.version(), 2);
}

#[test]
fn test_wait_for_returns_latest_writer() {
    let engine = engine(2);
    let var = Var::new();
    let buf = cell(0.0);
    for i in 1..=20 {
        engine
            .submit(set_op("set", &var, &buf, i as f32, 1))
            .unwrap();
    }
    engine.wait_for(&var).unwrap();
    assert_eq!(*buf.lock(), 20.0);
    assert_eq!(var.version(), 20);
}

#[test]
fn test_read_modify_write_chain_is_serialized() {
    let engine = engine(4);
    let var = Var::new();
    let counter = Arc::new(Mutex::new(0u64));
    for _ in 0..200 {
        let c = counter.clone();
        engine
            .submit(
                OpDescriptor::new("inc", Device::cpu(), move |_| {
                    let v = *c.lock();
                    thread::yield_now();
                    *c.lock() = v + 1;
                    Ok(())
                })
                .read(&var)
                .write(&var),
            )
            .unwrap();
    }
    engine.wait_for(&var).unwrap();
    assert_eq!(*counter.lock(), 200);
}

#[test]
fn test_wait_to_write_waits_for_readers() {
    let engine = engine(4);
    let var = Var::new();
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    engine
        .submit(
            OpDescriptor::new("slow_read", Device::cpu(), move |_| {
                thread::sleep(Duration::from_millis(40));
                d.store(true, Ordering::SeqCst);
                Ok(())
            })
            .read(&var),
        )
        .unwrap();
    // No writer: wait_for returns at once, wait_to_write does not
    engine.wait_for(&var).unwrap();
    engine.wait_to_write(&var).unwrap();
    assert!(done.load(Ordering::SeqCst));
}

// Parallelism

#[test]
fn test_independent_ops_run_concurrently() {
    let engine = engine(2);
    let a = Var::new();
    let b = Var::new();
    let (tx, rx) = mpsc::channel::<()>();
    let lanes = Arc::new(Mutex::new(Vec::<LaneId>::new()));

    // The first op can only succeed if the second runs while it waits.
    let l1 = lanes.clone();
    let first = engine
        .submit(
            OpDescriptor::new("wait_for_peer", Device::cpu(), move |ctx| {
                l1.lock().push(ctx.lane());
                rx.recv_timeout(Duration::from_secs(5))
                    .map_err(|_| Error::msg("peer never ran"))
            })
            .write(&a),
        )
        .unwrap();
    let l2 = lanes.clone();
    engine
        .submit(
            OpDescriptor::new("signal_peer", Device::cpu(), move |ctx| {
                l2.lock().push(ctx.lane());
                tx.send(()).map_err(|_| Error::msg("peer gone"))
            })
            .write(&b),
        )
        .unwrap();

    first.wait().unwrap();
    engine.wait_all().unwrap();
    let lanes = lanes.lock();
    assert_eq!(lanes.len(), 2);
    assert_ne!(lanes[0], lanes[1]);
}

#[test]
fn test_two_independent_increments() {
    let engine = engine(2);
    let (va, vb) = (Var::new(), Var::new());
    let (ca, cb) = (cell(1.0), cell(10.0));
    for (var, c) in [(&va, &ca), (&vb, &cb)] {
        let c = c.clone();
        engine
            .submit(
                OpDescriptor::new("inc", Device::cpu(), move |_| {
                    *c.lock() += 1.0;
                    Ok(())
                })
                .write(var),
            )
            .unwrap();
    }
    engine.wait_for(&vb).unwrap();
    engine.wait_for(&va).unwrap();
    assert_eq!(*ca.lock(), 2.0);
    assert_eq!(*cb.lock(), 11.0);
}

#[test]
fn test_gpu_ops_use_device_lanes() {
    let engine = Engine::new(EngineConfig::default().cpu_workers(1).gpus(2)).unwrap();
    let lanes = Arc::new(Mutex::new(Vec::<LaneId>::new()));
    let cases = [
        (Device::gpu(0), LaneKind::Compute),
        (Device::gpu(1), LaneKind::Copy),
        (Device::cpu(), LaneKind::Copy),
    ];
    for (device, kind) in cases {
        let l = lanes.clone();
        engine
            .submit(
                OpDescriptor::new("probe", device, move |ctx| {
                    l.lock().push(ctx.lane());
                    Ok(())
                })
                .write(&Var::new())
                .on_lane(kind),
            )
            .unwrap();
    }
    engine.wait_all().unwrap();

    let lanes = lanes.lock();
    assert!(lanes.contains(&LaneId {
        device: Device::gpu(0),
        kind: LaneKind::Compute,
        index: 0
    }));
    assert!(lanes.contains(&LaneId {
        device: Device::gpu(1),
        kind: LaneKind::Copy,
        index: 0
    }));
    // CPU copies share the worker pool
    assert!(lanes.contains(&LaneId {
        device: Device::cpu(),
        kind: LaneKind::Compute,
        index: 0
    }));
}

#[test]
fn test_unknown_device_is_rejected() {
    let engine = Engine::new(EngineConfig::default().cpu_workers(1).gpus(1)).unwrap();
    let err = engine
        .submit(OpDescriptor::new("nowhere", Device::gpu(3), |_| Ok(())))
        .unwrap_err();
    assert_eq!(err, Error::DeviceNotFound(Device::gpu(3)));
}

// Failure propagation

#[test]
fn test_failure_propagates_downstream() {
    let engine = engine(2);
    let (va, vb, vc) = (Var::new(), Var::new(), Var::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let a = engine
        .submit(
            OpDescriptor::new("broken", Device::cpu(), |_| Err(Error::msg("out of memory")))
                .write(&va),
        )
        .unwrap();
    let r = ran.clone();
    let b = engine
        .submit(
            OpDescriptor::new("scale", Device::cpu(), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .read(&va)
            .write(&vb),
        )
        .unwrap();
    let r = ran.clone();
    engine
        .submit(
            OpDescriptor::new("relu", Device::cpu(), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .read(&vb)
            .write(&vc),
        )
        .unwrap();

    let err = engine.wait_for(&vc).unwrap_err();
    match err {
        Error::DependencyPropagated { op, origin, message } => {
            assert_eq!(op, "relu");
            assert_eq!(origin, "broken");
            assert!(message.contains("out of memory"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(matches!(
        engine.wait_for(&va),
        Err(Error::KernelExecution { .. })
    ));
    assert_eq!(a.state(), NodeState::Failed);
    assert_eq!(b.state(), NodeState::Failed);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(va.version(), 0);

    // Later readers of the failed var inherit the failure too
    let late = engine
        .submit(OpDescriptor::new("late", Device::cpu(), |_| Ok(())).read(&va))
        .unwrap();
    assert!(matches!(late.wait(), Err(Error::DependencyPropagated { .. })));

    // Asking again gives the same answer
    assert!(engine.wait_for(&vc).is_err());
}

#[test]
fn test_write_after_failed_read_is_not_poisoned() {
    let engine = engine(2);
    let (x, y) = (Var::new(), Var::new());
    engine
        .submit(
            OpDescriptor::new("bad_reader", Device::cpu(), |_| Err(Error::msg("nan")))
                .read(&x)
                .write(&y),
        )
        .unwrap();
    let overwrite = engine
        .submit(OpDescriptor::new("overwrite", Device::cpu(), |_| Ok(())).write(&x))
        .unwrap();

    assert!(overwrite.wait().is_ok());
    assert!(engine.wait_for(&x).is_ok());
    assert!(engine.wait_for(&y).is_err());
}

#[test]
fn test_panicking_kernel_becomes_error() {
    let engine = engine(1);
    let var = Var::new();
    let op = OpDescriptor::new("panics", Device::cpu(), |_| panic!("index out of bounds"));
    engine.submit(op.write(&var)).unwrap();
    let err = engine.wait_for(&var).unwrap_err();
    assert_eq!(
        err,
        Error::KernelExecution {
            op: "panics".into(),
            message: "index out of bounds".into()
        }
    );
    // The lane survived the panic
    let ok = engine
        .submit(OpDescriptor::new("after", Device::cpu(), |_| Ok(())).write(&Var::new()))
        .unwrap();
    assert!(ok.wait().is_ok());
}

#[test]
fn test_wait_all_reports_failure_once() {
    let engine = engine(2);
    let op = OpDescriptor::new("fails", Device::cpu(), |_| Err(Error::msg("x")));
    engine.submit(op.write(&Var::new())).unwrap();
    assert!(engine.wait_all().is_err());
    assert!(engine.wait_all().is_ok());

    let stats = engine.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.in_flight, 0);
}

// Concurrent submitters

#[test]
fn test_concurrent_submitters_share_vars() {
    let engine = engine(4);
    let x = Var::new();
    let y = Var::new();
    let counter = Arc::new(Mutex::new(0u64));

    let mut handles = Vec::new();
    for t in 0..4 {
        let engine = engine.clone();
        let (x, y) = (x.clone(), y.clone());
        let counter = counter.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                let c = counter.clone();
                // Half the threads read x/write y, the others the reverse
                let op = OpDescriptor::new("swap", Device::cpu(), move |_| {
                    let v = *c.lock();
                    thread::yield_now();
                    *c.lock() = v + 1;
                    Ok(())
                });
                let op = if t % 2 == 0 {
                    op.read(&x).write(&y).write(&x)
                } else {
                    op.read(&y).write(&x).write(&y)
                };
                engine.submit(op).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    engine.wait_all().unwrap();
    assert_eq!(*counter.lock(), 400);
    assert!(!x.has_pending());
    assert!(!y.has_pending());
}

// Engine kinds and lifetime

#[test]
fn test_naive_engine_runs_inline() {
    let engine = Engine::new(EngineConfig::default().kind(EngineKind::Naive)).unwrap();
    let var = Var::new();
    let buf = cell(0.0);
    let handle = engine.submit(set_op("set", &var, &buf, 3.0, 0)).unwrap();
    assert_eq!(handle.state(), NodeState::Completed);
    assert_eq!(*buf.lock(), 3.0);
}

#[test]
fn test_shutdown_drains_then_rejects() {
    let engine = engine(2);
    let var = Var::new();
    let buf = cell(0.0);
    engine.submit(set_op("slow", &var, &buf, 9.0, 30)).unwrap();

    engine.shutdown();
    assert!(engine.is_shut_down());
    assert_eq!(*buf.lock(), 9.0);

    let err = engine
        .submit(OpDescriptor::new("late", Device::cpu(), |_| Ok(())))
        .unwrap_err();
    assert_eq!(err, Error::EngineShutdown);
}

#[test]
fn test_drop_last_handle_drains_work() {
    let buf = cell(0.0);
    {
        let engine = engine(1);
        engine
            .submit(set_op("slow", &Var::new(), &buf, 4.0, 20))
            .unwrap();
    }
    assert_eq!(*buf.lock(), 4.0);
}

#[test]
fn test_release_inside_kernel_aborts_later_ops() {
    let engine = engine(1);
    let (a, b) = (Var::new(), Var::new());
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let held = engine.clone();
    let first = engine
        .submit(
            OpDescriptor::new("holds_engine", Device::cpu(), move |_| {
                let _ = go_rx.recv();
                drop(held);
                Ok(())
            })
            .write(&a),
        )
        .unwrap();
    let after = engine
        .submit(
            OpDescriptor::new("after", Device::cpu(), |_| Ok(()))
                .read(&a)
                .write(&b),
        )
        .unwrap();

    // The kernel now owns the last handle
    drop(engine);
    go_tx.send(()).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let waiter = after.clone();
    thread::spawn(move || {
        let _ = done_tx.send(waiter.wait());
    });
    let outcome = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("wait on 'after' returned");
    assert_eq!(outcome, Err(Error::EngineShutdown));
    assert_eq!(after.state(), NodeState::Failed);
    assert_eq!(first.wait(), Ok(()));
}

#[test]
fn test_profiling_report() {
    let engine = Engine::new(EngineConfig::default().cpu_workers(2).profiling(true)).unwrap();
    let var = Var::new();
    let buf = cell(0.0);
    for _ in 0..3 {
        engine.submit(set_op("fill", &var, &buf, 1.0, 1)).unwrap();
    }
    engine.wait_all().unwrap();

    let report = engine.profile_report().expect("profiling enabled");
    let fill = report.entry("fill").unwrap();
    assert_eq!(fill.count, 3);
    assert!(fill.total >= Duration::from_millis(3));

    assert!(engine_without_profiling().profile_report().is_none());
}

fn engine_without_profiling() -> Engine {
    engine(1)
}
