// Checkpoint tests — file round trips and failure handling

use std::collections::HashMap;

use tessera::checkpoint;
use tessera::prelude::*;
use tessera::OpDescriptor;

fn engine() -> Engine {
    Engine::new(EngineConfig::default().cpu_workers(2)).unwrap()
}

#[test]
fn test_save_and_load_file() {
    let e = engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.tsra");

    // Still being computed when save is called
    let w = NDArray::arange(0.0, 6.0, 1.0, Device::cpu(), &e)
        .unwrap()
        .reshape((2, 3))
        .unwrap()
        .mul_scalar(0.5)
        .unwrap();
    let s = NDArray::full((), 7.0, Device::cpu(), &e).unwrap();
    checkpoint::save(&path, &[("w".to_string(), w), ("s".to_string(), s)]).unwrap();

    let other = engine();
    let loaded = checkpoint::load(&path, &other, Device::cpu()).unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].0, "w");
    assert_eq!(loaded[0].1.dims(), &[2, 3]);
    assert_eq!(
        loaded[0].1.to_vec().unwrap(),
        vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]
    );
    assert!(loaded[0].1.engine().same_engine(&other));
    assert_eq!(loaded[1].0, "s");
    assert_eq!(loaded[1].1.to_scalar().unwrap(), 7.0);
}

#[test]
fn test_save_refuses_failed_arrays() {
    let e = engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.tsra");

    let a = NDArray::zeros(4, Device::cpu(), &e).unwrap();
    e.submit(
        OpDescriptor::new("explode", Device::cpu(), |_| Err(Error::msg("bad kernel")))
            .write(a.var()),
    )
    .unwrap();
    let b = a.add_scalar(1.0).unwrap();

    let err = checkpoint::save(&path, &[("b".to_string(), b)]).unwrap_err();
    assert!(matches!(err, Error::DependencyPropagated { .. }));
    assert!(!path.exists());
}

#[test]
fn test_executor_parameters_round_trip() {
    let e = engine();
    let data = Symbol::variable("data");
    let net = Symbol::fully_connected("fc", &data, 2, false);

    let mut args = HashMap::new();
    args.insert(
        "data".to_string(),
        NDArray::ones((1, 3), Device::cpu(), &e).unwrap(),
    );
    args.insert(
        "fc_weight".to_string(),
        NDArray::random_normal(0.0, 1.0, (2, 3), Device::cpu(), &e).unwrap(),
    );
    args.insert(
        "fc_bias".to_string(),
        NDArray::zeros(2, Device::cpu(), &e).unwrap(),
    );
    let exec = net.bind(&e, Device::cpu(), &args).unwrap();
    let before = exec.forward().unwrap().to_vec().unwrap();

    let bytes = checkpoint::to_bytes(&exec.arg_arrays()).unwrap();
    let restored: HashMap<String, NDArray> = checkpoint::from_bytes(&bytes, &e, Device::cpu())
        .unwrap()
        .into_iter()
        .collect();
    let exec2 = net.bind(&e, Device::cpu(), &restored).unwrap();
    assert_eq!(exec2.forward().unwrap().to_vec().unwrap(), before);
}

#[test]
fn test_load_missing_file() {
    let e = engine();
    let dir = tempfile::tempdir().unwrap();
    let err = checkpoint::load(dir.path().join("nope.tsra"), &e, Device::cpu()).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
