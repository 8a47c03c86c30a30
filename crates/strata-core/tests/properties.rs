//! Behavioural properties of the control layer, checked on every adapter.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::{Rng, SeedableRng};
use strata_backends::{
    AcceleratorAdapter, AcceleratorConfig, DeviceAdapter, SerialAdapter, ThreadedAdapter, ThreadedConfig,
};
use strata_core::{Algorithm, ArrayHandle, AtomicArray, Id, ReverseConnectivityBuilder};

fn threaded() -> ThreadedAdapter {
    ThreadedAdapter::with_config(&ThreadedConfig {
        num_threads: Some(4),
        grain_size: 16,
    })
    .unwrap()
}

fn accelerator() -> AcceleratorAdapter {
    // tiny grid so large schedules need several dispatches
    AcceleratorAdapter::with_config(AcceleratorConfig {
        block_size: 16,
        max_grid: [4, 2, 2],
        compute_units: Some(2),
        ..AcceleratorConfig::default()
    })
    .unwrap()
}

macro_rules! on_every_adapter {
    ($check:ident) => {
        strata_tracing::init_test_tracing();
        $check(&SerialAdapter);
        $check(&threaded());
        $check(&accelerator());
    };
}

fn random(len: usize, seed: u64) -> Vec<i64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1000..1000)).collect()
}

#[test]
fn schedule_visits_each_index_once() {
    fn check<D: DeviceAdapter>(device: &D) {
        for n in [0_usize, 1, 63, 1000] {
            let visits: Vec<AtomicU32> = (0..n).map(|_| AtomicU32::new(0)).collect();
            Algorithm::new(device.clone())
                .schedule(
                    |i, _| {
                        visits[i as usize].fetch_add(1, Ordering::Relaxed);
                    },
                    n as Id,
                )
                .unwrap();
            assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1), "{:?} n={n}", device.id());
        }
    }
    on_every_adapter!(check);
}

#[test]
fn schedule_3d_covers_the_box() {
    fn check<D: DeviceAdapter>(device: &D) {
        let algorithm = Algorithm::new(device.clone());
        for range in [[0, 5, 5], [5, 0, 5], [5, 5, 0]] {
            let calls = AtomicU32::new(0);
            algorithm
                .schedule_3d(
                    |_, _| {
                        calls.fetch_add(1, Ordering::Relaxed);
                    },
                    range,
                )
                .unwrap();
            assert_eq!(calls.load(Ordering::Relaxed), 0);
        }

        let [x, y, z] = [37_i64, 5, 3];
        let visits: Vec<AtomicU32> = (0..x * y * z).map(|_| AtomicU32::new(0)).collect();
        algorithm
            .schedule_3d(
                |[i, j, k], _| {
                    visits[(i + x * (j + y * k)) as usize].fetch_add(1, Ordering::Relaxed);
                },
                [x, y, z],
            )
            .unwrap();
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1), "{:?}", device.id());
    }
    on_every_adapter!(check);
}

#[test]
fn inclusive_is_exclusive_plus_input() {
    fn check<D: DeviceAdapter>(device: &D) {
        let algorithm = Algorithm::new(device.clone());
        let values = random(2000, 1);
        let input = ArrayHandle::from_vec(values.clone());
        let inclusive = ArrayHandle::new();
        let exclusive = ArrayHandle::new();
        let total = algorithm.scan_inclusive(&input, &inclusive).unwrap();
        let carry = algorithm.scan_exclusive(&input, &exclusive).unwrap();
        let inclusive = inclusive.to_vec().unwrap();
        let exclusive = exclusive.to_vec().unwrap();
        for i in 0..values.len() {
            assert_eq!(inclusive[i], exclusive[i] + values[i]);
        }
        assert_eq!(total, values.iter().sum::<i64>());
        assert_eq!(carry, total);
    }
    on_every_adapter!(check);
}

#[test]
fn copy_if_is_idempotent_under_all_true_stencil() {
    fn check<D: DeviceAdapter>(device: &D) {
        let algorithm = Algorithm::new(device.clone());
        let values = random(700, 2);
        let input = ArrayHandle::from_vec(values.clone());
        let stencil = ArrayHandle::from_vec(vec![1_u8; values.len()]);
        let output = ArrayHandle::new();
        assert_eq!(algorithm.copy_if(&input, &stencil, &output).unwrap(), 700);
        assert_eq!(output.to_vec().unwrap(), values);
    }
    on_every_adapter!(check);
}

#[test]
fn unique_is_idempotent_on_distinct_sorted_input() {
    fn check<D: DeviceAdapter>(device: &D) {
        let algorithm = Algorithm::new(device.clone());
        let values: Vec<i32> = (0..1500).map(|i| i * 3).collect();
        let handle = ArrayHandle::from_vec(values.clone());
        assert_eq!(algorithm.unique(&handle).unwrap(), 1500);
        assert_eq!(handle.to_vec().unwrap(), values);
    }
    on_every_adapter!(check);
}

#[test]
fn sort_then_unique_yields_distinct_values() {
    fn check<D: DeviceAdapter>(device: &D) {
        let algorithm = Algorithm::new(device.clone());
        let values: Vec<i64> = random(3000, 3).into_iter().map(|v| v / 10).collect();
        let handle = ArrayHandle::from_vec(values.clone());
        algorithm.sort(&handle).unwrap();
        algorithm.unique(&handle).unwrap();

        let mut expected = values;
        expected.sort_unstable();
        expected.dedup();
        assert_eq!(handle.to_vec().unwrap(), expected);
    }
    on_every_adapter!(check);
}

#[test]
fn concurrent_adds_are_never_lost() {
    fn check<D: DeviceAdapter>(device: &D) {
        let counter = ArrayHandle::from_vec(vec![0_i64]);
        {
            let atomic = AtomicArray::new(&counter, device).unwrap();
            device
                .schedule(
                    |_, _| {
                        atomic.add(0, 1);
                    },
                    20_000,
                )
                .unwrap();
        }
        assert_eq!(counter.get_value(0).unwrap(), 20_000);
    }
    on_every_adapter!(check);
}

#[test]
fn reverse_connectivity_of_two_triangles() {
    fn check<D: DeviceAdapter>(device: &D) {
        let conn = ArrayHandle::from_vec(vec![0, 1, 2, 1, 2, 3]);
        let rc = ReverseConnectivityBuilder::build_single_type(device, &conn, 3, 4).unwrap();
        assert_eq!(rc.num_indices.to_vec().unwrap(), vec![1, 2, 2, 1]);
        assert_eq!(rc.offsets.to_vec().unwrap(), vec![0, 1, 3, 5]);
        assert_eq!(rc.connectivity.len(), 6);

        let expected: [&[Id]; 4] = [&[0], &[0, 1], &[0, 1], &[1]];
        for (point, cells) in expected.iter().enumerate() {
            let mut found = rc.point_cells(point as Id).unwrap();
            found.sort_unstable();
            assert_eq!(found, *cells, "{:?} point {point}", device.id());
        }
    }
    on_every_adapter!(check);
}

#[test]
fn reverse_connectivity_of_mixed_and_legacy_cells() {
    fn check<D: DeviceAdapter>(device: &D) {
        // a triangle, an empty cell and a quad
        let conn = ArrayHandle::from_vec(vec![0, 1, 2, 2, 1, 3, 4]);
        let offsets = ArrayHandle::from_vec(vec![0, 3, 3, 7]);
        let rc = ReverseConnectivityBuilder::build_explicit(device, &conn, &offsets, 5).unwrap();
        let mut shared = rc.point_cells(2).unwrap();
        shared.sort_unstable();
        assert_eq!(shared, vec![0, 2]);
        assert_eq!(rc.point_cells(4).unwrap(), vec![2]);

        let legacy = ArrayHandle::from_vec(vec![3, 0, 1, 2, 3, 1, 2, 3]);
        let rc = ReverseConnectivityBuilder::build_legacy(device, &legacy, 3, 2, 4).unwrap();
        assert_eq!(rc.num_indices.to_vec().unwrap(), vec![1, 2, 2, 1]);
        assert_eq!(rc.point_cells(3).unwrap(), vec![1]);
    }
    on_every_adapter!(check);
}

#[test]
fn large_mesh_reverse_connectivity_matches_serial_counts() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let num_points = 500;
    let conn: Vec<Id> = (0..4 * 3000).map(|_| rng.gen_range(0..num_points)).collect();
    let mut counts = vec![0_i64; num_points as usize];
    for &p in &conn {
        counts[p as usize] += 1;
    }
    let conn = ArrayHandle::from_vec(conn);

    fn check<D: DeviceAdapter>(device: &D, conn: &ArrayHandle<Id>, counts: &[i64], num_points: Id) {
        let rc = ReverseConnectivityBuilder::build_single_type(device, conn, 4, num_points).unwrap();
        assert_eq!(rc.num_indices.to_vec().unwrap(), counts);
        let all = rc.connectivity.to_vec().unwrap();
        assert!(all.iter().all(|&cell| (0..3000).contains(&cell)));
    }
    check(&SerialAdapter, &conn, &counts, num_points);
    check(&threaded(), &conn, &counts, num_points);
    check(&accelerator(), &conn, &counts, num_points);
}

#[test]
fn reduce_of_empty_is_initial() {
    fn check<D: DeviceAdapter>(device: &D) {
        let empty = ArrayHandle::<i64>::new();
        assert_eq!(Algorithm::new(device.clone()).reduce(&empty, 42).unwrap(), 42);
    }
    on_every_adapter!(check);
}

#[test]
fn copy_sub_range_past_the_end_is_refused() {
    fn check<D: DeviceAdapter>(device: &D) {
        let algorithm = Algorithm::new(device.clone());
        let input = ArrayHandle::from_vec(vec![1_i32, 2, 3]);
        let output = ArrayHandle::from_vec(vec![4, 5]);
        assert!(!algorithm.copy_sub_range(&input, 3, 1, &output, 0).unwrap());
        assert_eq!(output.to_vec().unwrap(), vec![4, 5]);
        assert!(algorithm.copy_sub_range(&input, 1, 2, &output, 1).unwrap());
        assert_eq!(output.to_vec().unwrap(), vec![4, 2, 3]);
    }
    on_every_adapter!(check);
}

#[test]
fn kernel_raised_error_surfaces_through_the_facade() {
    fn check<D: DeviceAdapter>(device: &D) {
        let err = Algorithm::new(device.clone())
            .schedule(
                |i, errors| {
                    if i == 77 {
                        errors.raise("bad cell 77");
                    }
                },
                100,
            )
            .unwrap_err();
        assert_eq!(err.execution_message(), Some("bad cell 77"));
    }
    on_every_adapter!(check);
}
