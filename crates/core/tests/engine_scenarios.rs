//! End-to-end search scenarios: literal small-corpus results, cosine
//! auto-normalization, tombstone visibility, and add → delete → refine
//! recall against brute force.

use canopy_core::{Index, Params, SearchOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn test_params() -> Params {
    let mut params = Params::default();
    params.number_of_threads = 2;
    params.number_of_trees = 2;
    params.neighborhood_size = 8;
    params.cef = 32;
    params.add_cef = 32;
    params
}

fn random_corpus(n: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn assert_valid_top_k(results: &[canopy_core::SearchResult], k: usize) {
    assert!(results.len() <= k);
    for pair in results.windows(2) {
        assert!(pair[0].dist <= pair[1].dist, "results must be ascending");
    }
    let mut vids: Vec<i32> = results.iter().map(|r| r.vid).collect();
    vids.sort_unstable();
    vids.dedup();
    assert_eq!(vids.len(), results.len(), "results must not repeat ids");
}

#[test]
fn four_vectors_l2_exact_order() {
    let mut params = test_params();
    params.neighborhood_size = 2;
    let index = Index::<f32>::with_params(params);
    let data = [0.0f32, 0.0, 1.0, 0.0, 0.0, 1.0, 5.0, 5.0];
    index.build(&data, 4, 2, true).unwrap();

    let results = index.search(&[0.1, 0.1], 3).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].vid, 0);
    assert!((results[0].dist - 0.02).abs() < 1e-6);
    assert!(matches!(results[1].vid, 1 | 2));
    assert!(matches!(results[2].vid, 1 | 2));
    assert_ne!(results[1].vid, results[2].vid);
    assert!((results[1].dist - 0.82).abs() < 1e-5);
    assert!((results[2].dist - 0.82).abs() < 1e-5);
    // The far outlier must not displace any of the first three.
    assert!(results.iter().all(|r| r.vid != 3));
}

#[test]
fn cosine_auto_normalizes_rows_and_query() {
    let index = Index::<f32>::with_params(test_params());
    index.set_parameter("DistCalcMethod", "Cosine").unwrap();
    let data = [3.0f32, 4.0, -3.0, -4.0];
    index.build(&data, 2, 2, false).unwrap();

    let results = index.search(&[1.0, 0.0], 2).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].vid, 0);
    assert!((results[0].dist - 0.4).abs() < 1e-5, "got {}", results[0].dist);
    assert_eq!(results[1].vid, 1);
    assert!((results[1].dist - 1.6).abs() < 1e-5, "got {}", results[1].dist);
}

#[test]
fn tombstones_invisible_to_deletion_aware_search() {
    let dim = 8;
    let data = random_corpus(1000, dim, 11);
    let index = Index::<f32>::with_params(test_params());
    index.build(&data, 1000, dim, true).unwrap();
    for vid in 0..500 {
        index.delete_by_id(vid).unwrap();
    }
    assert_eq!(index.deleted_count(), 500);

    let mut rng = StdRng::seed_from_u64(12);
    for _ in 0..20 {
        let query: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let results = index.search(&query, 10).unwrap();
        assert_valid_top_k(&results, 10);
        assert!(
            results.iter().all(|r| r.vid >= 500),
            "deletion-aware search returned a tombstoned id"
        );
    }

    // The raw path may return deleted ids; querying a deleted vector's own
    // values must surface it at distance ~0.
    let deleted_vector: Vec<f32> = data[..dim].to_vec();
    let raw = index
        .search_with_options(
            &deleted_vector,
            10,
            &SearchOptions {
                search_deleted: true,
                with_metadata: false,
            },
        )
        .unwrap();
    assert_eq!(raw[0].vid, 0);
    assert!(raw[0].dist < 1e-6);
}

#[test]
fn add_delete_refine_keeps_recall() {
    let dim = 8;
    let k = 10;
    let index = Index::<f32>::with_params(test_params());
    let initial = random_corpus(100, dim, 21);
    index.build(&initial, 100, dim, true).unwrap();
    let added = random_corpus(100, dim, 22);
    index.add(&added, 100, dim, true).unwrap();
    for vid in (0..100).map(|i| i * 2) {
        index.delete_by_id(vid).unwrap();
    }
    assert_eq!(index.deleted_count(), 50);

    let refined = index.refine().unwrap();
    assert_eq!(refined.rows(), 150);
    assert_eq!(refined.deleted_count(), 0);

    // Survivors: odd ids of the initial batch plus the whole added batch.
    let mut survivors: Vec<Vec<f32>> = Vec::new();
    for i in 0..100 {
        if i % 2 == 1 {
            survivors.push(initial[i * dim..(i + 1) * dim].to_vec());
        }
    }
    for i in 0..100 {
        survivors.push(added[i * dim..(i + 1) * dim].to_vec());
    }
    assert_eq!(survivors.len(), 150);

    let l2 = |a: &[f32], b: &[f32]| -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
    };

    let mut rng = StdRng::seed_from_u64(23);
    let mut hits = 0usize;
    let mut total = 0usize;
    for _ in 0..20 {
        let query: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let mut truth: Vec<f32> = survivors.iter().map(|v| l2(&query, v)).collect();
        truth.sort_by(|a, b| a.total_cmp(b));
        let threshold = truth[k - 1] + 1e-5;

        let results = refined.search(&query, k).unwrap();
        assert_valid_top_k(&results, k);
        assert_eq!(results.len(), k);
        hits += results.iter().filter(|r| r.dist <= threshold).count();
        total += k;
    }
    let recall = hits as f32 / total as f32;
    assert!(recall >= 0.9, "recall {recall} below 0.9");
}

#[test]
fn graph_rows_stay_well_formed() {
    let dim = 4;
    let n = 200;
    let data = random_corpus(n, dim, 31);
    let index = Index::<f32>::with_params(test_params());
    index.build(&data, n, dim, true).unwrap();
    index.add(&random_corpus(10, dim, 32), 10, dim, true).unwrap();

    let rows = index.rows();
    assert_eq!(rows, n + 10);
    for vid in 0..rows as i32 {
        let neighbors = index.neighbors(vid);
        let mut seen = std::collections::HashSet::new();
        for &nn in &neighbors {
            assert!(nn >= 0 && (nn as usize) < rows, "neighbor {nn} out of range");
            assert_ne!(nn, vid, "row {vid} contains a self-loop");
            assert!(seen.insert(nn), "row {vid} repeats neighbor {nn}");
        }
    }
}
