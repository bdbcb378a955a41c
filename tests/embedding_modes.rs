//! Search modes that talk to the embedding service: deferred fetch,
//! neighbor recomputation, and their failure behavior.

mod common;

use beamline::{DiskIndex, Metric, OpenParams, SearchError, SearchOptions};
use common::{ring_graph, spawn_embedding_server, Fixture};

fn points() -> Vec<Vec<f32>> {
    vec![
        vec![0.0, 0.0, 0.0, 0.0],
        vec![1.0, 0.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0, 0.0],
        vec![0.0, 0.0, 1.0, 0.0],
        vec![0.0, 0.0, 0.0, 1.0],
        vec![1.0, 1.0, 0.0, 0.0],
        vec![0.0, 1.0, 1.0, 0.0],
        vec![1.0, 1.0, 1.0, 1.0],
    ]
}

fn open_with_port(dir: &tempfile::TempDir, name: &str, port: u16) -> (Fixture, DiskIndex<f32>) {
    let fixture = Fixture::new(Metric::L2, points(), ring_graph(8, 2), 0);
    let prefix = dir.path().join(name).to_str().unwrap().to_string();
    fixture.write(&prefix);
    let index = DiskIndex::<f32>::open(OpenParams {
        metric: Metric::L2,
        index_prefix: prefix,
        num_threads: 2,
        embedding_port: port,
        ..Default::default()
    })
    .unwrap();
    (fixture, index)
}

#[test]
fn deferred_fetch_with_faithful_oracle_matches_brute_force() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_embedding_server(points());
    let (fixture, index) = open_with_port(&dir, "deferred", port);

    let opts = SearchOptions {
        deferred_fetch: true,
        ..Default::default()
    };
    for query in [
        vec![0.9f32, 0.12, 0.0, 0.4],
        vec![0.05f32, 0.01, 0.02, 0.03],
        vec![1.0f32, 1.0, 0.9, 1.1],
    ] {
        let hits = index.search(&query, 3, 8, 2, &opts).unwrap();
        let got: Vec<u32> = hits.iter().map(|&(id, _)| id).collect();
        assert_eq!(got, fixture.brute_force(&query, 3));
    }
}

#[test]
fn deferred_fetch_equals_plain_search_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_embedding_server(points());
    let (_fixture, index) = open_with_port(&dir, "equiv", port);

    let query = [0.9f32, 0.12, 0.0, 0.4];
    let plain = index.search(&query, 4, 8, 2, &SearchOptions::default()).unwrap();
    let deferred = index
        .search(
            &query,
            4,
            8,
            2,
            &SearchOptions {
                deferred_fetch: true,
                ..Default::default()
            },
        )
        .unwrap();
    let plain_ids: Vec<u32> = plain.iter().map(|&(id, _)| id).collect();
    let deferred_ids: Vec<u32> = deferred.iter().map(|&(id, _)| id).collect();
    assert_eq!(plain_ids, deferred_ids);
}

#[test]
fn deferred_fetch_without_server_fails_the_query() {
    let dir = tempfile::tempdir().unwrap();
    // port 1: nothing listens there
    let (_fixture, index) = open_with_port(&dir, "noserver", 1);
    let err = index
        .search(
            &[0.5f32, 0.5, 0.5, 0.5],
            2,
            8,
            2,
            &SearchOptions {
                deferred_fetch: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, SearchError::Fetch(_)));
}

#[test]
fn recompute_neighbors_matches_plain_results() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_embedding_server(points());
    let (_fixture, index) = open_with_port(&dir, "recompute", port);

    let query = [0.9f32, 0.12, 0.0, 0.4];
    let plain = index.search(&query, 3, 8, 2, &SearchOptions::default()).unwrap();
    for dedup in [false, true] {
        let opts = SearchOptions {
            recompute_neighbors: true,
            dedup_cache: dedup,
            ..Default::default()
        };
        let recomputed = index.search(&query, 3, 8, 2, &opts).unwrap();
        assert_eq!(plain, recomputed, "dedup_cache={dedup}");
    }
}

#[test]
fn recompute_memo_serves_repeat_scorings() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_embedding_server(points());
    let (_fixture, index) = open_with_port(&dir, "memo", port);

    let opts = SearchOptions {
        recompute_neighbors: true,
        dedup_cache: true,
        ..Default::default()
    };
    let (_, stats) = index
        .search_with_stats(&[0.5f32, 0.5, 0.0, 0.0], 3, 8, 2, &opts)
        .unwrap();
    assert!(stats.recompute_requests > 0);
    // the ring graph revisits neighbors, so the memo must hit
    assert!(stats.recompute_memo_hits > 0);
}

#[test]
fn recompute_degrades_to_pq_when_fetch_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (_fixture, index) = open_with_port(&dir, "degrade", 1);
    let opts = SearchOptions {
        recompute_neighbors: true,
        ..Default::default()
    };
    // the identity codebook makes PQ estimates exact, so the fallback path
    // still produces correct results
    let hits = index.search(&[0.9f32, 0.12, 0.0, 0.4], 3, 8, 2, &opts).unwrap();
    let plain = index
        .search(&[0.9f32, 0.12, 0.0, 0.4], 3, 8, 2, &SearchOptions::default())
        .unwrap();
    assert_eq!(hits, plain);
}

#[test]
fn batch_recompute_matches_per_node_recompute() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_embedding_server(points());
    let (_fixture, index) = open_with_port(&dir, "batch", port);

    let query = [0.15f32, 0.9, 0.2, 0.0];
    let per_node = index
        .search(
            &query,
            3,
            8,
            2,
            &SearchOptions {
                recompute_neighbors: true,
                ..Default::default()
            },
        )
        .unwrap();
    let batched = index
        .search(
            &query,
            3,
            8,
            2,
            &SearchOptions {
                recompute_neighbors: true,
                batch_recompute: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(per_node, batched);
}

#[test]
fn zero_prune_ratio_equals_no_pruning() {
    let dir = tempfile::tempdir().unwrap();
    let port = spawn_embedding_server(points());
    let (_fixture, index) = open_with_port(&dir, "prune", port);

    let query = [0.9f32, 0.12, 0.0, 0.4];
    let base = index
        .search(
            &query,
            3,
            8,
            2,
            &SearchOptions {
                recompute_neighbors: true,
                ..Default::default()
            },
        )
        .unwrap();
    let zero_prune = index
        .search(
            &query,
            3,
            8,
            2,
            &SearchOptions {
                recompute_neighbors: true,
                prune_ratio: 0.0,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(base, zero_prune);

    // tiny lists are never pruned, so a positive ratio is also a no-op here
    let pruned = index
        .search(
            &query,
            3,
            8,
            2,
            &SearchOptions {
                recompute_neighbors: true,
                prune_ratio: 0.5,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(base, pruned);
}

#[test]
fn pruning_on_a_dense_graph_still_finds_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let n = 32;
    let vectors: Vec<Vec<f32>> = (0..n)
        .map(|i| vec![i as f32, (i * 3 % 7) as f32, 0.5, 0.0])
        .collect();
    let port = spawn_embedding_server(vectors.clone());
    // degree ~13 so the pruner actually trims lists
    let fixture = Fixture::new(Metric::L2, vectors, ring_graph(n, 12), 0);
    let prefix = dir.path().join("dense").to_str().unwrap().to_string();
    fixture.write(&prefix);
    let index = DiskIndex::<f32>::open(OpenParams {
        metric: Metric::L2,
        index_prefix: prefix,
        num_threads: 1,
        embedding_port: port,
        ..Default::default()
    })
    .unwrap();

    let query = fixture.raw[19].clone();
    for global in [false, true] {
        let opts = SearchOptions {
            recompute_neighbors: true,
            dedup_cache: true,
            prune_ratio: 0.3,
            global_pruning: global,
            ..Default::default()
        };
        let hits = index.search(&query, 1, 24, 4, &opts).unwrap();
        assert_eq!(hits[0].0, 19, "global_pruning={global}");
        assert!(hits[0].1.abs() < 1e-6);
    }
}

#[test]
fn skip_search_reorder_uses_pq_estimates() {
    let dir = tempfile::tempdir().unwrap();
    let (_fixture, index) = open_with_port(&dir, "skip", 0);
    // identity PQ estimates are exact, so the skipped rendition agrees
    let query = [0.9f32, 0.12, 0.0, 0.4];
    let plain = index.search(&query, 3, 8, 2, &SearchOptions::default()).unwrap();
    let skipped = index
        .search(
            &query,
            3,
            8,
            2,
            &SearchOptions {
                skip_search_reorder: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(plain, skipped);
}
