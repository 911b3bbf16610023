use chrono::{DateTime, TimeZone, Utc};
use chronotope::combined_index::{SpatialCriteria, TemporalCriteria, TemporalSpatialIndex};
use chronotope::delta::DeltaStore;
use chronotope::query::{Query, QueryEngine, QueryOptions, SortBy, SortOrder};
use chronotope::store::{MemoryNodeStore, NodeStore};
use chronotope::{Coordinates, Node, SpatialPoint, TemporalInstant};
use serde_json::json;
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn grid_node(x: i32, y: i32) -> Node {
    Node::with_id(
        format!("n{x}{y}"),
        Coordinates::spatial(SpatialPoint::from([f64::from(x), f64::from(y), 0.0])),
        json!({"x": x, "y": y}),
    )
}

fn engine() -> QueryEngine {
    QueryEngine::new(Arc::new(MemoryNodeStore::new()), TemporalSpatialIndex::new())
}

/// 25 nodes on an integer grid, nearest((2.5, 2.5, 0), k=4) returns the
/// four surrounding grid corners.
#[test]
fn nearest_after_bulk_load() {
    let index = TemporalSpatialIndex::new();
    let nodes: Vec<Node> = (0..5)
        .flat_map(|x| (0..5).map(move |y| grid_node(x, y)))
        .collect();
    index.bulk_load(nodes);

    let result = index.nearest(&SpatialPoint::from([2.5, 2.5, 0.0]), 4, None);
    let mut ids: Vec<&str> = result.iter().map(|n| n.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["n22", "n23", "n32", "n33"]);
}

/// Same grid, range (1,1,0)..(3,3,0) returns the 9 interior nodes.
#[test]
fn range_query_on_grid() {
    let index = TemporalSpatialIndex::new();
    for x in 0..5 {
        for y in 0..5 {
            index.insert(grid_node(x, y)).unwrap();
        }
    }

    let result = index.range_query(
        &SpatialPoint::from([1.0, 1.0, 0.0]),
        &SpatialPoint::from([3.0, 3.0, 0.0]),
    );
    assert_eq!(result.len(), 9);
    for node in &result {
        let p = node.spatial().unwrap();
        assert!((1.0..=3.0).contains(&p.get(0)));
        assert!((1.0..=3.0).contains(&p.get(1)));
    }
}

/// Timestamps T, T+600, T+1200 with 10-minute buckets; [T, T+1199]
/// returns exactly the first two.
#[test]
fn temporal_range_respects_exact_bounds() {
    let config = chronotope::IndexConfig::default().with_temporal_bucket_minutes(10);
    let index = TemporalSpatialIndex::with_config(config).unwrap();

    for (id, offset) in [("a", 0), ("b", 600), ("c", 1200)] {
        index
            .insert(Node::with_id(
                id,
                Coordinates::temporal(TemporalInstant::new(
                    t0() + chrono::Duration::seconds(offset),
                )),
                json!({}),
            ))
            .unwrap();
    }

    let range = TemporalCriteria::range(t0(), t0() + chrono::Duration::seconds(1199));
    let result = index.query(None, Some(&range), None).unwrap();
    let ids: Vec<&str> = result.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

/// Spatial NN within 10 of (1,2,3) intersected with [T, T+900] keeps only
/// the node satisfying both sides.
#[test]
fn combined_intersection() {
    let index = TemporalSpatialIndex::new();
    let specs = [
        ("a", [1.0, 2.0, 3.0], 0),
        ("b", [40.0, 50.0, 60.0], 600),
        ("c", [70.0, 80.0, 90.0], 1200),
    ];
    for (id, dims, offset) in specs {
        index
            .insert(Node::with_id(
                id,
                Coordinates::spatio_temporal(
                    SpatialPoint::from(dims),
                    TemporalInstant::new(t0() + chrono::Duration::seconds(offset)),
                ),
                json!({}),
            ))
            .unwrap();
    }

    let spatial = SpatialCriteria::nearest(SpatialPoint::from([1.0, 2.0, 3.0]), 10.0).unwrap();
    let temporal = TemporalCriteria::range(t0(), t0() + chrono::Duration::seconds(900));
    let result = index.query(Some(&spatial), Some(&temporal), None).unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0].id, "a");
}

/// v1 {"x":1} -> v2 {"x":1,"y":2} -> v3 {"x":3,"y":2}; reconstructing
/// from v1 to version 3 matches the v3 node.
#[test]
fn delta_reconstruction_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = QueryEngine::new(
        Arc::new(MemoryNodeStore::new()),
        TemporalSpatialIndex::new(),
    )
    .with_delta_store(DeltaStore::open(dir.path()).unwrap());

    let v1 = Node::with_id(
        "doc",
        Coordinates::spatial(SpatialPoint::from([0.0, 0.0, 0.0])),
        json!({"x": 1}),
    );
    engine.insert(v1.clone()).unwrap();

    let v2_input = engine
        .get("doc")
        .unwrap()
        .unwrap()
        .with_content(json!({"x": 1, "y": 2}));
    engine.update(v2_input).unwrap();

    let v3_input = engine
        .get("doc")
        .unwrap()
        .unwrap()
        .with_content(json!({"x": 3, "y": 2}));
    let v3 = engine.update(v3_input).unwrap();

    let rebuilt = engine
        .delta_store()
        .unwrap()
        .reconstruct("doc", &v1, Some(3))
        .unwrap();
    assert_eq!(rebuilt.content, json!({"x": 3, "y": 2}));
    assert_eq!(rebuilt.version(), 3);
    assert_eq!(rebuilt.content, v3.content);
}

/// Five consecutive deltas v2..v6 collapse into one whose application to
/// v1 yields the same v6 the original chain produced.
#[test]
fn merge_compaction_preserves_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = DeltaStore::open(dir.path()).unwrap();

    let v1 = Node::with_id(
        "doc",
        Coordinates::spatial(SpatialPoint::from([0.0, 0.0, 0.0])),
        json!({"step": 1}),
    );
    let mut prev = v1.clone();
    for v in 2..=6u64 {
        let next = prev
            .clone()
            .with_content(json!({"step": v}))
            .into_version(v, t0() + chrono::Duration::seconds(v as i64));
        store.record(&prev, &next).unwrap();
        prev = next;
    }
    let expected = store.reconstruct("doc", &v1, Some(6)).unwrap();

    store.merge("doc", &v1, 2, 6).unwrap();
    assert_eq!(store.versions("doc"), vec![6]);

    let merged = store.reconstruct("doc", &v1, Some(6)).unwrap();
    assert_eq!(merged.content, expected.content);
    assert_eq!(merged.version(), 6);
}

/// Bulk loading a node list answers queries exactly like inserting the
/// same list one at a time.
#[test]
fn bulk_load_equivalence() {
    let nodes: Vec<Node> = (0..30)
        .map(|i| {
            Node::with_id(
                format!("n{i:02}"),
                Coordinates::spatio_temporal(
                    SpatialPoint::from([f64::from(i), f64::from(i % 7), 0.0]),
                    TemporalInstant::new(t0() + chrono::Duration::seconds(i64::from(i) * 30)),
                ),
                json!({}),
            )
        })
        .collect();

    let bulk = TemporalSpatialIndex::new();
    bulk.bulk_load(nodes.clone());

    let single = TemporalSpatialIndex::new();
    for node in nodes {
        single.insert(node).unwrap();
    }

    let spatial = SpatialCriteria::region(
        SpatialPoint::from([5.0, 0.0, 0.0]),
        SpatialPoint::from([20.0, 6.0, 0.0]),
    )
    .unwrap();
    let temporal = TemporalCriteria::range(t0(), t0() + chrono::Duration::seconds(600));

    for (s, t) in [
        (Some(&spatial), None),
        (None, Some(&temporal)),
        (Some(&spatial), Some(&temporal)),
    ] {
        let a = bulk.query(s, t, None).unwrap();
        let b = single.query(s, t, None).unwrap();
        let a_ids: Vec<&str> = a.iter().map(|n| n.id.as_str()).collect();
        let b_ids: Vec<&str> = b.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(a_ids, b_ids);
    }
}

/// Every indexed node is its own nearest neighbor.
#[test]
fn nearest_self_property() {
    let index = TemporalSpatialIndex::new();
    let points = [
        [0.0, 0.0, 0.0],
        [1.5, -2.5, 3.0],
        [100.0, 100.0, 100.0],
        [-7.25, 0.5, 2.0],
    ];
    for (i, dims) in points.iter().enumerate() {
        index
            .insert(Node::with_id(
                format!("p{i}"),
                Coordinates::spatial(SpatialPoint::from(*dims)),
                json!({}),
            ))
            .unwrap();
    }

    for (i, dims) in points.iter().enumerate() {
        let result = index.nearest(&SpatialPoint::from(*dims), 1, None);
        assert_eq!(result[0].id, format!("p{i}"));
    }
}

/// A full create/update/query/remove pass through the engine, with the
/// persistent store surviving a reopen.
#[test]
fn engine_lifecycle_with_persistent_store() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("nodes.log");
    let delta_dir = dir.path().join("deltas");

    {
        let store = Arc::new(chronotope::AofNodeStore::open(&log_path).unwrap());
        let engine = QueryEngine::new(store, TemporalSpatialIndex::new())
            .with_delta_store(DeltaStore::open(&delta_dir).unwrap());

        engine
            .insert(Node::with_id(
                "site",
                Coordinates::spatio_temporal(
                    SpatialPoint::from([3.0, 4.0, 0.0]),
                    TemporalInstant::new(t0()),
                ),
                json!({"status": "new"}),
            ))
            .unwrap();

        let changed = engine
            .get("site")
            .unwrap()
            .unwrap()
            .with_content(json!({"status": "surveyed"}));
        engine.update(changed).unwrap();
    }

    // Reopen: the store replays the log, the index rebuilds via bulk load.
    let store = Arc::new(chronotope::AofNodeStore::open(&log_path).unwrap());
    let index = TemporalSpatialIndex::new();
    index.bulk_load(store.all().unwrap());
    let engine = QueryEngine::new(store, index)
        .with_delta_store(DeltaStore::open(&delta_dir).unwrap());

    let current = engine.get("site").unwrap().unwrap();
    assert_eq!(current.version(), 2);
    assert_eq!(current.content, json!({"status": "surveyed"}));

    let nearby = SpatialCriteria::nearest(SpatialPoint::from([3.0, 4.0, 0.0]), 1.0).unwrap();
    let result = engine.execute(&Query::spatial(nearby)).unwrap();
    assert_eq!(result.items.len(), 1);

    assert!(engine.remove("site").unwrap());
    assert!(engine.get("site").unwrap().is_none());
}

/// Sorting and pagination compose across a combined query.
#[test]
fn combined_query_with_sort_and_pagination() {
    let engine = engine();
    for i in 0..10i64 {
        engine
            .insert(Node::with_id(
                format!("n{i}"),
                Coordinates::spatio_temporal(
                    SpatialPoint::from([i as f64, 0.0, 0.0]),
                    TemporalInstant::new(t0() + chrono::Duration::seconds(i * 60)),
                ),
                json!({}),
            ))
            .unwrap();
    }

    let spatial = SpatialCriteria::nearest(SpatialPoint::from([0.0, 0.0, 0.0]), 100.0).unwrap();
    let temporal = TemporalCriteria::range(t0(), t0() + chrono::Duration::seconds(540));
    let query = Query::combined(Some(spatial), Some(temporal))
        .unwrap()
        .with_options(
            QueryOptions::default()
                .with_sort(SortBy::Temporal, SortOrder::Desc)
                .with_offset(1)
                .with_limit(3),
        );

    let result = engine.execute(&query).unwrap();
    assert_eq!(result.total_before_pagination, 10);
    let ids: Vec<&str> = result.items.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["n8", "n7", "n6"]);
}
