//! Property-based tests for filtered, sorted and limited queries.

use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::{json, Value};
use vigil_core::{store::memory::MemoryDocumentStore, Document, DocumentStore, Filter, OrderBy};

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

fn doc(index: usize, priority: i32, created_at: u64) -> Document {
    match json!({ "id": format!("doc-{index:03}"), "priority": priority, "created_at": created_at }) {
        Value::Object(map) => map,
        _ => unreachable!("object literal"),
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    /// A query returns exactly the matching documents, in claim order,
    /// truncated to the limit.
    #[test]
    fn query_matches_a_brute_force_scan(
        rows in prop::collection::vec((-5i32..5, 0u64..50), 0..60),
        min_priority in -5i32..5,
        limit in 1usize..30,
    ) {
        let returned = runtime().block_on(async {
            let store = MemoryDocumentStore::new();
            let docs: Vec<_> = rows
                .iter()
                .enumerate()
                .map(|(i, (priority, created_at))| doc(i, *priority, *created_at))
                .collect();
            store.batch_insert("jobs", docs).await.unwrap();

            store
                .query(
                    "jobs",
                    vec![Filter::gte("priority", min_priority)],
                    vec![OrderBy::desc("priority"), OrderBy::asc("created_at"), OrderBy::asc("id")],
                    Some(limit),
                )
                .await
                .unwrap()
        });

        let mut expected: Vec<(i32, u64, String)> = rows
            .iter()
            .enumerate()
            .filter(|(_, (priority, _))| *priority >= min_priority)
            .map(|(i, (priority, created_at))| (*priority, *created_at, format!("doc-{i:03}")))
            .collect();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        expected.truncate(limit);

        let returned: Vec<String> =
            returned.iter().map(|d| d["id"].as_str().unwrap().to_string()).collect();
        let expected: Vec<String> = expected.into_iter().map(|(_, _, id)| id).collect();
        prop_assert_eq!(returned, expected);
    }
}
