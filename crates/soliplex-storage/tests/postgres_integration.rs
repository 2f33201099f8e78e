//! Integration tests against a real PostgreSQL database.
//!
//! Skipped unless DATABASE_URL is set. Run with:
//!   DATABASE_URL=postgres://localhost/soliplex_test \
//!     cargo test -p soliplex-storage --test postgres_integration

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

use soliplex_core::{content_hash, JsonMap, StepType};
use soliplex_storage::{
    FailureKind, GroupSeed, IngestOutcome, IngestRecord, IngestStore, NewBatch, PostgresStore,
    RunSeed, StepSeed, StoreError,
};

async fn connect() -> Option<PostgresStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    Some(
        PostgresStore::connect(&url)
            .await
            .expect("failed to connect to test database"),
    )
}

fn step_seed(number: u32, name: &str, retries: u32, is_last: bool) -> StepSeed {
    StepSeed {
        step_number: number,
        step_name: name.to_string(),
        step_type: StepType::Parse,
        is_last,
        retries,
        config: JsonMap::new(),
        cumulative_config: JsonMap::new(),
    }
}

/// Unique per-test source tag so runs do not interfere across tests or
/// reruns against the same database.
fn unique_source() -> String {
    format!("it-{}", Uuid::now_v7())
}

async fn seed_one_run(store: &PostgresStore, source: &str) -> (Uuid, Uuid, String) {
    let batch = store
        .create_batch(NewBatch {
            name: "it-batch".into(),
            source: source.to_string(),
            params: JsonMap::new(),
        })
        .await
        .unwrap();

    let hash = content_hash(format!("{source}/doc").as_bytes());
    store
        .record_ingest(IngestRecord {
            batch_id: batch.id,
            uri: format!("/{source}/doc"),
            source: source.to_string(),
            document_hash: hash.clone(),
            mime_type: "text/plain".into(),
            size_bytes: 4,
            metadata: JsonMap::new(),
        })
        .await
        .unwrap();

    let group = store
        .create_run_group(GroupSeed {
            name: "it-group".into(),
            workflow_id: "wf".into(),
            parameter_set_id: "default".into(),
            batch_id: batch.id,
            runs: vec![RunSeed {
                document_hash: hash.clone(),
                priority: 0,
                run_params: JsonMap::new(),
                first_step: step_seed(1, "parse", 1, false),
            }],
        })
        .await
        .unwrap();

    (batch.id, group.id, hash)
}

#[tokio::test]
async fn test_claim_complete_and_group_settlement() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let source = unique_source();
    let (batch_id, group_id, _) = seed_one_run(&store, &source).await;

    store.worker_heartbeat("it-w1").await.unwrap();

    let claimed = store.claim_steps("it-w1", 5).await.unwrap();
    let ours: Vec<_> = claimed.into_iter().filter(|c| c.group_id == group_id).collect();
    assert_eq!(ours.len(), 1);
    let step = &ours[0];
    assert_eq!(step.step_number, 1);
    assert_eq!(step.source, source);

    store
        .complete_step(
            step.step_id,
            "it-w1",
            JsonMap::new(),
            Some(step_seed(2, "chunk", 0, true)),
        )
        .await
        .unwrap();

    let claimed = store.claim_steps("it-w1", 5).await.unwrap();
    let ours: Vec<_> = claimed.into_iter().filter(|c| c.group_id == group_id).collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].step_number, 2);

    store
        .complete_step(ours[0].step_id, "it-w1", JsonMap::new(), None)
        .await
        .unwrap();

    let group = store.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.status, "completed");
    let batch = store.get_batch(batch_id).await.unwrap().unwrap();
    assert!(batch.completed_at.is_some());

    let events = store.lifecycle_for_group(group_id).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            "group_start",
            "item_start",
            "step_start",
            "step_end",
            "step_start",
            "step_end",
            "item_end",
            "group_end",
        ]
    );

    store.delete_run_group(group_id).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let source = unique_source();

    let batch = store
        .create_batch(NewBatch {
            name: "it-batch".into(),
            source: source.clone(),
            params: JsonMap::new(),
        })
        .await
        .unwrap();

    let mut runs = Vec::new();
    for i in 0..20 {
        let hash = content_hash(format!("{source}/doc{i}").as_bytes());
        store
            .record_ingest(IngestRecord {
                batch_id: batch.id,
                uri: format!("/{source}/doc{i}"),
                source: source.clone(),
                document_hash: hash.clone(),
                mime_type: "text/plain".into(),
                size_bytes: 1,
                metadata: JsonMap::new(),
            })
            .await
            .unwrap();
        runs.push(RunSeed {
            document_hash: hash,
            priority: 0,
            run_params: JsonMap::new(),
            first_step: step_seed(1, "only", 0, true),
        });
    }

    let group = store
        .create_run_group(GroupSeed {
            name: "it-group".into(),
            workflow_id: "wf".into(),
            parameter_set_id: "default".into(),
            batch_id: batch.id,
            runs,
        })
        .await
        .unwrap();

    store.worker_heartbeat("it-wa").await.unwrap();
    store.worker_heartbeat("it-wb").await.unwrap();

    // Claim from two workers concurrently; SKIP LOCKED keeps them disjoint
    let (a, b) = tokio::join!(
        store.claim_steps("it-wa", 20),
        store.claim_steps("it-wb", 20)
    );
    let a: Vec<_> = a.unwrap().into_iter().filter(|c| c.group_id == group.id).collect();
    let b: Vec<_> = b.unwrap().into_iter().filter(|c| c.group_id == group.id).collect();

    let mut ids: Vec<Uuid> = a.iter().chain(b.iter()).map(|c| c.step_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), a.len() + b.len());

    for step in a.iter().chain(b.iter()) {
        let worker = if a.iter().any(|c| c.step_id == step.step_id) {
            "it-wa"
        } else {
            "it-wb"
        };
        store
            .complete_step(step.step_id, worker, JsonMap::new(), None)
            .await
            .unwrap();
    }

    store.delete_run_group(group.id).await.unwrap();
}

#[tokio::test]
async fn test_retry_and_source_diff() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let source = unique_source();
    let (_, group_id, hash) = seed_one_run(&store, &source).await;

    store.worker_heartbeat("it-w2").await.unwrap();
    let claimed = store.claim_steps("it-w2", 50).await.unwrap();
    let step = claimed
        .into_iter()
        .find(|c| c.group_id == group_id)
        .unwrap();

    let outcome = store
        .fail_step(
            step.step_id,
            "it-w2",
            "transient",
            FailureKind::Transient,
            Duration::from_secs(120),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        soliplex_storage::FailureOutcome::WillRetry { retry: 1, .. }
    ));

    // Backed off: not claimable yet
    let claimed = store.claim_steps("it-w2", 50).await.unwrap();
    assert!(!claimed.iter().any(|c| c.group_id == group_id));

    // Source diff sees the ingested URI
    let listing: BTreeMap<String, String> =
        [(format!("/{source}/doc"), hash.clone())].into();
    let diff = store.source_status(&source, &listing).await.unwrap();
    assert!(diff.new.is_empty());
    assert!(diff.changed.is_empty());
    assert!(diff.missing.is_empty());

    let outcome = store
        .record_ingest(IngestRecord {
            batch_id: store
                .get_group(group_id)
                .await
                .unwrap()
                .unwrap()
                .batch_id,
            uri: format!("/{source}/doc"),
            source: source.clone(),
            document_hash: hash,
            mime_type: "text/plain".into(),
            size_bytes: 4,
            metadata: JsonMap::new(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Unchanged { .. }));

    store.delete_run_group(group_id).await.unwrap();
    let err = store.delete_run_group(group_id).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}
