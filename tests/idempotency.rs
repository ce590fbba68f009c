//! Idempotency Integration Tests
//!
//! Tests for concurrent admission of deliveries of the same (task, round).

use std::sync::Arc;

use shipwright::core::idempotency::DuplicateKind;
use shipwright::core::{
    generate_idempotency_key, Admission, FileIdempotencyStore, IdempotencyStore,
    InMemoryIdempotencyStore,
};
use shipwright::TaskIdentity;
use tempfile::TempDir;
use tokio::task::JoinSet;

/// Race `count` admissions of one identity with distinct nonces
async fn race(store: Arc<dyn IdempotencyStore>, count: usize) -> Vec<Admission> {
    let mut set = JoinSet::new();
    for i in 0..count {
        let store = Arc::clone(&store);
        set.spawn(async move {
            store
                .admit(&TaskIdentity::new("calc", 1), &format!("nonce-{}", i))
                .await
                .unwrap()
        });
    }

    let mut admissions = Vec::new();
    while let Some(result) = set.join_next().await {
        admissions.push(result.unwrap());
    }
    admissions
}

#[tokio::test]
async fn test_in_memory_store_accepts_exactly_one() {
    let store: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());

    let admissions = race(store.clone(), 16).await;

    assert_eq!(admissions.iter().filter(|a| a.is_accepted()).count(), 1);
    assert!(admissions.iter().filter(|a| !a.is_accepted()).all(|a| matches!(
        a,
        Admission::Duplicate {
            kind: DuplicateKind::Redelivery,
            ..
        }
    )));
    assert_eq!(store.entries().await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_file_store_accepts_exactly_one() {
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn IdempotencyStore> =
        Arc::new(FileIdempotencyStore::new(temp_dir.path().join("admissions.jsonl")));

    let admissions = race(store.clone(), 16).await;

    assert_eq!(admissions.iter().filter(|a| a.is_accepted()).count(), 1);
    assert_eq!(store.entries().await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_file_stores_sharing_a_path_agree() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("admissions.jsonl");
    let a = Arc::new(FileIdempotencyStore::new(&path));
    let b = Arc::new(FileIdempotencyStore::new(&path));

    let mut set = JoinSet::new();
    for i in 0..8 {
        let store = if i % 2 == 0 { a.clone() } else { b.clone() };
        set.spawn(async move {
            store
                .admit(&TaskIdentity::new("calc", 1), &format!("nonce-{}", i))
                .await
                .unwrap()
        });
    }

    let mut accepted = 0;
    while let Some(result) = set.join_next().await {
        if result.unwrap().is_accepted() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 1);
}

#[tokio::test]
async fn test_same_nonce_is_not_recorded_twice() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileIdempotencyStore::new(temp_dir.path().join("admissions.jsonl"));
    let identity = TaskIdentity::new("calc", 1);

    assert!(store.admit(&identity, "n-1").await.unwrap().is_accepted());
    let retried = store.admit(&identity, "n-1").await.unwrap();

    assert_eq!(
        retried,
        Admission::Duplicate {
            identity: identity.clone(),
            kind: DuplicateKind::SameDelivery,
        }
    );
    assert_eq!(store.entries().await.unwrap().len(), 1);
}

#[test]
fn test_stage_keys_differ_by_round() {
    let round_one = generate_idempotency_key(&TaskIdentity::new("calc", 1), "generation", "brief");
    let round_two = generate_idempotency_key(&TaskIdentity::new("calc", 2), "generation", "brief");

    assert_ne!(round_one, round_two);
    assert!(round_one.starts_with("calc:1:generation:"));
}
