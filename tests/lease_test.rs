mod helpers;

use chrono::Duration;
use helpers::test_store;
use strata::memory::lease::{consolidation_key, LeaseLock, LeaseOutcome};
use strata::MemoryError;

#[tokio::test]
async fn concurrent_acquires_on_one_key_have_a_single_winner() {
    let store = test_store();
    let a = LeaseLock::new(store.clone());
    let b = LeaseLock::new(store.clone());
    let key = consolidation_key("u1");

    let (first, second) = tokio::join!(
        a.acquire(&key, Duration::minutes(10)),
        b.acquire(&key, Duration::minutes(10)),
    );
    let winners = [first.unwrap(), second.unwrap()]
        .iter()
        .filter(|outcome| outcome.is_acquired())
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn many_contenders_still_have_a_single_winner() {
    let store = test_store();
    let key = consolidation_key("u1");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock = LeaseLock::new(store.clone());
            let key = key.clone();
            tokio::spawn(async move { lock.acquire(&key, Duration::minutes(1)).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_acquired() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let store = test_store();
    let lock = LeaseLock::new(store.clone());
    let key = consolidation_key("u1");

    let first = lock.acquire(&key, Duration::milliseconds(50)).await.unwrap();
    assert!(first.is_acquired());
    let blocked = lock.acquire(&key, Duration::minutes(1)).await.unwrap();
    assert!(matches!(blocked, LeaseOutcome::Conflict));

    tokio::time::sleep(std::time::Duration::from_millis(120)).await;

    let second = lock.acquire(&key, Duration::minutes(1)).await.unwrap();
    let LeaseOutcome::Acquired(lease) = second else {
        panic!("expired lease should be replaceable");
    };
    assert_eq!(lease.key, key);
}

#[tokio::test]
async fn release_frees_the_key_and_is_idempotent() {
    let store = test_store();
    let lock = LeaseLock::new(store.clone());
    let key = consolidation_key("u1");

    assert!(lock.acquire(&key, Duration::minutes(10)).await.unwrap().is_acquired());
    lock.release(&key).await.unwrap();
    lock.release(&key).await.unwrap();
    assert!(lock.acquire(&key, Duration::minutes(10)).await.unwrap().is_acquired());
}

#[tokio::test]
async fn keys_are_independent_per_owner() {
    let store = test_store();
    let lock = LeaseLock::new(store.clone());

    assert!(lock
        .acquire(&consolidation_key("u1"), Duration::minutes(10))
        .await
        .unwrap()
        .is_acquired());
    assert!(lock
        .acquire(&consolidation_key("u2"), Duration::minutes(10))
        .await
        .unwrap()
        .is_acquired());
}

#[tokio::test]
async fn non_positive_ttl_is_rejected() {
    let store = test_store();
    let lock = LeaseLock::new(store.clone());

    let err = lock.acquire("k", Duration::zero()).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}
