mod helpers;

use chrono::Duration;
use helpers::{fetch, insert, test_config, test_store, BucketEmbedder, GeneratorMode, MockGenerator};
use std::sync::Arc;
use strata::memory::consolidation::ConsolidationEngine;
use strata::memory::lease::{consolidation_key, LeaseLock};
use strata::memory::types::META_CONSOLIDATED_FROM;
use strata::{Memory, MemoryError, MemoryStore, SearchFilters, Tier};

fn short_term(owner: &str, content: &str) -> Memory {
    Memory::new(owner, content).with_tier(Tier::ShortTerm)
}

#[tokio::test]
async fn single_record_group_is_left_alone() {
    let store = test_store();
    let generator = MockGenerator::summarizing();
    let engine = ConsolidationEngine::new(store.clone(), generator.clone(), test_config().consolidation);

    let only = insert(&store, short_term("u1", "a lone thought")).await;
    let outcome = engine.consolidate_group(vec![only.clone()]).await.unwrap();

    assert!(outcome.is_none());
    assert_eq!(generator.calls(), 0);
    assert_eq!(store.count_by_tier("u1", Tier::LongTerm).await.unwrap(), 0);
    assert!(!fetch(&store, &only.id).await.is_archived);
}

#[tokio::test]
async fn group_becomes_one_embedded_long_term_record() {
    let store = test_store();
    let embedder = Arc::new(BucketEmbedder::default());
    let engine = ConsolidationEngine::new(store.clone(), MockGenerator::summarizing(), test_config().consolidation)
        .with_embedder(embedder.clone());

    let a = insert(
        &store,
        short_term("u1", "standup moved to 10am")
            .with_category("meetings")
            .with_tags(["team"]),
    )
    .await;
    let b = insert(
        &store,
        short_term("u1", "standup is skipped on fridays")
            .with_category("meetings")
            .with_tags(["schedule"]),
    )
    .await;

    let id = engine
        .consolidate_group(vec![a.clone(), b.clone()])
        .await
        .unwrap()
        .expect("two-record group is consolidated");

    let merged = fetch(&store, &id).await;
    assert_eq!(merged.tier, Tier::LongTerm);
    assert_eq!(merged.owner_id, "u1");
    assert_eq!(merged.content, "summary 1 of 2 memories");
    assert_eq!(merged.category.as_deref(), Some("meetings"));
    assert_eq!(merged.tags, vec!["team".to_string(), "schedule".to_string()]);
    assert!(merged.embedding.is_some());
    assert_eq!(embedder.calls(), 1);
    assert_eq!(
        merged.metadata[META_CONSOLIDATED_FROM],
        serde_json::json!([a.id.clone(), b.id.clone()])
    );

    // The new record is reachable through vector search.
    let hits = store
        .search_by_vector(
            merged.embedding.as_ref().unwrap(),
            "u1",
            1,
            0.0,
            &SearchFilters::default(),
        )
        .await
        .unwrap();
    assert_eq!(hits[0].memory.id, id);

    for member in [&a, &b] {
        assert!(fetch(&store, &member.id).await.is_archived);
    }
}

#[tokio::test]
async fn generator_failure_leaves_no_partial_state() {
    for mode in [GeneratorMode::Fail, GeneratorMode::Malformed] {
        let store = test_store();
        let generator = Arc::new(MockGenerator::new(mode));
        let engine = ConsolidationEngine::new(store.clone(), generator.clone(), test_config().consolidation);

        let a = insert(&store, short_term("u1", "first half")).await;
        let b = insert(&store, short_term("u1", "second half")).await;

        let err = engine.consolidate_group(vec![a.clone(), b.clone()]).await.unwrap_err();
        assert!(matches!(err, MemoryError::GenerationFailure(_)), "{mode:?}: {err}");
        assert_eq!(generator.calls(), 1);
        assert_eq!(store.count_by_tier("u1", Tier::LongTerm).await.unwrap(), 0);
        assert_eq!(store.count_by_tier("u1", Tier::ShortTerm).await.unwrap(), 2);
        assert_eq!(fetch(&store, &a.id).await.metadata, a.metadata);
    }
}

#[tokio::test]
async fn groups_spanning_owners_or_archived_records_are_rejected() {
    let store = test_store();
    let generator = MockGenerator::summarizing();
    let engine = ConsolidationEngine::new(store.clone(), generator.clone(), test_config().consolidation);

    let mine = insert(&store, short_term("u1", "mine")).await;
    let theirs = insert(&store, short_term("u2", "theirs")).await;
    let err = engine.consolidate_group(vec![mine.clone(), theirs]).await.unwrap_err();
    assert!(matches!(err, MemoryError::InvalidTransition { .. }));

    let mut gone = short_term("u1", "gone");
    gone.is_archived = true;
    let err = engine.consolidate_group(vec![mine, gone]).await.unwrap_err();
    assert!(matches!(err, MemoryError::InvalidTransition { .. }));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn categories_are_consolidated_separately() {
    let store = test_store();
    let mut config = test_config().consolidation;
    config.volume_trigger = 3;
    let engine = ConsolidationEngine::new(store.clone(), MockGenerator::summarizing(), config);

    for i in 0..3 {
        insert(&store, short_term("u1", &format!("infra fact {i}")).with_category("infra")).await;
        insert(&store, short_term("u1", &format!("people fact {i}")).with_category("people")).await;
    }
    insert(&store, short_term("u1", "uncategorized fact")).await;

    let report = engine.consolidate_memories("u1", false).await.unwrap();
    assert_eq!(report.population, 7);
    assert_eq!(report.groups, 2);
    assert_eq!(report.created, 2);
    assert_eq!(report.consolidated, 6);

    let mut categories: Vec<String> = store
        .list_by_tier("u1", Tier::LongTerm, 10)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| m.category)
        .collect();
    categories.sort();
    assert_eq!(categories, vec!["infra".to_string(), "people".to_string()]);
    // The singleton residual stays short-term.
    assert_eq!(store.count_by_tier("u1", Tier::ShortTerm).await.unwrap(), 1);
}

#[tokio::test]
async fn below_trigger_does_nothing_unless_forced() {
    let store = test_store();
    let generator = MockGenerator::summarizing();
    let engine = ConsolidationEngine::new(store.clone(), generator.clone(), test_config().consolidation);

    for i in 0..4 {
        insert(&store, short_term("u1", &format!("small backlog {i}"))).await;
    }

    let report = engine.consolidate_memories("u1", false).await.unwrap();
    assert!(report.not_triggered);
    assert_eq!(report.population, 4);
    assert_eq!(generator.calls(), 0);

    let forced = engine.consolidate_memories("u1", true).await.unwrap();
    assert!(!forced.not_triggered);
    assert_eq!(forced.created, 1);
    assert_eq!(forced.consolidated, 4);
}

#[tokio::test]
async fn concurrent_generator_calls_respect_the_cap() {
    let store = test_store();
    let generator = Arc::new(MockGenerator::new(GeneratorMode::Summarize).with_delay(std::time::Duration::from_millis(30)));
    let mut config = test_config().consolidation;
    config.concurrency = 2;
    let engine = ConsolidationEngine::new(store.clone(), generator.clone(), config);

    for category in 0..6 {
        for i in 0..2 {
            insert(
                &store,
                short_term("u1", &format!("topic {category} item {i}")).with_category(format!("c{category}")),
            )
            .await;
        }
    }

    let report = engine.consolidate_memories("u1", true).await.unwrap();
    assert_eq!(report.groups, 6);
    assert_eq!(report.created, 6);
    assert_eq!(generator.calls(), 6);
    assert!(generator.max_in_flight() <= 2, "peak {}", generator.max_in_flight());
    assert!(generator.max_in_flight() >= 1);
}

#[tokio::test]
async fn one_failing_group_does_not_stop_the_others() {
    let store = test_store();
    let generator = MockGenerator::summarizing();
    let engine = ConsolidationEngine::new(store.clone(), generator.clone(), test_config().consolidation);

    insert(&store, short_term("u1", "ok one").with_category("a")).await;
    insert(&store, short_term("u1", "ok two").with_category("a")).await;
    let report = engine.consolidate_memories("u1", true).await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.failed_groups, 0);

    let failing = ConsolidationEngine::new(
        store.clone(),
        Arc::new(MockGenerator::new(GeneratorMode::Fail)),
        test_config().consolidation,
    );
    insert(&store, short_term("u1", "left one").with_category("b")).await;
    insert(&store, short_term("u1", "left two").with_category("b")).await;
    let report = failing.consolidate_memories("u1", true).await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.failed_groups, 1);
    assert_eq!(store.count_by_tier("u1", Tier::ShortTerm).await.unwrap(), 2);
}

#[tokio::test]
async fn guarded_run_skips_when_lease_is_held_and_releases_after() {
    let store = test_store();
    let generator = MockGenerator::summarizing();
    let engine = ConsolidationEngine::new(store.clone(), generator.clone(), test_config().consolidation);
    let lock = LeaseLock::new(store.clone());

    insert(&store, short_term("u1", "held one")).await;
    insert(&store, short_term("u1", "held two")).await;

    let key = consolidation_key("u1");
    assert!(lock.acquire(&key, Duration::minutes(5)).await.unwrap().is_acquired());
    let skipped = engine.run_guarded("u1", true, &lock).await.unwrap();
    assert!(skipped.lease_conflict);
    assert_eq!(generator.calls(), 0);

    lock.release(&key).await.unwrap();
    let ran = engine.run_guarded("u1", true, &lock).await.unwrap();
    assert!(!ran.lease_conflict);
    assert_eq!(ran.created, 1);

    // The guarded run released its own lease.
    assert!(lock.acquire(&key, Duration::minutes(5)).await.unwrap().is_acquired());
}
