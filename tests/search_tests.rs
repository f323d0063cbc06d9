mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use mneme::{FactInput, MnemeError, SearchOpts};
use tokio_util::sync::CancellationToken;

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[test]
fn store_and_search_ranks_exact_match_first() {
    let store = store_on(mem_pool(), Some(Arc::new(BowEmbedder)), "");
    for (content, subject, category) in [
        ("Matthew prefers dark mode", "matthew", "preference"),
        ("The server runs on port 8080", "server", "system"),
        ("Matthew uses vim", "matthew", "preference"),
    ] {
        store
            .insert(
                FactInput::new(content, subject, category).embedding(bow_vector(content)),
            )
            .unwrap();
    }

    let opts = SearchOpts { max_results: 10, only_active: true, ..Default::default() };
    let results = store.search("matthew dark mode", &opts, &cancel()).unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].fact.content, "Matthew prefers dark mode");
}

#[test]
fn search_requires_an_embedder() {
    let store = mem_store();
    let err = store.search("q", &SearchOpts::default(), &cancel()).unwrap_err();
    assert!(matches!(err, MnemeError::NoEmbedder));
}

#[test]
fn fts_syntax_in_queries_is_inert() {
    let store = store_on(mem_pool(), Some(Arc::new(BowEmbedder)), "");
    store
        .insert(FactInput::new("Matthew uses vim daily", "matthew", "preference"))
        .unwrap();

    for query in [
        "vim OR emacs",
        "a AND b",
        "NEAR(a b)",
        "-excluded",
        "subject:admin",
        "\"unbalanced",
        "weird\"quote\"inside",
        ": - \" OR",
    ] {
        let result = store.search(query, &SearchOpts::default(), &cancel());
        assert!(result.is_ok(), "query {query:?} must not produce a parse error");
    }
}

#[test]
fn empty_query_falls_back_to_vector_pass() {
    let store = store_on(mem_pool(), Some(Arc::new(ConstEmbedder::new(vec![1.0, 0.0]))), "");
    store
        .insert(FactInput::new("anything at all", "s", "note").embedding(vec![1.0, 0.0]))
        .unwrap();

    let results = store.search("   ", &SearchOpts::default(), &cancel()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].fts_score, 0.0);
    assert!(results[0].vec_score > 0.99);
}

#[test]
fn result_cardinality_respects_max_results() {
    let store = store_on(mem_pool(), Some(Arc::new(BowEmbedder)), "");
    for i in 0..12 {
        let content = format!("shared topic entry number {i}");
        store
            .insert(FactInput::new(&content, "topic", "note").embedding(bow_vector(&content)))
            .unwrap();
    }

    let opts = SearchOpts { max_results: 5, ..Default::default() };
    let results = store.search("shared topic entry", &opts, &cancel()).unwrap();
    assert!(results.len() <= 5);
    assert!(!results.is_empty());
}

#[test]
fn hybrid_merge_blends_both_scores() {
    let store =
        store_on(mem_pool(), Some(Arc::new(ConstEmbedder::new(vec![1.0, 0.0, 0.0, 0.0]))), "");
    store
        .insert(
            FactInput::new("The cat sat on the mat", "cat", "note")
                .embedding(vec![1.0, 0.0, 0.0, 0.0]),
        )
        .unwrap();

    let results = store
        .search("cat sat mat", &SearchOpts::default(), &cancel())
        .unwrap();
    assert_eq!(results.len(), 1);

    let r = &results[0];
    assert!(r.fts_score > 0.0, "lexical pass must contribute");
    assert!(r.vec_score > 0.0, "vector pass must contribute");
    let expected = 0.6 * r.fts_score + 0.4 * r.vec_score;
    assert!((r.combined - expected).abs() < 1e-9);
}

#[test]
fn custom_weights_are_respected() {
    let store = store_on(mem_pool(), Some(Arc::new(ConstEmbedder::new(vec![1.0, 0.0]))), "");
    store
        .insert(FactInput::new("weighted entry", "s", "note").embedding(vec![1.0, 0.0]))
        .unwrap();

    let opts = SearchOpts { fts_weight: 0.0, vec_weight: 1.0, ..Default::default() };
    let results = store.search("weighted entry", &opts, &cancel()).unwrap();
    assert_eq!(results.len(), 1);
    assert!((results[0].combined - results[0].vec_score).abs() < 1e-9);
}

#[test]
fn temporal_decay_prefers_recent_facts() {
    let store = store_on(mem_pool(), Some(Arc::new(ConstEmbedder::new(vec![1.0, 0.0]))), "");
    let now = Utc::now();

    let old = store
        .insert(
            FactInput::new("deploy window reminder", "deploy", "note")
                .embedding(vec![1.0, 0.0])
                .created_at(now - chrono::Duration::days(30)),
        )
        .unwrap();
    let fresh = store
        .insert(
            FactInput::new("deploy window reminder", "deploy", "note")
                .embedding(vec![1.0, 0.0])
                .created_at(now - chrono::Duration::hours(1)),
        )
        .unwrap();

    let opts = SearchOpts {
        decay_half_life: Some(Duration::from_secs(30 * 24 * 3600)),
        ..Default::default()
    };
    let results = store.search("deploy window reminder", &opts, &cancel()).unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].fact.id, fresh.id, "the one-hour-old fact ranks first");
    assert!(results[0].combined > results[1].combined);
    assert_eq!(results[1].fact.id, old.id);
}

#[test]
fn category_decay_overrides_default() {
    let store = store_on(mem_pool(), Some(Arc::new(ConstEmbedder::new(vec![1.0, 0.0]))), "");
    let created = Utc::now() - chrono::Duration::days(60);

    store
        .insert(
            FactInput::new("an old note", "s", "note")
                .embedding(vec![1.0, 0.0])
                .created_at(created),
        )
        .unwrap();
    store
        .insert(
            FactInput::new("an old identity", "s", "identity")
                .embedding(vec![1.0, 0.0])
                .created_at(created),
        )
        .unwrap();

    // Identity is exempted by an explicit zero; notes decay hard.
    let mut opts = SearchOpts {
        decay_half_life: Some(Duration::from_secs(24 * 3600)),
        ..Default::default()
    };
    opts.category_decay.insert("identity".into(), Duration::ZERO);

    let results = store.search("", &opts, &cancel()).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].fact.category, "identity");
    assert!(results[0].combined > results[1].combined * 1000.0);
}

#[test]
fn only_active_excludes_superseded_results() {
    let store = store_on(mem_pool(), Some(Arc::new(ConstEmbedder::new(vec![1.0, 0.0]))), "");
    let old = store
        .insert(FactInput::new("Matthew uses vim", "matthew", "preference").embedding(vec![1.0, 0.0]))
        .unwrap();
    let new = store
        .insert(
            FactInput::new("Matthew uses neovim", "matthew", "preference").embedding(vec![1.0, 0.0]),
        )
        .unwrap();
    store.supersede(old.id, new.id).unwrap();

    let active_only = SearchOpts { only_active: true, ..Default::default() };
    let results = store.search("Matthew uses", &active_only, &cancel()).unwrap();
    assert!(results.iter().all(|r| r.fact.id != old.id));

    let with_history = SearchOpts { only_active: false, ..Default::default() };
    let results = store.search("Matthew uses", &with_history, &cancel()).unwrap();
    assert!(results.iter().any(|r| r.fact.id == old.id));
}

#[test]
fn subject_and_category_filters_apply_to_both_passes() {
    let store = store_on(mem_pool(), Some(Arc::new(BowEmbedder)), "");
    store
        .insert(
            FactInput::new("Matthew likes coffee", "matthew", "preference")
                .embedding(bow_vector("Matthew likes coffee")),
        )
        .unwrap();
    store
        .insert(
            FactInput::new("Anna likes coffee", "anna", "preference")
                .embedding(bow_vector("Anna likes coffee")),
        )
        .unwrap();

    let opts = SearchOpts { subject: Some("anna".into()), ..Default::default() };
    let results = store.search("likes coffee", &opts, &cancel()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].fact.subject, "anna");

    let opts = SearchOpts { category: Some("system".into()), ..Default::default() };
    assert!(store.search("likes coffee", &opts, &cancel()).unwrap().is_empty());
}

#[test]
fn cross_namespace_search_with_override() {
    let pool = mem_pool();
    let alpha = store_on(pool.clone(), Some(Arc::new(BowEmbedder)), "alpha");
    let beta = store_on(pool, Some(Arc::new(BowEmbedder)), "beta");

    alpha
        .insert(
            FactInput::new("the shared topic from alpha", "t", "note")
                .embedding(bow_vector("the shared topic from alpha")),
        )
        .unwrap();
    beta.insert(
        FactInput::new("the shared topic from beta", "t", "note")
            .embedding(bow_vector("the shared topic from beta")),
    )
    .unwrap();

    let own_only = alpha.search("shared topic", &SearchOpts::default(), &cancel()).unwrap();
    assert_eq!(own_only.len(), 1);
    assert_eq!(own_only[0].fact.namespace, "alpha");

    let opts = SearchOpts {
        namespaces: vec!["alpha".into(), "beta".into()],
        ..Default::default()
    };
    let both = alpha.search("shared topic", &opts, &cancel()).unwrap();
    assert_eq!(both.len(), 2);
}

#[test]
fn search_batch_returns_per_query_results() {
    let store = store_on(mem_pool(), Some(Arc::new(BowEmbedder)), "");
    store
        .insert(
            FactInput::new("Matthew prefers dark mode", "matthew", "preference")
                .embedding(bow_vector("Matthew prefers dark mode")),
        )
        .unwrap();
    store
        .insert(
            FactInput::new("The server runs on port 8080", "server", "system")
                .embedding(bow_vector("The server runs on port 8080")),
        )
        .unwrap();

    let queries = vec!["dark mode".to_string(), "server port".to_string()];
    let results = store
        .search_batch(&queries, &SearchOpts::default(), &cancel())
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0][0].fact.subject, "matthew");
    assert_eq!(results[1][0].fact.subject, "server");

    assert!(store
        .search_batch(&[], &SearchOpts::default(), &cancel())
        .unwrap()
        .is_empty());
}

#[test]
fn cancelled_search_aborts() {
    let store = store_on(mem_pool(), Some(Arc::new(BowEmbedder)), "");
    store.insert(FactInput::new("c", "s", "note")).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = store.search("c", &SearchOpts::default(), &token).unwrap_err();
    assert!(matches!(err, MnemeError::Cancelled));
}

#[test]
fn superseded_results_are_tagged_via_fact_state() {
    let store = store_on(mem_pool(), Some(Arc::new(ConstEmbedder::new(vec![1.0, 0.0]))), "");
    let old = store
        .insert(FactInput::new("old fact text", "s", "note").embedding(vec![1.0, 0.0]))
        .unwrap();
    let new = store
        .insert(FactInput::new("new fact text", "s", "note").embedding(vec![1.0, 0.0]))
        .unwrap();
    store.supersede(old.id, new.id).unwrap();

    let opts = SearchOpts { only_active: false, ..Default::default() };
    let results = store.search("fact text", &opts, &cancel()).unwrap();
    let old_result = results.iter().find(|r| r.fact.id == old.id).unwrap();
    assert_eq!(old_result.fact.superseded_by, Some(new.id));
}
