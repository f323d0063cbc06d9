mod common;

use std::sync::Arc;

use common::*;
use mneme::tools::{
    ConfirmInput, DeleteInput, HistoryInput, ListInput, SearchInput, StoreInput, SupersedeInput,
    ToolHandler, UpdateMetadataInput,
};
use mneme::{FactInput, FactStore};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn handler() -> (ToolHandler, Arc<FactStore>) {
    let store = store_on(mem_pool(), Some(Arc::new(BowEmbedder)), "");
    (ToolHandler::new(store.clone()), store)
}

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

fn store_fact(h: &ToolHandler, content: &str, subject: &str) {
    let out = h.store(
        StoreInput {
            content: content.into(),
            subject: subject.into(),
            ..Default::default()
        },
        &cancel(),
    );
    assert!(!out.is_error, "store failed: {}", out.text);
}

#[test]
fn store_validates_and_defaults_category() {
    let (h, store) = handler();

    let out = h.store(StoreInput { subject: "s".into(), ..Default::default() }, &cancel());
    assert!(out.is_error);

    let out = h.store(
        StoreInput { content: "c".into(), ..Default::default() },
        &cancel(),
    );
    assert!(out.is_error);

    store_fact(&h, "Matthew prefers dark mode", "matthew");
    let facts = store.by_subject("matthew", true).unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].category, "note");
    assert!(facts[0].embedding.is_some(), "store embeds before insert");
}

#[test]
fn store_reports_duplicates_without_error() {
    let (h, store) = handler();
    store_fact(&h, "same claim", "s");

    let out = h.store(
        StoreInput { content: "same claim".into(), subject: "s".into(), ..Default::default() },
        &cancel(),
    );
    assert!(!out.is_error);
    assert!(out.text.contains("Already stored"));
    assert_eq!(store.active_count().unwrap(), 1);
}

#[test]
fn store_with_supersedes_links_history() {
    let (h, store) = handler();
    store_fact(&h, "Matthew uses vim", "matthew");
    let old_id = store.by_subject("matthew", true).unwrap()[0].id;

    let out = h.store(
        StoreInput {
            content: "Matthew uses neovim".into(),
            subject: "matthew".into(),
            category: "preference".into(),
            supersedes: Some(old_id),
            ..Default::default()
        },
        &cancel(),
    );
    assert!(!out.is_error);
    assert!(out.text.contains(&format!("Superseded fact {old_id}")));
    assert!(store.get(old_id).unwrap().unwrap().superseded_by.is_some());
}

#[test]
fn store_warns_when_supersession_fails() {
    let (h, _) = handler();
    let out = h.store(
        StoreInput {
            content: "new claim".into(),
            subject: "s".into(),
            supersedes: Some(999),
            ..Default::default()
        },
        &cancel(),
    );
    assert!(!out.is_error, "insert itself succeeded");
    assert!(out.text.contains("Warning"));
}

#[test]
fn search_formats_results_and_touches_usage() {
    let (h, store) = handler();
    store_fact(&h, "Matthew prefers dark mode", "matthew");

    let out = h.search(
        SearchInput { query: "dark mode".into(), ..Default::default() },
        &cancel(),
    );
    assert!(!out.is_error);
    assert!(out.text.contains("[1] (id="));
    assert!(out.text.contains("matthew | note"));
    assert!(out.text.contains("used=1"), "formatted count reflects the touch: {}", out.text);

    let fact = store.by_subject("matthew", true).unwrap().remove(0);
    assert_eq!(fact.use_count, 1, "touch ran after search");
}

#[test]
fn search_requires_query_and_caps_limit() {
    let (h, _) = handler();

    let out = h.search(SearchInput::default(), &cancel());
    assert!(out.is_error);

    for i in 0..4 {
        store_fact(&h, &format!("shared topic number {i}"), "topic");
    }
    let out = h.search(
        SearchInput { query: "shared topic".into(), limit: 2, ..Default::default() },
        &cancel(),
    );
    assert!(!out.is_error);
    assert!(out.text.contains("[2]"));
    assert!(!out.text.contains("[3]"), "limit 2 caps the listing: {}", out.text);
}

#[test]
fn search_include_superseded_tags_old_facts() {
    let (h, store) = handler();
    store_fact(&h, "Matthew uses vim", "matthew");
    let old_id = store.by_subject("matthew", true).unwrap()[0].id;
    let out = h.store(
        StoreInput {
            content: "Matthew uses neovim".into(),
            subject: "matthew".into(),
            supersedes: Some(old_id),
            ..Default::default()
        },
        &cancel(),
    );
    assert!(!out.is_error);

    let out = h.search(
        SearchInput { query: "Matthew uses".into(), ..Default::default() },
        &cancel(),
    );
    assert!(!out.text.contains("SUPERSEDED"), "active-only by default");

    let out = h.search(
        SearchInput {
            query: "Matthew uses".into(),
            include_superseded: true,
            ..Default::default()
        },
        &cancel(),
    );
    assert!(out.text.contains("[SUPERSEDED by"), "got: {}", out.text);
}

#[test]
fn search_metadata_filter_is_equality() {
    let (h, store) = handler();
    store
        .insert(
            FactInput::new("draft chapter", "book", "project")
                .metadata(json!({"status": "draft"}))
                .embedding(bow_vector("draft chapter")),
        )
        .unwrap();
    store
        .insert(
            FactInput::new("final chapter", "book", "project")
                .metadata(json!({"status": "final"}))
                .embedding(bow_vector("final chapter")),
        )
        .unwrap();

    let mut metadata = serde_json::Map::new();
    metadata.insert("status".into(), json!("draft"));
    let out = h.search(
        SearchInput { query: "chapter".into(), metadata: Some(metadata), ..Default::default() },
        &cancel(),
    );
    assert!(out.text.contains("draft chapter"));
    assert!(!out.text.contains("final chapter"));
}

#[test]
fn list_defaults_to_active_facts() {
    let (h, store) = handler();
    store_fact(&h, "Matthew uses vim", "matthew");
    let old_id = store.by_subject("matthew", true).unwrap()[0].id;
    h.store(
        StoreInput {
            content: "Matthew uses neovim".into(),
            subject: "matthew".into(),
            supersedes: Some(old_id),
            ..Default::default()
        },
        &cancel(),
    );

    let out = h.list(ListInput { subject: "matthew".into(), ..Default::default() });
    assert!(!out.is_error);
    assert!(out.text.contains("Matthew uses neovim"));
    assert!(!out.text.contains("Matthew uses vim\n"), "superseded fact hidden: {}", out.text);
    assert!(out.text.contains("1 facts listed."));
}

#[test]
fn delete_and_confirm_validate_ids() {
    let (h, store) = handler();

    assert!(h.delete(DeleteInput { id: 0 }).is_error);
    assert!(h.confirm(ConfirmInput { id: -3 }).is_error);
    assert!(h.delete(DeleteInput { id: 41 }).is_error, "missing id errors");

    store_fact(&h, "c", "s");
    let id = store.by_subject("s", true).unwrap()[0].id;

    let out = h.confirm(ConfirmInput { id });
    assert!(!out.is_error);
    assert!(out.text.contains("count=1"));

    let out = h.delete(DeleteInput { id });
    assert!(!out.is_error);
    assert!(store.get(id).unwrap().is_none());
}

#[test]
fn supersede_validates_everything_first() {
    let (h, store) = handler();
    store_fact(&h, "v1", "s");
    store_fact(&h, "v2", "s");
    let facts = store.by_subject("s", true).unwrap();
    let (a, b) = (facts[0].id, facts[1].id);

    assert!(h.supersede(SupersedeInput { old_id: 0, new_id: b }).is_error);
    assert!(h.supersede(SupersedeInput { old_id: a, new_id: a }).is_error);
    assert!(h.supersede(SupersedeInput { old_id: 998, new_id: b }).is_error);
    assert!(h.supersede(SupersedeInput { old_id: a, new_id: 998 }).is_error);

    let out = h.supersede(SupersedeInput { old_id: a, new_id: b });
    assert!(!out.is_error);
    assert!(out.text.contains("Old: v1"));
    assert!(out.text.contains("New: v2"));

    // Already superseded.
    let out = h.supersede(SupersedeInput { old_id: a, new_id: b });
    assert!(out.is_error);
    assert!(out.text.contains("already superseded"));
}

#[test]
fn history_needs_exactly_one_selector() {
    let (h, store) = handler();
    assert!(h.history(HistoryInput::default()).is_error);
    assert!(h
        .history(HistoryInput { id: 1, subject: "s".into() })
        .is_error);

    store_fact(&h, "v1", "matthew");
    store_fact(&h, "v2", "matthew");
    let facts = store.by_subject("matthew", true).unwrap();
    let _ = h.supersede(SupersedeInput { old_id: facts[0].id, new_id: facts[1].id });

    let out = h.history(HistoryInput { id: facts[0].id, ..Default::default() });
    assert!(!out.is_error);
    assert!(out.text.contains("[1/2]"));
    assert!(out.text.contains("[2/2]"));
    assert!(out.text.contains("ACTIVE"));
    assert!(out.text.contains("SUPERSEDED by"));

    let out = h.history(HistoryInput { subject: "matthew".into(), ..Default::default() });
    assert!(!out.is_error);
    assert!(out.text.contains("v1"));
    assert!(out.text.contains("v2"));
}

#[test]
fn update_metadata_patches_and_reports() {
    let (h, store) = handler();
    store
        .insert(FactInput::new("c", "s", "note").metadata(json!({"a": 1, "b": 2})))
        .unwrap();
    let id = store.by_subject("s", true).unwrap()[0].id;

    assert!(h
        .update_metadata(UpdateMetadataInput { id: 0, patch: serde_json::Map::new() })
        .is_error);

    let patch = json!({"b": null, "c": 3});
    let out = h.update_metadata(UpdateMetadataInput {
        id,
        patch: patch.as_object().unwrap().clone(),
    });
    assert!(!out.is_error);

    let fact = store.get(id).unwrap().unwrap();
    assert_eq!(fact.metadata, Some(json!({"a": 1, "c": 3})));
}

#[test]
fn status_reports_counts_and_groupings() {
    let (h, _) = handler();
    store_fact(&h, "a", "matthew");
    store_fact(&h, "b", "matthew");
    store_fact(&h, "c", "server");

    let out = h.status();
    assert!(!out.is_error);
    assert!(out.text.contains("Active facts: 3"));
    assert!(out.text.contains("matthew: 2"));
    assert!(out.text.contains("server: 1"));
    assert!(out.text.contains("note: 3"));
}
