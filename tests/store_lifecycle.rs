use serde_json::json;
use tempfile::tempdir;

use collab_scout::store::analysis::{keyword_id, KeywordKind, KeywordRecord, NewAnalysis};
use collab_scout::store::briefs::{BriefRecord, BriefStatus};
use collab_scout::store::repos::{ReadmeRecord, RepoRecord};
use collab_scout::store::runs::Run;
use collab_scout::store::{Store, StoreError};

fn insert_test_run(store: &Store, run_id: &str) {
    store
        .insert_run(&Run {
            id: run_id.to_string(),
            created_at: 1_000,
            args_json: json!({ "query": "vector database" }),
            config_hash: "0123456789abcdef".to_string(),
            git_commit: None,
        })
        .unwrap();
}

fn repo(full_name: &str, run_id: &str) -> RepoRecord {
    RepoRecord {
        full_name: full_name.to_string(),
        stars: 120,
        forks: 4,
        topics: vec!["database".to_string(), "vector".to_string()],
        language: Some("Rust".to_string()),
        license: Some("MIT".to_string()),
        pushed_at: Some("2026-07-01T00:00:00Z".to_string()),
        archived: false,
        fork: false,
        last_seen_run_id: run_id.to_string(),
    }
}

#[test]
fn migrations_apply_once_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scout.sqlite");

    let store = Store::open(&path).unwrap();
    let applied = store.applied_migrations().unwrap();
    assert!(applied.len() >= 6);
    drop(store);

    // Re-opening a fully migrated store applies nothing new.
    let store = Store::open(&path).unwrap();
    assert_eq!(store.applied_migrations().unwrap(), applied);
    assert!(store.migrate().unwrap().is_empty());
}

#[test]
fn analysis_is_unique_per_repo_and_run() {
    let store = Store::open_in_memory().unwrap();
    insert_test_run(&store, "run-1");
    store.upsert_repo(&repo("acme/alpha", "run-1")).unwrap();

    let input = json!({ "readme_sha256": "ab", "excerpt_chars": 10 });
    let output = json!({ "signals": {} });
    let scores = json!({ "interestingness": 0.5, "novelty": 0.5, "collaboration_potential": 0.5 });
    let reasons = json!({});
    let new = NewAnalysis {
        run_id: "run-1",
        repo_id: "acme/alpha",
        model: "test/model",
        prompt_id: "repo_analysis",
        prompt_version: "v1",
        input_json: &input,
        output_json: &output,
        llm_scores_json: &scores,
        final_score: 0.5,
        reasons_json: &reasons,
        created_at: 2_000,
    };

    store.insert_analysis(&new).unwrap();
    let err = store.insert_analysis(&new).unwrap_err();
    assert!(matches!(err, StoreError::Sqlite(_)));
    assert_eq!(store.count_analyses("run-1").unwrap(), 1);
    assert!(store.has_analysis("run-1", "acme/alpha").unwrap());
}

#[test]
fn readme_is_replaced_in_place() {
    let store = Store::open_in_memory().unwrap();
    insert_test_run(&store, "run-1");
    store.upsert_repo(&repo("acme/alpha", "run-1")).unwrap();

    let first = ReadmeRecord {
        repo_id: "acme/alpha".to_string(),
        content: b"old readme".to_vec(),
        content_sha256: "a".repeat(64),
        fetched_at: 100,
        etag: Some("\"v1\"".to_string()),
        source_url: "https://api.github.com/repos/acme/alpha/readme".to_string(),
    };
    store.upsert_readme(&first).unwrap();

    let second = ReadmeRecord {
        content: b"new readme".to_vec(),
        content_sha256: "b".repeat(64),
        fetched_at: 200,
        etag: Some("\"v2\"".to_string()),
        ..first
    };
    store.upsert_readme(&second).unwrap();

    let current = store.get_readme("acme/alpha").unwrap().unwrap();
    assert_eq!(current.content, b"new readme");
    assert_eq!(current.etag.as_deref(), Some("\"v2\""));

    // Exactly one current row per repo.
    assert!(store.has_readme("acme/alpha").unwrap());
}

#[test]
fn keyword_rows_distinguish_per_repo_from_aggregate() {
    let store = Store::open_in_memory().unwrap();
    insert_test_run(&store, "run-1");
    store.upsert_repo(&repo("acme/alpha", "run-1")).unwrap();

    store
        .upsert_keyword(&KeywordRecord {
            id: keyword_id("run-1", Some("acme/alpha"), "vector", KeywordKind::Primary),
            run_id: "run-1".to_string(),
            repo_id: Some("acme/alpha".to_string()),
            keyword: "vector".to_string(),
            kind: KeywordKind::Primary,
            weight: 1.0,
        })
        .unwrap();
    store
        .upsert_keyword(&KeywordRecord {
            id: keyword_id("run-1", None, "vector", KeywordKind::Primary),
            run_id: "run-1".to_string(),
            repo_id: None,
            keyword: "vector".to_string(),
            kind: KeywordKind::Primary,
            weight: 0.75,
        })
        .unwrap();

    let per_repo = store.repo_keywords_for_run("run-1").unwrap();
    assert_eq!(per_repo.len(), 1);
    assert_eq!(per_repo[0].repo_id.as_deref(), Some("acme/alpha"));

    let aggregates = store.aggregate_keywords_for_run("run-1").unwrap();
    assert_eq!(aggregates.len(), 1);
    assert!(aggregates[0].repo_id.is_none());
    assert_eq!(aggregates[0].weight, 0.75);
}

#[test]
fn brief_status_is_the_only_mutable_field() {
    let store = Store::open_in_memory().unwrap();
    insert_test_run(&store, "run-1");
    store.upsert_repo(&repo("acme/alpha", "run-1")).unwrap();
    store.upsert_repo(&repo("acme/beta", "run-1")).unwrap();

    let brief = BriefRecord {
        id: "brief-1".to_string(),
        run_id: "run-1".to_string(),
        score: 0.81,
        repo_ids: vec!["acme/alpha".to_string(), "acme/beta".to_string()],
        content_json: json!({ "title": "joint tooling" }),
        markdown: "> Score: 0.810000\n".to_string(),
        outreach_md: "> Manual review required.\n".to_string(),
        status: BriefStatus::Shortlisted,
        created_at: 3_000,
    };
    store.insert_brief(&brief).unwrap();

    store
        .update_brief_status("brief-1", BriefStatus::Approved)
        .unwrap();
    let got = store.get_brief("brief-1").unwrap().unwrap();
    assert_eq!(got.status, BriefStatus::Approved);
    assert_eq!(got.score, 0.81);
    assert_eq!(got.repo_ids, vec!["acme/alpha", "acme/beta"]);

    assert!(store
        .update_brief_status("missing", BriefStatus::Rejected)
        .is_err());
}

#[test]
fn repo_upsert_refreshes_metadata_without_duplicates() {
    let store = Store::open_in_memory().unwrap();
    insert_test_run(&store, "run-1");
    insert_test_run(&store, "run-2");

    store.upsert_repo(&repo("acme/alpha", "run-1")).unwrap();
    let mut updated = repo("acme/alpha", "run-2");
    updated.stars = 500;
    store.upsert_repo(&updated).unwrap();

    assert_eq!(store.count_repos().unwrap(), 1);
    let got = store.get_repo("acme/alpha").unwrap().unwrap();
    assert_eq!(got.stars, 500);
    assert_eq!(got.last_seen_run_id, "run-2");
}

#[test]
fn audit_prune_removes_only_old_rows() {
    let store = Store::open_in_memory().unwrap();
    insert_test_run(&store, "run-1");

    store
        .insert_audit("run-1", 100, "info", "test", "old.event", "old", &json!({}))
        .unwrap();
    store
        .insert_audit("run-1", 900, "info", "test", "new.event", "new", &json!({}))
        .unwrap();

    let deleted = store.prune_audit_log(500).unwrap();
    assert_eq!(deleted, 1);
    let remaining = store.audit_for_run("run-1").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].event, "new.event");
}

#[test]
fn history_query_returns_one_analysis_per_repo_from_other_runs() {
    let store = Store::open_in_memory().unwrap();
    insert_test_run(&store, "run-1");
    insert_test_run(&store, "run-2");
    insert_test_run(&store, "run-3");
    store.upsert_repo(&repo("acme/alpha", "run-1")).unwrap();
    store.upsert_repo(&repo("acme/beta", "run-1")).unwrap();

    let input = json!({});
    let output = json!({ "signals": {} });
    let reasons = json!({});
    for (run_id, repo_id, score) in [
        ("run-2", "acme/alpha", 0.9),
        ("run-3", "acme/alpha", 0.7),
        ("run-2", "acme/beta", 0.8),
        ("run-1", "acme/beta", 0.99),
    ] {
        let scores = json!({
            "interestingness": score,
            "novelty": score,
            "collaboration_potential": score
        });
        store
            .insert_analysis(&NewAnalysis {
                run_id,
                repo_id,
                model: "m",
                prompt_id: "repo_analysis",
                prompt_version: "v1",
                input_json: &input,
                output_json: &output,
                llm_scores_json: &scores,
                final_score: score,
                reasons_json: &reasons,
                created_at: 0,
            })
            .unwrap();
    }

    // Exclude run-1 and any repo already present in it.
    let history = store
        .top_history_analyses("run-1", &["acme/beta".to_string()], 10)
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].repo_id, "acme/alpha");
    assert_eq!(history[0].final_score, 0.9);
}
