use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use collab_scout::briefs::scoring::ScoringPolicy;
use collab_scout::github::Sleeper;
use collab_scout::briefs::{BriefEngine, BriefParams};
use collab_scout::export::export_run;
use collab_scout::llm::prompts::PromptRegistry;
use collab_scout::llm::LlmClient;
use collab_scout::orchestrator::RunOrchestrator;
use collab_scout::store::analysis::NewAnalysis;
use collab_scout::store::briefs::BriefStatus;
use collab_scout::store::repos::RepoRecord;
use collab_scout::store::runs::Run;
use collab_scout::store::Store;

fn insert_run(store: &Store, run_id: &str) {
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

struct RepoProfile<'a> {
    repo_id: &'a str,
    problem: &'a str,
    surface: Vec<&'a str>,
    primary: Vec<&'a str>,
    score: f64,
}

fn insert_analyzed_repo(store: &Store, run_id: &str, profile: &RepoProfile<'_>) {
    store
        .upsert_repo(&RepoRecord {
            full_name: profile.repo_id.to_string(),
            stars: 200,
            forks: 10,
            topics: vec!["database".to_string()],
            language: Some("Rust".to_string()),
            license: Some("MIT".to_string()),
            pushed_at: Some("2026-07-01T00:00:00Z".to_string()),
            archived: false,
            fork: false,
            last_seen_run_id: run_id.to_string(),
        })
        .unwrap();

    let output = json!({
        "repo": {"full_name": profile.repo_id},
        "scores": {
            "interestingness": profile.score,
            "novelty": profile.score,
            "collaboration_potential": profile.score
        },
        "reasons": {"interestingness": [], "novelty": [], "collaboration_potential": []},
        "signals": {
            "problem_summary": profile.problem,
            "who_is_it_for": "maintainers",
            "integration_surface": profile.surface,
        },
        "keywords": {
            "primary": profile.primary,
            "secondary": [],
            "search_queries": []
        }
    });
    let scores = output["scores"].clone();
    let input = json!({ "readme_sha256": "ab", "excerpt_chars": 100 });
    let reasons = output["reasons"].clone();
    store
        .insert_analysis(&NewAnalysis {
            run_id,
            repo_id: profile.repo_id,
            model: "test/model",
            prompt_id: "repo_analysis",
            prompt_version: "v1",
            input_json: &input,
            output_json: &output,
            llm_scores_json: &scores,
            final_score: profile.score,
            reasons_json: &reasons,
            created_at: 2_000,
        })
        .unwrap();
}

async fn mount_brief_responder(server: &MockServer) {
    let brief = json!({
        "title": "Joint embedding toolchain",
        "concept": "Pair the storage engine with the orchestration layer.",
        "repos": [
            {"full_name": "acme/alpha", "why_it_fits": "storage engine", "integration_role": "core"},
            {"full_name": "acme/beta", "why_it_fits": "workflow layer", "integration_role": "orchestrator"}
        ],
        "outreach_message": "Hello maintainers, we noticed complementary scopes."
    });
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": brief.to_string() } }]
        })))
        .mount(server)
        .await;
}

struct Setup {
    store: Store,
    llm: LlmClient,
    prompts: PromptRegistry,
    policy: ScoringPolicy,
    orchestrator: RunOrchestrator,
}

impl Setup {
    fn engine(&self) -> BriefEngine<'_> {
        BriefEngine {
            store: &self.store,
            llm: &self.llm,
            prompts: &self.prompts,
            policy: &self.policy,
            orchestrator: &self.orchestrator,
        }
    }

    fn params(&self) -> BriefParams {
        let mut params = BriefParams::from_policy(&self.policy, "test/model");
        params.history_candidates = 0;
        params
    }
}

#[derive(Default)]
struct NoopSleeper;

#[async_trait::async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

fn setup(llm_url: &str, run_id: &str) -> Setup {
    let store = Store::open_in_memory().unwrap();
    insert_run(&store, run_id);
    let llm = LlmClient::with_sleeper(llm_url, "sk-test", Arc::new(NoopSleeper)).unwrap();
    let prompts = PromptRegistry::builtin();
    let policy = ScoringPolicy::builtin();
    let orchestrator = RunOrchestrator::attach(store.clone(), run_id).unwrap();
    Setup {
        store,
        llm,
        prompts,
        policy,
        orchestrator,
    }
}

fn alpha() -> RepoProfile<'static> {
    RepoProfile {
        repo_id: "acme/alpha",
        problem: "embeddable vector storage engine",
        surface: vec!["API"],
        primary: vec!["vector", "storage"],
        score: 0.8,
    }
}

fn beta() -> RepoProfile<'static> {
    RepoProfile {
        repo_id: "acme/beta",
        problem: "workflow orchestration platform",
        surface: vec!["Plugin"],
        primary: vec!["workflow", "orchestration"],
        score: 0.8,
    }
}

#[tokio::test]
async fn complementary_pair_produces_a_shortlisted_brief() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(&s.store, "run-1", &beta());

    let summary = s.engine().generate(&s.params()).await.unwrap();
    assert_eq!(summary.generated, 1);
    assert_eq!(summary.shortlisted, 1);
    assert_eq!(summary.rejected_pairs, 0);
    assert_eq!(summary.failed, 0);

    let briefs = s.store.briefs_for_run("run-1").unwrap();
    assert_eq!(briefs.len(), 1);
    let brief = &briefs[0];
    assert_eq!(brief.status, BriefStatus::Shortlisted);
    // avg(final)=0.8, avg(collab)=0.8, overlap=0.8: 0.4*0.8+0.4*0.8+0.2*0.8.
    assert_eq!(brief.score, 0.8);
    assert_eq!(brief.repo_ids, vec!["acme/alpha", "acme/beta"]);
    assert!(brief.markdown.starts_with("> Score: 0.800000"));
    assert!(brief.outreach_md.contains("Manual review required"));
}

#[tokio::test]
async fn functional_competitors_are_rejected_without_an_llm_call() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(
        &s.store,
        "run-1",
        &RepoProfile {
            repo_id: "acme/alpha2",
            ..alpha()
        },
    );

    let summary = s.engine().generate(&s.params()).await.unwrap();
    assert_eq!(summary.generated, 0);
    assert_eq!(summary.rejected_pairs, 1);
    assert_eq!(
        s.store
            .count_audit_events("run-1", "briefs.pair_rejected_overlap")
            .unwrap(),
        1
    );
    assert!(llm_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn interop_trigger_allows_the_pair_with_a_penalty() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(
        &s.store,
        "run-1",
        &RepoProfile {
            repo_id: "acme/alpha2",
            primary: vec!["vector", "storage", "migration"],
            ..alpha()
        },
    );

    let summary = s.engine().generate(&s.params()).await.unwrap();
    assert_eq!(summary.generated, 1);
    assert_eq!(summary.rejected_pairs, 0);
    assert_eq!(
        s.store
            .count_audit_events("run-1", "briefs.pair_allowed_exception")
            .unwrap(),
        1
    );

    // Identical profiles: overlap 0.4+0.2+0.2 = 0.8, minus the 0.10 penalty.
    // brief_score = 0.4*0.8 + 0.4*0.8 + 0.2*(0.8-0.1) = 0.78.
    let briefs = s.store.briefs_for_run("run-1").unwrap();
    assert_eq!(briefs[0].score, 0.78);
}

#[tokio::test]
async fn anchor_dedup_gives_each_repo_one_top_billing() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(&s.store, "run-1", &beta());
    insert_analyzed_repo(
        &s.store,
        "run-1",
        &RepoProfile {
            repo_id: "acme/gamma",
            problem: "static analysis toolkit",
            surface: vec![],
            primary: vec!["analysis", "linting"],
            score: 0.8,
        },
    );

    let summary = s.engine().generate(&s.params()).await.unwrap();
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.generated, 1);
    assert_eq!(summary.shortlisted, 1);
    assert_eq!(summary.skipped_anchor_dedup, 2);
}

#[tokio::test]
async fn own_repo_is_exempt_from_anchor_dedup() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(&s.store, "run-1", &beta());
    insert_analyzed_repo(
        &s.store,
        "run-1",
        &RepoProfile {
            repo_id: "acme/gamma",
            problem: "static analysis toolkit",
            surface: vec![],
            primary: vec!["analysis", "linting"],
            score: 0.8,
        },
    );

    let mut params = s.params();
    params.own_repo = Some("acme/alpha".to_string());
    let summary = s.engine().generate(&params).await.unwrap();
    // alpha anchors nothing, so both alpha pairs synthesize.
    assert_eq!(summary.generated, 2);
    assert_eq!(summary.skipped_anchor_dedup, 1);
}

#[tokio::test]
async fn below_threshold_briefs_are_kept_with_rejected_status() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(&s.store, "run-1", &beta());

    let mut params = s.params();
    params.min_brief_score = 0.99;
    let summary = s.engine().generate(&params).await.unwrap();
    assert_eq!(summary.generated, 1);
    assert_eq!(summary.shortlisted, 0);
    assert_eq!(summary.rejected_by_threshold, 1);

    let briefs = s.store.briefs_for_run("run-1").unwrap();
    assert_eq!(briefs[0].status, BriefStatus::RejectedByThreshold);
}

#[tokio::test]
async fn history_injection_extends_the_pool_from_other_runs() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_run(&s.store, "run-0");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(
        &s.store,
        "run-0",
        &RepoProfile {
            repo_id: "acme/historic",
            problem: "workflow orchestration platform",
            surface: vec!["Plugin"],
            primary: vec!["workflow", "orchestration"],
            score: 0.9,
        },
    );

    let mut params = s.params();
    params.history_candidates = 5;
    let summary = s.engine().generate(&params).await.unwrap();
    assert_eq!(summary.pool_size, 2);
    assert_eq!(summary.generated, 1);
    assert_eq!(
        s.store
            .count_audit_events("run-1", "briefs.history.injected")
            .unwrap(),
        1
    );

    let briefs = s.store.briefs_for_run("run-1").unwrap();
    assert_eq!(briefs[0].repo_ids, vec!["acme/alpha", "acme/historic"]);
}

#[tokio::test]
async fn invalid_brief_output_counts_as_failed_and_continues() {
    let llm_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "NOT VALID JSON!!!" } }]
        })))
        .mount(&llm_server)
        .await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(&s.store, "run-1", &beta());

    let summary = s.engine().generate(&s.params()).await.unwrap();
    assert_eq!(summary.generated, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        s.store
            .count_audit_events("run-1", "llm.output.invalid_json")
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn export_writes_index_briefs_and_top_opportunities() {
    let llm_server = MockServer::start().await;
    mount_brief_responder(&llm_server).await;

    let s = setup(&llm_server.uri(), "run-1");
    insert_analyzed_repo(&s.store, "run-1", &alpha());
    insert_analyzed_repo(&s.store, "run-1", &beta());
    s.engine().generate(&s.params()).await.unwrap();

    let out = tempdir().unwrap();
    let summary = export_run(&s.store, "run-1", out.path(), 3).unwrap();
    assert_eq!(summary.briefs_exported, 1);
    assert_eq!(summary.top_opportunities, 1);

    let index = std::fs::read_to_string(out.path().join("index.md")).unwrap();
    assert!(index.contains("Manual review required. This tool does not post automatically."));

    let briefs = s.store.briefs_for_run("run-1").unwrap();
    let brief_path = out.path().join("briefs").join(format!("{}.md", briefs[0].id));
    let outreach_path = out
        .path()
        .join("briefs")
        .join(format!("{}_outreach.md", briefs[0].id));
    assert!(brief_path.exists());
    let outreach = std::fs::read_to_string(outreach_path).unwrap();
    assert!(outreach.starts_with("> Manual review required."));

    assert!(out.path().join("TOP_OPPORTUNITY_1.md").exists());
}
