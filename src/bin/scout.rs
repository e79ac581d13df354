#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use collab_scout::briefs::scoring::{replay_run, ScoringPolicy};
use collab_scout::briefs::{BriefEngine, BriefParams};
use collab_scout::config::Config;
use collab_scout::export::{dump_run, export_run};
use collab_scout::github::rate_limit::SystemClock;
use collab_scout::github::{AuditThrottleSink, GithubClient, TokioSleeper};
use collab_scout::llm::prompts::PromptRegistry;
use collab_scout::llm::LlmClient;
use collab_scout::orchestrator::{RunOrchestrator, StepName};
use collab_scout::pipeline::query::build_search_query;
use collab_scout::pipeline::{DiscoveryPipeline, ExpandParams, ScoutParams};
use collab_scout::store::runs::StepStatus;
use collab_scout::store::Store;

#[derive(Parser)]
#[command(name = "scout", version, about = "Collaboration Scout CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Config and store health checks; no side effects
    Doctor {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        verbose: bool,
    },
    /// Create a run and execute pass 1 + analysis
    #[command(name = "scout:run")]
    ScoutRun {
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 180)]
        days: i64,
        #[arg(long, default_value_t = 50)]
        stars: i64,
        #[arg(long)]
        max_stars: Option<i64>,
        #[arg(long, default_value_t = 100)]
        top: usize,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        include_forks: bool,
        /// Analysis model (defaults to CS_MODEL)
        #[arg(long)]
        model: Option<String>,
        /// Create the run and record the plan without network calls
        #[arg(long)]
        dry: bool,
    },
    /// Run pass 2 for an existing run
    #[command(name = "scout:expand")]
    ScoutExpand {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value_t = 15)]
        pass2_stars: i64,
        #[arg(long)]
        pass2_max_stars: Option<i64>,
        #[arg(long, default_value_t = 10)]
        max_queries: usize,
        #[arg(long)]
        model: Option<String>,
    },
    /// Group analyzed repos into scored collaboration briefs
    #[command(name = "briefs:generate")]
    BriefsGenerate {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long, default_value_t = 20)]
        max_briefs: usize,
        #[arg(long)]
        overlap_threshold: Option<f64>,
        #[arg(long)]
        overlap_penalty: Option<f64>,
        #[arg(long)]
        history_candidates: Option<usize>,
        /// Exempt this repo from anchor dedup
        #[arg(long)]
        own_repo: Option<String>,
        /// Also enumerate three-repo groups
        #[arg(long)]
        triples: bool,
        #[arg(long)]
        model: Option<String>,
    },
    /// Export a run's briefs as Markdown
    #[command(name = "briefs:export")]
    BriefsExport {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        top_opportunities: Option<usize>,
    },
    /// Apply pending schema migrations
    #[command(name = "db:migrate")]
    DbMigrate,
    /// Reclaim store space
    #[command(name = "db:vacuum")]
    DbVacuum,
    /// Delete HTTP cache rows older than --days
    #[command(name = "cache:prune")]
    CachePrune {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Delete audit rows older than --days
    #[command(name = "logs:prune")]
    LogsPrune {
        #[arg(long, default_value_t = 90)]
        days: i64,
    },
    /// Recompute stored scores under the current policy (read-only)
    #[command(name = "debug:replay")]
    DebugReplay {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Print the full redacted bundle for a run
    #[command(name = "debug:dump-run")]
    DebugDumpRun {
        #[arg(long)]
        run_id: String,
    },
}

fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(err) => eprintln!("{{\"error\":\"serialization failed: {err}\"}}"),
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.tracing_directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_prompts(config: &Config) -> Result<PromptRegistry, Box<dyn std::error::Error>> {
    match &config.prompt_dir {
        Some(dir) => Ok(PromptRegistry::from_dir(dir)?),
        None => Ok(PromptRegistry::builtin()),
    }
}

fn load_policy(config: &Config) -> Result<ScoringPolicy, Box<dyn std::error::Error>> {
    match &config.policy_path {
        Some(path) => Ok(ScoringPolicy::from_path(path)?),
        None => Ok(ScoringPolicy::builtin()),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn github_client(
    config: &Config,
    store: &Store,
    run_id: &str,
) -> Result<GithubClient, Box<dyn std::error::Error>> {
    Ok(GithubClient::with_parts(
        &config.github_base_url,
        config.github_token.as_deref(),
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(TokioSleeper),
        Arc::new(AuditThrottleSink::new(store.clone(), run_id)),
    )?)
}

fn llm_client(config: &Config) -> Result<LlmClient, Box<dyn std::error::Error>> {
    let api_key = config
        .openrouter_api_key
        .as_deref()
        .ok_or("OPENROUTER_API_KEY is required for LLM calls")?;
    Ok(LlmClient::new(&config.llm_base_url, api_key)?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            emit(&json!({ "error": err.to_string(), "kind": "config_invalid" }));
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            emit(&json!({ "error": err.to_string() }));
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Commands::Doctor { json, verbose } => doctor(&config, json, verbose),

        Commands::ScoutRun {
            query,
            days,
            stars,
            max_stars,
            top,
            lang,
            include_forks,
            model,
            dry,
        } => {
            config.validate(!dry)?;
            let store = Store::open(&config.db_path)?;
            let _lock = store.lock_exclusive()?;

            let mut params = ScoutParams::new(query, model.unwrap_or_else(|| config.model.clone()));
            params.days = days;
            params.stars = stars;
            params.max_stars = max_stars;
            params.top_n = top;
            params.language = lang;
            params.include_forks = include_forks;

            let orchestrator =
                RunOrchestrator::create(store.clone(), &params.as_json(), &config.short_hash())?;
            let init = orchestrator.start_step(StepName::InitRun)?;
            init.finish(StepStatus::Success, json!({ "dry": dry }))?;

            if dry {
                let search_query = build_search_query(
                    &params.query,
                    &params.qualifiers(),
                    chrono::Utc::now().date_naive(),
                );
                store.insert_github_query(
                    orchestrator.run_id(),
                    1,
                    &search_query,
                    &params.as_json(),
                )?;
                emit(&json!({
                    "run_id": orchestrator.run_id(),
                    "dry": true,
                    "query": search_query,
                }));
                return Ok(ExitCode::SUCCESS);
            }

            let github = github_client(&config, &store, orchestrator.run_id())?;
            let llm = llm_client(&config)?;
            let prompts = load_prompts(&config)?;
            let policy = load_policy(&config)?;

            let pipeline = DiscoveryPipeline {
                store: &store,
                github: &github,
                llm: &llm,
                prompts: &prompts,
                policy: &policy,
                orchestrator: &orchestrator,
            };
            let summary = pipeline.run_pass1(&params).await?;
            emit(&summary);
            Ok(exit_for(summary.ok()))
        }

        Commands::ScoutExpand {
            run_id,
            pass2_stars,
            pass2_max_stars,
            max_queries,
            model,
        } => {
            config.validate(true)?;
            let store = Store::open(&config.db_path)?;
            let _lock = store.lock_exclusive()?;
            let orchestrator = RunOrchestrator::attach(store.clone(), &run_id)?;

            let mut params = ExpandParams::new(model.unwrap_or_else(|| config.model.clone()));
            params.pass2_stars = pass2_stars;
            params.pass2_max_stars = pass2_max_stars;
            params.max_queries = max_queries;

            let github = github_client(&config, &store, orchestrator.run_id())?;
            let llm = llm_client(&config)?;
            let prompts = load_prompts(&config)?;
            let policy = load_policy(&config)?;

            let pipeline = DiscoveryPipeline {
                store: &store,
                github: &github,
                llm: &llm,
                prompts: &prompts,
                policy: &policy,
                orchestrator: &orchestrator,
            };
            let summary = pipeline.run_pass2(&params).await?;
            emit(&summary);
            Ok(exit_for(summary.ok()))
        }

        Commands::BriefsGenerate {
            run_id,
            min_score,
            max_briefs,
            overlap_threshold,
            overlap_penalty,
            history_candidates,
            own_repo,
            triples,
            model,
        } => {
            config.validate(false)?;
            let store = Store::open(&config.db_path)?;
            let _lock = store.lock_exclusive()?;
            let orchestrator = RunOrchestrator::attach(store.clone(), &run_id)?;

            let llm = llm_client(&config)?;
            let prompts = load_prompts(&config)?;
            let policy = load_policy(&config)?;

            let mut params =
                BriefParams::from_policy(&policy, model.unwrap_or_else(|| config.model.clone()));
            params.max_briefs = max_briefs;
            params.overlap_threshold = overlap_threshold.unwrap_or(config.overlap_threshold);
            params.overlap_exception_penalty =
                overlap_penalty.unwrap_or(config.overlap_exception_penalty);
            params.history_candidates = history_candidates.unwrap_or(config.history_candidates);
            params.include_triples = triples;
            params.own_repo = own_repo;
            if let Some(min_score) = min_score {
                params.min_brief_score = min_score;
            }

            let engine = BriefEngine {
                store: &store,
                llm: &llm,
                prompts: &prompts,
                policy: &policy,
                orchestrator: &orchestrator,
            };
            let summary = engine.generate(&params).await?;
            emit(&summary);
            Ok(ExitCode::SUCCESS)
        }

        Commands::BriefsExport {
            run_id,
            out,
            top_opportunities,
        } => {
            config.validate(false)?;
            let store = Store::open(&config.db_path)?;
            let orchestrator = RunOrchestrator::attach(store.clone(), &run_id)?;
            let step = orchestrator.start_step(StepName::ExportMarkdown)?;
            match export_run(
                &store,
                &run_id,
                &out,
                top_opportunities.unwrap_or(config.top_opportunities),
            ) {
                Ok(summary) => {
                    step.finish(
                        StepStatus::Success,
                        json!({ "briefs": summary.briefs_exported }),
                    )?;
                    emit(&summary);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    step.finish(StepStatus::Failed, json!({ "error": err.to_string() }))?;
                    Err(err.into())
                }
            }
        }

        Commands::DbMigrate => {
            let store = Store::open(&config.db_path)?;
            let applied = store.applied_migrations()?;
            emit(&json!({ "migrations": applied }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::DbVacuum => {
            let store = Store::open(&config.db_path)?;
            store.vacuum()?;
            emit(&json!({ "vacuumed": true }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::CachePrune { days } => {
            let store = Store::open(&config.db_path)?;
            let cutoff = now_ms() - days * 86_400_000;
            let deleted = store.prune_http_cache(cutoff)?;
            emit(&json!({ "deleted": deleted }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::LogsPrune { days } => {
            let store = Store::open(&config.db_path)?;
            let cutoff = now_ms() - days * 86_400_000;
            let deleted = store.prune_audit_log(cutoff)?;
            emit(&json!({ "deleted": deleted }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::DebugReplay { run_id, policy } => {
            let store = Store::open(&config.db_path)?;
            let policy = match policy {
                Some(path) => ScoringPolicy::from_path(path)?,
                None => load_policy(&config)?,
            };
            let result = replay_run(&store, &run_id, &policy)?;
            emit(&result);
            Ok(ExitCode::SUCCESS)
        }

        Commands::DebugDumpRun { run_id } => {
            let store = Store::open(&config.db_path)?;
            let bundle = dump_run(&store, &run_id)?;
            emit(&bundle);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn doctor(config: &Config, _json: bool, verbose: bool) -> Result<ExitCode, Box<dyn std::error::Error>> {
    #[derive(Serialize)]
    struct Check {
        name: &'static str,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    }

    let mut checks: Vec<Check> = Vec::new();
    let mut fatal = false;

    match config.validate(false) {
        Ok(()) => checks.push(Check {
            name: "config",
            ok: true,
            detail: None,
        }),
        Err(err) => {
            fatal = true;
            checks.push(Check {
                name: "config",
                ok: false,
                detail: Some(err.to_string()),
            });
        }
    }

    match Store::open(&config.db_path) {
        Ok(store) => {
            let detail = store
                .applied_migrations()
                .map(|m| format!("{} migrations applied", m.len()))
                .ok();
            checks.push(Check {
                name: "store",
                ok: true,
                detail: if verbose { detail } else { None },
            });
        }
        Err(err) => {
            fatal = true;
            checks.push(Check {
                name: "store",
                ok: false,
                detail: Some(err.to_string()),
            });
        }
    }

    match load_prompts(config) {
        Ok(_) => checks.push(Check {
            name: "prompts",
            ok: true,
            detail: None,
        }),
        Err(err) => {
            fatal = true;
            checks.push(Check {
                name: "prompts",
                ok: false,
                detail: Some(err.to_string()),
            });
        }
    }

    match load_policy(config) {
        Ok(policy) => checks.push(Check {
            name: "policy",
            ok: true,
            detail: verbose.then(|| format!("version {}", policy.version)),
        }),
        Err(err) => {
            fatal = true;
            checks.push(Check {
                name: "policy",
                ok: false,
                detail: Some(err.to_string()),
            });
        }
    }

    // Credentials are advisory here; live commands enforce them.
    checks.push(Check {
        name: "github_token",
        ok: config.github_token.is_some(),
        detail: None,
    });
    checks.push(Check {
        name: "openrouter_api_key",
        ok: config.openrouter_api_key.is_some(),
        detail: None,
    });

    emit(&json!({ "ok": !fatal, "checks": checks }));
    Ok(if fatal { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
