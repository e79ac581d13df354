#![forbid(unsafe_code)]

//! # collab-scout
//!
//! Local-first GitHub collaboration discovery. Given a topic query, find
//! active repositories, analyze each with an LLM, and rank two-to-four-repo
//! collaboration briefs by a deterministic score. Every decision (inputs,
//! model and prompt identifiers, derived scores, reasons) lands in a local
//! SQLite store so any run can be audited or replayed offline.
//!
//! The crate is a library plus one binary (`scout`). Components:
//! store, secret redactor, cached/throttled GitHub client, strict-JSON LLM
//! client, run orchestrator, two-pass discovery pipeline, and the brief
//! engine with its functional-overlap competitor filter.

pub mod briefs;
pub mod config;
pub mod export;
pub mod github;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod redact;
pub mod store;

pub use briefs::scoring::{replay_run, ReplayResult, ScoringPolicy};
pub use briefs::{BriefEngine, BriefParams};
pub use config::Config;
pub use github::GithubClient;
pub use llm::LlmClient;
pub use orchestrator::{RunOrchestrator, StepName};
pub use pipeline::{DiscoveryPipeline, ExpandParams, ScoutParams};
pub use store::Store;
