//! ghbot: finds repositories whose CI configuration still installs a
//! tool from an outdated import path, and sends each of them a pull
//! request that fixes it.
//!
//! The bot searches code on GitHub, checks that the repository's CI file
//! only targets Go releases new enough for the replacement path, forks
//! the repository, commits the rewritten file and opens a pull request
//! upstream. It can run once or poll on an interval.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod github;
pub mod pipeline;
pub mod rewrite;
pub mod travis;
pub mod types;

pub use agent::{AgentSummary, run, shutdown_on_signal};
pub use cli::{Invocation, parse_args};
pub use config::Config;
pub use error::ForgeError;
pub use github::{GitHub, GitHubOptions};
pub use pipeline::{Outcome, Pipeline, RunReport, SkipReason};
pub use rewrite::RewriteRule;
pub use travis::{GoVersion, Verdict};
pub use types::{
    FileUpdate, Forge, NewPullRequest, PullRequestRef, Repo, RepoError, RepoFile, RepoInfo,
    SearchHit, SearchPage,
};
