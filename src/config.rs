use std::time::Duration;

use crate::{rewrite::RewriteRule, travis::GoVersion};

/// Code search allows 30 requests per minute for authenticated users.
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(2050);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_FORK_POLL_ATTEMPTS: u32 = 4;
pub const DEFAULT_FORK_POLL_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PAGES: u32 = 10;
/// Forked repositories waiting for a commit.
pub const FORK_QUEUE_DEPTH: usize = 10;
pub const SEARCH_PAGE_SIZE: u8 = 100;

pub const DEFAULT_TARGET_FILE: &str = ".travis.yml";
pub const DEFAULT_MESSAGE: &str = "Fix golint import path";
pub const DEFAULT_BODY: &str = "The golint import path moved from \
`github.com/golang/lint/golint` to `golang.org/x/lint/golint`. \
This updates the CI configuration to install it from the new location.";

/// Everything one pipeline pass and the polling loop need.
#[derive(Debug, Clone)]
pub struct Config {
    pub rewrite: RewriteRule,
    /// CI file, relative to the repository root.
    pub target_file: String,
    /// Overrides the query derived from `rewrite` and `target_file`.
    pub query: Option<String>,
    pub min_go_version: GoVersion,
    pub commit_message: String,
    pub pr_title: String,
    pub pr_body: String,
    pub interval: Duration,
    pub once: bool,
    pub dry_run: bool,
    pub max_pages: u32,
    pub page_delay: Duration,
    pub fork_poll_attempts: u32,
    pub fork_poll_delay: Duration,
}

impl Config {
    pub fn search_query(&self) -> String {
        match &self.query {
            Some(query) => query.clone(),
            None => format!("{} filename:{}", self.rewrite.from, self.target_file),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rewrite: RewriteRule::default(),
            target_file: DEFAULT_TARGET_FILE.to_string(),
            query: None,
            min_go_version: GoVersion::new(1, 9, 0),
            commit_message: DEFAULT_MESSAGE.to_string(),
            pr_title: DEFAULT_MESSAGE.to_string(),
            pr_body: DEFAULT_BODY.to_string(),
            interval: DEFAULT_INTERVAL,
            once: false,
            dry_run: false,
            max_pages: DEFAULT_MAX_PAGES,
            page_delay: DEFAULT_PAGE_DELAY,
            fork_poll_attempts: DEFAULT_FORK_POLL_ATTEMPTS,
            fork_poll_delay: DEFAULT_FORK_POLL_DELAY,
        }
    }
}
