use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use url::Url;

use crate::{
    config::{self, Config},
    github::GitHubOptions,
    rewrite::RewriteRule,
    travis::GoVersion,
};

const BUILD_INFO_HUMAN: &str = env!("BUILD_INFO_HUMAN");

#[derive(Args, Debug, Clone)]
struct RewriteArgs {
    /// Outdated import path to search for and replace
    #[arg(long, help_heading = "Rewrite", value_name = "PATH", default_value = "github.com/golang/lint/golint")]
    pub from: String,

    /// Replacement import path
    #[arg(long, help_heading = "Rewrite", value_name = "PATH", default_value = "golang.org/x/lint/golint")]
    pub to: String,

    /// CI file to inspect and rewrite, relative to the repository root
    #[arg(long, help_heading = "Rewrite", value_name = "FILE", default_value = config::DEFAULT_TARGET_FILE)]
    pub file: String,

    /// Raw code search query (defaults to '<from> filename:<file>')
    #[arg(long, help_heading = "Rewrite", value_name = "SEARCH-QUERY")]
    pub query: Option<String>,

    /// Oldest Go release the CI file may target
    #[arg(long = "min-go-version", help_heading = "Rewrite", value_name = "VERSION", default_value = "1.9")]
    pub min_go_version: String,
}

#[derive(Args, Debug, Clone)]
struct PullRequestArgs {
    /// Commit message for the rewrite
    #[arg(long = "commit-message", help_heading = "Pull request", value_name = "TEXT", default_value = config::DEFAULT_MESSAGE)]
    pub commit_message: String,

    /// Pull request title
    #[arg(long, help_heading = "Pull request", value_name = "TEXT", default_value = config::DEFAULT_MESSAGE)]
    pub title: String,

    /// Pull request body
    #[arg(long, help_heading = "Pull request", value_name = "TEXT", default_value = config::DEFAULT_BODY)]
    pub body: String,
}

#[derive(Args, Debug, Clone)]
struct PacingArgs {
    /// Maximum number of search result pages per pass
    #[arg(long = "max-pages", help_heading = "Pacing", value_name = "NUM", default_value_t = config::DEFAULT_MAX_PAGES)]
    pub max_pages: u32,

    /// Delay between search result pages (e.g. 2050ms, 3s)
    #[arg(long = "page-delay", help_heading = "Pacing", value_name = "DURATION", default_value = "2050ms")]
    pub page_delay: String,

    /// Times to look for a new fork before giving up
    #[arg(long = "fork-attempts", help_heading = "Pacing", value_name = "NUM", default_value_t = config::DEFAULT_FORK_POLL_ATTEMPTS)]
    pub fork_attempts: u32,

    /// Delay between looks for a new fork
    #[arg(long = "fork-delay", help_heading = "Pacing", value_name = "DURATION", default_value = "30s")]
    pub fork_delay: String,
}

#[derive(Parser, Debug)]
#[command(
    name = "ghbot",
    about = "A GitHub bot that searches for an outdated import path in CI configuration and opens pull requests fixing it"
)]
#[command(long_version = BUILD_INFO_HUMAN)]
struct CliArgs {
    /// GitHub API token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Connect to a specific GitHub server, provide full API URL (e.g. https://github.example.com/api/v3/)
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Check interval (e.g. 500ms, 10s, 1m, 3h; unitless implies seconds)
    #[arg(long, value_name = "DURATION", default_value = "30s")]
    pub interval: String,

    /// Run a single pass and exit
    #[arg(long)]
    pub once: bool,

    /// Report qualifying repositories without forking or opening pull requests
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(flatten)]
    pub rewrite: RewriteArgs,

    #[command(flatten)]
    pub pull_request: PullRequestArgs,

    #[command(flatten)]
    pub pacing: PacingArgs,
}

/// Parsed command line: what to do, and how to reach GitHub.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub config: Config,
    pub github: GitHubOptions,
    pub debug: bool,
}

impl CliArgs {
    pub fn validate(&self) -> Result<()> {
        if self.rewrite.from.trim().is_empty() {
            anyhow::bail!("--from cannot be empty");
        }
        if self.rewrite.from == self.rewrite.to {
            anyhow::bail!("--from and --to must differ");
        }
        if self.rewrite.file.trim().is_empty() {
            anyhow::bail!("--file cannot be empty");
        }
        if self.pacing.max_pages == 0 {
            anyhow::bail!("--max-pages must be at least 1");
        }
        if self.pull_request.title.trim().is_empty() {
            anyhow::bail!("--title cannot be empty");
        }
        Ok(())
    }
}

/// Parses a duration such as `500ms`, `30s`, `5m` or `2h`. A bare
/// number is taken as seconds.
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim();

    if let Ok(seconds) = duration_str.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    if let Some(millis_str) = duration_str.strip_suffix("ms") {
        let millis: u64 = millis_str
            .parse()
            .with_context(|| format!("Invalid milliseconds: '{}'", millis_str))?;
        return Ok(Duration::from_millis(millis));
    }

    if let Some(seconds_str) = duration_str.strip_suffix('s') {
        let seconds: u64 = seconds_str
            .parse()
            .with_context(|| format!("Invalid seconds: '{}'", seconds_str))?;
        return Ok(Duration::from_secs(seconds));
    }

    if let Some(minutes_str) = duration_str.strip_suffix('m') {
        let minutes: u64 = minutes_str
            .parse()
            .with_context(|| format!("Invalid minutes: '{}'", minutes_str))?;
        return scaled_secs(minutes, 60, duration_str);
    }

    if let Some(hours_str) = duration_str.strip_suffix('h') {
        let hours: u64 = hours_str
            .parse()
            .with_context(|| format!("Invalid hours: '{}'", hours_str))?;
        return scaled_secs(hours, 3600, duration_str);
    }

    anyhow::bail!(
        "Invalid duration format '{}'. Supported formats: unitless number (seconds), '500ms', '30s', '5m', '2h'",
        duration_str
    )
}

fn scaled_secs(count: u64, unit: u64, raw: &str) -> Result<Duration> {
    count
        .checked_mul(unit)
        .map(Duration::from_secs)
        .with_context(|| format!("Duration '{}' is too large", raw))
}

fn parse_api_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw).with_context(|| format!("failed to parse provided url: '{}'", raw))?;

    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("GitHub API URL must use http or https, got: '{}'", raw);
    }
    // Relative API paths are joined onto the base, so it needs a trailing slash.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

fn build_invocation(cli: CliArgs) -> Result<Invocation> {
    cli.validate()?;

    let interval = parse_duration(&cli.interval)
        .with_context(|| format!("Invalid check interval: '{}'", cli.interval))?;
    if interval.is_zero() {
        anyhow::bail!("Check interval must be positive");
    }

    let min_go_version: GoVersion = cli
        .rewrite
        .min_go_version
        .parse()
        .context("Invalid --min-go-version")?;

    let api_url = cli.url.as_deref().map(parse_api_url).transpose()?;

    let config = Config {
        rewrite: RewriteRule::new(cli.rewrite.from, cli.rewrite.to),
        target_file: cli.rewrite.file.trim_start_matches('/').to_string(),
        query: cli
            .rewrite
            .query
            .filter(|q| !q.trim().is_empty()),
        min_go_version,
        commit_message: cli.pull_request.commit_message,
        pr_title: cli.pull_request.title,
        pr_body: cli.pull_request.body,
        interval,
        once: cli.once,
        dry_run: cli.dry_run,
        max_pages: cli.pacing.max_pages,
        page_delay: parse_duration(&cli.pacing.page_delay).context("Invalid --page-delay")?,
        fork_poll_attempts: cli.pacing.fork_attempts.max(1),
        fork_poll_delay: parse_duration(&cli.pacing.fork_delay).context("Invalid --fork-delay")?,
    };

    Ok(Invocation {
        config,
        github: GitHubOptions {
            token: cli.token.filter(|t| !t.trim().is_empty()),
            api_url,
        },
        debug: cli.debug,
    })
}

/// Parses command-line arguments into a run configuration.
///
/// Help and version requests surface as a [`clap::Error`] inside the
/// returned error so the caller decides how to print them.
pub fn parse_args<I, T>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = CliArgs::try_parse_from(args)?;
    build_invocation(cli)
}
