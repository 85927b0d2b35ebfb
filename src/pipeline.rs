//! The search → fork → fix pipeline.
//!
//! Three stages run concurrently and hand work to each other over bounded
//! channels. The search stage screens code search hits and emits
//! candidates; the fork stage checks for an existing pull request and
//! forks each candidate in its own task; the fix stage waits for each fork
//! to materialise, commits the rewritten file and opens the pull request.
//!
//! A fatal [`ForgeError`] in any stage cancels the others and is returned
//! from [`Pipeline::run`]. Every other error is recorded against the
//! repository it concerns and the pass carries on.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};

use tokio::{
    sync::mpsc,
    task::{JoinError, JoinSet},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, FORK_QUEUE_DEPTH, SEARCH_PAGE_SIZE},
    error::ForgeError,
    travis::{self, Verdict},
    types::{
        FileUpdate, Forge, NewPullRequest, PullRequestRef, Repo, RepoFile, RepoInfo, SearchHit,
    },
};

/// Why a repository was left alone.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    AlreadyFixed,
    Ineligible(Verdict),
    DuplicatePullRequest(PullRequestRef),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyFixed => write!(f, "already fixed"),
            SkipReason::Ineligible(verdict) => write!(f, "{verdict}"),
            SkipReason::DuplicatePullRequest(pr) => {
                write!(f, "pull request #{} already exists", pr.number)
            }
        }
    }
}

/// What happened to one repository during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Opened {
        upstream: Repo,
        fork: Repo,
        pull_request: PullRequestRef,
    },
    /// Dry run: the repository qualifies but nothing was changed.
    Planned { repo: Repo },
    Skipped { repo: Repo, reason: SkipReason },
    Failed { repo: Repo, error: String },
}

impl Outcome {
    pub fn repo(&self) -> &Repo {
        match self {
            Outcome::Opened { upstream, .. } => upstream,
            Outcome::Planned { repo }
            | Outcome::Skipped { repo, .. }
            | Outcome::Failed { repo, .. } => repo,
        }
    }

    /// Anything but a failure means the repository needs no more work in
    /// this process.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Outcome::Failed { .. })
    }

    fn failed(repo: &Repo, error: &ForgeError) -> Self {
        Outcome::Failed {
            repo: repo.clone(),
            error: error.to_string(),
        }
    }
}

/// Summary of a single pipeline pass.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub pages: u32,
    pub hits: usize,
    pub outcomes: Vec<Outcome>,
    /// Set when code search failed part way and the pass stopped early.
    pub search_error: Option<String>,
}

impl RunReport {
    pub fn opened(&self) -> impl Iterator<Item = &PullRequestRef> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            Outcome::Opened { pull_request, .. } => Some(pull_request),
            _ => None,
        })
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| pred(outcome)).count()
    }
}

/// A repository whose CI file qualified for rewriting.
#[derive(Debug, Clone)]
struct Candidate {
    upstream: Repo,
}

/// A requested fork waiting for its commit.
#[derive(Debug, Clone)]
struct ForkJob {
    upstream: RepoInfo,
    fork: Repo,
}

enum Screened {
    Candidate(Candidate),
    Skipped(Outcome),
}

#[derive(Default)]
struct SearchSummary {
    pages: u32,
    hits: usize,
    outcomes: Vec<Outcome>,
    error: Option<String>,
}

pub struct Pipeline<F> {
    forge: Arc<F>,
    config: Arc<Config>,
    login: String,
    seen: Arc<Mutex<HashSet<Repo>>>,
}

impl<F> Pipeline<F>
where
    F: Forge + Send + Sync + 'static,
{
    /// `login` is the authenticated account that owns the forks.
    pub fn new(forge: Arc<F>, config: Arc<Config>, login: impl Into<String>) -> Self {
        Self {
            forge,
            config,
            login: login.into(),
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs one full pass. Stops early, returning what it has, if
    /// `shutdown` is cancelled.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<RunReport, ForgeError> {
        let cancel = shutdown.child_token();
        let claimed = Mutex::new(Vec::new());
        let (candidate_tx, candidate_rx) = mpsc::channel(1);
        let (fork_tx, fork_rx) = mpsc::channel(FORK_QUEUE_DEPTH);

        let (search, forks, fixes) = tokio::join!(
            cancel_on_error(&cancel, self.search_stage(candidate_tx, &claimed, &cancel)),
            cancel_on_error(&cancel, self.fork_stage(candidate_rx, fork_tx, &cancel)),
            cancel_on_error(&cancel, self.fix_stage(fork_rx, &cancel)),
        );

        {
            let claimed = claimed.into_inner().unwrap_or_else(|e| e.into_inner());
            let settled: HashSet<&Repo> = [
                search.as_ref().ok().map(|summary| &summary.outcomes),
                forks.as_ref().ok(),
                fixes.as_ref().ok(),
            ]
            .into_iter()
            .flatten()
            .flatten()
            .filter(|outcome| outcome.is_settled())
            .map(Outcome::repo)
            .collect();
            self.release_unsettled(&claimed, &settled);
        }

        let search = search?;
        let mut outcomes = search.outcomes;
        outcomes.extend(forks?);
        outcomes.extend(fixes?);

        Ok(RunReport {
            pages: search.pages,
            hits: search.hits,
            outcomes,
            search_error: search.error,
        })
    }

    /// Repositories claimed this pass that failed, or were dropped when
    /// the pass stopped, are retried on the next pass.
    fn release_unsettled(&self, claimed: &[Repo], settled: &HashSet<&Repo>) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        for repo in claimed.iter().filter(|repo| !settled.contains(repo)) {
            debug!(%repo, "Releasing repository for the next pass");
            seen.remove(repo);
        }
    }

    async fn search_stage(
        &self,
        tx: mpsc::Sender<Candidate>,
        claimed: &Mutex<Vec<Repo>>,
        cancel: &CancellationToken,
    ) -> Result<SearchSummary, ForgeError> {
        let query = self.config.search_query();
        let mut summary = SearchSummary::default();
        let mut page = 1;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let results = tokio::select! {
                _ = cancel.cancelled() => break,
                results = self.forge.search_code(&query, page, SEARCH_PAGE_SIZE) => results,
            };
            let results = match results {
                Ok(results) => results,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(page, error = %err, "Code search failed, ending pass early");
                    summary.error = Some(err.to_string());
                    break;
                }
            };
            summary.pages += 1;
            debug!(
                page,
                hits = results.hits.len(),
                total = ?results.total_count,
                "Fetched search page"
            );

            for hit in results.hits {
                if cancel.is_cancelled() {
                    return Ok(summary);
                }
                summary.hits += 1;
                if !self.claim(&hit) {
                    continue;
                }
                claimed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(hit.repo.clone());

                let screened = tokio::select! {
                    _ = cancel.cancelled() => return Ok(summary),
                    screened = self.screen(hit) => screened?,
                };
                match screened {
                    Screened::Candidate(candidate) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(summary),
                            sent = tx.send(candidate) => {
                                if let Err(unsent) = sent {
                                    let repo = &unsent.0.upstream;
                                    debug!(%repo, "Fork stage stopped, dropping candidate");
                                    return Ok(summary);
                                }
                            }
                        }
                    }
                    Screened::Skipped(outcome) => summary.outcomes.push(outcome),
                }
            }

            if !results.has_next || page >= self.config.max_pages {
                break;
            }
            page += 1;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.page_delay) => {}
            }
        }

        Ok(summary)
    }

    /// Marks a hit's repository as taken for this process. Returns false
    /// for hits that need no work: nested files, the bot's own forks and
    /// repositories already handled.
    fn claim(&self, hit: &SearchHit) -> bool {
        if hit.path != self.config.target_file {
            debug!(repo = %hit.repo, path = %hit.path, "Ignoring match outside repository root");
            return false;
        }
        if hit.repo.is_owned_by(&self.login) {
            return false;
        }
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hit.repo.clone())
    }

    async fn screen(&self, hit: SearchHit) -> Result<Screened, ForgeError> {
        let target = &self.config.target_file;
        let file = match self.forge.file_content(&hit.repo, target).await {
            Ok(file) => file,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(repo = %hit.repo, error = %err, "Unable to read CI file");
                return Ok(Screened::Skipped(Outcome::failed(&hit.repo, &err)));
            }
        };

        if !self.config.rewrite.matches(&file.content) {
            return Ok(Screened::Skipped(Outcome::Skipped {
                repo: hit.repo,
                reason: SkipReason::AlreadyFixed,
            }));
        }

        let verdict = travis::check(&file.content, self.config.min_go_version);
        if !verdict.is_supported() {
            debug!(repo = %hit.repo, %verdict, "Repository does not qualify");
            return Ok(Screened::Skipped(Outcome::Skipped {
                repo: hit.repo,
                reason: SkipReason::Ineligible(verdict),
            }));
        }

        info!(repo = %hit.repo, "Found candidate");
        Ok(Screened::Candidate(Candidate { upstream: hit.repo }))
    }

    async fn fork_stage(
        &self,
        mut rx: mpsc::Receiver<Candidate>,
        tx: mpsc::Sender<ForkJob>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome>, ForgeError> {
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    absorb(joined, &mut outcomes)?;
                }
                received = rx.recv() => {
                    let Some(candidate) = received else { break };

                    if self.config.dry_run {
                        info!(repo = %candidate.upstream, "Dry run: would fork and open a pull request");
                        outcomes.push(Outcome::Planned {
                            repo: candidate.upstream,
                        });
                        continue;
                    }

                    let forge = Arc::clone(&self.forge);
                    let login = self.login.clone();
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        fork_candidate(forge.as_ref(), &login, candidate, tx).await
                    });
                }
            }
        }
        drop(tx);

        if cancel.is_cancelled() {
            tasks.abort_all();
        }
        while let Some(joined) = tasks.join_next().await {
            absorb(joined, &mut outcomes)?;
        }

        Ok(outcomes)
    }

    async fn fix_stage(
        &self,
        mut rx: mpsc::Receiver<ForkJob>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome>, ForgeError> {
        let mut outcomes = Vec::new();

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(job) => job,
                    None => break,
                },
            };

            let upstream = job.upstream.repo.clone();
            match self.fix(job, cancel).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(ForgeError::Cancelled) => break,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(repo = %upstream, error = %err, "Failed to open pull request");
                    outcomes.push(Outcome::failed(&upstream, &err));
                }
            }
        }

        Ok(outcomes)
    }

    async fn fix(&self, job: ForkJob, cancel: &CancellationToken) -> Result<Outcome, ForgeError> {
        let fork = self.await_fork(&job.fork, cancel).await?;
        let target = &self.config.target_file;

        let file: RepoFile = self.forge.file_content(&fork.repo, target).await?;
        let Some(fixed) = self.config.rewrite.apply(&file.content) else {
            return Ok(Outcome::Skipped {
                repo: job.upstream.repo,
                reason: SkipReason::AlreadyFixed,
            });
        };

        let update = FileUpdate {
            path: file.path,
            message: self.config.commit_message.clone(),
            content: fixed,
            sha: file.sha,
            branch: fork.default_branch.clone(),
        };
        self.forge.update_file(&fork.repo, &update).await?;
        debug!(fork = %fork.repo, branch = %update.branch, "Committed rewrite");

        let pr = NewPullRequest {
            title: self.config.pr_title.clone(),
            body: self.config.pr_body.clone(),
            head: format!("{}:{}", fork.repo.owner, fork.default_branch),
            base: job.upstream.default_branch.clone(),
            maintainer_can_modify: true,
        };
        let pull_request = self
            .forge
            .create_pull_request(&job.upstream.repo, &pr)
            .await?;
        info!(
            repo = %job.upstream.repo,
            number = pull_request.number,
            url = %pull_request.url,
            "Opened pull request"
        );

        Ok(Outcome::Opened {
            upstream: job.upstream.repo,
            fork: fork.repo,
            pull_request,
        })
    }

    /// Forks are created asynchronously; poll until the fork is readable.
    async fn await_fork(
        &self,
        fork: &Repo,
        cancel: &CancellationToken,
    ) -> Result<RepoInfo, ForgeError> {
        let attempts = self.config.fork_poll_attempts.max(1);

        for attempt in 1..=attempts {
            match self.forge.repository(fork).await {
                Ok(info) => return Ok(info),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(%fork, attempt, error = %err, "Fork not ready"),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
                    _ = sleep(self.config.fork_poll_delay) => {}
                }
            }
        }

        Err(ForgeError::ForkNotReady {
            repo: fork.to_string(),
            attempts,
        })
    }
}

async fn cancel_on_error<T>(
    cancel: &CancellationToken,
    stage: impl Future<Output = Result<T, ForgeError>>,
) -> Result<T, ForgeError> {
    let result = stage.await;
    if let Err(err) = &result {
        warn!(error = %err, "Aborting pass");
        cancel.cancel();
    }
    result
}

type ForkTaskResult = Result<Option<Outcome>, ForgeError>;

/// Folds a finished fork task into `outcomes`, surfacing fatal errors.
fn absorb(
    joined: Result<ForkTaskResult, JoinError>,
    outcomes: &mut Vec<Outcome>,
) -> Result<(), ForgeError> {
    match joined {
        Ok(Ok(Some(outcome))) => outcomes.push(outcome),
        Ok(Ok(None)) => {}
        Ok(Err(err)) => return Err(err),
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!(error = %err, "Fork task panicked"),
    }
    Ok(())
}

enum ForkStep {
    Duplicate(PullRequestRef),
    Forked(ForkJob),
}

async fn try_fork<F>(forge: &F, login: &str, upstream: &Repo) -> Result<ForkStep, ForgeError>
where
    F: Forge + Send + Sync,
{
    let info = forge.repository(upstream).await?;
    let head = format!("{}:{}", login, info.default_branch);

    let existing = forge.find_pull_requests(upstream, &head).await?;
    if let Some(pr) = existing.into_iter().next() {
        return Ok(ForkStep::Duplicate(pr));
    }

    let fork = forge.create_fork(upstream).await?;
    info!(%upstream, %fork, "Requested fork");
    Ok(ForkStep::Forked(ForkJob {
        upstream: info,
        fork,
    }))
}

async fn fork_candidate<F>(
    forge: &F,
    login: &str,
    candidate: Candidate,
    tx: mpsc::Sender<ForkJob>,
) -> ForkTaskResult
where
    F: Forge + Send + Sync,
{
    let upstream = candidate.upstream;
    match try_fork(forge, login, &upstream).await {
        Ok(ForkStep::Duplicate(pr)) => {
            info!(repo = %upstream, number = pr.number, "Pull request already exists");
            Ok(Some(Outcome::Skipped {
                repo: upstream,
                reason: SkipReason::DuplicatePullRequest(pr),
            }))
        }
        Ok(ForkStep::Forked(job)) => match tx.send(job).await {
            Ok(()) => Ok(None),
            Err(unsent) => {
                let fork = &unsent.0.fork;
                warn!(repo = %upstream, %fork, "Fix stage stopped before the fork was committed");
                Ok(Some(Outcome::failed(&upstream, &ForgeError::Cancelled)))
            }
        },
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(repo = %upstream, error = %err, "Failed to fork");
            Ok(Some(Outcome::failed(&upstream, &err)))
        }
    }
}
