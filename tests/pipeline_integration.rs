use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use ghbot::{
    Config, FileUpdate, Forge, ForgeError, NewPullRequest, Outcome, Pipeline, PullRequestRef,
    Repo, RepoFile, RepoInfo, SearchHit, SearchPage, SkipReason, Verdict,
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const BOT: &str = "ghbot";

const QUALIFYING: &str = "language: go\n\
go:\n  - \"1.10\"\n  - \"1.11\"\n\
install:\n  - go get -u github.com/golang/lint/golint\n\
script:\n  - golint ./...\n";

const OLD_GO: &str = "language: go\n\
go:\n  - 1.8\n\
install:\n  - go get github.com/golang/lint/golint\n";

const ALREADY_FIXED: &str = "language: go\n\
install:\n  - go get golang.org/x/lint/golint\n";

/// Which mock operation should report a fatal error.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Search,
    FileContent,
    Repository,
    CreateFork,
    UpdateFile,
    CreatePullRequest,
}

#[derive(Default)]
struct State {
    fork_lookups: HashMap<Repo, u32>,
    forks_created: Vec<Repo>,
    updates: Vec<(Repo, FileUpdate)>,
    pull_requests: Vec<(Repo, NewPullRequest)>,
    search_calls: u32,
    file_reads: u32,
}

/// In-memory forge holding a handful of upstream repositories.
struct MockForge {
    hits: Vec<SearchHit>,
    files: HashMap<Repo, String>,
    existing_prs: HashMap<Repo, Vec<PullRequestRef>>,
    /// Failed lookups before a new fork becomes readable.
    fork_delay_lookups: u32,
    rate_limit_on: Option<Op>,
    /// Status reported by `rate_limit_on`: 403 is a rate limit, 401 bad
    /// credentials.
    fatal_status: u16,
    /// Leading search calls that fail with a 502.
    search_failures: u32,
    /// Hits per search page.
    page_size: usize,
    /// Latency of every file read.
    file_delay: Duration,
    /// Upstream repositories whose file update is rejected.
    reject_update_for: HashSet<String>,
    state: Mutex<State>,
}

impl MockForge {
    fn new(repos: &[(&str, &str)]) -> Self {
        let mut hits = Vec::new();
        let mut files = HashMap::new();
        for (full_name, content) in repos {
            let repo = Repo::parse(full_name).unwrap();
            hits.push(SearchHit {
                repo: repo.clone(),
                path: ".travis.yml".to_string(),
            });
            files.insert(repo, content.to_string());
        }

        Self {
            hits,
            files,
            existing_prs: HashMap::new(),
            fork_delay_lookups: 0,
            rate_limit_on: None,
            fatal_status: 403,
            search_failures: 0,
            page_size: usize::MAX,
            file_delay: Duration::ZERO,
            reject_update_for: HashSet::new(),
            state: Mutex::new(State::default()),
        }
    }

    fn check(&self, op: Op) -> Result<(), ForgeError> {
        if self.rate_limit_on == Some(op) {
            let message = match self.fatal_status {
                401 => "Bad credentials",
                _ => "API rate limit exceeded",
            };
            return Err(ForgeError::from_status(self.fatal_status, message));
        }
        Ok(())
    }

    fn upstream_of(&self, fork: &Repo) -> Option<Repo> {
        self.files
            .keys()
            .find(|upstream| upstream.name == fork.name)
            .cloned()
    }

    fn forks_created(&self) -> Vec<Repo> {
        self.state.lock().unwrap().forks_created.clone()
    }

    fn pull_requests(&self) -> Vec<(Repo, NewPullRequest)> {
        self.state.lock().unwrap().pull_requests.clone()
    }

    fn updates(&self) -> Vec<(Repo, FileUpdate)> {
        self.state.lock().unwrap().updates.clone()
    }

    fn search_calls(&self) -> u32 {
        self.state.lock().unwrap().search_calls
    }

    fn file_reads(&self) -> u32 {
        self.state.lock().unwrap().file_reads
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn current_user(&self) -> Result<String, ForgeError> {
        Ok(BOT.to_string())
    }

    async fn search_code(
        &self,
        _query: &str,
        page: u32,
        _per_page: u8,
    ) -> Result<SearchPage, ForgeError> {
        self.check(Op::Search)?;
        {
            let mut state = self.state.lock().unwrap();
            state.search_calls += 1;
            if state.search_calls <= self.search_failures {
                return Err(ForgeError::from_status(502, "Bad Gateway"));
            }
        }

        let per_page = self.page_size.max(1);
        let start = (page as usize - 1).saturating_mul(per_page);
        let hits = self.hits.iter().skip(start).take(per_page).cloned().collect();
        Ok(SearchPage {
            total_count: Some(self.hits.len() as u64),
            hits,
            has_next: start.saturating_add(per_page) < self.hits.len(),
        })
    }

    async fn file_content(&self, repo: &Repo, path: &str) -> Result<RepoFile, ForgeError> {
        self.check(Op::FileContent)?;
        self.state.lock().unwrap().file_reads += 1;
        if !self.file_delay.is_zero() {
            sleep(self.file_delay).await;
        }

        let source = if repo.is_owned_by(BOT) {
            self.upstream_of(repo)
        } else {
            Some(repo.clone())
        };

        let content = source
            .and_then(|upstream| self.files.get(&upstream).cloned())
            .ok_or_else(|| ForgeError::NotFound(format!("{repo}/{path}")))?;

        Ok(RepoFile {
            path: path.to_string(),
            sha: format!("sha-{}", repo.name),
            content,
        })
    }

    async fn repository(&self, repo: &Repo) -> Result<RepoInfo, ForgeError> {
        self.check(Op::Repository)?;

        if repo.is_owned_by(BOT) {
            let mut state = self.state.lock().unwrap();
            let lookups = state.fork_lookups.entry(repo.clone()).or_default();
            *lookups += 1;
            if *lookups <= self.fork_delay_lookups {
                return Err(ForgeError::NotFound(repo.to_string()));
            }
            return Ok(RepoInfo {
                repo: repo.clone(),
                default_branch: "master".to_string(),
                parent: self.upstream_of(repo),
                fork: true,
            });
        }

        if !self.files.contains_key(repo) {
            return Err(ForgeError::NotFound(repo.to_string()));
        }
        Ok(RepoInfo {
            repo: repo.clone(),
            default_branch: "master".to_string(),
            parent: None,
            fork: false,
        })
    }

    async fn create_fork(&self, repo: &Repo) -> Result<Repo, ForgeError> {
        self.check(Op::CreateFork)?;

        let fork = Repo::new(BOT, repo.name.clone()).unwrap();
        self.state.lock().unwrap().forks_created.push(fork.clone());
        Ok(fork)
    }

    async fn update_file(&self, repo: &Repo, update: &FileUpdate) -> Result<(), ForgeError> {
        self.check(Op::UpdateFile)?;

        if self.reject_update_for.contains(&repo.name) {
            return Err(ForgeError::from_status(409, "sha does not match"));
        }
        self.state
            .lock()
            .unwrap()
            .updates
            .push((repo.clone(), update.clone()));
        Ok(())
    }

    async fn find_pull_requests(
        &self,
        upstream: &Repo,
        head: &str,
    ) -> Result<Vec<PullRequestRef>, ForgeError> {
        assert_eq!(head, format!("{BOT}:master"));
        Ok(self.existing_prs.get(upstream).cloned().unwrap_or_default())
    }

    async fn create_pull_request(
        &self,
        upstream: &Repo,
        pr: &NewPullRequest,
    ) -> Result<PullRequestRef, ForgeError> {
        self.check(Op::CreatePullRequest)?;

        let mut state = self.state.lock().unwrap();
        state.pull_requests.push((upstream.clone(), pr.clone()));
        let number = state.pull_requests.len() as u64;
        Ok(PullRequestRef {
            number,
            url: format!("https://github.com/{upstream}/pull/{number}"),
        })
    }
}

fn test_config() -> Config {
    Config {
        once: true,
        interval: Duration::from_millis(1),
        page_delay: Duration::ZERO,
        fork_poll_delay: Duration::ZERO,
        ..Config::default()
    }
}

fn pipeline(forge: &Arc<MockForge>, config: Config) -> Pipeline<MockForge> {
    Pipeline::new(Arc::clone(forge), Arc::new(config), BOT)
}

fn outcome_for<'a>(outcomes: &'a [Outcome], full_name: &str) -> &'a Outcome {
    let repo = Repo::parse(full_name).unwrap();
    outcomes
        .iter()
        .find(|outcome| outcome.repo() == &repo)
        .unwrap_or_else(|| panic!("no outcome for {full_name}: {outcomes:?}"))
}

#[tokio::test]
async fn test_qualifying_repository_gets_pull_request() {
    let forge = Arc::new(MockForge::new(&[("alice/widgets", QUALIFYING)]));

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.hits, 1);
    assert_eq!(report.opened().count(), 1);
    assert_eq!(forge.forks_created(), vec![Repo::new(BOT, "widgets").unwrap()]);

    let updates = forge.updates();
    assert_eq!(updates.len(), 1);
    let (fork, update) = &updates[0];
    assert_eq!(fork, &Repo::new(BOT, "widgets").unwrap());
    assert_eq!(update.path, ".travis.yml");
    assert_eq!(update.branch, "master");
    assert_eq!(update.sha, "sha-widgets");
    assert_eq!(update.message, "Fix golint import path");
    assert!(update.content.contains("go get -u golang.org/x/lint/golint"));
    assert!(!update.content.contains("github.com/golang/lint/golint"));

    let prs = forge.pull_requests();
    assert_eq!(prs.len(), 1);
    let (upstream, pr) = &prs[0];
    assert_eq!(upstream, &Repo::parse("alice/widgets").unwrap());
    assert_eq!(pr.head, "ghbot:master");
    assert_eq!(pr.base, "master");
    assert_eq!(pr.title, "Fix golint import path");
    assert!(pr.maintainer_can_modify);
}

#[tokio::test]
async fn test_outdated_go_version_is_skipped() {
    let forge = Arc::new(MockForge::new(&[
        ("alice/widgets", QUALIFYING),
        ("bob/legacy", OLD_GO),
    ]));

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome_for(&report.outcomes, "bob/legacy"),
        &Outcome::Skipped {
            repo: Repo::parse("bob/legacy").unwrap(),
            reason: SkipReason::Ineligible(Verdict::Outdated("1.8".to_string())),
        }
    );
    assert_eq!(forge.forks_created(), vec![Repo::new(BOT, "widgets").unwrap()]);
    assert_eq!(report.opened().count(), 1);
}

#[tokio::test]
async fn test_already_fixed_repository_is_skipped() {
    let forge = Arc::new(MockForge::new(&[("carol/done", ALREADY_FIXED)]));

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome_for(&report.outcomes, "carol/done"),
        Outcome::Skipped {
            reason: SkipReason::AlreadyFixed,
            ..
        }
    ));
    assert!(forge.forks_created().is_empty());
}

#[tokio::test]
async fn test_existing_pull_request_prevents_duplicate() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    let existing = PullRequestRef {
        number: 7,
        url: "https://github.com/alice/widgets/pull/7".to_string(),
    };
    mock.existing_prs.insert(
        Repo::parse("alice/widgets").unwrap(),
        vec![existing.clone()],
    );
    let forge = Arc::new(mock);

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome_for(&report.outcomes, "alice/widgets"),
        &Outcome::Skipped {
            repo: Repo::parse("alice/widgets").unwrap(),
            reason: SkipReason::DuplicatePullRequest(existing),
        }
    );
    assert!(forge.forks_created().is_empty());
    assert!(forge.pull_requests().is_empty());
}

#[tokio::test]
async fn test_rate_limit_on_search_aborts_pass() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.rate_limit_on = Some(Op::Search);
    let forge = Arc::new(mock);

    let err = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ForgeError::RateLimited(_)));
    assert!(forge.forks_created().is_empty());
}

#[tokio::test]
async fn test_rate_limit_while_forking_aborts_pass() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING), ("dave/tools", QUALIFYING)]);
    mock.rate_limit_on = Some(Op::CreateFork);
    let forge = Arc::new(mock);

    let err = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(forge.pull_requests().is_empty());
}

#[tokio::test]
async fn test_rate_limit_while_opening_pull_request_aborts_pass() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.rate_limit_on = Some(Op::CreatePullRequest);
    let forge = Arc::new(mock);

    let err = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ForgeError::RateLimited(_)));
    assert_eq!(forge.updates().len(), 1);
}

#[tokio::test]
async fn test_fork_polled_until_ready() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.fork_delay_lookups = 3;
    let forge = Arc::new(mock);

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.opened().count(), 1);
}

#[tokio::test]
async fn test_fork_never_ready_is_failure() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.fork_delay_lookups = 10;
    let forge = Arc::new(mock);

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    match outcome_for(&report.outcomes, "alice/widgets") {
        Outcome::Failed { error, .. } => {
            assert!(error.contains("not available after 4 attempts"), "{error}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(forge.updates().is_empty());
}

#[tokio::test]
async fn test_failure_on_one_repository_does_not_stop_others() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING), ("dave/tools", QUALIFYING)]);
    mock.reject_update_for.insert("widgets".to_string());
    let forge = Arc::new(mock);

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome_for(&report.outcomes, "alice/widgets"),
        Outcome::Failed { .. }
    ));
    assert!(matches!(
        outcome_for(&report.outcomes, "dave/tools"),
        Outcome::Opened { .. }
    ));
    assert_eq!(forge.pull_requests().len(), 1);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let forge = Arc::new(MockForge::new(&[("alice/widgets", QUALIFYING)]));
    let config = Config {
        dry_run: true,
        ..test_config()
    };

    let report = pipeline(&forge, config)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.outcomes,
        vec![Outcome::Planned {
            repo: Repo::parse("alice/widgets").unwrap()
        }]
    );
    assert!(forge.forks_created().is_empty());
    assert!(forge.updates().is_empty());
}

#[tokio::test]
async fn test_repositories_handled_once_per_process() {
    let forge = Arc::new(MockForge::new(&[("alice/widgets", QUALIFYING)]));
    let pipeline = pipeline(&forge, test_config());
    let shutdown = CancellationToken::new();

    let first = pipeline.run(&shutdown).await.unwrap();
    let second = pipeline.run(&shutdown).await.unwrap();

    assert_eq!(first.opened().count(), 1);
    assert!(second.outcomes.is_empty());
    assert_eq!(second.hits, 1);
    assert_eq!(forge.forks_created().len(), 1);
}

#[tokio::test]
async fn test_failed_repositories_are_retried() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.reject_update_for.insert("widgets".to_string());
    let forge = Arc::new(mock);
    let pipeline = pipeline(&forge, test_config());
    let shutdown = CancellationToken::new();

    pipeline.run(&shutdown).await.unwrap();
    let second = pipeline.run(&shutdown).await.unwrap();

    assert!(matches!(
        outcome_for(&second.outcomes, "alice/widgets"),
        Outcome::Failed { .. }
    ));
    assert_eq!(forge.forks_created().len(), 2);
}

#[tokio::test]
async fn test_own_forks_and_nested_files_are_ignored() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.hits.push(SearchHit {
        repo: Repo::new(BOT, "widgets").unwrap(),
        path: ".travis.yml".to_string(),
    });
    mock.hits.push(SearchHit {
        repo: Repo::parse("erin/monorepo").unwrap(),
        path: "services/api/.travis.yml".to_string(),
    });
    let forge = Arc::new(mock);

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.hits, 3);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(forge.forks_created(), vec![Repo::new(BOT, "widgets").unwrap()]);
}

#[tokio::test]
async fn test_cancelled_before_start_does_nothing() {
    let forge = Arc::new(MockForge::new(&[("alice/widgets", QUALIFYING)]));
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let report = pipeline(&forge, test_config()).run(&shutdown).await.unwrap();

    assert!(report.outcomes.is_empty());
    assert_eq!(forge.search_calls(), 0);
}

#[tokio::test]
async fn test_agent_runs_single_pass() {
    let forge = Arc::new(MockForge::new(&[("alice/widgets", QUALIFYING)]));

    let summary = ghbot::run(Arc::clone(&forge), test_config(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.passes, 1);
    assert_eq!(summary.opened, 1);
}

#[tokio::test]
async fn test_agent_stops_on_rate_limit() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.rate_limit_on = Some(Op::FileContent);
    let forge = Arc::new(mock);
    let config = Config {
        once: false,
        ..test_config()
    };

    let err = ghbot::run(forge, config, CancellationToken::new())
        .await
        .unwrap_err();

    let forge_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ForgeError>())
        .expect("forge error in chain");
    assert!(matches!(forge_err, ForgeError::RateLimited(_)));
}

#[tokio::test]
async fn test_agent_exits_on_shutdown() {
    let forge = Arc::new(MockForge::new(&[]));
    let config = Config {
        once: false,
        interval: Duration::from_secs(3600),
        ..test_config()
    };
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    let handle = tokio::spawn(ghbot::run(forge, config, shutdown));
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.passes, 1);
}

fn many_repos(count: usize, content: &'static str) -> Vec<(String, &'static str)> {
    (0..count)
        .map(|i| (format!("owner{i}/project{i}"), content))
        .collect()
}

fn mock_with(repos: &[(String, &'static str)]) -> MockForge {
    let repos: Vec<(&str, &str)> = repos
        .iter()
        .map(|(name, content)| (name.as_str(), *content))
        .collect();
    MockForge::new(&repos)
}

#[tokio::test]
async fn test_search_follows_pages() {
    let mut mock = mock_with(&many_repos(5, ALREADY_FIXED));
    mock.page_size = 2;
    let forge = Arc::new(mock);

    let report = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(report.hits, 5);
    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(forge.search_calls(), 3);
}

#[tokio::test]
async fn test_search_stops_at_page_limit() {
    let mut mock = mock_with(&many_repos(5, ALREADY_FIXED));
    mock.page_size = 2;
    let forge = Arc::new(mock);
    let config = Config {
        max_pages: 2,
        ..test_config()
    };

    let report = pipeline(&forge, config)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(report.hits, 4);
    assert_eq!(forge.search_calls(), 2);
}

#[tokio::test]
async fn test_search_waits_between_pages() {
    let mut mock = mock_with(&many_repos(3, ALREADY_FIXED));
    mock.page_size = 1;
    let forge = Arc::new(mock);
    let config = Config {
        page_delay: Duration::from_millis(40),
        ..test_config()
    };

    let started = Instant::now();
    let report = pipeline(&forge, config)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.pages, 3);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn test_shutdown_during_page_delay_returns_partial_report() {
    let mut mock = mock_with(&many_repos(3, ALREADY_FIXED));
    mock.page_size = 1;
    let forge = Arc::new(mock);
    let config = Config {
        page_delay: Duration::from_secs(3600),
        ..test_config()
    };
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = timeout(Duration::from_secs(5), pipeline(&forge, config).run(&shutdown))
        .await
        .expect("pass stops on shutdown")
        .unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(report.hits, 1);
    assert_eq!(forge.search_calls(), 1);
}

#[tokio::test]
async fn test_unauthorized_aborts_pass() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.rate_limit_on = Some(Op::Repository);
    mock.fatal_status = 401;
    let forge = Arc::new(mock);

    let err = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ForgeError::Unauthorized(_)));
    assert!(forge.forks_created().is_empty());
}

#[tokio::test]
async fn test_transient_search_failure_ends_pass_early() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.search_failures = 1;
    let forge = Arc::new(mock);
    let pipeline = pipeline(&forge, test_config());
    let shutdown = CancellationToken::new();

    let first = pipeline.run(&shutdown).await.unwrap();
    assert!(first.search_error.as_deref().unwrap().contains("502"));
    assert_eq!(first.pages, 0);
    assert!(first.outcomes.is_empty());

    let second = pipeline.run(&shutdown).await.unwrap();
    assert!(second.search_error.is_none());
    assert_eq!(second.opened().count(), 1);
}

#[tokio::test]
async fn test_agent_keeps_polling_after_search_failure() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.search_failures = 1;
    let forge = Arc::new(mock);
    let config = Config {
        once: false,
        interval: Duration::from_millis(10),
        ..test_config()
    };
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    let handle = tokio::spawn(ghbot::run(Arc::clone(&forge), config, shutdown));
    sleep(Duration::from_millis(200)).await;
    trigger.cancel();

    let summary = handle.await.unwrap().unwrap();
    assert!(summary.passes >= 2, "{summary:?}");
    assert_eq!(summary.opened, 1);
    assert!(forge.search_calls() >= 2);
}

#[tokio::test]
async fn test_fatal_error_stops_screening_promptly() {
    let mut repos = vec![("alice/widgets".to_string(), QUALIFYING)];
    repos.extend(many_repos(30, ALREADY_FIXED));
    let mut mock = mock_with(&repos);
    mock.rate_limit_on = Some(Op::CreateFork);
    mock.file_delay = Duration::from_millis(20);
    let forge = Arc::new(mock);

    let err = pipeline(&forge, test_config())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ForgeError::RateLimited(_)));
    assert!(forge.file_reads() < 10, "read {} files", forge.file_reads());
}

#[tokio::test]
async fn test_repository_interrupted_by_shutdown_is_retried() {
    let mut mock = MockForge::new(&[("alice/widgets", QUALIFYING)]);
    mock.fork_delay_lookups = 1;
    let forge = Arc::new(mock);
    let config = Config {
        fork_poll_delay: Duration::from_secs(3600),
        ..test_config()
    };
    let pipeline = pipeline(&forge, config);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let first = timeout(Duration::from_secs(5), pipeline.run(&shutdown))
        .await
        .expect("pass stops on shutdown")
        .unwrap();

    assert_eq!(first.hits, 1);
    assert!(first.outcomes.is_empty());
    assert_eq!(forge.forks_created().len(), 1);
    assert!(forge.updates().is_empty());

    let second = pipeline.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(second.opened().count(), 1);
    assert_eq!(forge.forks_created().len(), 2);
}
