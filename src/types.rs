use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ForgeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("repository owner cannot be empty")]
    EmptyOwner,
    #[error("repository name cannot be empty")]
    EmptyName,
    #[error("repository component '{0}' cannot contain '/'")]
    InvalidComponent(String),
    #[error("repository must be in format 'owner/repo', got: '{0}'")]
    InvalidFormat(String),
}

/// A repository identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Repo {
    pub owner: String,
    pub name: String,
}

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, RepoError> {
        let owner = owner.into();
        let name = name.into();

        if owner.is_empty() {
            return Err(RepoError::EmptyOwner);
        }
        if name.is_empty() {
            return Err(RepoError::EmptyName);
        }
        for part in [&owner, &name] {
            if part.contains('/') {
                return Err(RepoError::InvalidComponent(part.clone()));
            }
        }

        Ok(Self { owner, name })
    }

    /// Parses an `owner/name` string.
    pub fn parse(full_name: &str) -> Result<Self, RepoError> {
        let Some((owner, name)) = full_name.trim().split_once('/') else {
            return Err(RepoError::InvalidFormat(full_name.to_string()));
        };
        if name.contains('/') {
            return Err(RepoError::InvalidFormat(full_name.to_string()));
        }
        Self::new(owner, name)
    }

    pub fn is_owned_by(&self, login: &str) -> bool {
        self.owner.eq_ignore_ascii_case(login)
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Repository metadata needed to fork and target a pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoInfo {
    pub repo: Repo,
    pub default_branch: String,
    pub parent: Option<Repo>,
    pub fork: bool,
}

/// A file read from a repository, content already decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoFile {
    pub path: String,
    pub sha: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub repo: Repo,
    pub path: String,
}

/// One page of code search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub total_count: Option<u64>,
    pub has_next: bool,
}

/// A single-file commit made through the contents API.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpdate {
    pub path: String,
    pub message: String,
    pub content: String,
    /// Blob SHA of the file being replaced.
    pub sha: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    /// `owner:branch` of the fork.
    pub head: String,
    pub base: String,
    pub maintainer_can_modify: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
}

/// The subset of the hosting platform's API the bot relies on.
#[async_trait]
pub trait Forge {
    /// Login of the authenticated account.
    async fn current_user(&self) -> Result<String, ForgeError>;

    async fn search_code(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<SearchPage, ForgeError>;

    async fn file_content(&self, repo: &Repo, path: &str) -> Result<RepoFile, ForgeError>;

    async fn repository(&self, repo: &Repo) -> Result<RepoInfo, ForgeError>;

    /// Requests a fork into the authenticated account. Forking is
    /// asynchronous on the server; the returned repository may not be
    /// readable yet.
    async fn create_fork(&self, repo: &Repo) -> Result<Repo, ForgeError>;

    async fn update_file(&self, repo: &Repo, update: &FileUpdate) -> Result<(), ForgeError>;

    /// Pull requests on `upstream` in any state whose head is `head`.
    async fn find_pull_requests(
        &self,
        upstream: &Repo,
        head: &str,
    ) -> Result<Vec<PullRequestRef>, ForgeError>;

    async fn create_pull_request(
        &self,
        upstream: &Repo,
        pr: &NewPullRequest,
    ) -> Result<PullRequestRef, ForgeError>;
}
