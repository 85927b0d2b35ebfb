use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::{Octocrab, models, params};
use tracing::debug;
use url::Url;

use crate::{
    error::ForgeError,
    types::{
        FileUpdate, Forge, NewPullRequest, PullRequestRef, Repo, RepoFile, RepoInfo, SearchHit,
        SearchPage,
    },
};

/// Branch assumed when the API omits a default branch.
const FALLBACK_BRANCH: &str = "master";

/// Connection settings for the GitHub API.
#[derive(Debug, Clone, Default)]
pub struct GitHubOptions {
    pub token: Option<String>,
    /// GitHub Enterprise API base, e.g. `https://github.example.com/api/v3/`.
    pub api_url: Option<Url>,
}

/// Environment variables checked for a token, in order.
const TOKEN_VARS: [&str; 2] = ["GITHUB_TOKEN", "GH_TOKEN"];

/// First non-blank token among [`TOKEN_VARS`].
fn token_from_env(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    TOKEN_VARS
        .iter()
        .filter_map(|var| lookup(*var))
        .map(|token| token.trim().to_string())
        .find(|token| !token.is_empty())
}

/// Finds a token in the environment, then asks the `gh` CLI.
pub fn get_github_token() -> Result<String> {
    if let Some(token) = token_from_env(|var| std::env::var(var).ok()) {
        return Ok(token);
    }

    let output = Command::new("gh")
        .args(["auth", "token"])
        .output()
        .context("No token in GITHUB_TOKEN or GH_TOKEN, and running 'gh auth token' failed")?;
    if !output.status.success() {
        anyhow::bail!(
            "'gh auth token' exited with {}; run 'gh auth login' or pass --token",
            output.status
        );
    }

    let token = String::from_utf8(output.stdout)
        .context("'gh auth token' printed a non-UTF-8 token")?
        .trim()
        .to_string();
    anyhow::ensure!(!token.is_empty(), "'gh auth token' printed an empty token");

    Ok(token)
}

/// [`Forge`] backed by the GitHub REST API.
#[derive(Clone)]
pub struct GitHub {
    client: Octocrab,
}

impl GitHub {
    pub fn new(client: Octocrab) -> Self {
        Self { client }
    }

    /// Creates an authenticated client using available credentials.
    pub fn connect(options: &GitHubOptions) -> Result<Self> {
        let token = match &options.token {
            Some(token) if !token.trim().is_empty() => token.clone(),
            _ => get_github_token().context("Failed to obtain GitHub authentication token")?,
        };

        let mut builder = Octocrab::builder().personal_token(token);
        if let Some(url) = &options.api_url {
            builder = builder
                .base_uri(url.as_str())
                .with_context(|| format!("Invalid GitHub API URL: '{}'", url))?;
        }

        let client = builder.build().context("Failed to create GitHub client")?;
        Ok(Self::new(client))
    }
}

fn repo_from_model(repo: &models::Repository) -> Result<Repo, ForgeError> {
    let owner = repo
        .owner
        .as_ref()
        .map(|owner| owner.login.clone())
        .or_else(|| {
            repo.full_name
                .as_deref()
                .and_then(|full| full.split_once('/'))
                .map(|(owner, _)| owner.to_string())
        })
        .ok_or_else(|| anyhow::anyhow!("Repository '{}' has no owner", repo.name))?;

    Repo::new(owner, repo.name.clone()).map_err(|e| ForgeError::Other(e.into()))
}

fn pull_request_ref(pr: &models::pulls::PullRequest) -> PullRequestRef {
    PullRequestRef {
        number: pr.number,
        url: pr
            .html_url
            .as_ref()
            .map(|url| url.to_string())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl Forge for GitHub {
    async fn current_user(&self) -> Result<String, ForgeError> {
        let user = self.client.current().user().await?;
        Ok(user.login)
    }

    async fn search_code(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<SearchPage, ForgeError> {
        debug!(query, page, "Searching code");
        let results = self
            .client
            .search()
            .code(query)
            .sort("indexed")
            .order("asc")
            .per_page(per_page)
            .page(page)
            .send()
            .await?;

        let hits = results
            .items
            .iter()
            .filter_map(|code| match repo_from_model(&code.repository) {
                Ok(repo) => Some(SearchHit {
                    repo,
                    path: code.path.clone(),
                }),
                Err(err) => {
                    debug!(error = %err, path = %code.path, "Skipping search hit");
                    None
                }
            })
            .collect();

        Ok(SearchPage {
            hits,
            total_count: results.total_count,
            has_next: results.next.is_some(),
        })
    }

    async fn file_content(&self, repo: &Repo, path: &str) -> Result<RepoFile, ForgeError> {
        let items = self
            .client
            .repos(&repo.owner, &repo.name)
            .get_content()
            .path(path)
            .send()
            .await?;

        let file = items
            .items
            .into_iter()
            .find(|item| item.r#type == "file")
            .ok_or_else(|| ForgeError::NotFound(format!("{}/{}", repo, path)))?;

        let content = file
            .decoded_content()
            .with_context(|| format!("Cannot decode {} in {}", path, repo))?;

        Ok(RepoFile {
            path: file.path,
            sha: file.sha,
            content,
        })
    }

    async fn repository(&self, repo: &Repo) -> Result<RepoInfo, ForgeError> {
        let model = self.client.repos(&repo.owner, &repo.name).get().await?;

        let parent = model
            .parent
            .as_deref()
            .map(repo_from_model)
            .transpose()?;

        Ok(RepoInfo {
            repo: repo_from_model(&model)?,
            default_branch: model
                .default_branch
                .clone()
                .unwrap_or_else(|| FALLBACK_BRANCH.to_string()),
            parent,
            fork: model.fork.unwrap_or(false),
        })
    }

    async fn create_fork(&self, repo: &Repo) -> Result<Repo, ForgeError> {
        // The API answers 202 Accepted and finishes the copy in the background.
        let fork = self
            .client
            .repos(&repo.owner, &repo.name)
            .create_fork()
            .send()
            .await?;
        repo_from_model(&fork)
    }

    async fn update_file(&self, repo: &Repo, update: &FileUpdate) -> Result<(), ForgeError> {
        self.client
            .repos(&repo.owner, &repo.name)
            .update_file(&update.path, &update.message, &update.content, &update.sha)
            .branch(&update.branch)
            .send()
            .await?;
        Ok(())
    }

    async fn find_pull_requests(
        &self,
        upstream: &Repo,
        head: &str,
    ) -> Result<Vec<PullRequestRef>, ForgeError> {
        let page = self
            .client
            .pulls(&upstream.owner, &upstream.name)
            .list()
            .state(params::State::All)
            .head(head)
            .per_page(100)
            .send()
            .await?;

        Ok(page.items.iter().map(pull_request_ref).collect())
    }

    async fn create_pull_request(
        &self,
        upstream: &Repo,
        pr: &NewPullRequest,
    ) -> Result<PullRequestRef, ForgeError> {
        let created = self
            .client
            .pulls(&upstream.owner, &upstream.name)
            .create(&pr.title, &pr.head, &pr.base)
            .body(&pr.body)
            .maintainer_can_modify(pr.maintainer_can_modify)
            .send()
            .await?;

        Ok(pull_request_ref(&created))
    }
}
