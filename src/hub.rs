//! Hugging Face Hub access: cached downloads of model and dataset files, and
//! committing the results file to a dataset repository.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use serde_json::json;
use tracing::{debug, info};

use crate::errors::{EvalError, EvalResult};

/// Downloads go through the hf-hub cache; uploads use the commit API directly.
pub struct HubClient {
    api: Api,
    endpoint: String,
    token: Option<String>,
    http: reqwest::blocking::Client,
}

impl HubClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> EvalResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let api = ApiBuilder::new()
            .with_endpoint(endpoint.clone())
            .with_token(token.clone())
            .build()
            .map_err(|e| EvalError::hub("initializing hub API", e.to_string()))?;
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("herm_dpo/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EvalError::network("building HTTP client", e))?;

        Ok(Self {
            api,
            endpoint,
            token,
            http,
        })
    }

    /// Fetch one file from a model repo.
    pub fn model_file(&self, repo_id: &str, filename: &str) -> EvalResult<PathBuf> {
        debug!(repo = repo_id, file = filename, "Fetching model file");
        self.api
            .repo(Repo::model(repo_id.to_string()))
            .get(filename)
            .map_err(|e| EvalError::hub(format!("downloading {repo_id}/{filename}"), e.to_string()))
    }

    /// Every file path in a model repo at `main`.
    pub fn model_listing(&self, repo_id: &str) -> EvalResult<Vec<String>> {
        debug!(repo = repo_id, "Listing model repo");
        let info = self
            .api
            .repo(Repo::model(repo_id.to_string()))
            .info()
            .map_err(|e| EvalError::hub(format!("listing {repo_id}"), e.to_string()))?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    /// Fetch one file from a dataset repo at `revision`.
    pub fn dataset_file(&self, repo_id: &str, revision: &str, filename: &str) -> EvalResult<PathBuf> {
        debug!(repo = repo_id, revision, file = filename, "Fetching dataset file");
        self.api
            .repo(Repo::with_revision(
                repo_id.to_string(),
                RepoType::Dataset,
                revision.to_string(),
            ))
            .get(filename)
            .map_err(|e| EvalError::hub(format!("downloading {repo_id}/{filename}"), e.to_string()))
    }

    /// Commit `local_path` to `path_in_repo` of dataset `repo_id` on `main`.
    ///
    /// Returns the URL of the uploaded file.
    pub fn upload_file(
        &self,
        local_path: &Path,
        path_in_repo: &str,
        repo_id: &str,
        commit_message: &str,
    ) -> EvalResult<String> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| EvalError::upload("HF_TOKEN is not set; cannot upload results"))?;

        let content = std::fs::read(local_path)
            .map_err(|e| EvalError::io(format!("reading {}", local_path.display()), e))?;
        let body = commit_payload(commit_message, path_in_repo, &content)?;

        let url = format!("{}/api/datasets/{repo_id}/commit/main", self.endpoint);
        info!(repo = repo_id, path = path_in_repo, "Uploading results");
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .map_err(|e| EvalError::network("posting commit", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(EvalError::upload(format!("hub returned {status}: {text}")));
        }

        Ok(file_url(&self.endpoint, repo_id, path_in_repo))
    }
}

/// NDJSON body for a single-file commit.
pub fn commit_payload(summary: &str, path_in_repo: &str, content: &[u8]) -> EvalResult<String> {
    let header = json!({
        "key": "header",
        "value": { "summary": summary, "description": "" }
    });
    let file = json!({
        "key": "file",
        "value": {
            "content": B64.encode(content),
            "path": path_in_repo,
            "encoding": "base64"
        }
    });
    Ok(format!(
        "{}\n{}\n",
        serde_json::to_string(&header)?,
        serde_json::to_string(&file)?
    ))
}

pub fn file_url(endpoint: &str, repo_id: &str, path_in_repo: &str) -> String {
    format!(
        "{}/datasets/{repo_id}/blob/main/{path_in_repo}",
        endpoint.trim_end_matches('/')
    )
}

/// Location of the results file inside the results repo.
pub fn results_path_in_repo(model: &str, pref_sets: bool) -> String {
    let sub_path = if pref_sets { "pref-sets/" } else { "eval-set/" };
    format!("{sub_path}{model}.json")
}

pub fn commit_message(model: &str) -> String {
    format!("Add reward model scores for  model {model}")
}
