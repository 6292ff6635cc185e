//! Remote blob store backed by a git hosting contents API.
//!
//! Each collection is a file `<prefix><collection>.json` on one branch of a
//! repository. The file's blob sha is the version token, and writes carry a
//! commit message describing the sync.
//!
//!   GET  /repos/{owner}/{repo}/contents/{path}?ref={branch}
//!   PUT  /repos/{owner}/{repo}/contents/{path}   {message, content, sha, branch}

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{RemoteBlob, RemoteBlobStore, VersionToken};
use crate::config::RemoteConfig;
use crate::error::RemoteError;

const USER_AGENT: &str = "fairway";
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw+json";

/// Response body of a contents GET.
#[derive(Debug, Deserialize)]
struct ContentResponse {
    sha: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: Option<String>,
}

/// Request body of a contents PUT.
#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    message: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutResponseContent,
}

#[derive(Debug, Deserialize)]
struct PutResponseContent {
    sha: String,
}

/// Contents API client for one repository branch.
pub struct GitHubContentStore {
    http: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    path_prefix: String,
    token: Option<String>,
}

impl GitHubContentStore {
    pub fn new(
        api_base: &str,
        owner: &str,
        repo: &str,
        branch: &str,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            path_prefix: String::new(),
            token: None,
        })
    }

    pub fn with_path_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = prefix.to_string();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn from_config(config: &RemoteConfig, timeout: Duration) -> Result<Self, RemoteError> {
        match config {
            RemoteConfig::GitHub {
                api_base,
                owner,
                repo,
                branch,
                path_prefix,
                token,
            } => Ok(Self::new(api_base, owner, repo, branch, timeout)?
                .with_path_prefix(path_prefix)
                .with_token(token.clone())),
            RemoteConfig::Memory => Err(RemoteError::Transport(
                "memory remote is not a github remote".into(),
            )),
        }
    }

    fn contents_url(&self, collection: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}{}.json",
            self.api_base, self.owner, self.repo, self.path_prefix, collection
        )
    }

    fn request(&self, method: reqwest::Method, url: &str, accept: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Fetch raw bytes for files too large to be inlined in the JSON response.
    async fn fetch_raw(&self, url: &str) -> Result<Bytes, RemoteError> {
        let resp = self
            .request(reqwest::Method::GET, url, ACCEPT_RAW)
            .query(&[("ref", self.branch.as_str())])
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.bytes().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(e.to_string())
    }
}

/// Decode the inlined base64 payload. The API wraps it at 60 columns.
fn decode_content(encoded: &str) -> Result<Vec<u8>, RemoteError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| RemoteError::Decode(format!("invalid base64 content: {}", e)))
}

/// Map a rejected PUT status to an error. 409 and 422 mean the sha given
/// (or omitted) does not match the file on the branch.
fn classify_put_status(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => RemoteError::VersionMismatch,
        _ => RemoteError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

fn commit_message(collection: &str, size: usize) -> String {
    format!(
        "fairway: sync {} ({} bytes) at {}",
        collection,
        size,
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

#[async_trait]
impl RemoteBlobStore for GitHubContentStore {
    async fn fetch(&self, collection: &str) -> Result<Option<RemoteBlob>, RemoteError> {
        let url = self.contents_url(collection);
        let resp = self
            .request(reqwest::Method::GET, &url, ACCEPT_JSON)
            .query(&[("ref", self.branch.as_str())])
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ContentResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        let content = match body.encoding.as_deref() {
            Some("base64") | None => Bytes::from(decode_content(&body.content)?),
            Some("none") => self.fetch_raw(&url).await?,
            Some(other) => {
                return Err(RemoteError::Decode(format!("unsupported encoding {}", other)));
            }
        };

        Ok(Some(RemoteBlob {
            content,
            version: VersionToken::new(body.sha),
        }))
    }

    async fn put(
        &self,
        collection: &str,
        content: Bytes,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, RemoteError> {
        let url = self.contents_url(collection);
        let request = PutRequest {
            message: commit_message(collection, content.len()),
            content: STANDARD.encode(&content),
            sha: expected.map(VersionToken::as_str),
            branch: &self.branch,
        };

        let resp = self
            .request(reqwest::Method::PUT, &url, ACCEPT_JSON)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_put_status(status, body));
        }

        let body: PutResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        tracing::debug!("Committed {} as {}", collection, body.content.sha);
        Ok(VersionToken::new(body.content.sha))
    }

    fn describe(&self) -> String {
        format!("github:{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GitHubContentStore {
        GitHubContentStore::new(
            "https://api.example.com/",
            "acme",
            "golf-data",
            "main",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_contents_url() {
        let s = store();
        assert_eq!(
            s.contents_url("trips"),
            "https://api.example.com/repos/acme/golf-data/contents/trips.json"
        );
        let s = s.with_path_prefix("db/");
        assert_eq!(
            s.contents_url("users"),
            "https://api.example.com/repos/acme/golf-data/contents/db/users.json"
        );
        assert_eq!(s.describe(), "github:acme/golf-data@main");
    }

    #[test]
    fn test_decode_wrapped_content() {
        let encoded = STANDARD.encode(br#"{"T1": {"rounds": 3}}"#);
        let (a, b) = encoded.split_at(10);
        let wrapped = format!("{}\n{}\n", a, b);
        assert_eq!(decode_content(&wrapped).unwrap(), br#"{"T1": {"rounds": 3}}"#);
        assert!(matches!(decode_content("***"), Err(RemoteError::Decode(_))));
    }

    #[test]
    fn test_parse_content_response() {
        let body = r#"{"name": "trips.json", "sha": "abc123", "encoding": "base64", "content": "e30=\n"}"#;
        let parsed: ContentResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.sha, "abc123");
        assert_eq!(decode_content(&parsed.content).unwrap(), b"{}");
    }

    #[test]
    fn test_put_request_body() {
        let create = PutRequest {
            message: commit_message("trips", 2),
            content: STANDARD.encode(b"{}"),
            sha: None,
            branch: "main",
        };
        let value = serde_json::to_value(&create).unwrap();
        assert!(value.get("sha").is_none());
        assert_eq!(value["content"], "e30=");
        assert!(value["message"].as_str().unwrap().starts_with("fairway: sync trips (2 bytes) at "));

        let update = PutRequest { sha: Some("abc123"), ..create };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["sha"], "abc123");
        assert_eq!(value["branch"], "main");
    }

    #[test]
    fn test_classify_put_status() {
        assert_eq!(
            classify_put_status(StatusCode::CONFLICT, String::new()),
            RemoteError::VersionMismatch
        );
        assert_eq!(
            classify_put_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()),
            RemoteError::VersionMismatch
        );
        assert_eq!(
            classify_put_status(StatusCode::FORBIDDEN, "rate limited".into()),
            RemoteError::Status {
                status: 403,
                body: "rate limited".into()
            }
        );
    }

    #[test]
    fn test_from_config_rejects_memory() {
        assert!(GitHubContentStore::from_config(&RemoteConfig::Memory, Duration::from_secs(1)).is_err());
    }
}
