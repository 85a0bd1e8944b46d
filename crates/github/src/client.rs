use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{ForgeError, Result};
use crate::forge::{
    ContentEntry, ContentKind, Contents, ForgeApi, PullRequest, RepositoryInfo, TreeEntry,
};

pub const DEFAULT_API_URL: &str = councilstore_runtime_config::DEFAULT_GITHUB_API_URL;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed HTTP client for one GitHub repository.
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    repository: String,
    token: String,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("base_url", &self.base_url)
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    /// Create a client for `repository` (`owner/repo`) at `base_url`.
    pub fn new(base_url: &str, repository: &str, token: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("councilstore"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ForgeError::Config(e.to_string()))?;
        Self::with_client(client, base_url, repository, token)
    }

    /// Create from an existing `reqwest::Client`.
    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        repository: &str,
        token: &str,
    ) -> Result<Self> {
        let repository = repository.trim().trim_matches('/');
        let valid = matches!(
            repository.split_once('/'),
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/')
        );
        if !valid {
            return Err(ForgeError::Config(format!(
                "repository must be in owner/repo form, got {repository:?}"
            )));
        }
        if token.trim().is_empty() {
            return Err(ForgeError::Config("token is empty".to_string()));
        }
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            token: token.trim().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}{}", self.base_url, self.repository, path)
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req.bearer_auth(&self.token).send().await?;
        parse_response(resp).await
    }

    async fn send_empty(&self, req: reqwest::RequestBuilder) -> Result<()> {
        let resp = req.bearer_auth(&self.token).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(parse_error(resp).await)
        }
    }

    async fn blob_content(&self, sha: &str) -> Result<Vec<u8>> {
        let blob: EncodedContent = self
            .send(self.client.get(self.url(&format!("/git/blobs/{sha}"))))
            .await?;
        decode_content(&blob.content)
    }
}

impl ForgeApi for GitHubClient {
    fn repository(&self) -> &str {
        &self.repository
    }

    async fn get_repository(&self) -> Result<RepositoryInfo> {
        let repo: RepoResponse = self.send(self.client.get(self.url(""))).await?;
        Ok(RepositoryInfo {
            default_branch: repo.default_branch,
            size: repo.size,
        })
    }

    async fn get_branch_sha(&self, branch: &str) -> Result<String> {
        let url = self.url(&format!("/git/ref/heads/{}", encode_path(branch)));
        let reference: RefResponse = self.send(self.client.get(url)).await?;
        Ok(reference.object.sha)
    }

    async fn create_ref(&self, branch: &str, sha: &str) -> Result<()> {
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
        self.send_empty(self.client.post(self.url("/git/refs")).json(&body))
            .await
    }

    async fn update_ref(&self, branch: &str, sha: &str) -> Result<()> {
        let url = self.url(&format!("/git/refs/heads/{}", encode_path(branch)));
        let body = json!({ "sha": sha, "force": false });
        self.send_empty(self.client.patch(url).json(&body)).await
    }

    async fn delete_ref(&self, branch: &str) -> Result<()> {
        let url = self.url(&format!("/git/refs/heads/{}", encode_path(branch)));
        self.send_empty(self.client.delete(url)).await
    }

    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("/git/matching-refs/heads/{}", encode_path(prefix)));
        let refs: Vec<RefEntry> = self.send(self.client.get(url)).await?;
        Ok(refs
            .into_iter()
            .filter_map(|r| r.reference.strip_prefix("refs/heads/").map(str::to_string))
            .collect())
    }

    async fn get_commit_tree(&self, sha: &str) -> Result<String> {
        let commit: CommitResponse = self
            .send(self.client.get(self.url(&format!("/git/commits/{sha}"))))
            .await?;
        Ok(commit.tree.sha)
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String> {
        let body = json!({ "content": STANDARD.encode(content), "encoding": "base64" });
        let blob: ShaResponse = self
            .send(self.client.post(self.url("/git/blobs")).json(&body))
            .await?;
        Ok(blob.sha)
    }

    async fn create_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String> {
        let body = TreeRequest {
            base_tree,
            tree: entries
                .iter()
                .map(|e| TreeItem {
                    path: &e.path,
                    mode: "100644",
                    kind: "blob",
                    sha: e.sha.as_deref(),
                })
                .collect(),
        };
        let tree: ShaResponse = self
            .send(self.client.post(self.url("/git/trees")).json(&body))
            .await?;
        Ok(tree.sha)
    }

    async fn create_commit(&self, message: &str, tree: &str, parents: &[String]) -> Result<String> {
        let body = json!({ "message": message, "tree": tree, "parents": parents });
        let commit: ShaResponse = self
            .send(self.client.post(self.url("/git/commits")).json(&body))
            .await?;
        Ok(commit.sha)
    }

    async fn get_contents(&self, path: &str, reference: &str) -> Result<Contents> {
        let url = format!(
            "{}?ref={}",
            self.url(&format!("/contents/{}", encode_path(path))),
            urlencoding::encode(reference)
        );
        let contents: ContentsResponse = self.send(self.client.get(url)).await?;
        match contents {
            ContentsResponse::Dir(items) => Ok(Contents::Dir(
                items
                    .into_iter()
                    .filter_map(|item| {
                        let kind = match item.kind.as_str() {
                            "file" => ContentKind::File,
                            "dir" => ContentKind::Dir,
                            _ => return None,
                        };
                        Some(ContentEntry {
                            path: item.path,
                            kind,
                        })
                    })
                    .collect(),
            )),
            ContentsResponse::File(item) => {
                // Files over 1 MB come back without inline content.
                if item.encoding.as_deref() == Some("base64") {
                    Ok(Contents::File(decode_content(
                        item.content.as_deref().unwrap_or_default(),
                    )?))
                } else {
                    debug!(path, sha = %item.sha, "fetching large file through blob api");
                    Ok(Contents::File(self.blob_content(&item.sha).await?))
                }
            }
        }
    }

    async fn put_contents(&self, path: &str, content: &[u8], message: &str) -> Result<String> {
        let url = self.url(&format!("/contents/{}", encode_path(path)));
        let body = json!({ "message": message, "content": STANDARD.encode(content) });
        let written: PutContentsResponse = self.send(self.client.put(url).json(&body)).await?;
        Ok(written.commit.sha)
    }

    async fn create_pull_request(
        &self,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let request = json!({ "title": title, "head": head, "base": base, "body": body });
        let pr: PullResponse = self
            .send(self.client.post(self.url("/pulls")).json(&request))
            .await?;
        Ok(PullRequest {
            number: pr.number,
            html_url: pr.html_url,
        })
    }

    async fn merge_pull_request(&self, number: u64, commit_title: &str) -> Result<String> {
        let body = json!({ "commit_title": commit_title, "merge_method": "squash" });
        let merged: ShaResponse = self
            .send(
                self.client
                    .put(self.url(&format!("/pulls/{number}/merge")))
                    .json(&body),
            )
            .await?;
        Ok(merged.sha)
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_content(content: &str) -> Result<Vec<u8>> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| ForgeError::Decode(e.to_string()))
}

/// Deserialize the body on 2xx, or turn the status and message into an error.
async fn parse_response<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(parse_error(resp).await);
    }
    resp.json().await.map_err(|e| ForgeError::Decode(e.to_string()))
}

async fn parse_error(resp: reqwest::Response) -> ForgeError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    ForgeError::Status { status, message }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    default_branch: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaResponse,
}

#[derive(Deserialize)]
struct RefEntry {
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    tree: ShaResponse,
}

#[derive(Deserialize)]
struct PutContentsResponse {
    commit: ShaResponse,
}

#[derive(Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

#[derive(Deserialize)]
struct EncodedContent {
    content: String,
}

#[derive(Deserialize)]
struct ContentItem {
    path: String,
    sha: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Dir(Vec<ContentItem>),
    File(ContentItem),
}

#[derive(Serialize)]
struct TreeRequest<'a> {
    base_tree: &'a str,
    tree: Vec<TreeItem<'a>>,
}

#[derive(Serialize)]
struct TreeItem<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    /// `null` deletes the path from the base tree.
    sha: Option<&'a str>,
}
