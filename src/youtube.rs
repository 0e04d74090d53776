use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::split_tags;

const CHANNEL_PARTS: &str = "snippet,contentDetails,statistics";
const VIDEO_PARTS: &str = "snippet,status";
const VIDEO_CONTENT_TYPE: &str = "video/*";

#[derive(Debug, Error)]
pub enum YouTubeError {
    #[error("the API rejected the access token: {0}")]
    Unauthorized(String),
    #[error("the API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request to the API failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected response from the API: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("upload session was created without a Location header")]
    MissingUploadLocation,
    #[error("cannot read video file '{path}': {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid upload: {0}")]
    InvalidRequest(String),
}

impl YouTubeError {
    /// True when the operator has to authorize again rather than retry.
    pub fn is_authorization_error(&self) -> bool {
        matches!(self, YouTubeError::Unauthorized(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub id: String,
    pub title: String,
    pub view_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Option<Vec<ChannelItem>>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    id: String,
    snippet: Option<ChannelSnippet>,
    statistics: Option<ChannelStatistics>,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    view_count: Option<String>,
}

impl From<ChannelItem> for ChannelSummary {
    fn from(item: ChannelItem) -> Self {
        ChannelSummary {
            id: item.id,
            title: item.snippet.map(|s| s.title).unwrap_or_default(),
            view_count: item
                .statistics
                .and_then(|s| s.view_count)
                .and_then(|c| c.parse().ok()),
        }
    }
}

/// A received video waiting to be sent to YouTube.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub file_path: PathBuf,
}

impl UploadRequest {
    pub fn new(
        title: &str,
        description: &str,
        tags: &str,
        file_path: impl Into<PathBuf>,
    ) -> Result<Self, YouTubeError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(YouTubeError::InvalidRequest("title is required".to_string()));
        }
        Ok(Self {
            title: title.to_string(),
            description: description.to_string(),
            tags: split_tags(tags),
            file_path: file_path.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct VideoResource<'a> {
    snippet: VideoSnippet<'a>,
    status: VideoStatus,
}

#[derive(Debug, Serialize)]
struct VideoSnippet<'a> {
    title: &'a str,
    description: &'a str,
    tags: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatus {
    privacy_status: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedVideo {
    pub id: String,
    #[serde(default)]
    pub snippet: serde_json::Value,
    #[serde(default)]
    pub status: serde_json::Value,
}

pub struct YouTubeClient {
    client: Client,
    base_url: String,
}

impl YouTubeClient {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, YouTubeError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build().map_err(YouTubeError::Transport)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// First channel owned by the signed-in account, or `None` when the
    /// account has no channel.
    pub async fn fetch_own_channel(
        &self,
        access_token: &str,
    ) -> Result<Option<ChannelSummary>, YouTubeError> {
        let response = self
            .client
            .get(format!("{}/youtube/v3/channels", self.base_url))
            .query(&[("part", CHANNEL_PARTS), ("mine", "true")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(YouTubeError::Transport)?;

        let channels: ChannelListResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(YouTubeError::Decode)?;
        let first = channels
            .items
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(ChannelSummary::from);

        debug!(found = first.is_some(), "fetched own channel");
        Ok(first)
    }

    /// Sends the file as a private video. Errors are logged here and returned
    /// to the caller, who remains responsible for removing the file.
    pub async fn upload_video(
        &self,
        access_token: &str,
        request: &UploadRequest,
    ) -> Result<UploadedVideo, YouTubeError> {
        match self.try_upload(access_token, request).await {
            Ok(video) => {
                info!(video_id = %video.id, title = %request.title, "video uploaded");
                Ok(video)
            }
            Err(e) => {
                error!(error = %e, file = %request.file_path.display(), "video upload failed");
                Err(e)
            }
        }
    }

    async fn try_upload(
        &self,
        access_token: &str,
        request: &UploadRequest,
    ) -> Result<UploadedVideo, YouTubeError> {
        let file = open_video(&request.file_path).await?;
        let length = file
            .metadata()
            .await
            .map_err(|source| YouTubeError::File {
                path: request.file_path.clone(),
                source,
            })?
            .len();

        let resource = VideoResource {
            snippet: VideoSnippet {
                title: &request.title,
                description: &request.description,
                tags: &request.tags,
            },
            status: VideoStatus {
                privacy_status: "private",
            },
        };

        let response = self
            .client
            .post(format!("{}/upload/youtube/v3/videos", self.base_url))
            .query(&[("uploadType", "resumable"), ("part", VIDEO_PARTS)])
            .bearer_auth(access_token)
            .header("X-Upload-Content-Type", VIDEO_CONTENT_TYPE)
            .header("X-Upload-Content-Length", length.to_string())
            .json(&resource)
            .send()
            .await
            .map_err(YouTubeError::Transport)?;

        let session = check_status(response).await?;
        let upload_url = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(YouTubeError::MissingUploadLocation)?
            .to_string();

        debug!(bytes = length, "streaming video to upload session");
        let response = self
            .client
            .put(upload_url)
            .header(CONTENT_TYPE, VIDEO_CONTENT_TYPE)
            .header(CONTENT_LENGTH, length.to_string())
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(YouTubeError::Transport)?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(YouTubeError::Decode)
    }
}

async fn open_video(path: &Path) -> Result<File, YouTubeError> {
    File::open(path).await.map_err(|source| YouTubeError::File {
        path: path.to_path_buf(),
        source,
    })
}

async fn check_status(response: Response) -> Result<Response, YouTubeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        Err(YouTubeError::Unauthorized(body))
    } else {
        Err(YouTubeError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
