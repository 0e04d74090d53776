//! Routes that walk the operator through sign-in, channel view and upload.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::oauth::{OAuthSession, SessionError};
use crate::youtube::{UploadRequest, YouTubeClient, YouTubeError};

pub const HOME_PATH: &str = "/ytapi";
pub const CHANNEL_PATH: &str = "/ytapi/channel";
pub const UPLOAD_PATH: &str = "/ytapi/upload";
pub const CALLBACK_PATH: &str = "/ytapi/auth/admin";

const VIDEO_FIELD: &str = "target_video";

#[derive(Clone)]
pub struct AppState {
    session: Arc<OAuthSession>,
    youtube: Arc<YouTubeClient>,
    upload_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(session: Arc<OAuthSession>, youtube: YouTubeClient, upload_dir: PathBuf) -> Self {
        Self {
            session,
            youtube: Arc::new(youtube),
            upload_dir: Arc::new(upload_dir),
        }
    }

    fn session_failure(&self, err: SessionError) -> AppError {
        match err {
            SessionError::NotAuthorized => AppError::SignIn,
            SessionError::AuthorizationExpired(reason) => {
                warn!(%reason, "authorization expired");
                AppError::Reauthorize(self.session.authorization_url())
            }
            SessionError::Transport(reason) => AppError::Api(reason),
            other => AppError::Internal(other.to_string()),
        }
    }

    fn api_failure(&self, err: YouTubeError) -> AppError {
        if err.is_authorization_error() {
            warn!(error = %err, "api rejected stored credential");
            AppError::Reauthorize(self.session.authorization_url())
        } else {
            AppError::Api(err.to_string())
        }
    }

    async fn require_sign_in(&self) -> Result<(), AppError> {
        let signed_in = self
            .session
            .ensure_credentials_loaded()
            .await
            .map_err(|e| self.session_failure(e))?;
        if signed_in {
            Ok(())
        } else {
            Err(AppError::SignIn)
        }
    }
}

#[derive(Debug)]
enum AppError {
    SignIn,
    Reauthorize(String),
    BadRequest(String),
    Api(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::SignIn => Redirect::to(HOME_PATH).into_response(),
            AppError::Reauthorize(url) => (
                StatusCode::UNAUTHORIZED,
                Html(format!(
                    r#"<p>The authorization for this app has expired.</p>
<a href="{}">Sign in again</a>"#,
                    escape_html(&url)
                )),
            )
                .into_response(),
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Html(format!(
                    r#"<p>{}</p>
<a href="{UPLOAD_PATH}">Back to upload</a>"#,
                    escape_html(&message)
                )),
            )
                .into_response(),
            AppError::Api(message) => {
                error!(%message, "the api returned an error");
                (
                    StatusCode::BAD_GATEWAY,
                    Html(format!(
                        r#"<p>The api returned an error.</p>
<a href="{HOME_PATH}">Home</a>"#
                    )),
                )
                    .into_response()
            }
            AppError::Internal(message) => {
                error!(%message, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.").into_response()
            }
        }
    }
}

type AppResult<T> = Result<T, AppError>;

pub fn router(state: AppState, max_upload_bytes: Option<usize>) -> Router {
    let body_limit = match max_upload_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route("/", get(root))
        .route(HOME_PATH, get(home))
        .route(CHANNEL_PATH, get(channel))
        .route(UPLOAD_PATH, get(upload_form).post(upload_video))
        .route(CALLBACK_PATH, get(oauth_callback))
        .layer(body_limit)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Html<String> {
    Html(format!(r#"<a href="{HOME_PATH}">Start app</a>"#))
}

async fn home(State(state): State<AppState>) -> AppResult<Html<String>> {
    match state.require_sign_in().await {
        Ok(()) => Ok(Html(format!(
            r#"<p><a href="{HOME_PATH}">Home</a></p>
<p><a href="{CHANNEL_PATH}">View channel</a></p>
<p><a href="{UPLOAD_PATH}">Upload video</a></p>"#
        ))),
        Err(AppError::SignIn) => Ok(Html(format!(
            r#"<p>No channel is signed in.</p>
<p>Authorize this app by signing in to your google account.</p>
<p>The app will upload all videos to your account's youtube channel.</p><br>
<a href="{}">Sign in</a>"#,
            escape_html(&state.session.authorization_url())
        ))),
        Err(e) => Err(e),
    }
}

async fn channel(State(state): State<AppState>) -> AppResult<Html<String>> {
    let token = state
        .session
        .access_token()
        .await
        .map_err(|e| state.session_failure(e))?;

    let channel = state
        .youtube
        .fetch_own_channel(&token)
        .await
        .map_err(|e| state.api_failure(e))?;

    let Some(channel) = channel else {
        return Ok(Html(format!(
            r#"<p>No channel found.</p>
<a href="{HOME_PATH}">Home</a>"#
        )));
    };

    let views = channel
        .view_count
        .map(|v| v.to_string())
        .unwrap_or_else(|| "an unknown number of".to_string());
    let id = escape_html(&channel.id);

    Ok(Html(format!(
        r#"<a href="{HOME_PATH}">Home</a>
<p>This channel's id is {id}</p>
<p>with title {title}</p>
<p>and has {views} views.</p>
<a href="https://youtube.com/channel/{id}" target="_blank" rel="noopener noreferrer">Visit channel</a>"#,
        title = escape_html(&channel.title),
    )))
}

async fn upload_form(State(state): State<AppState>) -> AppResult<Html<String>> {
    state.require_sign_in().await?;

    Ok(Html(format!(
        r#"<a href="{HOME_PATH}">Home</a>
<h3>Upload file</h3>
<form action="{UPLOAD_PATH}" method="post" enctype="multipart/form-data">
  <input type="text" name="title" placeholder="title" required />
  <input type="text" name="description" placeholder="description" required />
  <input type="text" name="tags" placeholder="tags" required />
  <p>Note: Please separate the tags with commas. (i.e. Funny, Amazing, etc.)</p>
  <input type="file" name="{VIDEO_FIELD}" accept="video/*" required />
  <input type="submit" value="upload" />
</form>"#
    )))
}

async fn upload_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Html<String>> {
    state.require_sign_in().await?;

    let form = receive_upload_form(multipart, &state.upload_dir).await?;
    let Some(video) = form.video else {
        return Ok(Html(format!(
            r#"<p>No video uploaded.</p>
<a href="{HOME_PATH}">Home</a>
<a href="{UPLOAD_PATH}">Back to upload</a>"#
        )));
    };

    let request = UploadRequest::new(&form.title, &form.description, &form.tags, video.path())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let token = state
        .session
        .access_token()
        .await
        .map_err(|e| state.session_failure(e))?;

    let result = state.youtube.upload_video(&token, &request).await;
    // Removes the received file whether or not the upload worked.
    drop(video);

    match result {
        Ok(uploaded) => Ok(Html(format!(
            r#"<p>Video uploaded successfully.</p>
<p>Video id: {}</p>
<a href="{CHANNEL_PATH}">View channel</a>"#,
            escape_html(&uploaded.id)
        ))),
        Err(e) if e.is_authorization_error() => Err(state.api_failure(e)),
        Err(_) => Ok(Html(format!(
            r#"<p>Upload error!</p>
<a href="{UPLOAD_PATH}">Back to upload</a>"#
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(reason) = query.error {
        warn!(%reason, "consent was not granted");
        return Redirect::to(HOME_PATH).into_response();
    }

    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        return Redirect::to(HOME_PATH).into_response();
    };

    if !state.session.verify_state(query.state.as_deref()) {
        warn!("callback state does not match the consent URL");
        return (
            StatusCode::BAD_REQUEST,
            Html(format!(
                r#"<p>Authorization state mismatch.</p>
<a href="{HOME_PATH}">Home</a>"#
            )),
        )
            .into_response();
    }

    match state.session.exchange_code(&code).await {
        Ok(_) => {
            info!("account authorized");
            Redirect::to(HOME_PATH).into_response()
        }
        Err(SessionError::Store(e)) => AppError::Internal(e.to_string()).into_response(),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Html(format!(
                r#"<p>Error while trying to retrieve access token.</p>
<a href="{HOME_PATH}">Home</a>"#
            )),
        )
            .into_response(),
    }
}

struct UploadForm {
    title: String,
    description: String,
    tags: String,
    video: Option<TempVideo>,
}

/// A received video file; removed from disk when dropped.
struct TempVideo {
    path: PathBuf,
}

impl TempVideo {
    async fn create(dir: &Path, original_name: Option<&str>) -> std::io::Result<(Self, File)> {
        fs::create_dir_all(dir).await?;
        let extension = original_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let path = dir.join(format!("upload-{:016x}{extension}", rand::random::<u64>()));
        let file = File::create(&path).await?;
        Ok((Self { path }, file))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempVideo {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = %e, path = %self.path.display(), "failed to remove received video");
        }
    }
}

async fn receive_upload_form(mut multipart: Multipart, upload_dir: &Path) -> AppResult<UploadForm> {
    let mut form = UploadForm {
        title: String::new(),
        description: String::new(),
        tags: String::new(),
        video: None,
    };

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" | "description" | "tags" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read {name}: {e}")))?;
                match name.as_str() {
                    "title" => form.title = value,
                    "description" => form.description = value,
                    _ => form.tags = value,
                }
            }
            VIDEO_FIELD => {
                let (video, mut file) = TempVideo::create(upload_dir, field.file_name())
                    .await
                    .map_err(|e| AppError::Internal(format!("creating upload file: {e}")))?;

                let mut received: u64 = 0;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read video: {e}")))?
                {
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| AppError::Internal(format!("writing upload file: {e}")))?;
                    received += chunk.len() as u64;
                }
                file.flush()
                    .await
                    .map_err(|e| AppError::Internal(format!("writing upload file: {e}")))?;

                // Browsers send an empty part when no file was picked.
                if received > 0 {
                    info!(bytes = received, path = %video.path().display(), "video received");
                    form.video = Some(video);
                }
            }
            _ => {}
        }
    }

    Ok(form)
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
