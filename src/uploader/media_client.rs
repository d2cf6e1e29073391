use reqwest::header::AUTHORIZATION;
use reqwest::{multipart, Client, Response};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::{AppError, AppResult, UploadPhase};
use crate::payload::Payload;
use crate::security::InputValidator;

use super::clock::{with_cancel, Clock, TokioClock};
use super::oauth::OAuthSigner;
use super::session::{SessionState, UploadSession};

/// Longest response excerpt carried into an error
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub media_category: String,
    pub poll_budget: Duration,
    pub poll_margin: Duration,
    /// Used when the server asks for polling without a delay hint
    pub default_poll_interval: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: 3 * 1024 * 1024,
            media_category: "tweet_image".to_string(),
            poll_budget: Duration::from_secs(60),
            poll_margin: Duration::from_millis(200),
            default_poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for UploadOptions {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size(),
            media_category: config.media_category.clone(),
            poll_budget: config.poll_budget(),
            poll_margin: config.poll_margin(),
            ..Self::default()
        }
    }
}

/// A media asset that is ready to be referenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub media_id: String,
    pub total_bytes: u64,
    pub segments: u32,
    pub polls: u32,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(default)]
    media_id: Option<u64>,
    #[serde(default)]
    media_id_string: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MediaStatusResponse {
    #[serde(default)]
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingInfo {
    pub state: String,
    #[serde(default)]
    pub check_after_secs: Option<u64>,
    #[serde(default)]
    pub progress_percent: Option<u8>,
    #[serde(default)]
    pub error: Option<ProcessingError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProcessingError {
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(name) = &self.name {
            parts.push(name.clone());
        }
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if let Some(code) = self.code {
            parts.push(format!("code {}", code));
        }
        if parts.is_empty() {
            "no details".to_string()
        } else {
            parts.join(": ")
        }
    }
}

/// Server-side processing as reported by FINALIZE or STATUS
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProcessingState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Other(String),
}

impl ProcessingState {
    fn parse(state: &str) -> Self {
        match state {
            "pending" => ProcessingState::Pending,
            "in_progress" => ProcessingState::InProgress,
            "succeeded" => ProcessingState::Succeeded,
            "failed" => ProcessingState::Failed,
            other => ProcessingState::Other(other.to_string()),
        }
    }
}

/// Client for the INIT / APPEND / FINALIZE / STATUS media upload protocol
pub struct MediaUploadClient<C: Clock = TokioClock> {
    http: Client,
    upload_url: String,
    signer: OAuthSigner,
    options: UploadOptions,
    clock: C,
}

impl<C: Clock> MediaUploadClient<C> {
    pub fn new(
        http: Client,
        upload_url: impl Into<String>,
        signer: OAuthSigner,
        options: UploadOptions,
        clock: C,
    ) -> Self {
        Self {
            http,
            upload_url: upload_url.into(),
            signer,
            options,
            clock,
        }
    }

    /// Runs the whole protocol for one payload and returns the media id once
    /// the asset is usable.
    pub async fn upload(
        &self,
        payload: Payload,
        cancel: &CancellationToken,
    ) -> AppResult<UploadedMedia> {
        let mime_type = InputValidator::mime_type_for(&payload.file_name)?;
        let Payload {
            file_name,
            total_bytes,
            mut reader,
        } = payload;

        let media_id = with_cancel(
            cancel,
            "INIT",
            "pending",
            self.init(total_bytes, mime_type),
        )
        .await?;

        let mut session = UploadSession::new(media_id, total_bytes, mime_type);
        log::info!(
            "Upload session {} started for {} ({} bytes, {}) as media {}",
            session.session_id,
            file_name,
            total_bytes,
            mime_type,
            session.media_id
        );

        let result = self
            .drive(&mut session, &file_name, &mut reader, cancel)
            .await;

        match result {
            Ok(()) => {
                log::info!(
                    "Media {} ready after {} segments and {} status polls",
                    session.media_id,
                    session.segments(),
                    session.polls()
                );
                Ok(UploadedMedia {
                    media_id: session.media_id.clone(),
                    total_bytes,
                    segments: session.segments(),
                    polls: session.polls(),
                })
            }
            Err(e) => {
                session.fail();
                log::error!(
                    "Upload session {} for media {} failed: {}",
                    session.session_id,
                    session.media_id,
                    e
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut UploadSession,
        file_name: &str,
        reader: &mut Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        session.advance(SessionState::Appending)?;

        let chunk_size = self.options.chunk_size.max(1);
        loop {
            let mut chunk = Vec::with_capacity(chunk_size);
            let read = (&mut *reader)
                .take(chunk_size as u64)
                .read_to_end(&mut chunk)
                .await?;
            if read == 0 {
                break;
            }

            let streamed = session.bytes_appended() + read as u64;
            if streamed > session.total_bytes {
                return Err(AppError::PayloadSizeMismatch {
                    declared: session.total_bytes,
                    streamed,
                });
            }

            let index = session.next_segment_index();
            with_cancel(
                cancel,
                "APPEND",
                &session.session_id,
                self.append(&session.media_id, file_name, index, chunk),
            )
            .await?;
            session.record_segment(read)?;
            log::debug!(
                "Appended segment {} of media {} ({}/{} bytes)",
                index,
                session.media_id,
                session.bytes_appended(),
                session.total_bytes
            );
        }

        session.verify_complete()?;

        let status = with_cancel(
            cancel,
            "FINALIZE",
            &session.session_id,
            self.finalize(&session.media_id),
        )
        .await?;
        session.advance(SessionState::FinalizePending)?;

        match status.processing_info {
            None => session.advance(SessionState::Succeeded),
            Some(info) => self.await_processing(session, info, cancel).await,
        }
    }

    async fn await_processing(
        &self,
        session: &mut UploadSession,
        initial: ProcessingInfo,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let started = self.clock.now();
        let mut info = initial;

        loop {
            match ProcessingState::parse(&info.state) {
                ProcessingState::Succeeded => return session.advance(SessionState::Succeeded),
                ProcessingState::Failed => {
                    let reason = info
                        .error
                        .as_ref()
                        .map(ProcessingError::describe)
                        .unwrap_or_else(|| "no details".to_string());
                    return Err(AppError::ProcessingFailed {
                        media_id: session.media_id.clone(),
                        reason,
                    });
                }
                ProcessingState::Pending | ProcessingState::InProgress => {}
                ProcessingState::Other(state) => {
                    log::warn!(
                        "Unknown processing state '{}' for media {}, still polling",
                        state,
                        session.media_id
                    );
                }
            }

            session.advance(SessionState::Processing)?;

            if self.clock.now().duration_since(started) >= self.options.poll_budget {
                return Err(AppError::ProcessingTimedOut {
                    media_id: session.media_id.clone(),
                    state: info.state.clone(),
                    budget_secs: self.options.poll_budget.as_secs(),
                });
            }

            let hint = info
                .check_after_secs
                .map(Duration::from_secs)
                .unwrap_or(self.options.default_poll_interval);
            let delay = hint + self.options.poll_margin;
            log::debug!(
                "Media {} is {} ({}%), checking again in {:?}",
                session.media_id,
                info.state,
                info.progress_percent.unwrap_or(0),
                delay
            );

            with_cancel(cancel, "STATUS", &session.session_id, async {
                self.clock.sleep(delay).await;
                Ok(())
            })
            .await?;

            let status = with_cancel(
                cancel,
                "STATUS",
                &session.session_id,
                self.status(&session.media_id),
            )
            .await?;
            session.record_poll();

            match status.processing_info {
                Some(next) => info = next,
                None => return session.advance(SessionState::Succeeded),
            }
        }
    }

    async fn init(&self, total_bytes: u64, mime_type: &str) -> AppResult<String> {
        let params = vec![
            ("command", "INIT".to_string()),
            ("total_bytes", total_bytes.to_string()),
            ("media_type", mime_type.to_string()),
            ("media_category", self.options.media_category.clone()),
        ];
        let auth = self.signer.authorize("POST", &self.upload_url, &params)?;

        let response = self
            .http
            .post(&self.upload_url)
            .header(AUTHORIZATION, auth)
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::upload_failed(UploadPhase::Init, None, e.to_string()))?;

        let body = expect_success(UploadPhase::Init, response).await?;
        let parsed: InitResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::upload_failed(UploadPhase::Init, None, format!("Invalid INIT response: {}", e))
        })?;

        parsed
            .media_id_string
            .filter(|id| !id.is_empty())
            .or_else(|| parsed.media_id.map(|id| id.to_string()))
            .ok_or_else(|| {
                AppError::upload_failed(UploadPhase::Init, None, "INIT response carried no media id")
            })
    }

    async fn append(
        &self,
        media_id: &str,
        file_name: &str,
        segment_index: u32,
        chunk: Vec<u8>,
    ) -> AppResult<()> {
        let part = multipart::Part::bytes(chunk)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| AppError::upload_failed(UploadPhase::Append, None, e.to_string()))?;

        let form = multipart::Form::new()
            .text("command", "APPEND")
            .text("media_id", media_id.to_string())
            .text("segment_index", segment_index.to_string())
            .part("media", part);

        let auth = self.signer.authorize("POST", &self.upload_url, &[])?;

        let response = self
            .http
            .post(&self.upload_url)
            .header(AUTHORIZATION, auth)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::upload_failed(UploadPhase::Append, None, e.to_string()))?;

        expect_success(UploadPhase::Append, response).await?;
        Ok(())
    }

    async fn finalize(&self, media_id: &str) -> AppResult<MediaStatusResponse> {
        let params = vec![
            ("command", "FINALIZE".to_string()),
            ("media_id", media_id.to_string()),
        ];
        let auth = self.signer.authorize("POST", &self.upload_url, &params)?;

        let response = self
            .http
            .post(&self.upload_url)
            .header(AUTHORIZATION, auth)
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::upload_failed(UploadPhase::Finalize, None, e.to_string()))?;

        let body = expect_success(UploadPhase::Finalize, response).await?;
        parse_status(UploadPhase::Finalize, &body)
    }

    async fn status(&self, media_id: &str) -> AppResult<MediaStatusResponse> {
        let params = vec![
            ("command", "STATUS".to_string()),
            ("media_id", media_id.to_string()),
        ];
        let auth = self.signer.authorize("GET", &self.upload_url, &params)?;

        let response = self
            .http
            .get(&self.upload_url)
            .header(AUTHORIZATION, auth)
            .query(&params)
            .send()
            .await
            .map_err(|e| AppError::upload_failed(UploadPhase::Status, None, e.to_string()))?;

        let body = expect_success(UploadPhase::Status, response).await?;
        parse_status(UploadPhase::Status, &body)
    }
}

async fn expect_success(phase: UploadPhase, response: Response) -> AppResult<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::upload_failed(phase, Some(status.as_u16()), e.to_string()))?;

    if !status.is_success() {
        return Err(AppError::upload_failed(
            phase,
            Some(status.as_u16()),
            excerpt(&body),
        ));
    }

    Ok(body)
}

/// An empty body means no processing metadata.
fn parse_status(phase: UploadPhase, body: &str) -> AppResult<MediaStatusResponse> {
    if body.trim().is_empty() {
        return Ok(MediaStatusResponse::default());
    }
    serde_json::from_str(body).map_err(|e| {
        AppError::upload_failed(phase, None, format!("Invalid {} response: {}", phase, e))
    })
}

pub(crate) fn excerpt(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
