use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};

use super::clock::with_cancel;
use super::media_client::excerpt;
use super::oauth::OAuthSigner;

/// Where a published announcement can be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicReference {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct AnnouncementResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    id_str: Option<String>,
}

/// Posts a caption that references an uploaded media handle.
pub struct Announcer {
    http: Client,
    status_url: String,
    public_url_base: String,
    signer: OAuthSigner,
}

impl Announcer {
    pub fn new(
        http: Client,
        status_url: impl Into<String>,
        public_url_base: impl Into<String>,
        signer: OAuthSigner,
    ) -> Self {
        Self {
            http,
            status_url: status_url.into(),
            public_url_base: public_url_base.into(),
            signer,
        }
    }

    /// The caption is expected to already fit the remote limit.
    pub async fn publish(
        &self,
        caption: &str,
        media_id: &str,
        cancel: &CancellationToken,
    ) -> AppResult<PublicReference> {
        with_cancel(cancel, "PUBLISH", media_id, self.post(caption, media_id)).await
    }

    async fn post(&self, caption: &str, media_id: &str) -> AppResult<PublicReference> {
        let params = vec![
            ("status", caption.to_string()),
            ("media_ids", media_id.to_string()),
            ("display_coordinates", "false".to_string()),
        ];
        let auth = self.signer.authorize("POST", &self.status_url, &params)?;

        let response = self
            .http
            .post(&self.status_url)
            .header(AUTHORIZATION, auth)
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::PublishFailed {
                status: None,
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AppError::PublishFailed {
            status: Some(status.as_u16()),
            reason: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(AppError::PublishFailed {
                status: Some(status.as_u16()),
                reason: excerpt(&body),
            });
        }

        // the announcement exists from here on
        let parsed: AnnouncementResponse =
            serde_json::from_str(&body).map_err(|e| AppError::AnnouncementUnconfirmed {
                status: status.as_u16(),
                reason: format!("Invalid announcement response: {}", e),
            })?;

        let id = parsed
            .id_str
            .filter(|id| !id.is_empty())
            .or_else(|| parsed.id.map(|id| id.to_string()))
            .ok_or_else(|| AppError::AnnouncementUnconfirmed {
                status: status.as_u16(),
                reason: format!("response carried no id: {}", excerpt(&body)),
            })?;

        let url = format!("{}{}", self.public_url_base, id);
        log::info!("Published announcement {} with media {}", id, media_id);
        Ok(PublicReference { id, url })
    }
}
