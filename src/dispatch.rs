use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_config, Config};
use crate::database::{CatalogStore, WorkItem};
use crate::errors::AppError;
use crate::payload::PayloadStore;
use crate::security::InputValidator;
use crate::uploader::{Announcer, Clock, MediaUploadClient, PublicReference};

/// How a dispatch attempt ended when nothing went wrong
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every catalog item is already published
    QueueEmpty,
    Published {
        item_id: i64,
        media_id: String,
        reference: PublicReference,
    },
    /// The endpoint accepted the announcement without naming it. The item is
    /// committed anyway so it is never announced twice.
    PublishedUnconfirmed { item_id: i64, media_id: String },
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(#[source] AppError),

    #[error("Catalog error: {0}")]
    Catalog(#[source] AppError),

    #[error("Item {item_id} failed validation: {source}")]
    Validation { item_id: i64, source: AppError },

    #[error("Failed to upload {item_id}: {source}")]
    Upload { item_id: i64, source: AppError },

    #[error("Failed to publish {item_id}: {source}")]
    Publish { item_id: i64, source: AppError },

    /// The announcement exists but the catalog still says unpublished; the
    /// next run would announce the item again.
    #[error("Item {item_id} was published at {reference} but could not be marked as published: {source}")]
    Commit {
        item_id: i64,
        reference: String,
        source: AppError,
    },
}

impl DispatchError {
    pub fn item_id(&self) -> Option<i64> {
        match self {
            DispatchError::Config(_) | DispatchError::Catalog(_) => None,
            DispatchError::Validation { item_id, .. }
            | DispatchError::Upload { item_id, .. }
            | DispatchError::Publish { item_id, .. }
            | DispatchError::Commit { item_id, .. } => Some(*item_id),
        }
    }

    /// Process exit status for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            DispatchError::Config(_) => 2,
            DispatchError::Commit { .. } => 3,
            _ => 1,
        }
    }

    /// Whether the next scheduled run can safely try again
    pub fn is_safe_to_rerun(&self) -> bool {
        !matches!(self, DispatchError::Commit { .. })
    }
}

/// One-shot pipeline: select, upload, announce, commit.
pub struct Dispatcher<'a, C: Clock> {
    config: &'a Config,
    catalog: &'a CatalogStore,
    payloads: &'a PayloadStore,
    uploader: &'a MediaUploadClient<C>,
    announcer: &'a Announcer,
}

impl<'a, C: Clock> Dispatcher<'a, C> {
    pub fn new(
        config: &'a Config,
        catalog: &'a CatalogStore,
        payloads: &'a PayloadStore,
        uploader: &'a MediaUploadClient<C>,
        announcer: &'a Announcer,
    ) -> Self {
        Self {
            config,
            catalog,
            payloads,
            uploader,
            announcer,
        }
    }

    pub async fn dispatch_one<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        validate_config(self.config).map_err(DispatchError::Config)?;

        let lease = self.config.claim_lease();
        let candidate = match lease {
            Some(lease) => self.catalog.claim_candidate(rng, lease).await,
            None => self.catalog.select_candidate(rng).await,
        }
        .map_err(DispatchError::Catalog)?;

        let Some(item) = candidate else {
            log::info!("No unpublished items in the catalog, nothing to do");
            return Ok(DispatchOutcome::QueueEmpty);
        };

        log::info!(
            "Dispatching item {} ({})",
            item.id,
            item.locator
                .as_ref()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "no locator".to_string())
        );

        let (media_id, reference) = match self.announce(&item, cancel).await {
            Ok(done) => done,
            Err(e) => {
                if lease.is_some() {
                    if let Err(release_err) = self.catalog.release_claim(item.id).await {
                        log::warn!(
                            "Failed to release claim on item {} (it expires on its own): {}",
                            item.id,
                            release_err
                        );
                    }
                }
                return Err(e);
            }
        };

        let url = reference
            .as_ref()
            .map(|r| r.url.clone())
            .unwrap_or_else(|| "unknown".to_string());

        if let Err(e) = self.catalog.commit_published(item.id).await {
            log::error!(
                "Item {} is live at {} but the catalog was not updated; it will be announced again unless marked published by hand",
                item.id,
                url
            );
            return Err(DispatchError::Commit {
                item_id: item.id,
                reference: url,
                source: e,
            });
        }

        log::info!(
            "Successfully uploaded {}. Timestamp: {}. URL: {}",
            item.id,
            chrono::Utc::now().timestamp(),
            url
        );

        Ok(match reference {
            Some(reference) => DispatchOutcome::Published {
                item_id: item.id,
                media_id,
                reference,
            },
            None => DispatchOutcome::PublishedUnconfirmed {
                item_id: item.id,
                media_id,
            },
        })
    }

    /// Validation, upload and publish. Never touches `published`. A `None`
    /// reference means the announcement went out but could not be named.
    async fn announce(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<PublicReference>), DispatchError> {
        let invalid = |source: AppError| DispatchError::Validation {
            item_id: item.id,
            source,
        };

        InputValidator::validate_caption(&item.caption, self.config.max_caption_chars)
            .map_err(invalid)?;
        let locator = item.require_locator().map_err(invalid)?;
        InputValidator::mime_type_for(&locator.file_name()).map_err(invalid)?;

        let unreadable = |source: AppError| DispatchError::Upload {
            item_id: item.id,
            source,
        };
        let size = self.payloads.size(locator).await.map_err(unreadable)?;
        InputValidator::validate_payload_size(size, self.config.max_payload_bytes)
            .map_err(invalid)?;

        let payload = self.payloads.open(locator).await.map_err(unreadable)?;

        let media = self
            .uploader
            .upload(payload, cancel)
            .await
            .map_err(|source| {
                if source.is_configuration() {
                    DispatchError::Config(source)
                } else if source.is_permanent() {
                    DispatchError::Validation {
                        item_id: item.id,
                        source,
                    }
                } else {
                    DispatchError::Upload {
                        item_id: item.id,
                        source,
                    }
                }
            })?;

        let reference = match self
            .announcer
            .publish(&item.caption, &media.media_id, cancel)
            .await
        {
            Ok(reference) => Some(reference),
            Err(AppError::AnnouncementUnconfirmed { status, reason }) => {
                log::warn!(
                    "Item {} was announced (HTTP {}) without a usable reference ({}); marking it published",
                    item.id,
                    status,
                    reason
                );
                None
            }
            Err(source) if source.is_configuration() => return Err(DispatchError::Config(source)),
            Err(source) => {
                return Err(DispatchError::Publish {
                    item_id: item.id,
                    source,
                })
            }
        };

        Ok((media.media_id, reference))
    }
}
