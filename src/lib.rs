//! One-shot dispatcher: picks an unpublished image from a SQLite catalog,
//! pushes it through a resumable chunked media upload, announces it, and
//! only then marks it as published.

pub mod config;
pub mod database;
pub mod dispatch;
pub mod errors;
pub mod payload;
pub mod security;
pub mod single_instance;
pub mod storage;
pub mod uploader;

pub use config::Config;
pub use database::{CatalogStore, WorkItem};
pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher};
pub use errors::{AppError, AppResult};
pub use payload::{Locator, Payload, PayloadStore};
