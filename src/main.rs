use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use image_dispatch::config::{self, Config};
use image_dispatch::database::CatalogStore;
use image_dispatch::dispatch::{DispatchError, DispatchOutcome, Dispatcher};
use image_dispatch::payload::PayloadStore;
use image_dispatch::single_instance::InstanceLock;
use image_dispatch::storage::ObjectStorage;
use image_dispatch::uploader::{
    Announcer, MediaUploadClient, OAuthCredentials, OAuthSigner, TokioClock, UploadOptions,
};

#[derive(Parser)]
#[command(name = "image-dispatch", version, about = "Posts one catalogued image per run")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload and announce one unpublished catalog item
    Run {
        /// JSON config file
        config: PathBuf,
        /// Lock file preventing overlapping runs
        #[arg(long)]
        lock_file: Option<PathBuf>,
    },
    /// Create or migrate a local catalog
    InitDb {
        db: PathBuf,
    },
    /// Add every image in a directory or s3://bucket/prefix to a local catalog
    Populate {
        db: PathBuf,
        source: String,
        /// Caption stored with every new item
        #[arg(long)]
        caption: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, lock_file } => run(&config, lock_file).await,
        Command::InitDb { db } => report(init_db(&db).await),
        Command::Populate {
            db,
            source,
            caption,
            region,
            endpoint,
        } => report(populate(&db, &source, caption.as_deref(), ObjectStorage::new(region, endpoint)).await),
    }
}

async fn run(config_path: &Path, lock_file: Option<PathBuf>) -> ExitCode {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => return fail(&DispatchError::Config(e)),
    };

    let lock_path = lock_file.unwrap_or_else(InstanceLock::default_path);
    let _lock = match InstanceLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            log_error(&anyhow::Error::from(e));
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    arm_cancellation(&config, &cancel);

    match dispatch(&config, &cancel).await {
        Ok(DispatchOutcome::QueueEmpty) => ExitCode::SUCCESS,
        Ok(DispatchOutcome::Published { .. }) => ExitCode::SUCCESS,
        Ok(DispatchOutcome::PublishedUnconfirmed { item_id, media_id }) => {
            log::warn!(
                "Item {} (media {}) is published but its public URL is unknown; check the account by hand",
                item_id,
                media_id
            );
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

async fn dispatch(config: &Config, cancel: &CancellationToken) -> Result<DispatchOutcome, DispatchError> {
    let storage = ObjectStorage::new(config.storage_region.clone(), config.storage_endpoint.clone());

    let catalog = match &config.db_bucket {
        Some(bucket) => CatalogStore::open_remote(storage.clone(), bucket, &config.db_path).await,
        None => CatalogStore::open(Path::new(&config.db_path), false).await,
    }
    .map_err(DispatchError::Catalog)?;

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| DispatchError::Config(e.into()))?;
    let signer = OAuthSigner::new(OAuthCredentials::from(config));

    let uploader = MediaUploadClient::new(
        http.clone(),
        config.upload_url.clone(),
        signer.clone(),
        UploadOptions::from(config),
        TokioClock,
    );
    let announcer = Announcer::new(http, config.status_url.clone(), config.public_url_base.clone(), signer);
    let payloads = PayloadStore::new(storage);

    let dispatcher = Dispatcher::new(config, &catalog, &payloads, &uploader, &announcer);
    let mut rng = StdRng::from_os_rng();
    let outcome = dispatcher.dispatch_one(&mut rng, cancel).await;

    catalog.close().await;
    outcome
}

/// Ctrl+C and the overall attempt deadline both cancel the run.
fn arm_cancellation(config: &Config, cancel: &CancellationToken) {
    let on_interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Received Ctrl+C, cancelling dispatch...");
        on_interrupt.cancel();
    }) {
        log::warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let on_deadline = cancel.clone();
    let deadline = config.attempt_timeout();
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        log::error!("Dispatch exceeded {:?}, cancelling", deadline);
        on_deadline.cancel();
    });
}

async fn init_db(db: &Path) -> anyhow::Result<()> {
    let catalog = CatalogStore::open(db, true).await?;
    let pending = catalog.count_unpublished().await?;
    log::info!("Catalog {} ready with {} unpublished items", db.display(), pending);
    catalog.close().await;
    Ok(())
}

async fn populate(
    db: &Path,
    source: &str,
    caption: Option<&str>,
    storage: ObjectStorage,
) -> anyhow::Result<()> {
    let catalog = CatalogStore::open(db, true).await?;
    let locators = PayloadStore::new(storage).discover(source).await?;

    for locator in &locators {
        let id = catalog.insert_item(locator, caption).await?;
        log::debug!("Inserted {} as item {}", locator, id);
    }

    log::info!("Added {} items from {} to {}", locators.len(), source, db.display());
    catalog.close().await;
    Ok(())
}

fn fail(error: &DispatchError) -> ExitCode {
    log_error(&anyhow::anyhow!("{}", error));
    match (error, error.item_id()) {
        (DispatchError::Commit { reference, .. }, Some(item_id)) => log::error!(
            "Mark item {} as published before the next run; it is already live at {}",
            item_id,
            reference
        ),
        (_, Some(item_id)) if error.is_safe_to_rerun() => log::info!(
            "Item {} is still unpublished and stays eligible for the next run",
            item_id
        ),
        _ => {}
    }
    ExitCode::from(error.exit_code())
}

fn report(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn log_error(error: &anyhow::Error) {
    log::error!(
        "Failed to upload an image. Timestamp: {}. Error: {:#}",
        chrono::Utc::now().timestamp(),
        error
    );
}
