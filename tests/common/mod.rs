#![allow(dead_code)]

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::{Match, MockServer, Request};

use image_dispatch::config::Config;
use image_dispatch::database::CatalogStore;
use image_dispatch::dispatch::Dispatcher;
use image_dispatch::payload::{Locator, PayloadStore};
use image_dispatch::uploader::{
    Announcer, ManualClock, MediaUploadClient, OAuthCredentials, OAuthSigner, UploadOptions,
};

pub const UPLOAD_PATH: &str = "/1.1/media/upload.json";
pub const STATUS_PATH: &str = "/1.1/statuses/update.json";
pub const PUBLIC_BASE: &str = "https://example.test/status/";

/// Matches one upload protocol command, whether sent as a form or multipart
pub struct Command(pub &'static str);

impl Match for Command {
    fn matches(&self, request: &Request) -> bool {
        let body = String::from_utf8_lossy(&request.body);
        body.contains(&format!("command={}", self.0))
            || body.contains(&format!("name=\"command\"\r\n\r\n{}\r\n", self.0))
    }
}

pub fn signer() -> OAuthSigner {
    OAuthSigner::new(OAuthCredentials {
        consumer_key: "consumer".to_string(),
        consumer_secret: "consumer-secret".to_string(),
        token: "token".to_string(),
        token_secret: "token-secret".to_string(),
    })
}

pub fn config_for(server: &MockServer, db_path: &str, overrides: serde_json::Value) -> Config {
    let mut value = json!({
        "db_path": db_path,
        "api_key": "consumer",
        "api_secret": "consumer-secret",
        "access_token": "token",
        "access_secret": "token-secret",
        "upload_url": format!("{}{}", server.uri(), UPLOAD_PATH),
        "status_url": format!("{}{}", server.uri(), STATUS_PATH),
        "public_url_base": PUBLIC_BASE,
        "poll_budget_secs": 60,
    });
    if let (Some(target), Some(extra)) = (value.as_object_mut(), overrides.as_object()) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
    Config::from_value(value).unwrap()
}

pub fn upload_client(
    server: &MockServer,
    options: UploadOptions,
    clock: Arc<ManualClock>,
) -> MediaUploadClient<Arc<ManualClock>> {
    MediaUploadClient::new(
        reqwest::Client::new(),
        format!("{}{}", server.uri(), UPLOAD_PATH),
        signer(),
        options,
        clock,
    )
}

/// Deterministic, non-repeating-looking payload bytes
pub fn payload_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A catalog file, a payload directory and the collaborators wired to a
/// mock server.
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub catalog: CatalogStore,
    pub payloads: PayloadStore,
    pub uploader: MediaUploadClient<Arc<ManualClock>>,
    pub announcer: Announcer,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub async fn new(server: &MockServer, overrides: serde_json::Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("catalog.db");
        let config = config_for(server, &db_path.to_string_lossy(), overrides);
        let catalog = CatalogStore::open(&db_path, true).await.unwrap();
        let clock = Arc::new(ManualClock::new());

        let uploader = MediaUploadClient::new(
            reqwest::Client::new(),
            config.upload_url.clone(),
            OAuthSigner::new(OAuthCredentials::from(&config)),
            UploadOptions::from(&config),
            clock.clone(),
        );
        let announcer = Announcer::new(
            reqwest::Client::new(),
            config.status_url.clone(),
            config.public_url_base.clone(),
            OAuthSigner::new(OAuthCredentials::from(&config)),
        );

        Self {
            dir,
            config,
            catalog,
            payloads: PayloadStore::default(),
            uploader,
            announcer,
            clock,
        }
    }

    /// Writes a payload file and catalogs it.
    pub async fn add_item(&self, file_name: &str, size: usize, caption: &str) -> i64 {
        let path = self.dir.path().join(file_name);
        std::fs::write(&path, payload_bytes(size)).unwrap();
        self.catalog
            .insert_item(&Locator::File(path), Some(caption))
            .await
            .unwrap()
    }

    pub fn dispatcher(&self) -> Dispatcher<'_, Arc<ManualClock>> {
        Dispatcher::new(
            &self.config,
            &self.catalog,
            &self.payloads,
            &self.uploader,
            &self.announcer,
        )
    }

    pub async fn is_published(&self, id: i64) -> bool {
        self.catalog.get_item(id).await.unwrap().unwrap().published
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Named fields of a multipart/form-data request body
pub fn multipart_fields(request: &Request) -> HashMap<String, Vec<u8>> {
    let content_type = request
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let boundary = content_type
        .split("boundary=")
        .nth(1)
        .unwrap_or_default()
        .trim_matches('"')
        .to_string();
    let delimiter = format!("--{}", boundary);

    let mut fields = HashMap::new();
    let mut rest: &[u8] = &request.body;
    while let Some(start) = find(rest, delimiter.as_bytes()) {
        rest = &rest[start + delimiter.len()..];
        let end = find(rest, delimiter.as_bytes()).unwrap_or(rest.len());
        let part = &rest[..end];

        if let Some(header_end) = find(part, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&part[..header_end]);
            let name = headers
                .split("name=\"")
                .nth(1)
                .and_then(|r| r.split('"').next())
                .map(str::to_string);
            if let Some(name) = name {
                let mut content = &part[header_end + 4..];
                if content.ends_with(b"\r\n") {
                    content = &content[..content.len() - 2];
                }
                fields.insert(name, content.to_vec());
            }
        }
    }
    fields
}

pub async fn requests_for(server: &MockServer, command: &'static str) -> Vec<Request> {
    let matcher = Command(command);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| matcher.matches(r) || r.url.query().map_or(false, |q| q.contains(&format!("command={}", command))))
        .collect()
}

/// Collects formatted log lines so tests can check what an operator sees.
struct CapturingLogger;

static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());
static LOGGER: CapturingLogger = CapturingLogger;

impl log::Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            if let Ok(mut lines) = CAPTURED.lock() {
                lines.push(record.args().to_string());
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the capturing logger once per test binary.
pub fn capture_logs() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

pub fn captured_lines() -> Vec<String> {
    CAPTURED.lock().map(|lines| lines.clone()).unwrap_or_default()
}
