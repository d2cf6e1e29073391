use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use sha1::Sha1;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{AppError, AppResult};

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 unreserved characters stay as-is, everything else is encoded
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token: String,
    pub token_secret: String,
}

impl From<&Config> for OAuthCredentials {
    fn from(config: &Config) -> Self {
        Self {
            consumer_key: config.api_key.clone(),
            consumer_secret: config.api_secret.clone(),
            token: config.access_token.clone(),
            token_secret: config.access_secret.clone(),
        }
    }
}

/// Produces OAuth 1.0a `Authorization` headers (HMAC-SHA1).
#[derive(Debug, Clone)]
pub struct OAuthSigner {
    credentials: OAuthCredentials,
}

impl OAuthSigner {
    pub fn new(credentials: OAuthCredentials) -> Self {
        Self { credentials }
    }

    /// `params` are the form or query parameters that take part in the
    /// signature. Multipart bodies do not.
    pub fn authorize(&self, method: &str, url: &str, params: &[(&str, String)]) -> AppResult<String> {
        let nonce = Uuid::new_v4().simple().to_string();
        let timestamp = chrono::Utc::now().timestamp();
        self.authorize_with(method, url, params, &nonce, timestamp)
    }

    fn authorize_with(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, String)],
        nonce: &str,
        timestamp: i64,
    ) -> AppResult<String> {
        let mut oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".to_string(), self.credentials.consumer_key.clone()),
            ("oauth_nonce".to_string(), nonce.to_string()),
            ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
            ("oauth_timestamp".to_string(), timestamp.to_string()),
            ("oauth_token".to_string(), self.credentials.token.clone()),
            ("oauth_version".to_string(), "1.0".to_string()),
        ];

        let mut signed: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        signed.extend(oauth_params.iter().cloned());

        let signature = self.signature(method, url, signed)?;
        oauth_params.push(("oauth_signature".to_string(), signature));

        let header = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!("OAuth {}", header))
    }

    fn signature(&self, method: &str, url: &str, mut params: Vec<(String, String)>) -> AppResult<String> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::Config(format!("Invalid request URL {}: {}", url, e)))?;

        params.extend(
            parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );

        let mut encoded: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (encode(k), encode(v)))
            .collect();
        encoded.sort();

        let parameter_string = encoded
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let host = parsed.host_str().unwrap_or_default().to_lowercase();
        let base_url = match parsed.port() {
            Some(port) => format!("{}://{}:{}{}", parsed.scheme(), host, port, parsed.path()),
            None => format!("{}://{}{}", parsed.scheme(), host, parsed.path()),
        };

        let base_string = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            encode(&base_url),
            encode(&parameter_string)
        );

        let signing_key = format!(
            "{}&{}",
            encode(&self.credentials.consumer_secret),
            encode(&self.credentials.token_secret)
        );

        let mut mac = HmacSha1::new_from_slice(signing_key.as_bytes())
            .map_err(|e| AppError::Internal(format!("Invalid signing key: {}", e)))?;
        mac.update(base_string.as_bytes());

        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}
