//! Signed upstream client and the paginated retrieval engine.
//!
//! Every business request carries an MD5-over-sorted-params signature that is
//! AES/ECB encrypted with the application id and base64 encoded. The retrieval
//! engine drives offset- or page-cursor endpoints with bounded retry and a
//! skip-and-advance policy for persistence failures.

use std::collections::BTreeMap;
use std::time::Duration;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyInit};
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use bridge_core::{canonical_json, ApiEnvelope, PageCursor};

pub const CRATE_NAME: &str = "bridge-client";

const TOKEN_PATH: &str = "/api/auth-server/oauth/access-token";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub app_id: String,
    pub app_secret: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl UpstreamConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let app_id = std::env::var("UPSTREAM_APP_ID").context("UPSTREAM_APP_ID must be set")?;
        let app_secret =
            std::env::var("UPSTREAM_APP_SECRET").context("UPSTREAM_APP_SECRET must be set")?;
        let base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://openapi.lingxing.com".to_string());
        let timeout_secs = std::env::var("UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30u64);

        Ok(Self {
            app_id,
            app_secret,
            base_url,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream rejected the call: {0}")]
    Api(String),
    #[error("signing key must be 16/24/32 bytes, got {0}")]
    SignKey(usize),
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Flatten one body value for signing: objects and arrays become canonical
/// JSON, scalars their bare string form. Empty strings are dropped later.
pub fn flatten_for_sign(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => canonical_json(value),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `k=v` pairs joined with `&`, keys sorted bytewise, empty values skipped.
pub fn signature_base(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn md5_upper_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize()).to_uppercase()
}

fn aes_ecb_encrypt(key: &[u8], plain: &[u8]) -> Result<Vec<u8>, ApiError> {
    // Key width selects the AES variant, matching how the upstream keys the
    // cipher with the raw application id.
    let encrypted = match key.len() {
        16 => ecb::Encryptor::<aes::Aes128>::new_from_slice(key)
            .map_err(|_| ApiError::SignKey(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plain),
        24 => ecb::Encryptor::<aes::Aes192>::new_from_slice(key)
            .map_err(|_| ApiError::SignKey(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plain),
        32 => ecb::Encryptor::<aes::Aes256>::new_from_slice(key)
            .map_err(|_| ApiError::SignKey(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plain),
        other => return Err(ApiError::SignKey(other)),
    };
    Ok(encrypted)
}

/// Full signature: uppercase-hex MD5 of the sorted parameter string,
/// AES/ECB/PKCS7 encrypted with the app id, base64 encoded.
pub fn sign_params(params: &BTreeMap<String, String>, app_id: &str) -> Result<String, ApiError> {
    let digest = md5_upper_hex(&signature_base(params));
    let encrypted = aes_ecb_encrypt(app_id.as_bytes(), digest.as_bytes())?;
    Ok(BASE64.encode(encrypted))
}

#[derive(Debug)]
pub struct SignedClient {
    config: UpstreamConfig,
    http: reqwest::Client,
}

impl SignedClient {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building upstream http client")?;
        Ok(Self { config, http })
    }

    /// Exchange app credentials for a short-lived access token. Tokens are
    /// not cached; each business call acquires a fresh one.
    pub async fn acquire_token(&self) -> Result<String, ApiError> {
        let url = format!("{}{}", self.config.base_url, TOKEN_PATH);
        let form = [
            ("appId", self.config.app_id.as_str()),
            ("appSecret", self.config.app_secret.as_str()),
        ];
        let response = self.http.post(&url).form(&form).send().await?;
        let body: Value = response.json().await?;

        let code_ok = matches!(
            body.get("code"),
            Some(Value::Number(n)) if n.as_i64() == Some(200)
        ) || matches!(body.get("code"), Some(Value::String(s)) if s == "200");
        if !code_ok {
            return Err(ApiError::Auth(format!("token exchange rejected: {body}")));
        }

        body.get("data")
            .and_then(|data| data.get("access_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Auth("token response carried no access_token".into()))
    }

    /// Build the auth query parameters for one business body at a fixed
    /// token/timestamp pair. Split out so signing stays testable offline.
    pub fn auth_query(
        &self,
        body: &Map<String, Value>,
        access_token: &str,
        timestamp: &str,
    ) -> Result<Vec<(String, String)>, ApiError> {
        let mut params: BTreeMap<String, String> = body
            .iter()
            .map(|(k, v)| (k.clone(), flatten_for_sign(v)))
            .collect();
        params.insert("access_token".into(), access_token.to_string());
        params.insert("app_key".into(), self.config.app_id.clone());
        params.insert("timestamp".into(), timestamp.to_string());

        let sign = sign_params(&params, &self.config.app_id)?;
        Ok(vec![
            ("access_token".into(), access_token.to_string()),
            ("app_key".into(), self.config.app_id.clone()),
            ("timestamp".into(), timestamp.to_string()),
            ("sign".into(), sign),
        ])
    }

    /// Signed business call: JSON body, auth material in the query string.
    pub async fn call(
        &self,
        path: &str,
        body: &Map<String, Value>,
    ) -> Result<ApiEnvelope, ApiError> {
        let access_token = self.acquire_token().await?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let query = self.auth_query(body, &access_token, &timestamp)?;

        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .http
            .post(&url)
            .query(&query)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        let raw: Value = response.json().await?;
        let envelope = ApiEnvelope::from_value(raw)?;
        Ok(envelope)
    }
}

/// One paginated endpoint, seen from the engine.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, cursor: &PageCursor) -> Result<ApiEnvelope, ApiError>;
}

/// Where fetched pages go. Returns the number of records written.
#[async_trait]
pub trait PageSink: Send + Sync {
    async fn persist(&self, items: &[Value]) -> anyhow::Result<usize>;
}

/// A concrete endpoint bound to a signed client and a fixed business body;
/// the cursor parameters are merged into the body per request.
pub struct EndpointSource<'a> {
    pub client: &'a SignedClient,
    pub path: &'a str,
    pub base_body: Map<String, Value>,
}

#[async_trait]
impl PageSource for EndpointSource<'_> {
    async fn fetch(&self, cursor: &PageCursor) -> Result<ApiEnvelope, ApiError> {
        let mut body = self.base_body.clone();
        cursor.apply(&mut body);
        self.client.call(self.path, &body).await
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("total discovery failed: {0}")]
    Probe(#[source] ApiError),
    #[error("upstream reported no usable total")]
    TotalUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Aborted,
}

/// Outcome of one retrieval run. `skipped_records` counts items whose page
/// fetched fine but failed to persist; those offsets were still consumed.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub expected_total: u64,
    pub processed: u64,
    pub skipped_records: u64,
    pub skipped_pages: u64,
    pub pages_fetched: u64,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct PageLoop {
    pub page_size: u64,
    pub probe_size: u64,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for PageLoop {
    fn default() -> Self {
        Self {
            page_size: 100,
            probe_size: 20,
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl PageLoop {
    /// Drive one endpoint to completion: discover the total with a small
    /// probe request, then fetch/persist/advance until the declared total is
    /// consumed or the upstream returns an empty page.
    ///
    /// Fetch failures retry the same cursor with a doubled pause, up to
    /// `max_attempts` consecutive failures; a successful fetch resets the
    /// counter. Persist failures never retry: the page is counted as skipped
    /// and the cursor advances past it.
    pub async fn run<S, K>(
        &self,
        source: &S,
        sink: &K,
        mut cursor: PageCursor,
    ) -> Result<RunReport, EngineError>
    where
        S: PageSource,
        K: PageSink,
    {
        let probe = cursor.with_length(self.probe_size);
        let envelope = match source.fetch(&probe).await {
            Ok(envelope) if envelope.is_success() => envelope,
            Ok(envelope) => return Err(EngineError::Probe(ApiError::Api(envelope.error_message()))),
            Err(err) if err.is_auth() => return Err(EngineError::Auth(err.to_string())),
            Err(err) => return Err(EngineError::Probe(err)),
        };
        let expected_total = envelope.resolve_total().ok_or(EngineError::TotalUnavailable)?;

        let mut report = RunReport {
            expected_total,
            processed: 0,
            skipped_records: 0,
            skipped_pages: 0,
            pages_fetched: 0,
            outcome: RunOutcome::Done,
        };
        if expected_total == 0 {
            return Ok(report);
        }

        cursor = cursor.with_length(self.page_size);
        let mut consumed: u64 = 0;
        let mut attempts: u32 = 0;

        while consumed < expected_total {
            let envelope = match source.fetch(&cursor).await {
                Ok(envelope) if envelope.is_success() => envelope,
                outcome => {
                    let reason = match outcome {
                        Ok(envelope) => envelope.error_message(),
                        Err(err) if err.is_auth() => {
                            return Err(EngineError::Auth(err.to_string()))
                        }
                        Err(err) => err.to_string(),
                    };
                    attempts += 1;
                    warn!(attempts, reason = %reason, "page fetch failed");
                    if attempts >= self.max_attempts {
                        report.outcome = RunOutcome::Aborted;
                        return Ok(report);
                    }
                    tokio::time::sleep(self.delay * 2).await;
                    continue;
                }
            };

            attempts = 0;
            let items = envelope.item_list().unwrap_or_default();
            if items.is_empty() {
                // Upstream disagrees with its own total; trust the data.
                break;
            }
            report.pages_fetched += 1;

            match sink.persist(&items).await {
                Ok(written) => report.processed += written as u64,
                Err(err) => {
                    warn!(records = items.len(), error = %err, "page persist failed, skipping");
                    report.skipped_records += items.len() as u64;
                    report.skipped_pages += 1;
                }
            }

            let returned = items.len() as u64;
            cursor.advance(returned);
            consumed += returned;

            if consumed < expected_total {
                tokio::time::sleep(self.delay).await;
            }
        }

        info!(
            expected = report.expected_total,
            processed = report.processed,
            skipped = report.skipped_records,
            "retrieval run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn signature_base_sorts_and_drops_empty_values() {
        let body = json!({"a": "1", "b": "", "c": [1, 2]});
        let mut merged: BTreeMap<String, String> = body
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), flatten_for_sign(v)))
            .collect();
        merged.insert("access_token".into(), "T".into());
        merged.insert("app_key".into(), "K".into());
        merged.insert("timestamp".into(), "1700000000".into());

        assert_eq!(
            signature_base(&merged),
            "a=1&access_token=T&app_key=K&c=[1,2]&timestamp=1700000000"
        );
    }

    #[test]
    fn structured_values_flatten_to_canonical_json() {
        assert_eq!(flatten_for_sign(&json!({"y": 1, "x": "仓"})), r#"{"x":"仓","y":1}"#);
        assert_eq!(flatten_for_sign(&json!([10024])), "[10024]");
        assert_eq!(flatten_for_sign(&json!("plain")), "plain");
        assert_eq!(flatten_for_sign(&json!(7)), "7");
    }

    #[test]
    fn md5_digest_is_uppercase_hex() {
        assert_eq!(md5_upper_hex(""), "D41D8CD98F00B204E9800998ECF8427E");
    }

    #[test]
    fn signing_is_deterministic_and_body_sensitive() {
        let app_id = "0123456789abcdef"; // 16 bytes -> AES-128
        let first = sign_params(&params(&[("a", "1"), ("b", "2")]), app_id).expect("sign");
        let second = sign_params(&params(&[("a", "1"), ("b", "2")]), app_id).expect("sign");
        let changed = sign_params(&params(&[("a", "1"), ("b", "3")]), app_id).expect("sign");
        assert_eq!(first, second);
        assert_ne!(first, changed);

        let raw = BASE64.decode(&first).expect("valid base64");
        assert_eq!(raw.len() % 16, 0);
    }

    #[test]
    fn signing_rejects_odd_key_widths() {
        let err = sign_params(&params(&[("a", "1")]), "short-key").unwrap_err();
        assert!(matches!(err, ApiError::SignKey(9)));
    }

    struct ScriptedSource {
        responses: Mutex<Vec<Result<Value, ApiError>>>,
        seen: Mutex<Vec<PageCursor>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Value, ApiError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch(&self, cursor: &PageCursor) -> Result<ApiEnvelope, ApiError> {
            self.seen.lock().unwrap().push(*cursor);
            let next = self
                .responses
                .lock()
                .unwrap()
                .remove(0)
                .map(|v| ApiEnvelope::from_value(v).expect("scripted envelope"));
            next
        }
    }

    struct CountingSink {
        fail: bool,
        persisted: Mutex<usize>,
    }

    #[async_trait]
    impl PageSink for CountingSink {
        async fn persist(&self, items: &[Value]) -> anyhow::Result<usize> {
            if self.fail {
                anyhow::bail!("simulated persistence failure");
            }
            *self.persisted.lock().unwrap() += items.len();
            Ok(items.len())
        }
    }

    fn page_of(n: usize, total: u64) -> Value {
        json!({"code": 0, "data": {"total": total, "list": vec![json!({"x": 1}); n]}})
    }

    fn quiet_loop() -> PageLoop {
        PageLoop {
            page_size: 50,
            probe_size: 20,
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn total_120_page_50_takes_three_pages_at_advancing_offsets() {
        let source = ScriptedSource::new(vec![
            Ok(page_of(20, 120)), // probe
            Ok(page_of(50, 120)),
            Ok(page_of(50, 120)),
            Ok(page_of(20, 120)),
        ]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let report = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .expect("run");

        assert_eq!(report.expected_total, 120);
        assert_eq!(report.processed, 120);
        assert_eq!(report.skipped_records, 0);
        assert_eq!(report.outcome, RunOutcome::Done);

        let seen = source.seen.lock().unwrap();
        assert_eq!(seen[0], PageCursor::Offset { offset: 0, length: 20 });
        assert_eq!(seen[1], PageCursor::Offset { offset: 0, length: 50 });
        assert_eq!(seen[2], PageCursor::Offset { offset: 50, length: 50 });
        assert_eq!(seen[3], PageCursor::Offset { offset: 100, length: 50 });
    }

    #[tokio::test]
    async fn consecutive_fetch_failures_abort_with_partial_progress() {
        let source = ScriptedSource::new(vec![
            Ok(page_of(20, 100)),
            Ok(page_of(50, 100)),
            Err(ApiError::Api("busy".into())),
            Err(ApiError::Api("busy".into())),
            Err(ApiError::Api("busy".into())),
        ]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let report = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .expect("run");

        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert_eq!(report.processed, 50);
    }

    #[tokio::test]
    async fn success_resets_the_attempt_counter() {
        // Two failures, success, two failures, success: never hits the bound.
        let source = ScriptedSource::new(vec![
            Ok(page_of(20, 100)),
            Err(ApiError::Api("busy".into())),
            Err(ApiError::Api("busy".into())),
            Ok(page_of(50, 100)),
            Err(ApiError::Api("busy".into())),
            Err(ApiError::Api("busy".into())),
            Ok(page_of(50, 100)),
        ]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let report = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .expect("run");

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.processed, 100);
    }

    #[tokio::test]
    async fn empty_page_terminates_below_the_declared_total() {
        let source = ScriptedSource::new(vec![
            Ok(page_of(20, 500)),
            Ok(page_of(50, 500)),
            Ok(page_of(0, 500)),
        ]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let report = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .expect("run");

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.processed, 50);
    }

    #[tokio::test]
    async fn persist_failure_skips_the_page_but_advances() {
        let source = ScriptedSource::new(vec![
            Ok(page_of(20, 100)),
            Ok(page_of(50, 100)),
            Ok(page_of(50, 100)),
        ]);
        let sink = CountingSink {
            fail: true,
            persisted: Mutex::new(0),
        };

        let report = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .expect("run");

        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped_records, 100);
        assert_eq!(report.skipped_pages, 2);

        let seen = source.seen.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), PageCursor::Offset { offset: 50, length: 50 });
    }

    #[tokio::test]
    async fn auth_failure_is_run_level() {
        let source = ScriptedSource::new(vec![Err(ApiError::Auth("expired".into()))]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let err = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));
    }

    #[tokio::test]
    async fn unresolved_total_is_run_level() {
        let source = ScriptedSource::new(vec![Ok(json!({"code": 0, "data": {"list": []}}))]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let err = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TotalUnavailable));
    }

    #[tokio::test]
    async fn zero_total_short_circuits() {
        let source = ScriptedSource::new(vec![Ok(page_of(0, 0))]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let report = quiet_loop()
            .run(&source, &sink, PageCursor::offset(50))
            .await
            .expect("run");
        assert_eq!(report.pages_fetched, 0);
        assert_eq!(report.outcome, RunOutcome::Done);
        assert_eq!(source.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn page_number_cursor_walks_forward() {
        let source = ScriptedSource::new(vec![
            Ok(json!({"code": 0, "total": 120, "data": vec![json!({}); 20]})),
            Ok(json!({"code": 0, "total": 120, "data": vec![json!({}); 100]})),
            Ok(json!({"code": 0, "total": 120, "data": vec![json!({}); 20]})),
        ]);
        let sink = CountingSink {
            fail: false,
            persisted: Mutex::new(0),
        };

        let mut config = quiet_loop();
        config.page_size = 100;
        let report = config
            .run(&source, &sink, PageCursor::pages(100))
            .await
            .expect("run");

        assert_eq!(report.processed, 120);
        let seen = source.seen.lock().unwrap();
        assert_eq!(seen[1], PageCursor::Page { page: 1, length: 100 });
        assert_eq!(seen[2], PageCursor::Page { page: 2, length: 100 });
    }
}
