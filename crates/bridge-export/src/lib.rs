//! Collaborative-table exporter: schema reconciliation, remote-key dedup,
//! and chunked record creation against a bitable-style service.
//!
//! Transmitted values are always strings; `to_export_string` is the single
//! conversion point between stored values and the wire.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bridge-export";

const MAX_REMOTE_KEYS: usize = 10_000;
const LIST_PAGE_SIZE: usize = 100;
const CREATE_CHUNK: usize = 50;
const DELETE_CHUNK: usize = 50;
const MAX_BATCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub app_id: String,
    pub app_secret: String,
    pub app_token: String,
    pub table_id: String,
    pub base_url: String,
}

impl TableConfig {
    /// Read one table's coordinates from env with a per-export prefix, e.g.
    /// `ORDERS_TABLE_APP_TOKEN` / `ORDERS_TABLE_ID` for prefix `ORDERS`.
    pub fn from_env(prefix: &str) -> anyhow::Result<Self> {
        let var = |suffix: &str| {
            let key = format!("{prefix}_TABLE_{suffix}");
            std::env::var(&key).with_context(|| format!("{key} must be set"))
        };
        Ok(Self {
            app_id: std::env::var("DOWNSTREAM_APP_ID").context("DOWNSTREAM_APP_ID must be set")?,
            app_secret: std::env::var("DOWNSTREAM_APP_SECRET")
                .context("DOWNSTREAM_APP_SECRET must be set")?,
            app_token: var("APP_TOKEN")?,
            table_id: var("ID")?,
            base_url: std::env::var("DOWNSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://open.feishu.cn".to_string()),
        })
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("downstream auth failed: {0}")]
    Auth(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("downstream rejected the call (code {code}): {message}")]
    Api { code: i64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
}

impl FieldKind {
    pub fn api_code(self) -> i64 {
        match self {
            Self::Text => 1,
            Self::Number => 2,
        }
    }

    pub fn from_api_code(code: i64) -> Self {
        if code == 2 {
            Self::Number
        } else {
            Self::Text
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: field_kind_for(name),
        }
    }
}

/// Infer a downstream field type from its column name. Timestamps stay text
/// (the upstream ships preformatted date strings), measurable quantities go
/// numeric, identifier-looking names stay text.
pub fn field_kind_for(name: &str) -> FieldKind {
    if name.ends_with("_time") {
        return FieldKind::Text;
    }

    let lower = name.to_lowercase();
    const NUMERIC: &[&str] = &[
        "amount", "weight", "price", "cost", "fee", "quantity", "number", "count", "total", "sum",
        "avg", "average", "max", "min", "rate", "ratio", "percent", "sales", "qty", "age",
    ];
    if NUMERIC.iter().any(|kw| lower.contains(kw)) {
        return FieldKind::Number;
    }

    FieldKind::Text
}

/// Convert one stored value for transmission. `None` means the field is
/// omitted from the record entirely.
pub fn to_export_string(value: &Value, kind: FieldKind) -> Option<String> {
    match (kind, value) {
        (_, Value::Null) => None,
        (FieldKind::Number, Value::Number(n)) => Some(format!("{:.2}", n.as_f64().unwrap_or(0.0))),
        // an unparsable string is omitted rather than sent as a fake zero
        (FieldKind::Number, Value::String(s)) => {
            s.trim().parse::<f64>().ok().map(|v| format!("{v:.2}"))
        }
        (FieldKind::Number, _) => None,
        (FieldKind::Text, Value::String(s)) => Some(s.clone()),
        (FieldKind::Text, other) => Some(other.to_string()),
    }
}

/// One outgoing record, field name to already-stringified value.
pub type ExportRecord = BTreeMap<String, String>;

/// Drop candidates whose business key already exists downstream. Records
/// missing the key field are dropped too; they could never be deduplicated
/// on a later run.
pub fn filter_new(
    candidates: Vec<ExportRecord>,
    existing: &HashSet<String>,
    key_field: &str,
) -> Vec<ExportRecord> {
    candidates
        .into_iter()
        .filter(|record| {
            record
                .get(key_field)
                .map(|key| !existing.contains(key))
                .unwrap_or(false)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub enum ExportMode {
    /// Skip records whose `key_field` value is already present downstream.
    Incremental { key_field: String },
    /// Delete every remote record, then insert the full candidate set.
    Replace,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_data(self) -> Result<T, ExportError> {
        if self.code != 0 {
            return Err(ExportError::Api {
                code: self.code,
                message: self.msg,
            });
        }
        self.data.ok_or(ExportError::Api {
            code: -1,
            message: "response carried no data".into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenData {
    // tenant token arrives at the top level, not under data
    tenant_access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FieldItem {
    field_id: String,
    field_name: String,
    #[serde(rename = "type")]
    field_type: i64,
}

#[derive(Debug, Deserialize, Default)]
struct FieldListData {
    #[serde(default)]
    items: Vec<FieldItem>,
}

#[derive(Debug, Deserialize)]
struct RecordItem {
    record_id: String,
    #[serde(default)]
    fields: HashMap<String, Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordListData {
    #[serde(default)]
    items: Vec<RecordItem>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize, Default)]
struct CreatedRecords {
    #[serde(default)]
    records: Vec<Value>,
}

/// Only rows the service echoes back count as created; a success response
/// without a record list confirms nothing.
fn confirmed_created(data: Option<CreatedRecords>) -> usize {
    data.map(|d| d.records.len()).unwrap_or(0)
}

/// Client for one downstream table.
#[derive(Debug)]
pub struct TableClient {
    config: TableConfig,
    http: reqwest::Client,
    /// Base unit for inter-request pacing; zeroed in tests.
    pub pace_unit: Duration,
}

impl TableClient {
    pub fn new(config: TableConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building downstream http client")?;
        Ok(Self {
            config,
            http,
            pace_unit: Duration::from_secs(1),
        })
    }

    fn table_url(&self, suffix: &str) -> String {
        format!(
            "{}/open-apis/bitable/v1/apps/{}/tables/{}{}",
            self.config.base_url, self.config.app_token, self.config.table_id, suffix
        )
    }

    pub async fn tenant_token(&self) -> Result<String, ExportError> {
        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.config.base_url
        );
        let body = json!({
            "app_id": self.config.app_id,
            "app_secret": self.config.app_secret,
        });
        let raw: Value = self.http.post(&url).json(&body).send().await?.json().await?;
        if raw.get("code").and_then(Value::as_i64) != Some(0) {
            return Err(ExportError::Auth(format!("token exchange rejected: {raw}")));
        }
        let token: TokenData =
            serde_json::from_value(raw).map_err(|e| ExportError::Auth(e.to_string()))?;
        token
            .tenant_access_token
            .ok_or_else(|| ExportError::Auth("token response carried no tenant token".into()))
    }

    async fn list_fields(&self, token: &str) -> Result<HashMap<String, (String, i64)>, ExportError> {
        let response: ApiResponse<FieldListData> = self
            .http
            .get(self.table_url("/fields"))
            .bearer_auth(token)
            .send()
            .await?
            .json()
            .await?;
        let data = response.into_data()?;
        Ok(data
            .items
            .into_iter()
            .map(|f| (f.field_name, (f.field_id, f.field_type)))
            .collect())
    }

    fn field_payload(spec: &FieldSpec) -> Value {
        match spec.kind {
            FieldKind::Text => json!({"field_name": spec.name, "type": 1}),
            FieldKind::Number => json!({
                "field_name": spec.name,
                "type": 2,
                "property": {"formatter": "0.00"},
            }),
        }
    }

    /// Reconcile the remote schema with the wanted field set: create missing
    /// fields, retype mismatched ones. A retype failure is logged and
    /// skipped; the export still runs with the remote type.
    pub async fn ensure_fields(&self, token: &str, specs: &[FieldSpec]) -> Result<(), ExportError> {
        let existing = self.list_fields(token).await?;

        for spec in specs {
            match existing.get(&spec.name) {
                None => {
                    let response: ApiResponse<Value> = self
                        .http
                        .post(self.table_url("/fields"))
                        .bearer_auth(token)
                        .json(&Self::field_payload(spec))
                        .send()
                        .await?
                        .json()
                        .await?;
                    response.into_data()?;
                    info!(field = %spec.name, "created downstream field");
                    tokio::time::sleep(self.pace_unit / 2).await;
                }
                Some((field_id, remote_type)) if *remote_type != spec.kind.api_code() => {
                    let url = self.table_url(&format!("/fields/{field_id}"));
                    let response: ApiResponse<Value> = self
                        .http
                        .put(&url)
                        .bearer_auth(token)
                        .json(&Self::field_payload(spec))
                        .send()
                        .await?
                        .json()
                        .await?;
                    if let Err(err) = response.into_data() {
                        warn!(field = %spec.name, error = %err, "field retype failed, keeping remote type");
                    }
                    tokio::time::sleep(self.pace_unit / 2).await;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn list_records(
        &self,
        token: &str,
        page_token: Option<&str>,
    ) -> Result<RecordListData, ExportError> {
        let mut request = self
            .http
            .get(self.table_url("/records"))
            .bearer_auth(token)
            .query(&[("page_size", LIST_PAGE_SIZE.to_string())]);
        if let Some(cursor) = page_token {
            request = request.query(&[("page_token", cursor)]);
        }
        let response: ApiResponse<RecordListData> = request.send().await?.json().await?;
        response.into_data()
    }

    /// Collect the business-key values already present downstream, bounded
    /// at 10 000 records.
    pub async fn list_existing_keys(
        &self,
        token: &str,
        key_field: &str,
    ) -> Result<HashSet<String>, ExportError> {
        let mut keys = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut scanned = 0usize;

        loop {
            let page = self.list_records(token, cursor.as_deref()).await?;
            scanned += page.items.len();
            for item in page.items {
                if let Some(value) = item.fields.get(key_field) {
                    keys.insert(field_value_text(value));
                }
            }
            cursor = page.page_token.filter(|t| !t.is_empty());
            if !page.has_more || cursor.is_none() || scanned >= MAX_REMOTE_KEYS {
                break;
            }
            tokio::time::sleep(self.pace_unit / 5).await;
        }

        info!(keys = keys.len(), scanned, "collected remote dedup keys");
        Ok(keys)
    }

    /// Delete every record in the table: chunked batch deletes with a
    /// single-delete fallback for a failed chunk.
    pub async fn clear_table(&self, token: &str) -> Result<usize, ExportError> {
        let mut record_ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.list_records(token, cursor.as_deref()).await?;
            record_ids.extend(page.items.into_iter().map(|r| r.record_id));
            cursor = page.page_token.filter(|t| !t.is_empty());
            if !page.has_more || cursor.is_none() {
                break;
            }
        }

        let total = record_ids.len();
        for chunk in record_ids.chunks(DELETE_CHUNK) {
            let response: ApiResponse<Value> = self
                .http
                .post(self.table_url("/records/batch_delete"))
                .bearer_auth(token)
                .json(&json!({"records": chunk}))
                .send()
                .await?
                .json()
                .await?;
            if response.into_data().is_err() {
                for record_id in chunk {
                    let url = self.table_url(&format!("/records/{record_id}"));
                    let single: ApiResponse<Value> =
                        self.http.delete(&url).bearer_auth(token).send().await?.json().await?;
                    if let Err(err) = single.into_data() {
                        warn!(record_id = %record_id, error = %err, "single-record delete failed");
                    }
                }
            }
        }

        info!(deleted = total, "cleared downstream table");
        Ok(total)
    }

    /// Create records in chunks; each chunk gets up to three attempts with
    /// increasing waits (longer for rate limiting), then is abandoned so the
    /// rest of the run can proceed.
    pub async fn batch_create(
        &self,
        token: &str,
        records: &[ExportRecord],
    ) -> Result<usize, ExportError> {
        let mut created = 0usize;

        for chunk in records.chunks(CREATE_CHUNK) {
            let payload = json!({
                "records": chunk
                    .iter()
                    .map(|record| json!({"fields": record}))
                    .collect::<Vec<_>>(),
            });

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let outcome: Result<ApiResponse<CreatedRecords>, reqwest::Error> = async {
                    self.http
                        .post(self.table_url("/records/batch_create"))
                        .bearer_auth(token)
                        .json(&payload)
                        .send()
                        .await?
                        .json()
                        .await
                }
                .await;

                match outcome {
                    Ok(response) if response.code == 0 => {
                        created += confirmed_created(response.data);
                        break;
                    }
                    Ok(response) => {
                        let rate_limited = response.msg.to_lowercase().contains("rate limit")
                            || response.msg.to_lowercase().contains("too many");
                        warn!(
                            code = response.code,
                            msg = %response.msg,
                            attempt,
                            "batch create rejected"
                        );
                        if !rate_limited || attempt >= MAX_BATCH_ATTEMPTS {
                            break;
                        }
                        tokio::time::sleep(self.pace_unit * 5 * attempt).await;
                    }
                    Err(err) => {
                        warn!(error = %err, attempt, "batch create request failed");
                        if attempt >= MAX_BATCH_ATTEMPTS {
                            break;
                        }
                        tokio::time::sleep(self.pace_unit * 3 * attempt).await;
                    }
                }
            }

            tokio::time::sleep(self.pace_unit * 2).await;
        }

        Ok(created)
    }

    /// Full export flow: token, schema reconciliation, dedup or clear, then
    /// chunked creation. Returns the downstream-confirmed created count.
    pub async fn export(
        &self,
        mode: &ExportMode,
        specs: &[FieldSpec],
        candidates: Vec<ExportRecord>,
    ) -> anyhow::Result<usize> {
        let token = self.tenant_token().await.context("acquiring tenant token")?;
        self.ensure_fields(&token, specs)
            .await
            .context("reconciling downstream fields")?;

        let outgoing = match mode {
            ExportMode::Incremental { key_field } => {
                let existing = self
                    .list_existing_keys(&token, key_field)
                    .await
                    .context("listing existing downstream keys")?;
                filter_new(candidates, &existing, key_field)
            }
            ExportMode::Replace => {
                self.clear_table(&token).await.context("clearing downstream table")?;
                candidates
            }
        };

        if outgoing.is_empty() {
            info!("nothing new to export");
            return Ok(0);
        }

        let created = self.batch_create(&token, &outgoing).await?;
        info!(created, candidates = outgoing.len(), "export finished");
        Ok(created)
    }
}

fn field_value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // text fields sometimes come back as rich-text segment arrays
        Value::Array(segments) => segments
            .iter()
            .filter_map(|seg| seg.get("text").and_then(Value::as_str))
            .collect(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, &str)]) -> ExportRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn only_echoed_records_count_as_created() {
        assert_eq!(confirmed_created(None), 0);
        assert_eq!(
            confirmed_created(Some(CreatedRecords { records: vec![] })),
            0
        );
        assert_eq!(
            confirmed_created(Some(CreatedRecords {
                records: vec![json!({"record_id": "a"}), json!({"record_id": "b"})],
            })),
            2
        );
    }

    #[test]
    fn field_kinds_follow_name_heuristics() {
        assert_eq!(field_kind_for("global_purchase_time"), FieldKind::Text);
        assert_eq!(field_kind_for("unit_price_amount"), FieldKind::Number);
        assert_eq!(field_kind_for("pkg_fee_weight"), FieldKind::Number);
        assert_eq!(field_kind_for("quantity"), FieldKind::Number);
        assert_eq!(field_kind_for("recent_7d_sales"), FieldKind::Number);
        assert_eq!(field_kind_for("global_item_no"), FieldKind::Text);
        assert_eq!(field_kind_for("store_name"), FieldKind::Text);
        // _time wins even over numeric keywords
        assert_eq!(field_kind_for("cost_time"), FieldKind::Text);
    }

    #[test]
    fn export_strings_normalize_numbers_and_drop_nulls() {
        assert_eq!(
            to_export_string(&json!(12.5), FieldKind::Number),
            Some("12.50".into())
        );
        assert_eq!(
            to_export_string(&json!("3.7"), FieldKind::Number),
            Some("3.70".into())
        );
        assert_eq!(to_export_string(&json!("USD"), FieldKind::Number), None);
        assert_eq!(
            to_export_string(&json!("GO-1"), FieldKind::Text),
            Some("GO-1".into())
        );
        assert_eq!(to_export_string(&json!(7), FieldKind::Text), Some("7".into()));
        assert_eq!(to_export_string(&Value::Null, FieldKind::Number), None);
        assert_eq!(to_export_string(&Value::Null, FieldKind::Text), None);
    }

    #[test]
    fn filter_new_drops_known_and_keyless_records() {
        let existing: HashSet<String> = ["GI-1".to_string(), "GI-3".to_string()].into();
        let candidates = vec![
            record(&[("global_item_no", "GI-1"), ("title", "known")]),
            record(&[("global_item_no", "GI-2"), ("title", "new")]),
            record(&[("title", "keyless")]),
            record(&[("global_item_no", "GI-3")]),
        ];

        let kept = filter_new(candidates, &existing, "global_item_no");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["global_item_no"], "GI-2");
    }

    #[test]
    fn filter_new_passes_everything_when_remote_is_empty() {
        let kept = filter_new(
            vec![record(&[("global_item_no", "GI-1")])],
            &HashSet::new(),
            "global_item_no",
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn rich_text_segments_flatten_to_plain_text() {
        let segments = json!([{"text": "GI-"}, {"text": "7"}]);
        assert_eq!(field_value_text(&segments), "GI-7");
        assert_eq!(field_value_text(&json!("GI-8")), "GI-8");
        assert_eq!(field_value_text(&json!(9)), "9");
    }

    #[test]
    fn named_specs_infer_their_kind() {
        let spec = FieldSpec::named("tax_amount");
        assert_eq!(spec.kind, FieldKind::Number);
        let spec = FieldSpec::named("tracking_no");
        assert_eq!(spec.kind, FieldKind::Text);
    }
}
