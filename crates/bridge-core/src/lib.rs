//! Core domain model for the commerce bridge: upstream record types,
//! response envelope resolution, page cursors, and content-hash keys.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CRATE_NAME: &str = "bridge-core";

/// Canonical JSON rendering: keys sorted bytewise, `,`/`:` separators, no
/// extra whitespace, non-ASCII characters preserved. Two logically equal
/// values always render to the same string, which makes this suitable as
/// hash input and as sign input.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar).unwrap_or_default());
        }
    }
}

/// Deterministic key for entities the upstream gives no stable identity:
/// lowercase hex MD5 over the canonical JSON of the identifying fields.
pub fn content_hash_key(value: &Value) -> String {
    let mut hasher = Md5::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Cursor for one paginated endpoint. Offset endpoints advance by the number
/// of items actually returned; page-number endpoints advance one page per
/// non-empty response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    Offset { offset: u64, length: u64 },
    Page { page: u64, length: u64 },
}

impl PageCursor {
    pub fn offset(length: u64) -> Self {
        Self::Offset { offset: 0, length }
    }

    pub fn pages(length: u64) -> Self {
        Self::Page { page: 1, length }
    }

    pub fn length(&self) -> u64 {
        match self {
            Self::Offset { length, .. } | Self::Page { length, .. } => *length,
        }
    }

    pub fn with_length(self, new_length: u64) -> Self {
        match self {
            Self::Offset { offset, .. } => Self::Offset {
                offset,
                length: new_length,
            },
            Self::Page { page, .. } => Self::Page {
                page,
                length: new_length,
            },
        }
    }

    /// Advance by the item count the upstream actually returned, never by
    /// the requested length. Short final pages terminate the loop correctly.
    pub fn advance(&mut self, returned: u64) {
        match self {
            Self::Offset { offset, .. } => *offset += returned,
            Self::Page { page, .. } => {
                if returned > 0 {
                    *page += 1;
                }
            }
        }
    }

    /// Write the pagination parameters into a request body.
    pub fn apply(&self, body: &mut serde_json::Map<String, Value>) {
        match self {
            Self::Offset { offset, length } => {
                body.insert("offset".into(), Value::from(*offset));
                body.insert("length".into(), Value::from(*length));
            }
            Self::Page { page, length } => {
                body.insert("page".into(), Value::from(*page));
                body.insert("length".into(), Value::from(*length));
            }
        }
    }
}

/// Parsed upstream response. Endpoints disagree on where `total` and the
/// item list live, so resolution of both is centralized here instead of
/// being re-checked at every call site.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub total: Option<Value>,
}

impl ApiEnvelope {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Success codes accepted by the upstream family of endpoints. A missing
    /// code with a non-empty data section counts as a soft success.
    pub fn is_success(&self) -> bool {
        match &self.code {
            Some(code) => {
                let code = match code {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.clone(),
                    _ => return false,
                };
                matches!(code.as_str(), "0" | "200" | "1000")
            }
            None => self
                .data
                .as_ref()
                .map(|d| !d.is_null() && d != &Value::Array(vec![]))
                .unwrap_or(false),
        }
    }

    /// Declared record count: `data.total` first, then the alternate
    /// `data.count`/`data.size` spellings, then a top-level `total`.
    pub fn resolve_total(&self) -> Option<u64> {
        let nested = self.data.as_ref().and_then(|data| {
            data.get("total")
                .or_else(|| data.get("count"))
                .or_else(|| data.get("size"))
        });
        nested.or(self.total.as_ref()).and_then(parse_count)
    }

    /// The page's item list: `data.list` when present, otherwise `data`
    /// itself when the endpoint returns the array directly.
    pub fn item_list(&self) -> Option<Vec<Value>> {
        let data = self.data.as_ref()?;
        if let Some(Value::Array(items)) = data.get("list") {
            return Some(items.clone());
        }
        if let Value::Array(items) = data {
            return Some(items.clone());
        }
        None
    }

    pub fn error_message(&self) -> String {
        self.msg.clone().unwrap_or_else(|| "unknown error".into())
    }
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Tolerant deserializers for the upstream's loosely typed payloads: ids
/// arrive as strings or numbers, amounts as numbers, numeric strings, or
/// empty strings. Missing and empty numerics decode to zero so downstream
/// arithmetic stays total-safe.
pub mod loose {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
        let value = Option::<Value>::deserialize(de)?;
        Ok(match value {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        })
    }

    pub fn f64_or_zero<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
        let value = Option::<Value>::deserialize(de)?;
        Ok(match value {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        })
    }

    pub fn i64_or_zero<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
        let value = Option::<Value>::deserialize(de)?;
        Ok(match value {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(b)) => i64::from(b),
            _ => 0,
        })
    }

    /// Lists that may arrive as a real array, a JSON-encoded string, a bare
    /// scalar, or nothing at all.
    pub fn string_list<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
        let value = Option::<Value>::deserialize(de)?;
        Ok(match value {
            Some(Value::Array(items)) => items.iter().map(scalar_to_string).collect(),
            Some(Value::String(s)) => {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&s) {
                    items.iter().map(scalar_to_string).collect()
                } else if s.is_empty() {
                    Vec::new()
                } else {
                    vec![s]
                }
            }
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![scalar_to_string(&other)],
        })
    }

    /// Objects that may arrive JSON-encoded inside a string.
    pub fn json_object<'de, D: Deserializer<'de>>(de: D) -> Result<Value, D::Error> {
        let value = Option::<Value>::deserialize(de)?;
        Ok(match value {
            Some(Value::String(s)) => {
                serde_json::from_str(&s).unwrap_or(Value::Object(Default::default()))
            }
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(other) => other,
        })
    }

    fn scalar_to_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One order as returned by the upstream order listing. The nested sections
/// fan out into separate relational entities on persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderRecord {
    #[serde(deserialize_with = "loose::string")]
    pub global_order_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub reference_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub store_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub order_from_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub delivery_type: String,
    #[serde(deserialize_with = "loose::string")]
    pub split_type: String,
    #[serde(rename = "status", deserialize_with = "loose::string")]
    pub order_status: String,
    #[serde(deserialize_with = "loose::string")]
    pub global_purchase_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub global_payment_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub global_delivery_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub amount_currency: String,
    #[serde(deserialize_with = "loose::string")]
    pub remark: String,
    #[serde(deserialize_with = "loose::string")]
    pub global_latest_ship_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub global_cancel_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub update_time: String,
    pub order_tag: Value,
    #[serde(deserialize_with = "loose::string")]
    pub wid: String,
    #[serde(deserialize_with = "loose::string")]
    pub warehouse_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub original_global_order_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub supplier_id: String,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub is_delete: i64,
    pub order_custom_fields: Value,
    #[serde(deserialize_with = "loose::string")]
    pub global_create_time: String,
    pub buyers_info: Option<BuyerInfo>,
    pub address_info: Option<AddressInfo>,
    pub item_info: Vec<OrderItem>,
    pub platform_info: Vec<PlatformRecord>,
    pub payment_info: Vec<PaymentRecord>,
    pub logistics_info: Option<LogisticsRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuyerInfo {
    #[serde(deserialize_with = "loose::string")]
    pub buyer_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub buyer_email: String,
    #[serde(deserialize_with = "loose::string")]
    pub buyer_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub buyer_note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressInfo {
    #[serde(deserialize_with = "loose::string")]
    pub receiver_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub receiver_mobile: String,
    #[serde(deserialize_with = "loose::string")]
    pub receiver_tel: String,
    #[serde(deserialize_with = "loose::string")]
    pub receiver_country_code: String,
    #[serde(deserialize_with = "loose::string")]
    pub city: String,
    #[serde(deserialize_with = "loose::string")]
    pub state_or_region: String,
    #[serde(deserialize_with = "loose::string")]
    pub address_line1: String,
    #[serde(deserialize_with = "loose::string")]
    pub address_line2: String,
    #[serde(deserialize_with = "loose::string")]
    pub district: String,
    #[serde(deserialize_with = "loose::string")]
    pub postal_code: String,
    #[serde(deserialize_with = "loose::string")]
    pub doorplate_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub company_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderItem {
    #[serde(rename = "globalItemNo", deserialize_with = "loose::string")]
    pub global_item_no: String,
    #[serde(rename = "id", deserialize_with = "loose::string")]
    pub item_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub platform_order_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub order_item_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub item_from_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub msku: String,
    #[serde(deserialize_with = "loose::string")]
    pub local_sku: String,
    #[serde(deserialize_with = "loose::string")]
    pub product_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub local_product_name: String,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub is_bundled: i64,
    #[serde(deserialize_with = "loose::string")]
    pub title: String,
    pub variant_attr: Value,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub unit_price_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub item_price_amount: f64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub quantity: i64,
    #[serde(deserialize_with = "loose::string")]
    pub remark: String,
    #[serde(deserialize_with = "loose::string")]
    pub platform_status: String,
    #[serde(rename = "type", deserialize_with = "loose::string")]
    pub item_type: String,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub stock_cost_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub shipping_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub discount_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub tax_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub sales_revenue_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub transaction_fee_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub other_amount: f64,
    #[serde(deserialize_with = "loose::string")]
    pub delivery_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub source_name: String,
    pub data_json: Value,
    pub item_custom_fields: Value,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub is_delete: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformRecord {
    #[serde(deserialize_with = "loose::string")]
    pub order_from: String,
    #[serde(deserialize_with = "loose::string")]
    pub platform_order_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub platform_order_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub platform_code: String,
    #[serde(rename = "store_Country_code", deserialize_with = "loose::string")]
    pub store_country_code: String,
    #[serde(rename = "status", deserialize_with = "loose::string")]
    pub order_status: String,
    #[serde(deserialize_with = "loose::string")]
    pub payment_status: String,
    #[serde(deserialize_with = "loose::string")]
    pub shipping_status: String,
    #[serde(deserialize_with = "loose::string")]
    pub purchase_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub payment_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub latest_ship_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub cancel_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub delivery_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentRecord {
    #[serde(deserialize_with = "loose::string")]
    pub platform_order_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub payment_method: String,
    #[serde(deserialize_with = "loose::string")]
    pub transaction_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub currency: String,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub payment_amount: f64,
    #[serde(deserialize_with = "loose::string")]
    pub payment_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticsRecord {
    #[serde(deserialize_with = "loose::string")]
    pub logistics_type_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub logistics_type_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub logistics_provider_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub logistics_provider_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub actual_carrier: String,
    #[serde(deserialize_with = "loose::string")]
    pub waybill_no: String,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub pre_weight: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub weight: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub pkg_fee_weight: f64,
    #[serde(deserialize_with = "loose::string")]
    pub weight_unit: String,
    #[serde(deserialize_with = "loose::string")]
    pub pkg_size_unit: String,
    #[serde(deserialize_with = "loose::string")]
    pub cost_currency_code: String,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub pre_cost_amount: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub cost_amount: f64,
    #[serde(deserialize_with = "loose::string")]
    pub logistics_time: String,
    #[serde(deserialize_with = "loose::string")]
    pub tracking_no: String,
    #[serde(deserialize_with = "loose::string")]
    pub mark_no: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRecord {
    #[serde(deserialize_with = "loose::string")]
    pub store_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub sid: String,
    #[serde(deserialize_with = "loose::string")]
    pub store_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub platform_code: String,
    #[serde(deserialize_with = "loose::string")]
    pub platform_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub currency: String,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub is_sync: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub status: i64,
    #[serde(deserialize_with = "loose::string")]
    pub country_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseRecord {
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub wid: i64,
    #[serde(rename = "type", deserialize_with = "loose::i64_or_zero")]
    pub warehouse_type: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub sub_type: i64,
    #[serde(deserialize_with = "loose::string")]
    pub name: String,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub is_delete: i64,
    #[serde(deserialize_with = "loose::string")]
    pub country_code: String,
    #[serde(deserialize_with = "loose::string")]
    pub wp_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub wp_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub t_warehouse_name: String,
    #[serde(deserialize_with = "loose::string")]
    pub t_warehouse_code: String,
    #[serde(deserialize_with = "loose::string")]
    pub t_country_area_name: String,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub t_status: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryRecord {
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub wid: i64,
    #[serde(deserialize_with = "loose::string")]
    pub product_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub sku: String,
    #[serde(deserialize_with = "loose::string")]
    pub seller_id: String,
    #[serde(deserialize_with = "loose::string")]
    pub fnsku: String,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub product_total: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub product_valid_num: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub product_bad_num: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub product_lock_num: i64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub stock_cost_total: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub quantity_receive: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub stock_cost: f64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub product_onway: i64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub transit_head_cost: f64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub average_age: i64,
    pub third_inventory: ThirdInventory,
    pub stock_age_list: Vec<StockAgeBucket>,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub purchase_price: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub price: f64,
    #[serde(deserialize_with = "loose::f64_or_zero")]
    pub stock_price: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThirdInventory {
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub qty_sellable: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub qty_reserved: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub qty_onway: i64,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub qty_pending: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StockAgeBucket {
    #[serde(deserialize_with = "loose::string")]
    pub name: String,
    #[serde(deserialize_with = "loose::i64_or_zero")]
    pub qty: i64,
}

/// The four stock-age columns, resolved from the upstream's named buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockAges {
    pub days_0_15: i64,
    pub days_16_30: i64,
    pub days_31_90: i64,
    pub days_above_91: i64,
}

impl InventoryRecord {
    pub fn stock_ages(&self) -> StockAges {
        let mut ages = StockAges::default();
        for bucket in &self.stock_age_list {
            match bucket.name.as_str() {
                "0-15天库龄" => ages.days_0_15 = bucket.qty,
                "16-30天库龄" => ages.days_16_30 = bucket.qty,
                "31-90天库龄" => ages.days_31_90 = bucket.qty,
                "91天以上库龄" => ages.days_above_91 = bucket.qty,
                _ => {}
            }
        }
        ages
    }
}

/// One sales-statistics row. The upstream supplies no stable identifier for
/// these, so the persisted key is a content hash over the SKU list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SalesStat {
    #[serde(deserialize_with = "loose::string_list")]
    pub sku: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub spu: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub spu_name: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub msku: Vec<String>,
    #[serde(rename = "mskuId", deserialize_with = "loose::string_list")]
    pub msku_id: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub product_name: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub sid: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub platform_code: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub platform_name: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub site_code: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub site_name: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub store_name: Vec<String>,
    #[serde(rename = "parentAsin", deserialize_with = "loose::string_list")]
    pub parent_asin: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub platform_product_id: Vec<String>,
    #[serde(deserialize_with = "loose::string_list")]
    pub platform_product_title: Vec<String>,
    #[serde(deserialize_with = "loose::string")]
    pub currency_code: String,
    #[serde(deserialize_with = "loose::json_object")]
    pub date_collect: Value,
    #[serde(rename = "volumeTotal", deserialize_with = "loose::f64_or_zero")]
    pub volume_total: f64,
}

impl SalesStat {
    /// Content-hash key over the SKU list; identical SKU sets map to the
    /// same stored row across repeated pulls.
    pub fn sales_code(&self) -> String {
        content_hash_key(&Value::Array(
            self.sku.iter().map(|s| Value::String(s.clone())).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_and_preserves_non_ascii() {
        let value = json!({"b": 1, "a": {"z": "仓库", "m": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[1,2],"z":"仓库"},"b":1}"#);
    }

    #[test]
    fn content_hash_is_order_insensitive_for_objects() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(content_hash_key(&a), content_hash_key(&b));
        assert_ne!(content_hash_key(&a), content_hash_key(&json!({"x": 1, "y": 3})));
    }

    #[test]
    fn sales_code_changes_when_a_sku_changes() {
        let stat_a: SalesStat =
            serde_json::from_value(json!({"sku": ["A-1", "B-2"]})).expect("decode");
        let stat_b: SalesStat =
            serde_json::from_value(json!({"sku": ["A-1", "B-2"]})).expect("decode");
        let stat_c: SalesStat =
            serde_json::from_value(json!({"sku": ["A-1", "B-3"]})).expect("decode");
        assert_eq!(stat_a.sales_code(), stat_b.sales_code());
        assert_ne!(stat_a.sales_code(), stat_c.sales_code());
    }

    #[test]
    fn sales_code_survives_json_encoded_sku_strings() {
        let from_array: SalesStat =
            serde_json::from_value(json!({"sku": ["A-1", "B-2"]})).expect("decode");
        let from_string: SalesStat =
            serde_json::from_value(json!({"sku": "[\"A-1\",\"B-2\"]"})).expect("decode");
        assert_eq!(from_array.sales_code(), from_string.sales_code());
    }

    #[test]
    fn offset_cursor_advances_by_returned_count() {
        let mut cursor = PageCursor::offset(50);
        cursor.advance(50);
        cursor.advance(20);
        assert_eq!(cursor, PageCursor::Offset { offset: 70, length: 50 });
    }

    #[test]
    fn page_cursor_only_advances_on_non_empty_pages() {
        let mut cursor = PageCursor::pages(100);
        cursor.advance(100);
        cursor.advance(0);
        assert_eq!(cursor, PageCursor::Page { page: 2, length: 100 });
    }

    #[test]
    fn envelope_success_codes() {
        for code in [json!(0), json!("0"), json!(200), json!("200"), json!(1000)] {
            let env = ApiEnvelope::from_value(json!({"code": code, "data": {}})).expect("parse");
            assert!(env.is_success(), "code {code} should be success");
        }
        let env = ApiEnvelope::from_value(json!({"code": 500, "msg": "boom"})).expect("parse");
        assert!(!env.is_success());
        assert_eq!(env.error_message(), "boom");
    }

    #[test]
    fn missing_code_with_data_is_soft_success() {
        let env = ApiEnvelope::from_value(json!({"data": {"list": [1]}})).expect("parse");
        assert!(env.is_success());
        let env = ApiEnvelope::from_value(json!({"msg": "nothing"})).expect("parse");
        assert!(!env.is_success());
    }

    #[test]
    fn total_resolution_checks_nested_then_top_level() {
        let nested = ApiEnvelope::from_value(json!({"data": {"total": "120"}})).expect("parse");
        assert_eq!(nested.resolve_total(), Some(120));
        let alternate = ApiEnvelope::from_value(json!({"data": {"count": 7}})).expect("parse");
        assert_eq!(alternate.resolve_total(), Some(7));
        let top = ApiEnvelope::from_value(json!({"total": 33, "data": [1, 2]})).expect("parse");
        assert_eq!(top.resolve_total(), Some(33));
        let none = ApiEnvelope::from_value(json!({"data": {}})).expect("parse");
        assert_eq!(none.resolve_total(), None);
    }

    #[test]
    fn item_list_found_under_list_or_data() {
        let under_list =
            ApiEnvelope::from_value(json!({"data": {"list": [{"a": 1}]}})).expect("parse");
        assert_eq!(under_list.item_list().map(|l| l.len()), Some(1));
        let direct = ApiEnvelope::from_value(json!({"data": [{"a": 1}, {"b": 2}]})).expect("parse");
        assert_eq!(direct.item_list().map(|l| l.len()), Some(2));
        let missing = ApiEnvelope::from_value(json!({"data": {"total": 3}})).expect("parse");
        assert!(missing.item_list().is_none());
    }

    #[test]
    fn order_decodes_with_loose_numeric_fields() {
        let order: OrderRecord = serde_json::from_value(json!({
            "global_order_no": "GO-1",
            "store_id": 42,
            "item_info": [{
                "globalItemNo": "GI-1",
                "unit_price_amount": "12.50",
                "quantity": "3",
                "tax_amount": ""
            }]
        }))
        .expect("decode");
        assert_eq!(order.store_id, "42");
        assert_eq!(order.item_info[0].global_item_no, "GI-1");
        assert_eq!(order.item_info[0].unit_price_amount, 12.5);
        assert_eq!(order.item_info[0].quantity, 3);
        assert_eq!(order.item_info[0].tax_amount, 0.0);
    }

    #[test]
    fn inventory_stock_ages_resolve_named_buckets() {
        let inv: InventoryRecord = serde_json::from_value(json!({
            "wid": 9,
            "sku": "A-1",
            "stock_age_list": [
                {"name": "0-15天库龄", "qty": 4},
                {"name": "91天以上库龄", "qty": 11},
                {"name": "unknown", "qty": 99}
            ]
        }))
        .expect("decode");
        let ages = inv.stock_ages();
        assert_eq!(ages.days_0_15, 4);
        assert_eq!(ages.days_16_30, 0);
        assert_eq!(ages.days_above_91, 11);
    }
}
