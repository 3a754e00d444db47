use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Payload fields that carry measurements and take part in rollups.
pub const NUMERIC_FIELDS: &[&str] = &[
    "cputempf",
    "cpu",
    "memory",
    "temperature",
    "humidity",
    "pressure",
    "devicetemperature",
    "dewpoint",
    "lux",
];

const DERIVED_KEY_PREFIX: &str = "derived-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing or invalid required field `{0}`")]
    MissingKey(&'static str),
    #[error("record payload is not a JSON object")]
    NotAnObject,
}

/// One telemetry sample as accepted into the log.
///
/// Every payload field is optional: `None` means the device did not measure it
/// this cycle. `datetimestamp` is stamped by the store when the record is
/// accepted and is never read from input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub uuid: String,
    pub rowid: Option<String>,

    pub hostname: String,
    pub host: Option<String>,
    pub ipaddress: Option<String>,
    pub macaddress: Option<String>,

    pub systemtime: Option<String>,
    pub starttime: Option<String>,
    pub endtime: Option<String>,
    pub ts: i64,
    pub te: Option<String>,
    pub runtime: Option<i64>,
    pub datetimestamp: Option<DateTime<Utc>>,

    pub cputempf: Option<i64>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub diskusage: Option<String>,

    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub devicetemperature: Option<f64>,
    pub dewpoint: Option<f64>,
    pub lux: Option<f64>,
}

impl Record {
    /// Looks up one of [`NUMERIC_FIELDS`] by name.
    pub fn numeric(&self, field: &str) -> Option<f64> {
        match field {
            "cputempf" => self.cputempf.map(|v| v as f64),
            "cpu" => self.cpu,
            "memory" => self.memory,
            "temperature" => self.temperature,
            "humidity" => self.humidity,
            "pressure" => self.pressure,
            "devicetemperature" => self.devicetemperature,
            "dewpoint" => self.dewpoint,
            "lux" => self.lux,
            _ => None,
        }
    }
}

/// Coerces a semi-structured payload into a [`Record`].
///
/// Field names are matched case-insensitively. A field that cannot be coerced
/// to its type is dropped to `None`; only `hostname` and `ts` are required.
pub fn parse_record(raw: &Value) -> Result<Record, ValidationError> {
    let fields = Fields::from_value(raw)?;

    let hostname = fields
        .text("hostname")
        .ok_or(ValidationError::MissingKey("hostname"))?;
    let ts = fields
        .get("ts")
        .and_then(coerce_epoch_seconds)
        .ok_or(ValidationError::MissingKey("ts"))?;

    let rowid = fields.text("rowid");
    let uuid = fields
        .text("uuid")
        .unwrap_or_else(|| derived_dedup_key(&hostname, ts, rowid.as_deref()));

    Ok(Record {
        uuid,
        rowid,
        host: fields.text("host"),
        ipaddress: fields.text("ipaddress"),
        macaddress: fields.text("macaddress"),
        systemtime: fields.text("systemtime"),
        starttime: fields.text("starttime"),
        endtime: fields.text("endtime"),
        ts,
        te: fields.text("te"),
        runtime: fields.integer("runtime"),
        datetimestamp: None,
        cputempf: fields.integer("cputempf"),
        cpu: fields.float("cpu"),
        memory: fields.float("memory"),
        diskusage: fields.text("diskusage"),
        temperature: fields.float("temperature"),
        humidity: fields.float("humidity"),
        pressure: fields.float("pressure"),
        devicetemperature: fields.float("devicetemperature"),
        dewpoint: fields.float("dewpoint"),
        lux: fields.float("lux"),
        hostname,
    })
}

/// Splits a decoded payload into a batch: an array is a batch, an object with a
/// `records` array is a batch, any other value is a batch of one.
pub fn batch_from_value(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("records".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        other => vec![other],
    }
}

/// Decodes a raw JSON payload off the wire into a batch.
pub fn decode_batch(payload: &mut [u8]) -> Result<Vec<Value>, simd_json::Error> {
    let value: Value = simd_json::serde::from_slice(payload)?;
    Ok(batch_from_value(value))
}

/// Stable dedup key for samples that arrive without a `uuid`, so physical
/// redelivery of the same sample still collapses to one record.
pub fn derived_dedup_key(hostname: &str, ts: i64, rowid: Option<&str>) -> String {
    let payload = format!(
        "{}|{}|{}",
        hostname.trim().to_lowercase(),
        ts,
        rowid.unwrap_or("").trim()
    );
    let digest = Sha256::digest(payload.as_bytes());
    let hex = format!("{digest:x}");
    format!("{DERIVED_KEY_PREFIX}{}", &hex[..32])
}

struct Fields(Map<String, Value>);

impl Fields {
    fn from_value(raw: &Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = raw else {
            return Err(ValidationError::NotAnObject);
        };
        let normalized = map
            .iter()
            .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.clone()))
            .collect();
        Ok(Self(normalized))
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(coerce_text)
    }

    fn integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(coerce_integer)
    }

    fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(coerce_float)
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).and_then(f64_to_i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0)
                    .and_then(f64_to_i64)
            })
        }
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn coerce_epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(|f| f64_to_i64(f.floor()))),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<i64>() {
                return Some(secs);
            }
            if let Ok(secs) = s.parse::<f64>() {
                return f64_to_i64(secs.floor());
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc).timestamp())
        }
        _ => None,
    }
}

fn f64_to_i64(value: f64) -> Option<i64> {
    if value.is_finite() && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}
