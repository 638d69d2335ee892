use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use simd_json::prelude::ValueAsScalar;
use simd_json::borrowed::Object;
use simd_json::{BorrowedValue, StaticNode};

const SITE_ID_FIELDS: &[&str] = &["site_id", "id_kebun"];
const TEMPERATURE_FIELDS: &[&str] = &["temperature", "suhu"];
const AIR_HUMIDITY_FIELDS: &[&str] = &["air_humidity", "kelembapan_udara"];
const SOIL_HUMIDITY_FIELDS: &[&str] = &["soil_humidity", "kelembapan_tanah"];
const LIGHT_FIELDS: &[&str] = &["light", "cahaya"];
const CO2_FIELDS: &[&str] = &["co2"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "ts"];

/// Optional sensor readings. Absent readings stay `None` and are omitted on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
}

impl Measurements {
    /// Field-level last-write-wins: readings present in `newer` replace ours, the rest survive.
    pub fn merge_from(&mut self, newer: &Measurements) {
        fn take(slot: &mut Option<f64>, candidate: Option<f64>) {
            if candidate.is_some() {
                *slot = candidate;
            }
        }
        take(&mut self.temperature, newer.temperature);
        take(&mut self.air_humidity, newer.air_humidity);
        take(&mut self.soil_humidity, newer.soil_humidity);
        take(&mut self.light, newer.light);
        take(&mut self.co2, newer.co2);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub site_id: String,
    #[serde(flatten)]
    pub measurements: Measurements,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8 JSON")]
    MalformedEncoding,
    #[error("payload has an unexpected shape ({0})")]
    MalformedStructure(&'static str),
    #[error("payload carries no site id and no default site is configured")]
    MissingSiteId,
}

impl DecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::MalformedEncoding => "malformed_encoding",
            DecodeError::MalformedStructure(_) => "malformed_structure",
            DecodeError::MissingSiteId => "missing_site_id",
        }
    }
}

/// Turns `(topic, payload)` pairs from the broker into telemetry records.
#[derive(Debug, Clone)]
pub struct Decoder {
    topic_prefix: String,
    default_site_id: Option<String>,
}

impl Decoder {
    pub fn new(topic_prefix: impl Into<String>, default_site_id: Option<String>) -> Self {
        let default_site_id = default_site_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self {
            topic_prefix: topic_prefix.into().trim_end_matches('/').to_string(),
            default_site_id,
        }
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn accepts_topic(&self, topic: &str) -> bool {
        match topic.strip_prefix(self.topic_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Returns `Ok(None)` for topics outside the configured prefix.
    pub fn decode(
        &self,
        topic: &str,
        payload: &mut [u8],
        received_at: DateTime<Utc>,
    ) -> Result<Option<TelemetryRecord>, DecodeError> {
        if !self.accepts_topic(topic) {
            return Ok(None);
        }
        if std::str::from_utf8(payload).is_err() {
            return Err(DecodeError::MalformedEncoding);
        }
        let value =
            simd_json::to_borrowed_value(payload).map_err(|_| DecodeError::MalformedEncoding)?;
        let BorrowedValue::Object(obj) = value else {
            return Err(DecodeError::MalformedStructure("payload"));
        };
        let field = |names: &[&str]| lookup(&obj, names);

        let site_id = match field(SITE_ID_FIELDS) {
            Some(value) => site_id_value(value)?,
            None => None,
        }
        .or_else(|| self.site_from_topic(topic))
        .or_else(|| self.default_site_id.clone())
        .ok_or(DecodeError::MissingSiteId)?;

        let measurements = Measurements {
            temperature: field(TEMPERATURE_FIELDS)
                .map(|v| numeric(v, "temperature"))
                .transpose()?,
            air_humidity: field(AIR_HUMIDITY_FIELDS)
                .map(|v| numeric(v, "air_humidity"))
                .transpose()?,
            soil_humidity: field(SOIL_HUMIDITY_FIELDS)
                .map(|v| numeric(v, "soil_humidity"))
                .transpose()?,
            light: field(LIGHT_FIELDS)
                .map(|v| numeric(v, "light"))
                .transpose()?,
            co2: field(CO2_FIELDS).map(|v| numeric(v, "co2")).transpose()?,
        };

        let timestamp = field(TIMESTAMP_FIELDS)
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        Ok(Some(TelemetryRecord {
            site_id,
            measurements,
            timestamp,
        }))
    }

    fn site_from_topic(&self, topic: &str) -> Option<String> {
        let rest = topic.strip_prefix(self.topic_prefix.as_str())?;
        let parts: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
        if parts.len() != 2 || parts[0] != "sensor" {
            return None;
        }
        Some(parts[1].trim())
            .filter(|site| !site.is_empty() && *site != "#" && *site != "+")
            .map(str::to_string)
    }
}

fn lookup<'o, 'v>(obj: &'o Object<'v>, names: &[&str]) -> Option<&'o BorrowedValue<'v>> {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|value| !is_null(value))
}

fn is_null(value: &BorrowedValue) -> bool {
    matches!(value, BorrowedValue::Static(StaticNode::Null))
}

fn site_id_value(value: &BorrowedValue) -> Result<Option<String>, DecodeError> {
    if let Some(raw) = value.as_str() {
        let trimmed = raw.trim();
        return Ok(Some(trimmed.to_string()).filter(|v| !v.is_empty()));
    }
    if let Some(raw) = value.as_u64() {
        return Ok(Some(raw.to_string()));
    }
    if let Some(raw) = value.as_i64() {
        return Ok(Some(raw.to_string()));
    }
    Err(DecodeError::MalformedStructure("site_id"))
}

fn numeric(value: &BorrowedValue, field: &'static str) -> Result<f64, DecodeError> {
    let parsed = value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse::<f64>().ok()));
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(DecodeError::MalformedStructure(field)),
    }
}

/// Accepts RFC 3339, naive `date[ T]time` (UTC), epoch millis (int) or epoch seconds (float).
pub fn parse_timestamp(value: &BorrowedValue) -> Option<DateTime<Utc>> {
    if let Some(raw) = value.as_str() {
        return parse_timestamp_str(raw);
    }
    if let Some(ms) = value.as_i64() {
        return millis_to_dt(ms);
    }
    if let Some(ms) = value.as_u64() {
        return i64::try_from(ms).ok().and_then(millis_to_dt);
    }
    if let Some(secs) = value.as_f64() {
        if secs.is_finite() {
            return millis_to_dt((secs * 1000.0) as i64);
        }
    }
    None
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let canonical = raw.trim().replacen(' ', "T", 1);
    if canonical.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&canonical) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&canonical, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
