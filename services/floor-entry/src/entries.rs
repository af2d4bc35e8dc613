//! Submitted floor records and their validation.
//!
//! Records can only be built through [`Entry::from_json`], which reports every
//! missing, mistyped or out-of-range field at once.

use crate::shift::ShiftInfo;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Export timestamp layout; `%.f` prints nothing when there is no fraction
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Kind of record, which fixes its collection and export layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Production,
    Packing,
    Downtime,
}

impl RecordKind {
    /// Document store collection name
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Production => "productionentry",
            RecordKind::Packing => "packingentry",
            RecordKind::Downtime => "downtimeentry",
        }
    }

    /// Suffix appended to the shift bucket to name the export sheet
    pub fn tag(&self) -> &'static str {
        match self {
            RecordKind::Production => "production",
            RecordKind::Packing => "packing",
            RecordKind::Downtime => "downtime",
        }
    }

    /// Export header row; the persisted id is always last
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Production => &[
                "operator_name",
                "operator_id",
                "operator_type",
                "test_type",
                "test_station",
                "device_type",
                "production_count",
                "timestamp",
                "shift",
                "mongo_id",
            ],
            RecordKind::Packing => &[
                "operator_name",
                "device_type",
                "operator_type",
                "job_type",
                "packing_count",
                "timestamp",
                "shift",
                "mongo_id",
            ],
            RecordKind::Downtime => &[
                "operator_name",
                "description",
                "timestamp",
                "shift",
                "mongo_id",
            ],
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Closed set of accepted spellings for an enumerated field
pub trait Literal: DeserializeOwned {
    const ALLOWED: &'static [&'static str];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorType {
    Onrole,
    Apprentices,
}

impl OperatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorType::Onrole => "Onrole",
            OperatorType::Apprentices => "Apprentices",
        }
    }
}

impl Literal for OperatorType {
    const ALLOWED: &'static [&'static str] = &["Onrole", "Apprentices"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestType {
    HV,
    FT,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::HV => "HV",
            TestType::FT => "FT",
        }
    }
}

impl Literal for TestType {
    const ALLOWED: &'static [&'static str] = &["HV", "FT"];
}

/// One rejected field, reported in the same shape FastAPI-era clients expect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FieldError {
    pub fn new(loc: &[&str], kind: &str, msg: impl Into<String>) -> Self {
        Self {
            loc: loc.iter().map(|s| s.to_string()).collect(),
            msg: msg.into(),
            kind: kind.to_string(),
        }
    }

    fn field(name: &str, kind: &str, msg: impl Into<String>) -> Self {
        Self::new(&["body", name], kind, msg)
    }
}

/// All field errors found in one submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} invalid field(s)", .0.len())]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }
}

/// A validated submission
pub trait Entry: Serialize + Send + Sync + Sized + 'static {
    const KIND: RecordKind;

    /// Validate a raw JSON body into a record
    fn from_json(value: &Value) -> Result<Self, ValidationErrors>;

    /// Wall-clock time as written, used for shift bucketing
    fn timestamp(&self) -> NaiveDateTime;

    /// Column values preceding `shift` and `mongo_id`, in header order
    fn export_values(&self) -> Vec<String>;

    /// Document body persisted to the store, with the shift attached
    fn to_document(&self, info: &ShiftInfo) -> Result<Value, serde_json::Error> {
        let mut document = serde_json::to_value(self)?;
        if let Value::Object(ref mut fields) = document {
            fields.insert("shift".to_string(), Value::from(info.shift.as_str()));
            fields.insert("bucket_id".to_string(), Value::from(info.bucket_id.clone()));
        }
        Ok(document)
    }

    /// Full export row: record values, shift label, then the persisted id
    fn export_row(&self, info: &ShiftInfo, id: &str) -> Vec<String> {
        let mut row = self.export_values();
        row.push(info.shift.as_str().to_string());
        row.push(id.to_string());
        row
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductionEntry {
    pub operator_name: String,
    pub operator_id: String,
    pub operator_type: OperatorType,
    pub test_type: TestType,
    pub test_station: String,
    pub device_type: String,
    pub production_count: u64,
    pub timestamp: SubmittedAt,
}

impl Entry for ProductionEntry {
    const KIND: RecordKind = RecordKind::Production;

    fn from_json(value: &Value) -> Result<Self, ValidationErrors> {
        let mut fields = FieldReader::new(value);
        let operator_name = fields.string("operator_name");
        let operator_id = fields.string("operator_id");
        let operator_type = fields.literal("operator_type");
        let test_type = fields.literal("test_type");
        let test_station = fields.string("test_station");
        let device_type = fields.string("device_type");
        let production_count = fields.count("production_count");
        let timestamp = fields.timestamp("timestamp");

        match (
            operator_name,
            operator_id,
            operator_type,
            test_type,
            test_station,
            device_type,
            production_count,
            timestamp,
        ) {
            (
                Some(operator_name),
                Some(operator_id),
                Some(operator_type),
                Some(test_type),
                Some(test_station),
                Some(device_type),
                Some(production_count),
                Some(timestamp),
            ) => Ok(Self {
                operator_name,
                operator_id,
                operator_type,
                test_type,
                test_station,
                device_type,
                production_count,
                timestamp,
            }),
            _ => Err(fields.into_errors()),
        }
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp.local()
    }

    fn export_values(&self) -> Vec<String> {
        vec![
            self.operator_name.clone(),
            self.operator_id.clone(),
            self.operator_type.as_str().to_string(),
            self.test_type.as_str().to_string(),
            self.test_station.clone(),
            self.device_type.clone(),
            self.production_count.to_string(),
            format_timestamp(&self.timestamp),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackingEntry {
    pub operator_name: String,
    pub device_type: String,
    pub operator_type: OperatorType,
    pub job_type: String,
    pub packing_count: u64,
    pub timestamp: SubmittedAt,
}

impl Entry for PackingEntry {
    const KIND: RecordKind = RecordKind::Packing;

    fn from_json(value: &Value) -> Result<Self, ValidationErrors> {
        let mut fields = FieldReader::new(value);
        let operator_name = fields.string("operator_name");
        let device_type = fields.string("device_type");
        let operator_type = fields.literal("operator_type");
        let job_type = fields.string("job_type");
        let packing_count = fields.count("packing_count");
        let timestamp = fields.timestamp("timestamp");

        match (
            operator_name,
            device_type,
            operator_type,
            job_type,
            packing_count,
            timestamp,
        ) {
            (
                Some(operator_name),
                Some(device_type),
                Some(operator_type),
                Some(job_type),
                Some(packing_count),
                Some(timestamp),
            ) => Ok(Self {
                operator_name,
                device_type,
                operator_type,
                job_type,
                packing_count,
                timestamp,
            }),
            _ => Err(fields.into_errors()),
        }
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp.local()
    }

    fn export_values(&self) -> Vec<String> {
        vec![
            self.operator_name.clone(),
            self.device_type.clone(),
            self.operator_type.as_str().to_string(),
            self.job_type.clone(),
            self.packing_count.to_string(),
            format_timestamp(&self.timestamp),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DowntimeEntry {
    pub operator_name: String,
    pub description: String,
    pub timestamp: SubmittedAt,
}

impl Entry for DowntimeEntry {
    const KIND: RecordKind = RecordKind::Downtime;

    fn from_json(value: &Value) -> Result<Self, ValidationErrors> {
        let mut fields = FieldReader::new(value);
        let operator_name = fields.string("operator_name");
        let description = fields.string("description");
        let timestamp = fields.timestamp("timestamp");

        match (operator_name, description, timestamp) {
            (Some(operator_name), Some(description), Some(timestamp)) => Ok(Self {
                operator_name,
                description,
                timestamp,
            }),
            _ => Err(fields.into_errors()),
        }
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp.local()
    }

    fn export_values(&self) -> Vec<String> {
        vec![
            self.operator_name.clone(),
            self.description.clone(),
            format_timestamp(&self.timestamp),
        ]
    }
}

/// Submitted date-time: the wall-clock time as written plus any explicit offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedAt {
    local: NaiveDateTime,
    offset: Option<FixedOffset>,
}

impl SubmittedAt {
    pub fn new(local: NaiveDateTime, offset: Option<FixedOffset>) -> Self {
        Self { local, offset }
    }

    pub fn local(&self) -> NaiveDateTime {
        self.local
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        self.offset
    }

    /// Epoch seconds, or milliseconds above 2e10, taken as UTC
    fn from_epoch(value: f64) -> Option<Self> {
        let millis = if value.abs() > 2e10 { value } else { value * 1000.0 };
        if !millis.is_finite() {
            return None;
        }
        let utc = DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)?;
        Some(Self::new(utc.naive_utc(), FixedOffset::east_opt(0)))
    }
}

impl fmt::Display for SubmittedAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local.format(TIMESTAMP_FORMAT))?;
        match self.offset {
            Some(offset) => write!(f, "{}", offset),
            None => Ok(()),
        }
    }
}

impl Serialize for SubmittedAt {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

pub fn format_timestamp(timestamp: &SubmittedAt) -> String {
    timestamp.to_string()
}

/// Parse a submitted date-time.
///
/// Accepts local ISO-8601 (`T` or space separated, optional fraction) and
/// RFC 3339 with an offset. The offset is kept for output; shift bucketing
/// uses the wall-clock time as written.
pub fn parse_timestamp(raw: &str) -> Option<SubmittedAt> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(SubmittedAt::new(dt.naive_local(), Some(*dt.offset())));
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
        .ok()
        .map(|local| SubmittedAt::new(local, None))
}

/// Pulls typed fields out of a JSON object, collecting errors as it goes.
///
/// Coercion is lax where older clients depend on it: counts may arrive as
/// integral floats or numeric strings, timestamps as epoch numbers.
struct FieldReader<'a> {
    object: Option<&'a Map<String, Value>>,
    errors: Vec<FieldError>,
}

impl<'a> FieldReader<'a> {
    fn new(value: &'a Value) -> Self {
        match value.as_object() {
            Some(object) => Self {
                object: Some(object),
                errors: Vec::new(),
            },
            None => Self {
                object: None,
                errors: vec![FieldError::new(
                    &["body"],
                    "model_attributes_type",
                    "Input should be a valid dictionary or object to extract fields from",
                )],
            },
        }
    }

    fn into_errors(self) -> ValidationErrors {
        ValidationErrors(self.errors)
    }

    fn present(&mut self, name: &str) -> Option<&'a Value> {
        let object = self.object?;
        match object.get(name) {
            Some(value) => Some(value),
            None => {
                self.errors
                    .push(FieldError::field(name, "missing", "Field required"));
                None
            }
        }
    }

    fn string(&mut self, name: &str) -> Option<String> {
        match self.present(name)? {
            Value::String(s) => Some(s.clone()),
            _ => {
                self.errors.push(FieldError::field(
                    name,
                    "string_type",
                    "Input should be a valid string",
                ));
                None
            }
        }
    }

    fn literal<T: Literal>(&mut self, name: &str) -> Option<T> {
        let value = self.present(name)?;
        if let Value::String(s) = value {
            if T::ALLOWED.contains(&s.as_str()) {
                if let Ok(parsed) = serde_json::from_value::<T>(value.clone()) {
                    return Some(parsed);
                }
            }
        }

        let quoted: Vec<String> = T::ALLOWED.iter().map(|v| format!("'{}'", v)).collect();
        let expected = match quoted.split_last() {
            Some((last, rest)) if !rest.is_empty() => format!("{} or {}", rest.join(", "), last),
            _ => quoted.join(""),
        };
        self.errors.push(FieldError::field(
            name,
            "literal_error",
            format!("Input should be {}", expected),
        ));
        None
    }

    fn count(&mut self, name: &str) -> Option<u64> {
        let value = self.present(name)?;
        let parsed = match value {
            Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => Ok(i128::from(i)),
                (_, Some(u), _) => Ok(i128::from(u)),
                (_, _, Some(f)) if f.fract() == 0.0 && f.abs() < 1e18 => Ok(f as i128),
                _ => Err((
                    "int_from_float",
                    "Input should be a valid integer, got a number with a fractional part",
                )),
            },
            Value::String(s) => s.trim().parse::<i128>().map_err(|_| {
                (
                    "int_parsing",
                    "Input should be a valid integer, unable to parse string as an integer",
                )
            }),
            _ => Err(("int_type", "Input should be a valid integer")),
        };

        match parsed {
            Ok(n) if n < 0 => {
                self.errors.push(FieldError::field(
                    name,
                    "greater_than_equal",
                    "Input should be greater than or equal to 0",
                ));
                None
            }
            Ok(n) => match u64::try_from(n) {
                Ok(n) => Some(n),
                Err(_) => {
                    self.errors.push(FieldError::field(
                        name,
                        "int_parsing_size",
                        "Unable to parse input string as an integer, exceeded maximum size",
                    ));
                    None
                }
            },
            Err((kind, msg)) => {
                self.errors.push(FieldError::field(name, kind, msg));
                None
            }
        }
    }

    fn timestamp(&mut self, name: &str) -> Option<SubmittedAt> {
        let parsed = match self.present(name)? {
            Value::String(raw) => parse_timestamp(raw).ok_or("datetime_parsing"),
            Value::Number(n) => n
                .as_f64()
                .and_then(SubmittedAt::from_epoch)
                .ok_or("datetime_parsing"),
            _ => Err("datetime_type"),
        };

        match parsed {
            Ok(ts) => Some(ts),
            Err(kind) => {
                self.errors.push(FieldError::field(
                    name,
                    kind,
                    "Input should be a valid datetime",
                ));
                None
            }
        }
    }
}
