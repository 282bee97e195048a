//! Stream input: raw records and the events extracted from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::{Error, Result};

/// A record as delivered by the stream transport for one shard.
#[derive(Debug, Clone)]
pub struct Record {
    pub partition_key: String,
    pub sequence_number: String,
    /// Time the transport accepted the record. Used when the payload has
    /// no event time of its own.
    pub arrival: OffsetDateTime,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(
        partition_key: impl Into<String>,
        sequence_number: impl Into<String>,
        arrival: OffsetDateTime,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            sequence_number: sequence_number.into(),
            arrival,
            data: data.into(),
        }
    }
}

/// One aggregatable observation.
#[derive(Debug, Clone, PartialEq)]
pub struct InputEvent {
    pub entity: String,
    pub event_time: OffsetDateTime,
    pub value: Option<f64>,
}

impl InputEvent {
    pub fn new(entity: impl Into<String>, event_time: OffsetDateTime) -> Self {
        Self {
            entity: entity.into(),
            event_time,
            value: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

/// Turns a raw record into zero or more events.
pub trait EventExtractor: Send + Sync {
    fn extract(&self, record: &Record) -> Result<Vec<InputEvent>>;
}

impl<F> EventExtractor for F
where
    F: Fn(&Record) -> Result<Vec<InputEvent>> + Send + Sync,
{
    fn extract(&self, record: &Record) -> Result<Vec<InputEvent>> {
        self(record)
    }
}

/// Encoding of event timestamps inside payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFormat {
    #[default]
    Rfc3339,
    EpochMillis,
    EpochSeconds,
}

impl TimeFormat {
    pub fn parse_str(&self, raw: &str) -> Result<OffsetDateTime> {
        let raw = raw.trim();
        match self {
            TimeFormat::Rfc3339 => OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|err| Error::Extract(format!("invalid timestamp '{raw}': {err}"))),
            TimeFormat::EpochMillis | TimeFormat::EpochSeconds => {
                let number: f64 = raw
                    .parse()
                    .map_err(|_| Error::Extract(format!("invalid epoch timestamp '{raw}'")))?;
                self.from_epoch(number)
            }
        }
    }

    fn parse_json(&self, value: &Value) -> Result<OffsetDateTime> {
        match value {
            Value::String(raw) => self.parse_str(raw),
            Value::Number(number) if *self != TimeFormat::Rfc3339 => {
                let number = number
                    .as_f64()
                    .ok_or_else(|| Error::Extract(format!("invalid epoch timestamp {number}")))?;
                self.from_epoch(number)
            }
            other => Err(Error::Extract(format!("unsupported timestamp value {other}"))),
        }
    }

    fn from_epoch(&self, number: f64) -> Result<OffsetDateTime> {
        let nanos_per_unit: i128 = match self {
            TimeFormat::EpochMillis => 1_000_000,
            TimeFormat::EpochSeconds => 1_000_000_000,
            TimeFormat::Rfc3339 => return Err(Error::Extract("expected rfc3339 string".into())),
        };
        let out_of_range = || Error::Extract(format!("epoch timestamp {number} out of range"));
        if !number.is_finite() {
            return Err(Error::Extract(format!("epoch timestamp {number} is not finite")));
        }
        // whole units stay exact; only the fraction goes through f64
        let whole = number.trunc();
        if whole.abs() >= i64::MAX as f64 {
            return Err(out_of_range());
        }
        let fraction = ((number - whole) * nanos_per_unit as f64).round() as i128;
        let nanos = i128::from(whole as i64)
            .checked_mul(nanos_per_unit)
            .and_then(|nanos| nanos.checked_add(fraction))
            .ok_or_else(out_of_range)?;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|err| Error::Extract(format!("timestamp out of range: {err}")))
    }
}

/// Extracts events from JSON payloads.
///
/// A payload may hold one object or an array of objects. The entity key is
/// the named fields joined with `entity_join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonExtractor {
    pub entity_fields: Vec<String>,
    #[serde(default = "default_entity_join")]
    pub entity_join: String,
    #[serde(default)]
    pub time_field: Option<String>,
    #[serde(default)]
    pub time_format: TimeFormat,
    #[serde(default)]
    pub value_field: Option<String>,
}

fn default_entity_join() -> String {
    ":".to_string()
}

impl JsonExtractor {
    pub fn new<I, S>(entity_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_fields: entity_fields.into_iter().map(Into::into).collect(),
            entity_join: default_entity_join(),
            time_field: None,
            time_format: TimeFormat::default(),
            value_field: None,
        }
    }

    pub fn time_field(mut self, field: impl Into<String>, format: TimeFormat) -> Self {
        self.time_field = Some(field.into());
        self.time_format = format;
        self
    }

    pub fn value_field(mut self, field: impl Into<String>) -> Self {
        self.value_field = Some(field.into());
        self
    }

    pub fn entity_join(mut self, join: impl Into<String>) -> Self {
        self.entity_join = join.into();
        self
    }

    fn event_from(&self, object: &Value, record: &Record) -> Result<InputEvent> {
        let Value::Object(fields) = object else {
            return Err(Error::Extract(format!(
                "record {} is not a json object",
                record.sequence_number
            )));
        };

        let mut parts = Vec::with_capacity(self.entity_fields.len());
        for name in &self.entity_fields {
            let field = fields
                .get(name)
                .ok_or_else(|| Error::Extract(format!("missing entity field '{name}'")))?;
            parts.push(scalar_to_string(field).ok_or_else(|| {
                Error::Extract(format!("entity field '{name}' is not a scalar"))
            })?);
        }

        let event_time = match self.time_field.as_deref().and_then(|name| fields.get(name)) {
            Some(raw) => self.time_format.parse_json(raw)?,
            None => record.arrival,
        };

        let value = match self.value_field.as_deref().and_then(|name| fields.get(name)) {
            None | Some(Value::Null) => None,
            Some(Value::Number(number)) => number.as_f64(),
            Some(Value::String(raw)) => Some(parse_value(raw)?),
            Some(other) => {
                return Err(Error::Extract(format!("value {other} is not numeric")));
            }
        };

        Ok(InputEvent {
            entity: parts.join(&self.entity_join),
            event_time,
            value,
        })
    }
}

impl EventExtractor for JsonExtractor {
    fn extract(&self, record: &Record) -> Result<Vec<InputEvent>> {
        let payload: Value = serde_json::from_slice(&record.data).map_err(|err| {
            Error::Extract(format!("record {}: {err}", record.sequence_number))
        })?;
        match &payload {
            Value::Array(items) => items
                .iter()
                .map(|item| self.event_from(item, record))
                .collect(),
            _ => Ok(vec![self.event_from(&payload, record)?]),
        }
    }
}

/// Numeric event value; NaN and infinities are rejected.
fn parse_value(raw: &str) -> Result<f64> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(Error::Extract(format!("value '{raw}' is not a finite number"))),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Extracts events from delimited text, one event per line.
#[cfg(feature = "csv")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvExtractor {
    pub delimiter: u8,
    pub entity_columns: Vec<usize>,
    #[serde(default = "default_entity_join")]
    pub entity_join: String,
    #[serde(default)]
    pub time_column: Option<usize>,
    #[serde(default)]
    pub time_format: TimeFormat,
    #[serde(default)]
    pub value_column: Option<usize>,
}

#[cfg(feature = "csv")]
impl CsvExtractor {
    pub fn new(delimiter: u8, entity_columns: Vec<usize>) -> Self {
        Self {
            delimiter,
            entity_columns,
            entity_join: default_entity_join(),
            time_column: None,
            time_format: TimeFormat::default(),
            value_column: None,
        }
    }

    pub fn time_column(mut self, column: usize, format: TimeFormat) -> Self {
        self.time_column = Some(column);
        self.time_format = format;
        self
    }

    pub fn value_column(mut self, column: usize) -> Self {
        self.value_column = Some(column);
        self
    }
}

#[cfg(feature = "csv")]
impl EventExtractor for CsvExtractor {
    fn extract(&self, record: &Record) -> Result<Vec<InputEvent>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(record.data.as_slice());

        let mut events = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| {
                Error::Extract(format!("record {}: {err}", record.sequence_number))
            })?;
            let column = |index: usize| {
                row.get(index)
                    .ok_or_else(|| Error::Extract(format!("missing column {index}")))
            };

            let mut parts = Vec::with_capacity(self.entity_columns.len());
            for index in &self.entity_columns {
                parts.push(column(*index)?);
            }
            let event_time = match self.time_column {
                Some(index) => self.time_format.parse_str(column(index)?)?,
                None => record.arrival,
            };
            let value = match self.value_column {
                Some(index) => Some(parse_value(column(index)?)?),
                None => None,
            };

            events.push(InputEvent {
                entity: parts.join(&self.entity_join),
                event_time,
                value,
            });
        }
        Ok(events)
    }
}
