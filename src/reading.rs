use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// The field every reading must carry, naming the station that produced it.
pub const ID_FIELD: &str = "id";

#[derive(Debug, Error)]
pub enum ReadingError {
    #[error("body is empty")]
    Empty,
    #[error("body is not a json object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("field `{0}` is not a string, number or boolean")]
    UnsupportedValue(String),
    #[error("reading has no non-empty `id` field")]
    MissingId,
    #[error("line {0} is not a `key:value` pair")]
    MalformedLine(usize),
}

/// A single observation from a content source: an ordered set of string
/// fields that always includes a non-empty `id`.
///
/// Readings are immutable once built. Field order is the order the fields were
/// received in and is kept through serialization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "IndexMap<String, Value>")]
pub struct Reading {
    fields: IndexMap<String, String>,
}

impl Reading {
    /// Parses a submission body. Scalar json values are kept in their textual
    /// form, so `{"air_temp": 13.3}` and `{"air_temp": "13.3"}` produce the
    /// same reading.
    pub fn parse(body: &[u8]) -> Result<Self, ReadingError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ReadingError::Empty);
        }
        let raw: IndexMap<String, Value> = serde_json::from_slice(body)?;
        Self::try_from(raw)
    }

    /// Serializes the reading back into the json form accepted by
    /// [`Reading::parse`].
    pub fn to_json(&self) -> Vec<u8> {
        // a map of strings to strings always serializes
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }

    /// Builds a reading from `key:value` lines, as kept on disk by content
    /// sources. Blank lines are skipped and values may themselves contain `:`.
    pub fn from_station_text(text: &str) -> Result<Self, ReadingError> {
        let mut fields = IndexMap::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or(ReadingError::MalformedLine(n + 1))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ReadingError::MalformedLine(n + 1));
            }
            fields.insert(key.to_owned(), value.trim().to_owned());
        }
        Self::from_fields(fields)
    }

    pub fn from_fields(
        fields: IndexMap<String, String>,
    ) -> Result<Self, ReadingError> {
        match fields.get(ID_FIELD) {
            Some(id) if !id.is_empty() => Ok(Self { fields }),
            _ => Err(ReadingError::MissingId),
        }
    }

    pub fn id(&self) -> &str {
        // checked at construction
        &self.fields[ID_FIELD]
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl TryFrom<IndexMap<String, Value>> for Reading {
    type Error = ReadingError;

    fn try_from(raw: IndexMap<String, Value>) -> Result<Self, Self::Error> {
        let mut fields = IndexMap::with_capacity(raw.len());
        for (key, value) in raw {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null | Value::Array(_) | Value::Object(_) => {
                    return Err(ReadingError::UnsupportedValue(key))
                }
            };
            fields.insert(key, value);
        }
        Self::from_fields(fields)
    }
}
