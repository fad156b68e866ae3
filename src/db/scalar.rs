use super::connectors::QueryError;

/// The single value returned by a diagnostic probe, reduced to the shapes
/// the boolean convention understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Null,
    /// A column type with no boolean reading (dates, GUIDs, XML, ...).
    Unsupported(&'static str),
}

impl ScalarValue {
    /// Coerce to a pass/fail flag.
    ///
    /// Booleans pass through, numbers are true when non-zero, and text or
    /// bytes go through [`parse_bool_text`]. Anything else is an error.
    pub fn to_bool(&self) -> Result<bool, QueryError> {
        match self {
            ScalarValue::Bool(v) => Ok(*v),
            ScalarValue::Int(v) => Ok(*v != 0),
            ScalarValue::Float(v) => Ok(*v != 0.0),
            ScalarValue::Text(s) => parse_bool_text(s),
            ScalarValue::Bytes(b) => parse_bool_text(&String::from_utf8_lossy(b)),
            ScalarValue::Null => Err(QueryError::Coercion(
                "unsupported query result type: NULL".to_string(),
            )),
            ScalarValue::Unsupported(kind) => Err(QueryError::Coercion(format!(
                "unsupported query result type: {}",
                kind
            ))),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int(v as i64)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for ScalarValue {
    fn from(v: Vec<u8>) -> Self {
        ScalarValue::Bytes(v)
    }
}

pub fn parse_bool_text(s: &str) -> Result<bool, QueryError> {
    match s.trim().to_uppercase().as_str() {
        "TRUE" | "1" | "YES" | "Y" => Ok(true),
        "FALSE" | "0" | "NO" | "N" => Ok(false),
        _ => Err(QueryError::Coercion(format!(
            "cannot parse boolean from string result: {:?}",
            s
        ))),
    }
}
