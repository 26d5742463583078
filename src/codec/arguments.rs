//! Typed argument lists carried in the ARGUMENTS attribute.
//!
//! # Layout
//!
//! ```text
//! +---+----+----+-----+----+------+-----------+-----------+-----
//! | N | L1 | L2 | ... | LN | mask | record 1  | record 2  | ...
//! +---+----+----+-----+----+------+-----------+-----------+-----
//! ```
//!
//! - `N`: argument count
//! - `Lj`: record payload length. Strings count value plus name bytes,
//!   everything else counts only the name.
//! - `mask`: bit `j` set when argument `j` is a string. One byte, so only the
//!   first eight arguments can be strings.
//! - Non-string record: 4-byte big-endian value, then the name.
//! - String record: `[0, vlen, 0, nlen]`, value, name.
//!
//! Values are interpreted by the type the receiver declares for each name.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LyncnatError, Result};

/// Highest argument position that can still be flagged in the string mask
pub const MAX_STRING_POSITION: usize = 7;

/// Declared argument type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    Integer,
    Float,
    String,
    Boolean,
    Timestamp,
}

impl ArgumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ArgumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArgumentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "integer" | "int" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "string" => Ok(Self::String),
            "boolean" | "bool" => Ok(Self::Boolean),
            "timestamp" => Ok(Self::Timestamp),
            _ => Err(format!("Unknown argument type: {}", s)),
        }
    }
}

/// A typed argument value.
///
/// Timestamps travel as unix seconds, so sub-second precision is lost.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    Integer(i32),
    Float(f32),
    Boolean(bool),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl ArgumentValue {
    pub fn kind(&self) -> ArgumentType {
        match self {
            Self::Integer(_) => ArgumentType::Integer,
            Self::Float(_) => ArgumentType::Float,
            Self::Boolean(_) => ArgumentType::Boolean,
            Self::String(_) => ArgumentType::String,
            Self::Timestamp(_) => ArgumentType::Timestamp,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// 4-byte wire value of a non-string argument.
    ///
    /// Timestamps outside the signed 32-bit seconds range are rejected rather
    /// than wrapped.
    fn to_word(&self) -> Result<[u8; 4]> {
        match self {
            Self::Integer(v) => Ok(v.to_be_bytes()),
            Self::Float(v) => Ok(v.to_bits().to_be_bytes()),
            Self::Boolean(v) => Ok(u32::from(*v).to_be_bytes()),
            Self::Timestamp(v) => i32::try_from(v.timestamp())
                .map(i32::to_be_bytes)
                .map_err(|_| {
                    LyncnatError::ArgumentMismatch(format!(
                        "timestamp {} does not fit in 32-bit seconds",
                        v.to_rfc3339()
                    ))
                }),
            Self::String(_) => Err(LyncnatError::ArgumentMismatch(
                "string value in a non-string record".to_string(),
            )),
        }
    }

    fn from_word(kind: ArgumentType, word: [u8; 4]) -> Result<Self> {
        let raw = i32::from_be_bytes(word);
        match kind {
            ArgumentType::Integer => Ok(Self::Integer(raw)),
            ArgumentType::Float => Ok(Self::Float(f32::from_bits(raw as u32))),
            ArgumentType::Boolean => Ok(Self::Boolean(raw == 1)),
            ArgumentType::Timestamp => DateTime::from_timestamp(i64::from(raw), 0)
                .map(Self::Timestamp)
                .ok_or_else(|| {
                    LyncnatError::ArgumentMismatch(format!("timestamp {} out of range", raw))
                }),
            ArgumentType::String => Err(LyncnatError::ArgumentMismatch(
                "string value in a non-string record".to_string(),
            )),
        }
    }
}

impl fmt::Display for ArgumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{:?}", v),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<i32> for ArgumentValue {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<f32> for ArgumentValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ArgumentValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for ArgumentValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for ArgumentValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for ArgumentValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

/// Name and declared type of one argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArgumentType,
}

impl ArgumentDef {
    pub fn new(name: impl Into<String>, kind: ArgumentType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

fn mismatch(msg: impl Into<String>) -> LyncnatError {
    LyncnatError::ArgumentMismatch(msg.into())
}

/// Encode `values` in the order given by `defs`.
pub fn encode(defs: &[ArgumentDef], values: &HashMap<String, ArgumentValue>) -> Result<Vec<u8>> {
    let count = u8::try_from(defs.len())
        .map_err(|_| mismatch(format!("{} arguments exceed the limit of 255", defs.len())))?;

    let mut header = vec![0u8; defs.len() + 2];
    header[0] = count;
    let mut mask = 0u8;
    let mut records = Vec::new();

    for (j, def) in defs.iter().enumerate() {
        let value = values
            .get(&def.name)
            .ok_or_else(|| mismatch(format!("no value for argument '{}'", def.name)))?;
        if value.kind() != def.kind {
            return Err(mismatch(format!(
                "argument '{}' is declared {} but the value is {}",
                def.name,
                def.kind,
                value.kind()
            )));
        }

        let name = def.name.as_bytes();
        let payload_len = match value {
            ArgumentValue::String(s) => {
                if j > MAX_STRING_POSITION {
                    return Err(mismatch(format!(
                        "string argument '{}' at position {} cannot be flagged in the mask",
                        def.name, j
                    )));
                }
                mask |= 1 << j;
                let len = s.len() + name.len();
                if len > usize::from(u8::MAX) {
                    return Err(mismatch(format!(
                        "argument '{}' is {} bytes, limit is 255",
                        def.name, len
                    )));
                }
                records.extend_from_slice(&[0, s.len() as u8, 0, name.len() as u8]);
                records.extend_from_slice(s.as_bytes());
                records.extend_from_slice(name);
                len
            }
            other => {
                if name.len() > usize::from(u8::MAX) {
                    return Err(mismatch(format!(
                        "argument name '{}' is longer than 255 bytes",
                        def.name
                    )));
                }
                let word = other.to_word()?;
                records.extend_from_slice(&word);
                records.extend_from_slice(name);
                name.len()
            }
        };
        header[j + 1] = payload_len as u8;
    }

    header[defs.len() + 1] = mask;
    header.extend_from_slice(&records);
    Ok(header)
}

/// Decode into a name → value map, typed by `defs`.
pub fn decode(bytes: &[u8], defs: &[ArgumentDef]) -> Result<HashMap<String, ArgumentValue>> {
    let types: HashMap<&str, ArgumentType> =
        defs.iter().map(|d| (d.name.as_str(), d.kind)).collect();

    let count = usize::from(*bytes.first().ok_or_else(|| mismatch("empty argument list"))?);
    let mut values = HashMap::with_capacity(count);

    if count > 0 {
        if bytes.len() < count + 2 {
            return Err(mismatch("argument header truncated"));
        }
        let lengths = &bytes[1..=count];
        let mask = bytes[count + 1];
        let mut offset = count + 2;

        for (j, &len) in lengths.iter().enumerate() {
            let end = offset + 4 + usize::from(len);
            let record = bytes
                .get(offset..end)
                .ok_or_else(|| mismatch(format!("argument {} truncated", j)))?;
            let is_string = j <= MAX_STRING_POSITION && (mask >> j) & 1 == 1;
            let payload = &record[4..];

            let (name, value) = if is_string {
                let vlen = usize::from(u16::from_be_bytes([record[0], record[1]]));
                if vlen > payload.len() {
                    return Err(mismatch(format!(
                        "string argument {} declares {} value bytes in a {} byte record",
                        j,
                        vlen,
                        payload.len()
                    )));
                }
                let value = std::str::from_utf8(&payload[..vlen])
                    .map_err(|_| mismatch(format!("argument {} value is not UTF-8", j)))?;
                let name = std::str::from_utf8(&payload[vlen..])
                    .map_err(|_| mismatch(format!("argument {} name is not UTF-8", j)))?;
                (name, ArgumentValue::String(value.to_string()))
            } else {
                let name = std::str::from_utf8(payload)
                    .map_err(|_| mismatch(format!("argument {} name is not UTF-8", j)))?;
                let kind = *types
                    .get(name)
                    .ok_or_else(|| mismatch(format!("unknown argument '{}'", name)))?;
                let word = [record[0], record[1], record[2], record[3]];
                (name, ArgumentValue::from_word(kind, word)?)
            };

            let declared = types
                .get(name)
                .ok_or_else(|| mismatch(format!("unknown argument '{}'", name)))?;
            if *declared != value.kind() {
                return Err(mismatch(format!(
                    "argument '{}' is declared {} but was sent as {}",
                    name,
                    declared,
                    value.kind()
                )));
            }
            if values.insert(name.to_string(), value).is_some() {
                return Err(mismatch(format!("argument '{}' appears twice", name)));
            }
            offset = end;
        }
    }

    if values.len() != defs.len() {
        return Err(mismatch(format!(
            "expected {} arguments, got {}",
            defs.len(),
            values.len()
        )));
    }
    Ok(values)
}

/// Decode and return values positionally, in `defs` order.
pub fn decode_ordered(bytes: &[u8], defs: &[ArgumentDef]) -> Result<Vec<ArgumentValue>> {
    let mut values = decode(bytes, defs)?;
    defs.iter()
        .map(|def| {
            values
                .remove(&def.name)
                .ok_or_else(|| mismatch(format!("missing argument '{}'", def.name)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bake_defs() -> Vec<ArgumentDef> {
        vec![
            ArgumentDef::new("temperature", ArgumentType::Integer),
            ArgumentDef::new("time", ArgumentType::Integer),
        ]
    }

    fn values(pairs: &[(&str, ArgumentValue)]) -> HashMap<String, ArgumentValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_bake_layout() {
        let bytes = encode(
            &bake_defs(),
            &values(&[("temperature", 200.into()), ("time", 5.into())]),
        )
        .unwrap();

        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], 11); // "temperature"
        assert_eq!(bytes[2], 4); // "time"
        assert_eq!(bytes[3], 0, "no strings");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 200]);
        assert_eq!(&bytes[8..19], b"temperature");
        assert_eq!(&bytes[19..23], &[0, 0, 0, 5]);
        assert_eq!(&bytes[23..27], b"time");

        let decoded = decode_ordered(&bytes, &bake_defs()).unwrap();
        assert_eq!(decoded, vec![ArgumentValue::Integer(200), ArgumentValue::Integer(5)]);
    }

    #[test]
    fn test_all_types_with_boundaries() {
        let defs = vec![
            ArgumentDef::new("min", ArgumentType::Integer),
            ArgumentDef::new("zero", ArgumentType::Float),
            ArgumentDef::new("yes", ArgumentType::Boolean),
            ArgumentDef::new("no", ArgumentType::Boolean),
            ArgumentDef::new("empty", ArgumentType::String),
            ArgumentDef::new("long", ArgumentType::String),
            ArgumentDef::new("at", ArgumentType::Timestamp),
        ];
        let when = DateTime::from_timestamp(1_400_000_000, 0).unwrap();
        let long = "x".repeat(64);
        let input = values(&[
            ("min", i32::MIN.into()),
            ("zero", 0.0f32.into()),
            ("yes", true.into()),
            ("no", false.into()),
            ("empty", "".into()),
            ("long", long.as_str().into()),
            ("at", when.into()),
        ]);

        let bytes = encode(&defs, &input).unwrap();
        assert_eq!(bytes[8], 0b0011_0000, "mask flags positions 4 and 5");
        assert_eq!(decode(&bytes, &defs).unwrap(), input);
    }

    #[test]
    fn test_empty_list() {
        let bytes = encode(&[], &HashMap::new()).unwrap();
        assert_eq!(bytes, vec![0, 0]);
        assert!(decode(&bytes, &[]).unwrap().is_empty());
        // Zero arguments against a definition with two is an arity mismatch
        assert!(decode(&bytes, &bake_defs()).is_err());
    }

    #[test]
    fn test_missing_value_and_wrong_type() {
        let defs = bake_defs();
        assert!(matches!(
            encode(&defs, &values(&[("temperature", 1.into())])),
            Err(LyncnatError::ArgumentMismatch(_))
        ));
        assert!(matches!(
            encode(&defs, &values(&[("temperature", 1.into()), ("time", "5".into())])),
            Err(LyncnatError::ArgumentMismatch(_))
        ));
    }

    #[test]
    fn test_string_past_mask_width_rejected() {
        let mut defs: Vec<ArgumentDef> = (0..8)
            .map(|i| ArgumentDef::new(format!("a{i}"), ArgumentType::Integer))
            .collect();
        defs.push(ArgumentDef::new("label", ArgumentType::String));
        let mut input: HashMap<String, ArgumentValue> = (0..8)
            .map(|i| (format!("a{i}"), ArgumentValue::Integer(i)))
            .collect();
        input.insert("label".into(), "x".into());
        assert!(encode(&defs, &input).is_err());
    }

    #[test]
    fn test_oversized_string_rejected() {
        let defs = vec![ArgumentDef::new("s", ArgumentType::String)];
        let input = values(&[("s", "y".repeat(255).into())]);
        assert!(encode(&defs, &input).is_err());
    }

    #[test]
    fn test_unknown_name_rejected() {
        let bytes = encode(
            &bake_defs(),
            &values(&[("temperature", 200.into()), ("time", 5.into())]),
        )
        .unwrap();
        let other = vec![
            ArgumentDef::new("temperature", ArgumentType::Integer),
            ArgumentDef::new("duration", ArgumentType::Integer),
        ];
        assert!(matches!(
            decode(&bytes, &other),
            Err(LyncnatError::ArgumentMismatch(_))
        ));
    }

    #[test]
    fn test_type_mask_disagreement_rejected() {
        let sent = vec![ArgumentDef::new("mode", ArgumentType::String)];
        let bytes = encode(&sent, &values(&[("mode", "grill".into())])).unwrap();
        let expected = vec![ArgumentDef::new("mode", ArgumentType::Integer)];
        assert!(decode(&bytes, &expected).is_err());
    }

    #[test]
    fn test_truncated_input_rejected() {
        let bytes = encode(
            &bake_defs(),
            &values(&[("temperature", 200.into()), ("time", 5.into())]),
        )
        .unwrap();
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut], &bake_defs()).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_boolean_decodes_only_one_as_true() {
        let defs = vec![ArgumentDef::new("on", ArgumentType::Boolean)];
        let mut bytes = encode(&defs, &values(&[("on", true.into())])).unwrap();
        bytes[6] = 2; // value word is bytes 3..7
        assert_eq!(
            decode(&bytes, &defs).unwrap()["on"],
            ArgumentValue::Boolean(false)
        );
    }

    #[test]
    fn test_timestamp_range_edges() {
        let defs = vec![ArgumentDef::new("at", ArgumentType::Timestamp)];
        let last = DateTime::from_timestamp(i64::from(i32::MAX), 0).unwrap();
        let bytes = encode(&defs, &values(&[("at", last.into())])).unwrap();
        assert_eq!(&bytes[3..7], &i32::MAX.to_be_bytes());
        assert_eq!(decode(&bytes, &defs).unwrap()["at"], ArgumentValue::Timestamp(last));

        let past_end = DateTime::from_timestamp(i64::from(i32::MAX) + 1, 0).unwrap();
        assert!(matches!(
            encode(&defs, &values(&[("at", past_end.into())])),
            Err(LyncnatError::ArgumentMismatch(_))
        ));
        let year_2100 = DateTime::from_timestamp(4_102_444_800, 0).unwrap();
        assert!(matches!(
            encode(&defs, &values(&[("at", year_2100.into())])),
            Err(LyncnatError::ArgumentMismatch(_))
        ));

        let before_start = DateTime::from_timestamp(i64::from(i32::MIN) - 1, 0).unwrap();
        assert!(encode(&defs, &values(&[("at", before_start.into())])).is_err());
    }

    #[test]
    fn test_repeated_name_rejected() {
        let defs = vec![
            ArgumentDef::new("a", ArgumentType::Integer),
            ArgumentDef::new("b", ArgumentType::Integer),
        ];
        // Three records "a", "a", "b": the map ends up with both declared names
        let bytes = [
            3, 1, 1, 1, 0, //
            0, 0, 0, 1, b'a', //
            0, 0, 0, 2, b'a', //
            0, 0, 0, 3, b'b',
        ];
        assert!(matches!(
            decode(&bytes, &defs),
            Err(LyncnatError::ArgumentMismatch(msg)) if msg.contains("twice")
        ));
    }

    #[test]
    fn test_argument_type_from_str() {
        assert_eq!("INTEGER".parse::<ArgumentType>().unwrap(), ArgumentType::Integer);
        assert_eq!("timestamp".parse::<ArgumentType>().unwrap(), ArgumentType::Timestamp);
        assert!("complex".parse::<ArgumentType>().is_err());
    }
}
