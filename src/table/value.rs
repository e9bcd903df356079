// Typed column values.
//
// Values form a single total order so composite index keys can be compared
// and range-scanned: NULL sorts below everything, then value families in a
// fixed rank, then the natural order within a family. Cross-family
// comparisons never report equality, which keeps Ord, Eq, and Hash
// consistent for use as lock-table keys.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

/// Column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Bool,
    Float,
    Double,
    Decimal,
    Char(u32),
    VarChar(u32),
    Text,
    Blob,
    Date,
    Time,
    DateTime,
    Timestamp,
}

impl DataType {
    /// Fixed wire size, or `None` for length-prefixed types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::Bool => Some(1),
            DataType::Int16 => Some(2),
            DataType::Int32 | DataType::Float | DataType::Date => Some(4),
            DataType::Int64
            | DataType::Double
            | DataType::Time
            | DataType::DateTime
            | DataType::Timestamp => Some(8),
            DataType::Decimal => Some(17),
            DataType::Char(_) | DataType::VarChar(_) | DataType::Text | DataType::Blob => None,
        }
    }
}

/// Exact decimal: mantissa scaled by 10^-scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decimal {
    pub mantissa: i128,
    pub scale: u8,
}

impl Decimal {
    pub fn new(mantissa: i128, scale: u8) -> Self {
        Self { mantissa, scale }
    }

    fn cmp_numeric(&self, other: &Decimal) -> Ordering {
        // Align scales before comparing mantissas.
        let scale = self.scale.max(other.scale);
        let a = self.mantissa * 10i128.pow((scale - self.scale) as u32);
        let b = other.mantissa * 10i128.pow((scale - other.scale) as u32);
        a.cmp(&b)
    }

    /// Canonical form with trailing zeros stripped, for hashing.
    fn canonical(&self) -> (i128, u8) {
        let mut mantissa = self.mantissa;
        let mut scale = self.scale;
        while scale > 0 && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        (mantissa, scale)
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let divisor = 10i128.pow(self.scale as u32);
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let abs = self.mantissa.abs();
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / divisor,
            abs % divisor,
            width = self.scale as usize
        )
    }
}

/// A single typed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Timestamp(i64),
}

/// Comparison families; cross-family order follows this rank.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Family {
    Null,
    Bool,
    Int,
    Float,
    Decimal,
    String,
    Bytes,
    Date,
    Time,
    DateTime,
    Timestamp,
}

impl Value {
    fn family(&self) -> Family {
        match self {
            Value::Null => Family::Null,
            Value::Bool(_) => Family::Bool,
            Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => Family::Int,
            Value::Float(_) | Value::Double(_) => Family::Float,
            Value::Decimal(_) => Family::Decimal,
            Value::String(_) => Family::String,
            Value::Bytes(_) => Family::Bytes,
            Value::Date(_) => Family::Date,
            Value::Time(_) => Family::Time,
            Value::DateTime(_) => Family::DateTime,
            Value::Timestamp(_) => Family::Timestamp,
        }
    }

    fn as_i128(&self) -> i128 {
        match self {
            Value::Int8(v) => *v as i128,
            Value::Int16(v) => *v as i128,
            Value::Int32(v) => *v as i128,
            Value::Int64(v) => *v as i128,
            _ => 0,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Value::Float(v) => *v as f64,
            Value::Double(v) => *v,
            _ => 0.0,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Total order over values; NULL sorts low.
    pub fn compare(&self, other: &Value) -> Ordering {
        let (fa, fb) = (self.family(), other.family());
        if fa != fb {
            return fa.cmp(&fb);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (a, b) if fa == Family::Int => a.as_i128().cmp(&b.as_i128()),
            (a, b) if fa == Family::Float => a.as_f64().total_cmp(&b.as_f64()),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp_numeric(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => unreachable!("same family, mismatched variants"),
        }
    }

    /// Whether this value may be stored in a column of `data_type`.
    /// NULL passes here; nullability is checked against the column.
    pub fn matches_type(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Value::Null, _) => true,
            (Value::Int8(_), DataType::Int8)
            | (Value::Int16(_), DataType::Int16)
            | (Value::Int32(_), DataType::Int32)
            | (Value::Int64(_), DataType::Int64)
            | (Value::Bool(_), DataType::Bool)
            | (Value::Float(_), DataType::Float)
            | (Value::Double(_), DataType::Double)
            | (Value::Decimal(_), DataType::Decimal)
            | (Value::String(_), DataType::Text)
            | (Value::Bytes(_), DataType::Blob)
            | (Value::Date(_), DataType::Date)
            | (Value::Time(_), DataType::Time)
            | (Value::DateTime(_), DataType::DateTime)
            | (Value::Timestamp(_), DataType::Timestamp) => true,
            (Value::String(s), DataType::Char(n)) | (Value::String(s), DataType::VarChar(n)) => {
                s.chars().count() <= *n as usize
            }
            _ => false,
        }
    }

    /// Serializes the payload for a non-null value of `data_type`.
    pub fn encode(&self, data_type: &DataType, out: &mut Vec<u8>) -> Result<()> {
        match (self, data_type) {
            (Value::Int8(v), DataType::Int8) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Int16(v), DataType::Int16) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Int32(v), DataType::Int32) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Int64(v), DataType::Int64) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Bool(v), DataType::Bool) => out.push(*v as u8),
            (Value::Float(v), DataType::Float) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Double(v), DataType::Double) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Decimal(v), DataType::Decimal) => {
                out.extend_from_slice(&v.mantissa.to_le_bytes());
                out.push(v.scale);
            }
            (Value::String(s), DataType::Char(_))
            | (Value::String(s), DataType::VarChar(_))
            | (Value::String(s), DataType::Text) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            (Value::Bytes(b), DataType::Blob) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            (Value::Date(d), DataType::Date) => {
                let days = d
                    .signed_duration_since(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
                    .num_days() as i32;
                out.extend_from_slice(&days.to_le_bytes());
            }
            (Value::Time(t), DataType::Time) => {
                let nanos = t.signed_duration_since(NaiveTime::MIN).num_nanoseconds().unwrap_or(0)
                    as u64;
                out.extend_from_slice(&nanos.to_le_bytes());
            }
            (Value::DateTime(dt), DataType::DateTime) => {
                out.extend_from_slice(&dt.and_utc().timestamp_millis().to_le_bytes());
            }
            (Value::Timestamp(ts), DataType::Timestamp) => {
                out.extend_from_slice(&ts.to_le_bytes());
            }
            (value, data_type) => {
                return Err(DbError::Serialization(format!(
                    "value {:?} does not encode as {:?}",
                    value, data_type
                )))
            }
        }
        Ok(())
    }

    /// Reads one payload of `data_type` from `bytes` at `at`, returning the
    /// value and the bytes consumed.
    pub fn decode(data_type: &DataType, bytes: &[u8], at: usize) -> Result<(Value, usize)> {
        let need = |n: usize| -> Result<()> {
            if at + n > bytes.len() {
                Err(DbError::Corrupted(format!(
                    "row payload truncated reading {:?}",
                    data_type
                )))
            } else {
                Ok(())
            }
        };

        match data_type {
            DataType::Int8 => {
                need(1)?;
                Ok((Value::Int8(bytes[at] as i8), 1))
            }
            DataType::Int16 => {
                need(2)?;
                Ok((
                    Value::Int16(i16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())),
                    2,
                ))
            }
            DataType::Int32 => {
                need(4)?;
                Ok((
                    Value::Int32(i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())),
                    4,
                ))
            }
            DataType::Int64 => {
                need(8)?;
                Ok((
                    Value::Int64(i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())),
                    8,
                ))
            }
            DataType::Bool => {
                need(1)?;
                Ok((Value::Bool(bytes[at] != 0), 1))
            }
            DataType::Float => {
                need(4)?;
                Ok((
                    Value::Float(f32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())),
                    4,
                ))
            }
            DataType::Double => {
                need(8)?;
                Ok((
                    Value::Double(f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())),
                    8,
                ))
            }
            DataType::Decimal => {
                need(17)?;
                let mantissa = i128::from_le_bytes(bytes[at..at + 16].try_into().unwrap());
                Ok((Value::Decimal(Decimal::new(mantissa, bytes[at + 16])), 17))
            }
            DataType::Char(_) | DataType::VarChar(_) | DataType::Text => {
                need(4)?;
                let len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
                need(4 + len)?;
                let text = std::str::from_utf8(&bytes[at + 4..at + 4 + len])
                    .map_err(|e| DbError::Corrupted(format!("invalid utf-8 in row: {e}")))?;
                Ok((Value::String(text.to_string()), 4 + len))
            }
            DataType::Blob => {
                need(4)?;
                let len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
                need(4 + len)?;
                Ok((Value::Bytes(bytes[at + 4..at + 4 + len].to_vec()), 4 + len))
            }
            DataType::Date => {
                need(4)?;
                let days = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
                let date = NaiveDate::from_ymd_opt(1970, 1, 1)
                    .unwrap()
                    .checked_add_signed(chrono::Duration::days(days as i64))
                    .ok_or_else(|| DbError::Corrupted(format!("date out of range: {days}")))?;
                Ok((Value::Date(date), 4))
            }
            DataType::Time => {
                need(8)?;
                let nanos = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
                let time = NaiveTime::from_num_seconds_from_midnight_opt(
                    (nanos / 1_000_000_000) as u32,
                    (nanos % 1_000_000_000) as u32,
                )
                .ok_or_else(|| DbError::Corrupted(format!("time out of range: {nanos}")))?;
                Ok((Value::Time(time), 8))
            }
            DataType::DateTime => {
                need(8)?;
                let millis = i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
                let dt = chrono::DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| DbError::Corrupted(format!("datetime out of range: {millis}")))?
                    .naive_utc();
                Ok((Value::DateTime(dt), 8))
            }
            DataType::Timestamp => {
                need(8)?;
                Ok((
                    Value::Timestamp(i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())),
                    8,
                ))
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Families hash under a stable tag; the canonical encodings below
        // keep Hash consistent with the Eq defined by `compare`.
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => {
                2u8.hash(state);
                self.as_i128().hash(state);
            }
            Value::Float(_) | Value::Double(_) => {
                3u8.hash(state);
                let bits = {
                    let v = self.as_f64();
                    // Normalize -0.0 so it hashes like +0.0.
                    if v == 0.0 {
                        0f64.to_bits()
                    } else {
                        v.to_bits()
                    }
                };
                bits.hash(state);
            }
            Value::Decimal(d) => {
                4u8.hash(state);
                d.canonical().hash(state);
            }
            Value::String(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                6u8.hash(state);
                b.hash(state);
            }
            Value::Date(d) => {
                7u8.hash(state);
                d.hash(state);
            }
            Value::Time(t) => {
                8u8.hash(state);
                t.hash(state);
            }
            Value::DateTime(dt) => {
                9u8.hash(state);
                dt.hash(state);
            }
            Value::Timestamp(ts) => {
                10u8.hash(state);
                ts.hash(state);
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Date(v) => write!(f, "{v}"),
            Value::Time(v) => write!(f, "{v}"),
            Value::DateTime(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sorts_low() {
        assert!(Value::Null < Value::Int32(i32::MIN));
        assert!(Value::Null < Value::String(String::new()));
        assert_eq!(Value::Null, Value::Null);
    }

    #[test]
    fn test_integer_widths_compare_numerically() {
        assert_eq!(Value::Int8(5), Value::Int64(5));
        assert!(Value::Int16(-3) < Value::Int64(4));
    }

    #[test]
    fn test_decimal_scale_alignment() {
        let a = Value::Decimal(Decimal::new(150, 2)); // 1.50
        let b = Value::Decimal(Decimal::new(15, 1)); // 1.5
        assert_eq!(a, b);
        assert!(Value::Decimal(Decimal::new(149, 2)) < b);
        assert_eq!(Decimal::new(-1234, 2).to_string(), "-12.34");
    }

    #[test]
    fn test_hash_matches_equality() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(Value::Int8(9), "via-int8");
        assert_eq!(map.get(&Value::Int64(9)), Some(&"via-int8"));

        map.insert(Value::Decimal(Decimal::new(150, 2)), "dec");
        assert_eq!(map.get(&Value::Decimal(Decimal::new(15, 1))), Some(&"dec"));
    }

    #[test]
    fn test_encode_decode_all_types() {
        let cases: Vec<(DataType, Value)> = vec![
            (DataType::Int8, Value::Int8(-7)),
            (DataType::Int16, Value::Int16(1234)),
            (DataType::Int32, Value::Int32(-99999)),
            (DataType::Int64, Value::Int64(1 << 40)),
            (DataType::Bool, Value::Bool(true)),
            (DataType::Float, Value::Float(1.5)),
            (DataType::Double, Value::Double(-2.25)),
            (DataType::Decimal, Value::Decimal(Decimal::new(12345, 3))),
            (DataType::VarChar(20), Value::String("hello".into())),
            (DataType::Text, Value::String("a longer text value".into())),
            (DataType::Blob, Value::Bytes(vec![0, 1, 2, 255])),
            (
                DataType::Date,
                Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            ),
            (
                DataType::Time,
                Value::Time(NaiveTime::from_hms_opt(23, 59, 58).unwrap()),
            ),
            (
                DataType::DateTime,
                Value::DateTime(
                    NaiveDate::from_ymd_opt(2001, 9, 9)
                        .unwrap()
                        .and_hms_opt(1, 46, 40)
                        .unwrap(),
                ),
            ),
            (DataType::Timestamp, Value::Timestamp(1_700_000_000_000)),
        ];

        for (data_type, value) in cases {
            let mut buf = Vec::new();
            value.encode(&data_type, &mut buf).unwrap();
            let (decoded, consumed) = Value::decode(&data_type, &buf, 0).unwrap();
            assert_eq!(consumed, buf.len(), "{data_type:?}");
            assert_eq!(decoded, value, "{data_type:?}");
        }
    }

    #[test]
    fn test_varchar_length_check() {
        assert!(Value::String("abcde".into()).matches_type(&DataType::VarChar(5)));
        assert!(!Value::String("abcdef".into()).matches_type(&DataType::VarChar(5)));
        assert!(Value::Null.matches_type(&DataType::VarChar(5)));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut buf = Vec::new();
        assert!(Value::Int32(1).encode(&DataType::Text, &mut buf).is_err());
        assert!(!Value::Int32(1).matches_type(&DataType::Int64));
    }
}
