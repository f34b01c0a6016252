//! Typed values, their fixed-width encodings, and predicate evaluation.

use chrono::NaiveDate;
use std::cmp::Ordering;
use std::fmt;

use crate::catalog::ColMeta;
use crate::errors::{QueryError, QueryResult};
use strata::ColType;

pub const DATETIME_LEN: usize = 8;

/// A calendar value: year, month, day, hour, minute, second plus a validity
/// flag. Stored as 8 bytes with the year little-endian first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    valid: bool,
}

impl DateTime {
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        let valid = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32).is_some()
            && hour < 24
            && minute < 60
            && second < 60;
        Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
            valid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn encode(&self) -> [u8; DATETIME_LEN] {
        let y = self.year.to_le_bytes();
        [
            y[0],
            y[1],
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.valid as u8,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            year: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            month: bytes[2],
            day: bytes[3],
            hour: bytes[4],
            minute: bytes[5],
            second: bytes[6],
            valid: bytes[7] != 0,
        }
    }

    fn as_tuple(&self) -> (u16, u8, u8, u8, u8, u8) {
        (
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
        )
    }
}

impl Ord for DateTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_tuple().cmp(&other.as_tuple())
    }
}

impl PartialOrd for DateTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f64),
    Bigint(i64),
    Str(String),
    Datetime(DateTime),
}

impl Value {
    pub fn col_type(&self) -> ColType {
        match self {
            Value::Int(_) => ColType::Int,
            Value::Float(_) => ColType::Float,
            Value::Bigint(_) => ColType::Bigint,
            Value::Str(_) => ColType::Str,
            Value::Datetime(_) => ColType::Datetime,
        }
    }

    fn type_name(t: ColType) -> &'static str {
        match t {
            ColType::Int => "INT",
            ColType::Float => "FLOAT",
            ColType::Bigint => "BIGINT",
            ColType::Str => "CHAR",
            ColType::Datetime => "DATETIME",
        }
    }

    /// Widens or narrows the value towards a column's type where the dialect
    /// allows it: INT<->BIGINT, INT<->FLOAT, DATETIME->CHAR.
    pub fn coerce_to(self, target: ColType) -> Value {
        match (self, target) {
            (Value::Int(v), ColType::Bigint) => Value::Bigint(v as i64),
            (Value::Bigint(v), ColType::Int)
                if v >= i32::MIN as i64 && v <= i32::MAX as i64 =>
            {
                Value::Int(v as i32)
            }
            (Value::Int(v), ColType::Float) => Value::Float(v as f64),
            (Value::Float(v), ColType::Int) => Value::Int(v as i32),
            (Value::Datetime(v), ColType::Str) => Value::Str(v.to_string()),
            (v, _) => v,
        }
    }

    /// Encodes into exactly `len` bytes. Fixed strings are space-padded and
    /// the padding is part of the value.
    pub fn encode(&self, len: usize) -> QueryResult<Vec<u8>> {
        let bytes = match self {
            Value::Int(v) => v.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::Bigint(v) => v.to_le_bytes().to_vec(),
            Value::Datetime(v) => v.encode().to_vec(),
            Value::Str(s) => {
                if s.len() > len {
                    return Err(QueryError::IncompatibleType {
                        lhs: format!("CHAR({len})"),
                        rhs: format!("string of {} bytes", s.len()),
                    });
                }
                let mut out = s.as_bytes().to_vec();
                out.resize(len, b' ');
                out
            }
        };
        if bytes.len() != len {
            return Err(QueryError::IncompatibleType {
                lhs: format!("column of {len} bytes"),
                rhs: format!("{} value", Self::type_name(self.col_type())),
            });
        }
        Ok(bytes)
    }

    pub fn decode(col_type: ColType, bytes: &[u8]) -> Value {
        match col_type {
            ColType::Int => Value::Int(i32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            ColType::Float => Value::Float(f64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            ColType::Bigint => Value::Bigint(i64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            ColType::Str => Value::Str(String::from_utf8_lossy(bytes).into_owned()),
            ColType::Datetime => Value::Datetime(DateTime::decode(bytes)),
        }
    }

    /// Bytes sorting below every encodable value of the type, for padding
    /// unused columns of a range probe.
    pub fn min_bytes(col_type: ColType, len: usize) -> Vec<u8> {
        match col_type {
            ColType::Int => i32::MIN.to_le_bytes().to_vec(),
            ColType::Bigint => i64::MIN.to_le_bytes().to_vec(),
            // The minimum of the total order, below every NaN and infinity.
            ColType::Float => f64::from_bits(u64::MAX).to_le_bytes().to_vec(),
            ColType::Str | ColType::Datetime => vec![0u8; len],
        }
    }

    /// Bytes sorting above every encodable value of the type.
    pub fn max_bytes(col_type: ColType, len: usize) -> Vec<u8> {
        match col_type {
            ColType::Int => i32::MAX.to_le_bytes().to_vec(),
            ColType::Bigint => i64::MAX.to_le_bytes().to_vec(),
            ColType::Float => f64::from_bits(0x7FFF_FFFF_FFFF_FFFF).to_le_bytes().to_vec(),
            ColType::Str | ColType::Datetime => vec![0xFFu8; len],
        }
    }
}

/// Three-way comparison of same-typed values; mismatched types are a
/// statement error.
pub fn compare_values(lhs: &Value, rhs: &Value) -> QueryResult<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Bigint(a), Value::Bigint(b)) => Ok(a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => Ok(a.total_cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
        (Value::Datetime(a), Value::Datetime(b)) => Ok(a.cmp(b)),
        _ => Err(QueryError::IncompatibleType {
            lhs: Value::type_name(lhs.col_type()).to_string(),
            rhs: Value::type_name(rhs.col_type()).to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompOp {
    pub fn matches(self, ord: Ordering) -> bool {
        match self {
            CompOp::Eq => ord == Ordering::Equal,
            CompOp::Ne => ord != Ordering::Equal,
            CompOp::Lt => ord == Ordering::Less,
            CompOp::Gt => ord == Ordering::Greater,
            CompOp::Le => ord != Ordering::Greater,
            CompOp::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabCol {
    pub tab_name: String,
    pub col_name: String,
}

impl TabCol {
    pub fn new(tab_name: &str, col_name: &str) -> Self {
        Self {
            tab_name: tab_name.to_string(),
            col_name: col_name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CondRhs {
    Value(Value),
    Col(TabCol),
}

/// One predicate of a scan: `lhs op rhs`.
#[derive(Debug, Clone)]
pub struct Condition {
    pub lhs: TabCol,
    pub op: CompOp,
    pub rhs: CondRhs,
}

impl Condition {
    pub fn with_value(lhs: TabCol, op: CompOp, value: Value) -> Self {
        Self {
            lhs,
            op,
            rhs: CondRhs::Value(value),
        }
    }

    /// Equality against a literal, usable to drive an index prefix.
    pub fn is_index_eq(&self) -> bool {
        self.op == CompOp::Eq && matches!(self.rhs, CondRhs::Value(_))
    }
}

fn find_col<'a>(cols: &'a [ColMeta], target: &TabCol) -> QueryResult<&'a ColMeta> {
    cols.iter()
        .find(|c| c.name == target.col_name && (target.tab_name.is_empty() || c.tab_name == target.tab_name))
        .ok_or_else(|| QueryError::ColumnNotFound(target.col_name.clone()))
}

pub fn eval_cond(record: &[u8], cond: &Condition, cols: &[ColMeta]) -> QueryResult<bool> {
    let lhs_col = find_col(cols, &cond.lhs)?;
    let lhs = Value::decode(
        lhs_col.col_type,
        &record[lhs_col.offset..lhs_col.offset + lhs_col.len],
    );
    let rhs = match &cond.rhs {
        CondRhs::Value(v) => v.clone().coerce_to(lhs_col.col_type),
        CondRhs::Col(c) => {
            let rhs_col = find_col(cols, c)?;
            Value::decode(
                rhs_col.col_type,
                &record[rhs_col.offset..rhs_col.offset + rhs_col.len],
            )
        }
    };
    let rhs = match (&lhs, &rhs) {
        // A literal compared against a fixed CHAR column picks up the
        // column's space padding.
        (Value::Str(_), Value::Str(s)) => {
            let mut padded = s.clone();
            while padded.len() < lhs_col.len {
                padded.push(' ');
            }
            Value::Str(padded)
        }
        _ => rhs,
    };
    Ok(cond.op.matches(compare_values(&lhs, &rhs)?))
}

pub fn eval_conds(record: &[u8], conds: &[Condition], cols: &[ColMeta]) -> QueryResult<bool> {
    for cond in conds {
        if !eval_cond(record, cond, cols)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_validity_tracks_the_calendar() {
        assert!(DateTime::new(2024, 2, 29, 0, 0, 0).is_valid());
        assert!(!DateTime::new(2023, 2, 29, 0, 0, 0).is_valid());
        assert!(!DateTime::new(2023, 4, 31, 0, 0, 0).is_valid());
        assert!(!DateTime::new(2023, 1, 1, 24, 0, 0).is_valid());
    }

    #[test]
    fn datetime_comparison_is_three_way() {
        let a = DateTime::new(2023, 6, 1, 12, 0, 0);
        let b = DateTime::new(2023, 6, 1, 12, 0, 1);
        assert_eq!(a.cmp(&b), Ordering::Less);
        assert_eq!(b.cmp(&a), Ordering::Greater);
        assert_eq!(a.cmp(&a), Ordering::Equal);
        assert_eq!(DateTime::decode(&a.encode()), a);
    }

    #[test]
    fn strings_are_space_padded_to_the_column_width() {
        let encoded = Value::Str("bob".into()).encode(8).unwrap();
        assert_eq!(&encoded, b"bob     ");
        assert_eq!(
            Value::decode(ColType::Str, &encoded),
            Value::Str("bob     ".into())
        );
        assert!(Value::Str("overlong".into()).encode(4).is_err());
    }

    #[test]
    fn int_widens_to_bigint_and_back_when_it_fits() {
        assert_eq!(
            Value::Int(7).coerce_to(ColType::Bigint),
            Value::Bigint(7)
        );
        assert_eq!(
            Value::Bigint(7).coerce_to(ColType::Int),
            Value::Int(7)
        );
        // Out of range stays BIGINT and later fails the type check.
        assert_eq!(
            Value::Bigint(i64::MAX).coerce_to(ColType::Int),
            Value::Bigint(i64::MAX)
        );
    }

    #[test]
    fn probe_padding_brackets_every_value() {
        for (ty, len) in [
            (ColType::Int, 4),
            (ColType::Bigint, 8),
            (ColType::Str, 5),
            (ColType::Datetime, DATETIME_LEN),
        ] {
            let lo = Value::min_bytes(ty, len);
            let hi = Value::max_bytes(ty, len);
            assert_eq!(lo.len(), len);
            assert_eq!(hi.len(), len);
        }
    }
}
