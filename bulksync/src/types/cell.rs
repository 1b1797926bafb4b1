use std::error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio_postgres::Row;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use uuid::Uuid;

use crate::error::{BulkResult, ErrorKind};
use crate::{bail, bulk_error};

/// A single typed column value.
///
/// [`Cell`] is the value model flowing through the row stream adapter into the binary
/// COPY writer, and back out of statement output rows when database-generated values
/// are mapped onto source records.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Cell {
    /// Returns whether this cell holds a NULL value.
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Converts a loosely-typed JSON field into a cell, guided by the target column type.
    ///
    /// This is the read path for dynamic records: the field was resolved by name and
    /// the column's Postgres type decides how the JSON value is interpreted.
    pub fn from_json(value: &serde_json::Value, typ: &Type) -> BulkResult<Cell> {
        use serde_json::Value;

        if value.is_null() {
            return Ok(Cell::Null);
        }

        if *typ == Type::JSON || *typ == Type::JSONB {
            return Ok(Cell::Json(value.clone()));
        }

        let cell = match value {
            Value::Bool(v) if *typ == Type::BOOL => Some(Cell::Bool(*v)),
            Value::Number(v) => {
                if *typ == Type::INT2 {
                    v.as_i64().and_then(|n| i16::try_from(n).ok()).map(Cell::I16)
                } else if *typ == Type::INT4 {
                    v.as_i64().and_then(|n| i32::try_from(n).ok()).map(Cell::I32)
                } else if *typ == Type::INT8 {
                    v.as_i64().map(Cell::I64)
                } else if *typ == Type::FLOAT4 {
                    v.as_f64().map(|n| Cell::F32(n as f32))
                } else if *typ == Type::FLOAT8 {
                    v.as_f64().map(Cell::F64)
                } else {
                    None
                }
            }
            Value::String(v) => {
                if *typ == Type::TEXT || *typ == Type::VARCHAR || *typ == Type::BPCHAR {
                    Some(Cell::String(v.clone()))
                } else if *typ == Type::UUID {
                    v.parse::<Uuid>().ok().map(Cell::Uuid)
                } else if *typ == Type::DATE {
                    NaiveDate::parse_from_str(v, "%Y-%m-%d").ok().map(Cell::Date)
                } else if *typ == Type::TIME {
                    NaiveTime::parse_from_str(v, "%H:%M:%S%.f").ok().map(Cell::Time)
                } else if *typ == Type::TIMESTAMP {
                    NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f")
                        .or_else(|_| NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S%.f"))
                        .ok()
                        .map(Cell::Timestamp)
                } else if *typ == Type::TIMESTAMPTZ {
                    DateTime::parse_from_rfc3339(v)
                        .ok()
                        .map(|ts| Cell::TimestampTz(ts.with_timezone(&Utc)))
                } else {
                    None
                }
            }
            _ => None,
        };

        cell.ok_or_else(|| {
            bulk_error!(
                ErrorKind::ConversionError,
                "JSON field value does not match the column type",
                format!("value {value} is not convertible to {typ}")
            )
        })
    }

    /// Extracts the value at `idx` from an output row as a typed cell.
    ///
    /// Used when mapping database-generated values from statement output back onto
    /// source records.
    pub fn from_row(row: &Row, idx: usize) -> BulkResult<Cell> {
        let typ = row.columns()[idx].type_().clone();

        macro_rules! get {
            ($rust:ty, $variant:expr) => {
                row.try_get::<_, Option<$rust>>(idx)?
                    .map($variant)
                    .unwrap_or(Cell::Null)
            };
        }

        let cell = if typ == Type::BOOL {
            get!(bool, Cell::Bool)
        } else if typ == Type::INT2 {
            get!(i16, Cell::I16)
        } else if typ == Type::INT4 {
            get!(i32, Cell::I32)
        } else if typ == Type::INT8 {
            get!(i64, Cell::I64)
        } else if typ == Type::FLOAT4 {
            get!(f32, Cell::F32)
        } else if typ == Type::FLOAT8 {
            get!(f64, Cell::F64)
        } else if typ == Type::TEXT || typ == Type::VARCHAR || typ == Type::BPCHAR {
            get!(String, Cell::String)
        } else if typ == Type::BYTEA {
            get!(Vec<u8>, Cell::Bytes)
        } else if typ == Type::UUID {
            get!(Uuid, Cell::Uuid)
        } else if typ == Type::DATE {
            get!(NaiveDate, Cell::Date)
        } else if typ == Type::TIME {
            get!(NaiveTime, Cell::Time)
        } else if typ == Type::TIMESTAMP {
            get!(NaiveDateTime, Cell::Timestamp)
        } else if typ == Type::TIMESTAMPTZ {
            get!(DateTime<Utc>, Cell::TimestampTz)
        } else if typ == Type::JSON || typ == Type::JSONB {
            get!(serde_json::Value, Cell::Json)
        } else {
            bail!(
                ErrorKind::ConversionError,
                "Unsupported output column type",
                format!("cannot read output column of type {typ}")
            );
        };

        Ok(cell)
    }

    /// Renders the cell as a JSON value, the write-back path for dynamic records.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            Cell::Null => Value::Null,
            Cell::Bool(v) => Value::Bool(*v),
            Cell::I16(v) => Value::from(*v),
            Cell::I32(v) => Value::from(*v),
            Cell::I64(v) => Value::from(*v),
            Cell::F32(v) => Value::from(*v),
            Cell::F64(v) => Value::from(*v),
            Cell::String(v) => Value::String(v.clone()),
            Cell::Bytes(v) => Value::Array(v.iter().map(|b| Value::from(*b)).collect()),
            Cell::Uuid(v) => Value::String(v.to_string()),
            Cell::Date(v) => Value::String(v.to_string()),
            Cell::Time(v) => Value::String(v.to_string()),
            Cell::Timestamp(v) => Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Cell::TimestampTz(v) => Value::String(v.to_rfc3339()),
            Cell::Json(v) => v.clone(),
        }
    }
}

impl ToSql for Cell {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn error::Error + Sync + Send>> {
        match self {
            Cell::Null => Ok(IsNull::Yes),
            Cell::Bool(v) => v.to_sql(ty, out),
            // Integers widen to the column type so callers can stage e.g. an i32
            // into a bigint column.
            Cell::I16(v) => {
                if *ty == Type::INT4 {
                    (*v as i32).to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    (*v as i64).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Cell::I32(v) => {
                if *ty == Type::INT8 {
                    (*v as i64).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Cell::I64(v) => v.to_sql(ty, out),
            Cell::F32(v) => {
                if *ty == Type::FLOAT8 {
                    (*v as f64).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Cell::F64(v) => v.to_sql(ty, out),
            Cell::String(v) => v.to_sql(ty, out),
            Cell::Bytes(v) => v.to_sql(ty, out),
            Cell::Uuid(v) => v.to_sql(ty, out),
            Cell::Date(v) => v.to_sql(ty, out),
            Cell::Time(v) => v.to_sql(ty, out),
            Cell::Timestamp(v) => v.to_sql(ty, out),
            Cell::TimestampTz(v) => v.to_sql(ty, out),
            Cell::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<i16> for Cell {
    fn from(value: i16) -> Self {
        Cell::I16(value)
    }
}

impl From<i32> for Cell {
    fn from(value: i32) -> Self {
        Cell::I32(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::I64(value)
    }
}

impl From<f32> for Cell {
    fn from(value: f32) -> Self {
        Cell::F32(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::F64(value)
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::String(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::String(value.to_string())
    }
}

impl From<Uuid> for Cell {
    fn from(value: Uuid) -> Self {
        Cell::Uuid(value)
    }
}

impl<T> From<Option<T>> for Cell
where
    T: Into<Cell>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Cell::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_respects_column_type() {
        let value = serde_json::json!(42);

        assert_eq!(Cell::from_json(&value, &Type::INT2).unwrap(), Cell::I16(42));
        assert_eq!(Cell::from_json(&value, &Type::INT4).unwrap(), Cell::I32(42));
        assert_eq!(Cell::from_json(&value, &Type::INT8).unwrap(), Cell::I64(42));
    }

    #[test]
    fn test_from_json_null_is_null_for_any_type() {
        let value = serde_json::Value::Null;

        assert!(Cell::from_json(&value, &Type::TEXT).unwrap().is_null());
        assert!(Cell::from_json(&value, &Type::INT8).unwrap().is_null());
    }

    #[test]
    fn test_from_json_mismatched_type_fails() {
        let value = serde_json::json!("not a number");
        let err = Cell::from_json(&value, &Type::INT4).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }

    #[test]
    fn test_from_json_parses_temporal_strings() {
        let date = serde_json::json!("2024-05-17");
        assert_eq!(
            Cell::from_json(&date, &Type::DATE).unwrap(),
            Cell::Date(NaiveDate::from_ymd_opt(2024, 5, 17).unwrap())
        );

        let ts = serde_json::json!("2024-05-17T10:30:00");
        assert!(matches!(
            Cell::from_json(&ts, &Type::TIMESTAMP).unwrap(),
            Cell::Timestamp(_)
        ));
    }

    #[test]
    fn test_option_into_cell() {
        let some: Cell = Some(5i64).into();
        let none: Cell = Option::<i64>::None.into();

        assert_eq!(some, Cell::I64(5));
        assert!(none.is_null());
    }
}
