//! SQLite value decoding
//!
//! SQLite values carry their storage class, so the declared type only matters
//! for booleans stored as integers.

use super::{hex, Cell, SqliteWire, TypeCategory};

pub fn decode(category: Option<&TypeCategory>, wire: SqliteWire<'_>) -> Cell {
    let text = match wire {
        SqliteWire::Null => return Cell::Null,
        SqliteWire::Integer(value) => match category {
            Some(TypeCategory::Bool) => (value != 0).to_string(),
            _ => value.to_string(),
        },
        SqliteWire::Real(value) => real(value),
        SqliteWire::Text(text) => text.to_string(),
        SqliteWire::Blob(bytes) => hex(bytes),
    };

    Cell::Text(text)
}

/// Integral reals keep a trailing `.0` the way the sqlite shell prints them
fn real(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode as decode_builtin, WireValue};

    fn sqlite(type_name: &str, wire: SqliteWire<'_>) -> Cell {
        decode_builtin(type_name, WireValue::Sqlite(wire))
    }

    #[test]
    fn test_storage_classes() {
        assert_eq!(sqlite("INTEGER", SqliteWire::Integer(-5)), Cell::from("-5".to_string()));
        assert_eq!(sqlite("REAL", SqliteWire::Real(2.5)), Cell::from("2.5".to_string()));
        assert_eq!(sqlite("REAL", SqliteWire::Real(3.0)), Cell::from("3.0".to_string()));
        assert_eq!(sqlite("TEXT", SqliteWire::Text("hi")), Cell::from("hi".to_string()));
        assert_eq!(
            sqlite("BLOB", SqliteWire::Blob(&[0xDE, 0xAD])),
            Cell::from("dead".to_string())
        );
    }

    #[test]
    fn test_boolean_affinity() {
        assert_eq!(sqlite("BOOLEAN", SqliteWire::Integer(1)), Cell::from("true".to_string()));
        assert_eq!(sqlite("BOOLEAN", SqliteWire::Integer(0)), Cell::from("false".to_string()));
    }

    #[test]
    fn test_undeclared_type_uses_storage_class() {
        assert_eq!(sqlite("", SqliteWire::Integer(7)), Cell::from("7".to_string()));
        assert_eq!(sqlite("GEOMETRY", SqliteWire::Text("x")), Cell::from("x".to_string()));
        assert_eq!(sqlite("TEXT", SqliteWire::Null), Cell::Null);
    }

    #[test]
    fn test_empty_string_is_not_null() {
        assert_eq!(sqlite("TEXT", SqliteWire::Text("")), Cell::Text(String::new()));
    }
}
