//! Postgres value rendering
//!
//! Values are decoded through sqlx's `Decode<Postgres>` impls and rendered
//! the way psql shows them. A lone statement runs over the extended protocol
//! and arrives in binary; scripts run over the simple protocol and arrive as
//! the server's own text, which is kept apart from a few normalizations.

use super::{hex, TypeCategory};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::types::{Oid, PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{PgValueFormat, PgValueRef};
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::types::mac_address::MacAddress;
use sqlx::types::{BigDecimal, Json, JsonRawValue, Uuid};
use sqlx::{Decode, Postgres, Type};

/// Sign words of the NUMERIC header that `BigDecimal` cannot represent
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Fractional digits of MONEY under the usual two-decimal locales
const MONEY_FRACTION_DIGITS: i64 = 2;

/// Render a non-NULL value; `None` if it does not decode as the category
pub fn decode(category: &TypeCategory, value: PgValueRef<'_>) -> Option<String> {
    match value.format() {
        PgValueFormat::Text => text(category, value.as_str().ok()?),
        PgValueFormat::Binary => binary(category, value),
    }
}

fn value_of<'r, T: Decode<'r, Postgres>>(value: PgValueRef<'r>) -> Option<T> {
    T::decode(value).ok()
}

fn text(category: &TypeCategory, text: &str) -> Option<String> {
    let rendered = match category {
        TypeCategory::Bool => match text {
            "t" => "true".to_string(),
            "f" => "false".to_string(),
            other => other.to_string(),
        },
        TypeCategory::TimestampTz => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(|value| value.to_rfc3339())
            .unwrap_or_else(|_| text.to_string()),
        TypeCategory::Timestamp => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map(format_timestamp)
            .unwrap_or_else(|_| text.to_string()),
        TypeCategory::Binary => text.strip_prefix("\\x").unwrap_or(text).to_string(),
        TypeCategory::Money => money_from_text(text),
        _ => text.to_string(),
    };

    Some(rendered)
}

fn binary(category: &TypeCategory, value: PgValueRef<'_>) -> Option<String> {
    let rendered = match category {
        TypeCategory::Bool => value_of::<bool>(value)?.to_string(),
        TypeCategory::Int2 => value_of::<i16>(value)?.to_string(),
        TypeCategory::Int4 => value_of::<i32>(value)?.to_string(),
        TypeCategory::Int8 => value_of::<i64>(value)?.to_string(),
        TypeCategory::Oid => value_of::<Oid>(value)?.0.to_string(),
        TypeCategory::Float4 => {
            let float = value_of::<f32>(value)?;
            float_text(f64::from(float)).unwrap_or_else(|| float.to_string())
        }
        TypeCategory::Float8 => {
            let float = value_of::<f64>(value)?;
            float_text(float).unwrap_or_else(|| float.to_string())
        }
        TypeCategory::Numeric => numeric(value)?,
        TypeCategory::Money => money(value_of(value)?),
        TypeCategory::Timestamp => match infinite_i64(value.clone())? {
            Some(infinity) => infinity,
            None => format_timestamp(value_of::<NaiveDateTime>(value)?),
        },
        TypeCategory::TimestampTz => match infinite_i64(value.clone())? {
            Some(infinity) => infinity,
            None => value_of::<DateTime<Utc>>(value)?.to_rfc3339(),
        },
        TypeCategory::Date => match infinite_i32(value.clone())? {
            Some(infinity) => infinity,
            None => value_of::<NaiveDate>(value)?.format("%Y-%m-%d").to_string(),
        },
        TypeCategory::Time => {
            // 24:00:00 is a valid TIME that chrono cannot hold
            if value_of::<i64>(value.clone())? == MICROS_PER_DAY {
                "24:00:00".to_string()
            } else {
                format_time(value_of::<NaiveTime>(value)?)
            }
        }
        TypeCategory::TimeTz => {
            let time_tz = value_of::<PgTimeTz<NaiveTime, FixedOffset>>(value)?;
            format!("{}{}", format_time(time_tz.time), time_tz.offset)
        }
        TypeCategory::Interval => interval(&value_of::<PgInterval>(value)?),
        TypeCategory::Binary => hex(value_of::<&[u8]>(value)?),
        TypeCategory::Inet => network(value_of(value)?, false),
        TypeCategory::Cidr => network(value_of(value)?, true),
        TypeCategory::MacAddr => mac(value_of(value)?),
        // No sqlx type for the EUI-64 form
        TypeCategory::MacAddr8 => match value_of::<&[u8]>(value)? {
            bytes if bytes.len() == 8 => colon_hex(bytes),
            _ => return None,
        },
        TypeCategory::Uuid => value_of::<Uuid>(value)?.to_string(),
        TypeCategory::Json | TypeCategory::Jsonb => json(value_of(value)?),
        TypeCategory::Text | TypeCategory::Enum => value_of::<&str>(value)?.to_string(),
        TypeCategory::Array(element) => array(element, value)?,
        TypeCategory::Domain(_) => return None,
    };

    Some(rendered)
}

/// `Some(Some(_))` for the infinities, `Some(None)` for a value chrono can hold
fn infinite_i64(value: PgValueRef<'_>) -> Option<Option<String>> {
    match value_of::<i64>(value)? {
        i64::MAX => Some(Some("infinity".to_string())),
        i64::MIN => Some(Some("-infinity".to_string())),
        micros => timestamp_in_range(micros).then_some(None),
    }
}

fn infinite_i32(value: PgValueRef<'_>) -> Option<Option<String>> {
    match value_of::<i32>(value)? {
        i32::MAX => Some(Some("infinity".to_string())),
        i32::MIN => Some(Some("-infinity".to_string())),
        days => date_in_range(days).then_some(None),
    }
}

fn pg_epoch() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(2000, 1, 1)?.and_hms_opt(0, 0, 0)
}

/// sqlx adds the offset to the epoch unchecked, so out-of-range values must
/// never reach it
fn timestamp_in_range(micros: i64) -> bool {
    pg_epoch()
        .and_then(|epoch| epoch.checked_add_signed(Duration::microseconds(micros)))
        .is_some()
}

fn date_in_range(days: i32) -> bool {
    pg_epoch()
        .and_then(|epoch| epoch.date().checked_add_signed(Duration::days(i64::from(days))))
        .is_some()
}

fn format_timestamp(value: NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

fn format_time(value: NaiveTime) -> String {
    value.format("%H:%M:%S%.f").to_string()
}

fn float_text(value: f64) -> Option<String> {
    if value.is_nan() {
        Some("NaN".to_string())
    } else if value == f64::INFINITY {
        Some("Infinity".to_string())
    } else if value == f64::NEG_INFINITY {
        Some("-Infinity".to_string())
    } else {
        None
    }
}

fn numeric(value: PgValueRef<'_>) -> Option<String> {
    // Header: ndigits, weight, sign, dscale
    let header = value.as_bytes().ok()?.get(..8)?;
    let sign = u16::from_be_bytes([header[4], header[5]]);
    let display_scale = u16::from_be_bytes([header[6], header[7]]);

    match sign {
        NUMERIC_NAN => Some("NaN".to_string()),
        NUMERIC_PINF => Some("Infinity".to_string()),
        NUMERIC_NINF => Some("-Infinity".to_string()),
        _ => Some(plain_decimal(value_of(value)?, display_scale)),
    }
}

/// Exact decimal text at the column's display scale
///
/// sqlx derives the scale from the digit groups, so `42.00` would come back
/// as `42`; the header's display scale restores the trailing zeros.
fn plain_decimal(decimal: BigDecimal, display_scale: u16) -> String {
    decimal
        .with_scale(i64::from(display_scale))
        .to_plain_string()
}

fn money(money: PgMoney) -> String {
    money.to_bigdecimal(MONEY_FRACTION_DIGITS).to_plain_string()
}

/// Strip currency symbols and grouping from the locale-formatted text output
fn money_from_text(text: &str) -> String {
    let negative = text.contains('-') || (text.starts_with('(') && text.ends_with(')'));
    let digits: String = text
        .chars()
        .filter(|character| character.is_ascii_digit() || *character == '.')
        .collect();

    if digits.is_empty() {
        text.to_string()
    } else if negative {
        format!("-{digits}")
    } else {
        digits
    }
}

fn interval(interval: &PgInterval) -> String {
    fn unit(parts: &mut Vec<String>, value: i64, singular: &str, plural: &str) {
        if value != 0 {
            let label = if value.abs() == 1 { singular } else { plural };
            parts.push(format!("{value} {label}"));
        }
    }

    let mut parts = Vec::new();
    unit(&mut parts, i64::from(interval.months / 12), "year", "years");
    unit(&mut parts, i64::from(interval.months % 12), "mon", "mons");
    unit(&mut parts, i64::from(interval.days), "day", "days");

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let seconds = total / 1_000_000;
        let fraction = total % 1_000_000;
        let mut clock = format!(
            "{sign}{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        );
        if fraction != 0 {
            let digits = format!("{fraction:06}");
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }

    parts.join(" ")
}

/// INET hides a full-length prefix; CIDR always shows it
fn network(network: IpNetwork, always_prefix: bool) -> String {
    let host_prefix = if network.is_ipv4() { 32 } else { 128 };

    if always_prefix || network.prefix() != host_prefix {
        network.to_string()
    } else {
        network.ip().to_string()
    }
}

fn mac(address: MacAddress) -> String {
    colon_hex(&address.bytes())
}

fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The document exactly as stored, without re-serializing
fn json(document: Json<Box<JsonRawValue>>) -> String {
    document.0.get().to_string()
}

/// One-dimensional arrays of the supported element categories
///
/// sqlx resolves the element type from its OID, so arrays of enums and
/// multi-dimensional arrays fail to decode and render as the type name.
fn array(element: &TypeCategory, value: PgValueRef<'_>) -> Option<String> {
    match element {
        TypeCategory::Bool => elements(value, |item: bool| Some(item.to_string())),
        TypeCategory::Int2 => elements(value, |item: i16| Some(item.to_string())),
        TypeCategory::Int4 => elements(value, |item: i32| Some(item.to_string())),
        TypeCategory::Int8 => elements(value, |item: i64| Some(item.to_string())),
        TypeCategory::Oid => elements(value, |item: Oid| Some(item.0.to_string())),
        TypeCategory::Float4 => elements(value, |item: f32| {
            Some(float_text(f64::from(item)).unwrap_or_else(|| item.to_string()))
        }),
        TypeCategory::Float8 => elements(value, |item: f64| {
            Some(float_text(item).unwrap_or_else(|| item.to_string()))
        }),
        TypeCategory::Numeric => elements(value, |item: BigDecimal| Some(item.to_plain_string())),
        TypeCategory::Money => elements(value, |item: PgMoney| Some(money(item))),
        TypeCategory::Timestamp => {
            finite_timestamps(value.clone())?;
            elements(value, |item: NaiveDateTime| Some(format_timestamp(item)))
        }
        TypeCategory::TimestampTz => {
            finite_timestamps(value.clone())?;
            elements(value, |item: DateTime<Utc>| Some(item.to_rfc3339()))
        }
        TypeCategory::Date => {
            let days = value_of::<Vec<Option<i32>>>(value.clone())?;
            days.into_iter().flatten().all(date_in_range).then_some(())?;
            elements(value, |item: NaiveDate| Some(item.format("%Y-%m-%d").to_string()))
        }
        TypeCategory::Interval => elements(value, |item: PgInterval| Some(interval(&item))),
        TypeCategory::Binary => elements(value, |item: Vec<u8>| Some(hex(&item))),
        TypeCategory::Inet => elements(value, |item: IpNetwork| Some(network(item, false))),
        TypeCategory::Cidr => elements(value, |item: IpNetwork| Some(network(item, true))),
        TypeCategory::MacAddr => elements(value, |item: MacAddress| Some(mac(item))),
        TypeCategory::Uuid => elements(value, |item: Uuid| Some(item.to_string())),
        TypeCategory::Json | TypeCategory::Jsonb => {
            elements(value, |item: Json<Box<JsonRawValue>>| Some(json(item)))
        }
        TypeCategory::Text => elements(value, |item: String| Some(item)),
        _ => None,
    }
}

/// Infinite or out-of-range elements would make sqlx's conversion overflow
fn finite_timestamps(value: PgValueRef<'_>) -> Option<()> {
    value_of::<Vec<Option<i64>>>(value)?
        .into_iter()
        .flatten()
        .all(timestamp_in_range)
        .then_some(())
}

fn elements<T>(value: PgValueRef<'_>, render: impl Fn(T) -> Option<String>) -> Option<String>
where
    T: for<'a> Decode<'a, Postgres> + Type<Postgres>,
{
    let rendered = value_of::<Vec<Option<T>>>(value)?
        .into_iter()
        .map(|item| match item {
            Some(item) => render(item).map(|text| quote_array_element(&text)),
            None => Some("NULL".to_string()),
        })
        .collect::<Option<Vec<_>>>()?;

    Some(format!("{{{}}}", rendered.join(",")))
}

fn quote_array_element(element: &str) -> String {
    let needs_quotes = element.is_empty()
        || element.eq_ignore_ascii_case("NULL")
        || element
            .chars()
            .any(|character| matches!(character, ',' | '{' | '}' | '"' | '\\') || character.is_whitespace());

    if !needs_quotes {
        return element.to_string();
    }

    let escaped = element.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn interval_of(months: i32, days: i32, microseconds: i64) -> String {
        interval(&PgInterval {
            months,
            days,
            microseconds,
        })
    }

    #[test]
    fn test_server_text_normalization() {
        assert_eq!(text(&TypeCategory::Bool, "f").unwrap(), "false");
        assert_eq!(text(&TypeCategory::Binary, "\\xdead").unwrap(), "dead");
        assert_eq!(text(&TypeCategory::Inet, "192.168.1.0/24").unwrap(), "192.168.1.0/24");
        assert_eq!(
            text(&TypeCategory::Numeric, "3.1415926535").unwrap(),
            "3.1415926535"
        );
        assert_eq!(
            text(&TypeCategory::Jsonb, r#"{"b": 1}"#).unwrap(),
            r#"{"b": 1}"#
        );
    }

    #[test]
    fn test_timestamps_distinguish_time_zones() {
        assert_eq!(
            text(&TypeCategory::TimestampTz, "2024-03-04 05:06:07+02").unwrap(),
            "2024-03-04T05:06:07+02:00"
        );
        assert_eq!(
            text(&TypeCategory::Timestamp, "2024-03-04 05:06:07").unwrap(),
            "2024-03-04T05:06:07"
        );
        assert_eq!(text(&TypeCategory::TimestampTz, "infinity").unwrap(), "infinity");
    }

    #[test]
    fn test_timestamp_range_guard() {
        assert!(timestamp_in_range(0));
        assert!(timestamp_in_range(-86_400_000_000));
        assert!(!timestamp_in_range(i64::MAX - 1));
        assert!(date_in_range(-1));
        assert!(!date_in_range(i32::MAX - 1));
    }

    #[test]
    fn test_numeric_keeps_display_scale() {
        let decimal = BigDecimal::from_str("42").unwrap();
        assert_eq!(plain_decimal(decimal, 2), "42.00");

        let decimal = BigDecimal::from_str("-12345.678").unwrap();
        assert_eq!(plain_decimal(decimal, 3), "-12345.678");

        let decimal = BigDecimal::from_str("12345678901234567").unwrap();
        assert_eq!(plain_decimal(decimal, 0), "12345678901234567");

        let decimal = BigDecimal::from_str("0.00001").unwrap();
        assert_eq!(plain_decimal(decimal, 5), "0.00001");
    }

    #[test]
    fn test_money() {
        assert_eq!(money(PgMoney(-12_345)), "-123.45");
        assert_eq!(money(PgMoney(5)), "0.05");
        assert_eq!(money_from_text("$1,234.56"), "1234.56");
        assert_eq!(money_from_text("-$7.00"), "-7.00");
    }

    #[test]
    fn test_floats_use_server_spelling() {
        assert_eq!(float_text(f64::NAN).unwrap(), "NaN");
        assert_eq!(float_text(f64::NEG_INFINITY).unwrap(), "-Infinity");
        assert_eq!(float_text(1.5), None);
    }

    #[test]
    fn test_interval() {
        assert_eq!(
            interval_of(14, 3, 14_706_000_000),
            "1 year 2 mons 3 days 04:05:06"
        );
        assert_eq!(interval_of(0, 0, 0), "00:00:00");
        assert_eq!(interval_of(0, -1, -1_500_000), "-1 days -00:00:01.5");
    }

    #[test]
    fn test_inet_and_cidr_prefixes() {
        let host = IpNetwork::from_str("10.0.0.1/32").unwrap();
        assert_eq!(network(host, false), "10.0.0.1");
        assert_eq!(network(host, true), "10.0.0.1/32");

        let subnet = IpNetwork::from_str("192.168.1.0/24").unwrap();
        assert_eq!(network(subnet, false), "192.168.1.0/24");

        let loopback = IpNetwork::from_str("::1/128").unwrap();
        assert_eq!(network(loopback, false), "::1");
    }

    #[test]
    fn test_macaddr_is_lowercase() {
        let address = MacAddress::new([0x08, 0x00, 0x2B, 0x01, 0x02, 0xAB]);
        assert_eq!(mac(address), "08:00:2b:01:02:ab");
        assert_eq!(colon_hex(&[1, 2, 3, 4, 5, 6, 7, 8]), "01:02:03:04:05:06:07:08");
    }

    #[test]
    fn test_array_element_quoting() {
        assert_eq!(quote_array_element("plain"), "plain");
        assert_eq!(quote_array_element("a b"), "\"a b\"");
        assert_eq!(quote_array_element(""), "\"\"");
        assert_eq!(quote_array_element("say \"hi\""), "\"say \\\"hi\\\"\"");
    }
}
