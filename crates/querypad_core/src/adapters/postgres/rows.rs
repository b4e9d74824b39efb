//! Decoding PostgreSQL rows into JSON values.

use chrono::Utc;
use serde_json::Value;
use std::error::Error;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Row, SimpleQueryRow};
use uuid::Uuid;

type DecodeResult<T> = Result<T, Box<dyn Error + Sync + Send>>;

/// Convert a row to positional JSON values.
pub(crate) fn row_to_json(row: &Row) -> Vec<Value> {
    row.columns().iter().enumerate().map(|(i, col)| cell_to_json(row, i, col.type_())).collect()
}

/// Convert a simple-protocol row, whose values are already text.
pub(crate) fn simple_row_to_json(row: &SimpleQueryRow) -> Vec<Value> {
    (0..row.len())
        .map(|i| row.get(i).map_or(Value::Null, |v| Value::String(v.to_string())))
        .collect()
}

fn cell_to_json(row: &Row, i: usize, ty: &Type) -> Value {
    let value = match *ty {
        // Boolean
        Type::BOOL => get::<bool>(row, i).map(Value::Bool),

        // Integers
        Type::INT2 => get::<i16>(row, i).map(|v| Value::Number(v.into())),
        Type::INT4 => get::<i32>(row, i).map(|v| Value::Number(v.into())),
        Type::INT8 => get::<i64>(row, i).map(|v| Value::Number(v.into())),
        Type::OID => get::<u32>(row, i).map(|v| Value::Number(v.into())),

        // Floating point
        Type::FLOAT4 => get::<f32>(row, i)
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number),
        Type::FLOAT8 => get::<f64>(row, i).and_then(serde_json::Number::from_f64).map(Value::Number),

        // Arbitrary precision, kept exact as a decimal string
        Type::NUMERIC => get::<PgNumeric>(row, i).map(|v| Value::String(v.0)),

        // UUID
        Type::UUID => get::<Uuid>(row, i).map(|v| Value::String(v.to_string())),

        // JSON/JSONB
        Type::JSON | Type::JSONB => get::<Value>(row, i),

        // Timestamps
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<Utc>>(row, i).map(|v| Value::String(v.to_rfc3339()))
        }
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, i).map(|v| Value::String(v.to_string())),

        // Date/Time
        Type::DATE => get::<chrono::NaiveDate>(row, i).map(|v| Value::String(v.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, i).map(|v| Value::String(v.to_string())),
        Type::TIMETZ => get::<PgTimeTz>(row, i).map(|v| Value::String(v.0)),
        Type::INTERVAL => get::<PgInterval>(row, i).map(|v| Value::String(v.0)),

        // Network and money
        Type::INET | Type::CIDR => get::<PgInet>(row, i).map(|v| Value::String(v.0)),
        Type::MACADDR | Type::MACADDR8 => get::<PgMacAddr>(row, i).map(|v| Value::String(v.0)),
        Type::MONEY => get::<PgMoney>(row, i).map(|v| Value::String(v.0)),

        // Binary
        Type::BYTEA => get::<Vec<u8>>(row, i).map(|v| Value::String(hex_literal(&v))),

        // Arrays
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, i).map(|v| {
            Value::Array(v.into_iter().map(|x| x.map_or(Value::Null, |x| x.into())).collect())
        }),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, i).map(|v| {
            Value::Array(v.into_iter().map(|x| x.map_or(Value::Null, |x| x.into())).collect())
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<Option<String>>>(row, i).map(|v| {
            Value::Array(v.into_iter().map(|x| x.map_or(Value::Null, Value::String)).collect())
        }),

        // Text-like and enum types, then raw bytes for anything else
        _ => get::<TextValue>(row, i)
            .map(|v| Value::String(v.0))
            .or_else(|| get::<RawValue>(row, i).map(|v| Value::String(v.into_text()))),
    };
    value.unwrap_or(Value::Null)
}

/// Read a nullable cell, treating NULL and undecodable values alike.
fn get<'a, T: FromSql<'a>>(row: &'a Row, i: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(i).ok().flatten()
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Text-like columns plus enums, whose binary form is their label.
struct TextValue(String);

impl<'a> FromSql<'a> for TextValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        if matches!(ty.kind(), Kind::Enum(_)) {
            return Ok(TextValue(std::str::from_utf8(raw)?.to_string()));
        }
        String::from_sql(ty, raw).map(TextValue)
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_)) || <String as FromSql>::accepts(ty)
    }
}

/// Binary value of a type without a dedicated decoder.
struct RawValue(Vec<u8>);

impl RawValue {
    /// UTF-8 payloads as-is, everything else as a bytea-style hex literal.
    fn into_text(self) -> String {
        match String::from_utf8(self.0) {
            Ok(text) if !text.chars().any(char::is_control) => text,
            Ok(text) => hex_literal(text.as_bytes()),
            Err(e) => hex_literal(e.as_bytes()),
        }
    }
}

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn be_i32(raw: &[u8], at: usize) -> DecodeResult<i32> {
    raw.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_be_bytes)
        .ok_or_else(|| "truncated value".into())
}

fn be_i64(raw: &[u8], at: usize) -> DecodeResult<i64> {
    raw.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
        .ok_or_else(|| "truncated value".into())
}

/// `HH:MM:SS[.ffffff]` for an unsigned microsecond count; hours may exceed 24.
fn clock(micros: u64) -> String {
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let mut out = format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
    if frac != 0 {
        out.push('.');
        out.push_str(format!("{frac:06}").trim_end_matches('0'));
    }
    out
}

/// INTERVAL in PostgreSQL's default output style.
struct PgInterval(String);

impl<'a> FromSql<'a> for PgInterval {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        Ok(PgInterval(format_interval(be_i32(raw, 12)?, be_i32(raw, 8)?, be_i64(raw, 0)?)))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INTERVAL
    }
}

fn format_interval(months: i32, days: i32, micros: i64) -> String {
    let mut parts = Vec::new();
    // Whether the last printed field was negative
    let mut negative_before = false;
    let mut field = |value: i64, unit: &str| {
        if value == 0 {
            return;
        }
        let sign = if negative_before && value > 0 { "+" } else { "" };
        let plural = if value == 1 { "" } else { "s" };
        parts.push(format!("{sign}{value} {unit}{plural}"));
        negative_before = value < 0;
    };
    field(i64::from(months / 12), "year");
    field(i64::from(months % 12), "mon");
    field(i64::from(days), "day");

    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 {
            "-"
        } else if negative_before {
            "+"
        } else {
            ""
        };
        parts.push(format!("{sign}{}", clock(micros.unsigned_abs())));
    }
    parts.join(" ")
}

/// TIMETZ as `HH:MM:SS[.ffffff]±HH[:MM]`.
struct PgTimeTz(String);

impl<'a> FromSql<'a> for PgTimeTz {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        let micros = be_i64(raw, 0)?;
        // Stored as seconds west of UTC
        let offset = -be_i32(raw, 8)?;
        let sign = if offset < 0 { '-' } else { '+' };
        let offset = offset.unsigned_abs();

        let mut out = clock(micros.unsigned_abs());
        out.push(sign);
        out.push_str(&format!("{:02}", offset / 3600));
        if offset % 3600 != 0 {
            out.push_str(&format!(":{:02}", (offset / 60) % 60));
        }
        Ok(PgTimeTz(out))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::TIMETZ
    }
}

/// INET and CIDR in PostgreSQL's text form.
struct PgInet(String);

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

impl<'a> FromSql<'a> for PgInet {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        let [family, bits, _is_cidr, len, addr @ ..] = raw else {
            return Err("invalid inet header".into());
        };
        if addr.len() != *len as usize {
            return Err("invalid inet length".into());
        }
        let (text, max_bits) = match (*family, addr) {
            (PGSQL_AF_INET, &[a, b, c, d]) => (Ipv4Addr::new(a, b, c, d).to_string(), 32),
            (PGSQL_AF_INET6, octets) => {
                let octets: [u8; 16] = octets.try_into().map_err(|_| "invalid inet6 address")?;
                (Ipv6Addr::from(octets).to_string(), 128)
            }
            _ => return Err("unknown inet family".into()),
        };
        if *ty == Type::CIDR || *bits != max_bits {
            return Ok(PgInet(format!("{text}/{bits}")));
        }
        Ok(PgInet(text))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INET || *ty == Type::CIDR
    }
}

/// MACADDR and MACADDR8 as colon-separated hex.
struct PgMacAddr(String);

impl<'a> FromSql<'a> for PgMacAddr {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        if raw.len() != 6 && raw.len() != 8 {
            return Err("invalid macaddr length".into());
        }
        let octets: Vec<String> = raw.iter().map(|b| format!("{b:02x}")).collect();
        Ok(PgMacAddr(octets.join(":")))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::MACADDR || *ty == Type::MACADDR8
    }
}

/// MONEY as a plain decimal string with two fraction digits.
struct PgMoney(String);

impl<'a> FromSql<'a> for PgMoney {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        let cents = be_i64(raw, 0)?;
        let sign = if cents < 0 { "-" } else { "" };
        let cents = cents.unsigned_abs();
        Ok(PgMoney(format!("{sign}{}.{:02}", cents / 100, cents % 100)))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::MONEY
    }
}

/// NUMERIC decoded from its binary form into a decimal string.
#[derive(Debug, PartialEq)]
pub(crate) struct PgNumeric(pub(crate) String);

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Layout: ndigits, weight, sign, dscale (all 16-bit), then base-10000 digits.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn Error + Sync + Send>> {
    if raw.len() < 8 {
        return Err("invalid numeric header".into());
    }
    let word = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);

    let ndigits = word(0) as usize;
    let weight = word(2) as i16 as i32;
    let sign = word(4);
    let dscale = word(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("invalid numeric length".into());
    }
    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + i * 2)).collect();
    let digit_at = |idx: i32| -> u16 {
        if idx < 0 {
            0
        } else {
            digits.get(idx as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit_at(0).to_string());
        for idx in 1..=weight {
            out.push_str(&format!("{:04}", digit_at(idx)));
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit_at(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}
