//! Binding JSON values as statement parameters.
//!
//! Values from the UI arrive as untyped JSON. They are sent in PostgreSQL text
//! format and the server parses them into whatever type the statement infers
//! for each placeholder, the same way it parses a quoted literal.

use bytes::BytesMut;
use serde_json::Value;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, Kind, ToSql, Type};

/// A JSON value bound in text format.
#[derive(Debug)]
pub(crate) struct SqlParam<'a>(pub(crate) &'a Value);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }
        out.extend_from_slice(text_literal(self.0, ty).as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Wrap a slice of JSON values for `query_raw`/`execute_raw`.
pub(crate) fn bind(values: &[Value]) -> Vec<SqlParam<'_>> {
    values.iter().map(SqlParam).collect()
}

/// Text representation of `value` for a parameter of type `ty`.
fn text_literal(value: &Value, ty: &Type) -> String {
    match (value, ty.kind()) {
        (Value::Array(items), Kind::Array(_)) => array_literal(items),
        (Value::String(s), _) => s.clone(),
        (Value::Bool(b), _) => b.to_string(),
        (Value::Number(n), _) => n.to_string(),
        // json/jsonb columns and anything else structured take the JSON text
        (other, _) => other.to_string(),
    }
}

/// `{a,"b c",NULL}` array input syntax.
fn array_literal(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Array(inner) => array_literal(inner),
            Value::String(s) => quote_element(s),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Object(_) => quote_element(&item.to_string()),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

fn quote_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: Value, ty: &Type) -> Option<String> {
        let mut buf = BytesMut::new();
        match SqlParam(&value).to_sql(ty, &mut buf).unwrap() {
            IsNull::Yes => None,
            IsNull::No => Some(String::from_utf8(buf.to_vec()).unwrap()),
        }
    }

    #[test]
    fn test_scalars_are_sent_as_plain_text() {
        assert_eq!(encode(json!(5), &Type::INT4).as_deref(), Some("5"));
        assert_eq!(encode(json!(1.5), &Type::NUMERIC).as_deref(), Some("1.5"));
        assert_eq!(encode(json!(true), &Type::BOOL).as_deref(), Some("true"));
        assert_eq!(encode(json!("it's"), &Type::TEXT).as_deref(), Some("it's"));
        assert_eq!(encode(Value::Null, &Type::TEXT), None);
    }

    #[test]
    fn test_arrays_use_array_syntax_only_for_array_types() {
        assert_eq!(
            encode(json!(["a b", "q\"uote", null]), &Type::TEXT_ARRAY).as_deref(),
            Some("{\"a b\",\"q\\\"uote\",NULL}")
        );
        assert_eq!(encode(json!([1, [2, 3]]), &Type::INT4_ARRAY).as_deref(), Some("{1,{2,3}}"));
        assert_eq!(encode(json!([1, 2]), &Type::JSONB).as_deref(), Some("[1,2]"));
    }

    #[test]
    fn test_objects_are_sent_as_json_text() {
        assert_eq!(encode(json!({ "k": 1 }), &Type::JSONB).as_deref(), Some("{\"k\":1}"));
    }

    #[test]
    fn test_params_request_text_format() {
        let value = json!(1);
        assert!(matches!(SqlParam(&value).encode_format(&Type::INT8), Format::Text));
        assert!(<SqlParam<'_> as ToSql>::accepts(&Type::UUID));
    }
}
