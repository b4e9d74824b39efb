//! SQL text used by the PostgreSQL adapter.
//!
//! Identifiers are always quoted; values only ever appear as `$n` placeholders.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::adapters::quote_identifier;
use crate::models::{Pagination, PrimaryKeyValue, RowValues};

// ========== Introspection ==========

pub(crate) const DATABASES: &str = "\
SELECT datname::text AS name
FROM pg_database
WHERE datistemplate = false
ORDER BY datname";

pub(crate) const SCHEMAS: &str = "\
SELECT schema_name::text AS name
FROM information_schema.schemata
WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
ORDER BY schema_name";

pub(crate) const TABLES: &str = "\
SELECT t.table_name::text AS name,
       t.table_schema::text AS schema,
       c.reltuples::bigint AS row_count
FROM information_schema.tables t
LEFT JOIN pg_namespace n ON n.nspname = t.table_schema
LEFT JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = t.table_name
WHERE t.table_schema::text = $1
  AND t.table_type = 'BASE TABLE'
ORDER BY t.table_name";

pub(crate) const COLUMNS: &str = "\
SELECT c.column_name::text AS name,
       c.data_type::text AS data_type,
       c.is_nullable = 'YES' AS nullable,
       c.column_default::text AS default_value,
       EXISTS (
           SELECT 1
           FROM information_schema.table_constraints tc
           JOIN information_schema.key_column_usage kcu
             ON tc.constraint_name = kcu.constraint_name
            AND tc.constraint_schema = kcu.constraint_schema
            AND tc.table_name = kcu.table_name
           WHERE tc.table_schema = c.table_schema
             AND tc.table_name = c.table_name
             AND tc.constraint_type = 'PRIMARY KEY'
             AND kcu.column_name = c.column_name
       ) AS is_primary_key
FROM information_schema.columns c
WHERE c.table_schema::text = $1 AND c.table_name::text = $2
ORDER BY c.ordinal_position";

pub(crate) const INDEXES: &str = "\
SELECT i.relname::text AS name,
       array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)) AS columns,
       ix.indisunique AS is_unique
FROM pg_class t
JOIN pg_index ix ON t.oid = ix.indrelid
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname::text = $1 AND t.relname::text = $2
GROUP BY i.relname, ix.indisunique
ORDER BY i.relname";

pub(crate) const PRIMARY_KEY: &str = "\
SELECT kcu.column_name::text AS column_name
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
  ON tc.constraint_name = kcu.constraint_name
 AND tc.constraint_schema = kcu.constraint_schema
 AND tc.table_name = kcu.table_name
WHERE tc.table_schema::text = $1
  AND tc.table_name::text = $2
  AND tc.constraint_type = 'PRIMARY KEY'
ORDER BY kcu.ordinal_position";

// ========== Table data ==========

pub(crate) fn count_rows(table_ref: &str) -> String {
    format!("SELECT COUNT(*) FROM {table_ref}")
}

/// Page query; `$1` is the limit and `$2` the offset.
pub(crate) fn select_page(table_ref: &str, pagination: &Pagination) -> String {
    let order = match &pagination.order_by {
        Some(column) => format!(
            " ORDER BY {} {}",
            quote_identifier(column),
            pagination.order_direction.as_sql()
        ),
        None => String::new(),
    };
    format!("SELECT * FROM {table_ref}{order} LIMIT $1 OFFSET $2")
}

// ========== Row mutation ==========

/// A generated statement and the values for its placeholders, in order.
#[derive(Debug, PartialEq)]
pub(crate) struct Statement {
    pub(crate) sql: String,
    pub(crate) params: Vec<Value>,
}

pub(crate) fn insert(table_ref: &str, values: &RowValues) -> Statement {
    if values.is_empty() {
        return Statement { sql: format!("INSERT INTO {table_ref} DEFAULT VALUES"), params: vec![] };
    }

    let columns: Vec<String> = values.keys().map(|c| quote_identifier(c)).collect();
    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("${i}")).collect();

    Statement {
        sql: format!(
            "INSERT INTO {table_ref} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        ),
        params: values.values().cloned().collect(),
    }
}

/// Caller guarantees both maps are non-empty.
pub(crate) fn update(table_ref: &str, key: &PrimaryKeyValue, values: &RowValues) -> Statement {
    let set_clause = assignments(values, 1, ", ");
    let where_clause = assignments(key, values.len() + 1, " AND ");

    Statement {
        sql: format!("UPDATE {table_ref} SET {set_clause} WHERE {where_clause}"),
        params: values.values().chain(key.values()).cloned().collect(),
    }
}

/// Caller guarantees `key` is non-empty.
pub(crate) fn delete(table_ref: &str, key: &PrimaryKeyValue) -> Statement {
    Statement {
        sql: format!("DELETE FROM {table_ref} WHERE {}", assignments(key, 1, " AND ")),
        params: key.values().cloned().collect(),
    }
}

/// `"col" = $n` terms numbered from `first`.
fn assignments(map: &BTreeMap<String, Value>, first: usize, separator: &str) -> String {
    map.keys()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", quote_identifier(column), first + i))
        .collect::<Vec<_>>()
        .join(separator)
}
