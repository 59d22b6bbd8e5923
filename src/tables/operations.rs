//! Table write application.

use crate::error::{Result, StoreError};
use crate::types::TableWrite;
use serde_json::Value;

/// Key field used when none is configured.
pub const DEFAULT_KEY_FIELD: &str = "id";

/// Check that `write` can be applied to a table.
///
/// Only the payload shape is checked; every write that passes validation is
/// guaranteed to apply.
pub fn validate_write(table: &str, write: &TableWrite, key_field: &str) -> Result<()> {
    match write {
        TableWrite::Upsert(row) | TableWrite::Append(row) => {
            if !row.is_object() {
                return Err(StoreError::invalid_write(
                    table,
                    format!("{} payload must be a JSON object", write.kind()),
                ));
            }
        }
        TableWrite::Delete(key) => {
            if key.is_null() || key.is_object() || key.is_array() {
                return Err(StoreError::invalid_write(
                    table,
                    format!("delete key for '{}' must be a scalar", key_field),
                ));
            }
        }
        TableWrite::Replace(rows) => {
            if let Some(index) = rows.iter().position(|row| !row.is_object()) {
                return Err(StoreError::invalid_write(
                    table,
                    format!("replacement row {} is not a JSON object", index),
                ));
            }
        }
    }
    Ok(())
}

/// Apply a validated write to a row set in place.
pub fn apply_write(rows: &mut Vec<Value>, write: &TableWrite, key_field: &str) {
    match write {
        TableWrite::Upsert(payload) => {
            let position = payload.get(key_field).and_then(|key| {
                rows.iter().position(|row| row.get(key_field) == Some(key))
            });

            match (position, payload.as_object()) {
                (Some(index), Some(fields)) => {
                    // `Value::get` only matches objects, so the row is one.
                    if let Value::Object(row) = &mut rows[index] {
                        for (name, value) in fields {
                            row.insert(name.clone(), value.clone());
                        }
                    }
                }
                _ => rows.push(payload.clone()),
            }
        }

        TableWrite::Append(row) => rows.push(row.clone()),

        TableWrite::Delete(key) => {
            rows.retain(|row| row.get(key_field) != Some(key));
        }

        TableWrite::Replace(new_rows) => {
            *rows = new_rows.clone();
        }
    }
}
