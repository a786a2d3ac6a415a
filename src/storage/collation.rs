//! SQLite collations
//!
//! Two custom collations are registered on every connection:
//!
//! - `revid`: orders revision IDs by generation, then suffix. Declared on
//!   `revs.revid` so winner selection is a plain `ORDER BY ... DESC`.
//! - `json`: CouchDB view-key ordering over serialized JSON values
//!   (null < false < true < number < string < array < object). Declared on
//!   `maps.key` for the query collaborator.
//!
//! Collation callbacks must be total over arbitrary strings and must not
//! panic; malformed input falls back to byte comparison.

use std::cmp::Ordering;

use rusqlite::Connection;
use serde_json::Value;

use crate::revision::collate_rev_ids;

use super::errors::StorageResult;

/// Registers the `revid` and `json` collations on `conn`.
pub fn register_collations(conn: &Connection) -> StorageResult<()> {
    conn.create_collation("revid", |a, b| collate_rev_ids(a, b))?;
    conn.create_collation("json", collate_json)?;
    Ok(())
}

/// CouchDB collation over two serialized JSON values.
pub fn collate_json(a: &str, b: &str) -> Ordering {
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(va), Ok(vb)) => compare_values(&va, &vb),
        // Malformed keys sort after well-formed ones, stably.
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => {
            let fa = na.as_f64().unwrap_or(0.0);
            let fb = nb.as_f64().unwrap_or(0.0);
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        // Codepoint order; full ICU collation is out of scope.
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Array(aa), Value::Array(ab)) => {
            for (ea, eb) in aa.iter().zip(ab.iter()) {
                let ord = compare_values(ea, eb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            aa.len().cmp(&ab.len())
        }
        (Value::Object(oa), Value::Object(ob)) => {
            // Key-by-key, then value-by-value, shorter object first.
            for ((ka, va), (kb, vb)) in oa.iter().zip(ob.iter()) {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            oa.len().cmp(&ob.len())
        }
        _ => Ordering::Equal,
    }
}
