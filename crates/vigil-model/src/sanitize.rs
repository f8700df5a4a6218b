// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-schema sanitization shared by every driver.
//!
//! Provider function-calling endpoints accept only a JSON-Schema subset.
//! [`clean_tool_schema`] strips the keywords they reject and normalises the
//! root so a schema that validated locally never causes a wire 400.

use serde_json::{json, Value};

/// Keywords stripped recursively from tool input schemas.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "additionalProperties",
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "default",
    "examples",
];

/// Return a copy of `schema` with unsupported JSON-Schema keywords removed
/// at every nesting level, and the root coerced to
/// `{type: object, properties: {...}}`.
pub fn clean_tool_schema(schema: &Value) -> Value {
    let mut cleaned = strip_forbidden(schema);

    // The root must be an object schema with a properties map.
    if !cleaned.is_object() {
        return json!({ "type": "object", "properties": {} });
    }
    let obj = cleaned.as_object_mut().unwrap();
    obj.insert("type".into(), json!("object"));
    if !obj.contains_key("properties") {
        obj.insert("properties".into(), json!({}));
    }
    cleaned
}

fn strip_forbidden(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, val) in map {
                if FORBIDDEN_KEYWORDS.contains(&k.as_str()) {
                    continue;
                }
                out.insert(k.clone(), strip_forbidden(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_forbidden).collect()),
        other => other.clone(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
