use std::collections::HashSet;

use serde_json::Value;

use crate::errors::DomainResult;

use super::column::{EvalContext, ExportColumn};
use super::record::{is_blank, Record, RelationValue, SegmentKind};

/// Resolve a column's raw state for the record in `ctx`, then format it.
pub fn resolve_formatted(
    column: &ExportColumn,
    ctx: &EvalContext<'_>,
) -> DomainResult<String> {
    let state = resolve_state(column, ctx)?;
    column.format_state(state, ctx)
}

/// Resolve a column's raw state for the record in `ctx`.
///
/// An explicit state override always wins. Otherwise the dotted name is
/// split into a relationship prefix (the longest run of relation segments)
/// and an attribute path evaluated against every reachable related record.
/// A configured separator splits string states, and a blank result falls
/// back to the column's default.
pub fn resolve_state(column: &ExportColumn, ctx: &EvalContext<'_>) -> DomainResult<Value> {
    let Some(record) = ctx.record else {
        return Ok(Value::Null);
    };

    let mut state = match column.state_override() {
        Some(state_fn) => state_fn(ctx)?,
        None => state_from_record(column, record, ctx),
    };

    if let (Value::String(text), Some(separator)) = (&state, column.get_separator(ctx)) {
        state = Value::Array(split_separator(text, &separator));
    }

    if is_blank(&state) {
        if let Some(default) = column.get_default_state(ctx) {
            state = default;
        }
    }

    Ok(state)
}

/// Split a string state on a separator. A blank input yields an empty
/// list rather than a one-element list of blank.
pub fn split_separator(text: &str, separator: &str) -> Vec<Value> {
    let parts: Vec<&str> = text.split(separator).collect();
    if parts.len() == 1 && parts[0].trim().is_empty() {
        return Vec::new();
    }
    parts.into_iter().map(|p| Value::String(p.to_string())).collect()
}

fn state_from_record(column: &ExportColumn, record: &Record, ctx: &EvalContext<'_>) -> Value {
    let name = column.name();

    if !name.contains('.') {
        return record.attribute(name).cloned().unwrap_or(Value::Null);
    }

    let segments: Vec<&str> = name.split('.').collect();
    let prefix_len = relationship_prefix_len(record, &segments[..segments.len() - 1]);

    if prefix_len == 0 {
        // No leading relation: the dotted name indexes into a structured
        // attribute value.
        return attribute_path_value(record, &segments);
    }

    let mut saw_many = false;
    let mut leaves: Vec<&Record> = Vec::new();
    collect_leaf_records(record, &segments[..prefix_len], &mut leaves, &mut saw_many);

    let attribute_path = &segments[prefix_len..];
    let mut values: Vec<Value> = Vec::new();
    for leaf in leaves {
        push_flattened(attribute_path_value(leaf, attribute_path), &mut values);
    }

    values.retain(|v| !is_blank(v));

    if column.is_distinct_list(ctx) {
        let mut seen = HashSet::new();
        values.retain(|v| seen.insert(v.to_string()));
    }

    if values.is_empty() {
        return Value::Null;
    }

    if values.len() < 2 && !saw_many {
        return values.into_iter().next().unwrap_or(Value::Null);
    }

    Value::Array(values)
}

/// Length of the longest run of relation segments at the start of the
/// path (excluding the final attribute segment). An attribute with the
/// same name stops the walk.
fn relationship_prefix_len(record: &Record, segments: &[&str]) -> usize {
    let mut current = record;
    let mut len = 0;
    for segment in segments {
        match current.segment_kind(segment) {
            SegmentKind::ToOneRelation | SegmentKind::ToManyRelation => {
                len += 1;
                // Keep classifying against a loaded related record when one
                // exists; with nothing loaded the rest of the path cannot
                // reach any record anyway.
                match current.relation(segment) {
                    Some(RelationValue::ToOne(Some(next))) => current = next,
                    Some(RelationValue::ToMany(items)) if !items.is_empty() => {
                        current = &items[0]
                    }
                    _ => break,
                }
            }
            _ => break,
        }
    }
    len
}

/// Collect every record reachable through the relation prefix, fanning out
/// across to-many hops.
fn collect_leaf_records<'a>(
    record: &'a Record,
    prefix: &[&str],
    leaves: &mut Vec<&'a Record>,
    saw_many: &mut bool,
) {
    let Some((segment, rest)) = prefix.split_first() else {
        leaves.push(record);
        return;
    };

    match record.relation(segment) {
        Some(RelationValue::ToOne(Some(next))) => {
            collect_leaf_records(next, rest, leaves, saw_many)
        }
        Some(RelationValue::ToOne(None)) => {}
        Some(RelationValue::ToMany(items)) => {
            *saw_many = true;
            for item in items {
                collect_leaf_records(item, rest, leaves, saw_many);
            }
        }
        None => {}
    }
}

/// Evaluate an attribute path against one record: the first segment is an
/// attribute lookup, the rest index into the attribute's JSON value.
fn attribute_path_value(record: &Record, segments: &[&str]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return Value::Null;
    };
    match record.attribute(first) {
        Some(value) => descend_value(value, rest),
        None => Value::Null,
    }
}

fn descend_value(value: &Value, segments: &[&str]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(map) => match map.get(*first) {
            Some(inner) => descend_value(inner, rest),
            None => Value::Null,
        },
        Value::Array(items) => match first.parse::<usize>().ok().and_then(|i| items.get(i)) {
            Some(inner) => descend_value(inner, rest),
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

/// Flatten nested collections produced by fan-out into a flat value list.
fn push_flattened(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                push_flattened(item, out);
            }
        }
        other => out.push(other),
    }
}
