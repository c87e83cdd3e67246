//! Proptest strategies for notification payloads

use proptest::prelude::*;
use serde_json::{Map, Value};

/// Non-empty essence names, as produced by the ingest pipeline
pub fn essence_name_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9_.-]{0,40}"
}

/// Essence ids are either numeric or textual in the wild
pub fn essence_id_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<u32>().prop_map(Value::from),
        "[a-z0-9]{1,16}".prop_map(Value::from),
    ]
}

pub fn correlation_id_strategy() -> impl Strategy<Value = String> {
    "[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}"
}

/// Extra `data` fields that never collide with the reserved keys
pub fn extra_fields_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map(
        "x_[a-z]{1,10}",
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[ -~]{0,20}".prop_map(Value::from),
        ],
        0..6,
    )
    .prop_map(|fields| fields.into_iter().collect())
}
