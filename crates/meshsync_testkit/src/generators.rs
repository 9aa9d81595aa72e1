//! Property-based test generators using proptest.

use meshsync_protocol::{DataItem, FieldValue, PreparedStmt, QueryObject, SyncMode};
use proptest::prelude::*;

/// Strategy for device ids.
pub fn device_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for entries with distinct keys and timestamps from 1.
pub fn data_items_strategy(max: usize) -> impl Strategy<Value = Vec<DataItem>> {
    prop::collection::btree_map(
        prop::collection::vec(any::<u8>(), 1..16),
        prop::collection::vec(any::<u8>(), 0..64),
        0..max,
    )
    .prop_map(|pairs| {
        pairs
            .into_iter()
            .zip(1u64..)
            .map(|((key, value), timestamp)| DataItem::new(key, value, timestamp))
            .collect()
    })
}

/// Strategy for request modes a caller may use without a query.
pub fn plain_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        Just(SyncMode::Push),
        Just(SyncMode::Pull),
        Just(SyncMode::PushAndPull),
    ]
}

/// Strategy for query objects over one table.
pub fn query_strategy() -> impl Strategy<Value = QueryObject> {
    (
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        prop::collection::vec(any::<u8>(), 0..4),
        prop::option::of(1u32..100),
    )
        .prop_map(|(table, prefix, limit)| {
            let query = QueryObject::new().with_table(table).with_prefix(prefix);
            match limit {
                Some(limit) => query.with_limit(limit),
                None => query,
            }
        })
}

/// Strategy for single field values.
pub fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<i64>().prop_map(FieldValue::Integer),
        any::<f64>()
            .prop_filter("finite", |f| f.is_finite())
            .prop_map(FieldValue::Real),
        prop::string::string_regex("[ -~]{0,32}")
            .expect("Invalid regex")
            .prop_map(FieldValue::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(FieldValue::Blob),
    ]
}

/// Strategy for query statements with bind arguments.
pub fn prepared_stmt_strategy() -> impl Strategy<Value = PreparedStmt> {
    (
        prop::string::string_regex("SELECT [a-z*]{1,8} FROM [a-z]{1,8}").expect("Invalid regex"),
        prop::collection::vec(prop::string::string_regex("[ -~]{0,16}").expect("Invalid regex"), 0..8),
    )
        .prop_map(|(sql, args)| args.into_iter().fold(PreparedStmt::query(sql), |stmt, arg| stmt.bind(arg)))
}
