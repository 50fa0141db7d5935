// SQLite schema definitions
// This file mirrors schema.rs but stores timestamps as RFC3339 text

diesel::table! {
    registered_bridges (map_key) {
        map_key -> Text,
        map_value -> Text,
        namespace -> Text,
        side -> Text,
        parent -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    synced_messages (map_key) {
        map_key -> Text,
        scope -> Text,
        message_id -> Text,
        mirror_id -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    last_seen_timestamp (conversation_id) {
        conversation_id -> Text,
        last_seen -> BigInt,
        updated_at -> Text,
    }
}

diesel::table! {
    backfill_cursor (conversation_id) {
        conversation_id -> Text,
        token -> Text,
        updated_at -> Text,
    }
}
