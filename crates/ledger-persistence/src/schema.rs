//! Esquema Diesel (mantenido a mano, en paridad con `bootstrap::DDL`).

diesel::table! {
    flow_checkpoints (flow_id, seq) {
        flow_id -> Uuid,
        seq -> BigInt,
        flow_name -> Text,
        body -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    flow_entities (table_name, entity_key) {
        table_name -> Text,
        entity_key -> Text,
        payload -> Jsonb,
    }
}

diesel::table! {
    hospital_records (flow_id) {
        flow_id -> Uuid,
        error_class -> Text,
        attempt_count -> Integer,
        outcome -> Text,
        last_error -> Jsonb,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(flow_checkpoints, flow_entities, hospital_records,);
