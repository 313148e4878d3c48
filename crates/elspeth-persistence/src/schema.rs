//! Esquema Diesel (declarado manualmente, paridad con las migraciones).
//! Reemplazable con `diesel print-schema`.
//!
//! Nota: la unicidad del outcome terminal vive en el índice único parcial
//! `token_outcomes_one_terminal` (ver migración); Diesel no lo modela pero
//! la violación llega como `UniqueViolation`.

diesel::table! {
    runs (run_id) {
        run_id -> Uuid,
        started_at -> Timestamptz,
        finished_at -> Nullable<Timestamptz>,
        status -> Text,
        config_fingerprint -> Text,
    }
}

diesel::table! {
    rows (run_id, row_id) {
        row_id -> Text,
        run_id -> Uuid,
        source_position -> BigInt,
        content_hash -> Text,
    }
}

diesel::table! {
    tokens (token_id) {
        token_id -> Uuid,
        row_id -> Text,
        fork_group_id -> Nullable<Uuid>,
        join_group_id -> Nullable<Uuid>,
        expand_group_id -> Nullable<Uuid>,
        branch_name -> Nullable<Text>,
        step_in_pipeline -> Integer,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    token_parents (token_id, ordinal) {
        token_id -> Uuid,
        parent_token_id -> Uuid,
        ordinal -> Integer,
    }
}

diesel::table! {
    node_states (state_id) {
        state_id -> Uuid,
        token_id -> Uuid,
        node_id -> Text,
        attempt -> Integer,
        status -> Text,
        input_hash -> Text,
        output_hash -> Nullable<Text>,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        duration_ms -> Nullable<BigInt>,
        error_json -> Nullable<Jsonb>,
        success_reason_json -> Nullable<Jsonb>,
        context_before_json -> Nullable<Jsonb>,
        context_after_json -> Nullable<Jsonb>,
    }
}

diesel::table! {
    routing_events (event_id) {
        event_id -> Uuid,
        routing_group_id -> Uuid,
        state_id -> Uuid,
        edge_id -> Text,
        mode -> Text,
        reason_json -> Nullable<Jsonb>,
    }
}

diesel::table! {
    token_outcomes (outcome_id) {
        outcome_id -> Uuid,
        run_id -> Uuid,
        token_id -> Uuid,
        outcome -> Text,
        is_terminal -> Bool,
        sink_name -> Nullable<Text>,
        batch_id -> Nullable<Uuid>,
        fork_group_id -> Nullable<Uuid>,
        join_group_id -> Nullable<Uuid>,
        expand_group_id -> Nullable<Uuid>,
        error_hash -> Nullable<Text>,
        expected_branches_json -> Nullable<Jsonb>,
        context_json -> Nullable<Jsonb>,
        recorded_at -> Timestamptz,
    }
}

diesel::table! {
    batches (batch_id) {
        batch_id -> Uuid,
        run_id -> Uuid,
        node_id -> Text,
        status -> Text,
        created_at -> Timestamptz,
        flushed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    batch_members (batch_id, ordinal) {
        batch_id -> Uuid,
        token_id -> Uuid,
        ordinal -> Integer,
    }
}

diesel::table! {
    experiment_assignments (run_id, row_id, experiment_id) {
        run_id -> Uuid,
        row_id -> Text,
        experiment_id -> Text,
        variant_id -> Text,
        overrides_json -> Nullable<Jsonb>,
        assigned_at -> Timestamptz,
    }
}

diesel::table! {
    calls (call_id) {
        call_id -> Uuid,
        run_id -> Uuid,
        token_id -> Uuid,
        node_id -> Text,
        service -> Text,
        request_hash -> Text,
        response_hash -> Text,
        status -> Text,
        recorded_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(runs, rows, tokens, token_parents, node_states, routing_events,
                                              token_outcomes, batches, batch_members, experiment_assignments, calls,);
