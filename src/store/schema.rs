diesel::table! {
    organizations (id) {
        id -> Uuid,
        name -> Text,
        slug -> Text,
        status -> Text,
        settings -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        org_id -> Uuid,
        email -> Text,
        password_hash -> Text,
        first_name -> Text,
        last_name -> Text,
        role -> Text,
        status -> Text,
        mfa_enabled -> Bool,
        last_login_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    refresh_tokens (id) {
        id -> Uuid,
        user_id -> Uuid,
        org_id -> Uuid,
        token_hash -> Text,
        user_agent -> Nullable<Text>,
        ip_address -> Nullable<Text>,
        expires_at -> Timestamptz,
        revoked_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    frameworks (id) {
        id -> Uuid,
        code -> Text,
        name -> Text,
        description -> Text,
        publisher -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    framework_versions (id) {
        id -> Uuid,
        framework_id -> Uuid,
        version -> Text,
        effective_date -> Nullable<Date>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    requirements (id) {
        id -> Uuid,
        framework_version_id -> Uuid,
        parent_id -> Nullable<Uuid>,
        reference -> Text,
        title -> Text,
        description -> Text,
        depth -> Int4,
        section_order -> Int4,
        is_assessable -> Bool,
    }
}

diesel::table! {
    org_frameworks (id) {
        id -> Uuid,
        org_id -> Uuid,
        framework_version_id -> Uuid,
        status -> Text,
        activated_by -> Nullable<Uuid>,
        activated_at -> Timestamptz,
        deactivated_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    requirement_scopes (id) {
        id -> Uuid,
        org_id -> Uuid,
        requirement_id -> Uuid,
        in_scope -> Bool,
        justification -> Nullable<Text>,
        set_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    controls (id) {
        id -> Uuid,
        org_id -> Uuid,
        identifier -> Text,
        title -> Text,
        description -> Text,
        category -> Text,
        status -> Text,
        owner_id -> Nullable<Uuid>,
        secondary_owner_id -> Nullable<Uuid>,
        is_custom -> Bool,
        metadata -> Jsonb,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    control_mappings (id) {
        id -> Uuid,
        org_id -> Uuid,
        control_id -> Uuid,
        requirement_id -> Uuid,
        strength -> Text,
        notes -> Nullable<Text>,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    risks (id) {
        id -> Uuid,
        org_id -> Uuid,
        identifier -> Text,
        title -> Text,
        description -> Text,
        category -> Text,
        status -> Text,
        owner_id -> Nullable<Uuid>,
        secondary_owner_id -> Nullable<Uuid>,
        inherent_likelihood -> Nullable<Text>,
        inherent_impact -> Nullable<Text>,
        inherent_score -> Nullable<Int4>,
        residual_likelihood -> Nullable<Text>,
        residual_impact -> Nullable<Text>,
        residual_score -> Nullable<Int4>,
        appetite_threshold -> Nullable<Int4>,
        accepted_at -> Nullable<Timestamptz>,
        accepted_by -> Nullable<Uuid>,
        acceptance_justification -> Nullable<Text>,
        acceptance_expiry -> Nullable<Date>,
        assessment_frequency_days -> Nullable<Int4>,
        next_assessment_at -> Nullable<Date>,
        last_assessed_at -> Nullable<Date>,
        source -> Nullable<Text>,
        affected_assets -> Array<Text>,
        tags -> Array<Text>,
        is_template -> Bool,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    risk_assessments (id) {
        id -> Uuid,
        org_id -> Uuid,
        risk_id -> Uuid,
        assessment_type -> Text,
        likelihood -> Text,
        impact -> Text,
        score -> Int4,
        severity -> Text,
        is_current -> Bool,
        supersedes_id -> Nullable<Uuid>,
        superseded_by_id -> Nullable<Uuid>,
        assessed_on -> Date,
        justification -> Text,
        assumptions -> Nullable<Text>,
        data_sources -> Array<Text>,
        assessor_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    risk_treatments (id) {
        id -> Uuid,
        org_id -> Uuid,
        risk_id -> Uuid,
        treatment_type -> Text,
        title -> Text,
        description -> Text,
        status -> Text,
        owner_id -> Nullable<Uuid>,
        target_control_id -> Nullable<Uuid>,
        due_date -> Nullable<Date>,
        expected_residual_likelihood -> Nullable<Text>,
        expected_residual_impact -> Nullable<Text>,
        expected_residual_score -> Nullable<Int4>,
        effectiveness -> Nullable<Text>,
        completion_notes -> Nullable<Text>,
        completed_at -> Nullable<Timestamptz>,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    risk_controls (id) {
        id -> Uuid,
        org_id -> Uuid,
        risk_id -> Uuid,
        control_id -> Uuid,
        effectiveness -> Text,
        mitigation_percentage -> Int4,
        notes -> Nullable<Text>,
        last_effectiveness_review -> Nullable<Timestamptz>,
        reviewed_by -> Nullable<Uuid>,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tests (id) {
        id -> Uuid,
        org_id -> Uuid,
        identifier -> Text,
        title -> Text,
        description -> Text,
        test_type -> Text,
        severity -> Text,
        status -> Text,
        control_id -> Uuid,
        cron_expression -> Nullable<Text>,
        interval_minutes -> Nullable<Int4>,
        timeout_seconds -> Int4,
        retry_count -> Int4,
        retry_delay_seconds -> Int4,
        tags -> Array<Text>,
        configuration -> Jsonb,
        next_run_at -> Nullable<Timestamptz>,
        last_run_at -> Nullable<Timestamptz>,
        last_result_status -> Nullable<Text>,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    test_runs (id) {
        id -> Uuid,
        org_id -> Uuid,
        run_number -> Int8,
        status -> Text,
        trigger_type -> Text,
        trigger_metadata -> Jsonb,
        test_ids -> Array<Uuid>,
        total_tests -> Int4,
        passed -> Int4,
        failed -> Int4,
        errors -> Int4,
        skipped -> Int4,
        warnings -> Int4,
        worker_id -> Nullable<Text>,
        error_message -> Nullable<Text>,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        duration_ms -> Nullable<Int8>,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    test_results (id) {
        id -> Uuid,
        org_id -> Uuid,
        run_id -> Uuid,
        test_id -> Uuid,
        control_id -> Uuid,
        status -> Text,
        severity -> Text,
        message -> Nullable<Text>,
        details -> Jsonb,
        duration_ms -> Nullable<Int8>,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        alert_generated -> Bool,
        alert_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    alerts (id) {
        id -> Uuid,
        org_id -> Uuid,
        alert_number -> Int8,
        title -> Text,
        description -> Nullable<Text>,
        severity -> Text,
        status -> Text,
        control_id -> Nullable<Uuid>,
        test_id -> Nullable<Uuid>,
        test_result_id -> Nullable<Uuid>,
        rule_id -> Nullable<Uuid>,
        assigned_to -> Nullable<Uuid>,
        assigned_at -> Nullable<Timestamptz>,
        acknowledged_at -> Nullable<Timestamptz>,
        acknowledged_by -> Nullable<Uuid>,
        sla_deadline -> Nullable<Timestamptz>,
        sla_breached -> Bool,
        resolved_at -> Nullable<Timestamptz>,
        resolved_by -> Nullable<Uuid>,
        resolution_note -> Nullable<Text>,
        suppressed_until -> Nullable<Timestamptz>,
        suppressed_by -> Nullable<Uuid>,
        suppression_reason -> Nullable<Text>,
        channels -> Array<Text>,
        delivered_at -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    alert_rules (id) {
        id -> Uuid,
        org_id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        enabled -> Bool,
        priority -> Int4,
        match_test_types -> Array<Text>,
        match_severities -> Array<Text>,
        match_result_statuses -> Array<Text>,
        match_control_ids -> Array<Uuid>,
        match_tags -> Array<Text>,
        consecutive_failures -> Int4,
        cooldown_minutes -> Int4,
        alert_severity -> Text,
        title_template -> Nullable<Text>,
        auto_assign_to -> Nullable<Uuid>,
        sla_hours -> Nullable<Int4>,
        channels -> Array<Text>,
        slack_webhook_url -> Nullable<Text>,
        email_recipients -> Array<Text>,
        webhook_url -> Nullable<Text>,
        webhook_headers -> Jsonb,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    audit_logs (id) {
        id -> Uuid,
        seq -> Int8,
        org_id -> Uuid,
        actor_id -> Nullable<Uuid>,
        action -> Text,
        resource_type -> Text,
        resource_id -> Nullable<Uuid>,
        metadata -> Jsonb,
        ip_address -> Nullable<Text>,
        user_agent -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    org_sequences (org_id, name) {
        org_id -> Uuid,
        name -> Text,
        value -> Int8,
    }
}

diesel::joinable!(users -> organizations (org_id));
diesel::joinable!(framework_versions -> frameworks (framework_id));
diesel::joinable!(requirements -> framework_versions (framework_version_id));
diesel::joinable!(control_mappings -> requirements (requirement_id));
diesel::joinable!(test_results -> test_runs (run_id));

diesel::allow_tables_to_appear_in_same_query!(
    organizations,
    users,
    refresh_tokens,
    frameworks,
    framework_versions,
    requirements,
    org_frameworks,
    requirement_scopes,
    controls,
    control_mappings,
    risks,
    risk_assessments,
    risk_treatments,
    risk_controls,
    tests,
    test_runs,
    test_results,
    alerts,
    alert_rules,
    audit_logs,
    org_sequences,
);
