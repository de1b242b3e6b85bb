diesel::table! {
    jobs (id) {
        id -> Text,
        sample_id -> Text,
        input_type -> Nullable<Text>,
        status -> Text,
        run_number -> Nullable<Integer>,
        output_dir -> Nullable<Text>,
        pid -> Nullable<Integer>,
        threads -> Integer,
        prokka_mode -> Text,
        prokka_genus -> Nullable<Text>,
        prokka_species -> Nullable<Text>,
        force -> Bool,
        created_at -> Timestamp,
        started_at -> Nullable<Timestamp>,
        completed_at -> Nullable<Timestamp>,
        exit_code -> Nullable<Integer>,
        error_message -> Nullable<Text>,
        progress_percent -> Integer,
        current_step -> Text,
        logs_preview -> Nullable<Text>,
    }
}
