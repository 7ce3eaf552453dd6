use super::*;

use std::{
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    move |name: &str| vars.get(name).cloned()
}

#[test]
fn env_overrides_defaults() {
    let mut settings = Settings::default();
    settings
        .apply_env(env_from(&[
            ("SERVER_BIND", "0.0.0.0:9000"),
            ("APP__LOG_FILTER", "debug"),
            ("APP__MAX_FRAME_BYTES", "4096"),
            ("APP__SEED_DEMO", "off"),
        ]))
        .expect("apply env");

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.log_filter, "debug");
    assert_eq!(settings.max_frame_bytes, 4096);
    assert!(!settings.seed_demo);
    assert_eq!(settings.event_log_capacity, 256);
}

#[test]
fn app_bind_addr_wins_over_server_bind() {
    let mut settings = Settings::default();
    settings
        .apply_env(env_from(&[
            ("SERVER_BIND", "0.0.0.0:9000"),
            ("APP__BIND_ADDR", "127.0.0.1:9001"),
        ]))
        .expect("apply env");
    assert_eq!(settings.server_bind, "127.0.0.1:9001");
}

#[test]
fn invalid_numbers_are_reported() {
    let mut settings = Settings::default();
    let err = settings
        .apply_env(env_from(&[("APP__EVENT_LOG_CAPACITY", "lots")]))
        .expect_err("should fail");
    assert!(err.to_string().contains("APP__EVENT_LOG_CAPACITY"));
    assert_eq!(settings.event_log_capacity, 256);
}

#[test]
fn file_values_apply_and_missing_file_is_ignored() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = env::temp_dir().join(format!("live_model_server_config_test_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp root");
    let path = temp_root.join("server.toml");
    fs::write(
        &path,
        "bind_addr = \"127.0.0.1:7000\"\nevent_log_capacity = \"8\"\nseed_demo = \"false\"\n",
    )
    .expect("write config");

    let mut settings = Settings::default();
    settings.apply_file(&path).expect("apply file");
    assert_eq!(settings.server_bind, "127.0.0.1:7000");
    assert_eq!(settings.event_log_capacity, 8);
    assert!(!settings.seed_demo);

    let before = settings.clone();
    settings
        .apply_file(&temp_root.join("absent.toml"))
        .expect("missing file");
    assert_eq!(settings, before);

    fs::remove_dir_all(temp_root).expect("cleanup");
}
