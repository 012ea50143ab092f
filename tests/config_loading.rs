use std::sync::Mutex;

use tempfile::NamedTempFile;

use kiosk_vision::config::{ExecutionMode, KioskConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "KIOSK_CONFIG",
        "KIOSK_DB_PATH",
        "KIOSK_API_ADDR",
        "KIOSK_API_TOKEN_PATH",
        "KIOSK_HEURISTIC_BUDGET_MS",
        "KIOSK_ANALYSIS_MODE",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(toml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let token_file = NamedTempFile::new().expect("temp token path");
    let token_path = token_file.path().with_extension("token");
    let file = write_config(&format!(
        r#"
db_path = "kiosk_prod.db"

[api]
addr = "127.0.0.1:9100"
token_path = "{}"

[runtime]
heuristic_budget_ms = 750

[clothing]
garment_color_tolerance = 45.0

[fusion.floors]
clothing_item = 0.4
clothing_style = 0.35
primary_color = 0.25
secondary_color = 0.1
head_accessory = 0.5
bag_accessory = 0.6
age_range = 0.25
emotion = 0.25
"#,
        token_path.display()
    ));

    std::env::set_var("KIOSK_CONFIG", file.path());
    std::env::set_var("KIOSK_API_ADDR", "127.0.0.1:9200");
    std::env::set_var("KIOSK_ANALYSIS_MODE", "Inline");

    let cfg = KioskConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "kiosk_prod.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:9200");
    assert_eq!(cfg.api_token_path.as_deref(), Some(token_path.as_path()));
    assert_eq!(cfg.analyzer.runtime.heuristic_budget_ms, 750);
    assert_eq!(cfg.analyzer.runtime.mode, ExecutionMode::Inline);
    assert_eq!(cfg.analyzer.clothing.garment_color_tolerance, 45.0);
    assert_eq!(cfg.analyzer.fusion.floors.bag_accessory, 0.6);
    // Untouched sections keep their calibrated defaults.
    assert_eq!(cfg.analyzer.bag.backpack_min_area, 10_000);
    assert_eq!(cfg.analyzer.fusion.floors.head_accessory, 0.5);

    clear_env();
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("KIOSK_DB_PATH", "/tmp/kiosk_env.db");
    std::env::set_var("KIOSK_HEURISTIC_BUDGET_MS", "120");

    let cfg = KioskConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "/tmp/kiosk_env.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:8791");
    assert!(cfg.api_token_path.is_none());
    assert_eq!(cfg.analyzer.runtime.heuristic_budget_ms, 120);
    assert_eq!(cfg.analyzer.runtime.mode, ExecutionMode::Threaded);

    clear_env();
}

#[test]
fn invalid_thresholds_are_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"
[fusion.floors]
clothing_item = 0.4
clothing_style = 0.35
primary_color = 0.25
secondary_color = 0.1
head_accessory = 1.5
bag_accessory = 0.5
age_range = 0.25
emotion = 0.25
"#,
    );
    std::env::set_var("KIOSK_CONFIG", file.path());
    let err = KioskConfig::load().expect_err("floor above 1 must fail");
    assert!(err.to_string().contains("head_accessory"), "{}", err);

    clear_env();
}

#[test]
fn unknown_keys_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"
[bag]
backpack_min_aera = 9000
"#,
    );
    std::env::set_var("KIOSK_CONFIG", file.path());
    assert!(KioskConfig::load().is_err());

    clear_env();
}

#[test]
fn zero_budget_from_env_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("KIOSK_HEURISTIC_BUDGET_MS", "0");
    assert!(KioskConfig::load().is_err());
    std::env::set_var("KIOSK_HEURISTIC_BUDGET_MS", "soon");
    assert!(KioskConfig::load().is_err());

    clear_env();
}

#[test]
fn unknown_analysis_mode_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("KIOSK_ANALYSIS_MODE", "gpu");
    let err = KioskConfig::load().expect_err("unknown mode");
    assert!(err.to_string().contains("gpu"));

    clear_env();
}

#[test]
fn empty_clothing_rules_are_rejected() {
    let err = KioskConfig::from_toml_str(
        r#"
[clothing]
rules = []
"#,
    )
    .expect_err("empty rule list");
    assert!(err.to_string().contains("rule"), "{}", err);
}
