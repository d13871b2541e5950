//! Configuration layering: defaults, TOML file, environment.

use labwire::config::{NetworkBackend, Settings};
use labwire::register::{ByteOrder, OverflowPolicy};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn missing_file_falls_back_to_defaults() {
    let settings = Settings::load_from("/nonexistent/labwire.toml").unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
#[serial]
fn file_values_override_defaults() {
    let file = write_config(
        r#"
[network]
backend = "visa"
port = 5555

[serial.aliases]
COM7 = "/dev/ttyUSB0"

[bridge]
slave_address = 0x98
data_width = 2
data_byte_order = "big"
overflow = "bleed"
"#,
    );

    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.network.backend, NetworkBackend::Visa);
    assert_eq!(settings.network.port, 5555);
    assert_eq!(settings.serial.device_path("COM7"), "/dev/ttyUSB0");
    assert_eq!(settings.bridge.slave_address, 0x98);
    assert_eq!(settings.bridge.data_byte_order, ByteOrder::Big);
    assert_eq!(settings.bridge.overflow, OverflowPolicy::Bleed);
    // Untouched sections keep their defaults.
    assert_eq!(settings.timeouts.query_timeout_ms, 2000);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = write_config(
        r#"
[timeouts]
query_timeout_ms = 750
"#,
    );

    std::env::set_var("LABWIRE_TIMEOUTS__QUERY_TIMEOUT_MS", "5000");
    std::env::set_var("LABWIRE_APPLICATION__LOG_LEVEL", "debug");
    let result = Settings::load_from(file.path());
    std::env::remove_var("LABWIRE_TIMEOUTS__QUERY_TIMEOUT_MS");
    std::env::remove_var("LABWIRE_APPLICATION__LOG_LEVEL");

    let settings = result.unwrap();
    assert_eq!(settings.timeouts.query_timeout_ms, 5000);
    assert_eq!(settings.application.log_level, "debug");
}

#[test]
#[serial]
fn invalid_values_are_rejected_after_loading() {
    let file = write_config(
        r#"
[bridge]
address_width = 4
"#,
    );
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(err.is_config_error());
    assert!(err.to_string().contains("address_width"));
}

#[test]
#[serial]
fn malformed_file_is_a_load_error() {
    let file = write_config("[network\nport = ");
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(matches!(err, labwire::LabError::ConfigLoad(_)));
}

#[test]
fn rendered_settings_load_back() {
    let mut settings = Settings::default();
    settings.bridge.frequency_hz = 400_000;
    let file = write_config(&settings.to_toml().unwrap());

    let loaded: Settings = toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
    assert_eq!(loaded, settings);
}
