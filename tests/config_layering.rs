//! Layered configuration: baseline → local → override deep merge, local
//! bootstrap on first run, and fail-fast diagnostics.

use pv_edge_coordinator::config::{AppConfig, StorageMode, TariffType};

const BASELINE: &str = r#"
inverter:
  vendor: goodwe
  ip_address: 192.168.1.10
  port: 8899
battery_management:
  capacity_kwh: 10.0
coordinator:
  decision_interval_minutes: 15
electricity_tariff:
  tariff_type: flat
  sc_component_pln_kwh: 0.0892
data_storage:
  mode: file
"#;

fn write_layers(dir: &std::path::Path, local: Option<&str>, override_yaml: Option<&str>) {
    std::fs::write(dir.join("baseline.yaml"), BASELINE).unwrap();
    if let Some(local) = local {
        std::fs::write(dir.join("local.yaml"), local).unwrap();
    }
    if let Some(override_yaml) = override_yaml {
        std::fs::write(dir.join("override.yaml"), override_yaml).unwrap();
    }
}

#[test]
fn baseline_only_bootstraps_local_copy() {
    let dir = tempfile::tempdir().unwrap();
    write_layers(dir.path(), None, None);

    let cfg = AppConfig::load_layered(dir.path()).unwrap();
    assert_eq!(cfg.inverter.vendor, "goodwe");
    assert_eq!(cfg.battery_management.capacity_kwh, 10.0);

    let local = std::fs::read_to_string(dir.path().join("local.yaml")).unwrap();
    assert_eq!(local, BASELINE, "local layer is a copy of the baseline");
}

#[test]
fn local_layer_overrides_hardware_specifics() {
    let dir = tempfile::tempdir().unwrap();
    write_layers(
        dir.path(),
        Some(
            r#"
inverter:
  ip_address: 10.0.0.5
battery_management:
  capacity_kwh: 20.0
"#,
        ),
        None,
    );

    let cfg = AppConfig::load_layered(dir.path()).unwrap();
    assert_eq!(cfg.inverter.ip_address, "10.0.0.5");
    assert_eq!(cfg.inverter.port, 8899, "untouched baseline values survive");
    assert_eq!(cfg.battery_management.capacity_kwh, 20.0);
}

#[test]
fn override_layer_wins_over_local() {
    let dir = tempfile::tempdir().unwrap();
    write_layers(
        dir.path(),
        Some("battery_management:\n  capacity_kwh: 20.0\n"),
        Some(
            r#"
battery_management:
  capacity_kwh: 15.0
electricity_tariff:
  tariff_type: g12w
data_storage:
  mode: composite
"#,
        ),
    );

    let cfg = AppConfig::load_layered(dir.path()).unwrap();
    assert_eq!(cfg.battery_management.capacity_kwh, 15.0);
    assert_eq!(cfg.electricity_tariff.tariff_type, TariffType::G12w);
    assert_eq!(cfg.data_storage.mode, StorageMode::Composite);
    // Deep merge keeps sibling keys from earlier layers.
    assert!((cfg.electricity_tariff.sc_component_pln_kwh - 0.0892).abs() < 1e-12);
}

#[test]
fn missing_baseline_is_a_fatal_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load_layered(dir.path()).unwrap_err();
    assert!(err.to_string().contains("baseline"));
}

#[test]
fn invalid_yaml_names_the_offending_file() {
    let dir = tempfile::tempdir().unwrap();
    write_layers(dir.path(), Some("inverter: [not, a, mapping"), None);
    let err = AppConfig::load_layered(dir.path()).unwrap_err();
    assert!(err.to_string().contains("local.yaml"));
}

#[test]
fn g14_without_peak_feed_fails_at_load() {
    let dir = tempfile::tempdir().unwrap();
    write_layers(
        dir.path(),
        None,
        Some("electricity_tariff:\n  tariff_type: g14dynamic\n"),
    );
    let err = AppConfig::load_layered(dir.path()).unwrap_err();
    assert!(err.to_string().contains("pse_peak_hours"));
}
