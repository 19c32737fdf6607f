use crate::{
    config::{BackendConfig, DataFormat, IngestorConfig},
    testing::fixture,
};
use std::path::PathBuf;

#[test]
pub fn fixture_passes_preflight() {
    let fixture = fixture("echo 'F1: 1'");

    assert!(!fixture.config.preflight_checks());
    assert_eq!(fixture.config.data["points"].format, DataFormat::Absolute);
    assert_eq!(fixture.config.executor.iteration_threads(), 2);
}

#[test]
pub fn preflight_reports_broken_references() {
    let mut config = fixture("echo 'F1: 1'").config;
    config.programs.get_mut("fake").unwrap().exec = PathBuf::from("/nonexistent/fake");
    assert!(config.preflight_checks());

    let mut config = fixture("echo 'F1: 1'").config;
    config.programs.get_mut("fake").unwrap().ingest = "missing".to_owned();
    assert!(config.preflight_checks());

    let mut config = fixture("echo 'F1: 1'").config;
    config.programs.get_mut("fake").unwrap().max_execution_minutes = Some(0);
    assert!(config.preflight_checks());
}

#[test]
pub fn defaults_and_unknown_fields() {
    let minimal = "repository: /tmp/repository
programs: {}
data: {}
quality_measures: {}
ingest:
  evaluate:
    type: exec
    exec: /usr/bin/evaluate
";
    let config: BackendConfig = serde_yaml::from_str(minimal).unwrap();

    assert_eq!(config.executor.run_threads, 5);
    assert_eq!(config.supervisor.sleep, 5000);
    assert!(!config.supervisor.check_once);
    assert!(matches!(
        config.ingest["evaluate"],
        IngestorConfig::Exec { timeout: 2000, .. }
    ));
    assert!(config.database.is_none());

    let unknown = format!("{minimal}algorithms: {{}}\n");
    assert!(serde_yaml::from_str::<BackendConfig>(&unknown).is_err());
}
