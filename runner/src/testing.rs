use crate::config::BackendConfig;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// Scratch repository with one fake program `fake` over the data set `points`.
pub struct Fixture {
    pub dir: TempDir,
    pub config: BackendConfig,
}

impl Fixture {
    pub fn repository(&self) -> &Path {
        &self.config.repository
    }

    pub fn write_run(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.config.runs_dir().join(format!("{name}.run"));
        fs::write(&path, contents).unwrap();
        path
    }
}

pub fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// `body` is the shell script of the program, called as `<k> <T> <output>`.
pub fn fixture(body: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let repository = dir.path().join("repository");
    fs::create_dir_all(repository.join("runs")).unwrap();
    fs::create_dir_all(repository.join("results")).unwrap();

    let data = dir.path().join("points.tsv");
    fs::write(&data, "a\t1.0\t2.0\nb\t1.5\t2.5\n").unwrap();
    let program = dir.path().join("fake.sh");
    write_script(&program, body);

    let yaml = format!(
        r#"repository: {repository}
executor:
  threads: 2
  run_threads: 2
supervisor:
  sleep: 50
  scheduler_sleep: 20
  finder_sleep: 20
programs:
  fake:
    exec: {program}
    args: ["%k%", "%T%", "%o%"]
    parameters:
      k: {{ type: integer, min: 1, max: 5, default: 2 }}
      T: {{ type: double, min: 0.0, max: 1.0, default: 0.5 }}
    ingest: stdout
data:
  points:
    path: {data}
quality_measures:
  F1: {{}}
  Runtime: {{ higher_is_better: false }}
ingest:
  stdout:
    type: stdout
"#,
        repository = repository.display(),
        program = program.display(),
        data = data.display(),
    );

    Fixture {
        config: serde_yaml::from_str(&yaml).unwrap(),
        dir,
    }
}

pub const OPTIMIZATION_RUN: &str = "mode: parameter_optimization
programs: [fake]
data: [points]
optimization:
  method: divisive
  criterion: F1
  iterations: 5
  parameters:
    fake: [k]
";

pub const CLUSTERING_RUN: &str = "mode: clustering
programs: [fake]
data: [points]
";
