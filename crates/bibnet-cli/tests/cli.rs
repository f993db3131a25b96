//! Integration tests for the bibnet CLI commands.
//!
//! Every test works offline on its own data directory, running in serial to keep log files
//! and stores apart.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::{tempdir, TempDir};

fn bibnet() -> Command { Command::cargo_bin("bibnet").unwrap() }

const STRATEGY: &str = r#"
lens_scholarly:
  main:
    topics:
      - graphene: {name: Graphene, value: {"match": {"title": "graphene"}}}
  secondary:
    topics:
      - australia: {name: Australia, value: {"term": {"country_code": "AU"}}}
  aggregation:
    aggregations:
      - by_year: {name: Per year, value: {"by_year": {"date_histogram": {"field": "date_published"}}}}
"#;

const RECORDS: &str = r#"{"lens_id": "r1", "year_published": 2020, "authors": [{"first_name": "A", "last_name": "B", "affiliations": [{"name": "Alpha", "grid_id": "grid.a"}]}, {"first_name": "C", "last_name": "D", "affiliations": [{"name": "Beta", "grid_id": "grid.b"}]}]}
{"lens_id": "r2", "year_published": 2021, "fields_of_study": ["Physics"], "authors": [{"first_name": "E", "last_name": "F", "affiliations": [{"name": "Alpha", "grid_id": "grid.a"}]}]}
"#;

// Data directory with a settings file for project `pilot`
fn workspace() -> (TempDir, PathBuf) {
  let dir = tempdir().unwrap();
  std::fs::write(dir.path().join("search_strategy.yaml"), STRATEGY).unwrap();
  let settings = format!(
    "project: {{name: pilot, start_year: 2019, end_year: 2021}}\npaths: {{data_dir: {}, strategy: \
     search_strategy.yaml}}\n",
    dir.path().join("data").display()
  );
  let path = dir.path().join("settings.yaml");
  std::fs::write(&path, settings).unwrap();
  (dir, path)
}

fn project_dir(dir: &Path) -> PathBuf { dir.join("data").join("pilot") }

fn write_records(dir: &Path) -> PathBuf {
  let cache = project_dir(dir).join("temp_files").join("lens_scholarly_raw.jsonl");
  std::fs::create_dir_all(cache.parent().unwrap()).unwrap();
  std::fs::write(&cache, RECORDS).unwrap();
  cache
}

#[test]
#[serial]
fn test_check_shows_derived_paths() {
  let (dir, settings) = workspace();

  bibnet()
    .arg("check")
    .arg("--config")
    .arg(&settings)
    .assert()
    .success()
    .stdout(predicate::str::contains("Settings are valid"))
    .stdout(predicate::str::contains("pilot.db"))
    .stdout(predicate::str::contains("lens_scholarly_raw.jsonl"));

  assert!(project_dir(dir.path()).join("logs").exists());
}

#[test]
#[serial]
fn test_invalid_settings_fail() {
  let dir = tempdir().unwrap();
  let settings = dir.path().join("settings.yaml");
  std::fs::write(&settings, "project: {name: '', start_year: 2019}").unwrap();

  bibnet()
    .arg("check")
    .arg("--config")
    .arg(&settings)
    .assert()
    .failure()
    .stderr(predicate::str::contains("project.name"));
}

#[test]
#[serial]
fn test_strategy_lists_entries() {
  let (_dir, settings) = workspace();

  bibnet()
    .arg("strategy")
    .arg("--config")
    .arg(&settings)
    .assert()
    .success()
    .stdout(predicate::str::contains("graphene"))
    .stdout(predicate::str::contains("australia"))
    .stdout(predicate::str::contains("by_year"));
}

#[test]
#[serial]
fn test_build_requires_harvest() {
  let (_dir, settings) = workspace();

  bibnet()
    .arg("build")
    .arg("--config")
    .arg(&settings)
    .assert()
    .failure()
    .stderr(predicate::str::contains("run harvest first"));
}

#[test]
#[serial]
fn test_build_and_clean() -> anyhow::Result<()> {
  let (dir, settings) = workspace();
  let cache = write_records(dir.path());

  bibnet()
    .arg("build")
    .arg("--config")
    .arg(&settings)
    .assert()
    .success()
    .stdout(predicate::str::contains("Wrote 15 tables"));

  let store = project_dir(dir.path()).join("pilot.db");
  assert!(store.exists());
  assert!(project_dir(dir.path()).join("pilot.project.db").exists());

  bibnet()
    .arg("clean")
    .arg("--keep-cache")
    .arg("--config")
    .arg(&settings)
    .arg("--accept-defaults")
    .assert()
    .success()
    .stdout(predicate::str::contains("Project files cleaned"));

  assert!(!store.exists());
  assert!(cache.exists());

  bibnet()
    .arg("clean")
    .arg("--config")
    .arg(&settings)
    .arg("--accept-defaults")
    .assert()
    .success()
    .stdout(predicate::str::contains("Project files cleaned"));

  assert!(!cache.exists());
  dir.close()?;
  Ok(())
}

#[test]
#[serial]
fn test_clean_removes_partial_harvest() {
  let (dir, settings) = workspace();
  let partial = project_dir(dir.path()).join("temp_files").join("lens_scholarly_raw.jsonl.partial");
  std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
  std::fs::write(&partial, RECORDS).unwrap();

  bibnet()
    .arg("clean")
    .arg("--keep-cache")
    .arg("--config")
    .arg(&settings)
    .arg("--accept-defaults")
    .assert()
    .success()
    .stdout(predicate::str::contains("Nothing to clean"));
  assert!(partial.exists());

  bibnet()
    .arg("clean")
    .arg("--config")
    .arg(&settings)
    .arg("--accept-defaults")
    .assert()
    .success()
    .stdout(predicate::str::contains("Project files cleaned"));
  assert!(!partial.exists());
}

#[test]
#[serial]
fn test_normalisation_needs_publication_types() {
  let (_dir, settings) = workspace();
  let mut document = std::fs::read_to_string(&settings).unwrap();
  document.push_str("apis: {search: {apikey: token}}\n");
  std::fs::write(&settings, document).unwrap();

  bibnet()
    .arg("normalisation")
    .arg("--config")
    .arg(&settings)
    .assert()
    .failure()
    .stderr(predicate::str::contains("unification.publication_type"));
}
