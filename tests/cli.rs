#![cfg(unix)]

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const COPY_MANIFEST: &str = r#"
[providers.sources]
files = ["a.cpp", "b.cpp"]
desc = "Translation units"

[tasks.binaries]
depends = ["sources"]
each = "sources"
command = "cp {input} {output}"
default = true
desc = "Build every binary"
"#;

fn project(manifest: &str, files: &[&str]) -> TempDir {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join("mason.toml"), manifest).unwrap();
    for file in files {
        let path = temp.path().join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, *file).unwrap();
    }
    temp
}

fn mason(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("mason").unwrap();
    cmd.current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("MASON_MANIFEST")
        .env_remove("CC")
        .env_remove("CFLAGS")
        .env_remove("LDFLAGS")
        .arg("--no-color");
    cmd
}

#[test]
fn list_shows_providers_and_tasks() {
    let temp = project(COPY_MANIFEST, &[]);

    mason(temp.path())
        .arg("--list")
        .assert()
        .success()
        .stdout(predicate::str::contains("sources"))
        .stdout(predicate::str::contains("binaries"))
        .stdout(predicate::str::contains("(default)"));
}

#[test]
fn list_plain_prints_task_names() {
    let temp = project(COPY_MANIFEST, &[]);

    mason(temp.path())
        .args(["--list", "--format", "plain"])
        .assert()
        .success()
        .stdout("binaries\n");
}

#[test]
fn builds_default_target_then_hits_cache() {
    let temp = project(COPY_MANIFEST, &["a.cpp", "b.cpp"]);

    mason(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("2 recipes run, 0 cached"));
    assert_eq!(fs::read_to_string(temp.path().join("a")).unwrap(), "a.cpp");
    assert_eq!(fs::read_to_string(temp.path().join("b")).unwrap(), "b.cpp");

    mason(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("0 recipes run, 2 cached"));
}

#[test]
fn deleted_source_fails_only_its_recipe() {
    let temp = project(COPY_MANIFEST, &["a.cpp", "b.cpp"]);
    mason(temp.path()).assert().success();
    let a_mtime = fs::metadata(temp.path().join("a")).unwrap().modified().unwrap();

    fs::remove_file(temp.path().join("b.cpp")).unwrap();

    mason(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("b.cpp"))
        .stderr(predicate::str::contains("exit code"));
    assert_eq!(
        fs::metadata(temp.path().join("a")).unwrap().modified().unwrap(),
        a_mtime
    );
}

#[test]
fn force_rebuilds_fresh_outputs() {
    let temp = project(COPY_MANIFEST, &["a.cpp", "b.cpp"]);
    mason(temp.path()).assert().success();

    mason(temp.path())
        .arg("--force")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 recipes run, 0 cached"));
}

#[test]
fn dry_run_creates_nothing() {
    let temp = project(COPY_MANIFEST, &["a.cpp", "b.cpp"]);

    mason(temp.path())
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Execution plan"))
        .stdout(predicate::str::contains("cp"));
    assert!(!temp.path().join("a").exists());
}

#[test]
fn compile_db_written_without_building() {
    let manifest = r#"
[env]
CC = "clang++"
CFLAGS = ["-g", "-Iinclude"]

[providers.sources]
files = ["a.cpp"]

[tasks.binaries]
depends = ["sources"]
each = "sources"
command = "{CC} {CFLAGS} {input} -o {output}"
default = true
"#;
    let temp = project(manifest, &["a.cpp"]);

    mason(temp.path()).arg("--compile-db").assert().success();

    let db: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("compile_commands.json")).unwrap())
            .unwrap();
    let entry = &db[0];
    assert_eq!(entry["arguments"][0], "clang++");
    assert_eq!(entry["arguments"][1], "-g");
    assert!(entry["file"].as_str().unwrap().ends_with("a.cpp"));
    assert!(!temp.path().join("a").exists());
}

#[test]
fn compile_db_lists_every_recipe() {
    let manifest = r#"
[providers.test_sources]
files = ["test/a.cpp", "test/b.cpp"]

[tasks.tests]
depends = ["test_sources"]
each = "test_sources"
command = "cp {input} {output}"

[tasks.run_tests]
depends = ["tests"]
each = "tests"
command = "{input}"

[tasks.submodules]
run = "touch submodules.stamp"

[tasks.all]
depends = ["submodules", "run_tests"]
default = true
"#;
    let temp = project(manifest, &["test/a.cpp", "test/b.cpp"]);

    mason(temp.path())
        .arg("--compile-db")
        .assert()
        .success()
        .stdout(predicate::str::contains("(5 entries)"));

    let db: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("compile_commands.json")).unwrap())
            .unwrap();
    let entries = db.as_array().unwrap();
    assert_eq!(entries.len(), 5);
    assert!(entries
        .iter()
        .any(|e| e["arguments"][0] == "touch" && e["arguments"][1] == "submodules.stamp"));
    assert!(!temp.path().join("submodules.stamp").exists());
    assert!(!temp.path().join("test/a").exists());
}

#[test]
fn cycle_is_reported_before_anything_runs() {
    let manifest = r#"
[tasks.a]
depends = ["b"]
run = "touch ran-a"

[tasks.b]
depends = ["a"]
run = "touch ran-b"
"#;
    let temp = project(manifest, &[]);

    mason(temp.path())
        .arg("a")
        .assert()
        .failure()
        .stderr(predicate::str::contains("a -> b -> a"));
    assert!(!temp.path().join("ran-a").exists());
    assert!(!temp.path().join("ran-b").exists());

    mason(temp.path()).arg("--check").assert().failure();
}

#[test]
fn missing_default_target() {
    let manifest = r#"
[tasks.tests]
run = "true"
"#;
    let temp = project(manifest, &[]);

    mason(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("No default target"));

    mason(temp.path()).arg("tests").assert().success();
}

#[test]
fn unknown_target() {
    let temp = project(COPY_MANIFEST, &[]);

    mason(temp.path())
        .arg("deploy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("'deploy' not found"));
}

#[test]
fn check_reports_valid_manifest() {
    let temp = project(COPY_MANIFEST, &[]);

    mason(temp.path())
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid (1 providers, 1 tasks"));
}

#[test]
fn graph_as_dot() {
    let temp = project(COPY_MANIFEST, &[]);

    mason(temp.path())
        .arg("--graph=dot")
        .assert()
        .success()
        .stdout(predicate::str::contains("digraph mason"))
        .stdout(predicate::str::contains("\"sources\" -> \"binaries\";"));
}

#[test]
fn discovered_sources_include_fetched_files() {
    let manifest = r#"
[providers.lab_sources]
glob = "lab/*.cpp"

[tasks.fetch]
run = "sh -c 'mkdir -p lab && echo lex > lab/lex.cpp'"
keep = false

[tasks.labs]
depends = ["fetch"]
discover = ["lab_sources"]
each = "lab_sources"
command = "cp {input} {output}"
default = true
"#;
    let temp = project(manifest, &[]);

    mason(temp.path()).assert().success();
    assert_eq!(fs::read_to_string(temp.path().join("lab/lex")).unwrap(), "lex\n");
}

#[test]
fn independent_branch_survives_failure() {
    let manifest = r#"
[tasks.broken]
run = "false"

[tasks.fine]
run = "touch fine.stamp"

[tasks.all]
depends = ["broken", "fine"]
default = true
"#;
    let temp = project(manifest, &[]);

    mason(temp.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 succeeded, 1 failed, 1 skipped"))
        .stderr(predicate::str::contains("Recipe 'broken' failed"));
    assert!(temp.path().join("fine.stamp").exists());
}

#[test]
fn manifest_found_from_subdirectory() {
    let temp = project(COPY_MANIFEST, &[]);
    let nested = temp.path().join("test/unit");
    fs::create_dir_all(&nested).unwrap();

    mason(&nested)
        .args(["--list", "--format", "plain"])
        .assert()
        .success()
        .stdout("binaries\n");
}

#[test]
fn invalid_manifest_is_rejected() {
    let manifest = r#"
[tasks.bad]
run = "{CXX} main.cpp"
"#;
    let temp = project(manifest, &[]);

    mason(temp.path())
        .arg("--check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid task 'bad'"));
}
