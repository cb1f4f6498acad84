use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn prints_help() {
    let mut cmd = Command::cargo_bin("batchsim").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch"));
}

#[test]
fn dump_config_roundtrips_the_example() {
    let mut cmd = Command::cargo_bin("batchsim").unwrap();
    cmd.args(["dump-config", "--config", "resources/example_config.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stripy zebra"));
}

#[test]
fn runs_the_example_simulation() {
    let mut cmd = Command::cargo_bin("batchsim").unwrap();
    cmd.args(["run", "--config", "resources/example_config.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("4/4 tasks completed"));
}

#[test]
fn fails_on_missing_config() {
    let mut cmd = Command::cargo_bin("batchsim").unwrap();
    cmd.args(["run", "--config", "no/such/file.toml"]).assert().failure();
}
