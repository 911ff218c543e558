//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = cargo_bin_cmd!("rpi-provisioner");
    cmd.arg("--help");
    cmd.assert().success().stdout(
        predicate::str::contains("boot")
            .and(predicate::str::contains("layer1"))
            .and(predicate::str::contains("layer2"))
            .and(predicate::str::contains("network"))
            .and(predicate::str::contains("authorized-keys"))
            .and(predicate::str::contains("find")),
    );
}

#[test]
fn no_arguments_prints_usage_and_fails() {
    let mut cmd = cargo_bin_cmd!("rpi-provisioner");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn boot_rejects_a_directory_without_cmdline() {
    let tmp = TempDir::new().expect("create temp dir");
    let mut cmd = cargo_bin_cmd!("rpi-provisioner");
    cmd.arg("boot").arg(tmp.path());
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cmdline.txt does not exist"));
}

#[test]
fn boot_prepares_a_partition() {
    let tmp = TempDir::new().expect("create temp dir");
    std::fs::write(tmp.path().join("cmdline.txt"), "console=tty1 rootwait\n")
        .expect("seed cmdline.txt");

    let mut cmd = cargo_bin_cmd!("rpi-provisioner");
    cmd.arg("boot")
        .arg(tmp.path())
        .args(["--hostname", "rpi-garage"])
        .env("NO_COLOR", "1");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Enabling ssh... OK"));

    assert!(tmp.path().join("ssh").is_file());
    assert!(tmp.path().join("firstrun.sh").is_file());
}

#[test]
fn layer1_requires_a_deployer() {
    let mut cmd = cargo_bin_cmd!("rpi-provisioner");
    cmd.args(["layer1", "--host", "10.0.0.12", "--keys-uri", "keys.json"])
        .env("RPI_PROVISIONER_LOGIN_PASSWORD", "raspberry")
        .env("RPI_PROVISIONER_DEPLOYER_PASSWORD", "secret");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--deployer-user"));
}
