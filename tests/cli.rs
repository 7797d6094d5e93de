use assert_cmd::Command;
use predicates::prelude::*;

fn cloudctl() -> Command {
    Command::cargo_bin("cloudctl").unwrap()
}

#[test]
fn help_exits_successfully() {
    cloudctl().arg("--help").assert().success();
}

#[test]
fn version_exits_successfully() {
    cloudctl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cloudctl"));
}

#[test]
fn no_args_shows_usage() {
    cloudctl().assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn unknown_subcommand_fails() {
    cloudctl()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn help_lists_every_subcommand() {
    let assert = cloudctl().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    for cmd in [
        "user-create",
        "user-list",
        "project-create",
        "role-add",
        "floating-create",
        "network-create",
        "describe-instances",
        "describe-volumes",
        "describe-security-groups",
    ] {
        assert!(output.contains(cmd), "--help should list '{cmd}', got: {output}");
    }
}

#[test]
fn user_list_reports_unsupported_against_the_fake_directory() {
    // FakeDirectory has no enumeration primitive by design (it mirrors
    // the real LDAP driver's point-lookup-only shape); this should fail
    // with an explanatory message rather than panic.
    cloudctl()
        .arg("user-list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("enumeration"));
}

#[test]
fn user_create_against_the_fake_directory_prints_generated_keys() {
    cloudctl()
        .args(["user-create", "alice", "--admin"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created user"))
        .stdout(predicate::str::contains("access_key"));
}

#[test]
fn project_create_against_the_fake_directory_prints_manager() {
    cloudctl()
        .args(["project-create", "proj1", "--manager", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created project"))
        .stdout(predicate::str::contains("alice"));
}

#[test]
fn network_create_seeds_a_fixed_ip_pool_into_a_temp_state_db() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cloud.db");
    cloudctl()
        .args(["--state", db_path.to_str().unwrap(), "network-create", "net1", "10.0.0.0/29"])
        .assert()
        .success()
        .stdout(predicate::str::contains("seeded 8 fixed ips"));
}

#[test]
fn floating_create_rejects_a_duplicate_address() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cloud.db");
    cloudctl()
        .args(["--state", db_path.to_str().unwrap(), "floating-create", "host-a", "203.0.113.5"])
        .assert()
        .success();
    cloudctl()
        .args(["--state", db_path.to_str().unwrap(), "floating-create", "host-a", "203.0.113.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn describe_instances_on_an_empty_project_prints_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cloud.db");
    cloudctl()
        .args(["--state", db_path.to_str().unwrap(), "describe-instances", "proj1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no instances"));
}

#[test]
fn network_create_rejects_an_oversized_cidr_block() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cloud.db");
    cloudctl()
        .args(["--state", db_path.to_str().unwrap(), "network-create", "net1", "10.0.0.0/8"])
        .assert()
        .failure();
}
