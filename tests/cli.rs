//! Binary-level checks of the shvirt pass-through CLI, driven against
//! scripted stand-ins for atex-virt-helper.

use assert_cmd::Command;
use predicates::prelude::*;

/// A fake helper: reads one request line, prints the canned reply.
fn fake_helper(reply_json: &str) -> String {
    format!("sh -c 'read line; echo \"{}\"'", reply_json.replace('"', "\\\""))
}

#[test]
fn virsh_passes_reply_through_on_success() {
    let helper = fake_helper(r#"{"success": true, "reply": "virsh output here"}"#);
    Command::cargo_bin("atex")
        .unwrap()
        .args(["shvirt", "-e", &helper, "virsh", "list", "--all"])
        .assert()
        .success()
        .stdout("virsh output here");
}

#[test]
fn virsh_failure_exits_nonzero_with_the_reply() {
    let helper = fake_helper(r#"{"success": false, "reply": "no such domain"}"#);
    Command::cargo_bin("atex")
        .unwrap()
        .args(["shvirt", "-e", &helper, "virsh", "destroy", "nope"])
        .assert()
        .code(1)
        .stdout("no such domain");
}

#[test]
fn reservations_are_column_aligned() {
    let helper = fake_helper(
        r#"{"success": true, "domains": {"auto-long-name": "free", "a1": "user@host (pid 4242)"}}"#,
    );
    Command::cargo_bin("atex")
        .unwrap()
        .args(["shvirt", "-e", &helper, "reservations"])
        .assert()
        .success()
        .stdout("a1              user@host (pid 4242)\nauto-long-name  free\n");
}

#[test]
fn dead_helper_is_reported() {
    Command::cargo_bin("atex")
        .unwrap()
        .args(["shvirt", "-e", "sh -c 'exit 3'", "virsh", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("helper").or(predicate::str::contains("response")));
}

#[test]
fn help_names_the_subcommands() {
    Command::cargo_bin("atex")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("shvirt"));
}
