//! Integration tests for `sqlmend users` commands.

use crate::common::{audit_lines, parse_json, stderr, stdout, TestDatabase, TestProject, USERS_TABLE};

const TOKEN: &str = "user_389lW4wtlXIOAyhORMQoCZg8scc";

/// Three rows for one person: the original tenant admin plus two client
/// rows created by later sign-ins, one of which carries the live token.
fn incident_db() -> TestDatabase {
    let db = TestDatabase::new();
    db.run_sql_ok(USERS_TABLE);
    db.run_sql_ok(&format!(
        "INSERT INTO users (id, email, name, openId, role) VALUES \
         (1, 'owner@legacy.example', 'Dana Owner', NULL, 'tenant_admin'), \
         (19, 'a@b.com', 'Dana', NULL, 'client'), \
         (85, 'a@b.com', 'Dana', '{}', 'client'), \
         (90, 'c@d.com', 'Other', 'user_other', 'client')",
        TOKEN
    ));
    db
}

#[test]
fn test_users_duplicates_reports_shared_email() {
    skip_if_no_db!();
    let db = incident_db();
    let project = TestProject::new(&db);

    let output = project.run_sqlmend_ok(&["users", "duplicates", "--json"]);
    let json = parse_json(&output);
    let groups = json["groups"].as_array().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["field"], "email");
    assert_eq!(groups[0]["value"], "a@b.com");
    assert_eq!(groups[0]["ids"], serde_json::json!([19, 85]));
}

#[test]
fn test_users_show_by_open_id() {
    skip_if_no_db!();
    let db = incident_db();
    let project = TestProject::new(&db);

    let output = project.run_sqlmend_ok(&["users", "show", "--open-id", TOKEN]);
    let out = stdout(&output);
    assert!(out.contains("85"), "{}", out);
    assert!(out.contains("openId"), "{}", out);
    assert!(!out.contains("owner@legacy.example"));
}

#[test]
fn test_users_dedupe_dry_run_changes_nothing() {
    skip_if_no_db!();
    let db = incident_db();
    let project = TestProject::new(&db);

    let output = project.run_sqlmend_ok(&[
        "users", "dedupe", "--email", "a@b.com", "--keep-id", "1", "--open-id", TOKEN, "--dry-run",
    ]);
    assert!(stderr(&output).contains("Dry run"), "{}", stderr(&output));
    assert_eq!(db.query("SELECT COUNT(*) FROM users"), "4");
}

#[test]
fn test_users_dedupe_merges_onto_canonical_row() {
    skip_if_no_db!();
    let db = incident_db();
    let project = TestProject::new(&db);

    let output = project.run_sqlmend_ok(&[
        "users", "dedupe", "--email", "a@b.com", "--keep-id", "1", "--open-id", TOKEN, "--yes",
        "--json", "--audit-log", "audit.jsonl",
    ]);
    let json = parse_json(&output);
    assert_eq!(json["dry_run"], false);
    let checks = json["applied"]["checks"].as_array().unwrap();
    assert!(checks.iter().all(|c| c["passed"] == true));

    assert_eq!(
        db.query("SELECT id, email, openId, role FROM users WHERE email = 'a@b.com'"),
        format!("1\ta@b.com\t{}\ttenant_admin", TOKEN)
    );
    assert_eq!(db.query("SELECT id FROM users ORDER BY id"), "1\n90");

    let events: Vec<String> = audit_lines(&project.path("audit.jsonl"))
        .iter()
        .map(|l| l["event"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(events, vec!["run_start", "repair_planned", "repair_applied", "run_end"]);

    // Second run finds nothing to do.
    let output = project.run_sqlmend_ok(&[
        "users", "dedupe", "--email", "a@b.com", "--keep-id", "1", "--open-id", TOKEN, "--json",
    ]);
    let json = parse_json(&output);
    assert!(json.get("applied").is_none());
}

#[test]
fn test_users_dedupe_without_yes_refuses() {
    skip_if_no_db!();
    let db = incident_db();
    let project = TestProject::new(&db);

    // stdin is not a terminal under the test harness.
    let output = project.run_sqlmend_fails(&["users", "dedupe", "--email", "a@b.com"], 1);
    assert!(stderr(&output).contains("--yes"));
    assert_eq!(db.query("SELECT COUNT(*) FROM users"), "4");
}

#[test]
fn test_users_reassign_refuses_token_held_elsewhere() {
    skip_if_no_db!();
    let db = incident_db();
    let project = TestProject::new(&db);

    let output = project.run_sqlmend_fails(
        &["users", "reassign-openid", "--id", "1", "--open-id", "user_other", "--yes"],
        1,
    );
    assert!(stderr(&output).contains("already held"), "{}", stderr(&output));
    assert_eq!(db.query("SELECT openId FROM users WHERE id = 90"), "user_other");
}

#[test]
fn test_users_set_role() {
    skip_if_no_db!();
    let db = incident_db();
    let project = TestProject::new(&db);

    project.run_sqlmend_ok(&["users", "set-role", "--id", "90", "--role", "staff", "--yes"]);
    assert_eq!(db.query("SELECT role FROM users WHERE id = 90"), "staff");

    // Ambiguous email selector matches two rows.
    let output = project.run_sqlmend_fails(
        &["users", "set-role", "--email", "a@b.com", "--role", "staff", "--yes"],
        1,
    );
    assert!(stderr(&output).contains("2 users match"), "{}", stderr(&output));
}
