use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

const INVOICE: &str = "date,title,amount
2025-01-02,Padaria Pão Quente,12.50
2025-01-03,Uber *Trip,23.90
2025-01-05,Magazine Luiza - Parcela 1/3,100.00
2025-02-05,Magazine Luiza - Parcela 2/3,100.00
2025-03-05,Magazine Luiza - Parcela 3/3,100.00
2025-01-11,Pagamento recebido,-900.00
";

fn extrato(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("extrato").unwrap();
    cmd.env("HOME", home).env("NO_COLOR", "1").env_remove("EXTRATO_LOG");
    cmd
}

fn initialized() -> tempfile::TempDir {
    let home = tempfile::tempdir().unwrap();
    let data_dir = home.path().join("data");
    extrato(home.path())
        .args(["init", "--data-dir", data_dir.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("extrato.db"));
    home
}

fn write_file(home: &Path, name: &str, content: &[u8]) -> String {
    let path = home.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("extrato")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("migrate"));
}

#[test]
fn test_groups_are_seeded() {
    let home = initialized();
    extrato(home.path())
        .arg("groups")
        .assert()
        .success()
        .stdout(predicate::str::contains("Food"))
        .stdout(predicate::str::contains("Groceries"));
}

#[test]
fn test_import_then_reimport() {
    let home = initialized();
    let file = write_file(home.path(), "nubank.csv", INVOICE.as_bytes());

    extrato(home.path())
        .args(["import", &file, "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nubank"))
        .stdout(predicate::str::contains("6 imported"));

    extrato(home.path())
        .args(["import", &file, "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 imported, 6 skipped"));

    extrato(home.path())
        .args(["history", "--status", "confirmed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nubank.csv"));
}

#[test]
fn test_exclusion_rule_applies_on_import() {
    let home = initialized();
    extrato(home.path())
        .args(["exclusions", "add", "Pagamento recebido", "--scope", "cartao"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PAGAMENTO RECEBIDO"));

    let file = write_file(home.path(), "nubank.csv", INVOICE.as_bytes());
    extrato(home.path())
        .args(["import", &file, "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 excluded"))
        .stdout(predicate::str::contains("5 imported"));
}

#[test]
fn test_undetectable_bank_fails() {
    let home = initialized();
    let file = write_file(home.path(), "export.csv", b"Data;Historico;Valor\n02/01/2025;Padaria;-12,50\n");
    extrato(home.path())
        .args(["import", &file, "--yes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not detect the bank"));

    extrato(home.path())
        .args(["import", &file, "--yes", "--bank", "bradesco", "--document-type", "statement"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 imported"));
}

#[test]
fn test_migration_preview_does_not_write() {
    let home = initialized();
    extrato(home.path())
        .args(["migrate", "--from-group", "Food", "--to-group", "Leisure", "--to-subgroup", "Travel"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 transactions"))
        .stdout(predicate::str::contains("Preview only"));

    extrato(home.path())
        .args(["migrate", "--from-group", "Food", "--to-group", "Nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown group"));
}

#[test]
fn test_marks_round_trip_through_cli() {
    let home = initialized();
    extrato(home.path())
        .args(["marks", "add", "uber", "--group", "transport", "--subgroup", "ride-hailing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Transport / Ride-hailing"));
    extrato(home.path())
        .args(["marks", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("UBER"));
}

#[test]
fn test_unknown_transaction() {
    let home = initialized();
    extrato(home.path())
        .args(["propagate-info", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown transaction"));
}
