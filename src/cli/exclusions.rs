use comfy_table::{Cell, Table};
use extrato::models::{Bank, DocumentScope, ExclusionAction};
use extrato::Result;

use super::open_pipeline;

pub fn add(merchant: &str, bank: Option<Bank>, scope: DocumentScope) -> Result<()> {
    let pipeline = open_pipeline()?;
    let rule = pipeline.create_exclusion_rule(merchant, bank, scope, ExclusionAction::Exclude)?;
    println!(
        "Added exclusion rule {}: '{}' ({}, {})",
        rule.id,
        rule.merchant_fingerprint,
        rule.bank.map(|b| b.name()).unwrap_or("any bank"),
        rule.document_scope
    );
    Ok(())
}

pub fn list(all: bool) -> Result<()> {
    let pipeline = open_pipeline()?;
    let rules = pipeline.list_exclusion_rules(all)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Merchant", "Bank", "Scope", "Active"]);
    for rule in rules {
        table.add_row(vec![
            Cell::new(rule.id),
            Cell::new(&rule.merchant_fingerprint),
            Cell::new(rule.bank.map(|b| b.name()).unwrap_or("-")),
            Cell::new(rule.document_scope),
            Cell::new(if rule.is_active { "yes" } else { "no" }),
        ]);
    }
    println!("Exclusion rules\n{table}");
    Ok(())
}

pub fn remove(id: i64, purge: bool) -> Result<()> {
    let pipeline = open_pipeline()?;
    if purge {
        let deleted = pipeline.apply_exclusion_rule(id)?;
        println!("Deleted {deleted} imported transactions matching rule {id}");
    }
    let rule = pipeline.deactivate_exclusion_rule(id)?;
    println!("Deactivated exclusion rule {}: '{}'", rule.id, rule.merchant_fingerprint);
    Ok(())
}
