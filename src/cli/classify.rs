use colored::Colorize;
use extrato::fmt::{classification_label, money};
use extrato::propagation::ReclassifyRequest;
use extrato::Result;

use super::open_pipeline;

pub fn info(transaction: i64) -> Result<()> {
    let pipeline = open_pipeline()?;
    let txn = pipeline.get_transaction(transaction)?;
    let info = pipeline.propagate_info(transaction)?;

    println!("{}  {}  {}", txn.date, txn.description.bold(), money(txn.amount));
    println!(
        "Currently: {} ({})",
        classification_label(txn.group.as_deref(), txn.subgroup.as_deref()),
        txn.classification_origin
    );
    if info.same_installment_count > 0 {
        println!("Other installments of this purchase: {}", info.same_installment_count);
    }
    println!("Same merchant, not classified by hand: {}", info.same_pattern_count);
    println!("Learned pattern: {}", if info.has_pattern { "yes" } else { "no" });
    Ok(())
}

pub fn run(
    transaction: i64,
    group: Option<String>,
    subgroup: Option<String>,
    installments: bool,
    pattern: bool,
) -> Result<()> {
    let pipeline = open_pipeline()?;
    let outcome = pipeline.update_transaction(&ReclassifyRequest {
        transaction_id: transaction,
        group,
        subgroup,
        propagate_installments: installments,
        propagate_pattern: pattern,
    })?;

    println!(
        "Transaction {} \u{2192} {} [{}{}]",
        outcome.transaction_id,
        classification_label(Some(outcome.group.as_str()), outcome.subgroup.as_deref()).green(),
        outcome.general_category,
        outcome
            .spending_type
            .map(|s| format!(", {s}"))
            .unwrap_or_default()
    );
    if outcome.installments_updated > 0 {
        println!("{} other installments updated", outcome.installments_updated);
    }
    if outcome.pattern_updated > 0 {
        println!("{} transactions from the same merchant updated", outcome.pattern_updated);
    }
    Ok(())
}
