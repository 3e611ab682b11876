use std::io::{BufRead, Write};
use std::path::Path;

use colored::Colorize;
use comfy_table::{Cell, Table};
use extrato::fmt::{classification_label, money};
use extrato::models::{Bank, BatchStatus, DocumentType, SkipReason};
use extrato::session::SessionView;
use extrato::{ExtratoError, Result};

use super::open_pipeline;

fn ask_confirmation() -> Result<bool> {
    print!("Import these transactions? [y/N] ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "sim"))
}

fn skip_label(reason: &SkipReason) -> String {
    match reason {
        SkipReason::Blank => "blank".into(),
        SkipReason::SectionHeader => "header".into(),
        SkipReason::Balance => "balance".into(),
        SkipReason::Unparseable(detail) => format!("unparseable: {detail}"),
    }
}

fn print_preview(view: &SessionView) {
    let Some(metadata) = &view.metadata else {
        return;
    };
    println!(
        "{} {} ({}), {} transactions",
        metadata.bank.name().bold(),
        metadata.document_type,
        metadata.file_kind,
        metadata.total_transactions
    );

    let mut table = Table::new();
    table.set_header(vec!["Date", "Description", "Amount", "Parcela", "Classification", "Origin", ""]);
    for draft in &view.transactions {
        let amount = if draft.amount < 0 {
            money(draft.amount).red().to_string()
        } else {
            money(draft.amount).green().to_string()
        };
        let installment = match (draft.installment_sequence, draft.installment_total) {
            (Some(seq), Some(total)) => format!("{seq}/{total}"),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(draft.date),
            Cell::new(&draft.description),
            Cell::new(amount),
            Cell::new(installment),
            Cell::new(classification_label(draft.group.as_deref(), draft.subgroup.as_deref())),
            Cell::new(draft.classification_origin),
            Cell::new(if draft.is_duplicate { "duplicate" } else { "" }),
        ]);
    }
    println!("{table}");

    let stats = &metadata.classification_stats;
    println!(
        "{} classified, {} unclassified, {} duplicates, {} excluded, {} rows skipped",
        stats.classified(),
        stats.unclassified,
        metadata.duplicate_count,
        metadata.excluded_count,
        metadata.skipped_rows
    );
    for skipped in metadata.skipped.iter().filter(|s| matches!(s.reason, SkipReason::Unparseable(_))) {
        println!("  line {}: {}", skipped.line, skip_label(&skipped.reason).yellow());
    }
}

pub fn run(file: &str, bank: Option<Bank>, document_type: Option<DocumentType>, yes: bool) -> Result<()> {
    let path = Path::new(file);
    let bytes = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.to_string());

    let pipeline = open_pipeline()?;
    let created = pipeline.create_session(bytes, &file_name, bank, document_type)?;
    let view = pipeline.process(created.session_id)?;

    if view.status == BatchStatus::Error {
        return Err(ExtratoError::Other(
            view.error.unwrap_or_else(|| "the file could not be processed".into()),
        ));
    }

    print_preview(&view);
    if view.transactions.iter().all(|d| d.is_duplicate) {
        println!("Nothing new to import.");
    }

    if !yes && !ask_confirmation()? {
        println!("Import cancelled.");
        return Ok(());
    }

    let outcome = pipeline.confirm(created.session_id)?;
    println!(
        "{} imported, {} skipped (duplicates), {} still unclassified",
        outcome.imported_count.to_string().green(),
        outcome.duplicate_count,
        outcome.classification_stats.unclassified
    );
    Ok(())
}
