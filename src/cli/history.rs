use colored::Colorize;
use comfy_table::{Cell, Table};
use extrato::models::BatchStatus;
use extrato::Result;

use super::open_pipeline;

fn status_label(status: BatchStatus) -> String {
    match status {
        BatchStatus::Confirmed => status.key().green().to_string(),
        BatchStatus::Error => status.key().red().to_string(),
        _ => status.key().yellow().to_string(),
    }
}

pub fn list(status: Option<BatchStatus>, limit: usize, offset: usize) -> Result<()> {
    let pipeline = open_pipeline()?;
    let batches = pipeline.list_history(limit, offset, status)?;
    if batches.is_empty() {
        println!("No uploads yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "File", "Bank", "Type", "Status", "Rows", "Imported", "Dupes", "Excluded", "Unclassified", "Created",
    ]);
    for batch in batches {
        table.add_row(vec![
            Cell::new(batch.id),
            Cell::new(&batch.file_name),
            Cell::new(batch.bank.map(|b| b.name()).unwrap_or("-")),
            Cell::new(batch.document_type.map(|d| d.key()).unwrap_or("-")),
            Cell::new(status_label(batch.status)),
            Cell::new(batch.total_rows),
            Cell::new(batch.imported_count),
            Cell::new(batch.duplicate_count),
            Cell::new(batch.excluded_count),
            Cell::new(batch.classification_stats.unclassified),
            Cell::new(&batch.created_at),
        ]);
        if let Some(reason) = batch.error_reason {
            table.add_row(vec![Cell::new(""), Cell::new(reason.red())]);
        }
    }
    println!("Uploads\n{table}");
    Ok(())
}

pub fn delete(id: i64) -> Result<()> {
    let pipeline = open_pipeline()?;
    let deleted = pipeline.delete_batch(id)?;
    println!("Deleted upload {id} and {deleted} transactions");
    Ok(())
}
