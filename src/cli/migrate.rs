use colored::Colorize;
use extrato::fmt::classification_label;
use extrato::migration::MigrationRequest;
use extrato::Result;

use super::open_pipeline;

pub fn run(
    from_group: String,
    from_subgroup: Option<String>,
    to_group: String,
    to_subgroup: Option<String>,
    execute: bool,
) -> Result<()> {
    let pipeline = open_pipeline()?;
    let request = MigrationRequest {
        source_group: from_group,
        source_subgroup: from_subgroup,
        target_group: to_group,
        target_subgroup: to_subgroup,
    };

    let preview = pipeline.migration_preview(&request)?;
    let source = match &request.source_subgroup {
        Some(sub) => classification_label(Some(request.source_group.as_str()), Some(sub.as_str())),
        None => format!("{} (all subgroups)", request.source_group),
    };
    let target = classification_label(Some(preview.target_group.as_str()), preview.target_subgroup.as_deref());
    println!(
        "{} transactions: {} \u{2192} {} [{}{}]",
        preview.affected_count,
        source,
        target.bold(),
        preview.derived_general_category,
        preview
            .derived_spending_type
            .map(|s| format!(", {s}"))
            .unwrap_or_default()
    );

    if !execute {
        println!("Preview only; run again with --execute to apply.");
        return Ok(());
    }

    let outcome = pipeline.migration_execute(&request)?;
    println!(
        "{} transactions moved, {} patterns and {} marks remapped",
        outcome.updated_count.to_string().green(),
        outcome.patterns_remapped,
        outcome.marks_remapped
    );
    if !outcome.groups_to_recalculate.is_empty() {
        println!("Groups to recalculate: {}", outcome.groups_to_recalculate.join(", "));
    }
    Ok(())
}
