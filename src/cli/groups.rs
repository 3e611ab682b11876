use comfy_table::{Cell, Table};
use extrato::Result;

use super::open_pipeline;

pub fn list() -> Result<()> {
    let pipeline = open_pipeline()?;
    let mut table = Table::new();
    table.set_header(vec!["Group", "Category", "Spending type", "Subgroups"]);
    for group in pipeline.list_groups()? {
        table.add_row(vec![
            Cell::new(&group.name),
            Cell::new(group.general_category),
            Cell::new(group.spending_type.map(|s| s.key()).unwrap_or("-")),
            Cell::new(group.subgroups.join(", ")),
        ]);
    }
    println!("Groups\n{table}");
    Ok(())
}
