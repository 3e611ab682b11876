use comfy_table::{Cell, Table};
use extrato::fmt::classification_label;
use extrato::Result;

use super::open_pipeline;

pub fn add(token: &str, group: &str, subgroup: Option<&str>) -> Result<()> {
    let pipeline = open_pipeline()?;
    let mark = pipeline.create_generic_mark(token, group, subgroup)?;
    println!(
        "Added mark: '{}' \u{2192} {}",
        mark.token,
        classification_label(Some(mark.group.as_str()), mark.subgroup.as_deref())
    );
    Ok(())
}

pub fn list() -> Result<()> {
    let pipeline = open_pipeline()?;
    let mut table = Table::new();
    table.set_header(vec!["ID", "Token", "Classification"]);
    for mark in pipeline.list_generic_marks()? {
        table.add_row(vec![
            Cell::new(mark.id),
            Cell::new(&mark.token),
            Cell::new(classification_label(Some(mark.group.as_str()), mark.subgroup.as_deref())),
        ]);
    }
    println!("Generic marks\n{table}");
    Ok(())
}
