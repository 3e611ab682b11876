use std::path::PathBuf;

use extrato::db::{get_connection, init_db};
use extrato::settings::{load_settings, save_settings, shellexpand_path};
use extrato::Result;

pub fn run(data_dir: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
    }

    let dir = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&dir)?;
    let conn = get_connection(&settings.db_path())?;
    init_db(&conn)?;
    save_settings(&settings)?;

    println!("Data directory: {}", dir.display());
    println!("Database:       {}", settings.db_path().display());
    println!("User:           {}", settings.user_id);
    Ok(())
}
