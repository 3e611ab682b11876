use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ExtratoError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// How far apart two installment amounts may be and still belong to
    /// the same purchase (rounding of the first installment).
    #[serde(default = "default_installment_tolerance_cents")]
    pub installment_tolerance_cents: i64,
    /// Statement descriptions that mark a transfer between own accounts.
    #[serde(default = "default_transfer_patterns")]
    pub transfer_patterns: Vec<String>,
    #[serde(default = "default_investment_patterns")]
    pub investment_patterns: Vec<String>,
    /// PIX/TED rows naming the account holder are transfers to self.
    #[serde(default)]
    pub account_holder: Option<String>,
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_session_ttl_hours() -> i64 {
    24
}

fn default_installment_tolerance_cents() -> i64 {
    5
}

fn default_transfer_patterns() -> Vec<String> {
    [
        "TRANSF ENTRE CONTAS",
        "TRANSFERENCIA ENTRE CONTAS",
        "MESMA TITULARIDADE",
        "TRANSFERENCIA PROPRIA",
        "PAGAMENTO DE FATURA",
        "PAGTO FATURA",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_investment_patterns() -> Vec<String> {
    ["APLICACAO", "RESGATE", "CDB", "TESOURO DIRETO", "RENDIMENTO", "POUPANCA"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            user_id: default_user_id(),
            session_ttl_hours: default_session_ttl_hours(),
            installment_tolerance_cents: default_installment_tolerance_cents(),
            transfer_patterns: default_transfer_patterns(),
            investment_patterns: default_investment_patterns(),
            account_holder: None,
        }
    }
}

impl Settings {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours.max(1))
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("extrato.db")
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("extrato")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("extrato")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| ExtratoError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}
