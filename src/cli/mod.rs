pub mod classify;
pub mod exclusions;
pub mod groups;
pub mod history;
pub mod import;
pub mod init;
pub mod marks;
pub mod migrate;

use clap::{Parser, Subcommand};
use extrato::models::{Bank, BatchStatus, DocumentScope, DocumentType};
use extrato::settings::load_settings;
use extrato::{Pipeline, Result};

pub(crate) fn open_pipeline() -> Result<Pipeline> {
    Pipeline::open(load_settings())
}

#[derive(Parser)]
#[command(
    name = "extrato",
    about = "Import bank and card exports, deduplicate and classify transactions."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for extrato data (default: ~/Documents/extrato)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Import a CSV, XLSX, OFX, PDF or TXT export.
    Import {
        /// Path to the exported file
        file: String,
        /// Bank that issued the file, when it cannot be detected (e.g. nubank, itau)
        #[arg(long)]
        bank: Option<Bank>,
        /// invoice (card statement) or statement (account statement)
        #[arg(long = "document-type")]
        document_type: Option<DocumentType>,
        /// Confirm without asking
        #[arg(long, short)]
        yes: bool,
    },
    /// List past uploads.
    History {
        /// Only uploads in this state (processing, ready, confirmed, error)
        #[arg(long)]
        status: Option<BatchStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Delete an upload and every transaction it imported.
    DeleteBatch {
        /// Upload (batch) ID
        id: i64,
    },
    /// Classify a transaction by hand.
    Classify {
        /// Transaction ID
        transaction: i64,
        /// Target group (default: the current one)
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        subgroup: Option<String>,
        /// Apply to every installment of the same purchase
        #[arg(long)]
        installments: bool,
        /// Apply to other transactions from the same merchant
        #[arg(long)]
        pattern: bool,
    },
    /// Show what classifying a transaction would propagate to.
    PropagateInfo {
        /// Transaction ID
        transaction: i64,
    },
    /// Move transactions from one group/subgroup to another.
    Migrate {
        #[arg(long = "from-group")]
        from_group: String,
        /// Only this subgroup of the source group (default: all of them)
        #[arg(long = "from-subgroup")]
        from_subgroup: Option<String>,
        #[arg(long = "to-group")]
        to_group: String,
        #[arg(long = "to-subgroup")]
        to_subgroup: Option<String>,
        /// Apply the migration (default: preview only)
        #[arg(long)]
        execute: bool,
    },
    /// Manage exclusion rules.
    Exclusions {
        #[command(subcommand)]
        command: ExclusionCommands,
    },
    /// Manage generic marks (token-based classification).
    Marks {
        #[command(subcommand)]
        command: MarkCommands,
    },
    /// List groups, their derived fields and subgroups.
    Groups,
}

impl Commands {
    pub fn label(&self) -> &'static str {
        match self {
            Commands::Init { .. } => "init",
            Commands::Import { .. } => "import",
            Commands::History { .. } => "history",
            Commands::DeleteBatch { .. } => "delete-batch",
            Commands::Classify { .. } => "classify",
            Commands::PropagateInfo { .. } => "propagate-info",
            Commands::Migrate { .. } => "migrate",
            Commands::Exclusions { .. } => "exclusions",
            Commands::Marks { .. } => "marks",
            Commands::Groups => "groups",
        }
    }
}

#[derive(Subcommand)]
pub enum ExclusionCommands {
    /// Exclude a merchant from future imports.
    Add {
        /// Merchant description as it appears in exports
        merchant: String,
        /// Only for this bank
        #[arg(long)]
        bank: Option<Bank>,
        /// cartao, extrato or ambos
        #[arg(long, default_value = "ambos")]
        scope: DocumentScope,
    },
    /// List exclusion rules.
    List {
        /// Include deactivated rules
        #[arg(long)]
        all: bool,
    },
    /// Deactivate a rule.
    Remove {
        /// Rule ID
        id: i64,
        /// Also delete already-imported transactions the rule matches
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Subcommand)]
pub enum MarkCommands {
    /// Classify every description containing a token.
    Add {
        token: String,
        #[arg(long)]
        group: String,
        #[arg(long)]
        subgroup: Option<String>,
    },
    /// List generic marks.
    List,
}
