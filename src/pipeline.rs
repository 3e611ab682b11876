//! The ingestion pipeline and the operations its callers use: upload
//! sessions, preview, confirm, history, reclassification, migration and
//! rule management.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batches::{self, ConfirmOutcome, PreviewCounts};
use crate::classifier::{self, ClassificationEngine};
use crate::db::{self, get_connection, init_db};
use crate::detector::{detect, load_source};
use crate::error::{ExtratoError, Result};
use crate::exclusion::{self, ExclusionFilter, NewExclusionRule};
use crate::extractor::extractor_for;
use crate::identity::{assign_identity_hashes, mark_duplicates};
use crate::installments::{load_members, InstallmentLinker};
use crate::migration::{self, MigrationOutcome, MigrationPreview, MigrationRequest};
use crate::models::{
    Bank, BatchStatus, ClassificationStats, DocumentScope, DocumentType, ExclusionAction, ExclusionRule, GenericMark,
    GroupConfig, Transaction, TransactionDraft, UploadBatch,
};
use crate::normalizer::normalizer_for;
use crate::propagation::{self, PropagateInfo, ReclassifyOutcome, ReclassifyRequest};
use crate::scopes::WriteScopes;
use crate::session::{NewSession, ProcessMetadata, Session, SessionStore, SessionView};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: Uuid,
    pub batch_id: i64,
    pub status: BatchStatus,
}

/// Failures that end a session in `error` instead of surfacing to the caller.
fn is_session_fatal(err: &ExtratoError) -> bool {
    matches!(err, ExtratoError::UnsupportedFormat(_) | ExtratoError::BankNotDetected)
}

pub struct Pipeline {
    db_path: PathBuf,
    settings: Settings,
    sessions: SessionStore,
    scopes: WriteScopes,
}

impl Pipeline {
    /// Opens (and initializes) the database at `db_path`.
    pub fn new(db_path: impl AsRef<Path>, settings: Settings) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = get_connection(&db_path)?;
        init_db(&conn)?;
        Ok(Self {
            sessions: SessionStore::new(settings.session_ttl()),
            db_path,
            settings,
            scopes: WriteScopes::new(),
        })
    }

    pub fn open(settings: Settings) -> Result<Self> {
        std::fs::create_dir_all(&settings.data_dir)?;
        Self::new(settings.db_path(), settings)
    }

    fn user_id(&self) -> &str {
        &self.settings.user_id
    }

    fn connection(&self) -> Result<Connection> {
        get_connection(&self.db_path)
    }

    // -----------------------------------------------------------------------
    // Upload sessions
    // -----------------------------------------------------------------------

    /// Stores the file and opens its batch. Nothing is parsed yet.
    pub fn create_session(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        bank_hint: Option<Bank>,
        document_type_hint: Option<DocumentType>,
    ) -> Result<SessionCreated> {
        let session_id = Uuid::new_v4();
        let conn = self.connection()?;
        let batch_id = batches::create_batch(&conn, &session_id.to_string(), self.user_id(), file_name)?;
        let size = bytes.len();
        self.sessions.insert(
            session_id,
            NewSession {
                user_id: self.user_id().to_string(),
                batch_id,
                file_name: file_name.to_string(),
                bank_hint,
                document_type_hint,
                bytes,
            },
            Utc::now(),
        );
        info!(batch_id, file_name, size, "upload session created");
        Ok(SessionCreated {
            session_id,
            batch_id,
            status: BatchStatus::Processing,
        })
    }

    /// Runs detection through classification and leaves the preview in the
    /// session. Unreadable files and undetectable banks end the session in
    /// `error`; the returned view carries the reason.
    pub fn process(&self, session_id: Uuid) -> Result<SessionView> {
        let handle = self.sessions.get(session_id, Utc::now())?;
        let mut session = handle.lock().unwrap_or_else(|e| e.into_inner());
        session.begin_processing()?;
        let conn = self.connection()?;

        match self.run(&conn, &session) {
            Ok((drafts, metadata)) => {
                batches::mark_ready(
                    &conn,
                    session.batch_id,
                    &PreviewCounts {
                        bank: metadata.bank,
                        document_type: metadata.document_type,
                        total_rows: metadata.total_rows,
                        duplicate_count: metadata.duplicate_count,
                        excluded_count: metadata.excluded_count,
                        skipped_count: metadata.skipped_rows,
                        classification_stats: metadata.classification_stats,
                    },
                )?;
                session.mark_ready(drafts, metadata)?;
            }
            Err(err) if is_session_fatal(&err) => {
                let reason = err.to_string();
                warn!(batch_id = session.batch_id, %reason, "upload failed");
                batches::mark_error(&conn, session.batch_id, &reason)?;
                session.mark_error(reason)?;
            }
            Err(err) => return Err(err),
        }
        Ok(session.view())
    }

    fn run(&self, conn: &Connection, session: &Session) -> Result<(Vec<TransactionDraft>, ProcessMetadata)> {
        let user_id = session.user_id.as_str();

        let source = load_source(session.raw()?, &session.extension)?;
        let format = detect(&source, session.bank_hint, session.document_type_hint)?;
        info!(
            bank = %format.bank,
            document_type = %format.document_type,
            file_kind = %format.file_kind,
            from_signature = format.bank_from_signature,
            "format detected"
        );

        let normalized = normalizer_for(format.file_kind).normalize(&source, &format)?;
        let total_rows = normalized.rows.len() + normalized.skipped.len();
        let extraction =
            extractor_for(format.document_type, &self.settings).extract(&normalized.rows, format.bank, format.document_type);
        let mut skipped = normalized.skipped;
        skipped.extend(extraction.skipped);
        skipped.sort_by_key(|s| s.line);
        debug!(drafts = extraction.drafts.len(), skipped = skipped.len(), "rows extracted");

        let (mut drafts, excluded_count) = ExclusionFilter::load(conn, user_id)?.apply(extraction.drafts);
        assign_identity_hashes(user_id, &mut drafts);
        let duplicate_count = mark_duplicates(conn, user_id, &mut drafts)?;

        let linker = InstallmentLinker::from_settings(&self.settings);
        let members = load_members(conn, user_id, &drafts)?;
        linker.link(&mut drafts, &members);
        ClassificationEngine::load(conn, user_id, &drafts)?.classify(&mut drafts);
        let installment_continuity_copied = linker.harmonize(&mut drafts);
        let classification_stats = ClassificationStats::from_drafts(&drafts);

        info!(
            transactions = drafts.len(),
            excluded_count,
            duplicate_count,
            unclassified = classification_stats.unclassified,
            "upload processed"
        );
        let metadata = ProcessMetadata {
            bank: format.bank,
            document_type: format.document_type,
            file_kind: format.file_kind,
            total_transactions: drafts.len(),
            total_rows,
            skipped_rows: skipped.len(),
            skipped,
            excluded_count,
            duplicate_count,
            installment_continuity_copied,
            classification_stats,
        };
        Ok((drafts, metadata))
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<SessionView> {
        let handle = self.sessions.get(session_id, Utc::now())?;
        let session = handle.lock().unwrap_or_else(|e| e.into_inner());
        Ok(session.view())
    }

    /// Persists a ready session's preview. A session confirms once.
    pub fn confirm(&self, session_id: Uuid) -> Result<ConfirmOutcome> {
        let handle = self.sessions.get(session_id, Utc::now())?;
        let mut session = handle.lock().unwrap_or_else(|e| e.into_inner());
        session.ensure_confirmable()?;
        let mut conn = self.connection()?;
        let outcome = batches::confirm_batch(&mut conn, &session.user_id, session.batch_id, &session.drafts)?;
        session.mark_confirmed()?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn list_history(&self, limit: usize, offset: usize, status: Option<BatchStatus>) -> Result<Vec<UploadBatch>> {
        batches::list_history(&self.connection()?, self.user_id(), limit, offset, status)
    }

    pub fn get_batch(&self, batch_id: i64) -> Result<UploadBatch> {
        batches::get_batch(&self.connection()?, self.user_id(), batch_id)?.ok_or(ExtratoError::UnknownBatch(batch_id))
    }

    pub fn batch_transactions(&self, batch_id: i64) -> Result<Vec<Transaction>> {
        batches::list_batch_transactions(&self.connection()?, self.user_id(), batch_id)
    }

    pub fn delete_batch(&self, batch_id: i64) -> Result<usize> {
        batches::delete_batch(&mut self.connection()?, self.user_id(), batch_id)
    }

    // -----------------------------------------------------------------------
    // Reclassification
    // -----------------------------------------------------------------------

    pub fn get_transaction(&self, transaction_id: i64) -> Result<Transaction> {
        batches::get_transaction(&self.connection()?, self.user_id(), transaction_id)?
            .ok_or(ExtratoError::UnknownTransaction(transaction_id))
    }

    pub fn propagate_info(&self, transaction_id: i64) -> Result<PropagateInfo> {
        propagation::propagate_info(&self.connection()?, self.user_id(), transaction_id)
    }

    pub fn update_transaction(&self, request: &ReclassifyRequest) -> Result<ReclassifyOutcome> {
        propagation::update_transaction(&mut self.connection()?, &self.scopes, self.user_id(), request)
    }

    pub fn migration_preview(&self, request: &MigrationRequest) -> Result<MigrationPreview> {
        migration::preview(&self.connection()?, self.user_id(), request)
    }

    pub fn migration_execute(&self, request: &MigrationRequest) -> Result<MigrationOutcome> {
        migration::execute(&mut self.connection()?, &self.scopes, self.user_id(), request)
    }

    // -----------------------------------------------------------------------
    // Rules, marks and groups
    // -----------------------------------------------------------------------

    pub fn create_exclusion_rule(
        &self,
        merchant: &str,
        bank: Option<Bank>,
        document_scope: DocumentScope,
        action: ExclusionAction,
    ) -> Result<ExclusionRule> {
        exclusion::create_exclusion_rule(
            &self.connection()?,
            &NewExclusionRule {
                user_id: self.user_id().to_string(),
                merchant_fingerprint: merchant.to_string(),
                bank,
                document_scope,
                action,
            },
        )
    }

    pub fn list_exclusion_rules(&self, include_inactive: bool) -> Result<Vec<ExclusionRule>> {
        exclusion::list_exclusion_rules(&self.connection()?, self.user_id(), include_inactive)
    }

    pub fn deactivate_exclusion_rule(&self, rule_id: i64) -> Result<ExclusionRule> {
        exclusion::deactivate_exclusion_rule(&self.connection()?, self.user_id(), rule_id)
    }

    /// Deletes already-persisted transactions a rule matches.
    pub fn apply_exclusion_rule(&self, rule_id: i64) -> Result<usize> {
        exclusion::apply_rule_to_existing(&mut self.connection()?, self.user_id(), rule_id)
    }

    pub fn create_generic_mark(&self, token: &str, group: &str, subgroup: Option<&str>) -> Result<GenericMark> {
        classifier::create_generic_mark(&self.connection()?, self.user_id(), token, group, subgroup)
    }

    pub fn list_generic_marks(&self) -> Result<Vec<GenericMark>> {
        classifier::list_generic_marks(&self.connection()?, self.user_id())
    }

    pub fn list_groups(&self) -> Result<Vec<GroupConfig>> {
        db::list_groups(&self.connection()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClassificationOrigin;
    use crate::scopes::{Mode, Scope};

    const INVOICE: &str = "date,title,amount
2025-01-02,Padaria Pão Quente,12.50
2025-01-03,Uber *Trip,23.90
2025-01-05,Magazine Luiza - Parcela 1/3,100.00
2025-02-05,Magazine Luiza - Parcela 2/3,100.00
2025-03-05,Magazine Luiza - Parcela 3/3,100.00
2025-01-06,Netflix.com,39.90
2025-01-07,Ifood *Restaurante,45.00
2025-01-08,Drogasil,60.15
2025-01-09,Posto Shell,200.00
2025-01-10,Mercado Extra,310.42
2025-01-11,Pagamento recebido,-900.00
2025-01-12,Spotify,21.90
";

    fn pipeline() -> (tempfile::TempDir, Pipeline) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..Settings::default()
        };
        let pipeline = Pipeline::open(settings).unwrap();
        (dir, pipeline)
    }

    fn upload(pipeline: &Pipeline, content: &str, name: &str) -> (Uuid, SessionView) {
        let created = pipeline.create_session(content.as_bytes().to_vec(), name, None, None).unwrap();
        assert_eq!(created.status, BatchStatus::Processing);
        let view = pipeline.process(created.session_id).unwrap();
        (created.session_id, view)
    }

    fn seed_rules(pipeline: &Pipeline) {
        pipeline
            .create_exclusion_rule("Pagamento recebido", None, DocumentScope::Card, ExclusionAction::Exclude)
            .unwrap();
        let conn = pipeline.connection().unwrap();
        classifier::upsert_pattern(&conn, "local", "UBER TRIP", "Transport", Some("Ride-hailing"), None).unwrap();
        classifier::upsert_pattern(&conn, "local", "MAGAZINE LUIZA", "Shopping", Some("Electronics"), None).unwrap();
    }

    #[test]
    fn test_twelve_row_invoice_scenario() {
        let (_dir, pipeline) = pipeline();
        seed_rules(&pipeline);
        let (_, view) = upload(&pipeline, INVOICE, "Nubank_2025-01.csv");

        assert_eq!(view.status, BatchStatus::Ready);
        let metadata = view.metadata.unwrap();
        assert_eq!(metadata.bank, Bank::Nubank);
        assert_eq!(metadata.document_type, DocumentType::Invoice);
        assert_eq!(metadata.total_transactions, 11);
        assert_eq!(view.transactions.len(), 11);
        assert_eq!(metadata.excluded_count, 1);
        assert_eq!(metadata.duplicate_count, 0);

        let stats = metadata.classification_stats;
        assert_eq!(stats.historical_pattern, 2);
        assert_eq!(stats.installment_continuity, 2);
        assert_eq!(stats.unclassified, 7);

        let magalu: Vec<&TransactionDraft> =
            view.transactions.iter().filter(|d| d.fingerprint == "MAGAZINE LUIZA").collect();
        assert_eq!(magalu.len(), 3);
        assert!(magalu.iter().all(|d| d.installment_key == magalu[0].installment_key && d.installment_key.is_some()));
        assert!(magalu.iter().all(|d| d.subgroup.as_deref() == Some("Electronics")));
    }

    #[test]
    fn test_reimport_is_idempotent() {
        let (_dir, pipeline) = pipeline();
        seed_rules(&pipeline);
        let (first, _) = upload(&pipeline, INVOICE, "a.csv");
        let outcome = pipeline.confirm(first).unwrap();
        assert_eq!(outcome.imported_count, 11);

        let (second, view) = upload(&pipeline, INVOICE, "a.csv");
        assert_eq!(view.metadata.unwrap().duplicate_count, 11);
        let outcome = pipeline.confirm(second).unwrap();
        assert_eq!((outcome.imported_count, outcome.duplicate_count), (0, 11));

        let history = pipeline.list_history(10, 0, Some(BatchStatus::Confirmed)).unwrap();
        assert_eq!(history.len(), 2);
        let total: usize = history.iter().map(|b| pipeline.batch_transactions(b.id).unwrap().len()).sum();
        assert_eq!(total, 11);
    }

    #[test]
    fn test_confirm_twice_fails() {
        let (_dir, pipeline) = pipeline();
        let (id, _) = upload(&pipeline, INVOICE, "a.csv");
        pipeline.confirm(id).unwrap();
        assert!(matches!(pipeline.confirm(id), Err(ExtratoError::InvalidState { .. })));
        assert_eq!(pipeline.get_session(id).unwrap().status, BatchStatus::Confirmed);
    }

    #[test]
    fn test_undetectable_bank_ends_in_error() {
        let (_dir, pipeline) = pipeline();
        let (id, view) = upload(&pipeline, "Data;Histórico;Valor\n02/01/2025;Padaria;-12,50\n", "export.csv");
        assert_eq!(view.status, BatchStatus::Error);
        assert!(view.error.is_some());
        assert!(matches!(pipeline.confirm(id), Err(ExtratoError::InvalidState { .. })));
        let batch = pipeline.get_batch(view.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Error);

        // With a hint the same layout is readable.
        let created = pipeline
            .create_session(
                b"Data;Hist\xf3rico;Valor\n02/01/2025;Padaria;-12,50\n".to_vec(),
                "export.csv",
                Some(Bank::Bradesco),
                Some(DocumentType::Statement),
            )
            .unwrap();
        let view = pipeline.process(created.session_id).unwrap();
        assert_eq!(view.status, BatchStatus::Ready);
        assert_eq!(view.transactions[0].amount, -1250);
        assert_eq!(view.transactions[0].description, "Padaria");
    }

    #[test]
    fn test_unknown_and_expired_sessions() {
        let (_dir, pipeline) = pipeline();
        assert!(matches!(pipeline.get_session(Uuid::new_v4()), Err(ExtratoError::SessionNotFound)));
        let created = pipeline.create_session(INVOICE.as_bytes().to_vec(), "a.csv", None, None).unwrap();
        pipeline.sessions.sweep(Utc::now() + chrono::Duration::hours(25));
        assert!(matches!(pipeline.process(created.session_id), Err(ExtratoError::SessionExpired)));
    }

    #[test]
    fn test_installment_propagation_after_import() {
        let (_dir, pipeline) = pipeline();
        let (id, view) = upload(&pipeline, INVOICE, "a.csv");
        pipeline.confirm(id).unwrap();
        let txns = pipeline.batch_transactions(view.batch_id).unwrap();
        let magalu: Vec<&Transaction> = txns.iter().filter(|t| t.fingerprint == "MAGAZINE LUIZA").collect();
        let first = magalu.iter().find(|t| t.installment_sequence == Some(1)).unwrap();

        assert_eq!(pipeline.propagate_info(first.id).unwrap().same_installment_count, 2);
        pipeline
            .update_transaction(&ReclassifyRequest {
                transaction_id: first.id,
                group: Some("Shopping".into()),
                subgroup: Some("Online".into()),
                propagate_installments: true,
                propagate_pattern: false,
            })
            .unwrap();

        for t in &magalu {
            let t = pipeline.get_transaction(t.id).unwrap();
            assert_eq!(t.group.as_deref(), Some("Shopping"));
            assert_eq!(t.subgroup.as_deref(), Some("Online"));
            let expected = if t.id == first.id {
                ClassificationOrigin::Manual
            } else {
                ClassificationOrigin::InstallmentContinuity
            };
            assert_eq!(t.classification_origin, expected);
        }
    }

    #[test]
    fn test_delete_batch_cascades() {
        let (_dir, pipeline) = pipeline();
        let (id, view) = upload(&pipeline, INVOICE, "a.csv");
        pipeline.confirm(id).unwrap();
        assert_eq!(pipeline.delete_batch(view.batch_id).unwrap(), 12);
        assert!(matches!(pipeline.get_batch(view.batch_id), Err(ExtratoError::UnknownBatch(_))));
    }

    #[test]
    fn test_reclassify_blocked_during_migration() {
        let (_dir, pipeline) = pipeline();
        let (id, view) = upload(&pipeline, INVOICE, "a.csv");
        pipeline.confirm(id).unwrap();
        let txn = &pipeline.batch_transactions(view.batch_id).unwrap()[0];
        let _migration = pipeline.scopes.acquire(&[(Scope::group("local", "Food"), Mode::Exclusive)]).unwrap();
        let result = pipeline.update_transaction(&ReclassifyRequest {
            transaction_id: txn.id,
            group: Some("Food".into()),
            ..Default::default()
        });
        assert!(matches!(result, Err(ExtratoError::PropagationConflict)));
    }

    #[test]
    fn test_migration_through_pipeline() {
        let (_dir, pipeline) = pipeline();
        let (id, view) = upload(&pipeline, INVOICE, "a.csv");
        pipeline.confirm(id).unwrap();
        for txn in pipeline.batch_transactions(view.batch_id).unwrap().iter().take(3) {
            pipeline
                .update_transaction(&ReclassifyRequest {
                    transaction_id: txn.id,
                    group: Some("Leisure".into()),
                    ..Default::default()
                })
                .unwrap();
        }
        let request = MigrationRequest {
            source_group: "Leisure".into(),
            source_subgroup: None,
            target_group: "Subscriptions".into(),
            target_subgroup: Some("Streaming".into()),
        };
        let preview = pipeline.migration_preview(&request).unwrap();
        let outcome = pipeline.migration_execute(&request).unwrap();
        assert_eq!(outcome.updated_count as i64, preview.affected_count);
        assert_eq!(preview.affected_count, 3);
    }
}
