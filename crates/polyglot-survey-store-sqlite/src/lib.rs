#![forbid(unsafe_code)]

use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use polyglot_survey_core::{format_rfc3339, now_utc, parse_rfc3339_utc, TrialRecord};
use polyglot_survey_provider::{ProviderCallRecord, RunDiagnostics};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const ARCHIVE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS survey_runs (
  run_id TEXT PRIMARY KEY,
  survey_name TEXT NOT NULL,
  survey_hash TEXT NOT NULL,
  survey_json TEXT NOT NULL,
  provider_name TEXT NOT NULL,
  model_id TEXT NOT NULL,
  num_trials INTEGER NOT NULL CHECK (num_trials >= 1),
  temperature REAL NOT NULL,
  reference_language TEXT NOT NULL,
  use_translation INTEGER NOT NULL CHECK (use_translation IN (0,1)),
  languages_json TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','succeeded','cancelled','failed')),
  diagnostics_json TEXT
);

CREATE TABLE IF NOT EXISTS trial_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  language TEXT NOT NULL,
  question_id TEXT NOT NULL,
  trial_number INTEGER NOT NULL CHECK (trial_number >= 1),
  original_prompt TEXT NOT NULL,
  translated_prompt TEXT NOT NULL,
  back_translated_prompt TEXT NOT NULL,
  verification_score INTEGER CHECK (verification_score IS NULL OR verification_score BETWEEN 1 AND 5),
  response_value REAL,
  recorded_at TEXT NOT NULL,
  UNIQUE(run_id, language, question_id, trial_number),
  FOREIGN KEY (run_id) REFERENCES survey_runs(run_id)
);

CREATE TABLE IF NOT EXISTS provider_calls (
  provider_call_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  purpose TEXT NOT NULL,
  language TEXT NOT NULL,
  question_id TEXT,
  trial_number INTEGER,
  provider_name TEXT NOT NULL,
  adapter_version TEXT NOT NULL,
  model_id TEXT NOT NULL,
  request_json TEXT NOT NULL,
  request_hash TEXT NOT NULL,
  response_json TEXT NOT NULL,
  response_hash TEXT NOT NULL,
  latency_ms INTEGER,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('succeeded','failed')),
  error_text TEXT,
  FOREIGN KEY (run_id) REFERENCES survey_runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_trial_records_run ON trial_records(run_id, id);
CREATE INDEX IF NOT EXISTS idx_provider_calls_run ON provider_calls(run_id, started_at);

CREATE TRIGGER IF NOT EXISTS trg_trial_records_no_update
BEFORE UPDATE ON trial_records
BEGIN
  SELECT RAISE(FAIL, 'trial_records is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_trial_records_no_delete
BEFORE DELETE ON trial_records
BEGIN
  SELECT RAISE(FAIL, 'trial_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_provider_calls_no_update
BEFORE UPDATE ON provider_calls
BEGIN
  SELECT RAISE(FAIL, 'provider_calls is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_provider_calls_no_delete
BEFORE DELETE ON provider_calls
BEGIN
  SELECT RAISE(FAIL, 'provider_calls is append-only');
END;
";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Cancelled,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// # Errors
    /// Returns an error for an unknown status string.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow!("unknown run status: {value}")),
        }
    }
}

/// One archived survey execution and the settings it ran with.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyRunRecord {
    pub run_id: Ulid,
    pub survey_name: String,
    pub survey_hash: String,
    /// Normalized survey definition, so a run can be re-processed offline.
    pub survey_json: Value,
    pub provider_name: String,
    pub model_id: String,
    pub num_trials: u32,
    pub temperature: f64,
    pub reference_language: String,
    pub use_translation: bool,
    pub languages: Vec<String>,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub status: RunStatus,
    pub diagnostics: Option<RunDiagnostics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCallSummary {
    pub purpose: String,
    pub status: String,
    pub calls: u64,
}

pub struct SqliteTrialStore {
    conn: Connection,
}

impl SqliteTrialStore {
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply survey archive schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ARCHIVE_SCHEMA_VERSION, format_rfc3339(now_utc())?],
            )
            .context("failed to record archive migration")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn insert_run(&self, run: &SurveyRunRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO survey_runs(
                    run_id, survey_name, survey_hash, survey_json, provider_name,
                    model_id, num_trials, temperature, reference_language,
                    use_translation, languages_json, started_at, ended_at, status,
                    diagnostics_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    run.run_id.to_string(),
                    run.survey_name,
                    run.survey_hash,
                    serde_json::to_string(&run.survey_json)?,
                    run.provider_name,
                    run.model_id,
                    i64::from(run.num_trials),
                    run.temperature,
                    run.reference_language,
                    i64::from(run.use_translation),
                    serde_json::to_string(&run.languages)?,
                    format_rfc3339(run.started_at)?,
                    run.ended_at.map(format_rfc3339).transpose()?,
                    run.status.as_str(),
                    run.diagnostics
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )
            .context("failed to insert survey run")?;
        Ok(())
    }

    /// Marks a run finished and stores its failure counters.
    ///
    /// # Errors
    /// Returns an error when the run does not exist or the update fails.
    pub fn finish_run(&self, run_id: Ulid, status: RunStatus, diagnostics: &RunDiagnostics) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE survey_runs SET status = ?2, ended_at = ?3, diagnostics_json = ?4 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    format_rfc3339(now_utc())?,
                    serde_json::to_string(diagnostics)?,
                ],
            )
            .context("failed to update survey run status")?;
        if updated == 0 {
            return Err(anyhow!("survey run {run_id} not found"));
        }
        Ok(())
    }

    /// Appends trial rows in one transaction.
    ///
    /// # Errors
    /// Returns an error for invalid records or when any insert fails; nothing
    /// is written in that case.
    pub fn append_trials(&self, run_id: Ulid, records: &[TrialRecord]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin trial_records transaction")?;
        let recorded_at = format_rfc3339(now_utc())?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trial_records(
                    run_id, language, question_id, trial_number, original_prompt,
                    translated_prompt, back_translated_prompt, verification_score,
                    response_value, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for record in records {
                record.validate()?;
                stmt.execute(params![
                    run_id.to_string(),
                    record.language,
                    record.question_id,
                    i64::from(record.trial_number),
                    record.original_prompt,
                    record.translated_prompt,
                    record.back_translated_prompt,
                    record.verification_score.map(i64::from),
                    record.response_value,
                    recorded_at,
                ])
                .with_context(|| {
                    format!(
                        "failed to insert trial {}/{}#{}",
                        record.language, record.question_id, record.trial_number
                    )
                })?;
            }
        }
        tx.commit().context("failed to commit trial_records")?;
        debug!(run_id = %run_id, rows = records.len(), "archived trial records");
        Ok(records.len())
    }

    /// # Errors
    /// Returns an error when any insert fails; nothing is written in that case.
    pub fn append_provider_calls(&self, run_id: Ulid, calls: &[ProviderCallRecord]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin provider_calls transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO provider_calls(
                    provider_call_id, run_id, purpose, language, question_id,
                    trial_number, provider_name, adapter_version, model_id,
                    request_json, request_hash, response_json, response_hash,
                    latency_ms, started_at, ended_at, status, error_text
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;
            for call in calls {
                stmt.execute(params![
                    call.provider_call_id.to_string(),
                    run_id.to_string(),
                    call.purpose.as_str(),
                    call.language,
                    call.question_id,
                    call.trial_number.map(i64::from),
                    call.provider_name,
                    call.adapter_version,
                    call.model_id,
                    serde_json::to_string(&call.request_json)?,
                    call.request_hash,
                    serde_json::to_string(&call.response_json)?,
                    call.response_hash,
                    call.latency_ms
                        .map(i64::try_from)
                        .transpose()
                        .map_err(|_| anyhow!("latency overflow"))?,
                    format_rfc3339(call.started_at)?,
                    format_rfc3339(call.ended_at)?,
                    call.status.as_str(),
                    call.error_text,
                ])
                .context("failed to insert provider_call row")?;
            }
        }
        tx.commit().context("failed to commit provider_calls")?;
        debug!(run_id = %run_id, rows = calls.len(), "archived provider calls");
        Ok(calls.len())
    }

    /// Newest runs first.
    ///
    /// # Errors
    /// Returns an error when a stored row cannot be decoded.
    pub fn list_runs(&self) -> Result<Vec<SurveyRunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM survey_runs ORDER BY started_at DESC, run_id DESC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error when the stored row cannot be decoded.
    pub fn get_run(&self, run_id: Ulid) -> Result<Option<SurveyRunRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM survey_runs WHERE run_id = ?1"))?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(run_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the stored row cannot be decoded.
    pub fn latest_run(&self) -> Result<Option<SurveyRunRecord>> {
        let run_id: Option<String> = self
            .conn
            .query_row(
                "SELECT run_id FROM survey_runs ORDER BY started_at DESC, run_id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query latest survey run")?;
        match run_id {
            Some(raw) => self.get_run(parse_ulid(&raw, "run_id")?),
            None => Ok(None),
        }
    }

    /// Trials of one run in archive order.
    ///
    /// # Errors
    /// Returns an error when a stored row cannot be decoded.
    pub fn list_trials(&self, run_id: Ulid) -> Result<Vec<TrialRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                language, question_id, trial_number, original_prompt,
                translated_prompt, back_translated_prompt, verification_score,
                response_value
             FROM trial_records
             WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let trial_number: i64 = row.get(2)?;
            let verification_score: Option<i64> = row.get(6)?;
            out.push(TrialRecord {
                language: row.get(0)?,
                question_id: row.get(1)?,
                trial_number: u32::try_from(trial_number)
                    .map_err(|_| anyhow!("trial_number out of range: {trial_number}"))?,
                original_prompt: row.get(3)?,
                translated_prompt: row.get(4)?,
                back_translated_prompt: row.get(5)?,
                verification_score: verification_score
                    .map(u8::try_from)
                    .transpose()
                    .map_err(|_| anyhow!("verification_score out of range"))?,
                response_value: row.get(7)?,
            });
        }
        Ok(out)
    }

    /// Call counts per (purpose, status) for one run.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn provider_call_summary(&self, run_id: Ulid) -> Result<Vec<ProviderCallSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT purpose, status, COUNT(*)
             FROM provider_calls
             WHERE run_id = ?1
             GROUP BY purpose, status
             ORDER BY purpose ASC, status ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let calls: i64 = row.get(2)?;
            out.push(ProviderCallSummary {
                purpose: row.get(0)?,
                status: row.get(1)?,
                calls: u64::try_from(calls).unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

const RUN_COLUMNS: &str = "run_id, survey_name, survey_hash, survey_json, provider_name,
    model_id, num_trials, temperature, reference_language, use_translation,
    languages_json, started_at, ended_at, status, diagnostics_json";

fn run_from_row(row: &Row<'_>) -> Result<SurveyRunRecord> {
    let run_id: String = row.get(0)?;
    let survey_json: String = row.get(3)?;
    let num_trials: i64 = row.get(6)?;
    let languages_json: String = row.get(10)?;
    let diagnostics_json: Option<String> = row.get(14)?;
    Ok(SurveyRunRecord {
        run_id: parse_ulid(&run_id, "run_id")?,
        survey_name: row.get(1)?,
        survey_hash: row.get(2)?,
        survey_json: serde_json::from_str(&survey_json).context("invalid survey_json")?,
        provider_name: row.get(4)?,
        model_id: row.get(5)?,
        num_trials: u32::try_from(num_trials).map_err(|_| anyhow!("num_trials out of range"))?,
        temperature: row.get(7)?,
        reference_language: row.get(8)?,
        use_translation: row.get::<_, i64>(9)? != 0,
        languages: serde_json::from_str(&languages_json).context("invalid languages_json")?,
        started_at: parse_rfc3339_utc(&row.get::<_, String>(11)?)?,
        ended_at: row
            .get::<_, Option<String>>(12)?
            .map(|value| parse_rfc3339_utc(&value))
            .transpose()?,
        status: RunStatus::parse(&row.get::<_, String>(13)?)?,
        diagnostics: diagnostics_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("invalid diagnostics_json")?,
    })
}

fn parse_ulid(value: &str, field: &str) -> Result<Ulid> {
    Ulid::from_str(value).map_err(|err| anyhow!("invalid {field} ULID: {err}"))
}

pub const TRIAL_CSV_HEADER: [&str; 8] = [
    "Language",
    "Question_ID",
    "Trial_Number",
    "Response",
    "Original_Prompt",
    "Translated_Prompt",
    "Back_Translation",
    "LLM_Verification_Score",
];

/// Writes trials as CSV; absent values become empty cells.
///
/// # Errors
/// Returns an error when the writer fails.
pub fn write_trials_csv<W: Write>(writer: &mut W, records: &[TrialRecord]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(TRIAL_CSV_HEADER)
        .context("failed to write CSV header")?;
    for record in records {
        let response = record
            .response_value
            .map_or_else(String::new, |value| value.to_string());
        let score = record
            .verification_score
            .map_or_else(String::new, |score| score.to_string());
        csv_writer
            .write_record([
                record.language.as_str(),
                record.question_id.as_str(),
                &record.trial_number.to_string(),
                &response,
                &record.original_prompt,
                &record.translated_prompt,
                &record.back_translated_prompt,
                &score,
            ])
            .with_context(|| {
                format!(
                    "failed to write CSV row for {}/{} trial {}",
                    record.language, record.question_id, record.trial_number
                )
            })?;
    }
    csv_writer.flush().context("failed to flush CSV output")?;
    Ok(())
}
