//! Command surface for running multilingual surveys and merging their results.
//!
//! Everything a command needs is resolved up front into explicit values
//! ([`RunSettings`], [`ProviderSettings`]) and passed down; nothing is read
//! from process-wide state after argument parsing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use polyglot_survey_core::{
    build_result_file, clear_overlong_translations, format_result_timestamp, format_rfc3339,
    now_utc, same_language, CleaningReport, ProcessedResultFile, QualityGate, QualityThresholds,
    Question, SurveyDefinition, SurveyError, TrialRecord, DEFAULT_REFERENCE_LANGUAGE,
};
use polyglot_survey_matrix::{
    consolidate, discover_result_files, language_catalog, load_result_file, merge_files,
    source_name, MergeOutcome,
};
use polyglot_survey_provider::{
    hash_json, CallEstimate, CancelFlag, CompletionClient, HttpClientConfig, MockClient,
    OpenAiChatClient, RetryPolicy, RetryingClient, RunDiagnostics, TrialProgress, TrialRunner,
    TrialRunnerConfig, DEFAULT_API_KEY_ENV, DEFAULT_MODEL_ID, DEFAULT_TRIAL_TEMPERATURE,
};
use polyglot_survey_store_sqlite::{
    write_trials_csv, ProviderCallSummary, RunStatus, SqliteTrialStore, SurveyRunRecord,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const MODEL_ENV: &str = "OPENAI_MODEL";
pub const DELAY_ENV: &str = "API_DELAY";

#[derive(Debug, Parser)]
#[command(name = "polyglot-survey")]
#[command(about = "Multilingual LLM survey runner and result merger")]
pub struct Cli {
    #[arg(long, default_value = "./polyglot_survey.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Survey {
        #[command(subcommand)]
        command: Box<SurveyCommand>,
    },
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    Trials {
        #[command(subcommand)]
        command: TrialsCommand,
    },
    Results {
        #[command(subcommand)]
        command: ResultsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SurveyCommand {
    /// Print the number of external calls a run would make.
    Estimate(RunSettingsArgs),
    /// Administer a survey and archive every trial.
    Run(RunArgs),
    /// Aggregate and gate an archived run into a processed result file.
    Process(ProcessArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunSettingsArgs {
    /// Survey definition (JSON, or YAML by extension).
    #[arg(long)]
    survey: PathBuf,
    #[arg(long = "language")]
    languages: Vec<String>,
    /// Restrict the run to these question ids.
    #[arg(long = "question")]
    questions: Vec<String>,
    #[arg(long)]
    trials: Option<u32>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    no_translation: bool,
    #[arg(long)]
    reference_language: Option<String>,
    /// Pause after every external call, overriding `API_DELAY`.
    #[arg(long)]
    delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderArg {
    Openai,
    Mock,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    settings: RunSettingsArgs,
    #[arg(long, value_enum, default_value_t = ProviderArg::Openai)]
    provider: ProviderArg,
    #[arg(long, default_value = DEFAULT_API_KEY_ENV)]
    api_key_env: String,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,
    #[arg(long, default_value_t = 500)]
    retry_backoff_ms: u64,
    /// Also write the raw trials as CSV.
    #[arg(long)]
    out_csv: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Run to process; defaults to the latest archived run.
    #[arg(long)]
    run_id: Option<String>,
    /// JSON object overriding individual quality thresholds.
    #[arg(long)]
    thresholds: Option<String>,
    /// Clear overlong translations before aggregating.
    #[arg(long)]
    clean: bool,
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    /// Exact output path; overrides `--out-dir`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    List,
    Show {
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TrialsCommand {
    /// Write a run's raw trials as CSV.
    Export {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        clean: bool,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ResultFilesArgs {
    #[arg(long = "file")]
    files: Vec<PathBuf>,
    /// Directory scanned for `results_*.json`.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ResultsCommand {
    /// Merge result files into one language x question matrix.
    Merge {
        #[command(flatten)]
        inputs: ResultFilesArgs,
        #[arg(long)]
        analytics: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Combine raw per-language statistics across result files.
    Consolidate {
        #[command(flatten)]
        inputs: ResultFilesArgs,
    },
    /// Per-language coverage and quality across result files.
    Catalog {
        #[command(flatten)]
        inputs: ResultFilesArgs,
    },
}

/// # Errors
/// Returns an error when the command fails; the cause chain is preserved.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Results { command } => run_results(command),
        Command::Survey { command } => match *command {
            SurveyCommand::Estimate(args) => run_estimate(&args),
            SurveyCommand::Run(args) => run_survey(&args, &open_store(&cli.db)?),
            SurveyCommand::Process(args) => run_process(&args, &open_store(&cli.db)?),
        },
        Command::Runs { command } => {
            let store = open_store(&cli.db)?;
            run_runs(command, &store)
        }
        Command::Trials { command } => {
            let store = open_store(&cli.db)?;
            run_trials(command, &store)
        }
    }
}

fn open_store(path: &Path) -> Result<SqliteTrialStore> {
    let store = SqliteTrialStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

/// Run settings after applying CLI flags, environment and survey metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub model_id: String,
    pub num_trials: u32,
    pub temperature: f32,
    pub languages: Vec<String>,
    pub questions: Vec<Question>,
    pub use_translation: bool,
    pub reference_language: String,
    pub call_delay: Duration,
}

impl RunSettings {
    /// Resolves each setting from the first source that provides it: CLI
    /// flag, environment, survey metadata, built-in default.
    ///
    /// # Errors
    /// Returns [`SurveyError::Configuration`] for an unparseable `API_DELAY`
    /// and [`SurveyError::UnknownQuestion`] for a `--question` filter that
    /// names no survey question.
    pub fn resolve(
        args: &RunSettingsArgs,
        definition: &SurveyDefinition,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, SurveyError> {
        let metadata = &definition.survey.metadata;

        let model_id = args
            .model
            .clone()
            .or_else(|| non_empty(env(MODEL_ENV)))
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());

        let call_delay = match (args.delay_ms, non_empty(env(DELAY_ENV))) {
            (Some(millis), _) => Duration::from_millis(millis),
            (None, Some(raw)) => parse_delay_seconds(&raw)?,
            (None, None) => Duration::ZERO,
        };

        let requested = if args.languages.is_empty() {
            metadata.default_languages.clone()
        } else {
            args.languages.clone()
        };
        let mut languages: Vec<String> = Vec::new();
        for language in requested {
            let language = language.trim().to_string();
            if !language.is_empty() && !languages.iter().any(|known| same_language(known, &language)) {
                languages.push(language);
            }
        }
        if languages.is_empty() {
            languages.push(DEFAULT_REFERENCE_LANGUAGE.to_string());
        }

        let questions = if args.questions.is_empty() {
            definition.questions.clone()
        } else {
            args.questions
                .iter()
                .map(|question_id| {
                    definition
                        .question(question_id)
                        .cloned()
                        .ok_or_else(|| SurveyError::UnknownQuestion(question_id.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            model_id,
            num_trials: args.trials.or(metadata.recommended_trials).unwrap_or(1),
            temperature: args.temperature.unwrap_or(DEFAULT_TRIAL_TEMPERATURE),
            languages,
            questions,
            use_translation: !args.no_translation
                && metadata.translation_settings.use_translation.unwrap_or(true),
            reference_language: args
                .reference_language
                .clone()
                .unwrap_or_else(|| DEFAULT_REFERENCE_LANGUAGE.to_string()),
            call_delay,
        })
    }

    #[must_use]
    pub fn runner_config(&self) -> TrialRunnerConfig {
        let mut config = TrialRunnerConfig::new(&self.model_id, self.num_trials);
        config.temperature = self.temperature;
        config.reference_language.clone_from(&self.reference_language);
        config.use_translation = self.use_translation;
        config.call_delay = self.call_delay;
        config
    }

    #[must_use]
    pub fn estimate(&self) -> CallEstimate {
        CallEstimate::for_run(
            &self.languages,
            self.questions.len(),
            self.num_trials,
            &self.reference_language,
            self.use_translation,
        )
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|raw| !raw.trim().is_empty())
}

fn parse_delay_seconds(raw: &str) -> Result<Duration, SurveyError> {
    let seconds = f64::from_str(raw.trim())
        .map_err(|err| SurveyError::Configuration(format!("{DELAY_ENV} MUST be seconds: {err}")))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(SurveyError::Configuration(format!(
            "{DELAY_ENV} MUST be a finite value >= 0"
        )));
    }
    Duration::try_from_secs_f64(seconds).map_err(|err| {
        SurveyError::Configuration(format!("{DELAY_ENV} is out of range: {err}"))
    })
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Loads a survey definition, choosing YAML for `.yaml`/`.yml` files.
///
/// # Errors
/// Returns an error naming the path when the file is unreadable or invalid.
pub fn load_survey_definition(path: &Path) -> Result<SurveyDefinition> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read survey definition {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    let definition = if is_yaml {
        let value: Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid survey YAML in {}", path.display()))?;
        SurveyDefinition::from_value(value)
    } else {
        SurveyDefinition::from_json_str(&raw)
    };
    definition.with_context(|| format!("invalid survey definition {}", path.display()))
}

/// Applies a partial thresholds object over the v1 defaults.
///
/// # Errors
/// Returns an error for invalid JSON or out-of-range thresholds.
pub fn resolve_thresholds(raw: Option<&str>) -> Result<QualityThresholds> {
    let Some(raw) = raw else {
        return Ok(QualityThresholds::v1());
    };
    let overrides: Value = serde_json::from_str(raw).context("--thresholds MUST be JSON")?;
    let Some(overrides) = overrides.as_object() else {
        return Err(anyhow!("--thresholds MUST be a JSON object"));
    };
    let mut merged = serde_json::to_value(QualityThresholds::v1())?;
    if let Some(target) = merged.as_object_mut() {
        for (key, value) in overrides {
            if !target.contains_key(key) {
                return Err(anyhow!("unknown threshold '{key}'"));
            }
            target.insert(key.clone(), value.clone());
        }
    }
    Ok(QualityThresholds::from_json(&merged)?)
}

/// Provider wiring for `survey run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider: ProviderArg,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
}

impl ProviderSettings {
    /// # Errors
    /// Returns an error for an invalid retry policy.
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        let retry = if args.max_attempts <= 1 {
            RetryPolicy::none()
        } else {
            RetryPolicy::bounded(args.max_attempts, args.retry_backoff_ms)?
        };
        Ok(Self {
            provider: args.provider,
            api_key_env: args.api_key_env.clone(),
            base_url: args.base_url.clone(),
            timeout_ms: args.timeout_ms,
            retry,
        })
    }

    /// # Errors
    /// Returns an error when the HTTP provider's API key is missing.
    pub fn build_client(&self) -> Result<Box<dyn CompletionClient>> {
        let inner: Box<dyn CompletionClient> = match self.provider {
            ProviderArg::Mock => Box::new(MockClient::new()),
            ProviderArg::Openai => Box::new(OpenAiChatClient::new(HttpClientConfig::from_env(
                &self.api_key_env,
                self.base_url.as_deref(),
                self.timeout_ms,
            )?)),
        };
        if self.retry.max_attempts > 1 {
            Ok(Box::new(RetryingClient::new(inner, self.retry)))
        } else {
            Ok(inner)
        }
    }
}

#[derive(Debug, Serialize)]
struct EstimatePayload {
    contract_version: &'static str,
    survey_name: Option<String>,
    languages: Vec<String>,
    questions: usize,
    num_trials: u32,
    use_translation: bool,
    reference_language: String,
    estimate: CallEstimate,
}

fn run_estimate(args: &RunSettingsArgs) -> Result<()> {
    let definition = load_survey_definition(&args.survey)?;
    let settings = RunSettings::resolve(args, &definition, &process_env)?;
    let payload = EstimatePayload {
        contract_version: "call_estimate.v1",
        survey_name: definition.survey.metadata.name.clone(),
        languages: settings.languages.clone(),
        questions: settings.questions.len(),
        num_trials: settings.num_trials,
        use_translation: settings.use_translation,
        reference_language: settings.reference_language.clone(),
        estimate: settings.estimate(),
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct RunSummaryPayload {
    contract_version: &'static str,
    run_id: String,
    status: RunStatus,
    survey_name: String,
    provider_name: String,
    model_id: String,
    languages: Vec<String>,
    questions: usize,
    num_trials: u32,
    trials_recorded: usize,
    valid_responses: usize,
    provider_calls: usize,
    estimate: CallEstimate,
    diagnostics: RunDiagnostics,
}

fn run_survey(args: &RunArgs, store: &SqliteTrialStore) -> Result<()> {
    let definition = load_survey_definition(&args.settings.survey)?;
    let settings = RunSettings::resolve(&args.settings, &definition, &process_env)?;
    let provider = ProviderSettings::from_args(args)?;
    let client = provider.build_client()?;
    let cancel = CancelFlag::new();
    let interrupt = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || interrupt.cancel()) {
        warn!(error = %err, "failed to install interrupt handler");
    }
    let runner = TrialRunner::new(client.as_ref(), settings.runner_config())?
        .with_cancel_flag(cancel);

    // Archive only the administered questions so processing gates on them.
    let mut administered = definition.clone();
    administered.questions.clone_from(&settings.questions);
    let survey_json = serde_json::to_value(&administered)?;
    let survey_name = definition
        .survey
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| source_name(&args.settings.survey));
    let run = SurveyRunRecord {
        run_id: Ulid::new(),
        survey_name: survey_name.clone(),
        survey_hash: hash_json(&survey_json)?,
        survey_json,
        provider_name: client.provider_name().to_string(),
        model_id: settings.model_id.clone(),
        num_trials: settings.num_trials,
        temperature: f64::from(settings.temperature),
        reference_language: settings.reference_language.clone(),
        use_translation: settings.use_translation,
        languages: settings.languages.clone(),
        started_at: now_utc(),
        ended_at: None,
        status: RunStatus::Running,
        diagnostics: None,
    };
    store.insert_run(&run)?;

    let estimate = settings.estimate();
    info!(
        run_id = %run.run_id,
        languages = settings.languages.len(),
        questions = settings.questions.len(),
        trials = settings.num_trials,
        max_calls = estimate.total_calls,
        "starting survey run"
    );

    let mut on_progress = |progress: &TrialProgress| {
        debug!(
            language = %progress.language,
            question_id = %progress.question_id,
            trial = progress.trial_number,
            of = progress.num_trials,
            response = ?progress.response_value,
            running_mean = ?progress.running_mean,
            "trial complete"
        );
    };
    let outcome = runner.run_survey(&settings.languages, &settings.questions, &mut on_progress);

    let trials_recorded = store.append_trials(run.run_id, &outcome.records)?;
    let provider_calls = store.append_provider_calls(run.run_id, &outcome.provider_calls)?;
    let status = if outcome.cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Succeeded
    };
    store.finish_run(run.run_id, status, &outcome.diagnostics)?;

    if let Some(path) = &args.out_csv {
        write_csv_file(path, &outcome.records)?;
    }

    let payload = RunSummaryPayload {
        contract_version: "survey_run.v1",
        run_id: run.run_id.to_string(),
        status,
        survey_name,
        provider_name: run.provider_name,
        model_id: run.model_id,
        languages: settings.languages,
        questions: settings.questions.len(),
        num_trials: settings.num_trials,
        trials_recorded,
        valid_responses: outcome
            .records
            .iter()
            .filter(|record| record.response_value.is_some())
            .count(),
        provider_calls,
        estimate,
        diagnostics: outcome.diagnostics,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn write_csv_file(path: &Path, records: &[TrialRecord]) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_trials_csv(&mut file, records)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn resolve_run(store: &SqliteTrialStore, run_id: Option<&str>) -> Result<SurveyRunRecord> {
    match run_id {
        Some(raw) => {
            let run_id =
                Ulid::from_str(raw).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
            store
                .get_run(run_id)?
                .ok_or_else(|| anyhow!("survey run {run_id} not found"))
        }
        None => store
            .latest_run()?
            .ok_or_else(|| anyhow!("no survey runs archived yet")),
    }
}

fn run_trials_for(
    store: &SqliteTrialStore,
    run: &SurveyRunRecord,
    clean: bool,
) -> Result<(Vec<TrialRecord>, Option<CleaningReport>)> {
    let records = store.list_trials(run.run_id)?;
    if !clean {
        return Ok((records, None));
    }
    let (cleaned, report) = clear_overlong_translations(&records);
    info!(
        translations_cleared = report.translations_cleared,
        back_translations_cleared = report.back_translations_cleared,
        responses_cleared = report.responses_cleared,
        "cleared overlong translations"
    );
    Ok((cleaned, Some(report)))
}

#[derive(Debug, Serialize)]
struct ProcessPayload {
    contract_version: &'static str,
    run_id: String,
    path: String,
    total_questions: usize,
    valid_languages: Vec<String>,
    excluded_languages: Vec<String>,
    cleaning: Option<CleaningReport>,
}

fn run_process(args: &ProcessArgs, store: &SqliteTrialStore) -> Result<()> {
    let run = resolve_run(store, args.run_id.as_deref())?;
    let definition = SurveyDefinition::from_value(run.survey_json.clone())
        .with_context(|| format!("archived survey for run {} is invalid", run.run_id))?;
    let thresholds = resolve_thresholds(args.thresholds.as_deref())?;
    let gate = QualityGate::new(thresholds, &run.reference_language)?;
    let (records, cleaning) = run_trials_for(store, &run, args.clean)?;

    let generated_at = now_utc();
    let file = build_result_file(
        &definition.questions,
        &records,
        &gate,
        &format!("run_{}", run.run_id),
        generated_at,
    )?;

    let path = match &args.out {
        Some(path) => path.clone(),
        None => {
            fs::create_dir_all(&args.out_dir)
                .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
            args.out_dir
                .join(format!("results_{}.json", format_result_timestamp(generated_at)))
        }
    };
    fs::write(&path, serde_json::to_string_pretty(&file)?)
        .with_context(|| format!("failed to write {}", path.display()))?;

    let excluded_languages: Vec<String> = file
        .quality_metrics
        .language_quality
        .keys()
        .filter(|language| !file.admits_language(language))
        .cloned()
        .collect();
    if !excluded_languages.is_empty() {
        warn!(excluded = ?excluded_languages, "languages failed the quality gate");
    }

    let payload = ProcessPayload {
        contract_version: "process_summary.v1",
        run_id: run.run_id.to_string(),
        path: path.display().to_string(),
        total_questions: file.quality_metrics.total_questions,
        valid_languages: file.quality_metrics.valid_languages.clone(),
        excluded_languages,
        cleaning,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct RunView {
    run_id: String,
    survey_name: String,
    survey_hash: String,
    provider_name: String,
    model_id: String,
    num_trials: u32,
    temperature: f64,
    reference_language: String,
    use_translation: bool,
    languages: Vec<String>,
    started_at: String,
    ended_at: Option<String>,
    status: RunStatus,
    diagnostics: Option<RunDiagnostics>,
}

impl RunView {
    fn from_record(run: &SurveyRunRecord) -> Result<Self> {
        Ok(Self {
            run_id: run.run_id.to_string(),
            survey_name: run.survey_name.clone(),
            survey_hash: run.survey_hash.clone(),
            provider_name: run.provider_name.clone(),
            model_id: run.model_id.clone(),
            num_trials: run.num_trials,
            temperature: run.temperature,
            reference_language: run.reference_language.clone(),
            use_translation: run.use_translation,
            languages: run.languages.clone(),
            started_at: format_rfc3339(run.started_at)?,
            ended_at: run.ended_at.map(format_rfc3339).transpose()?,
            status: run.status,
            diagnostics: run.diagnostics,
        })
    }
}

#[derive(Debug, Serialize)]
struct RunDetailPayload {
    contract_version: &'static str,
    run: RunView,
    trials: usize,
    valid_responses: usize,
    provider_calls: Vec<ProviderCallSummary>,
}

fn run_runs(command: RunsCommand, store: &SqliteTrialStore) -> Result<()> {
    match command {
        RunsCommand::List => {
            let runs = store
                .list_runs()?
                .iter()
                .map(RunView::from_record)
                .collect::<Result<Vec<_>>>()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "contract_version": "run_list.v1",
                    "runs": runs,
                }))?
            );
            Ok(())
        }
        RunsCommand::Show { run_id } => {
            let run = resolve_run(store, run_id.as_deref())?;
            let trials = store.list_trials(run.run_id)?;
            let payload = RunDetailPayload {
                contract_version: "run_detail.v1",
                run: RunView::from_record(&run)?,
                trials: trials.len(),
                valid_responses: trials
                    .iter()
                    .filter(|record| record.response_value.is_some())
                    .count(),
                provider_calls: store.provider_call_summary(run.run_id)?,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_trials(command: TrialsCommand, store: &SqliteTrialStore) -> Result<()> {
    match command {
        TrialsCommand::Export { run_id, clean, out } => {
            let run = resolve_run(store, run_id.as_deref())?;
            let (records, _) = run_trials_for(store, &run, clean)?;
            match out {
                Some(path) => write_csv_file(&path, &records),
                None => {
                    let stdout = std::io::stdout();
                    let mut handle = stdout.lock();
                    write_trials_csv(&mut handle, &records)?;
                    handle.flush()?;
                    Ok(())
                }
            }
        }
    }
}

fn collect_result_paths(inputs: &ResultFilesArgs) -> Result<Vec<PathBuf>> {
    let mut paths = inputs.files.clone();
    if let Some(dir) = &inputs.dir {
        let discovered = discover_result_files(dir)
            .with_context(|| format!("failed to scan {}", dir.display()))?;
        debug!(dir = %dir.display(), files = discovered.len(), "discovered result files");
        paths.extend(discovered);
    }
    Ok(paths)
}

fn load_result_files(inputs: &ResultFilesArgs) -> Result<Vec<(String, ProcessedResultFile)>> {
    let paths = collect_result_paths(inputs)?;
    if paths.is_empty() {
        return Err(anyhow!("No files provided"));
    }
    paths
        .iter()
        .map(|path| -> Result<(String, ProcessedResultFile)> {
            Ok((source_name(path), load_result_file(path)?))
        })
        .collect()
}

/// Builds the `matrix_snapshot.v1` document for a merge outcome.
///
/// # Errors
/// Returns an error when the store cannot be serialized.
pub fn matrix_snapshot(outcome: &MergeOutcome, analytics: bool) -> Result<Value> {
    let dense = outcome.store.as_ref().map(polyglot_survey_matrix::MatrixStore::get_matrix);
    let mut snapshot = json!({
        "contract_version": "matrix_snapshot.v1",
        "files_merged": outcome.files_merged,
        "errors": outcome.errors,
        "error_summary": outcome.error_summary,
        "question_ids": dense.as_ref().map(|matrix| matrix.question_ids.clone()),
        "languages": dense.as_ref().map(|matrix| matrix.languages.clone()),
        "values": dense.as_ref().map(|matrix| matrix.values.clone()),
        "store": outcome.store.as_ref().map(serde_json::to_value).transpose()?,
        "summary": outcome.store.as_ref().map(|store| store.debug_summary()),
    });
    if analytics {
        if let (Some(store), Some(object)) = (&outcome.store, snapshot.as_object_mut()) {
            object.insert(
                "analytics".to_string(),
                json!({
                    "questions": store.question_summaries(),
                    "languages": store.language_deviations(),
                }),
            );
        }
    }
    Ok(snapshot)
}

fn run_results(command: ResultsCommand) -> Result<()> {
    match command {
        ResultsCommand::Merge {
            inputs,
            analytics,
            out,
        } => {
            let paths = collect_result_paths(&inputs)?;
            let outcome = merge_files(&paths);
            if outcome.store.is_none() {
                return Err(anyhow!(outcome
                    .error_summary
                    .unwrap_or_else(|| "no result file could be merged".to_string())));
            }
            let snapshot = matrix_snapshot(&outcome, analytics)?;
            let rendered = serde_json::to_string_pretty(&snapshot)?;
            if let Some(path) = out {
                fs::write(&path, &rendered)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            println!("{rendered}");
            Ok(())
        }
        ResultsCommand::Consolidate { inputs } => {
            let files = load_result_files(&inputs)?;
            let questions = consolidate(&files)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "contract_version": "consolidated_results.v1",
                    "files": files.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
                    "questions": questions,
                }))?
            );
            Ok(())
        }
        ResultsCommand::Catalog { inputs } => {
            let files: Vec<ProcessedResultFile> = load_result_files(&inputs)?
                .into_iter()
                .map(|(_, file)| file)
                .collect();
            let catalog = language_catalog(&files);
            let mut payload = serde_json::to_value(&catalog)?;
            if let Some(object) = payload.as_object_mut() {
                object.insert("contract_version".to_string(), json!("language_catalog.v1"));
            }
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}
