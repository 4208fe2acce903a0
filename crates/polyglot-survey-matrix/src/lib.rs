#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use polyglot_survey_core::{
    LanguageQualityMetrics, LanguageQuestionStats, ProcessedResultFile, ScaleLabels, SurveyError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const RESULT_FILE_PREFIX: &str = "results_";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuestionMetadata {
    pub scale_min: Option<i64>,
    pub scale_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_labels: Option<ScaleLabels>,
    #[serde(default)]
    pub category: String,
}

impl QuestionMetadata {
    #[must_use]
    pub fn bounded(scale_min: i64, scale_max: i64) -> Self {
        Self {
            scale_min: Some(scale_min),
            scale_max: Some(scale_max),
            ..Self::default()
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn check(&self, language: &str, question_id: &str, value: f64) -> Result<(), SurveyError> {
        let below = self.scale_min.is_some_and(|min| value < min as f64);
        let above = self.scale_max.is_some_and(|max| value > max as f64);
        if below || above {
            return Err(SurveyError::MatrixRangeViolation {
                language: language.to_string(),
                question_id: question_id.to_string(),
                value,
                scale_min: self.scale_min.unwrap_or(i64::MIN),
                scale_max: self.scale_max.unwrap_or(i64::MAX),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionEntry {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixEntry {
    pub value: f64,
    pub source_file: String,
}

/// Dense (language x question) view. Missing cells read as `0.0`; use the
/// sparse accessors on [`MatrixStore`] to tell missing from zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DenseMatrix {
    pub question_ids: Vec<String>,
    pub languages: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

/// (language, question) -> value map with per-cell provenance.
///
/// Stores are combined with [`MatrixStore::merge`], which never mutates its
/// inputs and lets the receiver win every conflict.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatrixStore {
    questions: Vec<QuestionEntry>,
    metadata: BTreeMap<String, QuestionMetadata>,
    languages: Vec<String>,
    values: BTreeMap<String, BTreeMap<String, f64>>,
    sources: BTreeMap<String, BTreeMap<String, String>>,
}

impl MatrixStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a serialized store and checks its invariants.
    ///
    /// # Errors
    /// Returns [`SurveyError::FileFormat`] when the payload does not match the
    /// store layout, or the error reported by [`MatrixStore::validate`].
    pub fn from_json_value(value: Value) -> Result<Self, SurveyError> {
        let store: Self = serde_json::from_value(value)
            .map_err(|err| SurveyError::FileFormat(format!("matrix snapshot schema mismatch: {err}")))?;
        store.validate()?;
        Ok(store)
    }

    /// Registers a question; the first registration of an id wins.
    pub fn add_question(&mut self, id: &str, title: &str, metadata: Option<QuestionMetadata>) -> bool {
        if self.has_question(id) {
            return false;
        }
        self.questions.push(QuestionEntry {
            id: id.to_string(),
            title: title.to_string(),
        });
        if let Some(metadata) = metadata {
            self.metadata.insert(id.to_string(), metadata);
        }
        true
    }

    pub fn add_language(&mut self, language: &str) {
        if self.languages.iter().any(|known| known == language) {
            return;
        }
        self.languages.push(language.to_string());
        self.values.entry(language.to_string()).or_default();
        self.sources.entry(language.to_string()).or_default();
    }

    /// Writes one cell, registering the language if needed.
    ///
    /// # Errors
    /// Returns [`SurveyError::UnknownQuestion`] for unregistered questions,
    /// [`SurveyError::Validation`] for non-finite values and
    /// [`SurveyError::MatrixRangeViolation`] when the value leaves the
    /// question's declared scale.
    pub fn set_value(
        &mut self,
        language: &str,
        question_id: &str,
        value: f64,
        source_file: &str,
    ) -> Result<(), SurveyError> {
        if !self.has_question(question_id) {
            return Err(SurveyError::UnknownQuestion(question_id.to_string()));
        }
        if !value.is_finite() {
            return Err(SurveyError::Validation(format!(
                "{language}/{question_id} value MUST be finite"
            )));
        }
        if let Some(metadata) = self.metadata.get(question_id) {
            metadata.check(language, question_id, value)?;
        }

        self.add_language(language);
        self.values
            .entry(language.to_string())
            .or_default()
            .insert(question_id.to_string(), value);
        self.sources
            .entry(language.to_string())
            .or_default()
            .insert(question_id.to_string(), source_file.to_string());
        Ok(())
    }

    /// Combines two stores into a new one.
    ///
    /// Questions and languages keep `self`'s order followed by the ones only
    /// `other` knows. Metadata and cell values from `self` win, so the merge is
    /// not commutative and the fold order of result files decides conflicts.
    ///
    /// # Errors
    /// Returns [`SurveyError::MatrixRangeViolation`] when a cell copied from
    /// `other` violates the metadata kept from `self`.
    pub fn merge(&self, other: &Self) -> Result<Self, SurveyError> {
        let mut merged = Self::new();
        for question in self.questions.iter().chain(&other.questions) {
            let metadata = self
                .metadata
                .get(&question.id)
                .or_else(|| other.metadata.get(&question.id))
                .cloned();
            merged.add_question(&question.id, &question.title, metadata);
        }
        for language in self.languages.iter().chain(&other.languages) {
            merged.add_language(language);
        }
        for store in [self, other] {
            for (language, cells) in &store.values {
                for (question_id, value) in cells {
                    if merged.value(language, question_id).is_some() {
                        continue;
                    }
                    let source = store.source(language, question_id).unwrap_or_default();
                    merged.set_value(language, question_id, *value, source)?;
                }
            }
        }
        Ok(merged)
    }

    #[must_use]
    pub fn get_matrix(&self) -> DenseMatrix {
        let question_ids: Vec<String> = self.questions.iter().map(|question| question.id.clone()).collect();
        let values = self
            .languages
            .iter()
            .map(|language| {
                question_ids
                    .iter()
                    .map(|question_id| {
                        self.value(language, question_id)
                            .filter(|value| !value.is_nan())
                            .unwrap_or(0.0)
                    })
                    .collect()
            })
            .collect();
        DenseMatrix {
            question_ids,
            languages: self.languages.clone(),
            values,
        }
    }

    /// # Errors
    /// Returns a descriptive [`SurveyError`] for the first broken invariant.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if self.questions.is_empty() {
            return Err(SurveyError::Validation("matrix has no questions".to_string()));
        }
        if self.languages.is_empty() {
            return Err(SurveyError::Validation("matrix has no languages".to_string()));
        }

        for language in &self.languages {
            let Some(cells) = self.values.get(language) else {
                return Err(SurveyError::Validation(format!(
                    "language '{language}' has no values map"
                )));
            };
            let Some(sources) = self.sources.get(language) else {
                return Err(SurveyError::Validation(format!(
                    "language '{language}' has no sources map"
                )));
            };
            if !cells.keys().eq(sources.keys()) {
                return Err(SurveyError::Validation(format!(
                    "language '{language}' values and sources cover different questions"
                )));
            }
        }

        for (language, cells) in &self.values {
            if !self.languages.iter().any(|known| known == language) {
                return Err(SurveyError::Validation(format!(
                    "values stored for unregistered language '{language}'"
                )));
            }
            for (question_id, value) in cells {
                if !self.has_question(question_id) {
                    return Err(SurveyError::UnknownQuestion(question_id.clone()));
                }
                if !value.is_finite() {
                    return Err(SurveyError::Validation(format!(
                        "{language}/{question_id} value MUST be finite"
                    )));
                }
                if let Some(metadata) = self.metadata.get(question_id) {
                    metadata.check(language, question_id, *value)?;
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn has_question(&self, question_id: &str) -> bool {
        self.questions.iter().any(|question| question.id == question_id)
    }

    #[must_use]
    pub fn questions(&self) -> &[QuestionEntry] {
        &self.questions
    }

    #[must_use]
    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    #[must_use]
    pub fn metadata(&self, question_id: &str) -> Option<&QuestionMetadata> {
        self.metadata.get(question_id)
    }

    #[must_use]
    pub fn value(&self, language: &str, question_id: &str) -> Option<f64> {
        self.values.get(language)?.get(question_id).copied()
    }

    #[must_use]
    pub fn source(&self, language: &str, question_id: &str) -> Option<&str> {
        self.sources
            .get(language)?
            .get(question_id)
            .map(String::as_str)
    }

    #[must_use]
    pub fn entry(&self, language: &str, question_id: &str) -> Option<MatrixEntry> {
        Some(MatrixEntry {
            value: self.value(language, question_id)?,
            source_file: self.source(language, question_id).unwrap_or_default().to_string(),
        })
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    fn column(&self, question_id: &str) -> Vec<(&str, f64)> {
        self.languages
            .iter()
            .filter_map(|language| {
                self.value(language, question_id)
                    .map(|value| (language.as_str(), value))
            })
            .collect()
    }

    #[must_use]
    pub fn debug_summary(&self) -> MatrixSummary {
        let questions = self
            .questions
            .iter()
            .map(|question| {
                let column = self.column(&question.id);
                QuestionValueRange {
                    question_id: question.id.clone(),
                    title: question.title.clone(),
                    languages_with_values: column.len(),
                    min: column.iter().map(|(_, value)| *value).reduce(f64::min),
                    max: column.iter().map(|(_, value)| *value).reduce(f64::max),
                }
            })
            .collect();
        let source_files: BTreeSet<String> = self
            .sources
            .values()
            .flat_map(|cells| cells.values().cloned())
            .collect();
        MatrixSummary {
            question_count: self.questions.len(),
            language_count: self.languages.len(),
            cell_count: self.cell_count(),
            questions,
            source_files: source_files.into_iter().collect(),
        }
    }

    /// Cross-language mean, population std and mode of each question column.
    ///
    /// Modes are taken over values rounded to one decimal; ties resolve to the
    /// smallest value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn question_summaries(&self) -> Vec<QuestionSummary> {
        self.questions
            .iter()
            .map(|question| {
                let values: Vec<f64> = self.column(&question.id).into_iter().map(|(_, value)| value).collect();
                if values.is_empty() {
                    return QuestionSummary {
                        question_id: question.id.clone(),
                        languages_reporting: 0,
                        mean: None,
                        std: None,
                        mode: None,
                    };
                }
                let count = values.len() as f64;
                let mean = values.iter().sum::<f64>() / count;
                let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / count;
                QuestionSummary {
                    question_id: question.id.clone(),
                    languages_reporting: values.len(),
                    mean: Some(mean),
                    std: Some(variance.sqrt()),
                    mode: rounded_mode(&values),
                }
            })
            .collect()
    }

    /// How far each language sits from the cross-language mean of every
    /// question it answered.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn language_deviations(&self) -> Vec<LanguageDeviation> {
        let question_means: Vec<(&str, f64)> = self
            .questions
            .iter()
            .zip(self.question_summaries())
            .filter_map(|(question, summary)| summary.mean.map(|mean| (question.id.as_str(), mean)))
            .collect();

        self.languages
            .iter()
            .map(|language| {
                let mut absolute = Vec::new();
                let mut normalized = Vec::new();
                for (question_id, question_mean) in &question_means {
                    let Some(value) = self.value(language, question_id) else {
                        continue;
                    };
                    absolute.push((value - question_mean).abs());
                    if let Some(QuestionMetadata {
                        scale_min: Some(scale_min),
                        scale_max: Some(scale_max),
                        ..
                    }) = self.metadata.get(*question_id)
                    {
                        normalized.push(normalized_deviation(value, *question_mean, *scale_min, *scale_max));
                    }
                }
                LanguageDeviation {
                    language: language.clone(),
                    questions_compared: absolute.len(),
                    mean_absolute_deviation: average(&absolute),
                    mean_normalized_deviation: average(&normalized),
                }
            })
            .collect()
    }
}

/// Signed deviation from the question mean scaled by the largest deviation
/// the scale allows, so the result lies in `[-1, 1]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn normalized_deviation(value: f64, question_mean: f64, scale_min: i64, scale_max: i64) -> f64 {
    if value.is_nan() || question_mean.is_nan() {
        return f64::NAN;
    }
    let max_possible = (scale_max as f64 - question_mean)
        .abs()
        .max((scale_min as f64 - question_mean).abs());
    if max_possible == 0.0 {
        return 0.0;
    }
    (value - question_mean) / max_possible
}

#[allow(clippy::cast_precision_loss)]
fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn rounded_mode(values: &[f64]) -> Option<f64> {
    let mut rounded: Vec<f64> = values.iter().map(|value| (value * 10.0).round() / 10.0).collect();
    rounded.sort_by(f64::total_cmp);
    let mut best: Option<(f64, usize)> = None;
    let mut idx = 0;
    while idx < rounded.len() {
        let current = rounded[idx];
        let run = rounded[idx..].iter().take_while(|value| **value == current).count();
        if best.map_or(true, |(_, count)| run > count) {
            best = Some((current, run));
        }
        idx += run;
    }
    best.map(|(value, _)| value)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionValueRange {
    pub question_id: String,
    pub title: String,
    pub languages_with_values: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatrixSummary {
    pub question_count: usize,
    pub language_count: usize,
    pub cell_count: usize,
    pub questions: Vec<QuestionValueRange>,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionSummary {
    pub question_id: String,
    pub languages_reporting: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub mode: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageDeviation {
    pub language: String,
    pub questions_compared: usize,
    pub mean_absolute_deviation: Option<f64>,
    pub mean_normalized_deviation: Option<f64>,
}

/// Builds the store for one processed result file.
///
/// Only languages in the file's `valid_languages` are admitted, and only
/// stats that carry a mean.
///
/// # Errors
/// Returns [`SurveyError::MatrixRangeViolation`] when an admitted mean leaves
/// its question's scale.
pub fn store_from_result_file(file: &ProcessedResultFile, source_file: &str) -> Result<MatrixStore, SurveyError> {
    let mut store = MatrixStore::new();
    for language in &file.quality_metrics.valid_languages {
        store.add_language(language);
    }
    for result in &file.results {
        let title = if result.title.trim().is_empty() {
            result.question_id.as_str()
        } else {
            result.title.as_str()
        };
        store.add_question(
            &result.question_id,
            title,
            Some(QuestionMetadata {
                scale_min: Some(result.scale_min),
                scale_max: Some(result.scale_max),
                scale_labels: result.scale_labels.clone(),
                category: result.category.clone(),
            }),
        );
        for (language, entry) in &result.language_stats {
            if !file.admits_language(language) {
                continue;
            }
            let Some(mean) = entry.mean else {
                continue;
            };
            store.set_value(language, &result.question_id, mean, source_file)?;
        }
    }
    Ok(store)
}

/// Reads and validates one processed result file.
///
/// # Errors
/// Returns [`SurveyError::FileFormat`] naming the path when the file cannot
/// be read or fails schema validation.
pub fn load_result_file(path: &Path) -> Result<ProcessedResultFile, SurveyError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| SurveyError::FileFormat(format!("{}: {err}", path.display())))?;
    ProcessedResultFile::from_json_str(&raw).map_err(|err| match err {
        SurveyError::FileFormat(message) => {
            SurveyError::FileFormat(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

/// `results_*.json` files in `dir`, in directory iteration order.
///
/// The order is not sorted: it is the fold order of [`merge_files`], and the
/// asymmetric merge makes it observable when files disagree.
///
/// # Errors
/// Returns an error when the directory cannot be read.
pub fn discover_result_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_result_file = path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(RESULT_FILE_PREFIX) && name.ends_with(".json"));
        if is_result_file {
            paths.push(path);
        }
    }
    Ok(paths)
}

#[must_use]
pub fn source_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| path.display().to_string(), str::to_string)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileError {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub store: Option<MatrixStore>,
    pub files_merged: Vec<String>,
    pub errors: Vec<FileError>,
    pub error_summary: Option<String>,
}

/// Loads every file into its own store and folds them in the given order.
///
/// Bad files are recorded and skipped. The store is `None` only when no file
/// could be merged.
#[must_use]
pub fn merge_files(paths: &[PathBuf]) -> MergeOutcome {
    if paths.is_empty() {
        return MergeOutcome {
            store: None,
            files_merged: Vec::new(),
            errors: Vec::new(),
            error_summary: Some("No files provided".to_string()),
        };
    }

    let mut merged: Option<MatrixStore> = None;
    let mut files_merged = Vec::new();
    let mut errors = Vec::new();

    for path in paths {
        let source = source_name(path);
        let folded = load_result_file(path)
            .and_then(|file| store_from_result_file(&file, &source))
            .and_then(|store| match &merged {
                Some(current) => current.merge(&store),
                None => Ok(store),
            });
        match folded {
            Ok(store) => {
                debug!(file = %source, cells = store.cell_count(), "merged result file");
                merged = Some(store);
                files_merged.push(source);
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "skipping result file");
                errors.push(FileError {
                    path: path.display().to_string(),
                    error: err.to_string(),
                });
            }
        }
    }

    let error_summary = if errors.is_empty() {
        None
    } else {
        let lines: Vec<String> = errors
            .iter()
            .map(|error| format!("{}: {}", error.path, error.error))
            .collect();
        Some(format!("Errors processing files:\n{}", lines.join("\n")))
    };

    match &merged {
        Some(store) if !errors.is_empty() => warn!(
            merged = files_merged.len(),
            failed = errors.len(),
            cells = store.cell_count(),
            "returning partial matrix"
        ),
        Some(store) => info!(
            merged = files_merged.len(),
            cells = store.cell_count(),
            "merged result files"
        ),
        None => warn!(failed = errors.len(), "no result file could be merged"),
    }

    MergeOutcome {
        store: merged,
        files_merged,
        errors,
        error_summary,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsolidatedQuestion {
    pub question_id: String,
    pub title: String,
    pub category: String,
    pub scale_min: i64,
    pub scale_max: i64,
    pub scale_labels: Option<ScaleLabels>,
    pub prompt_text: String,
    pub language_stats: BTreeMap<String, LanguageQuestionStats>,
    pub source_files: Vec<String>,
}

/// Merges raw per-question statistics of several result files.
///
/// Stats for the same language are combined with
/// [`LanguageQuestionStats::combine`]; descriptive fields missing from the
/// first file defining a question are filled from later ones.
///
/// # Errors
/// Returns [`SurveyError::Validation`] when a file carries a count without a
/// mean.
pub fn consolidate(files: &[(String, ProcessedResultFile)]) -> Result<Vec<ConsolidatedQuestion>, SurveyError> {
    let mut consolidated: Vec<ConsolidatedQuestion> = Vec::new();
    for (source, file) in files {
        for result in &file.results {
            let position = consolidated
                .iter()
                .position(|existing| existing.question_id == result.question_id);
            let index = if let Some(index) = position {
                index
            } else {
                consolidated.push(ConsolidatedQuestion {
                    question_id: result.question_id.clone(),
                    title: String::new(),
                    category: String::new(),
                    scale_min: result.scale_min,
                    scale_max: result.scale_max,
                    scale_labels: None,
                    prompt_text: String::new(),
                    language_stats: BTreeMap::new(),
                    source_files: Vec::new(),
                });
                consolidated.len() - 1
            };
            let target = &mut consolidated[index];
            fill_if_empty(&mut target.title, &result.title);
            fill_if_empty(&mut target.category, &result.category);
            fill_if_empty(&mut target.prompt_text, &result.prompt_text);
            if target.scale_labels.is_none() {
                target.scale_labels.clone_from(&result.scale_labels);
            }
            if !target.source_files.contains(source) {
                target.source_files.push(source.clone());
            }

            for (language, entry) in &result.language_stats {
                let incoming = entry.to_stats(language, &result.question_id, source);
                let combined = match target.language_stats.get(language) {
                    Some(existing) => existing.combine(&incoming)?,
                    None => incoming,
                };
                target.language_stats.insert(language.clone(), combined);
            }
        }
    }
    Ok(consolidated)
}

fn fill_if_empty(target: &mut String, candidate: &str) {
    if target.trim().is_empty() && !candidate.trim().is_empty() {
        *target = candidate.to_string();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoverageClass {
    Complete,
    Partial,
    Sparse,
}

impl CoverageClass {
    #[must_use]
    pub fn from_missing_ratio(missing_ratio: f64) -> Self {
        if missing_ratio < 0.05 {
            Self::Complete
        } else if missing_ratio < 0.2 {
            Self::Partial
        } else {
            Self::Sparse
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageCatalogEntry {
    pub language: String,
    pub questions_present: usize,
    pub total_questions: usize,
    pub coverage_ratio: f64,
    pub total_responses: u64,
    pub best_quality: Option<LanguageQualityMetrics>,
    pub disabled: bool,
    pub coverage_class: CoverageClass,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageCatalog {
    pub total_questions: usize,
    pub latest_timestamp: Option<String>,
    pub languages: Vec<LanguageCatalogEntry>,
}

/// Per-language availability across result files, for language pickers.
///
/// A language is disabled when more than 80% of the questions lack data or
/// its best quality record failed the gate.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn language_catalog(files: &[ProcessedResultFile]) -> LanguageCatalog {
    let mut question_ids = BTreeSet::new();
    let mut present: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut responses: BTreeMap<&str, u64> = BTreeMap::new();
    let mut best: BTreeMap<&str, &LanguageQualityMetrics> = BTreeMap::new();
    let mut latest_timestamp: Option<&str> = None;

    for file in files {
        let stamp = file.quality_metrics.timestamp.as_str();
        if !stamp.is_empty() && latest_timestamp.map_or(true, |latest| stamp > latest) {
            latest_timestamp = Some(stamp);
        }
        for result in &file.results {
            question_ids.insert(result.question_id.as_str());
            for (language, entry) in &result.language_stats {
                let answered = present.entry(language.as_str()).or_default();
                if entry.count > 0 {
                    answered.insert(result.question_id.as_str());
                }
                *responses.entry(language.as_str()).or_default() += entry.count;
            }
        }
        for (language, metrics) in &file.quality_metrics.language_quality {
            present.entry(language.as_str()).or_default();
            let score = metrics.avg_verification_score.unwrap_or(f64::NEG_INFINITY);
            let replace = best.get(language.as_str()).map_or(true, |current| {
                score > current.avg_verification_score.unwrap_or(f64::NEG_INFINITY)
            });
            if replace {
                best.insert(language.as_str(), metrics);
            }
        }
    }

    let total_questions = question_ids.len();
    let languages = present
        .into_iter()
        .map(|(language, answered)| {
            let coverage_ratio = if total_questions == 0 {
                0.0
            } else {
                answered.len() as f64 / total_questions as f64
            };
            let missing_ratio = 1.0 - coverage_ratio;
            let best_quality = best.get(language).map(|metrics| (*metrics).clone());
            let failed_gate = best_quality
                .as_ref()
                .is_some_and(|metrics| !metrics.passes_threshold);
            LanguageCatalogEntry {
                language: language.to_string(),
                questions_present: answered.len(),
                total_questions,
                coverage_ratio,
                total_responses: responses.get(language).copied().unwrap_or_default(),
                best_quality,
                disabled: missing_ratio > 0.8 || failed_gate,
                coverage_class: CoverageClass::from_missing_ratio(missing_ratio),
            }
        })
        .collect();

    LanguageCatalog {
        total_questions,
        latest_timestamp: latest_timestamp.map(str::to_string),
        languages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyglot_survey_core::{
        LanguageStatsEntry, QualityEnvelope, QualityThresholds, QuestionResult,
    };
    use proptest::prelude::*;
    use serde_json::json;
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn store_with(cells: &[(&str, &str, f64)], source: &str) -> MatrixStore {
        let mut store = MatrixStore::new();
        for (_, question_id, _) in cells {
            store.add_question(question_id, &format!("Title {question_id}"), Some(QuestionMetadata::bounded(1, 5)));
        }
        for (language, question_id, value) in cells {
            must(store.set_value(language, question_id, *value, source));
        }
        store
    }

    fn metrics(language: &str, passes: bool, score: Option<f64>) -> LanguageQualityMetrics {
        LanguageQualityMetrics {
            language: language.to_string(),
            questions_answered: 1,
            total_questions: 1,
            coverage_ratio: 1.0,
            avg_verification_score: score,
            avg_response_std: Some(0.5),
            passes_threshold: passes,
            is_reference_language: language == "English",
            total_valid_responses: 5,
            questions_below_min_responses: 0,
            reason_codes: Vec::new(),
        }
    }

    fn fixture_file(
        stats: &[(&str, &str, u64, Option<f64>)],
        valid: &[&str],
        timestamp: &str,
    ) -> ProcessedResultFile {
        let mut results: Vec<QuestionResult> = Vec::new();
        let mut language_quality = BTreeMap::new();
        for (language, question_id, count, mean) in stats {
            if !results.iter().any(|result| result.question_id == *question_id) {
                results.push(QuestionResult {
                    question_id: (*question_id).to_string(),
                    title: format!("Title {question_id}"),
                    category: "values".to_string(),
                    scale_min: 1,
                    scale_max: 5,
                    scale_labels: None,
                    prompt_text: String::new(),
                    language_stats: BTreeMap::new(),
                });
            }
            if let Some(result) = results.iter_mut().find(|result| result.question_id == *question_id) {
                result.language_stats.insert(
                    (*language).to_string(),
                    LanguageStatsEntry {
                        count: *count,
                        mean: *mean,
                        std: mean.map(|_| 0.5),
                        quality_metrics: None,
                    },
                );
            }
            language_quality.insert(
                (*language).to_string(),
                metrics(language, valid.contains(language), Some(4.5)),
            );
        }
        ProcessedResultFile {
            results,
            quality_metrics: QualityEnvelope {
                thresholds: QualityThresholds::v1(),
                language_quality,
                timestamp: timestamp.to_string(),
                total_questions: 2,
                valid_languages: valid.iter().map(|language| (*language).to_string()).collect(),
                source_file: "run".to_string(),
            },
        }
    }

    fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        must(fs::write(&path, body));
        path
    }

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("polyglot-matrix-{label}-{}", Ulid::new()));
        must(fs::create_dir_all(&dir));
        dir
    }

    #[test]
    fn first_question_registration_wins() {
        let mut store = MatrixStore::new();
        assert!(store.add_question("Q1", "Original", Some(QuestionMetadata::bounded(1, 5))));
        assert!(!store.add_question("Q1", "Replacement", Some(QuestionMetadata::bounded(0, 100))));
        assert_eq!(store.questions()[0].title, "Original");
        assert_eq!(must_some(store.metadata("Q1")).scale_max, Some(5));
    }

    #[test]
    fn set_value_enforces_question_and_range() {
        let mut store = MatrixStore::new();
        store.add_question("Q1", "Family", Some(QuestionMetadata::bounded(1, 5)));

        assert!(matches!(
            store.set_value("French", "Q9", 3.0, "a.json"),
            Err(SurveyError::UnknownQuestion(id)) if id == "Q9"
        ));
        assert!(matches!(
            store.set_value("French", "Q1", 5.5, "a.json"),
            Err(SurveyError::MatrixRangeViolation { scale_max: 5, .. })
        ));
        assert!(store.set_value("French", "Q1", f64::NAN, "a.json").is_err());
        assert!(store.languages().is_empty());

        must(store.set_value("French", "Q1", 5.0, "a.json"));
        assert_eq!(store.languages(), ["French".to_string()]);
        assert_eq!(
            store.entry("French", "Q1"),
            Some(MatrixEntry {
                value: 5.0,
                source_file: "a.json".to_string()
            })
        );
    }

    #[test]
    fn questions_without_metadata_accept_any_finite_value() {
        let mut store = MatrixStore::new();
        store.add_question("Q1", "Free", None);
        must(store.set_value("French", "Q1", 42.0, "a.json"));
        assert_eq!(store.value("French", "Q1"), Some(42.0));
    }

    #[test]
    fn merge_keeps_receiver_values_and_is_not_commutative() {
        let a = store_with(&[("French", "Q1", 2.0)], "a.json");
        let b = store_with(&[("French", "Q1", 4.0), ("French", "Q2", 3.0)], "b.json");
        let a_before = a.clone();
        let b_before = b.clone();

        let ab = must(a.merge(&b));
        assert_eq!(ab.value("French", "Q1"), Some(2.0));
        assert_eq!(ab.value("French", "Q2"), Some(3.0));
        assert_eq!(ab.source("French", "Q1"), Some("a.json"));
        assert_eq!(ab.source("French", "Q2"), Some("b.json"));

        let ba = must(b.merge(&a));
        assert_eq!(ba.value("French", "Q1"), Some(4.0));
        assert_eq!(a, a_before);
        assert_eq!(b, b_before);
    }

    #[test]
    fn merge_prefers_receiver_metadata_and_orders_languages() {
        let mut narrow = MatrixStore::new();
        narrow.add_question("Q1", "Narrow", Some(QuestionMetadata::bounded(1, 4)));
        narrow.add_language("German");
        let mut wide = MatrixStore::new();
        wide.add_question("Q1", "Wide", Some(QuestionMetadata::bounded(1, 10)));
        must(wide.set_value("French", "Q1", 9.0, "wide.json"));

        let merged = narrow.merge(&wide);
        assert!(matches!(merged, Err(SurveyError::MatrixRangeViolation { .. })));

        let reversed = must(wide.merge(&narrow));
        assert_eq!(reversed.languages(), ["French".to_string(), "German".to_string()]);
        assert_eq!(reversed.questions()[0].title, "Wide");
    }

    #[test]
    fn dense_matrix_fills_missing_cells_with_zero() {
        let store = store_with(&[("French", "Q1", 2.0), ("German", "Q2", 3.0)], "a.json");
        let dense = store.get_matrix();
        assert_eq!(dense.question_ids, vec!["Q1", "Q2"]);
        assert_eq!(dense.languages, vec!["French", "German"]);
        assert_eq!(dense.values, vec![vec![2.0, 0.0], vec![0.0, 3.0]]);
        assert!(store.value("French", "Q2").is_none());
    }

    #[test]
    fn validate_reports_empty_and_inconsistent_stores() {
        assert!(MatrixStore::new().validate().is_err());
        let mut no_languages = MatrixStore::new();
        no_languages.add_question("Q1", "Family", None);
        assert!(matches!(no_languages.validate(), Err(SurveyError::Validation(message)) if message.contains("languages")));

        let store = store_with(&[("French", "Q1", 2.0)], "a.json");
        must(store.validate());

        let mut snapshot = must(serde_json::to_value(&store));
        snapshot["sources"]["French"] = json!({});
        assert!(MatrixStore::from_json_value(snapshot).is_err());

        let mut out_of_range = must(serde_json::to_value(&store));
        out_of_range["values"]["French"]["Q1"] = json!(9.0);
        assert!(matches!(
            MatrixStore::from_json_value(out_of_range),
            Err(SurveyError::MatrixRangeViolation { .. })
        ));
    }

    #[test]
    fn result_file_store_admits_only_gated_languages() {
        let file = fixture_file(
            &[
                ("English", "Q1", 5, Some(3.0)),
                ("French", "Q1", 5, Some(4.0)),
                ("German", "Q1", 0, None),
            ],
            &["English", "German"],
            "20260101_000000",
        );
        let store = must(store_from_result_file(&file, "results_a.json"));
        assert_eq!(store.value("English", "Q1"), Some(3.0));
        assert!(store.value("French", "Q1").is_none());
        assert!(store.value("German", "Q1").is_none());
        assert_eq!(store.languages(), ["English".to_string(), "German".to_string()]);
        assert_eq!(must_some(store.metadata("Q1")).category, "values");
    }

    #[test]
    fn merge_files_folds_in_order_and_skips_bad_files() {
        let dir = scratch_dir("fold");
        let a = fixture_file(&[("French", "Q1", 5, Some(2.0))], &["French"], "20260101_000000");
        let b = fixture_file(
            &[("French", "Q1", 5, Some(4.0)), ("French", "Q2", 5, Some(3.0))],
            &["French"],
            "20260102_000000",
        );
        let path_a = write_file(&dir, "results_a.json", &must(serde_json::to_string(&a)));
        let path_b = write_file(&dir, "results_b.json", &must(serde_json::to_string(&b)));
        let broken = write_file(&dir, "results_broken.json", r#"{"results": []}"#);

        let outcome = merge_files(&[path_a.clone(), broken.clone(), path_b.clone()]);
        let store = must_some(outcome.store);
        assert_eq!(store.value("French", "Q1"), Some(2.0));
        assert_eq!(store.value("French", "Q2"), Some(3.0));
        assert_eq!(outcome.files_merged, vec!["results_a.json", "results_b.json"]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(must_some(outcome.error_summary).contains("quality_metrics"));

        let reversed = merge_files(&[path_b, path_a]);
        assert_eq!(must_some(reversed.store).value("French", "Q1"), Some(4.0));

        let all_bad = merge_files(&[broken, dir.join("results_missing.json")]);
        assert!(all_bad.store.is_none());
        assert_eq!(all_bad.errors.len(), 2);
        assert!(must_some(all_bad.error_summary).starts_with("Errors processing files:"));

        let discovered = must(discover_result_files(&dir));
        assert_eq!(discovered.len(), 3);
        must(fs::remove_dir_all(&dir));
    }

    #[test]
    fn range_violation_rejects_the_whole_file() {
        let dir = scratch_dir("range");
        let bad = fixture_file(&[("French", "Q1", 5, Some(7.5))], &["French"], "20260101_000000");
        let good = fixture_file(&[("German", "Q1", 5, Some(2.5))], &["German"], "20260101_000000");
        let bad_path = write_file(&dir, "results_bad.json", &must(serde_json::to_string(&bad)));
        let good_path = write_file(&dir, "results_good.json", &must(serde_json::to_string(&good)));

        let outcome = merge_files(&[bad_path, good_path]);
        let store = must_some(outcome.store);
        assert!(store.value("French", "Q1").is_none());
        assert_eq!(store.value("German", "Q1"), Some(2.5));
        assert!(outcome.errors[0].error.contains("matrix range violation"));
        must(fs::remove_dir_all(&dir));
    }

    #[test]
    fn empty_input_reports_no_files() {
        let outcome = merge_files(&[]);
        assert!(outcome.store.is_none());
        assert_eq!(outcome.error_summary.as_deref(), Some("No files provided"));
    }

    #[test]
    fn consolidation_combines_counts_means_and_fills_fields() {
        let mut first = fixture_file(&[("French", "Q1", 2, Some(2.0))], &["French"], "20260101_000000");
        first.results[0].title = String::new();
        let second = fixture_file(&[("French", "Q1", 6, Some(4.0)), ("German", "Q1", 3, Some(1.0))], &["French"], "20260102_000000");

        let consolidated = must(consolidate(&[
            ("a.json".to_string(), first),
            ("b.json".to_string(), second),
        ]));
        assert_eq!(consolidated.len(), 1);
        let question = &consolidated[0];
        assert_eq!(question.title, "Title Q1");
        assert_eq!(question.source_files, vec!["a.json", "b.json"]);
        let french = must_some(question.language_stats.get("French"));
        assert_eq!(french.count, 8);
        assert_eq!(french.mean, Some(3.5));
        assert_eq!(french.source_id, "a.json+b.json");
        assert_eq!(must_some(question.language_stats.get("German")).count, 3);
    }

    #[test]
    fn catalog_disables_sparse_or_failing_languages() {
        let first = fixture_file(
            &[
                ("English", "Q1", 5, Some(3.0)),
                ("English", "Q2", 5, Some(3.0)),
                ("French", "Q1", 5, Some(4.0)),
                ("Welsh", "Q1", 0, None),
            ],
            &["English"],
            "20260101_000000",
        );
        let second = fixture_file(&[("French", "Q2", 5, Some(4.0))], &["French"], "20260105_000000");

        let catalog = language_catalog(&[first, second]);
        assert_eq!(catalog.total_questions, 2);
        assert_eq!(catalog.latest_timestamp.as_deref(), Some("20260105_000000"));

        let find = |language: &str| must_some(catalog.languages.iter().find(|entry| entry.language == language));
        let english = find("English");
        assert!(!english.disabled);
        assert_eq!(english.coverage_class, CoverageClass::Complete);

        let french = find("French");
        assert_eq!(french.questions_present, 2);
        assert_eq!(french.total_responses, 10);

        let welsh = find("Welsh");
        assert!(welsh.disabled);
        assert_eq!(welsh.coverage_class, CoverageClass::Sparse);
    }

    #[test]
    fn analytics_summarise_columns_and_deviations() {
        let store = store_with(
            &[("English", "Q1", 2.0), ("French", "Q1", 4.0), ("German", "Q1", 4.0)],
            "a.json",
        );
        let summaries = store.question_summaries();
        let q1 = &summaries[0];
        assert_eq!(q1.languages_reporting, 3);
        assert!((must_some(q1.mean) - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(q1.mode, Some(4.0));

        let deviations = store.language_deviations();
        let english = must_some(deviations.iter().find(|item| item.language == "English"));
        assert!((must_some(english.mean_absolute_deviation) - 4.0 / 3.0).abs() < 1e-9);
        assert!(must_some(english.mean_normalized_deviation) < 0.0);

        assert!((normalized_deviation(5.0, 3.0, 1, 5) - 1.0).abs() < 1e-9);
        assert!(normalized_deviation(f64::NAN, 3.0, 1, 5).is_nan());
        assert_eq!(rounded_mode(&[1.04, 1.0, 2.0, 2.0, 1.01]), Some(1.0));

        let summary = store.debug_summary();
        assert_eq!(summary.cell_count, 3);
        assert_eq!(summary.questions[0].min, Some(2.0));
        assert_eq!(summary.source_files, vec!["a.json"]);
    }

    fn arb_store() -> impl Strategy<Value = MatrixStore> {
        proptest::collection::vec((0_usize..3, 0_usize..3, 1.0_f64..5.0), 0..8).prop_map(|cells| {
            let languages = ["English", "French", "German"];
            let questions = ["Q1", "Q2", "Q3"];
            let mut store = MatrixStore::new();
            for question in questions {
                store.add_question(question, question, Some(QuestionMetadata::bounded(1, 5)));
            }
            for (language, question, value) in cells {
                let _ = store.set_value(languages[language], questions[question], value, "gen.json");
            }
            store
        })
    }

    proptest! {
        #[test]
        fn merge_with_itself_is_identity(store in arb_store()) {
            let merged = store.merge(&store);
            prop_assert!(merged.is_ok());
            prop_assert_eq!(merged.unwrap_or_else(|_| unreachable!()), store);
        }

        #[test]
        fn receiver_wins_every_shared_cell(left in arb_store(), right in arb_store()) {
            let merged = left.merge(&right);
            prop_assert!(merged.is_ok());
            let merged = merged.unwrap_or_else(|_| unreachable!());
            for language in left.languages() {
                for question in left.questions() {
                    if let Some(value) = left.value(language, &question.id) {
                        prop_assert_eq!(merged.value(language, &question.id), Some(value));
                    }
                }
            }
            prop_assert!(merged.cell_count() >= left.cell_count());
        }
    }
}
