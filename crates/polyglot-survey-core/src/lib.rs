use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub const DEFAULT_REFERENCE_LANGUAGE: &str = "English";

pub const REFERENCE_LANGUAGE_MARKER: &str = "[N/A - reference language]";
pub const BACK_TRANSLATION_NOT_PERFORMED: &str = "[Back-translation not performed]";
pub const BACK_TRANSLATION_FAILED: &str = "[Back-translation failed]";
pub const BACK_TRANSLATION_SKIPPED: &str = "[Back-translation skipped]";
pub const TRANSLATION_DISABLED_MARKER: &str = "[Translation disabled]";

/// Replacement text for translations removed by [`clear_overlong_translations`].
pub const CLEARED_TEXT_MARKER: &str = "NA";

const SENTINEL_MARKERS: [&str; 6] = [
    REFERENCE_LANGUAGE_MARKER,
    BACK_TRANSLATION_NOT_PERFORMED,
    BACK_TRANSLATION_FAILED,
    BACK_TRANSLATION_SKIPPED,
    TRANSLATION_DISABLED_MARKER,
    CLEARED_TEXT_MARKER,
];

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SurveyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("file format error: {0}")]
    FileFormat(String),
    #[error("unknown question '{0}'")]
    UnknownQuestion(String),
    #[error(
        "matrix range violation: {language}/{question_id} value {value} outside [{scale_min}, {scale_max}]"
    )]
    MatrixRangeViolation {
        language: String,
        question_id: String,
        value: f64,
        scale_min: i64,
        scale_max: i64,
    },
}

/// Case-insensitive language comparison used for reference-language checks.
#[must_use]
pub fn same_language(left: &str, right: &str) -> bool {
    left.trim().eq_ignore_ascii_case(right.trim())
}

#[must_use]
pub fn is_sentinel_marker(text: &str) -> bool {
    SENTINEL_MARKERS.contains(&text)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScaleLabels {
    Levels(Vec<String>),
    Bounds { min: String, max: String },
    Numbered(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    #[serde(rename = "question_id")]
    pub id: String,
    #[serde(rename = "question_title", alias = "title", default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    pub scale_min: i64,
    pub scale_max: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_labels: Option<ScaleLabels>,
    #[serde(default)]
    pub prompt_text: String,
}

impl Question {
    /// # Errors
    /// Returns [`SurveyError::Validation`] when the id is blank or the scale is empty.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if self.id.trim().is_empty() {
            return Err(SurveyError::Validation(
                "question_id MUST be non-empty".to_string(),
            ));
        }
        if self.scale_min >= self.scale_max {
            return Err(SurveyError::Validation(format!(
                "question '{}' scale_min MUST be < scale_max",
                self.id
            )));
        }
        if self.scale_span().is_none() {
            return Err(SurveyError::Validation(format!(
                "question '{}' scale range {}..={} is too wide",
                self.id, self.scale_min, self.scale_max
            )));
        }
        Ok(())
    }

    /// Number of levels on the scale; `0` when the range cannot be counted.
    #[must_use]
    pub fn scale_points(&self) -> usize {
        self.scale_span().unwrap_or(0)
    }

    fn scale_span(&self) -> Option<usize> {
        self.scale_max
            .checked_sub(self.scale_min)
            .and_then(|span| span.checked_add(1))
            .and_then(|points| usize::try_from(points).ok())
    }

    /// One label per scale level, in ascending order.
    ///
    /// A `{min, max}` pair expands to `[min, "Level 2", .., "Level n-1", max]`;
    /// numbered maps fall back to `"Level i"` for unlabelled levels.
    #[must_use]
    pub fn resolved_labels(&self) -> Vec<String> {
        let levels = self.scale_min..=self.scale_max;
        match &self.scale_labels {
            Some(ScaleLabels::Levels(labels)) => labels.clone(),
            Some(ScaleLabels::Bounds { min, max }) => {
                let mut labels = vec![min.clone()];
                labels.extend((2..self.scale_points()).map(|level| format!("Level {level}")));
                labels.push(max.clone());
                labels
            }
            Some(ScaleLabels::Numbered(named)) => levels
                .map(|level| {
                    named
                        .get(&level.to_string())
                        .cloned()
                        .unwrap_or_else(|| format!("Level {level}"))
                })
                .collect(),
            None => levels.map(|level| level.to_string()).collect(),
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn admits(&self, value: f64) -> bool {
        value.is_finite() && value >= self.scale_min as f64 && value <= self.scale_max as f64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TranslationSettings {
    #[serde(default)]
    pub use_translation: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SurveyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub recommended_trials: Option<u32>,
    #[serde(default)]
    pub default_languages: Vec<String>,
    #[serde(default)]
    pub translation_settings: TranslationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SurveySection {
    #[serde(default)]
    pub metadata: SurveyMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurveyDefinition {
    pub questions: Vec<Question>,
    #[serde(default)]
    pub survey: SurveySection,
}

impl SurveyDefinition {
    /// # Errors
    /// Returns [`SurveyError::FileFormat`] when the payload is not valid JSON
    /// or does not match the survey definition schema.
    pub fn from_json_str(raw: &str) -> Result<Self, SurveyError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| SurveyError::FileFormat(format!("invalid survey JSON: {err}")))?;
        Self::from_value(value)
    }

    /// # Errors
    /// Returns [`SurveyError::FileFormat`] on schema mismatch and
    /// [`SurveyError::Validation`] when the questions are inconsistent.
    pub fn from_value(value: Value) -> Result<Self, SurveyError> {
        let definition: Self = serde_json::from_value(value).map_err(|err| {
            SurveyError::FileFormat(format!("survey definition schema mismatch: {err}"))
        })?;
        definition.validate()?;
        Ok(definition)
    }

    /// # Errors
    /// Returns [`SurveyError::Validation`] for an empty survey, duplicate ids,
    /// invalid scales or questions without prompt text.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if self.questions.is_empty() {
            return Err(SurveyError::Validation(
                "survey MUST define at least one question".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for question in &self.questions {
            question.validate()?;
            if question.prompt_text.trim().is_empty() {
                return Err(SurveyError::Validation(format!(
                    "question '{}' prompt_text MUST be non-empty",
                    question.id
                )));
            }
            if !seen.insert(question.id.as_str()) {
                return Err(SurveyError::Validation(format!(
                    "duplicate question_id '{}'",
                    question.id
                )));
            }
        }
        if self.survey.metadata.recommended_trials == Some(0) {
            return Err(SurveyError::Validation(
                "recommended_trials MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|question| question.id == question_id)
    }
}

/// One administered trial. Absent `response_value` means extraction failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    pub language: String,
    pub question_id: String,
    pub trial_number: u32,
    pub original_prompt: String,
    pub translated_prompt: String,
    pub back_translated_prompt: String,
    pub verification_score: Option<u8>,
    pub response_value: Option<f64>,
}

impl TrialRecord {
    /// # Errors
    /// Returns [`SurveyError::Validation`] when a field breaks the record invariants.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if self.language.trim().is_empty() || self.question_id.trim().is_empty() {
            return Err(SurveyError::Validation(
                "trial record language and question_id MUST be non-empty".to_string(),
            ));
        }
        if self.trial_number == 0 {
            return Err(SurveyError::Validation(
                "trial_number is 1-based".to_string(),
            ));
        }
        if let Some(score) = self.verification_score {
            if !(1..=5).contains(&score) {
                return Err(SurveyError::Validation(format!(
                    "verification_score {score} outside 1..=5"
                )));
            }
        }
        if self.response_value.is_some_and(|value| !value.is_finite()) {
            return Err(SurveyError::Validation(
                "response_value MUST be finite when present".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageQuestionStats {
    pub language: String,
    pub question_id: String,
    pub count: u64,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub source_id: String,
}

impl LanguageQuestionStats {
    #[must_use]
    pub fn empty(language: &str, question_id: &str, source_id: &str) -> Self {
        Self {
            language: language.to_string(),
            question_id: question_id.to_string(),
            count: 0,
            mean: None,
            std: None,
            source_id: source_id.to_string(),
        }
    }

    /// Reduces the trials of one (language, question) pair.
    ///
    /// Only present values `>= scale_min` count. `std` is the population
    /// standard deviation.
    ///
    /// # Errors
    /// Returns [`SurveyError::Validation`] when a record belongs to another
    /// language or question.
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(
        language: &str,
        question: &Question,
        records: &[TrialRecord],
        source_id: &str,
    ) -> Result<Self, SurveyError> {
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            if !same_language(&record.language, language) || record.question_id != question.id {
                return Err(SurveyError::Validation(format!(
                    "trial record {}/{} cannot be aggregated into {language}/{}",
                    record.language, record.question_id, question.id
                )));
            }
            if let Some(value) = record.response_value {
                if value.is_finite() && value >= question.scale_min as f64 {
                    valid.push(value);
                }
            }
        }

        let mut stats = Self::empty(language, &question.id, source_id);
        if valid.is_empty() {
            return Ok(stats);
        }

        let count = valid.len() as f64;
        let mean = valid.iter().sum::<f64>() / count;
        let variance = valid
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f64>()
            / count;

        stats.count = valid.len() as u64;
        stats.mean = Some(mean);
        stats.std = Some(variance.sqrt());
        Ok(stats)
    }

    /// Combines two aggregates of the same (language, question).
    ///
    /// The mean is count-weighted. The combined `std` is the larger of the two
    /// input stds rather than a pooled deviation; published statistics rely on
    /// this approximation, so it stays.
    ///
    /// # Errors
    /// Returns [`SurveyError::Validation`] for mismatched keys or a non-empty
    /// side without a mean.
    #[allow(clippy::cast_precision_loss)]
    pub fn combine(&self, other: &Self) -> Result<Self, SurveyError> {
        if !same_language(&self.language, &other.language) || self.question_id != other.question_id
        {
            return Err(SurveyError::Validation(format!(
                "cannot combine {}/{} with {}/{}",
                self.language, self.question_id, other.language, other.question_id
            )));
        }

        let source_id = if self.source_id == other.source_id || other.source_id.is_empty() {
            self.source_id.clone()
        } else if self.source_id.is_empty() {
            other.source_id.clone()
        } else {
            format!("{}+{}", self.source_id, other.source_id)
        };

        let count = self.count.saturating_add(other.count);
        if count == 0 {
            return Ok(Self {
                source_id,
                ..Self::empty(&self.language, &self.question_id, "")
            });
        }

        let weighted_sum = self.weighted_sum()? + other.weighted_sum()?;
        let std = match (self.std, other.std) {
            (Some(left), Some(right)) => Some(left.max(right)),
            (Some(single), None) | (None, Some(single)) => Some(single),
            (None, None) => None,
        };

        Ok(Self {
            language: self.language.clone(),
            question_id: self.question_id.clone(),
            count,
            mean: Some(weighted_sum / count as f64),
            std,
            source_id,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn weighted_sum(&self) -> Result<f64, SurveyError> {
        if self.count == 0 {
            return Ok(0.0);
        }
        match self.mean {
            Some(mean) if mean.is_finite() => Ok(mean * self.count as f64),
            _ => Err(SurveyError::Validation(format!(
                "{}/{} has count {} but no finite mean",
                self.language, self.question_id, self.count
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityThresholds {
    pub min_verification_score: f64,
    pub min_responses_per_question: u32,
    pub required_coverage_ratio: f64,
    pub max_avg_std: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self::v1()
    }
}

impl QualityThresholds {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            min_verification_score: 4.0,
            min_responses_per_question: 5,
            required_coverage_ratio: 1.0,
            max_avg_std: 3.0,
        }
    }

    /// # Errors
    /// Returns [`SurveyError::Configuration`] when a threshold is out of bounds.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if !(1.0..=5.0).contains(&self.min_verification_score) {
            return Err(SurveyError::Configuration(
                "min_verification_score MUST be in [1.0, 5.0]".to_string(),
            ));
        }
        if !(self.required_coverage_ratio > 0.0 && self.required_coverage_ratio <= 1.0) {
            return Err(SurveyError::Configuration(
                "required_coverage_ratio MUST be in (0.0, 1.0]".to_string(),
            ));
        }
        if !self.max_avg_std.is_finite() || self.max_avg_std < 0.0 {
            return Err(SurveyError::Configuration(
                "max_avg_std MUST be a finite value >= 0.0".to_string(),
            ));
        }
        if self.min_responses_per_question == 0 {
            return Err(SurveyError::Configuration(
                "min_responses_per_question MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`SurveyError::Configuration`] when the payload does not
    /// deserialize or fails [`QualityThresholds::validate`].
    pub fn from_json(value: &Value) -> Result<Self, SurveyError> {
        let thresholds: Self = serde_json::from_value(value.clone()).map_err(|err| {
            SurveyError::Configuration(format!("invalid thresholds JSON payload: {err}"))
        })?;
        thresholds.validate()?;
        Ok(thresholds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageQualityMetrics {
    pub language: String,
    pub questions_answered: usize,
    pub total_questions: usize,
    pub coverage_ratio: f64,
    pub avg_verification_score: Option<f64>,
    pub avg_response_std: Option<f64>,
    pub passes_threshold: bool,
    #[serde(default)]
    pub is_reference_language: bool,
    #[serde(default)]
    pub total_valid_responses: u64,
    #[serde(default)]
    pub questions_below_min_responses: usize,
    #[serde(default)]
    pub reason_codes: Vec<String>,
}

/// Aggregated stats for one (language, question) plus the verification
/// score of the translation the trials were run with.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionEvidence {
    pub stats: LanguageQuestionStats,
    pub verification_score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityGate {
    thresholds: QualityThresholds,
    reference_language: String,
}

impl QualityGate {
    /// # Errors
    /// Returns [`SurveyError::Configuration`] for invalid thresholds or a blank
    /// reference language.
    pub fn new(thresholds: QualityThresholds, reference_language: &str) -> Result<Self, SurveyError> {
        thresholds.validate()?;
        if reference_language.trim().is_empty() {
            return Err(SurveyError::Configuration(
                "reference language MUST be non-empty".to_string(),
            ));
        }
        Ok(Self {
            thresholds,
            reference_language: reference_language.trim().to_string(),
        })
    }

    #[must_use]
    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    #[must_use]
    pub fn reference_language(&self) -> &str {
        &self.reference_language
    }

    #[must_use]
    pub fn is_reference_language(&self, language: &str) -> bool {
        same_language(language, &self.reference_language)
    }

    /// Computes per-language metrics and the pass/fail decision for a run.
    ///
    /// The reference language only needs one answered question. Every other
    /// language must reach the coverage ratio and the verification threshold,
    /// and its average response std must stay within `max_avg_std` when known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(
        &self,
        evidence: &[QuestionEvidence],
        total_questions: usize,
    ) -> BTreeMap<String, LanguageQualityMetrics> {
        let mut by_language: BTreeMap<&str, Vec<&QuestionEvidence>> = BTreeMap::new();
        for item in evidence {
            by_language
                .entry(item.stats.language.as_str())
                .or_default()
                .push(item);
        }

        let mut metrics = BTreeMap::new();
        for (language, items) in by_language {
            let answered: BTreeSet<&str> = items
                .iter()
                .filter(|item| item.stats.count > 0)
                .map(|item| item.stats.question_id.as_str())
                .collect();
            let total_valid_responses = items.iter().map(|item| item.stats.count).sum();
            let questions_below_min_responses = items
                .iter()
                .filter(|item| {
                    item.stats.count > 0
                        && item.stats.count < u64::from(self.thresholds.min_responses_per_question)
                })
                .count();
            let avg_verification_score = mean_of(
                items
                    .iter()
                    .filter_map(|item| item.verification_score.map(f64::from)),
            );
            let avg_response_std = mean_of(
                items
                    .iter()
                    .filter(|item| item.stats.count > 0)
                    .filter_map(|item| item.stats.std),
            );
            let coverage_ratio = if total_questions == 0 {
                0.0
            } else {
                answered.len() as f64 / total_questions as f64
            };

            let is_reference_language = self.is_reference_language(language);
            let mut reason_codes = Vec::new();
            let passes_threshold = if is_reference_language {
                if answered.is_empty() {
                    reason_codes.push("excluded.reference_language.no_valid_responses".to_string());
                    false
                } else {
                    reason_codes.push("included.reference_language".to_string());
                    true
                }
            } else {
                if coverage_ratio < self.thresholds.required_coverage_ratio {
                    reason_codes.push("excluded.coverage".to_string());
                }
                match avg_verification_score {
                    None => reason_codes.push("excluded.verification_missing".to_string()),
                    Some(score) if score < self.thresholds.min_verification_score => {
                        reason_codes.push("excluded.verification_score".to_string());
                    }
                    Some(_) => {}
                }
                if avg_response_std.is_some_and(|std| std > self.thresholds.max_avg_std) {
                    reason_codes.push("excluded.response_dispersion".to_string());
                }
                if reason_codes.is_empty() {
                    reason_codes.push("included.thresholds_met".to_string());
                    true
                } else {
                    false
                }
            };

            metrics.insert(
                language.to_string(),
                LanguageQualityMetrics {
                    language: language.to_string(),
                    questions_answered: answered.len(),
                    total_questions,
                    coverage_ratio,
                    avg_verification_score,
                    avg_response_std,
                    passes_threshold,
                    is_reference_language,
                    total_valid_responses,
                    questions_below_min_responses,
                    reason_codes,
                },
            );
        }
        metrics
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0_f64, 0_usize), |(sum, count), value| {
        (sum + value, count + 1)
    });
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageStatsEntry {
    pub count: u64,
    #[serde(default)]
    pub mean: Option<f64>,
    #[serde(default)]
    pub std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<LanguageQualityMetrics>,
}

impl LanguageStatsEntry {
    #[must_use]
    pub fn to_stats(&self, language: &str, question_id: &str, source_id: &str) -> LanguageQuestionStats {
        LanguageQuestionStats {
            language: language.to_string(),
            question_id: question_id.to_string(),
            count: self.count,
            mean: self.mean,
            std: self.std,
            source_id: source_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionResult {
    pub question_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    pub scale_min: i64,
    pub scale_max: i64,
    #[serde(default)]
    pub scale_labels: Option<ScaleLabels>,
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default)]
    pub language_stats: BTreeMap<String, LanguageStatsEntry>,
}

impl QuestionResult {
    #[must_use]
    pub fn question(&self) -> Question {
        Question {
            id: self.question_id.clone(),
            title: self.title.clone(),
            category: self.category.clone(),
            scale_min: self.scale_min,
            scale_max: self.scale_max,
            scale_labels: self.scale_labels.clone(),
            prompt_text: self.prompt_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityEnvelope {
    pub thresholds: QualityThresholds,
    pub language_quality: BTreeMap<String, LanguageQualityMetrics>,
    pub timestamp: String,
    pub total_questions: usize,
    pub valid_languages: Vec<String>,
    #[serde(default)]
    pub source_file: String,
}

/// Processed result file: per-question stats plus the quality audit envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedResultFile {
    pub results: Vec<QuestionResult>,
    pub quality_metrics: QualityEnvelope,
}

impl ProcessedResultFile {
    /// # Errors
    /// Returns [`SurveyError::FileFormat`] when the text is not JSON or does not
    /// carry a valid `results` + `quality_metrics` envelope.
    pub fn from_json_str(raw: &str) -> Result<Self, SurveyError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| SurveyError::FileFormat(format!("invalid JSON: {err}")))?;
        Self::from_value(value)
    }

    /// # Errors
    /// Returns [`SurveyError::FileFormat`] on a missing envelope key, a schema
    /// mismatch or inconsistent statistics.
    pub fn from_value(value: Value) -> Result<Self, SurveyError> {
        let Some(object) = value.as_object() else {
            return Err(SurveyError::FileFormat(
                "result file MUST be a JSON object".to_string(),
            ));
        };
        for key in ["results", "quality_metrics"] {
            if !object.contains_key(key) {
                return Err(SurveyError::FileFormat(format!(
                    "missing required key '{key}'"
                )));
            }
        }
        if !object.get("results").is_some_and(Value::is_array) {
            return Err(SurveyError::FileFormat(
                "'results' MUST be a list".to_string(),
            ));
        }

        let file: Self = serde_json::from_value(value)
            .map_err(|err| SurveyError::FileFormat(format!("result file schema mismatch: {err}")))?;
        file.validate()?;
        Ok(file)
    }

    /// # Errors
    /// Returns [`SurveyError::FileFormat`] describing the first inconsistency.
    pub fn validate(&self) -> Result<(), SurveyError> {
        let mut seen = BTreeSet::new();
        for result in &self.results {
            if result.question_id.trim().is_empty() {
                return Err(SurveyError::FileFormat(
                    "result entry has an empty question_id".to_string(),
                ));
            }
            if !seen.insert(result.question_id.as_str()) {
                return Err(SurveyError::FileFormat(format!(
                    "duplicate question_id '{}'",
                    result.question_id
                )));
            }
            if result.scale_min >= result.scale_max {
                return Err(SurveyError::FileFormat(format!(
                    "question '{}' has scale_min >= scale_max",
                    result.question_id
                )));
            }
            for (language, entry) in &result.language_stats {
                let location = format!("{}/{language}", result.question_id);
                match (entry.count, entry.mean) {
                    (0, Some(_)) => {
                        return Err(SurveyError::FileFormat(format!(
                            "{location}: count 0 MUST NOT carry a mean"
                        )));
                    }
                    (count, None) if count > 0 => {
                        return Err(SurveyError::FileFormat(format!(
                            "{location}: count {count} requires a mean"
                        )));
                    }
                    (_, Some(mean)) if !mean.is_finite() => {
                        return Err(SurveyError::FileFormat(format!(
                            "{location}: mean MUST be finite"
                        )));
                    }
                    _ => {}
                }
                if entry.std.is_some_and(|std| !std.is_finite() || std < 0.0) {
                    return Err(SurveyError::FileFormat(format!(
                        "{location}: std MUST be finite and >= 0"
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn admits_language(&self, language: &str) -> bool {
        self.quality_metrics
            .valid_languages
            .iter()
            .any(|valid| valid == language)
    }
}

/// Aggregates and gates the trials of one run into a processed result file.
///
/// Languages are only reported for the questions they were administered.
///
/// # Errors
/// Returns [`SurveyError::UnknownQuestion`] for trials outside the survey and
/// [`SurveyError::Validation`] for malformed records.
pub fn build_result_file(
    questions: &[Question],
    records: &[TrialRecord],
    gate: &QualityGate,
    source_file: &str,
    generated_at: OffsetDateTime,
) -> Result<ProcessedResultFile, SurveyError> {
    let mut grouped: BTreeMap<(&str, &str), Vec<TrialRecord>> = BTreeMap::new();
    for record in records {
        record.validate()?;
        if !questions.iter().any(|question| question.id == record.question_id) {
            return Err(SurveyError::UnknownQuestion(record.question_id.clone()));
        }
        grouped
            .entry((record.question_id.as_str(), record.language.as_str()))
            .or_default()
            .push(record.clone());
    }

    let mut evidence = Vec::new();
    for question in questions {
        for ((question_id, language), trials) in &grouped {
            if *question_id != question.id {
                continue;
            }
            let stats = LanguageQuestionStats::aggregate(language, question, trials, source_file)?;
            let verification_score = trials.iter().find_map(|trial| trial.verification_score);
            evidence.push(QuestionEvidence {
                stats,
                verification_score,
            });
        }
    }

    let language_quality = gate.evaluate(&evidence, questions.len());
    let results = questions
        .iter()
        .map(|question| {
            let language_stats = evidence
                .iter()
                .filter(|item| item.stats.question_id == question.id)
                .map(|item| {
                    (
                        item.stats.language.clone(),
                        LanguageStatsEntry {
                            count: item.stats.count,
                            mean: item.stats.mean,
                            std: item.stats.std,
                            quality_metrics: language_quality.get(&item.stats.language).cloned(),
                        },
                    )
                })
                .collect();
            QuestionResult {
                question_id: question.id.clone(),
                title: question.title.clone(),
                category: question.category.clone(),
                scale_min: question.scale_min,
                scale_max: question.scale_max,
                scale_labels: question.scale_labels.clone(),
                prompt_text: question.prompt_text.clone(),
                language_stats,
            }
        })
        .collect();

    let valid_languages = language_quality
        .values()
        .filter(|metrics| metrics.passes_threshold)
        .map(|metrics| metrics.language.clone())
        .collect();

    Ok(ProcessedResultFile {
        results,
        quality_metrics: QualityEnvelope {
            thresholds: gate.thresholds().clone(),
            language_quality,
            timestamp: format_result_timestamp(generated_at),
            total_questions: questions.len(),
            valid_languages,
            source_file: source_file.to_string(),
        },
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleaningReport {
    pub records_examined: usize,
    pub translations_cleared: usize,
    pub back_translations_cleared: usize,
    pub responses_cleared: usize,
}

/// Clears translations more than twice as long as the original prompt.
///
/// A cleared forward translation also drops the trial's response, since the
/// model answered a prompt that was not the survey question.
#[must_use]
pub fn clear_overlong_translations(records: &[TrialRecord]) -> (Vec<TrialRecord>, CleaningReport) {
    let mut report = CleaningReport {
        records_examined: records.len(),
        ..CleaningReport::default()
    };
    let cleaned = records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            let limit = record.original_prompt.chars().count().saturating_mul(2);
            if exceeds(&record.translated_prompt, limit) {
                record.translated_prompt = CLEARED_TEXT_MARKER.to_string();
                report.translations_cleared += 1;
                if record.response_value.take().is_some() {
                    report.responses_cleared += 1;
                }
            }
            if exceeds(&record.back_translated_prompt, limit) {
                record.back_translated_prompt = CLEARED_TEXT_MARKER.to_string();
                report.back_translations_cleared += 1;
            }
            record
        })
        .collect();
    (cleaned, report)
}

fn exceeds(text: &str, limit: usize) -> bool {
    !is_sentinel_marker(text) && text.chars().count() > limit
}

/// `YYYYMMDD_HHMMSS` in UTC, the stamp used in result file names and envelopes.
#[must_use]
pub fn format_result_timestamp(value: OffsetDateTime) -> String {
    let value = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second()
    )
}

/// # Errors
/// Returns [`SurveyError::Validation`] for malformed or non-UTC timestamps.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SurveyError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SurveyError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SurveyError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`SurveyError::Validation`] if the timestamp cannot be formatted.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SurveyError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| SurveyError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn assert_close(left: f64, right: f64) {
        assert!(
            (left - right).abs() < 1e-9,
            "expected {left} to be close to {right}"
        );
    }

    fn fixture_question(id: &str) -> Question {
        Question {
            id: id.to_string(),
            title: format!("Title {id}"),
            category: "values".to_string(),
            scale_min: 1,
            scale_max: 10,
            scale_labels: None,
            prompt_text: format!("How important is {id}? Answer 1-10."),
        }
    }

    fn fixture_trial(language: &str, question_id: &str, trial: u32, value: Option<f64>) -> TrialRecord {
        TrialRecord {
            language: language.to_string(),
            question_id: question_id.to_string(),
            trial_number: trial,
            original_prompt: "How important is family?".to_string(),
            translated_prompt: "How important is family?".to_string(),
            back_translated_prompt: REFERENCE_LANGUAGE_MARKER.to_string(),
            verification_score: None,
            response_value: value,
        }
    }

    fn fixture_stats(language: &str, count: u64, mean: Option<f64>, std: Option<f64>) -> LanguageQuestionStats {
        LanguageQuestionStats {
            language: language.to_string(),
            question_id: "Q1".to_string(),
            count,
            mean,
            std,
            source_id: "results_a.json".to_string(),
        }
    }

    fn fixture_gate() -> QualityGate {
        must_ok(QualityGate::new(QualityThresholds::v1(), "English"))
    }

    fn evidence(language: &str, question_id: &str, count: u64, std: Option<f64>, score: Option<u8>) -> QuestionEvidence {
        QuestionEvidence {
            stats: LanguageQuestionStats {
                language: language.to_string(),
                question_id: question_id.to_string(),
                count,
                mean: if count > 0 { Some(5.0) } else { None },
                std: if count > 0 { std } else { None },
                source_id: "run".to_string(),
            },
            verification_score: score,
        }
    }

    #[test]
    fn bounds_labels_expand_with_level_names() {
        let mut question = fixture_question("Q1");
        question.scale_max = 5;
        question.scale_labels = Some(ScaleLabels::Bounds {
            min: "Never".to_string(),
            max: "Always".to_string(),
        });
        assert_eq!(
            question.resolved_labels(),
            vec!["Never", "Level 2", "Level 3", "Level 4", "Always"]
        );

        question.scale_max = 2;
        assert_eq!(question.resolved_labels(), vec!["Never", "Always"]);
    }

    #[test]
    fn numbered_labels_fill_gaps_and_missing_labels_use_numbers() {
        let mut question = fixture_question("Q1");
        question.scale_max = 4;
        let parsed: ScaleLabels = must_ok(serde_json::from_value(json!({"1": "Very good", "4": "Very bad"})));
        question.scale_labels = Some(parsed);
        assert_eq!(
            question.resolved_labels(),
            vec!["Very good", "Level 2", "Level 3", "Very bad"]
        );

        question.scale_labels = None;
        assert_eq!(question.resolved_labels(), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn survey_definition_parses_metadata_and_rejects_duplicates() {
        let raw = json!({
            "questions": [
                {"question_id": "Q1", "question_title": "Family", "category": "values",
                 "scale_min": 1, "scale_max": 4, "scale_labels": {"min": "Very", "max": "Not at all"},
                 "prompt_text": "How important is family?"}
            ],
            "survey": {"metadata": {"recommended_trials": 5, "default_languages": ["English", "French"],
                       "translation_settings": {"use_translation": true}}}
        });
        let definition = must_ok(SurveyDefinition::from_value(raw.clone()));
        assert_eq!(definition.survey.metadata.recommended_trials, Some(5));
        assert_eq!(definition.survey.metadata.default_languages.len(), 2);
        assert_eq!(must_some(definition.question("Q1")).title, "Family");

        let mut duplicated = raw;
        let first = duplicated["questions"][0].clone();
        if let Some(list) = duplicated["questions"].as_array_mut() {
            list.push(first);
        }
        let err = SurveyDefinition::from_value(duplicated);
        assert!(matches!(err, Err(SurveyError::Validation(message)) if message.contains("duplicate")));
    }

    #[test]
    fn extreme_scale_ranges_are_rejected_without_overflow() {
        let mut question = fixture_question("Q1");
        question.scale_min = i64::MIN;
        question.scale_max = i64::MAX;
        assert_eq!(question.scale_points(), 0);
        assert!(matches!(
            question.validate(),
            Err(SurveyError::Validation(message)) if message.contains("too wide")
        ));

        question.scale_min = -2;
        question.scale_max = 2;
        assert_eq!(question.scale_points(), 5);
        must_ok(question.validate());
    }

    #[test]
    fn survey_definition_schema_mismatch_is_file_format_error() {
        let err = SurveyDefinition::from_json_str(r#"{"questions": [{"question_id": "Q1"}]}"#);
        assert!(matches!(err, Err(SurveyError::FileFormat(_))));
    }

    #[test]
    fn reference_language_scenario_aggregates_and_passes() {
        let question = fixture_question("Q1");
        let trials: Vec<TrialRecord> = (1..=5)
            .map(|n| fixture_trial("English", "Q1", n, Some(f64::from(n))))
            .collect();
        let stats = must_ok(LanguageQuestionStats::aggregate("English", &question, &trials, "run"));
        assert_eq!(stats.count, 5);
        assert_close(must_some(stats.mean), 3.0);
        assert_close(must_some(stats.std), 2.0_f64.sqrt());

        let metrics = fixture_gate().evaluate(
            &[QuestionEvidence {
                stats,
                verification_score: None,
            }],
            1,
        );
        let english = must_some(metrics.get("English"));
        assert!(english.passes_threshold);
        assert_eq!(english.questions_answered, 1);
        assert_eq!(english.reason_codes, vec!["included.reference_language"]);
    }

    #[test]
    fn aggregate_excludes_missing_and_below_scale_values() {
        let question = fixture_question("Q1");
        let trials = vec![
            fixture_trial("French", "Q1", 1, Some(0.0)),
            fixture_trial("French", "Q1", 2, None),
            fixture_trial("French", "Q1", 3, Some(4.0)),
            fixture_trial("French", "Q1", 4, Some(6.0)),
        ];
        let stats = must_ok(LanguageQuestionStats::aggregate("French", &question, &trials, "run"));
        assert_eq!(stats.count, 2);
        assert_close(must_some(stats.mean), 5.0);
        assert_close(must_some(stats.std), 1.0);

        let none_valid = vec![fixture_trial("French", "Q1", 1, None)];
        let empty = must_ok(LanguageQuestionStats::aggregate("French", &question, &none_valid, "run"));
        assert_eq!(empty.count, 0);
        assert!(empty.mean.is_none());
        assert!(empty.std.is_none());
    }

    #[test]
    fn aggregate_rejects_records_of_another_pair() {
        let question = fixture_question("Q1");
        let trials = vec![fixture_trial("German", "Q1", 1, Some(3.0))];
        let result = LanguageQuestionStats::aggregate("French", &question, &trials, "run");
        assert!(matches!(result, Err(SurveyError::Validation(_))));
    }

    #[test]
    fn combine_weights_means_and_keeps_max_std() {
        let left = fixture_stats("French", 2, Some(2.0), Some(0.5));
        let mut right = fixture_stats("French", 6, Some(4.0), Some(1.5));
        right.source_id = "results_b.json".to_string();

        let combined = must_ok(left.combine(&right));
        assert_eq!(combined.count, 8);
        assert_close(must_some(combined.mean), 3.5);
        assert_close(must_some(combined.std), 1.5);
        assert_eq!(combined.source_id, "results_a.json+results_b.json");

        let empty = fixture_stats("French", 0, None, None);
        let unchanged = must_ok(left.combine(&empty));
        assert_eq!(unchanged.count, 2);
        assert_close(must_some(unchanged.mean), 2.0);

        let other_question = LanguageQuestionStats {
            question_id: "Q2".to_string(),
            ..left.clone()
        };
        assert!(left.combine(&other_question).is_err());
    }

    #[test]
    fn non_reference_language_below_verification_threshold_fails() {
        let gate = fixture_gate();
        let metrics = gate.evaluate(
            &[
                evidence("French", "Q1", 5, Some(1.0), Some(3)),
                evidence("French", "Q2", 5, Some(1.0), Some(4)),
            ],
            2,
        );
        let french = must_some(metrics.get("French"));
        assert_close(french.coverage_ratio, 1.0);
        assert_close(must_some(french.avg_verification_score), 3.5);
        assert!(!french.passes_threshold);
        assert_eq!(french.reason_codes, vec!["excluded.verification_score"]);
    }

    #[test]
    fn dispersion_bound_applies_only_when_std_known() {
        let gate = fixture_gate();
        let metrics = gate.evaluate(
            &[
                evidence("German", "Q1", 5, None, Some(5)),
                evidence("Spanish", "Q1", 5, Some(3.5), Some(5)),
            ],
            1,
        );
        assert!(must_some(metrics.get("German")).passes_threshold);
        let spanish = must_some(metrics.get("Spanish"));
        assert!(!spanish.passes_threshold);
        assert_eq!(spanish.reason_codes, vec!["excluded.response_dispersion"]);
    }

    #[test]
    fn missing_verification_fails_and_reference_needs_an_answer() {
        let gate = fixture_gate();
        let metrics = gate.evaluate(
            &[
                evidence("Italian", "Q1", 5, Some(1.0), None),
                evidence("english", "Q1", 0, None, None),
            ],
            1,
        );
        let italian = must_some(metrics.get("Italian"));
        assert!(!italian.passes_threshold);
        assert!(italian.avg_verification_score.is_none());

        let english = must_some(metrics.get("english"));
        assert!(english.is_reference_language);
        assert!(!english.passes_threshold);
    }

    #[test]
    fn min_responses_is_reported_without_failing_the_language() {
        let gate = fixture_gate();
        let metrics = gate.evaluate(&[evidence("French", "Q1", 2, Some(0.5), Some(5))], 1);
        let french = must_some(metrics.get("French"));
        assert!(french.passes_threshold);
        assert_eq!(french.questions_below_min_responses, 1);
        assert_eq!(french.total_valid_responses, 2);
    }

    #[test]
    fn thresholds_load_from_json_and_validate_bounds() {
        let loaded = must_ok(QualityThresholds::from_json(&json!({
            "min_verification_score": 3.0,
            "min_responses_per_question": 3,
            "required_coverage_ratio": 0.5,
            "max_avg_std": 2.0
        })));
        assert_close(loaded.min_verification_score, 3.0);

        let invalid = QualityThresholds {
            required_coverage_ratio: 1.5,
            ..QualityThresholds::v1()
        };
        assert!(matches!(invalid.validate(), Err(SurveyError::Configuration(_))));
        assert!(QualityThresholds::from_json(&json!({"max_avg_std": 1.0})).is_err());
        assert!(QualityGate::new(QualityThresholds::v1(), "  ").is_err());
    }

    #[test]
    fn result_file_without_envelope_is_rejected() {
        let missing = ProcessedResultFile::from_json_str(r#"{"results": []}"#);
        assert!(matches!(missing, Err(SurveyError::FileFormat(message)) if message.contains("quality_metrics")));

        let not_list = ProcessedResultFile::from_value(json!({"results": {}, "quality_metrics": {}}));
        assert!(matches!(not_list, Err(SurveyError::FileFormat(message)) if message.contains("list")));

        let garbage = ProcessedResultFile::from_json_str("not json");
        assert!(matches!(garbage, Err(SurveyError::FileFormat(_))));
    }

    #[test]
    fn built_result_file_gates_languages_and_survives_reload() {
        let questions = vec![fixture_question("Q1"), fixture_question("Q2")];
        let mut records = Vec::new();
        for question_id in ["Q1", "Q2"] {
            for n in 1..=5 {
                records.push(fixture_trial("English", question_id, n, Some(f64::from(n) + 1.0)));
                let mut french = fixture_trial("French", question_id, n, Some(3.0));
                french.verification_score = Some(5);
                records.push(french);
            }
        }
        // German only answered one of two questions.
        let mut german = fixture_trial("German", "Q1", 1, Some(4.0));
        german.verification_score = Some(5);
        records.push(german);

        let file = must_ok(build_result_file(
            &questions,
            &records,
            &fixture_gate(),
            "results_20260101_000000.json",
            must_ok(parse_rfc3339_utc("2026-01-01T08:09:10Z")),
        ));
        assert_eq!(file.quality_metrics.timestamp, "20260101_080910");
        assert_eq!(file.quality_metrics.valid_languages, vec!["English", "French"]);
        assert!(!must_some(file.quality_metrics.language_quality.get("German")).passes_threshold);
        assert_eq!(file.results.len(), 2);
        assert!(file.results[1].language_stats.get("German").is_none());

        let raw = must_ok(serde_json::to_string(&file));
        let reloaded = must_ok(ProcessedResultFile::from_json_str(&raw));
        assert_eq!(reloaded.results.len(), file.results.len());
        assert_eq!(reloaded.quality_metrics.thresholds, file.quality_metrics.thresholds);
        assert!(reloaded.admits_language("French"));
        assert!(!reloaded.admits_language("German"));
    }

    #[test]
    fn trials_for_unknown_questions_are_rejected() {
        let result = build_result_file(
            &[fixture_question("Q1")],
            &[fixture_trial("English", "Q9", 1, Some(2.0))],
            &fixture_gate(),
            "run",
            now_utc(),
        );
        assert!(matches!(result, Err(SurveyError::UnknownQuestion(id)) if id == "Q9"));
    }

    #[test]
    fn overlong_translations_are_cleared_with_their_responses() {
        let mut overlong = fixture_trial("French", "Q1", 1, Some(3.0));
        overlong.original_prompt = "short".to_string();
        overlong.translated_prompt = "a considerably longer translation".to_string();
        overlong.back_translated_prompt = "short".to_string();
        let mut long_back = fixture_trial("French", "Q1", 2, Some(4.0));
        long_back.original_prompt = "short".to_string();
        long_back.translated_prompt = "court".to_string();
        long_back.back_translated_prompt = "a rambling back-translation".to_string();
        let mut sentinel = fixture_trial("German", "Q1", 1, Some(2.0));
        sentinel.original_prompt = "hi".to_string();
        sentinel.translated_prompt = "hallo".to_string();
        sentinel.back_translated_prompt = BACK_TRANSLATION_FAILED.to_string();

        let (cleaned, report) = clear_overlong_translations(&[overlong, long_back, sentinel]);
        assert_eq!(report.records_examined, 3);
        assert_eq!(report.translations_cleared, 2);
        assert_eq!(report.back_translations_cleared, 1);
        assert_eq!(report.responses_cleared, 2);
        assert_eq!(cleaned[0].translated_prompt, CLEARED_TEXT_MARKER);
        assert!(cleaned[0].response_value.is_none());
        assert_eq!(cleaned[1].back_translated_prompt, CLEARED_TEXT_MARKER);
        assert_eq!(cleaned[1].response_value, Some(4.0));
        assert_eq!(cleaned[2].back_translated_prompt, BACK_TRANSLATION_FAILED);
    }

    fn arb_stats() -> impl Strategy<Value = LanguageQuestionStats> {
        (0_u64..50, 1.0_f64..10.0, 0.0_f64..4.0).prop_map(|(count, mean, std)| {
            if count == 0 {
                fixture_stats("French", 0, None, None)
            } else {
                fixture_stats("French", count, Some(mean), Some(std))
            }
        })
    }

    proptest! {
        #[test]
        fn combine_is_associative_in_count_and_mean(a in arb_stats(), b in arb_stats(), c in arb_stats()) {
            let left = a.combine(&b).and_then(|ab| ab.combine(&c));
            let right = b.combine(&c).and_then(|bc| a.combine(&bc));
            prop_assert!(left.is_ok() && right.is_ok());
            let (left, right) = (left.unwrap_or_else(|_| unreachable!()), right.unwrap_or_else(|_| unreachable!()));
            prop_assert_eq!(left.count, right.count);
            match (left.mean, right.mean) {
                (Some(l), Some(r)) => prop_assert!((l - r).abs() < 1e-9),
                (None, None) => {}
                other => prop_assert!(false, "mean presence differs: {:?}", other),
            }
        }

        #[test]
        fn aggregated_stats_are_finite(values in proptest::collection::vec(proptest::option::of(-5.0_f64..15.0), 0..30)) {
            let question = fixture_question("Q1");
            let trials: Vec<TrialRecord> = values
                .iter()
                .enumerate()
                .map(|(idx, value)| fixture_trial("French", "Q1", u32::try_from(idx + 1).unwrap_or(u32::MAX), *value))
                .collect();
            let stats = LanguageQuestionStats::aggregate("French", &question, &trials, "run");
            prop_assert!(stats.is_ok());
            let stats = stats.unwrap_or_else(|_| unreachable!());
            if stats.count > 0 {
                let mean = stats.mean.unwrap_or(f64::NAN);
                let std = stats.std.unwrap_or(f64::NAN);
                prop_assert!(mean.is_finite());
                prop_assert!(std.is_finite() && std >= 0.0);
                prop_assert!(mean >= 1.0);
            } else {
                prop_assert!(stats.mean.is_none() && stats.std.is_none());
            }
        }

        #[test]
        fn partial_coverage_never_passes(score in 1_u8..=5, answered in 0_usize..4) {
            let gate = fixture_gate();
            let items: Vec<QuestionEvidence> = (0..answered)
                .map(|idx| evidence("French", &format!("Q{idx}"), 5, Some(0.1), Some(score)))
                .collect();
            let metrics = gate.evaluate(&items, 4);
            if let Some(french) = metrics.get("French") {
                prop_assert!(french.coverage_ratio < 1.0);
                prop_assert!(!french.passes_threshold);
            }
        }
    }
}
