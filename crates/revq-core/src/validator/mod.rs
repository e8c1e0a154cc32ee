//! Output-contract validation for raw model responses.
//!
//! [`ResultValidator::validate`] turns raw response bytes into a
//! [`ReviewResult`] plus machine-readable diagnostics, or rejects the payload
//! outright. The order is normative:
//!
//! 1. Parse the payload as JSON (`invalid_json` on failure)
//! 2. Top-level schema: required fields, field types
//! 3. Version compatibility for `schema_version` and `prompt_version`
//! 4. Per-finding coercion and validation — invalid findings are **dropped**,
//!    never escalated to a payload rejection
//! 5. Path reconciliation against the changelist's changed files
//!
//! A payload whose findings all drop is still `Ok` (with an
//! `all_findings_dropped` diagnostic): an empty review is a valid review.
//! Validation is deterministic: the same payload and changed-file list always
//! produce the same outcome and the same diagnostics.

pub mod paths;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::redact::{looks_sensitive, redact};
use crate::review::{Category, Confidence, Finding, ReviewResult, Severity};

use self::paths::{canonicalize_changed_files, canonicalize_repo_path, is_changed_file};

static SCHEMA_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)$").expect("SCHEMA_VERSION_RE should compile"));

static PROMPT_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.(\d+)(?:\.(\d+))?$").expect("PROMPT_VERSION_RE should compile")
});

/// Stable diagnostic codes emitted by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DiagnosticCode {
    /// The payload was not parseable JSON.
    InvalidJson,
    /// A field had the wrong type or the top level was not an object.
    SchemaMismatch,
    /// A required field was absent (or empty where non-empty is required).
    MissingRequiredField,
    /// A value fell outside its allowed enum set.
    InvalidEnumValue,
    /// `line`/`end_line` violated the numeric constraints.
    InvalidLineRange,
    /// The finding's file is not part of the changelist.
    FileNotInChangedFiles,
    /// The payload's schema or prompt version is outside the accepted range.
    IncompatibleVersion,
    /// Every finding was dropped; the result is valid but empty.
    AllFindingsDropped,
    /// A safe coercion rewrote a field value.
    CoercionApplied,
    /// A finding was dropped; `reason` carries the cause.
    FindingDropped,
    /// The payload as a whole was rejected; `reason` carries the cause.
    ResponseRejected,
}

impl DiagnosticCode {
    /// Returns the stable wire string for this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::SchemaMismatch => "schema_mismatch",
            Self::MissingRequiredField => "missing_required_field",
            Self::InvalidEnumValue => "invalid_enum_value",
            Self::InvalidLineRange => "invalid_line_range",
            Self::FileNotInChangedFiles => "file_not_in_changed_files",
            Self::IncompatibleVersion => "incompatible_version",
            Self::AllFindingsDropped => "all_findings_dropped",
            Self::CoercionApplied => "coercion_applied",
            Self::FindingDropped => "finding_dropped",
            Self::ResponseRejected => "response_rejected",
        }
    }
}

/// One machine-readable validation diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code.
    pub code: DiagnosticCode,
    /// Finding id, when one was parseable from the offending finding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding_id: Option<String>,
    /// The field the diagnostic refers to (`findings[2]`, `severity`, ...).
    pub field: String,
    /// For `finding_dropped` / `response_rejected`: the underlying cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DiagnosticCode>,
    /// Free-form detail. Sensitive-looking values arrive redacted.
    pub detail: String,
}

/// Outcome of validating one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The payload passed; findings may be empty.
    Ok {
        /// The validated result.
        result: ReviewResult,
        /// Diagnostics accumulated along the way.
        diagnostics: Vec<Diagnostic>,
    },
    /// The payload was rejected before finding-level work.
    Rejected {
        /// Diagnostics, ending with a `response_rejected` record.
        diagnostics: Vec<Diagnostic>,
    },
}

impl ValidationOutcome {
    /// Whether the payload was rejected.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The diagnostics of either outcome.
    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Self::Ok { diagnostics, .. } | Self::Rejected { diagnostics } => diagnostics,
        }
    }
}

/// Version gates for the output contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Accepted `schema_version` major line.
    #[serde(default = "default_schema_major")]
    pub expected_schema_major: u64,

    /// Minimum accepted `schema_version` minor within the major line.
    #[serde(default)]
    pub min_schema_minor: u64,

    /// Accepted `prompt_version` major.
    #[serde(default = "default_prompt_major")]
    pub expected_prompt_major: u64,

    /// Accepted `prompt_version` minor.
    #[serde(default)]
    pub expected_prompt_minor: u64,

    /// Whether patch-level drift within the accepted `major.minor` prompt
    /// line is tolerated.
    #[serde(default = "default_true")]
    pub allow_prompt_patch_drift: bool,
}

const fn default_schema_major() -> u64 {
    1
}

const fn default_prompt_major() -> u64 {
    1
}

const fn default_true() -> bool {
    true
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            expected_schema_major: default_schema_major(),
            min_schema_minor: 0,
            expected_prompt_major: default_prompt_major(),
            expected_prompt_minor: 0,
            allow_prompt_patch_drift: default_true(),
        }
    }
}

/// Validates raw model responses against the output contract.
#[derive(Debug, Clone, Default)]
pub struct ResultValidator {
    config: ValidatorConfig,
}

/// Renders a value for diagnostics, redacting it when it looks sensitive.
fn diag_value(value: &str) -> String {
    if looks_sensitive(value) {
        redact(value)
    } else {
        value.to_string()
    }
}

impl ResultValidator {
    /// Creates a validator with the given version gates.
    #[must_use]
    pub const fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validates `raw_bytes` against the output contract and reconciles
    /// finding paths against `changed_files`.
    #[must_use]
    pub fn validate(&self, raw_bytes: &[u8], changed_files: &[String]) -> ValidationOutcome {
        let mut diagnostics = Vec::new();

        let parsed: Value = match serde_json::from_slice(raw_bytes) {
            Ok(value) => value,
            Err(err) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::InvalidJson,
                    finding_id: None,
                    field: "payload".to_string(),
                    reason: None,
                    detail: redact(&err.to_string()),
                });
                return Self::rejected(diagnostics, DiagnosticCode::InvalidJson);
            }
        };

        let Some(top) = parsed.as_object() else {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::SchemaMismatch,
                finding_id: None,
                field: "payload".to_string(),
                reason: None,
                detail: "top level is not an object".to_string(),
            });
            return Self::rejected(diagnostics, DiagnosticCode::SchemaMismatch);
        };

        let schema_version = match Self::required_string(top, "schema_version", &mut diagnostics) {
            Ok(value) => value,
            Err(reason) => return Self::rejected(diagnostics, reason),
        };
        let prompt_version = match Self::required_string(top, "prompt_version", &mut diagnostics) {
            Ok(value) => value,
            Err(reason) => return Self::rejected(diagnostics, reason),
        };
        let findings = match top.get("findings") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::SchemaMismatch,
                    finding_id: None,
                    field: "findings".to_string(),
                    reason: None,
                    detail: "findings is not an array".to_string(),
                });
                return Self::rejected(diagnostics, DiagnosticCode::SchemaMismatch);
            }
            None => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::MissingRequiredField,
                    finding_id: None,
                    field: "findings".to_string(),
                    reason: None,
                    detail: "required field is missing".to_string(),
                });
                return Self::rejected(diagnostics, DiagnosticCode::MissingRequiredField);
            }
        };
        let summary = match top.get("summary") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(_) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::SchemaMismatch,
                    finding_id: None,
                    field: "summary".to_string(),
                    reason: None,
                    detail: "summary is not a string".to_string(),
                });
                return Self::rejected(diagnostics, DiagnosticCode::SchemaMismatch);
            }
        };
        let meta = top.get("meta").filter(|value| !value.is_null()).cloned();

        if let Err(reason) =
            self.check_versions(&schema_version, &prompt_version, &mut diagnostics)
        {
            return Self::rejected(diagnostics, reason);
        }

        let changed = canonicalize_changed_files(changed_files);
        let mut kept = Vec::new();
        for (idx, raw_finding) in findings.iter().enumerate() {
            if let Some(finding) =
                Self::validate_finding(idx, raw_finding, &changed, &mut diagnostics)
            {
                kept.push(finding);
            }
        }

        if kept.is_empty() {
            debug!(
                dropped = findings.len(),
                "no findings survived validation"
            );
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::AllFindingsDropped,
                finding_id: None,
                field: "findings".to_string(),
                reason: None,
                detail: "no findings survived validation".to_string(),
            });
        }

        ValidationOutcome::Ok {
            result: ReviewResult {
                schema_version,
                prompt_version,
                findings: kept,
                summary,
                meta,
            },
            diagnostics,
        }
    }

    fn rejected(mut diagnostics: Vec<Diagnostic>, reason: DiagnosticCode) -> ValidationOutcome {
        warn!(reason = reason.as_str(), "model response rejected");
        diagnostics.push(Diagnostic {
            code: DiagnosticCode::ResponseRejected,
            finding_id: None,
            field: "payload".to_string(),
            reason: Some(reason),
            detail: "payload rejected before finding-level validation".to_string(),
        });
        ValidationOutcome::Rejected { diagnostics }
    }

    fn required_string(
        top: &serde_json::Map<String, Value>,
        field: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<String, DiagnosticCode> {
        match top.get(field) {
            Some(Value::String(value)) => Ok(value.trim().to_string()),
            Some(_) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::SchemaMismatch,
                    finding_id: None,
                    field: field.to_string(),
                    reason: None,
                    detail: format!("{field} is not a string"),
                });
                Err(DiagnosticCode::SchemaMismatch)
            }
            None => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::MissingRequiredField,
                    finding_id: None,
                    field: field.to_string(),
                    reason: None,
                    detail: "required field is missing".to_string(),
                });
                Err(DiagnosticCode::MissingRequiredField)
            }
        }
    }

    fn check_versions(
        &self,
        schema_version: &str,
        prompt_version: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<(), DiagnosticCode> {
        let Some(caps) = SCHEMA_VERSION_RE.captures(schema_version) else {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::SchemaMismatch,
                finding_id: None,
                field: "schema_version".to_string(),
                reason: None,
                detail: format!("malformed version: {}", diag_value(schema_version)),
            });
            return Err(DiagnosticCode::SchemaMismatch);
        };
        let major: u64 = caps[1].parse().unwrap_or(u64::MAX);
        let minor: u64 = caps[2].parse().unwrap_or(u64::MAX);
        if major != self.config.expected_schema_major || minor < self.config.min_schema_minor {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::IncompatibleVersion,
                finding_id: None,
                field: "schema_version".to_string(),
                reason: None,
                detail: format!(
                    "got {schema_version}, accept {}.{}+",
                    self.config.expected_schema_major, self.config.min_schema_minor
                ),
            });
            return Err(DiagnosticCode::IncompatibleVersion);
        }

        let Some(caps) = PROMPT_VERSION_RE.captures(prompt_version) else {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::SchemaMismatch,
                finding_id: None,
                field: "prompt_version".to_string(),
                reason: None,
                detail: format!("malformed version: {}", diag_value(prompt_version)),
            });
            return Err(DiagnosticCode::SchemaMismatch);
        };
        let major: u64 = caps[1].parse().unwrap_or(u64::MAX);
        let minor: u64 = caps[2].parse().unwrap_or(u64::MAX);
        let has_patch_drift = caps.get(3).is_some();
        let line_matches =
            major == self.config.expected_prompt_major && minor == self.config.expected_prompt_minor;
        let drift_ok = !has_patch_drift || self.config.allow_prompt_patch_drift;
        if !line_matches || !drift_ok {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::IncompatibleVersion,
                finding_id: None,
                field: "prompt_version".to_string(),
                reason: None,
                detail: format!(
                    "got {prompt_version}, accept {}.{}{}",
                    self.config.expected_prompt_major,
                    self.config.expected_prompt_minor,
                    if self.config.allow_prompt_patch_drift {
                        ".x"
                    } else {
                        ""
                    }
                ),
            });
            return Err(DiagnosticCode::IncompatibleVersion);
        }
        Ok(())
    }

    /// Validates one finding. Returns `None` when the finding is dropped;
    /// every drop emits a `finding_dropped` diagnostic with its cause.
    #[allow(clippy::too_many_lines)]
    fn validate_finding(
        idx: usize,
        raw: &Value,
        changed: &BTreeSet<String>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<Finding> {
        let slot = format!("findings[{idx}]");

        let Some(obj) = raw.as_object() else {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::FindingDropped,
                finding_id: None,
                field: slot,
                reason: Some(DiagnosticCode::SchemaMismatch),
                detail: "finding is not an object".to_string(),
            });
            return None;
        };

        let finding_id = obj
            .get("id")
            .and_then(Value::as_str)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        const REQUIRED: &[&str] = &["id", "severity", "category", "title", "file", "line", "message"];
        let missing: Vec<&str> = REQUIRED
            .iter()
            .copied()
            .filter(|field| !obj.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::FindingDropped,
                finding_id,
                field: slot,
                reason: Some(DiagnosticCode::MissingRequiredField),
                detail: format!("missing: {}", missing.join(", ")),
            });
            return None;
        }

        // Safe coercions, in order: trim string fields, canonicalize `file`
        // separators, parse integral numeric strings.
        let mut strings = std::collections::BTreeMap::new();
        for field in ["id", "severity", "category", "title", "file", "message"] {
            let value = obj.get(field).unwrap_or(&Value::Null);
            let Some(text) = value.as_str() else {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::FindingDropped,
                    finding_id: finding_id.clone(),
                    field: field.to_string(),
                    reason: Some(DiagnosticCode::SchemaMismatch),
                    detail: format!("{field} is not a string in {slot}"),
                });
                return None;
            };
            let trimmed = text.trim();
            if trimmed != text {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::CoercionApplied,
                    finding_id: finding_id.clone(),
                    field: field.to_string(),
                    reason: None,
                    detail: format!(
                        "trimmed {:?} -> {:?}",
                        diag_value(text),
                        diag_value(trimmed)
                    ),
                });
            }
            strings.insert(field, trimmed.to_string());
        }

        let raw_file = strings["file"].clone();
        let canonical_file = canonicalize_repo_path(&raw_file);
        if canonical_file != raw_file {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::CoercionApplied,
                finding_id: finding_id.clone(),
                field: "file".to_string(),
                reason: None,
                detail: format!(
                    "canonicalized {:?} -> {:?}",
                    diag_value(&raw_file),
                    diag_value(&canonical_file)
                ),
            });
        }

        let line = Self::coerce_line(obj.get("line"), "line", &finding_id, diagnostics);
        let end_line = match obj.get("end_line") {
            None | Some(Value::Null) => Ok(None),
            value => Self::coerce_line(value, "end_line", &finding_id, diagnostics).map(Some),
        };

        if strings["id"].is_empty() {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::FindingDropped,
                finding_id: None,
                field: slot,
                reason: Some(DiagnosticCode::MissingRequiredField),
                detail: "id is empty".to_string(),
            });
            return None;
        }

        let severity = match Severity::parse(&strings["severity"]) {
            Ok(severity) => severity,
            Err(err) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::FindingDropped,
                    finding_id,
                    field: "severity".to_string(),
                    reason: Some(DiagnosticCode::InvalidEnumValue),
                    detail: format!("unsupported severity: {}", diag_value(&err.value)),
                });
                return None;
            }
        };
        let category = match Category::parse(&strings["category"]) {
            Ok(category) => category,
            Err(err) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::FindingDropped,
                    finding_id,
                    field: "category".to_string(),
                    reason: Some(DiagnosticCode::InvalidEnumValue),
                    detail: format!("unsupported category: {}", diag_value(&err.value)),
                });
                return None;
            }
        };
        let confidence = match obj.get("confidence") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => match Confidence::parse(text.trim()) {
                Ok(confidence) => Some(confidence),
                Err(err) => {
                    diagnostics.push(Diagnostic {
                        code: DiagnosticCode::FindingDropped,
                        finding_id,
                        field: "confidence".to_string(),
                        reason: Some(DiagnosticCode::InvalidEnumValue),
                        detail: format!("unsupported confidence: {}", diag_value(&err.value)),
                    });
                    return None;
                }
            },
            Some(_) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::FindingDropped,
                    finding_id,
                    field: "confidence".to_string(),
                    reason: Some(DiagnosticCode::InvalidEnumValue),
                    detail: "confidence is not a string".to_string(),
                });
                return None;
            }
        };

        let line = match line {
            Ok(line) => line,
            Err(detail) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::FindingDropped,
                    finding_id,
                    field: "line".to_string(),
                    reason: Some(DiagnosticCode::InvalidLineRange),
                    detail,
                });
                return None;
            }
        };
        let end_line = match end_line {
            Ok(end_line) => end_line,
            Err(detail) => {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::FindingDropped,
                    finding_id,
                    field: "end_line".to_string(),
                    reason: Some(DiagnosticCode::InvalidLineRange),
                    detail,
                });
                return None;
            }
        };
        if let Some(end) = end_line {
            if end < line {
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::FindingDropped,
                    finding_id,
                    field: "end_line".to_string(),
                    reason: Some(DiagnosticCode::InvalidLineRange),
                    detail: format!("end_line {end} < line {line}"),
                });
                return None;
            }
        }

        if !is_changed_file(&canonical_file, changed) {
            diagnostics.push(Diagnostic {
                code: DiagnosticCode::FindingDropped,
                finding_id,
                field: "file".to_string(),
                reason: Some(DiagnosticCode::FileNotInChangedFiles),
                detail: format!("{canonical_file}:{line} is not in the changelist"),
            });
            return None;
        }

        let suggestion = obj
            .get("suggestion")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string());
        let rule_id = obj
            .get("rule_id")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string());

        Some(Finding {
            id: strings["id"].clone(),
            severity,
            category,
            title: strings["title"].clone(),
            file: canonical_file,
            line,
            end_line,
            message: strings["message"].clone(),
            suggestion,
            confidence,
            rule_id,
        })
    }

    /// Coerces a line-number value: integral JSON numbers pass through,
    /// strings of digits are parsed (emitting `coercion_applied`), everything
    /// else is an error described by the returned detail.
    fn coerce_line(
        value: Option<&Value>,
        field: &'static str,
        finding_id: &Option<String>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<u32, String> {
        let parsed = match value {
            Some(Value::Number(number)) => number
                .as_u64()
                .ok_or_else(|| format!("{field} is not a positive integer"))?,
            Some(Value::String(text)) => {
                let trimmed = text.trim();
                if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(format!("{field} is not numeric: {}", diag_value(text)));
                }
                let parsed: u64 = trimmed
                    .parse()
                    .map_err(|_| format!("{field} is out of range: {}", diag_value(text)))?;
                diagnostics.push(Diagnostic {
                    code: DiagnosticCode::CoercionApplied,
                    finding_id: finding_id.clone(),
                    field: field.to_string(),
                    reason: None,
                    detail: format!("parsed {:?} -> {parsed}", diag_value(text)),
                });
                parsed
            }
            _ => return Err(format!("{field} is not an integer")),
        };
        if parsed < 1 {
            return Err(format!("{field} must be >= 1, got {parsed}"));
        }
        u32::try_from(parsed).map_err(|_| format!("{field} is out of range: {parsed}"))
    }
}


/// Property-based tests for validator robustness and determinism.
#[cfg(test)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Validation never panics on arbitrary bytes.
        #[test]
        fn validate_never_panics(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let validator = ResultValidator::default();
            let _ = validator.validate(&payload, &["src/a.py".to_string()]);
        }

        /// Validation is deterministic: the same input yields the identical
        /// outcome and diagnostics.
        #[test]
        fn validate_is_deterministic(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let validator = ResultValidator::default();
            let files = vec!["src/a.py".to_string(), "src/b.py".to_string()];
            let first = validator.validate(&payload, &files);
            let second = validator.validate(&payload, &files);
            prop_assert_eq!(first, second);
        }
    }
}
