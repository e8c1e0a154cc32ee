//! Validated review-result model.
//!
//! These types are the *output* of [`crate::validator`]: a raw model response
//! only becomes a [`ReviewResult`] after the validator has parsed, coerced,
//! and reconciled it. Serialization uses the wire field names of the model
//! output contract.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when parsing an enum label outside the allowed set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field} value: {value}")]
pub struct InvalidEnumValue {
    /// Which field carried the value.
    pub field: &'static str,
    /// The rejected value.
    pub value: String,
}

/// Finding severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Must-fix: release-blocking defect.
    Critical,
    /// Should-fix before merge.
    High,
    /// Worth fixing; not blocking.
    Medium,
    /// Minor issue.
    Low,
    /// Informational note.
    Info,
}

impl Severity {
    /// Returns the wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }

    /// Parses a wire label.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnumValue`] outside the allowed set.
    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "info" => Ok(Self::Info),
            other => Err(InvalidEnumValue {
                field: "severity",
                value: other.to_string(),
            }),
        }
    }
}

/// Finding category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Logic or behavioral defect.
    Correctness,
    /// Vulnerability or unsafe handling of untrusted input.
    Security,
    /// Inefficiency with user-visible cost.
    Performance,
    /// Failure-handling or resilience gap.
    Reliability,
    /// Structure or readability concern.
    Maintainability,
    /// Style-guide deviation.
    Style,
    /// Missing or inadequate test coverage.
    Test,
}

impl Category {
    /// Returns the wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Correctness => "correctness",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Reliability => "reliability",
            Self::Maintainability => "maintainability",
            Self::Style => "style",
            Self::Test => "test",
        }
    }

    /// Parses a wire label.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnumValue`] outside the allowed set.
    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "correctness" => Ok(Self::Correctness),
            "security" => Ok(Self::Security),
            "performance" => Ok(Self::Performance),
            "reliability" => Ok(Self::Reliability),
            "maintainability" => Ok(Self::Maintainability),
            "style" => Ok(Self::Style),
            "test" => Ok(Self::Test),
            other => Err(InvalidEnumValue {
                field: "category",
                value: other.to_string(),
            }),
        }
    }
}

/// Model self-reported confidence in a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// High confidence.
    High,
    /// Medium confidence.
    Medium,
    /// Low confidence.
    Low,
}

impl Confidence {
    /// Parses a wire label.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEnumValue`] outside the allowed set.
    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(InvalidEnumValue {
                field: "confidence",
                value: other.to_string(),
            }),
        }
    }
}

/// A single validated finding.
///
/// `file` is canonicalized (forward slashes, no leading `./`) and guaranteed
/// to match one of the changelist's changed files. `line >= 1`, and
/// `end_line >= line` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Model-assigned finding id, non-empty.
    pub id: String,
    /// Severity.
    pub severity: Severity,
    /// Category.
    pub category: Category,
    /// One-line title.
    pub title: String,
    /// Canonicalized repo-relative path.
    pub file: String,
    /// 1-based start line.
    pub line: u32,
    /// Optional 1-based end line, `>= line`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    /// Finding body.
    pub message: String,
    /// Optional suggested fix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Optional model confidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    /// Optional originating rule id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// A validated review result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    /// Output-contract version of the response (`major.minor`).
    pub schema_version: String,
    /// Version of the prompt that produced it (`major.minor[.patch]`).
    pub prompt_version: String,
    /// Findings that survived validation. May be empty.
    pub findings: Vec<Finding>,
    /// Optional model-provided summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Optional opaque metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_is_most_severe_first() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Info);
    }

    #[test]
    fn test_enum_parse_rejects_unknown() {
        assert!(Severity::parse("urgent").is_err());
        assert!(Category::parse("docs").is_err());
        assert!(Confidence::parse("certain").is_err());
    }

    #[test]
    fn test_finding_serde_omits_absent_optionals() {
        let finding = Finding {
            id: "f-1".to_string(),
            severity: Severity::High,
            category: Category::Correctness,
            title: "Off-by-one".to_string(),
            file: "src/a.py".to_string(),
            line: 5,
            end_line: None,
            message: "Loop bound excludes the final element.".to_string(),
            suggestion: None,
            confidence: None,
            rule_id: None,
        };
        let json = serde_json::to_value(&finding).unwrap();
        assert!(json.get("end_line").is_none());
        assert_eq!(json["severity"], "high");
    }
}
