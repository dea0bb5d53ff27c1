use serde::{Deserialize, Serialize};

/// Severity of a static-analysis finding. Any `High` finding rejects the
/// upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; never blocks.
    Low,
    /// Suspicious but tolerated.
    Medium,
    /// Blocks the upload.
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.write_str(s)
    }
}

/// One pattern hit in uploaded JavaScript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityIssue {
    /// How bad the hit is.
    pub severity: Severity,
    /// Human-readable description of the pattern.
    pub message: String,
    /// 1-based source line.
    pub line: usize,
    /// The offending line, trimmed.
    pub code_snippet: String,
}

/// Full output of one analyzer run. `is_valid` holds iff there are no
/// syntax errors and no high-severity security issues.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    /// Overall verdict.
    pub is_valid: bool,
    /// Bracket/structure problems, with line numbers.
    pub syntax_errors: Vec<String>,
    /// Security pattern hits.
    pub security_issues: Vec<SecurityIssue>,
    /// Non-fatal structural warnings.
    pub warnings: Vec<String>,
    /// Advisory improvement hints.
    pub suggestions: Vec<String>,
}

impl AnalysisResult {
    /// Build a result, deriving the verdict from the findings.
    pub fn from_findings(
        syntax_errors: Vec<String>,
        security_issues: Vec<SecurityIssue>,
        warnings: Vec<String>,
        suggestions: Vec<String>,
    ) -> Self {
        let is_valid = syntax_errors.is_empty()
            && !security_issues.iter().any(|i| i.severity == Severity::High);
        Self {
            is_valid,
            syntax_errors,
            security_issues,
            warnings,
            suggestions,
        }
    }

    /// A failed result carrying a single syntax error, used when the
    /// analyzer itself blew up.
    pub fn analysis_failure(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            syntax_errors: vec![message.into()],
            security_issues: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}
