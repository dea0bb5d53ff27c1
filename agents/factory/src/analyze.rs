//! Line-oriented static analysis of uploaded JavaScript.
//!
//! The analyzer does not parse JS. It matches an enumerated pattern table
//! against each line, checks bracket pairing, and requires a module
//! export. The verdict is deterministic over identical inputs and the
//! entrypoint never panics outward.

use std::panic::{catch_unwind, AssertUnwindSafe};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error};

use roomforge_core::{AnalysisResult, SecurityIssue, Severity};

struct SecurityPattern {
    regex: Regex,
    severity: Severity,
    message: &'static str,
}

fn insensitive(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).expect("invalid security pattern")
}

static SECURITY_PATTERNS: Lazy<Vec<SecurityPattern>> = Lazy::new(|| {
    vec![
        // filesystem / process access
        SecurityPattern {
            regex: insensitive(r#"require\s*\(\s*['"]fs['"]"#),
            severity: Severity::High,
            message: "detected file system access (require('fs'))",
        },
        SecurityPattern {
            regex: insensitive(r#"require\s*\(\s*['"]path['"]"#),
            severity: Severity::Medium,
            message: "detected path manipulation (require('path'))",
        },
        SecurityPattern {
            regex: insensitive(r#"require\s*\(\s*['"]child_process['"]"#),
            severity: Severity::High,
            message: "detected child process execution (require('child_process'))",
        },
        // network modules
        SecurityPattern {
            regex: insensitive(r#"require\s*\(\s*['"]http['"]"#),
            severity: Severity::Medium,
            message: "detected HTTP module usage",
        },
        SecurityPattern {
            regex: insensitive(r#"require\s*\(\s*['"]https['"]"#),
            severity: Severity::Medium,
            message: "detected HTTPS module usage",
        },
        SecurityPattern {
            regex: insensitive(r#"require\s*\(\s*['"]net['"]"#),
            severity: Severity::Medium,
            message: "detected raw network module usage",
        },
        // dangerous functions
        SecurityPattern {
            regex: insensitive(r"eval\s*\("),
            severity: Severity::High,
            message: "detected eval() call",
        },
        // The Function constructor check stays case-sensitive so plain
        // `function(` declarations do not trip it.
        SecurityPattern {
            regex: Regex::new(r"\bFunction\s*\(").expect("invalid security pattern"),
            severity: Severity::High,
            message: "detected Function constructor",
        },
        SecurityPattern {
            regex: insensitive(r#"setTimeout\s*\(\s*['"]"#),
            severity: Severity::Medium,
            message: "detected string argument to setTimeout",
        },
        SecurityPattern {
            regex: insensitive(r#"setInterval\s*\(\s*['"]"#),
            severity: Severity::Medium,
            message: "detected string argument to setInterval",
        },
        // process / host introspection
        SecurityPattern {
            regex: insensitive(r"process\.exit"),
            severity: Severity::Medium,
            message: "detected process exit call",
        },
        SecurityPattern {
            regex: insensitive(r"process\.env"),
            severity: Severity::Low,
            message: "detected environment variable access",
        },
        SecurityPattern {
            regex: insensitive(r"__dirname"),
            severity: Severity::Low,
            message: "detected directory path access",
        },
        SecurityPattern {
            regex: insensitive(r"__filename"),
            severity: Severity::Low,
            message: "detected file path access",
        },
        // global objects
        SecurityPattern {
            regex: insensitive(r"global\s*\."),
            severity: Severity::Medium,
            message: "detected global object manipulation",
        },
        SecurityPattern {
            regex: insensitive(r"Buffer\s*\."),
            severity: Severity::Medium,
            message: "detected Buffer manipulation",
        },
    ]
});

/// Static analyzer for uploaded JavaScript game modules.
#[derive(Debug, Clone, Default)]
pub struct JsAnalyzer;

impl JsAnalyzer {
    /// A new analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Analyze a source text. Never panics outward; an internal failure
    /// yields an invalid result with one syntax error describing the
    /// crash.
    pub fn analyze(&self, code: &str) -> AnalysisResult {
        match catch_unwind(AssertUnwindSafe(|| self.analyze_inner(code))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                error!(message, "analyzer crashed");
                AnalysisResult::analysis_failure(format!("analysis failed internally: {message}"))
            }
        }
    }

    fn analyze_inner(&self, code: &str) -> AnalysisResult {
        let syntax_errors = check_syntax(code);
        let security_issues = security_scan(code);
        let warnings = check_structure(code);
        let suggestions = generate_suggestions(code, &security_issues);

        let result =
            AnalysisResult::from_findings(syntax_errors, security_issues, warnings, suggestions);
        debug!(
            valid = result.is_valid,
            syntax_errors = result.syntax_errors.len(),
            security_issues = result.security_issues.len(),
            "code analysis finished",
        );
        result
    }
}

fn check_syntax(code: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let closing = |open: char| match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    };

    let mut stack: Vec<(char, usize)> = Vec::new();
    for (line_num, line) in code.lines().enumerate() {
        let line_num = line_num + 1;
        for c in line.chars() {
            match c {
                '(' | '[' | '{' => stack.push((c, line_num)),
                ')' | ']' | '}' => match stack.pop() {
                    None => errors.push(format!("line {line_num}: unmatched closing bracket '{c}'")),
                    Some((open, _)) if closing(open) != c => errors.push(format!(
                        "line {line_num}: mismatched bracket, expected '{}' but found '{c}'",
                        closing(open)
                    )),
                    Some(_) => {}
                },
                _ => {}
            }
        }
    }
    for (open, line_num) in stack {
        errors.push(format!("line {line_num}: unclosed bracket '{open}'"));
    }

    if !code.contains("module.exports") && !code.contains("export") {
        errors.push("missing module export statement (module.exports or export)".to_owned());
    }

    errors
}

fn security_scan(code: &str) -> Vec<SecurityIssue> {
    let mut issues = Vec::new();
    for pattern in SECURITY_PATTERNS.iter() {
        for (line_num, line) in code.lines().enumerate() {
            if pattern.regex.is_match(line) {
                issues.push(SecurityIssue {
                    severity: pattern.severity,
                    message: pattern.message.to_owned(),
                    line: line_num + 1,
                    code_snippet: line.trim().to_owned(),
                });
            }
        }
    }
    issues
}

fn check_structure(code: &str) -> Vec<String> {
    let mut warnings = Vec::new();

    if !code.to_lowercase().contains("socket") {
        warnings.push("consider adding websocket handling logic".to_owned());
    }
    if !code.contains("gameState") && !code.contains("game_state") {
        warnings.push("consider defining game state management".to_owned());
    }
    if !code.contains("handleConnection") && !code.contains("onConnection") {
        warnings.push("consider implementing a connection handler".to_owned());
    }
    if code.lines().count() > 1000 {
        warnings.push("code is very long, consider splitting it into modules".to_owned());
    }

    warnings
}

fn generate_suggestions(code: &str, security_issues: &[SecurityIssue]) -> Vec<String> {
    let mut suggestions = Vec::new();

    let high = security_issues
        .iter()
        .filter(|i| i.severity == Severity::High)
        .count();
    if high > 0 {
        suggestions.push(format!(
            "{high} high-risk security issue(s) found, remove the dangerous system calls"
        ));
    }
    let medium = security_issues
        .iter()
        .filter(|i| i.severity == Severity::Medium)
        .count();
    if medium > 0 {
        suggestions.push(format!(
            "{medium} medium-risk issue(s) found, consider safer alternatives"
        ));
    }

    if code.contains("console.log") {
        suggestions.push("prefer structured logging over console.log".to_owned());
    }
    if code.contains("var ") {
        suggestions.push("prefer let or const over var declarations".to_owned());
    }
    if code.matches("setInterval").count() > 3 {
        suggestions.push("several timers detected, watch the performance impact".to_owned());
    }

    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN_GAME: &str = r#"
const gameState = { clickCount: 0 };

function handleConnection(socket) {
    socket.emit('gameState', gameState);
}

module.exports = { handleConnection };
"#;

    #[test]
    fn clean_source_is_valid() {
        let result = JsAnalyzer::new().analyze(CLEAN_GAME);
        assert!(result.is_valid, "{:?}", result.syntax_errors);
        assert!(result.syntax_errors.is_empty());
        assert!(result
            .security_issues
            .iter()
            .all(|i| i.severity != Severity::High));
    }

    #[test]
    fn eval_is_high_severity_and_invalidates() {
        let result = JsAnalyzer::new().analyze("module.exports = {};\neval(\"x\");\n");
        assert!(!result.is_valid);
        let issue = result
            .security_issues
            .iter()
            .find(|i| i.severity == Severity::High)
            .expect("high severity issue");
        assert!(issue.message.contains("eval"));
        assert_eq!(issue.line, 2);
        assert_eq!(issue.code_snippet, "eval(\"x\");");
    }

    #[test]
    fn require_fs_is_rejected_case_insensitively() {
        let result = JsAnalyzer::new().analyze("module.exports = {};\nREQUIRE('fs');\n");
        assert!(!result.is_valid);
    }

    #[test]
    fn function_constructor_check_is_case_sensitive() {
        let flagged = JsAnalyzer::new().analyze("module.exports = {};\nnew Function('x');\n");
        assert!(!flagged.is_valid);

        let plain = JsAnalyzer::new()
            .analyze("module.exports = {};\nconst f = function (x) { return x; };\n");
        assert!(plain.is_valid, "{:?}", plain.security_issues);

        let named = JsAnalyzer::new().analyze("module.exports = {};\nmyFunction(1);\n");
        assert!(named.is_valid, "{:?}", named.security_issues);
    }

    #[test]
    fn string_timer_is_medium_but_function_timer_is_fine() {
        let stringy = JsAnalyzer::new()
            .analyze("module.exports = {};\nsetTimeout(\"doThing()\", 100);\n");
        assert!(stringy
            .security_issues
            .iter()
            .any(|i| i.severity == Severity::Medium && i.message.contains("setTimeout")));
        assert!(stringy.is_valid);

        let functional =
            JsAnalyzer::new().analyze("module.exports = {};\nsetTimeout(() => tick(), 100);\n");
        assert!(functional
            .security_issues
            .iter()
            .all(|i| !i.message.contains("setTimeout")));
    }

    #[test]
    fn bracket_mismatch_reports_line_numbers() {
        let result = JsAnalyzer::new().analyze("module.exports = {};\nfunction f( {\n}\n");
        assert!(!result.is_valid);
        assert!(result.syntax_errors.iter().any(|e| e.contains("line")));
    }

    #[test]
    fn unclosed_bracket_is_a_syntax_error() {
        let result = JsAnalyzer::new().analyze("module.exports = {\n");
        assert!(!result.is_valid);
        assert!(result
            .syntax_errors
            .iter()
            .any(|e| e.contains("unclosed bracket '{'")));
    }

    #[test]
    fn missing_export_is_a_syntax_error() {
        let result = JsAnalyzer::new().analyze("const x = 1;\n");
        assert!(!result.is_valid);
        assert!(result
            .syntax_errors
            .iter()
            .any(|e| e.contains("module.exports")));
    }

    #[test]
    fn structure_warnings_do_not_invalidate() {
        let result = JsAnalyzer::new().analyze("module.exports = { tick: () => 1 };\n");
        assert!(result.is_valid);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn suggestions_mention_finding_counts() {
        let result = JsAnalyzer::new()
            .analyze("module.exports = {};\neval('x');\nconsole.log('hi');\nvar y = 1;\n");
        assert!(result
            .suggestions
            .iter()
            .any(|s| s.contains("high-risk security issue")));
        assert!(result.suggestions.iter().any(|s| s.contains("console.log")));
        assert!(result.suggestions.iter().any(|s| s.contains("var")));
    }

    #[test]
    fn analysis_is_deterministic() {
        let source = "module.exports = {};\neval('x');\nrequire('http');\n";
        let first = JsAnalyzer::new().analyze(source);
        let second = JsAnalyzer::new().analyze(source);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
