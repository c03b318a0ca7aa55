//! Request and result types shared by every execution surface.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ExecError;

/// Marker appended to output that was cut at `max_output_bytes`.
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Source languages the runner understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Interpreted directly; the implicit language when none is given.
    #[default]
    Python,
    C,
    Cpp,
}

impl Language {
    /// File extension used for the staged source file.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::C => "c",
            Self::Cpp => "cpp",
        }
    }

    /// Whether the language goes through a compile step before running.
    #[must_use]
    pub const fn is_compiled(self) -> bool {
        matches!(self, Self::C | Self::Cpp)
    }

    /// Parse an optional wire value, defaulting to the interpreted language.
    pub fn from_optional(value: Option<&str>) -> Result<Self, RequestError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(v) => v.parse(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Python => "python",
            Self::C => "c",
            Self::Cpp => "cpp",
        })
    }
}

impl FromStr for Language {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Python),
            "c" => Ok(Self::C),
            "cpp" | "c++" => Ok(Self::Cpp),
            other => Err(RequestError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Reasons a submission is rejected before it reaches the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Code cannot be empty")]
    EmptyCode,

    #[error("Unsupported language '{0}'. Must be \"python\", \"c\" or \"cpp\"")]
    UnsupportedLanguage(String),
}

/// A validated submission. Only constructible with non-blank source.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    source_code: String,
    language: Language,
    algorithm_label: Option<String>,
    input_size: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>, language: Language) -> Result<Self, RequestError> {
        let source_code = source_code.into();
        if source_code.trim().is_empty() {
            return Err(RequestError::EmptyCode);
        }
        Ok(Self {
            source_code,
            language,
            algorithm_label: None,
            input_size: None,
        })
    }

    /// Attach the algorithm name used when the run is recorded.
    #[must_use]
    pub fn with_algorithm_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        self.algorithm_label = (!label.trim().is_empty()).then_some(label);
        self
    }

    #[must_use]
    pub const fn with_input_size(mut self, input_size: u64) -> Self {
        self.input_size = Some(input_size);
        self
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub const fn language(&self) -> Language {
        self.language
    }

    pub fn algorithm_label(&self) -> Option<&str> {
        self.algorithm_label.as_deref()
    }

    pub const fn input_size(&self) -> Option<u64> {
        self.input_size
    }
}

/// Which strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sandbox,
    Fallback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sandbox => "sandbox",
            Self::Fallback => "fallback",
        })
    }
}

/// Failure category carried by an unsuccessful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Staging,
    Compilation,
    Runtime,
    Timeout,
    SandboxUnavailable,
    Unexpected,
}

/// Normalized outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_kind: Option<ErrorKind>,
    pub runtime_ms: f64,
    pub backend: BackendKind,
}

impl ExecutionResult {
    pub fn success(
        output: &str,
        runtime: Duration,
        backend: BackendKind,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            success: true,
            output: truncate_output(output.trim(), max_output_bytes),
            error: None,
            error_kind: None,
            runtime_ms: duration_ms(runtime),
            backend,
        }
    }

    /// Convert an execution error into a failed result.
    ///
    /// Stdout printed before a runtime failure is kept in `output`.
    ///
    /// `fallback_runtime` is used when the error does not carry a measured
    /// execution time of its own.
    pub fn failure(
        error: &ExecError,
        fallback_runtime: Duration,
        backend: BackendKind,
        max_output_bytes: usize,
    ) -> Self {
        let runtime = error.runtime().unwrap_or(fallback_runtime);
        let output = error
            .partial_output()
            .map(|out| truncate_output(out.trim(), max_output_bytes))
            .unwrap_or_default();
        Self {
            success: false,
            output,
            error: Some(truncate_output(&error.to_string(), max_output_bytes)),
            error_kind: Some(error.kind()),
            runtime_ms: duration_ms(runtime),
            backend,
        }
    }

    /// Text shown to a user: the output on success, the error otherwise.
    pub fn display_text(&self) -> &str {
        match (&self.error, self.success) {
            (Some(err), false) => err,
            _ => &self.output,
        }
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Cut `text` to at most `max_bytes` on a char boundary, marking the cut.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_parsing() {
        assert_eq!("C".parse::<Language>().unwrap(), Language::C);
        assert_eq!("c++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("py".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(Language::from_optional(None).unwrap(), Language::Python);
        assert_eq!(Language::from_optional(Some("  ")).unwrap(), Language::Python);
        assert_eq!(
            "rust".parse::<Language>(),
            Err(RequestError::UnsupportedLanguage("rust".into()))
        );
    }

    #[test]
    fn language_properties() {
        assert!(Language::C.is_compiled());
        assert!(Language::Cpp.is_compiled());
        assert!(!Language::Python.is_compiled());
        assert_eq!(Language::Cpp.extension(), "cpp");
    }

    #[test]
    fn blank_source_is_rejected() {
        assert_eq!(
            ExecutionRequest::new("", Language::Python).unwrap_err(),
            RequestError::EmptyCode
        );
        assert_eq!(
            ExecutionRequest::new(" \n\t", Language::C).unwrap_err(),
            RequestError::EmptyCode
        );
    }

    #[test]
    fn blank_label_is_dropped() {
        let req = ExecutionRequest::new("print(1)", Language::Python)
            .unwrap()
            .with_algorithm_label("  ")
            .with_input_size(7);
        assert!(req.algorithm_label().is_none());
        assert_eq!(req.input_size(), Some(7));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("short", 10), "short");
        let cut = truncate_output("ééé", 3);
        assert!(cut.starts_with('é'));
        assert!(cut.ends_with("[output truncated]"));
        assert!(!cut.starts_with("éé"));
    }

    #[test]
    fn success_output_is_trimmed() {
        let result = ExecutionResult::success(
            "2\n",
            Duration::from_millis(3),
            BackendKind::Fallback,
            1024,
        );
        assert!(result.success);
        assert_eq!(result.output, "2");
        assert!(result.error.is_none());
        assert!((result.runtime_ms - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn runtime_failure_keeps_partial_output() {
        let err = ExecError::Runtime {
            message: "Process terminated by signal 8".into(),
            output: "computing...\n".into(),
            runtime: Duration::from_millis(7),
        };
        let result =
            ExecutionResult::failure(&err, Duration::from_secs(1), BackendKind::Fallback, 1024);
        assert!(!result.success);
        assert_eq!(result.output, "computing...");
        assert_eq!(
            result.error.as_deref(),
            Some("Runtime error: Process terminated by signal 8")
        );
        assert!((result.runtime_ms - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failure_serializes_kind() {
        let err = ExecError::Compilation("main.c:1: error".into());
        let result =
            ExecutionResult::failure(&err, Duration::from_millis(5), BackendKind::Sandbox, 1024);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "compilation");
        assert_eq!(json["backend"], "sandbox");
        assert!(json["error"].as_str().unwrap().contains("main.c:1: error"));
        assert_eq!(result.display_text(), result.error.as_deref().unwrap());
    }
}
