//! Unified error model.
//!
//! Every fallible operation in this crate returns [`MadError`]. Each error
//! carries a [`ErrorCategory`], a free-form [`ErrorContext`], a recoverability
//! flag, a list of actionable suggestions, and an optional boxed cause. A
//! process-wide [`ErrorReporter`] renders errors for humans; library code
//! never prints directly, it only constructs and returns `MadError` values.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::sync::RwLock;

/// Broad classification of a failure, used to drive recoverability policy
/// and panel rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    Validation,
    Connection,
    Authentication,
    Runtime,
    Build,
    Discovery,
    Orchestration,
    Runner,
    Configuration,
    Timeout,
}

impl ErrorCategory {
    /// Fixed recoverability policy per category (spec.md §4.1/§7):
    /// validation, connection, authentication, configuration, discovery,
    /// timeout, runner are recoverable; runtime, build, orchestration are not.
    pub fn default_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorCategory::Runtime | ErrorCategory::Build | ErrorCategory::Orchestration
        )
    }

    fn icon(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "\u{26a0}", // ⚠
            ErrorCategory::Connection => "\u{1f50c}", // 🔌
            ErrorCategory::Authentication => "\u{1f512}", // 🔒
            ErrorCategory::Runtime => "\u{1f4a5}",    // 💥
            ErrorCategory::Build => "\u{1f528}",      // 🔨
            ErrorCategory::Discovery => "\u{1f50d}",  // 🔍
            ErrorCategory::Orchestration => "\u{1f3bc}", // 🎼
            ErrorCategory::Runner => "\u{1f3c3}",     // 🏃
            ErrorCategory::Configuration => "\u{2699}", // ⚙
            ErrorCategory::Timeout => "\u{23f1}",     // ⏱
        }
    }

    fn label(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "Validation Error",
            ErrorCategory::Connection => "Connection Error",
            ErrorCategory::Authentication => "Authentication Error",
            ErrorCategory::Runtime => "Runtime Error",
            ErrorCategory::Build => "Build Error",
            ErrorCategory::Discovery => "Discovery Error",
            ErrorCategory::Orchestration => "Orchestration Error",
            ErrorCategory::Runner => "Runner Error",
            ErrorCategory::Configuration => "Configuration Error",
            ErrorCategory::Timeout => "Timeout Error",
        }
    }
}

/// Free-form key/value facts attached to an error at the point it was raised
/// (model name, node, dockerfile path, command, exit code, ...).
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    fields: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.fields.iter()
    }
}

/// The crate's single error type.
#[derive(Debug)]
pub struct MadError {
    pub message: String,
    pub category: ErrorCategory,
    pub context: ErrorContext,
    pub recoverable: bool,
    pub suggestions: Vec<String>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl MadError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let recoverable = category.default_recoverable();
        Self {
            message: message.into(),
            category,
            context: ErrorContext::new(),
            recoverable,
            suggestions: Vec::new(),
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, message)
    }
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Runtime, message)
    }
    pub fn build(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Build, message)
    }
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Discovery, message)
    }
    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Orchestration, message)
    }
    pub fn runner(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Runner, message)
    }
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context = self.context.with(key, value);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for MadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category.label(), self.message)
    }
}

impl std::error::Error for MadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for MadError {
    fn from(err: std::io::Error) -> Self {
        MadError::runtime(err.to_string())
    }
}

impl From<serde_json::Error> for MadError {
    fn from(err: serde_json::Error) -> Self {
        MadError::validation(format!("invalid JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for MadError {
    fn from(err: serde_yaml::Error) -> Self {
        MadError::validation(format!("invalid YAML: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, MadError>;

/// Renders [`MadError`] values for display. Replaceable at process startup so
/// tests and alternate front-ends can swap in their own rendering.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &MadError);
}

/// Default reporter: a bordered panel on stderr plus a structured
/// `tracing::error!` event.
pub struct PanelReporter {
    pub verbose: bool,
}

impl ErrorReporter for PanelReporter {
    fn report(&self, err: &MadError) {
        let icon = err.category.icon();
        let title = format!("{icon} {}", err.category.label());
        eprintln!("{}", "\u{250c}\u{2500}\u{2500} ERROR \u{2500}\u{2500}".red());
        eprintln!("{}", title.red().bold());
        eprintln!("{}", err.message);
        if !err.context.is_empty() {
            eprintln!("{}", "context:".dimmed());
            for (k, v) in err.context.iter() {
                eprintln!("  {k}: {v}");
            }
        }
        if self.verbose {
            let mut cause = err.cause.as_deref();
            while let Some(c) = cause {
                eprintln!("{} {c}", "caused by:".dimmed());
                cause = c.source();
            }
        }
        if !err.suggestions.is_empty() {
            eprintln!("{}", "suggestions:".yellow());
            for s in &err.suggestions {
                eprintln!("  - {s}");
            }
        }
        eprintln!(
            "{}",
            if err.recoverable {
                "recoverable".green()
            } else {
                "not recoverable".red()
            }
        );
        eprintln!("{}", "\u{2514}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}".red());
        tracing::error!(
            category = ?err.category,
            recoverable = err.recoverable,
            message = %err.message,
            "error"
        );
    }
}

static REPORTER: OnceLock<RwLock<Box<dyn ErrorReporter>>> = OnceLock::new();

fn reporter_cell() -> &'static RwLock<Box<dyn ErrorReporter>> {
    REPORTER.get_or_init(|| RwLock::new(Box::new(PanelReporter { verbose: false })))
}

/// Installs a process-wide reporter, replacing any previous one.
pub fn set_reporter(reporter: Box<dyn ErrorReporter>) {
    *reporter_cell().write().expect("reporter lock poisoned") = reporter;
}

/// Reports an error through the installed reporter, falling back to a plain
/// log line if the lock is unavailable.
pub fn handle(err: &MadError) {
    match reporter_cell().read() {
        Ok(reporter) => reporter.report(err),
        Err(_) => tracing::error!(message = %err.message, "error (reporter unavailable)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_recoverability_matches_policy() {
        assert!(ErrorCategory::Validation.default_recoverable());
        assert!(ErrorCategory::Connection.default_recoverable());
        assert!(ErrorCategory::Authentication.default_recoverable());
        assert!(ErrorCategory::Configuration.default_recoverable());
        assert!(ErrorCategory::Discovery.default_recoverable());
        assert!(ErrorCategory::Timeout.default_recoverable());
        assert!(ErrorCategory::Runner.default_recoverable());
        assert!(!ErrorCategory::Runtime.default_recoverable());
        assert!(!ErrorCategory::Build.default_recoverable());
        assert!(!ErrorCategory::Orchestration.default_recoverable());
    }

    #[test]
    fn builder_methods_set_fields() {
        let err = MadError::build("dockerfile missing")
            .with_field("model", "resnet50")
            .with_suggestion("check the model directory")
            .with_recoverable(false);
        assert_eq!(err.category, ErrorCategory::Build);
        assert!(!err.recoverable);
        assert_eq!(err.suggestions.len(), 1);
        assert!(!err.context.is_empty());
    }

    #[test]
    fn display_includes_category_and_message() {
        let err = MadError::timeout("node01 did not respond");
        let rendered = err.to_string();
        assert!(rendered.contains("Timeout Error"));
        assert!(rendered.contains("node01 did not respond"));
    }

    #[test]
    #[serial_test::serial]
    fn handle_falls_back_without_panicking() {
        set_reporter(Box::new(PanelReporter { verbose: false }));
        handle(&MadError::runtime("boom"));
    }
}
