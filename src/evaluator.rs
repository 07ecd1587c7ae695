//! Evaluator capability consumed by command ports.
//!
//! An [`Evaluator`] runs one command string in the host's interpreter. The
//! core never calls it concurrently: every call is funneled through the
//! single execution context in [`crate::dispatch`].
//!
//! Evaluators are created per port from an [`EvaluatorFactory`] looked up by
//! language key when the port is opened.

use std::sync::Arc;

/// Structured result kinds an evaluator can hand back.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    /// No result (statements, procedures returning nothing).
    None,
    /// Boolean result.
    Bool(bool),
    /// Integer result.
    Int(i64),
    /// Floating point result.
    Float(f64),
    /// Text result. Never pickled.
    Text(String),
    /// Sequence of results.
    List(Vec<ResultValue>),
}

impl ResultValue {
    /// Whether this value is a plain string, which bypasses pickling.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Render as wire text: lists are TAB-joined, `None` is empty.
    pub fn render(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(n) => n.to_string(),
            Self::Float(x) => render_float(*x),
            Self::Text(s) => s.clone(),
            Self::List(items) => items
                .iter()
                .map(Self::render)
                .collect::<Vec<_>>()
                .join("\t"),
        }
    }
}

/// Integral floats keep a trailing `.0` so clients can tell them from ints.
fn render_float(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{x:.1}")
    } else {
        x.to_string()
    }
}

impl From<&str> for ResultValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ResultValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for ResultValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for ResultValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for ResultValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<ResultValue>> From<Vec<T>> for ResultValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

/// Successful outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Output printed while the command ran, one entry per line.
    pub output: Vec<String>,
    /// Value the command produced.
    pub value: ResultValue,
}

impl Evaluation {
    /// Evaluation with a value and no printed output.
    pub fn value(value: impl Into<ResultValue>) -> Self {
        Self {
            output: Vec::new(),
            value: value.into(),
        }
    }

    /// Evaluation that produced nothing.
    pub fn empty() -> Self {
        Self::value(ResultValue::None)
    }

    /// Attach printed output lines.
    pub fn with_output(mut self, output: Vec<String>) -> Self {
        self.output = output;
        self
    }
}

/// Error raised by the interpreter while running a command.
///
/// Sent back to the client as response text; never a server fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError(pub String);

impl EvalError {
    /// Create an evaluation error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EvalError {}

/// A language interpreter bound to a command port.
///
/// Implementations must be callable from the execution context thread; the
/// core guarantees calls never overlap.
pub trait Evaluator: Send + Sync {
    /// Run `source` and report its outcome.
    fn evaluate(&self, source: &str) -> Result<Evaluation, EvalError>;

    /// Wrap one request line with the port's prefix command.
    ///
    /// The default quotes the line as a string argument terminated by `;`.
    fn apply_prefix(&self, prefix: &str, line: &str) -> String {
        format!("{prefix} \"{}\";", escape_string(line))
    }
}

/// Creates the evaluator for a newly opened port.
pub type EvaluatorFactory = Arc<dyn Fn() -> Arc<dyn Evaluator> + Send + Sync>;

/// Escape a line for use inside a double-quoted string literal.
pub fn escape_string(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for ch in line.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Evaluator for Nop {
        fn evaluate(&self, _source: &str) -> Result<Evaluation, EvalError> {
            Ok(Evaluation::empty())
        }
    }

    #[test]
    fn test_render_scalars() {
        assert_eq!(ResultValue::None.render(), "");
        assert_eq!(ResultValue::Int(2).render(), "2");
        assert_eq!(ResultValue::Float(1.5).render(), "1.5");
        assert_eq!(ResultValue::Float(1.0).render(), "1.0");
        assert_eq!(ResultValue::Float(-3.0).render(), "-3.0");
        assert_eq!(ResultValue::Bool(true).render(), "true");
        assert_eq!(ResultValue::from("pSphere1").render(), "pSphere1");
    }

    #[test]
    fn test_render_list_is_tab_joined() {
        let value = ResultValue::from(vec!["pCube1", "pCube2"]);
        assert_eq!(value.render(), "pCube1\tpCube2");

        let nested = ResultValue::List(vec![ResultValue::Int(1), ResultValue::from(vec![2_i64, 3])]);
        assert_eq!(nested.render(), "1\t2\t3");
    }

    #[test]
    fn test_escape_string() {
        assert_eq!(escape_string(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape_string("a\\b\tc"), "a\\\\b\\tc");
    }

    #[test]
    fn test_default_prefix_wrapping() {
        assert_eq!(Nop.apply_prefix("print", "hello \"x\""), "print \"hello \\\"x\\\"\";");
    }

    #[test]
    fn test_only_text_is_text() {
        assert!(ResultValue::from("x").is_text());
        assert!(!ResultValue::Int(1).is_text());
        assert!(!ResultValue::from(vec!["x"]).is_text());
    }
}
