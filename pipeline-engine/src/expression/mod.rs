// Expression Engine Module
// ${{ }} expressions: parsing, evaluation, template interpolation and conditions

pub mod evaluator;
pub mod functions;
pub mod hashing;
pub mod lexer;
pub mod parser;
pub mod value;

pub use evaluator::{EvalMode, Evaluator};
pub use functions::BuiltinFunctions;
pub use hashing::{aggregate_digests, FileDigest, FileHasher, WorkspaceHasher};
pub use lexer::{has_expressions, split_template, Lexer, Segment, Token};
pub use parser::{BinaryOp, Expr, ExprParser, Reference, ReferencePart};
pub use value::Value;

use crate::error::EvaluationError;
use crate::execution::context::ContextSnapshot;

/// Front door for evaluating workflow expressions against one snapshot
pub struct ExpressionEngine<'a> {
    snapshot: &'a ContextSnapshot,
    hasher: Option<&'a dyn FileHasher>,
}

impl<'a> ExpressionEngine<'a> {
    pub fn new(snapshot: &'a ContextSnapshot) -> Self {
        Self {
            snapshot,
            hasher: None,
        }
    }

    pub fn with_file_hasher(mut self, hasher: Option<&'a dyn FileHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    fn evaluator(&self, mode: EvalMode) -> Evaluator<'a> {
        let evaluator = Evaluator::new(self.snapshot).with_mode(mode);
        match self.hasher {
            Some(hasher) => evaluator.with_file_hasher(hasher),
            None => evaluator,
        }
    }

    /// Evaluate a bare expression or one wrapped in `${{ }}`
    pub fn evaluate(&self, source: &str) -> Result<Value, EvaluationError> {
        let ast = ExprParser::parse_str(strip_delimiters(source))?;
        self.evaluator(EvalMode::Lenient).eval(&ast)
    }

    /// Evaluate where a concrete value is required: undefined paths fail
    pub fn evaluate_required(&self, source: &str) -> Result<Value, EvaluationError> {
        let ast = ExprParser::parse_str(strip_delimiters(source))?;
        self.evaluator(EvalMode::Required).eval(&ast)
    }

    /// Evaluate an `if:` condition.
    ///
    /// Without a status function the condition is `success() && (<expr>)`.
    pub fn evaluate_condition(&self, source: &str) -> Result<bool, EvaluationError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return self.evaluate_condition("success()");
        }

        // text mixed with ${{ }} is a string, and a non-empty string is truthy
        if has_expressions(trimmed) && single_expression(trimmed).is_none() {
            let text = self.interpolate(trimmed)?;
            return Ok(Value::String(text).is_truthy());
        }

        let ast = ExprParser::parse_str(strip_delimiters(trimmed))?;
        let evaluator = self.evaluator(EvalMode::Lenient);

        if !ast.uses_status_function() {
            let success = ExprParser::parse_str("success()")?;
            if !evaluator.eval(&success)?.is_truthy() {
                return Ok(false);
            }
        }

        Ok(evaluator.eval(&ast)?.is_truthy())
    }

    /// Substitute every `${{ }}` in a template with its string form
    pub fn interpolate(&self, template: &str) -> Result<String, EvaluationError> {
        self.interpolate_with(template, EvalMode::Lenient)
    }

    /// Interpolate in a required position: undefined paths fail
    pub fn interpolate_required(&self, template: &str) -> Result<String, EvaluationError> {
        self.interpolate_with(template, EvalMode::Required)
    }

    fn interpolate_with(&self, template: &str, mode: EvalMode) -> Result<String, EvaluationError> {
        if !has_expressions(template) {
            return Ok(template.to_string());
        }

        let evaluator = self.evaluator(mode);
        let mut result = String::with_capacity(template.len());

        for segment in split_template(template)? {
            match segment {
                Segment::Text(text) => result.push_str(&text),
                Segment::Expression(source) => {
                    let ast = ExprParser::parse_str(&source)?;
                    result.push_str(&evaluator.eval(&ast)?.as_string());
                }
            }
        }

        Ok(result)
    }

    /// Expand a template to a value.
    ///
    /// A template that is exactly one `${{ }}` keeps the raw value type;
    /// anything else is interpolated into a string.
    pub fn expand(&self, template: &str) -> Result<Value, EvaluationError> {
        match single_expression(template) {
            Some(source) => self.evaluate(source),
            None => self.interpolate(template).map(Value::String),
        }
    }

    /// Expand every string inside a definition tree
    pub fn expand_tree(&self, tree: &serde_json::Value) -> Result<Value, EvaluationError> {
        match tree {
            serde_json::Value::String(s) => self.expand(s),
            serde_json::Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.expand_tree(item))
                    .collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(map) => Ok(Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.expand_tree(v)?)))
                    .collect::<Result<_, EvaluationError>>()?,
            )),
            other => Ok(Value::from(other)),
        }
    }
}

/// If the whole template is one `${{ expr }}`, return `expr`
pub fn single_expression(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("${{")?.strip_suffix("}}")?;
    // reject `${{ a }} and ${{ b }}`
    match split_template(trimmed) {
        Ok(segments) if segments.len() == 1 => Some(inner.trim()),
        _ => None,
    }
}

/// Strip an optional `${{ }}` wrapper from an expression
pub fn strip_delimiters(source: &str) -> &str {
    single_expression(source).unwrap_or_else(|| source.trim())
}
