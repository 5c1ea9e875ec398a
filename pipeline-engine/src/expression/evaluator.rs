// Expression Evaluator
// Evaluates parsed expressions against an immutable context snapshot

use crate::error::EvaluationError;
use crate::execution::context::ContextSnapshot;
use crate::expression::functions::BuiltinFunctions;
use crate::expression::hashing::FileHasher;
use crate::expression::parser::{BinaryOp, Expr, Reference, ReferencePart};
use crate::expression::value::Value;

/// How undefined paths are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    /// Undefined paths yield null
    #[default]
    Lenient,
    /// Undefined paths fail with `UndefinedReference`
    Required,
}

/// Evaluates expressions against a snapshot. Holds no mutable state, so the
/// same expression against the same snapshot always evaluates the same way.
pub struct Evaluator<'a> {
    snapshot: &'a ContextSnapshot,
    hasher: Option<&'a dyn FileHasher>,
    mode: EvalMode,
}

impl<'a> Evaluator<'a> {
    pub fn new(snapshot: &'a ContextSnapshot) -> Self {
        Self {
            snapshot,
            hasher: None,
            mode: EvalMode::Lenient,
        }
    }

    pub fn with_file_hasher(mut self, hasher: &'a dyn FileHasher) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn with_mode(mut self, mode: EvalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvaluationError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Reference(reference) => self.eval_reference(reference),

            Expr::FunctionCall { name, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                BuiltinFunctions::new(self.snapshot, self.hasher).call(name, values)
            }

            Expr::Access { object, parts } => {
                let target = self.eval(object)?;
                Ok(self.traverse(target, parts)?.unwrap_or(Value::Null))
            }

            Expr::Not(inner) => {
                let value = self.eval(inner)?;
                Ok(Value::Bool(!value.is_truthy()))
            }

            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
        }
    }

    fn eval_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Value, EvaluationError> {
        // && and || short-circuit and yield an operand, not a boolean
        match op {
            BinaryOp::And => {
                let l = self.eval(left)?;
                if !l.is_truthy() {
                    return Ok(l);
                }
                return self.eval(right);
            }
            BinaryOp::Or => {
                let l = self.eval(left)?;
                if l.is_truthy() {
                    return Ok(l);
                }
                return self.eval(right);
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        let ordering = l.loose_cmp(&r);

        let result = match op {
            BinaryOp::Eq => l.loose_eq(&r),
            BinaryOp::Ne => !l.loose_eq(&r),
            BinaryOp::Lt => ordering.is_some_and(|o| o.is_lt()),
            BinaryOp::Le => ordering.is_some_and(|o| o.is_le()),
            BinaryOp::Gt => ordering.is_some_and(|o| o.is_gt()),
            BinaryOp::Ge => ordering.is_some_and(|o| o.is_ge()),
            BinaryOp::And | BinaryOp::Or => false,
        };

        Ok(Value::Bool(result))
    }

    fn eval_reference(&self, reference: &Reference) -> Result<Value, EvaluationError> {
        let Some((ReferencePart::Property(root), rest)) = reference.parts.split_first() else {
            return Err(EvaluationError::syntax("reference must start with a name", 0));
        };

        let Some(context) = self.snapshot.get(root) else {
            return self.undefined(reference);
        };

        match self.traverse(context.clone(), rest)? {
            Some(value) => Ok(value),
            None => self.undefined(reference),
        }
    }

    /// Walk `parts` from `start`. `None` means the path does not exist.
    ///
    /// After a `.*` filter the cursor holds many values and missing members
    /// are dropped instead of failing the path.
    fn traverse(
        &self,
        start: Value,
        parts: &[ReferencePart],
    ) -> Result<Option<Value>, EvaluationError> {
        let mut current = vec![start];
        let mut filtered = false;

        for part in parts {
            let next: Vec<Value> = match part {
                ReferencePart::Property(name) => current
                    .iter()
                    .filter_map(|v| v.property(name).cloned())
                    .collect(),
                ReferencePart::Index(index) => {
                    let key = self.eval(index)?;
                    current
                        .iter()
                        .filter_map(|v| index_value(v, &key))
                        .collect()
                }
                ReferencePart::Wildcard => {
                    filtered = true;
                    filter_items(&current)
                }
            };

            if next.is_empty() && !filtered {
                return Ok(None);
            }
            current = next;
        }

        if filtered {
            Ok(Some(Value::Array(current)))
        } else {
            Ok(current.into_iter().next())
        }
    }

    fn undefined(&self, reference: &Reference) -> Result<Value, EvaluationError> {
        match self.mode {
            EvalMode::Lenient => Ok(Value::Null),
            EvalMode::Required => Err(EvaluationError::UndefinedReference {
                path: reference.to_string(),
            }),
        }
    }
}

fn index_value(target: &Value, key: &Value) -> Option<Value> {
    match (target, key) {
        (Value::Array(items), Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {
            items.get(*n as usize).cloned()
        }
        (Value::Object(_), key) => target.property(&key.as_string()).cloned(),
        _ => None,
    }
}

/// Apply the `.*` object filter: array elements or object values, flattened one level
fn filter_items(values: &[Value]) -> Vec<Value> {
    values
        .iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map.values().cloned().collect(),
            _ => Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::ExprParser;
    use std::collections::BTreeMap;

    fn snapshot() -> ContextSnapshot {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            "github".to_string(),
            Value::from(serde_json::json!({
                "ref": "refs/heads/main",
                "event_name": "push",
                "event": {
                    "labels": [{"name": "bug"}, {"name": "ci"}],
                    "number": 7
                }
            })),
        );
        contexts.insert(
            "needs".to_string(),
            Value::from(serde_json::json!({
                "build": {"result": "skipped", "outputs": {}},
                "test": {"result": "success", "outputs": {"version": "1.2.3"}}
            })),
        );
        contexts.insert(
            "matrix".to_string(),
            Value::from(serde_json::json!({"os": "linux", "node": 18})),
        );
        ContextSnapshot::new(contexts)
    }

    fn eval(expr: &str) -> Value {
        let snap = snapshot();
        let ast = ExprParser::parse_str(expr).unwrap();
        Evaluator::new(&snap).eval(&ast).unwrap()
    }

    fn eval_required(expr: &str) -> Result<Value, EvaluationError> {
        let snap = snapshot();
        let ast = ExprParser::parse_str(expr).unwrap();
        Evaluator::new(&snap).with_mode(EvalMode::Required).eval(&ast)
    }

    #[test]
    fn test_reference_traversal() {
        assert_eq!(eval("github.ref"), Value::from("refs/heads/main"));
        assert_eq!(eval("needs.test.outputs.version"), Value::from("1.2.3"));
        assert_eq!(eval("needs['test'].outputs['version']"), Value::from("1.2.3"));
        assert_eq!(eval("github.event.labels[1].name"), Value::from("ci"));
        assert_eq!(eval("matrix.node"), Value::Number(18.0));
    }

    #[test]
    fn test_undefined_is_null_when_lenient() {
        assert_eq!(eval("needs.build.outputs.version"), Value::Null);
        assert_eq!(eval("nothing.here"), Value::Null);
        assert_eq!(eval("github.event.labels[9]"), Value::Null);
    }

    #[test]
    fn test_undefined_fails_when_required() {
        let err = eval_required("needs.build.outputs.version").unwrap_err();
        assert_eq!(
            err,
            EvaluationError::UndefinedReference {
                path: "needs.build.outputs.version".into()
            }
        );
        assert_eq!(
            eval_required("needs.test.outputs.version").unwrap(),
            Value::from("1.2.3")
        );
    }

    #[test]
    fn test_object_filter() {
        assert_eq!(
            eval("github.event.labels.*.name"),
            Value::from(vec!["bug", "ci"])
        );
        assert_eq!(
            eval("contains(github.event.labels.*.name, 'bug')"),
            Value::Bool(true)
        );
        assert_eq!(eval("github.event.labels.*.missing"), Value::Array(vec![]));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("github.ref == 'REFS/HEADS/MAIN'"), Value::Bool(true));
        assert_eq!(eval("github.event.number > '5'"), Value::Bool(true));
        assert_eq!(eval("matrix.node >= 18"), Value::Bool(true));
        assert_eq!(eval("'abc' < 'abd'"), Value::Bool(true));
        assert_eq!(eval("null == 0"), Value::Bool(true));
        assert_eq!(eval("github.event.labels == 'x'"), Value::Bool(false));
        assert_eq!(eval("github.event.labels != 'x'"), Value::Bool(true));
    }

    #[test]
    fn test_logical_operators_return_operands() {
        assert_eq!(
            eval("github.ref == 'refs/heads/main' && 'prod' || 'dev'"),
            Value::from("prod")
        );
        assert_eq!(eval("matrix.missing || 'fallback'"), Value::from("fallback"));
        assert_eq!(eval("'' && fromJSON('not json')"), Value::from(""));
        assert_eq!(eval("!github.ref"), Value::Bool(false));
    }

    #[test]
    fn test_short_circuit_skips_right_operand() {
        // the right side would fail with MalformedJson if evaluated
        assert_eq!(eval("true || fromJSON('{')"), Value::Bool(true));
        assert_eq!(eval("false && fromJSON('{')"), Value::Bool(false));
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let snap = snapshot();
        let ast = ExprParser::parse_str(
            "format('{0}-{1}', matrix.os, join(github.event.labels.*.name, '+'))",
        )
        .unwrap();
        let evaluator = Evaluator::new(&snap);
        let first = evaluator.eval(&ast).unwrap();
        let second = evaluator.eval(&ast).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Value::from("linux-bug+ci"));
    }

    #[test]
    fn test_member_on_function_result() {
        assert_eq!(
            eval("fromJSON('{\"include\": [{\"os\": \"mac\"}]}').include[0].os"),
            Value::from("mac")
        );
        assert_eq!(
            eval("fromJSON('[{\"a\": 1}, {\"a\": 2}]').*.a"),
            Value::from(vec![1i64, 2])
        );
    }
}
