// Built-in Functions for workflow expressions
// String predicates, structural conversions, hashFiles and status checks

use crate::error::EvaluationError;
use crate::execution::context::ContextSnapshot;
use crate::expression::hashing::{aggregate_digests, FileHasher};
use crate::expression::value::Value;

/// Registry of built-in functions
pub struct BuiltinFunctions<'a> {
    snapshot: &'a ContextSnapshot,
    hasher: Option<&'a dyn FileHasher>,
}

impl<'a> BuiltinFunctions<'a> {
    pub fn new(snapshot: &'a ContextSnapshot, hasher: Option<&'a dyn FileHasher>) -> Self {
        Self { snapshot, hasher }
    }

    /// Call a built-in function. Names are case-insensitive.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, EvaluationError> {
        match name.to_ascii_lowercase().as_str() {
            // String functions
            "contains" => self.fn_contains(args),
            "startswith" => self.fn_startswith(args),
            "endswith" => self.fn_endswith(args),
            "format" => self.fn_format(args),
            "join" => self.fn_join(args),

            // Conversion functions
            "tojson" => self.fn_to_json(args),
            "fromjson" => self.fn_from_json(args),

            "hashfiles" => self.fn_hash_files(args),

            // Status functions
            "success" => {
                self.require_args(&args, 0, "success")?;
                Ok(Value::Bool(
                    self.snapshot.status().succeeded && !self.snapshot.is_cancelled(),
                ))
            }
            "failure" => {
                self.require_args(&args, 0, "failure")?;
                Ok(Value::Bool(self.snapshot.status().failed))
            }
            "cancelled" => {
                self.require_args(&args, 0, "cancelled")?;
                Ok(Value::Bool(self.snapshot.is_cancelled()))
            }
            "always" => {
                self.require_args(&args, 0, "always")?;
                Ok(Value::Bool(true))
            }

            _ => Err(EvaluationError::UnknownFunction {
                name: name.to_string(),
            }),
        }
    }

    // =========================================================================
    // String Functions
    // =========================================================================

    fn fn_contains(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        self.require_args(&args, 2, "contains")?;

        match (&args[0], &args[1]) {
            (Value::Array(items), needle) => {
                Ok(Value::Bool(items.iter().any(|item| item.loose_eq(needle))))
            }
            (Value::Object(_), _) => Err(EvaluationError::type_mismatch(
                "contains() cannot search an object",
            )),
            (haystack, needle) => Ok(Value::Bool(
                haystack
                    .as_string()
                    .to_lowercase()
                    .contains(&needle.as_string().to_lowercase()),
            )),
        }
    }

    fn fn_startswith(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        self.require_args(&args, 2, "startsWith")?;
        let s = args[0].as_string().to_lowercase();
        let prefix = args[1].as_string().to_lowercase();
        Ok(Value::Bool(s.starts_with(&prefix)))
    }

    fn fn_endswith(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        self.require_args(&args, 2, "endsWith")?;
        let s = args[0].as_string().to_lowercase();
        let suffix = args[1].as_string().to_lowercase();
        Ok(Value::Bool(s.ends_with(&suffix)))
    }

    fn fn_format(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        if args.is_empty() {
            return Err(EvaluationError::arity("format", "at least 1", 0));
        }

        let template = args[0].as_string();
        let replacements = &args[1..];
        let mut result = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    result.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    result.push('}');
                }
                '{' => {
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) if c.is_ascii_digit() => digits.push(c),
                            _ => {
                                return Err(EvaluationError::type_mismatch(format!(
                                    "format() has an invalid placeholder in '{}'",
                                    template
                                )))
                            }
                        }
                    }
                    let index: usize = digits.parse().map_err(|_| {
                        EvaluationError::type_mismatch(format!(
                            "format() has an empty placeholder in '{}'",
                            template
                        ))
                    })?;
                    let arg = replacements.get(index).ok_or_else(|| {
                        EvaluationError::arity(
                            "format",
                            format!("at least {}", index + 2),
                            args.len(),
                        )
                    })?;
                    result.push_str(&arg.as_string());
                }
                '}' => {
                    return Err(EvaluationError::type_mismatch(format!(
                        "format() has an unbalanced '}}' in '{}'",
                        template
                    )))
                }
                c => result.push(c),
            }
        }

        Ok(Value::String(result))
    }

    fn fn_join(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        if args.is_empty() || args.len() > 2 {
            return Err(EvaluationError::arity("join", "1 or 2", args.len()));
        }

        let separator = args.get(1).map(Value::as_string).unwrap_or_else(|| ",".into());

        match &args[0] {
            Value::Array(items) => {
                let strings: Vec<String> = items.iter().map(Value::as_string).collect();
                Ok(Value::String(strings.join(&separator)))
            }
            other => Ok(Value::String(other.as_string())),
        }
    }

    // =========================================================================
    // Conversion Functions
    // =========================================================================

    fn fn_to_json(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        self.require_args(&args, 1, "toJSON")?;
        Ok(Value::String(args[0].to_json_pretty()))
    }

    fn fn_from_json(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        self.require_args(&args, 1, "fromJSON")?;
        let text = args[0].as_string();
        serde_json::from_str::<serde_json::Value>(&text)
            .map(Value::from)
            .map_err(|e| EvaluationError::MalformedJson {
                message: e.to_string(),
            })
    }

    fn fn_hash_files(&self, args: Vec<Value>) -> Result<Value, EvaluationError> {
        if args.is_empty() {
            return Err(EvaluationError::arity("hashFiles", "at least 1", 0));
        }

        let Some(hasher) = self.hasher else {
            return Ok(Value::String(String::new()));
        };

        let patterns: Vec<String> = args.iter().map(Value::as_string).collect();
        let digests = hasher.hash_files(&patterns)?;
        Ok(Value::String(aggregate_digests(&digests)))
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    fn require_args(&self, args: &[Value], count: usize, name: &str) -> Result<(), EvaluationError> {
        if args.len() != count {
            return Err(EvaluationError::arity(name, count.to_string(), args.len()));
        }
        Ok(())
    }
}
