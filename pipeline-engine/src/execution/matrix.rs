// Matrix Strategy Expansion
// Expands matrix strategies into ordered, concrete job instance assignments

use crate::error::EvaluationError;
use crate::expression::{has_expressions, single_expression, ExpressionEngine, Value};

use std::collections::BTreeMap;

/// One concrete assignment of matrix values, in row key order
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixInstance {
    pub values: Vec<(String, Value)>,
}

impl MatrixInstance {
    fn get(&self, key: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn set(&mut self, key: &str, value: Value) {
        match self.values.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.values.push((key.to_string(), value)),
        }
    }

    /// Identity suffix: the row's values joined in key order
    pub fn key(&self) -> String {
        self.values
            .iter()
            .map(|(_, v)| v.as_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The `matrix` context for this instance
    pub fn to_context(&self) -> Value {
        Value::Object(self.values.iter().cloned().collect::<BTreeMap<_, _>>())
    }
}

/// A matrix with its dimensions, include and exclude lists resolved to values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixSpec {
    pub dimensions: Vec<(String, Vec<Value>)>,
    pub include: Vec<Vec<(String, Value)>>,
    pub exclude: Vec<Vec<(String, Value)>>,
}

/// How a job's matrix will be expanded
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixPlan {
    /// No matrix: a single instance
    Single,
    /// Expanded at graph-build time
    Static(Vec<MatrixInstance>),
    /// Holds expressions; expanded once the job's needs are terminal
    Deferred(serde_json::Value),
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Decide how to expand a job's raw matrix tree
    pub fn plan(matrix: Option<&serde_json::Value>) -> Result<MatrixPlan, EvaluationError> {
        let Some(tree) = matrix else {
            return Ok(MatrixPlan::Single);
        };

        if contains_expression(tree) {
            return Ok(MatrixPlan::Deferred(tree.clone()));
        }

        let spec = MatrixSpec::from_tree(tree, |v| Ok(Value::from(v)))?;
        Ok(MatrixPlan::Static(Self::expand(&spec)))
    }

    /// Expand a deferred matrix tree against the job's snapshot
    pub fn expand_deferred(
        tree: &serde_json::Value,
        engine: &ExpressionEngine<'_>,
    ) -> Result<Vec<MatrixInstance>, EvaluationError> {
        let spec = match tree {
            serde_json::Value::String(s) if single_expression(s).is_some() => {
                MatrixSpec::from_value(&engine.expand(s)?)?
            }
            _ => MatrixSpec::from_tree(tree, |v| engine.expand_tree(v))?,
        };
        Ok(Self::expand(&spec))
    }

    /// Expand a resolved spec.
    ///
    /// The cross product varies the first dimension fastest. Include entries
    /// merge into every row whose original dimension values they agree with,
    /// or are appended when none agree. Exclude entries then drop every row
    /// matching all of their fields.
    pub fn expand(spec: &MatrixSpec) -> Vec<MatrixInstance> {
        let mut rows: Vec<MatrixInstance> = Vec::new();

        if !spec.dimensions.is_empty() {
            rows.push(MatrixInstance { values: Vec::new() });
            for (name, values) in &spec.dimensions {
                let mut next = Vec::with_capacity(rows.len() * values.len());
                for value in values {
                    for row in &rows {
                        let mut row = row.clone();
                        row.values.push((name.clone(), value.clone()));
                        next.push(row);
                    }
                }
                rows = next;
            }
        }

        let original = rows.len();
        for entry in &spec.include {
            let mut merged = false;
            for row in rows.iter_mut().take(original) {
                let agrees = entry.iter().all(|(key, value)| {
                    !spec.is_dimension(key) || row.get(key) == Some(value)
                });
                if agrees {
                    for (key, value) in entry {
                        if !spec.is_dimension(key) {
                            row.set(key, value.clone());
                        }
                    }
                    merged = true;
                }
            }
            if !merged {
                rows.push(MatrixInstance {
                    values: entry.clone(),
                });
            }
        }

        rows.retain(|row| {
            !spec.exclude.iter().any(|entry| {
                !entry.is_empty()
                    && entry
                        .iter()
                        .all(|(key, value)| row.get(key) == Some(value))
            })
        });

        rows
    }
}

impl MatrixSpec {
    fn is_dimension(&self, key: &str) -> bool {
        self.dimensions.iter().any(|(name, _)| name == key)
    }

    /// Build from an ordered tree, resolving each entry with `resolve`
    fn from_tree(
        tree: &serde_json::Value,
        resolve: impl Fn(&serde_json::Value) -> Result<Value, EvaluationError>,
    ) -> Result<Self, EvaluationError> {
        let serde_json::Value::Object(map) = tree else {
            return Err(EvaluationError::type_mismatch("matrix must be a mapping"));
        };

        let mut spec = MatrixSpec::default();
        for (key, raw) in map {
            match key.as_str() {
                "include" => spec.include = assignments(raw, "include", &resolve)?,
                "exclude" => spec.exclude = assignments(raw, "exclude", &resolve)?,
                _ => match resolve(raw)? {
                    Value::Array(values) => spec.dimensions.push((key.clone(), values)),
                    other => {
                        return Err(EvaluationError::type_mismatch(format!(
                            "matrix dimension '{}' must be an array, got {}",
                            key,
                            other.type_name()
                        )))
                    }
                },
            }
        }
        Ok(spec)
    }

    /// Build from an evaluated value such as a `fromJSON` result
    fn from_value(value: &Value) -> Result<Self, EvaluationError> {
        let tree = value.to_json();
        Self::from_tree(&tree, |v| Ok(Value::from(v)))
    }
}

/// Resolve an include or exclude list, keeping each entry's field order
fn assignments(
    raw: &serde_json::Value,
    field: &str,
    resolve: &impl Fn(&serde_json::Value) -> Result<Value, EvaluationError>,
) -> Result<Vec<Vec<(String, Value)>>, EvaluationError> {
    let not_mapping = |kind: &str| {
        EvaluationError::type_mismatch(format!(
            "matrix {} entries must be mappings, got {}",
            field, kind
        ))
    };

    match raw {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::Object(fields) => fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), resolve(v)?)))
                    .collect(),
                other => match resolve(other)? {
                    Value::Object(map) => Ok(map.into_iter().collect()),
                    value => Err(not_mapping(value.type_name())),
                },
            })
            .collect(),
        other => match resolve(other)? {
            Value::Array(entries) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::Object(map) => Ok(map.into_iter().collect()),
                    value => Err(not_mapping(value.type_name())),
                })
                .collect(),
            value => Err(EvaluationError::type_mismatch(format!(
                "matrix {} must be an array, got {}",
                field,
                value.type_name()
            ))),
        },
    }
}

fn contains_expression(tree: &serde_json::Value) -> bool {
    match tree {
        serde_json::Value::String(s) => has_expressions(s),
        serde_json::Value::Array(items) => items.iter().any(contains_expression),
        serde_json::Value::Object(map) => map.values().any(contains_expression),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ContextSnapshot;

    fn tree(yaml: &str) -> serde_json::Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn keys(instances: &[MatrixInstance]) -> Vec<String> {
        instances.iter().map(MatrixInstance::key).collect()
    }

    fn static_instances(yaml: &str) -> Vec<MatrixInstance> {
        match MatrixExpander::plan(Some(&tree(yaml))).unwrap() {
            MatrixPlan::Static(instances) => instances,
            other => panic!("expected static plan, got {:?}", other),
        }
    }

    #[test]
    fn test_cross_product_with_exclude() {
        let instances = static_instances(
            r#"
os: [a, b]
v: [1, 2]
exclude:
  - os: a
    v: 1
"#,
        );
        assert_eq!(keys(&instances), vec!["b, 1", "a, 2", "b, 2"]);
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let yaml = "os: [linux, mac, windows]\nnode: [16, 18]\nfeature: [x, y]";
        let first = static_instances(yaml);
        let second = static_instances(yaml);
        assert_eq!(first, second);
        assert_eq!(first.len(), 12);
        assert_eq!(first[0].values[0].0, "os");
        assert_eq!(first[0].values[2].0, "feature");
    }

    #[test]
    fn test_include_merges_or_appends() {
        let instances = static_instances(
            r#"
os: [linux, mac]
node: [18]
include:
  - os: linux
    experimental: true
  - os: windows
    node: 20
"#,
        );
        assert_eq!(instances.len(), 3);
        assert_eq!(
            instances[0].get("experimental"),
            Some(&Value::Bool(true))
        );
        assert_eq!(instances[1].get("experimental"), None);
        assert_eq!(keys(&instances)[2], "windows, 20");
    }

    #[test]
    fn test_include_without_dimension_keys_annotates_every_row() {
        let instances = static_instances("os: [a, b]\ninclude:\n  - color: green");
        assert!(instances
            .iter()
            .all(|i| i.get("color") == Some(&Value::from("green"))));
    }

    #[test]
    fn test_include_only_matrix() {
        let instances = static_instances("include:\n  - os: a\n  - os: b");
        assert_eq!(keys(&instances), vec!["a", "b"]);
    }

    #[test]
    fn test_exclude_can_drop_many() {
        let instances = static_instances("os: [a, b]\nv: [1, 2, 3]\nexclude:\n  - os: a");
        assert_eq!(keys(&instances), vec!["b, 1", "b, 2", "b, 3"]);
    }

    #[test]
    fn test_empty_dimension_yields_no_instances() {
        assert!(static_instances("os: []").is_empty());
    }

    #[test]
    fn test_deferred_matrix_from_json() {
        let json = serde_json::json!({
            "setup": {"outputs": {"targets": "[\"x86\", \"arm\"]"}}
        });
        let mut contexts = BTreeMap::new();
        contexts.insert("needs".to_string(), Value::from(json));
        let snap = ContextSnapshot::new(contexts);
        let engine = ExpressionEngine::new(&snap);

        let raw = tree("target: ${{ fromJSON(needs.setup.outputs.targets) }}\nmode: [fast]");
        let plan = MatrixExpander::plan(Some(&raw)).unwrap();
        let MatrixPlan::Deferred(deferred) = plan else {
            panic!("expected deferred plan");
        };
        let instances = MatrixExpander::expand_deferred(&deferred, &engine).unwrap();
        assert_eq!(keys(&instances), vec!["x86, fast", "arm, fast"]);
    }

    #[test]
    fn test_deferred_dimension_must_be_array() {
        let snap = ContextSnapshot::default();
        let engine = ExpressionEngine::new(&snap);
        let raw = tree("target: ${{ 'single' }}");
        assert!(matches!(
            MatrixExpander::expand_deferred(&raw, &engine),
            Err(EvaluationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_instance_context() {
        let instances = static_instances("os: [linux]\nnode: [18]");
        let ctx = instances[0].to_context();
        assert_eq!(ctx.property("os"), Some(&Value::from("linux")));
        assert_eq!(ctx.property("node"), Some(&Value::Number(18.0)));
    }
}
