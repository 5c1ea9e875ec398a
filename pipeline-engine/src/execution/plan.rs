// Execution Plan
// Static view of a run before it starts: DAG levels and matrix instances

use crate::error::DefinitionError;
use crate::execution::graph::ExecutionGraph;
use crate::execution::matrix::{MatrixExpander, MatrixPlan};
use crate::execution::state::InstanceId;
use crate::workflow::Workflow;

/// How a job will expand
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedMatrix {
    /// No matrix: one instance named after the job
    Single(InstanceId),
    /// Statically known instances, in expansion order
    Instances(Vec<InstanceId>),
    /// The matrix depends on expressions resolved once needs finish
    Deferred,
}

impl PlannedMatrix {
    /// Number of instances, when known ahead of the run
    pub fn count(&self) -> Option<usize> {
        match self {
            PlannedMatrix::Single(_) => Some(1),
            PlannedMatrix::Instances(ids) => Some(ids.len()),
            PlannedMatrix::Deferred => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedJob {
    pub id: String,
    pub name: String,
    pub needs: Vec<String>,
    pub matrix: PlannedMatrix,
    /// Calls a reusable workflow instead of running steps
    pub calls: Option<String>,
}

/// Jobs grouped by DAG level; jobs on one level have no edges between them
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub workflow: String,
    pub levels: Vec<Vec<PlannedJob>>,
}

impl ExecutionPlan {
    pub fn build(workflow: &Workflow) -> Result<Self, DefinitionError> {
        let graph = ExecutionGraph::from_workflow(workflow)?;

        let mut levels = Vec::new();
        for level in graph.levels() {
            let mut planned = Vec::with_capacity(level.len());
            for node in level {
                let Some(job) = workflow.job(&node.id) else {
                    continue;
                };
                let matrix = match MatrixExpander::plan(job.matrix()) {
                    Ok(MatrixPlan::Single) => PlannedMatrix::Single(InstanceId::job(&node.id)),
                    Ok(MatrixPlan::Static(rows)) => PlannedMatrix::Instances(
                        rows.iter()
                            .map(|row| InstanceId::matrix(&node.id, row.key()))
                            .collect(),
                    ),
                    Ok(MatrixPlan::Deferred(_)) => PlannedMatrix::Deferred,
                    Err(e) => {
                        return Err(DefinitionError::schema(
                            format!("jobs.{}.strategy.matrix", node.id),
                            e.to_string(),
                        ))
                    }
                };
                planned.push(PlannedJob {
                    id: node.id.clone(),
                    name: job.display_name(&node.id).to_string(),
                    needs: node.needs.clone(),
                    matrix,
                    calls: job.uses.clone(),
                });
            }
            levels.push(planned);
        }

        Ok(Self {
            workflow: workflow.display_name().to_string(),
            levels,
        })
    }

    pub fn jobs(&self) -> impl Iterator<Item = &PlannedJob> {
        self.levels.iter().flatten()
    }

    pub fn job(&self, id: &str) -> Option<&PlannedJob> {
        self.jobs().find(|job| job.id == id)
    }

    /// Total instances known ahead of the run, skipping deferred matrices
    pub fn known_instances(&self) -> usize {
        self.jobs().filter_map(|job| job.matrix.count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowParser;

    #[test]
    fn test_plan_levels_and_instances() {
        let workflow = WorkflowParser::parse_str(
            r#"
name: ci
on: push
jobs:
  lint:
    steps:
      - run: echo lint
  test:
    strategy:
      matrix:
        os: [linux, mac]
        rust: [stable]
    steps:
      - run: echo test
  deploy:
    needs: [lint, test]
    strategy:
      matrix:
        target: ${{ fromJSON(needs.test.outputs.targets) }}
    steps:
      - run: echo deploy
"#,
        )
        .unwrap();

        let plan = ExecutionPlan::build(&workflow).unwrap();
        assert_eq!(plan.workflow, "ci");
        assert_eq!(plan.levels.len(), 2);

        let first: Vec<&str> = plan.levels[0].iter().map(|j| j.id.as_str()).collect();
        assert_eq!(first, vec!["lint", "test"]);

        assert_eq!(
            plan.job("test").unwrap().matrix,
            PlannedMatrix::Instances(vec![
                InstanceId::matrix("test", "linux, stable"),
                InstanceId::matrix("test", "mac, stable"),
            ])
        );
        assert_eq!(plan.job("deploy").unwrap().matrix, PlannedMatrix::Deferred);
        assert_eq!(plan.job("deploy").unwrap().needs, vec!["lint", "test"]);
        assert_eq!(plan.known_instances(), 3);
    }

    #[test]
    fn test_plan_reports_bad_matrix() {
        let workflow = WorkflowParser::parse_str(
            "on: push\njobs:\n  a:\n    strategy:\n      matrix:\n        os: linux\n    steps:\n      - run: echo\n",
        )
        .unwrap();
        let err = ExecutionPlan::build(&workflow).unwrap_err();
        assert!(err.to_string().contains("jobs.a.strategy.matrix"));
    }
}
