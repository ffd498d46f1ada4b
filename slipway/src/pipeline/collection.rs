//! The collection: a graph of pipelines, each owning a graph of steps.
//!
//! Both levels share the [`Graph`](crate::dag::Graph) structure and a
//! synthetic root node with serial 0. Appends translate authoring calls into
//! edges: a multi-step batch fans out in parallel from the current attachment
//! set, single steps chain sequentially, and background steps become detached
//! branches off the root. Entities are looked up by serial everywhere, so the
//! two graph levels never hold back-pointers into each other.

use miette::Diagnostic;
use thiserror::Error;

use crate::dag::{Graph, GraphError};
use crate::pipeline::{Event, Pipeline, Step, ROOT_SERIAL};

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum CollectionError {
    #[error(transparent)]
    #[diagnostic(code(slipway::collection::graph))]
    Graph(#[from] GraphError),

    #[error("pipeline {serial} not found in the collection")]
    #[diagnostic(code(slipway::collection::pipeline_not_found))]
    PipelineNotFound { serial: i64 },

    #[error("step {serial} not found in the collection")]
    #[diagnostic(code(slipway::collection::step_not_found))]
    StepNotFound { serial: i64 },
}

/// The root container for one run: every pipeline and step of the build.
#[derive(Debug, Clone)]
pub struct Collection {
    graph: Graph<Pipeline>,
    default_pipeline: i64,
}

impl Collection {
    /// An empty collection holding only the synthetic root pipeline node.
    #[must_use]
    pub fn new() -> Self {
        let mut graph = Graph::new();
        graph
            .add_node(ROOT_SERIAL, Pipeline::root())
            .expect("fresh pipeline-graph cannot already hold the root");
        Self {
            graph,
            default_pipeline: ROOT_SERIAL,
        }
    }

    /// A collection with a default pipeline appended under the root. Steps
    /// appended through the client land in this pipeline.
    pub fn with_default_pipeline(pipeline: Pipeline) -> Result<Self, CollectionError> {
        let serial = pipeline.serial;
        let mut collection = Self::new();
        collection.append_pipeline(pipeline)?;
        collection.default_pipeline = serial;
        Ok(collection)
    }

    /// Serial of the pipeline that receives client appends.
    #[must_use]
    pub fn default_pipeline(&self) -> i64 {
        self.default_pipeline
    }

    /// Append a pipeline node with edges from the current pipeline-graph
    /// leaves.
    pub fn append_pipeline(&mut self, pipeline: Pipeline) -> Result<(), CollectionError> {
        let leaf_ids: Vec<i64> = self.graph.leaves().iter().map(|n| n.id).collect();
        let serial = pipeline.serial;
        self.graph.add_node(serial, pipeline)?;
        for from in leaf_ids {
            self.graph.add_edge(from, serial)?;
        }
        Ok(())
    }

    /// Append a batch of steps into the given pipeline's step-graph.
    pub fn append(&mut self, pipeline: i64, steps: Vec<Step>) -> Result<(), CollectionError> {
        let node = self
            .graph
            .node_mut(pipeline)
            .map_err(|_| CollectionError::PipelineNotFound { serial: pipeline })?;
        node.value.append(steps)
    }

    /// Record triggering events on a pipeline.
    pub fn add_events(&mut self, pipeline: i64, events: Vec<Event>) -> Result<(), CollectionError> {
        let node = self
            .graph
            .node_mut(pipeline)
            .map_err(|_| CollectionError::PipelineNotFound { serial: pipeline })?;
        node.value.events.extend(events);
        Ok(())
    }

    /// Linearly locate a step by serial across all pipelines.
    pub fn by_serial(&self, serial: i64) -> Result<Step, CollectionError> {
        for pipeline in self.pipelines() {
            for step in pipeline.steps() {
                if step.serial == serial {
                    return Ok(step.clone());
                }
            }
        }
        Err(CollectionError::StepNotFound { serial })
    }

    /// A trimmed copy containing only the given step, in a pipeline with the
    /// same identity as the one the step came from. Used when `--step`
    /// restricts execution to a single serial.
    pub fn sub(&self, step: &Step) -> Result<Self, CollectionError> {
        let owner = self
            .pipelines()
            .find(|p| p.steps().any(|s| s.serial == step.serial))
            .ok_or(CollectionError::StepNotFound {
                serial: step.serial,
            })?;
        let mut pipeline = Pipeline::new(owner.serial, owner.name.clone());
        pipeline.events = owner.events.clone();
        pipeline.append(vec![step.clone()])?;
        let mut collection = Self::with_default_pipeline(pipeline)?;
        collection.default_pipeline = owner.serial;
        Ok(collection)
    }

    pub fn pipeline(&self, serial: i64) -> Result<&Pipeline, CollectionError> {
        self.graph
            .node(serial)
            .map(|n| &n.value)
            .map_err(|_| CollectionError::PipelineNotFound { serial })
    }

    /// Pipelines in insertion order, excluding the synthetic root.
    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.graph
            .nodes()
            .iter()
            .filter(|n| n.id != ROOT_SERIAL)
            .map(|n| &n.value)
    }

    /// Every step of every pipeline, in insertion order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.pipelines().flat_map(Pipeline::steps)
    }

    /// The pipeline-level graph.
    #[must_use]
    pub fn graph(&self) -> &Graph<Pipeline> {
        &self.graph
    }
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}
