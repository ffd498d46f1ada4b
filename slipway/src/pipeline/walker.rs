//! Traversal of a collection in dependency order.
//!
//! The walker visits pipelines first, then delegates each pipeline's
//! step-graph to a caller-supplied visitor that receives one frontier batch
//! at a time. The synthetic root node is never delivered. The first visitor
//! error stops the walk; later frontiers are not delivered.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::errors::ExecutionError;
use crate::pipeline::{Collection, Pipeline, Step, ROOT_SERIAL};

/// Visitor over one frontier of steps.
pub type StepVisitor = Arc<
    dyn Fn(CancellationToken, Vec<Step>) -> BoxFuture<'static, Result<(), ExecutionError>>
        + Send
        + Sync,
>;

/// Visitor over one frontier of pipelines.
pub type PipelineVisitor = Arc<
    dyn Fn(CancellationToken, Vec<Pipeline>) -> BoxFuture<'static, Result<(), ExecutionError>>
        + Send
        + Sync,
>;

/// Frontier-at-a-time traversal over a collection.
#[async_trait]
pub trait Walker: Send + Sync {
    /// Visit pipelines in dependency order, one frontier per call.
    async fn walk_pipelines(
        &self,
        ctx: CancellationToken,
        visit: PipelineVisitor,
    ) -> Result<(), ExecutionError>;

    /// Visit the steps of one pipeline in dependency order, one frontier per
    /// call.
    async fn walk_steps(
        &self,
        ctx: CancellationToken,
        pipeline: i64,
        visit: StepVisitor,
    ) -> Result<(), ExecutionError>;
}

/// The standard walker over a frozen [`Collection`].
pub struct CollectionWalker {
    collection: Collection,
}

impl CollectionWalker {
    #[must_use]
    pub fn new(collection: Collection) -> Self {
        Self { collection }
    }
}

#[async_trait]
impl Walker for CollectionWalker {
    async fn walk_pipelines(
        &self,
        ctx: CancellationToken,
        visit: PipelineVisitor,
    ) -> Result<(), ExecutionError> {
        let graph = self.collection.graph();
        for layer in graph.frontiers(ROOT_SERIAL)? {
            let mut pipelines = Vec::with_capacity(layer.len());
            for id in layer {
                if id == ROOT_SERIAL {
                    continue;
                }
                pipelines.push(graph.node(id)?.value.clone());
            }
            if pipelines.is_empty() {
                continue;
            }
            visit(ctx.clone(), pipelines).await?;
        }
        Ok(())
    }

    async fn walk_steps(
        &self,
        ctx: CancellationToken,
        pipeline: i64,
        visit: StepVisitor,
    ) -> Result<(), ExecutionError> {
        let pipeline = self.collection.pipeline(pipeline)?;
        for layer in pipeline.graph.frontiers(ROOT_SERIAL)? {
            let mut steps = Vec::with_capacity(layer.len());
            for id in layer {
                if id == ROOT_SERIAL {
                    continue;
                }
                steps.push(pipeline.graph.node(id)?.value.clone());
            }
            if steps.is_empty() {
                continue;
            }
            visit(ctx.clone(), steps).await?;
        }
        Ok(())
    }
}
