//! The drone backend: renders the collection as a drone configuration
//! document instead of executing it.
//!
//! One YAML document is emitted per pipeline, each opening with a step that
//! compiles the pipeline binary; every graph step depends on the names of
//! the previous frontier, which reproduces the DAG's barrier semantics in
//! drone's `depends_on` form.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::cli::compile::cargo_build_command;
use crate::backend::cli::PIPELINE_BINARY;
use crate::backend::{Backend, CommonOpts, ValidationError};
use crate::errors::ExecutionError;
use crate::pipeline::{
    Event, Pipeline, PipelineVisitor, Step, StepVisitor, Walker,
};

const COMPILE_STEP_NAME: &str = "compile-pipeline";

#[derive(Debug, Serialize)]
pub struct DroneDocument {
    pub kind: &'static str,
    #[serde(rename = "type")]
    pub pipeline_type: &'static str,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    pub steps: Vec<DroneStep>,
}

#[derive(Debug, Serialize)]
pub struct Trigger {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub event: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub branch: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DroneStep {
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

pub struct DroneBackend {
    opts: CommonOpts,
}

impl DroneBackend {
    #[must_use]
    pub fn new(opts: CommonOpts) -> Self {
        Self { opts }
    }

    /// Build the document for one pipeline from its frontier batches.
    fn build_document(
        &self,
        pipeline: &Pipeline,
        frontiers: &[Vec<Step>],
        events: &[Event],
    ) -> DroneDocument {
        let compile_script = cargo_build_command(&self.opts.args.path)
            .last()
            .cloned()
            .unwrap_or_default();
        let mut steps = vec![DroneStep {
            name: COMPILE_STEP_NAME.to_string(),
            image: super::cli::compile::BUILD_IMAGE.to_string(),
            commands: vec![compile_script],
            depends_on: Vec::new(),
        }];

        let mut previous: Vec<String> = vec![COMPILE_STEP_NAME.to_string()];
        for frontier in frontiers {
            let mut current = Vec::with_capacity(frontier.len());
            for step in frontier {
                let name = step.display_name();
                steps.push(DroneStep {
                    name: name.clone(),
                    image: step.image.clone(),
                    commands: vec![format!(
                        "{PIPELINE_BINARY} --step={} --build-id={} {}",
                        step.serial, self.opts.build_id, self.opts.args.path
                    )],
                    depends_on: previous.clone(),
                });
                current.push(name);
            }
            if !current.is_empty() {
                previous = current;
            }
        }

        let trigger = if events.is_empty() && pipeline.events.is_empty() {
            None
        } else {
            let all = pipeline.events.iter().chain(events.iter());
            Some(Trigger {
                event: all.clone().map(|e| e.name.clone()).collect(),
                branch: all.filter_map(|e| e.branch.clone()).collect(),
            })
        };

        DroneDocument {
            kind: "pipeline",
            pipeline_type: "docker",
            name: pipeline.name.clone(),
            trigger,
            steps,
        }
    }

    /// Render every pipeline of the walked collection to a multi-document
    /// YAML string.
    pub async fn render(
        &self,
        ctx: CancellationToken,
        walker: Arc<dyn Walker>,
        events: &[Event],
    ) -> Result<String, ExecutionError> {
        let pipelines: Arc<Mutex<Vec<Pipeline>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = pipelines.clone();
        let collect: PipelineVisitor = Arc::new(move |_ctx, batch| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().expect("pipeline list poisoned").extend(batch);
                Ok(())
            })
        });
        walker.walk_pipelines(ctx.clone(), collect).await?;
        let pipelines = std::mem::take(&mut *pipelines.lock().expect("pipeline list poisoned"));

        let mut rendered = String::new();
        for pipeline in pipelines {
            let frontiers: Arc<Mutex<Vec<Vec<Step>>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = frontiers.clone();
            let collect: StepVisitor = Arc::new(move |_ctx, steps| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.lock().expect("frontier list poisoned").push(steps);
                    Ok(())
                })
            });
            walker
                .walk_steps(ctx.clone(), pipeline.serial, collect)
                .await?;
            let frontiers = std::mem::take(&mut *frontiers.lock().expect("frontier list poisoned"));

            let document = self.build_document(&pipeline, &frontiers, events);
            let yaml = serde_yaml::to_string(&document).map_err(|err| {
                ExecutionError::Compile {
                    message: format!("failed to render drone document: {err}"),
                }
            })?;
            rendered.push_str("---\n");
            rendered.push_str(&yaml);
        }
        Ok(rendered)
    }
}

#[async_trait]
impl Backend for DroneBackend {
    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        if step.image.is_empty() {
            return Err(ValidationError::NoImage);
        }
        if step.action.is_none() {
            // Legal, but drone renders it as a plain service image; tell the
            // author in case that was not the intent.
            return Err(ValidationError::Skip(
                "step has no action; it will run the image's default entrypoint".to_string(),
            ));
        }
        Ok(())
    }

    async fn done(
        &self,
        ctx: CancellationToken,
        walker: Arc<dyn Walker>,
        events: &[Event],
    ) -> Result<(), ExecutionError> {
        let rendered = self.render(ctx, walker, events).await?;
        print!("{rendered}");
        Ok(())
    }
}
