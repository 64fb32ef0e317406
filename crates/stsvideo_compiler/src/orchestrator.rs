//! Top-level render orchestration (§4.10): drives one project through the
//! `Parse → Probe → ResolveExpressions → Rasterize → BuildGraph → Encode →
//! ReapCache → Done` state machine for every requested output, then runs
//! the Cache Reaper once after all outputs have succeeded.
//!
//! Parse+Probe are folded into `builder::build_project` (C4 calls C3 as it
//! walks assets); ResolveExpressions+BuildGraph are folded into
//! `timeline::compile` (C7 resolves fragment timings before walking
//! sequences). This module supplies what's left: re-parsing the project
//! fresh per output (§5: "the Project model is freshly built per output"),
//! driving the Overlay Rasterizer (C5) ahead of each output's graph build,
//! and handing the result to the Command Assembler (C8).

use crate::assembler::{self, EncodeProgress, RenderPlan};
use crate::builder;
use crate::cancel::CancellationToken;
use crate::error::{CompileError, Result};
use crate::rasterize::Rasterizer;
use crate::reaper;
use crate::timeline;
use std::collections::HashSet;
use std::path::Path;
use stsvideo_core::types::{FragmentTarget, Project};

/// Owns the resources that outlive a single output's render: one browser
/// instance reused across outputs, the cancellation flag, and the set of
/// overlay cache keys touched so far this run (§4.5 caching discipline).
pub struct RenderContext {
    rasterizer: Rasterizer,
    touched_keys: HashSet<String>,
    token: CancellationToken,
    dev_mode: bool,
}

impl RenderContext {
    pub fn new(token: CancellationToken, dev_mode: bool) -> Result<Self> {
        Ok(Self {
            rasterizer: Rasterizer::launch()?,
            touched_keys: HashSet::new(),
            token,
            dev_mode,
        })
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Renders every output named in `output_names` (or every output in the
    /// project document when empty), sequentially, then reaps the overlay
    /// cache once all of them have succeeded. A progress sender is invoked
    /// per output with that output's name and its `watch::Receiver`.
    pub async fn run(
        &mut self,
        project_dir: &Path,
        output_names: &[String],
        mut on_output_started: impl FnMut(&str, tokio::sync::watch::Receiver<EncodeProgress>),
    ) -> Result<()> {
        tracing::info!(project_dir = %project_dir.display(), "state=Parse");
        let probe_project = builder::build_project(project_dir)?;

        let targets: Vec<String> = if output_names.is_empty() {
            probe_project.outputs.keys().cloned().collect()
        } else {
            output_names.to_vec()
        };

        for name in &targets {
            if self.token.is_cancelled() {
                return Err(CompileError::Cancelled);
            }
            self.render_one(project_dir, name, &mut on_output_started).await?;
        }

        tracing::info!("state=ReapCache");
        reaper::reap(project_dir, &self.touched_keys);
        tracing::info!("state=Done");
        Ok(())
    }

    async fn render_one(
        &mut self,
        project_dir: &Path,
        output_name: &str,
        on_output_started: &mut impl FnMut(&str, tokio::sync::watch::Receiver<EncodeProgress>),
    ) -> Result<()> {
        tracing::debug!(output = output_name, "state=Parse");
        let mut project = builder::build_project(project_dir)?;
        let output = project
            .outputs
            .get(output_name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownReference {
                fragment_id: output_name.to_string(),
                target_name: output_name.to_string(),
            })?;

        tracing::debug!(output = output_name, "state=Rasterize");
        self.rasterize_referenced(project_dir, &mut project, &output, output_name)?;

        if self.token.is_cancelled() {
            return Err(CompileError::Cancelled);
        }

        tracing::debug!(output = output_name, "state=BuildGraph");
        let plan = timeline::compile(&project, &output)?;
        let total_duration_ms = plan
            .inputs
            .iter()
            .filter_map(|slot| match slot {
                timeline::InputSlotKind::Looped { duration_ms, .. } => Some(*duration_ms),
                timeline::InputSlotKind::Direct { .. } => None,
            })
            .max()
            .unwrap_or(0);

        let preset = output
            .ffmpeg_preset
            .as_ref()
            .and_then(|name| project.ffmpeg_presets.get(name))
            .map(String::as_str);
        let render_plan: RenderPlan = assembler::build_plan(&plan, output.path.clone(), preset, self.dev_mode);

        tracing::debug!(output = output_name, "state=Encode");
        let (tx, rx) = tokio::sync::watch::channel(EncodeProgress::default());
        on_output_started(output_name, rx);
        assembler::execute(&render_plan, total_duration_ms, tx, &self.token).await?;

        self.touched_keys.extend(self.rasterizer.touched_keys().iter().cloned());
        Ok(())
    }

    fn rasterize_referenced(
        &mut self,
        project_dir: &Path,
        project: &mut Project,
        output: &stsvideo_core::types::Output,
        output_name: &str,
    ) -> Result<()> {
        let (container_ids, app_ids) = referenced_targets(project);

        for id in container_ids {
            let container = project.containers.get(&id).cloned();
            let Some(container) = container else { continue };
            let png = self
                .rasterizer
                .rasterize_container(project_dir, &container, output.width, output.height)?;
            if let Some(entry) = project.containers.get_mut(&id) {
                entry.png_path = Some(png);
            }
        }

        for id in app_ids {
            let app = project.apps.get(&id).cloned();
            let Some(app) = app else { continue };
            let png = self
                .rasterizer
                .rasterize_app(project_dir, &app, output_name, output.width, output.height)?;
            if let Some(entry) = project.apps.get_mut(&id) {
                entry.png_path = Some(png);
            }
        }

        Ok(())
    }
}

/// Which container/app ids are actually referenced by an enabled fragment
/// in some sequence — rasterizing unreferenced ones would just churn the
/// overlay cache.
fn referenced_targets(project: &Project) -> (HashSet<String>, HashSet<String>) {
    let mut containers = HashSet::new();
    let mut apps = HashSet::new();
    for seq in &project.sequences {
        for frag in &seq.fragments {
            if !frag.enabled {
                continue;
            }
            match &frag.target {
                FragmentTarget::Container(id) => {
                    containers.insert(id.clone());
                }
                FragmentTarget::App(id) => {
                    apps.insert(id.clone());
                }
                FragmentTarget::Asset(_) => {}
            }
        }
    }
    (containers, apps)
}

/// Resolves a requested output name, or all outputs when none were named,
/// validating that every explicitly-named output actually exists (§7:
/// unknown references are a user error, not silently skipped).
pub fn resolve_output_names(project: &Project, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(project.outputs.keys().cloned().collect());
    }
    for name in requested {
        if !project.outputs.contains_key(name) {
            return Err(CompileError::UnknownReference {
                fragment_id: name.clone(),
                target_name: name.clone(),
            });
        }
    }
    Ok(requested.to_vec())
}
