//! Outer prompt rendering around the user's task.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

const OUTER_TEMPLATE: &str = include_str!("prompts/outer.md");

/// Values available to the outer template.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub iteration: u32,
    pub max_iterations: u32,
    pub prompt: &'a str,
    pub feedback: Option<&'a str>,
    pub completion_marker: &'a str,
}

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct PromptRenderer {
    env: Environment<'static>,
    source: String,
}

impl PromptRenderer {
    pub fn builtin() -> Self {
        Self::from_source(OUTER_TEMPLATE.to_string())
    }

    /// Use a user-supplied template instead of the built-in one.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("read outer prompt {}", path.display()))?;
        let renderer = Self::from_source(source);
        // Surface syntax errors at startup rather than in iteration one.
        renderer
            .env
            .template_from_str(&renderer.source)
            .with_context(|| format!("parse outer prompt {}", path.display()))?;
        debug!(path = %path.display(), "loaded outer prompt template");
        Ok(renderer)
    }

    fn from_source(source: String) -> Self {
        Self {
            env: Environment::new(),
            source,
        }
    }

    pub fn render(&self, inputs: &PromptInputs<'_>) -> Result<String> {
        let rendered = self
            .env
            .render_str(
                &self.source,
                context! {
                    iteration => inputs.iteration,
                    max_iterations => inputs.max_iterations,
                    prompt => inputs.prompt.trim(),
                    feedback => inputs.feedback.map(str::trim).filter(|s| !s.is_empty()),
                    completion_marker => inputs.completion_marker,
                },
            )
            .context("render outer prompt")?;
        Ok(rendered)
    }
}
