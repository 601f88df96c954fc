//! Prompt rendering for external correction reasoners.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::ErrorAnalysis;
use crate::graph::Task;

const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");

#[derive(Debug, Clone, Serialize)]
struct AnalysisContext<'a> {
    kind: &'static str,
    confidence: String,
    root_cause: &'a str,
    implicated: Option<&'a str>,
}

impl<'a> AnalysisContext<'a> {
    fn from_analysis(analysis: &'a ErrorAnalysis) -> Self {
        Self {
            kind: analysis.kind.as_str(),
            confidence: format!("{:.2}", analysis.confidence),
            root_cause: analysis.root_cause.trim(),
            implicated: analysis.implicated.as_deref(),
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("correction", CORRECTION_TEMPLATE)
            .context("load correction template")?;
        Ok(Self { env })
    }

    pub fn render_correction(
        &self,
        task: &Task,
        anchor: &str,
        current_body: &str,
        analysis: &ErrorAnalysis,
        attempt: u32,
    ) -> Result<String> {
        let template = self.env.get_template("correction")?;
        let rendered = template
            .render(context! {
                task => task,
                anchor => anchor,
                current_body => current_body.trim_end(),
                analysis => AnalysisContext::from_analysis(analysis),
                attempt => attempt,
            })
            .context("render correction prompt")?;
        Ok(rendered)
    }
}
