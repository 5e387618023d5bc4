//! Prompt templates for the direct chat backend.

use minijinja::{Environment, context};

use crate::core::types::{LABEL_A_BETTER, LABEL_B_BETTER, LABEL_SIMILAR};
use crate::io::capability::{AnalyzeRequest, EvaluateRequest, OptimizeRequest};

const OPTIMIZE_TEMPLATE: &str = include_str!("prompts/optimize.md");
const EVALUATE_TEMPLATE: &str = include_str!("prompts/evaluate.md");
const ANALYZE_TEMPLATE: &str = include_str!("prompts/analyze.md");
const SAMPLES_TEMPLATE: &str = include_str!("prompts/samples.md");

/// Number of questions requested from the sample generator.
pub const SAMPLE_COUNT: usize = 3;

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("optimize", OPTIMIZE_TEMPLATE)
            .expect("optimize template should be valid");
        env.add_template("evaluate", EVALUATE_TEMPLATE)
            .expect("evaluate template should be valid");
        env.add_template("analyze", ANALYZE_TEMPLATE)
            .expect("analyze template should be valid");
        env.add_template("samples", SAMPLES_TEMPLATE)
            .expect("samples template should be valid");
        Self { env }
    }

    pub fn render_optimize(&self, request: &OptimizeRequest<'_>) -> Result<String, minijinja::Error> {
        self.env.get_template("optimize")?.render(context! {
            task => request.task_description.trim(),
            current_prompt => request.current_prompt.trim(),
            current_output => request.current_output.trim(),
            history => Some(request.history.trim()).filter(|s| !s.is_empty()),
        })
    }

    pub fn render_evaluate(&self, request: &EvaluateRequest<'_>) -> Result<String, minijinja::Error> {
        self.env.get_template("evaluate")?.render(context! {
            task => request.task_description.trim(),
            question => request.question.trim(),
            output_a => request.output_a.trim(),
            output_b => request.output_b.trim(),
            label_a => LABEL_A_BETTER,
            label_b => LABEL_B_BETTER,
            label_similar => LABEL_SIMILAR,
        })
    }

    pub fn render_analyze(&self, request: &AnalyzeRequest<'_>) -> Result<String, minijinja::Error> {
        self.env.get_template("analyze")?.render(context! {
            task => request.task_description.trim(),
            old_prompt => request.old_prompt.trim(),
            new_prompt => request.new_prompt.trim(),
        })
    }

    pub fn render_samples(&self, task_description: &str) -> Result<String, minijinja::Error> {
        self.env.get_template("samples")?.render(context! {
            task => task_description.trim(),
            count => SAMPLE_COUNT,
        })
    }
}
