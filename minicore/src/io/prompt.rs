//! Prompt rendering for model conversations.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::parser::COMPLETION_SENTINEL;
use crate::core::types::Task;
use crate::io::config::AgentSettings;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const INSTANCE_TEMPLATE: &str = include_str!("prompts/instance.md");
const OBSERVATION_TEMPLATE: &str = include_str!("prompts/observation.md");
const FORMAT_ERROR_TEMPLATE: &str = include_str!("prompts/format_error.md");
const TIMEOUT_TEMPLATE: &str = include_str!("prompts/timeout.md");

/// Values shared by the system and instance templates.
#[derive(Debug, Clone, Serialize)]
struct TaskVars {
    task: String,
    cwd: String,
    os: &'static str,
    step_limit: u32,
    cost_limit: f64,
    sentinel: &'static str,
}

/// What a finished command produced, for the observation template.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub exit_code: Option<i32>,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub truncated: bool,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    vars: TaskVars,
    system_override: Option<String>,
    instance_override: Option<String>,
}

impl PromptEngine {
    /// Build an engine for `task`. Template overrides in `settings` replace the
    /// built-in system and instance prompts and are checked for syntax here.
    pub fn new(task: &Task, settings: &AgentSettings) -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("system.md", SYSTEM_TEMPLATE),
            ("instance.md", INSTANCE_TEMPLATE),
            ("observation.md", OBSERVATION_TEMPLATE),
            ("format_error.md", FORMAT_ERROR_TEMPLATE),
            ("timeout.md", TIMEOUT_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load built-in template {name}"))?;
        }
        if let Some(source) = &settings.system_template {
            env.template_from_str(source)
                .context("parse agent.system_template")?;
        }
        if let Some(source) = &settings.instance_template {
            env.template_from_str(source)
                .context("parse agent.instance_template")?;
        }
        Ok(Self {
            env,
            vars: TaskVars {
                task: task.problem_statement.clone(),
                cwd: task.cwd.display().to_string(),
                os: std::env::consts::OS,
                step_limit: settings.step_limit,
                cost_limit: settings.cost_limit,
                sentinel: COMPLETION_SENTINEL,
            },
            system_override: settings.system_template.clone(),
            instance_override: settings.instance_template.clone(),
        })
    }

    pub fn render_system(&self) -> Result<String> {
        self.render_task_template("system.md", self.system_override.as_deref())
    }

    pub fn render_instance(&self) -> Result<String> {
        self.render_task_template("instance.md", self.instance_override.as_deref())
    }

    pub fn render_observation(&self, observation: &Observation<'_>) -> Result<String> {
        let template = self.env.get_template("observation.md")?;
        let rendered = template
            .render(context! {
                exit_code => observation.exit_code,
                stdout => observation.stdout.trim_end(),
                stderr => observation.stderr.trim_end(),
                truncated => observation.truncated,
            })
            .context("render observation")?;
        Ok(rendered)
    }

    /// Corrective message for a response with `count` action blocks (not 1).
    pub fn render_format_error(&self, count: usize) -> Result<String> {
        let template = self.env.get_template("format_error.md")?;
        let rendered = template
            .render(context! {
                count => count,
                sentinel => COMPLETION_SENTINEL,
            })
            .context("render format error")?;
        Ok(rendered)
    }

    pub fn render_timeout(&self, command: &str, timeout_secs: u64, output: &str) -> Result<String> {
        let template = self.env.get_template("timeout.md")?;
        let rendered = template
            .render(context! {
                command => command,
                timeout_secs => timeout_secs,
                output => output.trim_end(),
            })
            .context("render timeout")?;
        Ok(rendered)
    }

    fn render_task_template(&self, name: &str, source: Option<&str>) -> Result<String> {
        let rendered = match source {
            Some(source) => self.env.render_str(source, &self.vars),
            None => self.env.get_template(name)?.render(&self.vars),
        };
        rendered.with_context(|| format!("render {name}"))
    }
}
