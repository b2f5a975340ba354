//! Command templates
//!
//! Step commands may reference `{{ref}}`, `{{run_id}}`, `{{host}}`,
//! `{{plan}}` and `{{var.<name>}}`. Placeholders are checked when a plan is
//! built and resolved when a run is triggered, before anything executes.
//! Every substituted value renders as a single shell word: values outside a
//! conservative character set are single-quoted.

use crate::errors::DeployError;
use crate::models::run::DeployContext;

const BUILTINS: [&str; 4] = ["ref", "run_id", "host", "plan"];
const VAR_PREFIX: &str = "var.";

/// Values available to a template when a run is triggered
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub run_id: &'a str,
    pub host: &'a str,
    pub plan: &'a str,
    pub context: &'a DeployContext,
}

impl RenderContext<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "ref" => Some(self.context.git_ref.as_str()),
            "run_id" => Some(self.run_id),
            "host" => Some(self.host),
            "plan" => Some(self.plan),
            _ => name
                .strip_prefix(VAR_PREFIX)
                .and_then(|var| self.context.vars.get(var))
                .map(String::as_str),
        }
    }
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, DeployError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| {
            DeployError::PlanError(format!("Unclosed placeholder in command: {}", template))
        })?;
        let name = after[..close].trim();
        validate_name(name, template)?;
        segments.push(Segment::Placeholder(name));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    Ok(segments)
}

fn validate_name(name: &str, template: &str) -> Result<(), DeployError> {
    if BUILTINS.contains(&name) {
        return Ok(());
    }
    let valid_var = name
        .strip_prefix(VAR_PREFIX)
        .map(|var| {
            !var.is_empty() && var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
        .unwrap_or(false);
    if valid_var {
        Ok(())
    } else {
        Err(DeployError::PlanError(format!(
            "Unknown placeholder '{{{{{}}}}}' in command: {}",
            name, template
        )))
    }
}

/// Check that every placeholder in `template` is well formed
pub fn validate(template: &str) -> Result<(), DeployError> {
    parse(template).map(|_| ())
}

/// Substitute every placeholder in `template`
pub fn render(template: &str, ctx: &RenderContext<'_>) -> Result<String, DeployError> {
    let mut out = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Placeholder(name) => {
                let value = ctx.lookup(name).ok_or_else(|| {
                    DeployError::PlanError(format!("No value for placeholder '{}'", name))
                })?;
                out.push_str(&shell_quote(value));
            }
        }
    }
    Ok(out)
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '@' | ':' | '+' | '-' | '=' | ',')
}

/// Quote `value` for a POSIX shell unless it is already a plain word
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_shell_safe) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
