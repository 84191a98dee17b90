//! Message templates with `{{name}}` placeholders.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use herald_common::error::AppError;
use herald_common::types::RenderedMessage;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("template '{template_id}' needs variable '{variable}'")]
    MissingVariable {
        template_id: String,
        variable: String,
    },

    #[error("template '{template_id}' has an unterminated placeholder")]
    Malformed { template_id: String },

    #[error("failed to load templates: {0}")]
    Load(String),
}

impl From<TemplateError> for AppError {
    fn from(err: TemplateError) -> Self {
        AppError::Template(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

pub trait TemplateStore: Send + Sync {
    fn render(
        &self,
        template_id: &str,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedMessage, TemplateError>;
}

#[derive(Default)]
pub struct InMemoryTemplates {
    templates: RwLock<HashMap<String, Template>>,
}

impl InMemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, id: impl Into<String>, subject: Option<&str>, body: &str) -> Self {
        self.insert(
            id,
            Template {
                subject: subject.map(str::to_string),
                body: body.to_string(),
            },
        );
        self
    }

    pub fn insert(&self, id: impl Into<String>, template: Template) {
        if let Ok(mut templates) = self.templates.write() {
            templates.insert(id.into(), template);
        }
    }

    /// Load a JSON object of `id -> {subject?, body}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, TemplateError> {
        let parsed: HashMap<String, Template> =
            serde_json::from_str(raw).map_err(|e| TemplateError::Load(e.to_string()))?;
        tracing::info!(count = parsed.len(), "Loaded templates");
        Ok(Self {
            templates: RwLock::new(parsed),
        })
    }
}

impl TemplateStore for InMemoryTemplates {
    fn render(
        &self,
        template_id: &str,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedMessage, TemplateError> {
        let template = self
            .templates
            .read()
            .map_err(|_| TemplateError::Load("template lock poisoned".to_string()))?
            .get(template_id)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))?;

        let subject = template
            .subject
            .as_deref()
            .map(|s| substitute(template_id, s, variables))
            .transpose()?;
        let body = substitute(template_id, &template.body, variables)?;
        Ok(RenderedMessage { subject, body })
    }
}

/// Replace each `{{name}}` (surrounding whitespace allowed) with its value.
fn substitute(
    template_id: &str,
    text: &str,
    variables: &HashMap<String, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| TemplateError::Malformed {
            template_id: template_id.to_string(),
        })?;
        let name = after[..end].trim();
        let value = variables
            .get(name)
            .ok_or_else(|| TemplateError::MissingVariable {
                template_id: template_id.to_string(),
                variable: name.to_string(),
            })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_subject_and_body() {
        let store = InMemoryTemplates::new().with_template(
            "reminder",
            Some("Reminder: {{ title }}"),
            "Hi {{name}}, {{title}} starts at {{time}}.",
        );
        let msg = store
            .render(
                "reminder",
                &vars(&[("name", "Ana"), ("title", "Standup"), ("time", "9:00")]),
            )
            .unwrap();
        assert_eq!(msg.subject.as_deref(), Some("Reminder: Standup"));
        assert_eq!(msg.body, "Hi Ana, Standup starts at 9:00.");
    }

    #[test]
    fn test_missing_variable() {
        let store = InMemoryTemplates::new().with_template("t", None, "Hello {{name}}");
        let err = store.render("t", &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingVariable {
                template_id: "t".to_string(),
                variable: "name".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_template() {
        let store = InMemoryTemplates::new();
        assert!(matches!(
            store.render("nope", &HashMap::new()),
            Err(TemplateError::NotFound(_))
        ));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let store = InMemoryTemplates::new().with_template("t", None, "Hello {{name");
        assert!(matches!(
            store.render("t", &vars(&[("name", "x")])),
            Err(TemplateError::Malformed { .. })
        ));
    }

    #[test]
    fn test_load_from_json() {
        let store = InMemoryTemplates::from_json_str(
            r#"{"welcome": {"subject": "Welcome", "body": "Hi {{name}}"}}"#,
        )
        .unwrap();
        let msg = store.render("welcome", &vars(&[("name", "Bo")])).unwrap();
        assert_eq!(msg.body, "Hi Bo");
    }
}
