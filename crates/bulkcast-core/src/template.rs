//! Template Renderer - Handles personalization of message content

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("static placeholder pattern")
    })
}

/// Template renderer for personalizing message content
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    template: String,
}

impl TemplateRenderer {
    /// Create a renderer for a message template
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Variable names referenced by the template, in order of first use
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for caps in placeholder_pattern().captures_iter(&self.template) {
            if let Some(name) = caps.get(1).map(|m| m.as_str()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// First placeholder that `variables` cannot resolve
    pub fn first_missing(&self, variables: &BTreeMap<String, String>) -> Option<String> {
        self.placeholders()
            .into_iter()
            .find(|name| !variables.contains_key(*name))
            .map(str::to_string)
    }

    /// Render with recipient variables; fails with the name of the first
    /// unresolved placeholder
    pub fn render(&self, variables: &BTreeMap<String, String>) -> Result<String, String> {
        if let Some(missing) = self.first_missing(variables) {
            return Err(missing);
        }

        let rendered = placeholder_pattern().replace_all(&self.template, |caps: &Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        });
        Ok(rendered.into_owned())
    }

    /// Literal message, placeholders left verbatim
    pub fn render_literal(&self) -> String {
        self.template.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_basic_template() {
        let renderer = TemplateRenderer::new("Hello {{name}}, your code is {{ code }}");
        let result = renderer
            .render(&vars(&[("name", "Ada"), ("code", "X1")]))
            .unwrap();

        assert_eq!(result, "Hello Ada, your code is X1");
    }

    #[test]
    fn test_render_repeated_placeholder() {
        let renderer = TemplateRenderer::new("{{name}}! {{name}}!");
        assert_eq!(renderer.placeholders(), vec!["name"]);
        assert_eq!(renderer.render(&vars(&[("name", "Bo")])).unwrap(), "Bo! Bo!");
    }

    #[test]
    fn test_render_reports_missing_variable() {
        let renderer = TemplateRenderer::new("Hi {{name}} from {{company.city}}");
        let result = renderer.render(&vars(&[("name", "Ada")]));

        assert_eq!(result, Err("company.city".to_string()));
    }

    #[test]
    fn test_render_literal_keeps_placeholders() {
        let renderer = TemplateRenderer::new("Hi {{name}}");
        assert_eq!(renderer.render_literal(), "Hi {{name}}");
    }

    #[test]
    fn test_template_without_placeholders() {
        let renderer = TemplateRenderer::new("Store opens at 9");
        assert!(renderer.placeholders().is_empty());
        assert_eq!(renderer.render(&BTreeMap::new()).unwrap(), "Store opens at 9");
    }
}
