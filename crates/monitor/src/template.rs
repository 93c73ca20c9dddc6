//! Template rendering utilities using Tera
//!
//! Notification texts are plain-text Tera templates rendered against a JSON
//! context. Templates are compiled once and rendered by name.

use crate::{Error, Result};
use serde_json::Value;
use tera::{Context, Tera};

/// Compile a set of named templates into one Tera instance.
pub fn compile_templates(templates: &[(&str, &str)]) -> Result<Tera> {
    let mut tera = Tera::default();
    // Names without an .html suffix keep autoescaping off.
    tera.add_raw_templates(templates.to_vec())
        .map_err(|e| Error::Template(format!("Failed to parse template: {}", e)))?;
    Ok(tera)
}

/// Turn a JSON value into a Tera context. Object keys become top-level
/// variables; anything else is exposed as `data`.
pub fn context_from_value(value: &Value) -> Context {
    let mut context = Context::new();
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                context.insert(key, value);
            }
        }
        _ => context.insert("data", value),
    }
    context
}

/// Render a previously compiled template with the given context
pub fn render_named(tera: &Tera, name: &str, value: &Value) -> Result<String> {
    tera.render(name, &context_from_value(value))
        .map_err(|e| Error::Template(format!("Failed to render template '{}': {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_named() {
        let tera = compile_templates(&[
            ("greeting", "Server {{ name }} is {{ status }}"),
            ("fallback", "Status: {{ status | default(value=\"unknown\") }}"),
        ])
        .unwrap();

        let context = json!({ "name": "edge-1", "status": "ok" });
        assert_eq!(render_named(&tera, "greeting", &context).unwrap(), "Server edge-1 is ok");
        assert_eq!(
            render_named(&tera, "fallback", &json!({})).unwrap(),
            "Status: unknown"
        );
    }

    #[test]
    fn test_non_object_context_is_data() {
        let tera = compile_templates(&[("raw", "{{ data }}")]).unwrap();
        assert_eq!(render_named(&tera, "raw", &json!(42)).unwrap(), "42");
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        assert!(matches!(
            compile_templates(&[("bad", "{% if %}")]),
            Err(Error::Template(_))
        ));
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let tera = compile_templates(&[("needs", "{{ missing }}")]).unwrap();
        assert!(render_named(&tera, "needs", &json!({})).is_err());
    }

    #[test]
    fn test_no_html_escaping() {
        let tera = compile_templates(&[("text", "{{ value }}")]).unwrap();
        assert_eq!(
            render_named(&tera, "text", &json!({ "value": "<a & b>" })).unwrap(),
            "<a & b>"
        );
    }
}
