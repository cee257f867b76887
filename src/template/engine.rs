//! Slot-binding template engine
//!
//! Uses minijinja with custom syntax configuration:
//! - Slot delimiters: `${...}`
//! - Block delimiters: `{%...%}` (conditionals only)
//! - Comment delimiters: `{#...#}`
//!
//! Every slot is written as a complete JSON node (strings quoted, maps and
//! lists in flow style), which is valid YAML. A slot therefore binds one
//! whole value from the data tree and can never splice into part of a
//! neighbouring scalar. Undefined slots are errors.

use minijinja::syntax::SyntaxConfig;
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior, Value};
use serde::{Deserialize, Serialize};

use super::base::BaseTemplate;
use super::error::CompileError;

/// Template engine binding data values into base template slots
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new engine with `${...}` slot syntax
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded delimiters are rejected by minijinja, which
    /// would indicate an incompatible minijinja version.
    pub fn new() -> Self {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .expect("template syntax configuration is hardcoded and valid");

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_formatter(|out, _state, value| {
            if value.is_undefined() {
                return Err(minijinja::Error::new(
                    ErrorKind::UndefinedError,
                    "slot is not bound by the data values",
                ));
            }
            let node = serde_json::to_string(value).map_err(|e| {
                minijinja::Error::new(ErrorKind::BadSerialization, e.to_string())
            })?;
            out.write_str(&node)
                .map_err(|_| minijinja::Error::new(ErrorKind::WriteFailure, "failed to write slot"))
        });

        Self { env }
    }

    /// Render a base template against the given data values
    pub fn render<S: Serialize>(
        &self,
        base: &BaseTemplate,
        values: &S,
    ) -> Result<String, CompileError> {
        let template = self
            .env
            .template_from_named_str(base.name, base.source)
            .map_err(|e| CompileError::from_render(&e, base.name, base.source))?;

        template
            .render(Value::from_serialize(values))
            .map_err(|e| CompileError::from_render(&e, base.name, base.source))
    }

    /// Render a base template and parse the output into documents
    ///
    /// Empty documents (for example a leading `---`) are skipped.
    pub fn render_documents<S: Serialize>(
        &self,
        base: &BaseTemplate,
        values: &S,
    ) -> Result<Vec<serde_json::Value>, CompileError> {
        let rendered = self.render(base, values)?;
        parse_documents(&rendered, base.name)
    }
}

/// Parse multi-document YAML into JSON values
pub fn parse_documents(
    rendered: &str,
    template_name: &str,
) -> Result<Vec<serde_json::Value>, CompileError> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(rendered) {
        let value = serde_json::Value::deserialize(document)
            .map_err(|e| CompileError::from_yaml(&e, template_name))?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::CompileErrorKind;
    use serde_json::json;

    static SIMPLE: BaseTemplate = BaseTemplate {
        name: "simple.yaml",
        source: "kind: Thing\nname: ${ name }\nlabels: ${ labels }\n---\nkind: Other\ncount: ${ count }\n",
    };

    #[test]
    fn slots_bind_whole_nodes() {
        let engine = TemplateEngine::new();
        let docs = engine
            .render_documents(
                &SIMPLE,
                &json!({ "name": "ci: prod", "labels": { "a": "b" }, "count": 3 }),
            )
            .unwrap();

        assert_eq!(docs.len(), 2);
        // a colon inside a value cannot break the document structure
        assert_eq!(docs[0]["name"], "ci: prod");
        assert_eq!(docs[0]["labels"]["a"], "b");
        assert_eq!(docs[1]["count"], 3);
    }

    #[test]
    fn undefined_slot_is_data_error_with_location() {
        let engine = TemplateEngine::new();
        let err = engine
            .render(&SIMPLE, &json!({ "name": "ci", "labels": {} }))
            .unwrap_err();

        assert_eq!(err.kind, CompileErrorKind::Data);
        assert_eq!(err.template_name.as_deref(), Some("simple.yaml"));
        assert!(err.line.is_some());
    }

    #[test]
    fn broken_block_is_syntax_error() {
        static BROKEN: BaseTemplate = BaseTemplate {
            name: "broken.yaml",
            source: "kind: Thing\n{% if name %}\nname: ${ name }\n",
        };
        let engine = TemplateEngine::new();
        let err = engine.render(&BROKEN, &json!({ "name": "ci" })).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Syntax);
        assert_eq!(err.template_name.as_deref(), Some("broken.yaml"));
    }

    #[test]
    fn invalid_yaml_reports_line() {
        let err = parse_documents("kind: Thing\n  bad: [\n", "bad.yaml").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Syntax);
        assert!(err.line.is_some());
    }

    #[test]
    fn empty_documents_are_skipped() {
        let docs = parse_documents("---\nkind: A\n---\n---\nkind: B\n", "t.yaml").unwrap();
        assert_eq!(docs.len(), 2);
    }
}
