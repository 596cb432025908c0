//! Prompt templating and response parsing for nondeterministic transformers.
//!
//! Templates parse at load time; rendering substitutes values from the input
//! map with missing fields rendering as empty strings. Responses must carry
//! JSON: the first fenced block wins, otherwise the whole body must decode.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

const TEMPLATE_NAME: &str = "prompt";

#[derive(Debug, Error)]
pub enum PromptError {
    /// Unreadable or syntactically invalid template. Fatal to the instance
    /// being constructed.
    #[error("unable to load template {path}: {reason}")]
    Template { path: PathBuf, reason: String },
    /// Substitution failure for one input. Logged and the message dropped.
    #[error("template render failure: {0}")]
    Render(String),
    /// The provider response carried no decodable JSON. The original text
    /// rides along for diagnostics.
    #[error("unable to parse provider response as JSON: {reason}")]
    ResponseParse { reason: String, text: String },
}

pub struct PromptEngine {
    environment: Environment<'static>,
}

impl PromptEngine {
    /// Reads and parses the template file. Iteration and conditional forms
    /// are supported; anything the parser does not recognize fails here.
    pub fn load(path: &Path) -> Result<Self, PromptError> {
        let template_error = |reason: String| PromptError::Template {
            path: path.to_path_buf(),
            reason,
        };

        let source = std::fs::read_to_string(path).map_err(|err| template_error(err.to_string()))?;

        let mut environment = Environment::new();
        environment.set_undefined_behavior(UndefinedBehavior::Chainable);
        environment
            .add_template_owned(TEMPLATE_NAME.to_string(), source)
            .map_err(|err| template_error(err.to_string()))?;

        Ok(Self { environment })
    }

    /// Renders the template against the input map.
    pub fn render(&self, input: &Map<String, Value>) -> Result<String, PromptError> {
        self.environment
            .get_template(TEMPLATE_NAME)
            .and_then(|template| template.render(input))
            .map_err(|err| PromptError::Render(err.to_string()))
    }

    /// Extracts the first fenced JSON block from a provider response, falling
    /// back to decoding the entire text. The decoded value must be a map.
    pub fn parse_response(&self, text: &str) -> Result<Map<String, Value>, PromptError> {
        let candidate = extract_fenced_block(text).unwrap_or(text);

        let value: Value =
            serde_json::from_str(candidate.trim()).map_err(|err| PromptError::ResponseParse {
                reason: err.to_string(),
                text: text.to_string(),
            })?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(PromptError::ResponseParse {
                reason: format!("expected a JSON object, got {other}"),
                text: text.to_string(),
            }),
        }
    }
}

/// First ``` fence with an optional language tag on the opening line.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let tag_line_end = after_open.find('\n')?;
    let body = &after_open[tag_line_end + 1..];
    let close = body.find("```")?;
    Some(&body[..close])
}

#[cfg(test)]
mod tests {
    use super::{PromptEngine, PromptError};
    use serde_json::{json, Map, Value};
    use std::io::Write;

    fn template_file(source: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".prompt")
            .tempfile()
            .expect("create template file");
        file.write_all(source.as_bytes()).expect("write template");
        file
    }

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().expect("object input").clone()
    }

    #[test]
    fn render_substitutes_nested_fields() {
        let file = template_file("Score {{ lead.score }} for {{ lead.email }}.");
        let engine = PromptEngine::load(file.path()).expect("load template");

        let rendered = engine
            .render(&input(json!({"lead": {"score": 85, "email": "e@x"}})))
            .expect("render");
        assert_eq!(rendered, "Score 85 for e@x.");
    }

    #[test]
    fn missing_fields_render_as_empty_strings() {
        let file = template_file("[{{ absent }}][{{ lead.also.absent }}]");
        let engine = PromptEngine::load(file.path()).expect("load template");

        let rendered = engine.render(&input(json!({}))).expect("render");
        assert_eq!(rendered, "[][]");
    }

    #[test]
    fn iteration_and_conditionals_are_supported() {
        let file = template_file(
            "{% if pursue %}yes{% endif %}:{% for s in signals %}{{ s }},{% endfor %}",
        );
        let engine = PromptEngine::load(file.path()).expect("load template");

        let rendered = engine
            .render(&input(json!({"pursue": true, "signals": ["a", "b"]})))
            .expect("render");
        assert_eq!(rendered, "yes:a,b,");
    }

    #[test]
    fn unknown_forms_fail_at_load() {
        let file = template_file("{% bogus %}");
        let result = PromptEngine::load(file.path());
        assert!(matches!(result, Err(PromptError::Template { .. })));
    }

    #[test]
    fn load_fails_for_missing_file() {
        let result = PromptEngine::load(std::path::Path::new("/nonexistent/x.prompt"));
        assert!(matches!(result, Err(PromptError::Template { .. })));
    }

    #[test]
    fn parse_response_prefers_the_first_fenced_block() {
        let file = template_file("unused");
        let engine = PromptEngine::load(file.path()).expect("load template");

        let parsed = engine
            .parse_response(
                "Here you go:\n```json\n{\"pursue\": true}\n```\nand ```\n{\"second\": 1}\n```",
            )
            .expect("parse");
        assert_eq!(Value::Object(parsed), json!({"pursue": true}));
    }

    #[test]
    fn parse_response_accepts_untagged_fences_and_bare_json() {
        let file = template_file("unused");
        let engine = PromptEngine::load(file.path()).expect("load template");

        let fenced = engine
            .parse_response("```\n{\"reason\": \"fit\"}\n```")
            .expect("parse fenced");
        assert_eq!(Value::Object(fenced), json!({"reason": "fit"}));

        let bare = engine
            .parse_response("  {\"reason\": \"fit\"}  ")
            .expect("parse bare");
        assert_eq!(Value::Object(bare), json!({"reason": "fit"}));
    }

    #[test]
    fn prose_responses_are_rejected_with_the_original_text() {
        let file = template_file("unused");
        let engine = PromptEngine::load(file.path()).expect("load template");

        let result = engine.parse_response("Sounds like a strong lead to me!");
        match result {
            Err(PromptError::ResponseParse { text, .. }) => {
                assert_eq!(text, "Sounds like a strong lead to me!");
            }
            other => panic!("expected ResponseParse, got {other:?}"),
        }
    }

    #[test]
    fn non_map_json_is_rejected() {
        let file = template_file("unused");
        let engine = PromptEngine::load(file.path()).expect("load template");

        assert!(matches!(
            engine.parse_response("```json\n[1, 2]\n```"),
            Err(PromptError::ResponseParse { .. })
        ));
    }
}
