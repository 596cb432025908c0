//! Embedded script host for deterministic transformers.
//!
//! Each deterministic instance owns one interpreter: the script compiles at
//! construction, top-level statements run once, and every delivered leaf
//! calls the `process` entry function. The interpreter is single-threaded;
//! callers serialize access externally for the duration of a call.

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, AST};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const ENTRY_FUNCTION: &str = "process";

#[derive(Debug, Error)]
pub enum ScriptError {
    /// Missing, unparsable, or no `process` entry function. Fatal to the
    /// instance being constructed.
    #[error("unable to load script {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    /// Interpreter exception or type-coercion failure during a call. Logged
    /// and the message dropped; the instance stays up.
    #[error("script runtime failure: {0}")]
    Runtime(String),
}

pub struct ScriptHost {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
}

impl ScriptHost {
    /// Compiles and evaluates the script file, verifying the `process` entry
    /// function is defined with a single parameter.
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let load_error = |reason: String| ScriptError::Load {
            path: path.to_path_buf(),
            reason,
        };

        let mut engine = Engine::new();
        // Scripts get JSON and string helpers only: no imports, no
        // filesystem, no network, no process spawning.
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        register_helpers(&mut engine);

        let ast = engine
            .compile_file(path.to_path_buf())
            .map_err(|err| load_error(err.to_string()))?;

        let defines_entry = ast
            .iter_functions()
            .any(|function| function.name == ENTRY_FUNCTION && function.params.len() == 1);
        if !defines_entry {
            return Err(load_error(format!(
                "script does not define `{ENTRY_FUNCTION}(input)`"
            )));
        }

        // Top-level statements run exactly once per instance lifetime.
        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|err| load_error(err.to_string()))?;

        Ok(Self { engine, ast, scope })
    }

    /// Calls `process` with the decoded input map. A unit return means "drop
    /// this message"; any other non-map return is a runtime failure.
    pub fn call(&mut self, input: &Map<String, Value>) -> Result<Option<Map<String, Value>>, ScriptError> {
        let dynamic_input = rhai::serde::to_dynamic(input)
            .map_err(|err| ScriptError::Runtime(err.to_string()))?;

        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let result: Dynamic = self
            .engine
            .call_fn_with_options(
                options,
                &mut self.scope,
                &self.ast,
                ENTRY_FUNCTION,
                (dynamic_input,),
            )
            .map_err(|err| ScriptError::Runtime(err.to_string()))?;

        if result.is_unit() {
            return Ok(None);
        }

        let value: Value = rhai::serde::from_dynamic(&result)
            .map_err(|err| ScriptError::Runtime(err.to_string()))?;
        match value {
            Value::Object(map) => Ok(Some(map)),
            Value::Null => Ok(None),
            other => Err(ScriptError::Runtime(format!(
                "`{ENTRY_FUNCTION}` must return a map or unit, got {other}"
            ))),
        }
    }
}

fn register_helpers(engine: &mut Engine) {
    engine.register_fn(
        "json_encode",
        |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
            let json: Value = rhai::serde::from_dynamic(&value)?;
            serde_json::to_string(&json).map_err(|err| err.to_string().into())
        },
    );
    engine.register_fn(
        "json_decode",
        |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let json: Value =
                serde_json::from_str(text).map_err(|err| -> Box<EvalAltResult> { err.to_string().into() })?;
            rhai::serde::to_dynamic(&json)
        },
    );
    engine.register_fn("contains", |haystack: &str, needle: &str| {
        haystack.contains(needle)
    });
    engine.register_fn("log", |message: &str| {
        info!(target: "nimsforest::script", "{message}");
    });
    engine.register_fn("date", |format: &str| -> Result<String, Box<EvalAltResult>> {
        format_timestamp(format, chrono::Utc::now())
    });
    engine.register_fn(
        "date",
        |format: &str, epoch_secs: i64| -> Result<String, Box<EvalAltResult>> {
            let timestamp = chrono::DateTime::from_timestamp(epoch_secs, 0)
                .ok_or_else(|| -> Box<EvalAltResult> {
                    format!("epoch {epoch_secs} out of range").into()
                })?;
            format_timestamp(format, timestamp)
        },
    );
}

fn format_timestamp(
    format: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Result<String, Box<EvalAltResult>> {
    use std::fmt::Write as _;

    let mut rendered = String::new();
    write!(rendered, "{}", timestamp.format(format))
        .map_err(|_| -> Box<EvalAltResult> { format!("invalid date format {format:?}").into() })?;
    Ok(rendered)
}
