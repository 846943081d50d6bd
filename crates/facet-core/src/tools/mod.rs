//! Built-in tools served by `facet-rpc`.
//!
//! - `echo`: returns its arguments
//! - `apply_lenses`: text transforms (see [`lenses`])
//! - `validate_schema`: JSON Schema subset validation (see [`schema`])
//! - `render_template`: `{{variable}}` substitution (see [`template`])
//! - `tools/list`: descriptors of every registered tool
//!
//! All of them are pure functions of their arguments.

pub mod lenses;
pub mod schema;
pub mod template;

use crate::registry::{ToolError, ToolRegistry};
use serde_json::{json, Map, Value};

/// Operation name of the tool listing.
pub const LIST_TOOLS: &str = "tools/list";

impl ToolRegistry {
    /// Registry holding every built-in tool.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        register_builtin(&mut registry);
        registry.with_tool_listing()
    }

    /// Add `tools/list`, describing every tool registered so far.
    pub fn with_tool_listing(mut self) -> Self {
        let params = json!({"type": "object", "additionalProperties": false});
        let description = "Lists the tools this server exposes, with their argument schemas.";

        let mut descriptors = self.descriptors();
        descriptors.push(crate::registry::ToolDescriptor {
            name: LIST_TOOLS.to_string(),
            description: description.to_string(),
            parameters: params.clone(),
        });
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        let listing = json!({ "tools": descriptors });

        self.register_sync(LIST_TOOLS, description, params, move |_args| Ok(listing.clone()));
        self
    }
}

/// Register `echo`, `apply_lenses`, `validate_schema` and `render_template`.
pub fn register_builtin(registry: &mut ToolRegistry) {
    registry
        .register_sync(
            "echo",
            "Returns its arguments unchanged.",
            json!({"type": "object"}),
            Ok,
        )
        .register_sync(
            "apply_lenses",
            "Applies one or more lenses to input text. Use for atomic text transformations \
             like trimming, dedenting, or squeezing spaces.",
            json!({
                "type": "object",
                "properties": {
                    "input_string": {"type": "string", "description": "Text to process"},
                    "lenses": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description":
                            "Lenses to apply in order, e.g. ['dedent', 'trim', 'limit(100)']"
                    }
                },
                "required": ["input_string", "lenses"]
            }),
            apply_lenses_tool,
        )
        .register_sync(
            "validate_schema",
            "Validates JSON data against a JSON Schema.",
            json!({
                "type": "object",
                "properties": {
                    "json_object": {"description": "Data to validate"},
                    "json_schema": {
                        "type": "object",
                        "description": "JSON Schema to validate against"
                    }
                },
                "required": ["json_object", "json_schema"]
            }),
            validate_schema_tool,
        )
        .register_sync(
            "render_template",
            "Substitutes {{variable}} placeholders in a template.",
            json!({
                "type": "object",
                "properties": {
                    "template": {"type": "string"},
                    "variables": {"type": "object", "additionalProperties": true}
                },
                "required": ["template"]
            }),
            render_template_tool,
        );
}

fn apply_lenses_tool(args: Value) -> Result<Value, ToolError> {
    let input = require_str(&args, "input_string")?;
    let specs = require_array(&args, "lenses")?
        .iter()
        .map(|v| {
            v.as_str()
                .map(String::from)
                .ok_or_else(|| ToolError::invalid("lenses must be an array of strings"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let result = lenses::apply_lenses(input, &specs)?;
    Ok(json!({ "result": result, "applied_lenses": specs }))
}

fn validate_schema_tool(args: Value) -> Result<Value, ToolError> {
    let instance = args
        .get("json_object")
        .ok_or_else(|| missing("json_object"))?;
    let schema = args
        .get("json_schema")
        .ok_or_else(|| missing("json_schema"))?;

    let errors = schema::validate(instance, schema)?;
    Ok(json!({ "valid": errors.is_empty(), "errors": errors }))
}

fn render_template_tool(args: Value) -> Result<Value, ToolError> {
    let text = require_str(&args, "template")?;
    let empty = Map::new();
    let variables = match args.get("variables") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ToolError::invalid("variables must be an object")),
    };

    Ok(json!({ "result": template::render(text, variables) }))
}

/// Extract a required string argument.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .ok_or_else(|| missing(key))?
        .as_str()
        .ok_or_else(|| ToolError::invalid(format!("{} must be a string", key)))
}

/// Extract a required array argument.
pub(crate) fn require_array<'a>(args: &'a Value, key: &str) -> Result<&'a Vec<Value>, ToolError> {
    args.get(key)
        .ok_or_else(|| missing(key))?
        .as_array()
        .ok_or_else(|| ToolError::invalid(format!("{} must be an array", key)))
}

fn missing(key: &str) -> ToolError {
    ToolError::invalid(format!("Missing required parameter: {}", key))
}
