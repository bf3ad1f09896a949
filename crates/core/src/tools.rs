//! Built-in Agent Tools
//!
//! The tools every agent run is registered with, served over the Model Context
//! Protocol (MCP). Each connection gets its own `Toolbox`, hosted in-process
//! and reached through an rmcp client, so tool state never crosses connections.

use rhai::{Dynamic, Engine};
use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

/// Arguments for the `calculator` tool.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct CalculatorArgs {
    /// The arithmetic expression to evaluate.
    #[schemars(
        description = "Arithmetic expression, e.g. '25 * 8' or 'sqrt(2.0) * 3.5'. Integer division truncates; write decimals for fractional results."
    )]
    pub expression: String,
}

/// Creates a sandboxed expression engine for the calculator.
fn calculator_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 32);
    engine.set_max_operations(10_000);
    engine.set_max_modules(0);
    engine.set_max_string_size(1_000);
    engine.set_max_array_size(100);
    engine.set_max_map_size(100);
    engine.set_allow_looping(false);
    engine
}

/// Evaluates an arithmetic expression and renders the result as text.
pub fn evaluate_expression(expression: &str) -> Result<String, String> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err("Expression is empty".to_string());
    }
    let value: Dynamic = calculator_engine()
        .eval_expression::<Dynamic>(expression)
        .map_err(|e| format!("Could not evaluate '{}': {}", expression, e))?;

    if let Ok(int) = value.as_int() {
        return Ok(int.to_string());
    }
    if let Ok(float) = value.as_float() {
        if !float.is_finite() {
            return Err(format!("'{}' does not have a finite result", expression));
        }
        return Ok(float.to_string());
    }
    Err(format!(
        "'{}' evaluated to a non-numeric value of type {}",
        expression,
        value.type_name()
    ))
}

/// The MCP tool server hosted for each agent run.
pub struct Toolbox {
    tool_router: ToolRouter<Self>,
}

impl Default for Toolbox {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_handler]
impl ServerHandler for Toolbox {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl Toolbox {
    pub fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    /// Evaluates an arithmetic expression.
    #[tool(
        description = "Evaluate an arithmetic expression. Supports + - * / % **, parentheses and functions such as sqrt, abs, floor, sin and cos."
    )]
    pub async fn calculator(&self, args: Parameters<CalculatorArgs>) -> Result<String, String> {
        info!(expression = %args.0.expression, "Executing tool 'calculator'");
        evaluate_expression(&args.0.expression).map(|value| format!("Result: {}", value))
    }

    /// Reports the server's local time.
    #[tool(description = "Get the current local date and time in RFC 3339 format.")]
    pub async fn current_time(&self) -> Result<String, String> {
        info!("Executing tool 'current_time'");
        Ok(chrono::Local::now().to_rfc3339())
    }
}
