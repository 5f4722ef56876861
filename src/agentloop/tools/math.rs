//! Math tool: evaluates the `expr` parameter as a numeric expression.
//!
//! Backed by `evalexpr` with `pi` and `e` available as constants. A result
//! that is not a number (or an expression that fails to parse) is an
//! ordinary tool failure, not an error.

use std::error::Error;

use async_trait::async_trait;
use evalexpr::ContextWithMutableVariables;
use serde_json::{json, Map};

use crate::agentloop::tool::{ToolAdapter, ToolInput, ToolResult};

pub struct MathTool;

impl MathTool {
    pub fn new() -> Self {
        Self
    }

    fn evaluate(&self, expression: &str) -> Result<f64, String> {
        let mut context = evalexpr::HashMapContext::new();
        let _ = context.set_value("pi".to_string(), evalexpr::Value::Float(std::f64::consts::PI));
        let _ = context.set_value("e".to_string(), evalexpr::Value::Float(std::f64::consts::E));

        match evalexpr::eval_with_context(expression.trim(), &context) {
            Ok(value) => value
                .as_number()
                .map_err(|_| "result is not a number".to_string()),
            Err(err) => Err(format!("evaluation error: {}", err)),
        }
    }
}

impl Default for MathTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for MathTool {
    fn id(&self) -> &str {
        "math"
    }

    fn description(&self) -> &str {
        "Evaluates the numeric expression in the 'expr' parameter"
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let expression = match input.params.get("expr").and_then(|v| v.as_str()) {
            Some(expr) if !expr.trim().is_empty() => expr,
            _ => return Ok(ToolResult::failure("missing 'expr' parameter")),
        };

        match self.evaluate(expression) {
            Ok(number) => {
                let mut output = Map::new();
                output.insert("result".to_string(), json!(number));
                Ok(ToolResult::success(output))
            }
            Err(message) => Ok(ToolResult::failure(message)),
        }
    }
}
