// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{SecurityLevel, Tool, ToolContext, ToolRegistry, ToolResult, ToolSecurity};

/// Lists the registered tools for the model.
///
/// Holds a weak handle back to the registry that owns it, so registering the
/// help tool into that same registry does not create a strong cycle.
pub struct HelpTool {
    registry: Weak<ToolRegistry>,
}

impl HelpTool {
    pub fn new(registry: &Arc<ToolRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

#[async_trait]
impl Tool for HelpTool {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "List available tools with their descriptions"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn security(&self) -> ToolSecurity {
        ToolSecurity {
            level: SecurityLevel::Read,
            confirm_required: false,
            max_value: None,
        }
    }

    async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> ToolResult {
        let Some(registry) = self.registry.upgrade() else {
            return ToolResult::err("registry is gone");
        };
        let tools: Vec<Value> = registry
            .schemas()
            .into_iter()
            .map(|s| json!({ "name": s.name, "description": s.description }))
            .collect();
        ToolResult::ok(json!({ "tools": tools }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
