//! Shared fixtures for unit tests.

use crate::core::config::BackendConfig;
use crate::mcp::error::TransportError;
use crate::mcp::transport::ToolTransport;
use async_trait::async_trait;
use rust_mcp_schema::{CallToolResult, ListToolsResult, Tool, ToolInputSchema};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn sample_tool(name: &str) -> Tool {
    Tool {
        annotations: None,
        description: None,
        execution: None,
        icons: Vec::new(),
        input_schema: ToolInputSchema::new(Vec::new(), None, None),
        meta: None,
        name: name.to_string(),
        output_schema: None,
        title: None,
    }
}

pub fn backend_config(name: &str, enabled: bool) -> BackendConfig {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "type": "stdio",
        "enabled": enabled,
        "config": {"command": "/definitely-missing-command"}
    }))
    .expect("config should parse")
}

/// How an in-process fake backend answers tool invocations.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    Succeed,
    TimeOut,
    DropConnection,
}

pub struct FakeTransport {
    pub backend_name: String,
    pub tools: Vec<Tool>,
    pub behavior: FakeBehavior,
    pub calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new(backend_name: &str, tools: Vec<Tool>, behavior: FakeBehavior) -> Self {
        Self {
            backend_name: backend_name.to_string(),
            tools,
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolTransport for FakeTransport {
    fn backend(&self) -> &str {
        &self.backend_name
    }

    async fn list_tools_page(
        &self,
        _cursor: Option<String>,
    ) -> Result<ListToolsResult, TransportError> {
        Ok(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools: self.tools.clone(),
        })
    }

    async fn invoke_tool(
        &self,
        name: &str,
        _arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            FakeBehavior::TimeOut => Err(TransportError::InvocationTimeout {
                tool: name.to_string(),
                seconds: 30,
            }),
            FakeBehavior::DropConnection => Err(TransportError::closed(&self.backend_name)),
            FakeBehavior::Succeed => {
                if !self.tools.iter().any(|tool| tool.name == name) {
                    return Err(TransportError::ToolNotFound {
                        backend: self.backend_name.clone(),
                        tool: name.to_string(),
                    });
                }
                let result = serde_json::from_value(serde_json::json!({
                    "content": [{"type": "text", "text": format!("{name} ok")}]
                }))
                .expect("call result should parse");
                Ok(result)
            }
        }
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}
