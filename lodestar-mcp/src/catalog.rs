//! Tool and prompt definitions advertised by `tools/list` and `prompts/list`.

use serde_json::json;

use crate::envelope::Operation;
use crate::protocol::{McpPrompt, McpTool, PromptArgument};

fn describe(operation: Operation) -> &'static str {
    match operation {
        Operation::DeepResearch => {
            "Conduct web research on a query. Use this for time-sensitive or specific \
             information such as news, prices, people or niche knowledge. Returns a \
             research_id plus the gathered context and sources."
        }
        Operation::QuickSearch => {
            "Fast web search returning results with snippets. Optimizes for speed over \
             depth when a full research pass is not needed."
        }
        Operation::WriteReport => {
            "Write a report from a completed research session, optionally steered by a \
             custom prompt."
        }
        Operation::GetResearchSources => "List the sources gathered by a research session.",
        Operation::GetResearchContext => "Return the full evidence text of a research session.",
        Operation::ResearchResource => "Research context for a topic, with sources.",
        Operation::ResearchQuery => "Prompt for researching a topic toward a goal.",
    }
}

fn research_id_schema() -> serde_json::Value {
    json!({
        "type": "string",
        "description": "Identifier returned by deep_research or quick_search"
    })
}

fn input_schema(operation: Operation) -> serde_json::Value {
    match operation {
        Operation::DeepResearch => json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The research query or topic"},
                "deep": {
                    "type": "boolean",
                    "description": "Run a deeper, more thorough research pass",
                    "default": false
                }
            },
            "required": ["query"]
        }),
        Operation::QuickSearch => json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"}
            },
            "required": ["query"]
        }),
        Operation::WriteReport => json!({
            "type": "object",
            "properties": {
                "research_id": research_id_schema(),
                "custom_prompt": {
                    "type": "string",
                    "description": "Optional instructions for the report"
                }
            },
            "required": ["research_id"]
        }),
        _ => json!({
            "type": "object",
            "properties": { "research_id": research_id_schema() },
            "required": ["research_id"]
        }),
    }
}

/// Definitions of every tool, in a stable order.
pub fn tools() -> Vec<McpTool> {
    Operation::TOOLS
        .into_iter()
        .map(|op| McpTool {
            name: op.as_str().to_string(),
            description: Some(describe(op).to_string()),
            input_schema: input_schema(op),
        })
        .collect()
}

fn argument(name: &str, description: &str, required: bool) -> PromptArgument {
    PromptArgument {
        name: name.to_string(),
        description: Some(description.to_string()),
        required,
    }
}

pub fn prompts() -> Vec<McpPrompt> {
    vec![McpPrompt {
        name: Operation::ResearchQuery.as_str().to_string(),
        description: Some(describe(Operation::ResearchQuery).to_string()),
        arguments: vec![
            argument("topic", "The topic to research", true),
            argument("goal", "The goal or specific question to answer", true),
            argument(
                "report_format",
                "Format of the report to generate (default: research_report)",
                false,
            ),
        ],
    }]
}
