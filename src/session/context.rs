//! Model context construction and decision parsing.
//!
//! The context is bounded: the last `window` memory entries are shown
//! verbatim, anything older is folded into a single summary line.

use serde::Deserialize;
use serde_json::Value;

use super::AgentSession;
use crate::llm::{extract_json, ChatMessage, Completion};
use crate::tools::ToolDefinition;
use crate::util::truncate_chars;

/// Characters of a tool result shown per memory entry.
const RESULT_PREVIEW_CHARS: usize = 1_500;

const DECISION_FORMAT: &str = r#"Respond with exactly one JSON object and nothing else:
- to call a tool:            {"action": "tool", "tool": "<name>", "args": {...}}
- to finish the current step: {"action": "step_complete", "summary": "<what was done>"}
- to finish the whole goal:   {"action": "answer", "answer": "<final answer>"}"#;

/// What the model decided to do next.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    #[serde(alias = "tool_call")]
    Tool {
        tool: String,
        #[serde(default, alias = "arguments")]
        args: Value,
    },
    #[serde(alias = "final_answer", alias = "final")]
    Answer { answer: String },
    StepComplete {
        #[serde(default)]
        summary: String,
    },
}

impl Decision {
    /// Interpret a completion.
    ///
    /// Prose with no JSON at all is taken as a final answer; JSON that does
    /// not match a known action is an error the loop records as an observation.
    pub fn from_completion(completion: &Completion) -> Result<Self, String> {
        match &completion.structured {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| format!("Unrecognised decision {}: {}", value, e)),
            None if completion.text.trim().is_empty() => {
                Err("Model returned an empty response".to_string())
            }
            None => Ok(Decision::Answer {
                answer: completion.text.trim().to_string(),
            }),
        }
    }
}

fn tools_section(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return "No tools are available.".to_string();
    }
    let mut out = String::from("Available tools:\n");
    for tool in tools {
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    out
}

fn plan_section(session: &AgentSession) -> Option<String> {
    if session.steps.is_empty() {
        return None;
    }
    let mut out = String::from("Plan:\n");
    for (i, step) in session.steps.iter().enumerate() {
        let mark = if step.done { "x" } else { " " };
        out.push_str(&format!("[{}] {}. {}", mark, i + 1, step.description));
        if let Some(result) = &step.result {
            out.push_str(&format!(" -> {}", truncate_chars(result, 200)));
        }
        out.push('\n');
    }
    if let Some((n, total, description)) = session.current_step_info() {
        out.push_str(&format!("\nCurrent step: {} of {}: {}\n", n, total, description));
    }
    Some(out)
}

fn memory_section(session: &AgentSession, window: usize) -> Option<String> {
    if session.memory.is_empty() {
        return None;
    }
    let split = session.memory.len().saturating_sub(window);
    let (older, recent) = session.memory.split_at(split);

    let mut out = String::new();
    if !older.is_empty() {
        let failed = older.iter().filter(|e| !e.success).count();
        let mut actions: Vec<&str> = older.iter().map(|e| e.action.as_str()).collect();
        actions.dedup();
        out.push_str(&format!(
            "Earlier: {} observations ({} failed), actions: {}\n",
            older.len(),
            failed,
            actions.join(", ")
        ));
    }
    out.push_str("Recent observations:\n");
    for entry in recent {
        let status = if entry.success { "ok" } else { "error" };
        out.push_str(&format!(
            "#{} {} [{}]: {}\n",
            entry.iteration,
            entry.action,
            status,
            truncate_chars(&entry.result, RESULT_PREVIEW_CHARS)
        ));
    }
    Some(out)
}

/// Messages for one think step.
pub fn build_messages(
    session: &AgentSession,
    tools: &[ToolDefinition],
    window: usize,
) -> Vec<ChatMessage> {
    let system = format!(
        "You are an autonomous agent working towards a goal one action at a time.\n\n{}\n\n{}",
        tools_section(tools),
        DECISION_FORMAT
    );

    let mut user = format!("Goal: {}\n", session.goal);
    if let Some(plan) = plan_section(session) {
        user.push('\n');
        user.push_str(&plan);
    }
    if let Some(memory) = memory_section(session, window) {
        user.push('\n');
        user.push_str(&memory);
    }
    user.push_str(&format!(
        "\nIteration {} of {}. Decide the next action.",
        session.iteration, session.max_iterations
    ));

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// Messages asking for an up-front plan.
pub fn plan_messages(goal: &str, tools: &[ToolDefinition]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!(
            "Break the goal into a short ordered list of concrete steps.\n\n{}\n\n\
             Respond with JSON: {{\"steps\": [\"step one\", \"step two\"]}}",
            tools_section(tools)
        )),
        ChatMessage::user(format!("Goal: {}", goal)),
    ]
}

/// Messages asking to replace the remaining steps after a failure.
pub fn replan_messages(
    session: &AgentSession,
    tools: &[ToolDefinition],
    window: usize,
    failure: &str,
) -> Vec<ChatMessage> {
    let mut messages = build_messages(session, tools, window);
    messages.push(ChatMessage::user(format!(
        "The last action failed: {}\n\
         Propose new steps to replace the unfinished part of the plan. \
         Respond with JSON: {{\"steps\": [\"...\"]}}",
        truncate_chars(failure, RESULT_PREVIEW_CHARS)
    )));
    messages
}

/// Extract a step list from a plan completion.
///
/// Accepts `{"steps": [...]}`, a bare JSON array, or numbered / bulleted lines.
pub fn parse_plan(completion: &Completion) -> Option<Vec<String>> {
    let from_json = |value: &Value| -> Option<Vec<String>> {
        let array = value.get("steps").unwrap_or(value).as_array()?;
        let steps: Vec<String> = array
            .iter()
            .filter_map(|s| match s {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(o) => o
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(|d| d.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect();
        (!steps.is_empty()).then_some(steps)
    };

    if let Some(steps) = completion.structured.as_ref().and_then(from_json) {
        return Some(steps);
    }
    if let Ok(value @ Value::Array(_)) = serde_json::from_str::<Value>(completion.text.trim()) {
        if let Some(steps) = from_json(&value) {
            return Some(steps);
        }
    }
    if extract_json(&completion.text).is_some() {
        return None;
    }

    let steps: Vec<String> = completion
        .text
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let stripped = line
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', '-', '*'])
                .trim();
            (stripped.len() < line.len() && !stripped.is_empty()).then(|| stripped.to_string())
        })
        .collect();
    (!steps.is_empty()).then_some(steps)
}
