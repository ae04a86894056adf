use serde_json::{json, Value};

use parley_core::backend::GenerateRequest;
use parley_core::messages::{Message, Role};
use parley_core::tools::ToolSchema;

/// Convert a generation request into an OpenAI-compatible chat body.
pub fn build_request_body(request: &GenerateRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "stream": true,
        "max_tokens": request.max_tokens,
    });

    body["messages"] = json!(convert_messages(
        request.system_prompt.as_deref(),
        &request.messages
    ));

    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools.iter().map(convert_tool).collect::<Vec<_>>());
    }

    body
}

fn convert_tool(tool: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// History holds tool messages without the assistant turn that requested
/// them, so each run of consecutive tool messages is preceded by a
/// synthesized assistant `tool_calls` message. An assistant message right
/// before the run is the text the model produced with those calls and
/// becomes that message's content.
fn convert_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut result = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        result.push(json!({"role": "system", "content": system}));
    }

    let mut preamble: Option<&str> = None;
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        match msg.role {
            Role::User => result.push(json!({"role": "user", "content": msg.content})),
            Role::Assistant if messages.get(i + 1).is_some_and(Message::is_tool) => {
                preamble = Some(&msg.content);
            }
            Role::Assistant => result.push(json!({"role": "assistant", "content": msg.content})),
            Role::Tool => {
                let run_end = messages[i..]
                    .iter()
                    .position(|m| !m.is_tool())
                    .map_or(messages.len(), |p| i + p);
                let run = &messages[i..run_end];
                result.push(json!({
                    "role": "assistant",
                    "content": preamble.take().map_or(Value::Null, |text| json!(text)),
                    "tool_calls": run.iter().map(convert_tool_call).collect::<Vec<_>>(),
                }));
                for tool_msg in run {
                    result.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_call_id(tool_msg),
                        "content": tool_msg.content,
                    }));
                }
                i = run_end;
                continue;
            }
        }
        i += 1;
    }

    result
}

fn tool_call_id(msg: &Message) -> String {
    msg.tool_call_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default()
}

fn convert_tool_call(msg: &Message) -> Value {
    let arguments = msg
        .tool_arguments
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "{}".to_string());
    json!({
        "id": tool_call_id(msg),
        "type": "function",
        "function": {
            "name": msg.tool_name.clone().unwrap_or_default(),
            "arguments": arguments,
        }
    })
}
