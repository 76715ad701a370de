//! Wire types for the OpenAI Responses dialect, including the tool-call
//! continuation surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the Responses API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponsesRequest {
    pub model: String,

    /// The input: a bare string (single user turn) or a list of items.
    pub input: ResponsesInput,

    /// System-level instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Tools in the flat Responses form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ResponsesTool>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ResponsesToolChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Responses input: a string or an ordered item list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<InputItem>),
}

/// A single input item.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    /// A conversation message.
    Message {
        role: String,
        content: ItemContent,
    },
    /// A prior assistant tool call being replayed into context.
    FunctionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        name: String,
        arguments: String,
    },
    /// The output of a tool call.
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

/// Item message content: a string or typed text parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ItemContent {
    Text(String),
    Parts(Vec<ItemContentPart>),
}

impl ItemContent {
    /// Flatten to plain text with blank-line separators.
    pub fn joined_text(&self) -> String {
        match self {
            ItemContent::Text(text) => text.clone(),
            ItemContent::Parts(parts) => {
                let texts: Vec<&str> = parts.iter().map(|part| part.text()).collect();
                texts.join("\n\n")
            }
        }
    }
}

/// A typed content part. `input_text` and `output_text` are synonyms of
/// `text` on the input side.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemContentPart {
    Text { text: String },
    InputText { text: String },
    OutputText { text: String },
}

impl ItemContentPart {
    pub fn text(&self) -> &str {
        match self {
            ItemContentPart::Text { text } | ItemContentPart::InputText { text } | ItemContentPart::OutputText { text } => {
                text
            }
        }
    }
}

/// A tool definition in the flat Responses form.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponsesTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
}

/// Tool choice: a mode keyword or a named function.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ResponsesToolChoice {
    Mode(String),
    Function {
        #[serde(rename = "type")]
        tool_type: String,
        name: String,
    },
}

/// The `response` object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Response {
    pub id: String,
    /// Always `"response"`.
    pub object: String,
    pub created_at: u64,
    pub model: String,
    pub status: ResponseStatus,
    pub output: Vec<OutputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
}

/// Lifecycle status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    /// The response is suspended on tool calls awaiting client output.
    Incomplete,
}

/// An output item. Tool calls use the flat shape, not a nested message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        id: String,
        role: String,
        status: String,
        content: Vec<OutputContent>,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        arguments: String,
        status: String,
    },
}

/// Output message content.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputContent {
    OutputText { text: String },
}

/// The action the client must take to resume a suspended response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequiredAction {
    /// Always `"submit_tool_outputs"`.
    #[serde(rename = "type")]
    pub action_type: String,
    pub submit_tool_outputs: SubmitToolOutputsAction,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitToolOutputsAction {
    pub tool_calls: Vec<RequiredToolCall>,
}

/// One tool call enumerated by a required action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequiredToolCall {
    pub id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// Token usage in Responses vocabulary.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ResponsesUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// Request body for tool output submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitToolOutputsRequest {
    pub tool_outputs: Vec<ToolOutput>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Streaming events for the Responses dialect.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ResponsesStreamEvent {
    #[serde(rename = "response.created")]
    Created { response: Response },

    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { output_index: usize, item: OutputItem },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { output_index: usize, delta: String },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone { output_index: usize, arguments: String },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { output_index: usize, item: OutputItem },

    #[serde(rename = "response.required_action")]
    RequiredAction { required_action: RequiredAction },

    #[serde(rename = "response.completed")]
    Completed { response: Response },
}

impl ResponsesStreamEvent {
    /// The SSE `event:` name for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            ResponsesStreamEvent::Created { .. } => "response.created",
            ResponsesStreamEvent::OutputTextDelta { .. } => "response.output_text.delta",
            ResponsesStreamEvent::OutputItemAdded { .. } => "response.output_item.added",
            ResponsesStreamEvent::FunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            ResponsesStreamEvent::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            ResponsesStreamEvent::OutputItemDone { .. } => "response.output_item.done",
            ResponsesStreamEvent::RequiredAction { .. } => "response.required_action",
            ResponsesStreamEvent::Completed { .. } => "response.completed",
        }
    }
}
