//! The agent that drives a `ToolBox` to completion.
//!
//! `AgentRunner` is the seam the generator depends on; `OpenAiAgent` is the
//! production implementation over OpenAI function calling.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::openai::OpenAI;
use crate::question::{GenerationError, ToolBox};
use crate::util::trunc_for_log;

const NUDGE: &str = "Do not answer with text. Continue by calling the appropriate tool.";

#[async_trait]
pub trait AgentRunner: Send + Sync {
  /// Run until the tool box reports completion or `max_steps` round trips are used up.
  async fn run(
    &self,
    system_prompt: &str,
    initial_message: &str,
    tools: &mut ToolBox,
    max_steps: usize,
  ) -> Result<(), GenerationError>;
}

pub struct OpenAiAgent {
  client: OpenAI,
  temperature: f32,
}

impl OpenAiAgent {
  pub fn new(client: OpenAI, temperature: f32) -> Self { Self { client, temperature } }
}

#[async_trait]
impl AgentRunner for OpenAiAgent {
  #[instrument(level = "info", target = "question", skip_all, fields(question_type = %tools.question_type(), max_steps = max_steps))]
  async fn run(
    &self,
    system_prompt: &str,
    initial_message: &str,
    tools: &mut ToolBox,
    max_steps: usize,
  ) -> Result<(), GenerationError> {
    let definitions = tools.definitions();
    let mut messages: Vec<Value> = vec![
      json!({ "role": "system", "content": system_prompt }),
      json!({ "role": "user", "content": initial_message }),
    ];

    for step in 1..=max_steps {
      let turn = self
        .client
        .chat_with_tools(&messages, &definitions, self.temperature)
        .await
        .map_err(GenerationError::Llm)?;
      messages.push(turn.message);

      if turn.tool_calls.is_empty() {
        let said = turn.content.as_deref().unwrap_or_default();
        warn!(target: "question", step, text = %trunc_for_log(said, 80), "Agent replied without a tool call");
        messages.push(json!({ "role": "user", "content": NUDGE }));
        continue;
      }

      for call in turn.tool_calls {
        let reply = tools.invoke(&call.name, call.arguments).await?;
        debug!(target: "question", step, tool = %call.name, finished = reply.finished, "Tool call handled");
        messages.push(json!({ "role": "tool", "tool_call_id": call.id, "content": reply.text }));
        if reply.finished {
          info!(target: "question", steps = step, "Agent finished");
          return Ok(());
        }
      }
    }

    warn!(target: "question", max_steps, "Agent step budget exhausted");
    Err(GenerationError::BudgetExhausted { steps: max_steps })
  }
}
