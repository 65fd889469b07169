mod prompt;
mod react;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::config::{EndpointSettings, OracleBackend, OracleSettings};
use crate::core::error::{OracleError, TriageError};
use crate::core::ports::oracle::{Decision, OracleContext, OraclePort};

/// How the backend expresses its next action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleProtocol {
    /// Chat-completions `tools` / `tool_calls`.
    Native,
    /// Plain text in the Thought / Action / Final Answer format.
    React,
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<&'static str>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// OpenAI-compatible chat-completions client serving as the reasoning oracle,
/// for both hosted APIs and locally served fine-tuned models.
pub struct ChatOracle {
    client: reqwest::Client,
    backend: String,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    protocol: OracleProtocol,
}

impl ChatOracle {
    pub fn new(
        label: &str,
        settings: &EndpointSettings,
        api_key: Option<String>,
        protocol: OracleProtocol,
    ) -> Result<Self, TriageError> {
        if settings.model.trim().is_empty() {
            return Err(TriageError::Config(format!("oracle model for '{label}' is empty")));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TriageError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            backend: format!("{label}:{}", settings.model.trim()),
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            model: settings.model.trim().to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens.max(1),
            protocol,
        })
    }

    fn request_body(&self, context: &OracleContext<'_>) -> ChatCompletionsRequest<'_> {
        match self.protocol {
            OracleProtocol::Native => ChatCompletionsRequest {
                model: &self.model,
                messages: prompt::native_messages(context),
                // Withholding tools forces a textual final answer.
                tools: (!context.must_conclude && !context.tools.is_empty())
                    .then(|| prompt::native_tools(context.tools)),
                stop: None,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                stream: false,
            },
            OracleProtocol::React => ChatCompletionsRequest {
                model: &self.model,
                messages: prompt::react_messages(context),
                tools: None,
                stop: Some(vec!["\nObservation:"]),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                stream: false,
            },
        }
    }

    async fn complete(
        &self,
        body: &ChatCompletionsRequest<'_>,
        timeout: Duration,
    ) -> Result<ResponseMessage, OracleError> {
        let mut request = self.client.post(&self.endpoint).timeout(timeout).json(body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| classify_transport(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Provider {
                status: status.as_u16(),
                message: body.chars().take(500).collect(),
            });
        }

        let parsed = response
            .json::<ChatCompletionsResponse>()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    classify_transport(&e, timeout)
                } else {
                    OracleError::Malformed(e.to_string())
                }
            })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| OracleError::Malformed("response has no choices".to_string()))
    }
}

fn classify_transport(error: &reqwest::Error, timeout: Duration) -> OracleError {
    if error.is_timeout() {
        OracleError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        OracleError::Transport(error.to_string())
    }
}

/// Several tool calls in one reply are cut down to the first.
fn decide_native(message: ResponseMessage, context: &OracleContext<'_>) -> Decision {
    let content = message
        .content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    if let Some(call) = message.tool_calls.and_then(|calls| calls.into_iter().next()) {
        let arguments = if call.function.arguments.trim().is_empty() {
            "{}"
        } else {
            call.function.arguments.as_str()
        };
        return match serde_json::from_str::<Value>(arguments) {
            Ok(input) => Decision::ToolCall {
                thought: content.map(str::to_string),
                tool: call.function.name,
                input,
            },
            Err(e) => Decision::Unparsed {
                raw: call.function.arguments,
                reason: format!("tool arguments are not valid JSON: {e}"),
            },
        };
    }

    match content {
        Some(text) if text.contains("Final Answer:") || text.contains("Action:") => {
            react::parse_react(text, context.tools)
        }
        Some(text) => Decision::FinalAnswer {
            thought: None,
            conclusion: react::parse_conclusion(text),
        },
        None => Decision::Unparsed {
            raw: String::new(),
            reason: "empty reply".to_string(),
        },
    }
}

fn decide_react(message: ResponseMessage, context: &OracleContext<'_>) -> Decision {
    let text = message.content.unwrap_or_default();
    let decision = react::parse_react(&text, context.tools);
    // Told to conclude, a bare answer without the marker still counts.
    match decision {
        Decision::Unparsed { .. } if context.must_conclude && !text.trim().is_empty() => {
            Decision::FinalAnswer {
                thought: None,
                conclusion: react::parse_conclusion(&text),
            }
        }
        other => other,
    }
}

impl OraclePort for ChatOracle {
    fn backend(&self) -> &str {
        &self.backend
    }

    fn reason<'a>(
        &'a self,
        context: OracleContext<'a>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Decision, OracleError>> {
        Box::pin(async move {
            let body = self.request_body(&context);
            let message = self.complete(&body, timeout).await?;
            Ok(match self.protocol {
                OracleProtocol::Native => decide_native(message, &context),
                OracleProtocol::React => decide_react(message, &context),
            })
        })
    }
}

/// The hosted backend speaks native tool calling; the locally served
/// fine-tuned model was trained on the ReAct text format.
pub fn build_oracle(
    settings: &OracleSettings,
    api_key: Option<String>,
) -> Result<Arc<dyn OraclePort>, TriageError> {
    let (label, protocol) = match settings.backend {
        OracleBackend::Hosted => ("hosted", OracleProtocol::Native),
        OracleBackend::Local => ("local", OracleProtocol::React),
    };
    Ok(Arc::new(ChatOracle::new(
        label,
        settings.active_endpoint(),
        api_key,
        protocol,
    )?))
}
