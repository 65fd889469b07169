use std::sync::Arc;

use serde_json::{json, Value};

use super::ToolExecutor;
use crate::core::error::{ToolInvocationError, TriageError};
use crate::core::ports::tools::{Observation, ToolDefinition, ToolFuture};

const QUERY_TOOL: &str = "query_prometheus";
const CPU_TOOL: &str = "pod_cpu_usage";
const MAX_SERIES: usize = 20;

/// Thin client for the Prometheus instant-query HTTP API.
pub struct PrometheusClient {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: &str) -> Result<Self, TriageError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(TriageError::Config("prometheus_url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TriageError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    /// Returns the `data` object of a successful response.
    pub async fn instant_query(&self, tool: &str, promql: &str) -> Result<Value, ToolInvocationError> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(|e| ToolInvocationError::failed(tool, format!("prometheus unreachable: {e}"), true))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let detail = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no error detail")
                .to_string();
            let retriable = status.is_server_error() || status.as_u16() == 429;
            return Err(ToolInvocationError::failed(
                tool,
                format!("prometheus returned {status}: {detail}"),
                retriable,
            ));
        }

        match body.get("status").and_then(Value::as_str) {
            Some("success") => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
            _ => Err(ToolInvocationError::failed(
                tool,
                format!(
                    "prometheus query failed: {}",
                    body.get("error").and_then(Value::as_str).unwrap_or("malformed response")
                ),
                false,
            )),
        }
    }
}

/// Renders an instant-query `data` object as one line per series.
pub(super) fn summarize_result(data: &Value) -> String {
    let result_type = data.get("resultType").and_then(Value::as_str).unwrap_or("unknown");
    let series = match (result_type, data.get("result")) {
        ("scalar" | "string", Some(sample)) => {
            return format!("{result_type}: {}", sample_value(sample));
        }
        (_, Some(Value::Array(series))) if !series.is_empty() => series,
        _ => return "Query returned no series.".to_string(),
    };

    let mut lines: Vec<String> = series
        .iter()
        .take(MAX_SERIES)
        .map(|entry| {
            let labels = entry
                .get("metric")
                .and_then(Value::as_object)
                .map(|metric| {
                    metric
                        .iter()
                        .map(|(k, v)| format!("{k}=\"{}\"", v.as_str().unwrap_or_default()))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            let value = entry
                .get("value")
                .map(sample_value)
                .unwrap_or_else(|| "n/a".to_string());
            format!("{{{labels}}} => {value}")
        })
        .collect();
    if series.len() > MAX_SERIES {
        lines.push(format!("... {} more series", series.len() - MAX_SERIES));
    }
    lines.join("\n")
}

/// A sample is `[timestamp, "value"]`.
fn sample_value(sample: &Value) -> String {
    sample
        .get(1)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| sample.to_string())
}

pub struct QueryPrometheusTool {
    definition: ToolDefinition,
    client: Arc<PrometheusClient>,
}

impl QueryPrometheusTool {
    pub fn new(client: Arc<PrometheusClient>) -> Self {
        Self {
            definition: ToolDefinition {
                name: QUERY_TOOL.to_string(),
                description: "Use this when you need a live metric that no narrower tool covers. Runs a PromQL instant query and returns one line per series with its labels and current value. Errors: invalid PromQL is reported and not retried. Edge cases: 'Query returned no series.' means the selector matched nothing; check label names."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "minLength": 1, "description": "PromQL expression" }
                    },
                    "required": ["query"],
                    "additionalProperties": false
                }),
            },
            client,
        }
    }
}

impl ToolExecutor for QueryPrometheusTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn execute<'a>(&'a self, input: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let query = input.get("query").and_then(Value::as_str).unwrap_or_default();
            let data = self.client.instant_query(QUERY_TOOL, query).await?;
            Ok(Observation {
                summary: summarize_result(&data),
                data,
            })
        })
    }
}

pub(super) fn cpu_usage_query(pod: &str, namespace: Option<&str>, window: &str) -> String {
    let mut selector = format!("pod=\"{}\", container!=\"\"", escape_label(pod));
    if let Some(namespace) = namespace {
        selector.push_str(&format!(", namespace=\"{}\"", escape_label(namespace)));
    }
    format!("sum by (pod, container) (rate(container_cpu_usage_seconds_total{{{selector}}}[{window}]))")
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub struct PodCpuUsageTool {
    definition: ToolDefinition,
    client: Arc<PrometheusClient>,
}

impl PodCpuUsageTool {
    pub fn new(client: Arc<PrometheusClient>) -> Self {
        Self {
            definition: ToolDefinition {
                name: CPU_TOOL.to_string(),
                description: "Use this when an alert concerns CPU saturation or throttling of a pod. Returns per-container CPU usage in cores averaged over the window (default 5m). Edge cases: no series usually means the pod name or namespace is wrong or the pod has restarted under a new name."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "pod": { "type": "string", "minLength": 1 },
                        "namespace": { "type": "string", "minLength": 1 },
                        "window": { "type": "string", "pattern": "^[0-9]+[smhd]$" }
                    },
                    "required": ["pod"],
                    "additionalProperties": false
                }),
            },
            client,
        }
    }
}

impl ToolExecutor for PodCpuUsageTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn execute<'a>(&'a self, input: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let pod = input.get("pod").and_then(Value::as_str).unwrap_or_default();
            let namespace = input.get("namespace").and_then(Value::as_str);
            let window = input.get("window").and_then(Value::as_str).unwrap_or("5m");
            let promql = cpu_usage_query(pod, namespace, window);
            let data = self.client.instant_query(CPU_TOOL, &promql).await?;
            Ok(Observation {
                summary: format!("CPU cores over {window}:\n{}", summarize_result(&data)),
                data: json!({ "query": promql, "result": data }),
            })
        })
    }
}
