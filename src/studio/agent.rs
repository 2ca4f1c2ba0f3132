use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{FileCollection, NewFragment};

pub const DEFAULT_AGENT_NAME: &str = "code-agent";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert nextjs developer. You write readable, maintainable code, you write simple next.js & react snippets";

/// Appended to the system prompt for HTTP backends so the reply can be
/// materialized into a file collection.
const RESPONSE_FORMAT_HINT: &str = r#"

Respond with JSON only, matching:
{"title": "Short name", "summary": "One paragraph about what you built", "files": {"relative/path.tsx": "file content"}}"#;

/// Identity and backend settings for one agent execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub system: String,
    pub model: String,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT_NAME.to_string(),
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Result of a single-turn agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub output: Value,
}

/// The `run(prompt) -> { output }` capability.
#[async_trait]
pub trait CodeAgent: Send + Sync {
    fn spec(&self) -> &AgentSpec;

    async fn run(&self, prompt: &str) -> Result<AgentRun>;
}

/// Builds a fresh agent for each job.
///
/// Real implementation: `GeminiProvider`. Test double: `StubProvider`.
pub trait AgentProvider: Send + Sync {
    fn create(&self, spec: &AgentSpec) -> Result<Box<dyn CodeAgent>>;
}

// ── Prompt construction ──────────────────────────────────────────────

/// Coerce a job value to the text embedded in the prompt.
///
/// Strings are embedded verbatim, numbers and booleans in their display
/// form, `null` as `null`, and objects or arrays as compact JSON.
pub fn value_to_prompt_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn format_prompt(value: &Value) -> String {
    format!(
        "Write the following snippets for : {}",
        value_to_prompt_text(value)
    )
}

// ── Gemini backend ───────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize, Debug)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

pub struct GeminiAgent {
    spec: AgentSpec,
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

#[async_trait]
impl CodeAgent for GeminiAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    async fn run(&self, prompt: &str) -> Result<AgentRun> {
        let system = format!("{}{}", self.spec.system, RESPONSE_FORMAT_HINT);
        let body = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: &system }],
            },
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
            },
        };
        let url = format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            self.spec.model
        );

        let resp: GenerateResponse = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .context("Failed to send generateContent request")?
            .error_for_status()
            .context("Model endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse generateContent response")?;

        let text: String = resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            anyhow::bail!("Model returned no content");
        }

        let output = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(AgentRun { output })
    }
}

/// Creates `GeminiAgent`s. Construction fails when no API key is set.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl GeminiProvider {
    pub fn new(api_base: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.to_string(),
            api_key,
        }
    }
}

impl AgentProvider for GeminiProvider {
    fn create(&self, spec: &AgentSpec) -> Result<Box<dyn CodeAgent>> {
        let api_key = self
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .context("No API key configured for the model backend")?;
        Ok(Box::new(GeminiAgent {
            spec: spec.clone(),
            client: self.client.clone(),
            api_base: self.api_base.clone(),
            api_key,
        }))
    }
}

// ── Stub backend ─────────────────────────────────────────────────────

/// Deterministic agent for offline mode and tests.
///
/// With no fixed output it answers every prompt with a one-page project
/// echoing the prompt.
#[derive(Clone, Default)]
pub struct StubProvider {
    output: Option<Value>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
        }
    }
}

pub struct StubAgent {
    spec: AgentSpec,
    output: Option<Value>,
}

#[async_trait]
impl CodeAgent for StubAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    async fn run(&self, prompt: &str) -> Result<AgentRun> {
        let output = match &self.output {
            Some(v) => v.clone(),
            None => serde_json::json!({
                "title": "Offline preview",
                "summary": prompt,
                "files": {
                    "app/page.tsx": format!(
                        "export default function Page() {{\n  return <main>{}</main>;\n}}\n",
                        prompt.replace('<', "&lt;")
                    ),
                    "README.md": format!("# Offline preview\n\n{}\n", prompt),
                },
            }),
        };
        Ok(AgentRun { output })
    }
}

impl AgentProvider for StubProvider {
    fn create(&self, spec: &AgentSpec) -> Result<Box<dyn CodeAgent>> {
        Ok(Box::new(StubAgent {
            spec: spec.clone(),
            output: self.output.clone(),
        }))
    }
}

// ── Output parsing ───────────────────────────────────────────────────

/// Agent output reduced to what gets persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub content: String,
    pub fragment: Option<NewFragment>,
}

const DEFAULT_RESULT_CONTENT: &str = "Here is what I built.";

pub struct OutputParser;

impl OutputParser {
    /// Reduce an arbitrary `output` value to message content and fragment.
    ///
    /// Accepted shapes, in priority order:
    /// 1. Object with `files` (and optional `url`/`sandboxUrl`, `title`, `summary`)
    /// 2. String holding such an object as JSON (possibly wrapped in prose)
    /// 3. Array of agent messages whose `content` strings are joined and re-parsed
    /// 4. Anything else becomes plain text content with no fragment
    pub fn parse(output: &Value) -> ParsedOutput {
        match output {
            Value::Object(_) => Self::parse_object(output)
                .unwrap_or_else(|| Self::plain(&value_to_prompt_text(output))),
            Value::String(text) => Self::parse_text(text),
            Value::Array(items) => {
                let text: Vec<&str> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.as_str()),
                        Value::Object(map) => map.get("content").and_then(Value::as_str),
                        _ => None,
                    })
                    .collect();
                if text.is_empty() {
                    Self::plain(&output.to_string())
                } else {
                    Self::parse_text(&text.join("\n"))
                }
            }
            other => Self::plain(&value_to_prompt_text(other)),
        }
    }

    fn plain(text: &str) -> ParsedOutput {
        ParsedOutput {
            content: text.to_string(),
            fragment: None,
        }
    }

    fn parse_text(text: &str) -> ParsedOutput {
        let trimmed = text.trim();
        let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => trimmed,
        };
        serde_json::from_str::<Value>(candidate)
            .ok()
            .and_then(|parsed| Self::parse_object(&parsed))
            .unwrap_or_else(|| Self::plain(trimmed))
    }

    fn parse_object(value: &Value) -> Option<ParsedOutput> {
        let map = value.as_object()?;
        let url = ["url", "sandboxUrl", "sandbox_url"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);

        let files: Option<FileCollection> = map.get("files").and_then(Value::as_object).map(|f| {
            f.iter()
                .map(|(path, content)| (path.as_str(), value_to_prompt_text(content)))
                .collect()
        });

        if files.is_none() && url.is_none() {
            return None;
        }

        let title = map
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Fragment")
            .to_string();
        let content = map
            .get("summary")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_RESULT_CONTENT)
            .to_string();

        Some(ParsedOutput {
            content,
            fragment: Some(NewFragment {
                sandbox_url: url,
                title,
                files: files.unwrap_or_default(),
            }),
        })
    }
}
