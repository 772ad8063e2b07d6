//! LLM-backed narrative enrichment of analyzed coredumps
//!
//! Sends a structured prompt to a chat-completion provider, subject to
//! controller arbitration and a local cost ledger. Failures never
//! propagate: every outcome is folded into the AIAnalysisResult, and
//! the rule-based analysis is preserved untouched.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::AIAnalysisConfig;
use crate::controller::ControllerClient;
use crate::models::{AIAnalysisResult, AnalysisResults, CodeSuggestion, CoredumpFile};
use crate::observability::StructuredLogger;

/// Stack trace tail is cut beyond this many characters
const MAX_STACK_TRACE_CHARS: usize = 3000;
/// Shared libraries listed in the prompt
const MAX_PROMPT_LIBRARIES: usize = 10;
/// Registers worth showing to the model
const KEY_REGISTERS: &[&str] = &["rip", "rsp", "rbp", "rax", "rcx", "rdx"];

/// Chat-completion provider dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Glm,
    OpenAi,
}

impl Provider {
    pub fn from_name(name: &str) -> Self {
        match name {
            "openai" => Provider::OpenAi,
            _ => Provider::Glm,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Glm => "glm",
            Provider::OpenAi => "openai",
        }
    }

    /// Contract placeholder: a single blended USD rate per 1k tokens
    pub fn price_per_thousand_tokens(&self) -> f64 {
        match self {
            Provider::Glm => 0.045,
            Provider::OpenAi => 0.045,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: i64,
}

/// Fields the model is asked to return as JSON
#[derive(Debug, Default, Deserialize)]
struct ParsedAiResponse {
    #[serde(default)]
    summary: String,
    #[serde(default, rename = "rootCause")]
    root_cause: String,
    #[serde(default)]
    impact: String,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default, rename = "relatedIssues")]
    related_issues: Vec<String>,
    #[serde(default, rename = "codeSuggestions")]
    code_suggestions: Vec<CodeSuggestion>,
}

/// Local second line of defence when the controller is not arbitrating
#[derive(Debug, Default)]
struct CostLedger {
    monthly_usage: f64,
    hourly_count: u32,
    last_hour_reset: Option<Instant>,
}

/// LLM analyzer with cost arbitration
pub struct AiAnalyzer {
    config: AIAnalysisConfig,
    api_key: String,
    provider: Provider,
    http: reqwest::Client,
    controller: Option<Arc<ControllerClient>>,
    ledger: Mutex<CostLedger>,
    logger: StructuredLogger,
}

impl AiAnalyzer {
    /// Build the analyzer; `None` when AI analysis is not configured
    pub fn new(
        config: AIAnalysisConfig,
        controller: Option<Arc<ControllerClient>>,
        logger: StructuredLogger,
    ) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let Some(api_key) = config.resolve_api_key() else {
            bail!("AI analysis enabled but no API key provided");
        };
        if config.base_url.is_empty() {
            bail!("AI analysis enabled but no base URL provided");
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build AI HTTP client")?;

        let provider = Provider::from_name(&config.provider);
        debug!(provider = provider.name(), base_url = %config.base_url, "AI analyzer ready");

        Ok(Some(Self {
            config,
            api_key,
            provider,
            http,
            controller,
            ledger: Mutex::new(CostLedger::default()),
            logger,
        }))
    }

    /// Estimated cost of one analysis, derived from the prompt length
    pub fn estimate_cost(&self, prompt: &str) -> f64 {
        let estimated_tokens = prompt.len() as f64 / 4.0 + self.config.max_tokens as f64;
        estimated_tokens / 1000.0 * self.provider.price_per_thousand_tokens()
    }

    /// Analyze one dump; the result always carries provider metadata
    pub async fn analyze(
        &self,
        file: &CoredumpFile,
        results: &AnalysisResults,
        value_score: f64,
    ) -> AIAnalysisResult {
        let prompt = build_analysis_prompt(file, results);
        let estimated_cost = self.estimate_cost(&prompt);

        if let Some(denial) = self.arbitrate(file, value_score, estimated_cost).await {
            self.logger.log_ai_denied(&file.path, &denial);
            return self.denied_result(denial);
        }

        let started = Utc::now();
        let response = match self.call_provider(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %file.path, error = %e, "AI provider call failed");
                return self.denied_result(format!("API error: {}", e));
            }
        };

        let Some(choice) = response.choices.first() else {
            return self.denied_result("No response from AI model".to_string());
        };

        let mut analysis = match parse_ai_response(&choice.message.content) {
            Ok(parsed) => AIAnalysisResult {
                summary: parsed.summary,
                root_cause: parsed.root_cause,
                impact: parsed.impact,
                recommendations: parsed.recommendations,
                confidence: parsed.confidence,
                related_issues: parsed.related_issues,
                code_suggestions: parsed.code_suggestions,
                ..Default::default()
            },
            Err(e) => {
                // Fall back to the raw text rather than losing the answer
                warn!(path = %file.path, error = %e, "Failed to parse AI response");
                AIAnalysisResult {
                    summary: choice.message.content.clone(),
                    ..Default::default()
                }
            }
        };

        analysis.enabled = true;
        analysis.provider = self.config.provider.clone();
        analysis.model = self.config.model.clone();
        analysis.analysis_time = Some(started);
        analysis.tokens_used = response.usage.total_tokens;
        analysis.cost_usd = response.usage.total_tokens as f64 / 1000.0
            * self.provider.price_per_thousand_tokens();

        self.record_usage(analysis.cost_usd);
        self.logger.log_ai_analysis(
            &file.path,
            analysis.tokens_used,
            analysis.cost_usd,
            analysis.confidence,
        );

        analysis
    }

    /// Controller arbitration, falling back to the local ledger.
    /// Returns the denial reason, or None when the call may proceed.
    async fn arbitrate(
        &self,
        file: &CoredumpFile,
        value_score: f64,
        estimated_cost: f64,
    ) -> Option<String> {
        if let Some(controller) = &self.controller {
            return match controller
                .request_ai_analysis(&file.path, value_score, estimated_cost, "medium")
                .await
            {
                Ok(response) if response.allowed => None,
                Ok(response) => Some(response.reason),
                Err(e) => {
                    warn!(path = %file.path, error = %e, "Controller unreachable for AI arbitration");
                    Some("controller unreachable".to_string())
                }
            };
        }

        if !self.check_local_limits(estimated_cost) {
            return Some("Analysis skipped due to cost control limits".to_string());
        }
        None
    }

    fn check_local_limits(&self, estimated_cost: f64) -> bool {
        if !self.config.enable_cost_control {
            return true;
        }

        let mut ledger = self.ledger.lock().expect("cost ledger poisoned");

        let hour_elapsed = ledger
            .last_hour_reset
            .map(|t| t.elapsed().as_secs() > 3600)
            .unwrap_or(false);
        if hour_elapsed || ledger.last_hour_reset.is_none() {
            ledger.hourly_count = 0;
            ledger.last_hour_reset = Some(Instant::now());
        }

        if ledger.hourly_count >= self.config.max_analysis_per_hour {
            return false;
        }
        if ledger.monthly_usage + estimated_cost > self.config.max_cost_per_month {
            return false;
        }

        true
    }

    fn record_usage(&self, cost: f64) {
        if !self.config.enable_cost_control {
            return;
        }
        let mut ledger = self.ledger.lock().expect("cost ledger poisoned");
        ledger.monthly_usage += cost;
        ledger.hourly_count += 1;
    }

    fn denied_result(&self, error_message: String) -> AIAnalysisResult {
        AIAnalysisResult {
            enabled: true,
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            analysis_time: Some(Utc::now()),
            error_message,
            ..Default::default()
        }
    }

    async fn call_provider(&self, user_prompt: &str) -> Result<ChatResponse> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt().to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .http
            .post(&self.config.base_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        let body = response.text().await.context("failed to read AI response")?;
        if !status.is_success() {
            bail!("API error (status {}): {}", status, body);
        }

        serde_json::from_str(&body).context("failed to parse chat completion response")
    }
}

fn system_prompt() -> &'static str {
    r#"You are an expert system debugger specializing in analyzing coredump files and stack traces from C/C++ applications, particularly vector databases like Milvus.

Your task is to analyze the provided coredump information and provide structured insights that will help developers debug the issue.

Please respond in JSON format with the following structure:
{
  "summary": "Brief summary of the crash",
  "rootCause": "Most likely root cause of the crash",
  "impact": "Impact assessment of this crash",
  "recommendations": ["List", "of", "actionable", "recommendations"],
  "confidence": 0.85,
  "relatedIssues": ["Known similar issues or patterns"],
  "codeSuggestions": [
    {
      "file": "suspected_file.cpp",
      "function": "function_name",
      "lineNumber": 123,
      "issue": "Description of the issue",
      "suggestion": "Specific code fix suggestion",
      "priority": "high"
    }
  ]
}

Focus on:
1. Memory access violations (SIGSEGV, SIGBUS)
2. Assertion failures and abort signals (SIGABRT)
3. Threading issues and race conditions
4. Memory leaks and corruption
5. Vector database specific issues (indexing, search, data corruption)
6. Performance bottlenecks leading to crashes

Be precise and actionable in your recommendations."#
}

/// Build the user prompt from the dump and its rule-based analysis
pub fn build_analysis_prompt(file: &CoredumpFile, results: &AnalysisResults) -> String {
    let mut prompt = String::new();

    prompt.push_str("COREDUMP ANALYSIS REQUEST\n");
    prompt.push_str("========================\n\n");

    let _ = writeln!(prompt, "Application: {}", file.executable);
    let _ = writeln!(
        prompt,
        "Signal: {} ({})",
        file.signal,
        signal_name(file.signal)
    );
    let _ = writeln!(prompt, "PID: {}", file.pid);
    if !file.pod_name.is_empty() {
        let _ = writeln!(
            prompt,
            "Kubernetes Pod: {}/{}",
            file.pod_namespace, file.pod_name
        );
        let _ = writeln!(prompt, "Milvus Instance: {}", file.instance_name);
    }
    prompt.push('\n');

    if !results.crash_reason.is_empty() {
        let _ = writeln!(prompt, "Crash Reason: {}", results.crash_reason);
    }
    if !results.crash_address.is_empty() {
        let _ = writeln!(prompt, "Crash Address: {}", results.crash_address);
    }
    let _ = writeln!(prompt, "Thread Count: {}", results.thread_count);
    prompt.push('\n');

    if !results.stack_trace.is_empty() {
        prompt.push_str("STACK TRACE:\n```\n");
        if results.stack_trace.len() > MAX_STACK_TRACE_CHARS {
            prompt.push_str(&results.stack_trace[..MAX_STACK_TRACE_CHARS]);
            prompt.push_str("\n... [truncated]");
        } else {
            prompt.push_str(&results.stack_trace);
        }
        prompt.push_str("\n```\n\n");
    }

    if !results.register_info.is_empty() {
        prompt.push_str("KEY REGISTERS:\n");
        for register in KEY_REGISTERS {
            if let Some(value) = results.register_info.get(*register) {
                let _ = writeln!(prompt, "{} = {}", register, value);
            }
        }
        prompt.push('\n');
    }

    if !results.shared_libraries.is_empty() {
        prompt.push_str("LOADED LIBRARIES:\n");
        for (i, library) in results.shared_libraries.iter().enumerate() {
            if i >= MAX_PROMPT_LIBRARIES {
                prompt.push_str("... [and more]\n");
                break;
            }
            let _ = writeln!(prompt, "- {}", library);
        }
        prompt.push('\n');
    }

    prompt.push_str("Please analyze this coredump and provide structured debugging insights in JSON format.");
    prompt
}

/// Extract the outermost JSON object from a model response
fn parse_ai_response(response: &str) -> Result<ParsedAiResponse> {
    let response = response.trim();
    let start = response.find('{');
    let end = response.rfind('}');

    let (Some(start), Some(end)) = (start, end) else {
        bail!("no valid JSON found in response");
    };
    if start >= end {
        bail!("no valid JSON found in response");
    }

    serde_json::from_str(&response[start..=end]).context("failed to parse JSON")
}

/// Symbolic name for common terminating signals
pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        4 => "SIGILL".to_string(),
        6 => "SIGABRT".to_string(),
        7 => "SIGBUS".to_string(),
        8 => "SIGFPE".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        13 => "SIGPIPE".to_string(),
        14 => "SIGALRM".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("Signal {}", other),
    }
}
