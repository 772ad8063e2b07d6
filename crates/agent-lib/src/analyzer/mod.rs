//! Coredump analysis: debugger evidence extraction and value scoring
//!
//! Each discovered file is analyzed in its own task. GDB runs with a
//! fixed batch script under a deadline; when it is disabled or fails the
//! analyzer falls back to a basic signal-only analysis. The value score
//! is a pure function of the analysis results and the file metadata.

pub mod ai;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::AnalyzerConfig;
use crate::health::{PipelineHealth, Stage};
use crate::models::{
    AnalysisEvent, AnalysisResults, CollectionEvent, CoredumpFile, FileStatus, MemoryInfo,
};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::persistence::{CoredumpStore, Database};

use ai::AiAnalyzer;

/// Capacity of the analysis event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Files above this size are skipped outright
const MAX_ANALYZABLE_SIZE: i64 = 2 * 1024 * 1024 * 1024;
/// Files older than this are skipped
const MAX_ANALYZABLE_AGE: chrono::Duration = chrono::Duration::hours(24);

/// Batch script fed to gdb on stdin; section markers drive the parser
const GDB_SCRIPT: &str = "\
set pagination off
set logging file /dev/stdout
set logging on

echo =====BACKTRACE=====\\n
bt full
echo =====REGISTERS=====\\n
info registers
echo =====THREADS=====\\n
info threads
bt
echo =====MEMORY=====\\n
info proc mappings
echo =====SHARED_LIBS=====\\n
info sharedlibrary
echo =====END=====\\n
quit
";

fn hex_literal_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").expect("invalid regex"))
}

fn from_file_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"from '([^']+)'").expect("invalid regex"))
}

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("invalid regex"))
}

/// One scoring dimension with its contribution
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEntry {
    pub dimension: &'static str,
    pub points: f64,
    pub detail: String,
}

/// Deterministic breakdown of one value score computation
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub entries: Vec<ScoreEntry>,
    pub total: f64,
}

impl ScoreBreakdown {
    /// Stable, log-friendly rendering of the breakdown
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: +{:.1} ({})", e.dimension, e.points, e.detail))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Compute the value score for an analyzed dump
///
/// Pure function of its inputs; `now` is the analysis time and only
/// feeds the freshness dimension. The sum is clamped to 10.0 and AI
/// analysis never contributes.
pub fn compute_value_score(
    file: &CoredumpFile,
    results: &AnalysisResults,
    panic_keywords: &[String],
    now: DateTime<Utc>,
) -> ScoreBreakdown {
    let mut entries = vec![ScoreEntry {
        dimension: "base",
        points: 4.0,
        detail: "always".to_string(),
    }];

    if !results.crash_reason.is_empty() {
        entries.push(ScoreEntry {
            dimension: "crash_reason",
            points: 2.0,
            detail: results.crash_reason.clone(),
        });

        let reason_lower = results.crash_reason.to_lowercase();
        for keyword in panic_keywords {
            if reason_lower.contains(&keyword.to_lowercase()) {
                entries.push(ScoreEntry {
                    dimension: "panic_keyword",
                    points: 1.0,
                    detail: keyword.clone(),
                });
                break;
            }
        }
    }

    if results.stack_trace.len() > 100 {
        entries.push(ScoreEntry {
            dimension: "stack_trace",
            points: 1.5,
            detail: format!("{} chars", results.stack_trace.len()),
        });
    }

    if results.thread_count > 1 {
        entries.push(ScoreEntry {
            dimension: "multi_thread",
            points: 0.5,
            detail: format!("{} threads", results.thread_count),
        });
    }

    if file.has_pod_association() {
        entries.push(ScoreEntry {
            dimension: "pod_association",
            points: 1.0,
            detail: format!("{}/{}", file.pod_name, file.instance_name),
        });
    }

    if file.signal == 11 || file.signal == 6 || file.signal == 8 {
        entries.push(ScoreEntry {
            dimension: "signal_severity",
            points: 1.0,
            detail: format!("signal {}", file.signal),
        });
    }

    if file.size > 100 * 1024 * 1024 {
        entries.push(ScoreEntry {
            dimension: "file_size",
            points: 0.5,
            detail: format!("{:.1}MB", file.size as f64 / 1024.0 / 1024.0),
        });
    }

    if now - file.mod_time < chrono::Duration::hours(1) {
        entries.push(ScoreEntry {
            dimension: "freshness",
            points: 0.5,
            detail: "under an hour old".to_string(),
        });
    }

    let total = entries.iter().map(|e| e.points).sum::<f64>().min(10.0);
    ScoreBreakdown { entries, total }
}

/// Analyzes coredump files flowing out of the collector
pub struct Analyzer {
    config: AnalyzerConfig,
    event_tx: mpsc::Sender<AnalysisEvent>,
    ai: Option<AiAnalyzer>,
    db: Option<Arc<Database>>,
    health: PipelineHealth,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Analyzer {
    pub fn new(
        config: AnalyzerConfig,
        ai: Option<AiAnalyzer>,
        db: Option<Arc<Database>>,
        health: PipelineHealth,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> (Arc<Self>, mpsc::Receiver<AnalysisEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                config,
                event_tx,
                ai,
                db,
                health,
                metrics,
                logger,
            }),
            event_rx,
        )
    }

    /// Dispatch loop: every discovered file gets its own task
    pub async fn run(
        self: Arc<Self>,
        mut collection_rx: mpsc::Receiver<CollectionEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            gdb_enabled = self.config.enable_gdb_analysis,
            ai_enabled = self.ai.is_some(),
            "Starting coredump analyzer"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down analyzer");
                    break;
                }
                event = collection_rx.recv() => {
                    match event {
                        Some(CollectionEvent::FileDiscovered { file }) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.analyze_file(*file).await;
                            });
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    }

    pub async fn analyze_file(&self, mut file: CoredumpFile) {
        debug!(path = %file.path, "Analyzing coredump file");
        let started = std::time::Instant::now();
        self.metrics.inc_analysis_total();

        if let Some(reason) = self.skip_reason(&file, Utc::now()) {
            debug!(path = %file.path, reason = %reason, "Skipping analysis");
            self.metrics.inc_coredumps_skipped();
            file.status = FileStatus::Skipped;
            file.updated_at = Utc::now();
            self.persist(&file);
            self.send_event(AnalysisEvent::AnalysisSkipped {
                file: Box::new(file),
            });
            return;
        }

        file.status = FileStatus::Processing;
        file.updated_at = Utc::now();

        let analysis = if self.config.enable_gdb_analysis {
            match self.analyze_with_gdb(&file).await {
                Ok(results) => {
                    self.health.mark_running(Stage::Analyzer).await;
                    Ok(results)
                }
                Err(e) => {
                    // A stalled or missing debugger degrades to the basic path
                    warn!(path = %file.path, error = %e, "GDB analysis failed, falling back");
                    self.health
                        .mark_degraded(
                            Stage::Analyzer,
                            format!("debugger unavailable, using basic analysis: {}", e),
                        )
                        .await;
                    self.basic_analysis(&file).await
                }
            }
        } else {
            self.basic_analysis(&file).await
        };

        let mut results = match analysis {
            Ok(results) => results,
            Err(e) => {
                warn!(path = %file.path, error = %e, "Failed to analyze coredump");
                self.metrics.inc_analysis_failed();
                self.metrics.inc_coredumps_errors();
                file.status = FileStatus::Error;
                file.error_message = e.to_string();
                file.updated_at = Utc::now();
                self.persist(&file);
                self.send_event(AnalysisEvent::AnalysisError {
                    file: Box::new(file),
                    error: e.to_string(),
                });
                return;
            }
        };

        let now = Utc::now();
        let breakdown = compute_value_score(&file, &results, &self.config.panic_keywords, now);
        self.logger
            .log_score_breakdown(&file.path, &breakdown.describe(), breakdown.total);

        if let Some(ai) = &self.ai {
            let ai_result = ai.analyze(&file, &results, breakdown.total).await;
            results.ai_analysis = Some(ai_result);
        }

        file.analysis_results = Some(results);
        file.value_score = breakdown.total;
        file.is_analyzed = true;
        file.analysis_time = Some(now);
        file.status = FileStatus::Analyzed;
        file.updated_at = now;

        info!(path = %file.path, score = file.value_score, "Analysis complete");
        self.metrics.inc_analysis_successful();
        self.metrics.inc_coredumps_processed();
        self.metrics.observe_value_score(file.value_score);
        self.metrics
            .observe_analysis_duration(started.elapsed().as_secs_f64());

        self.persist(&file);
        self.send_event(AnalysisEvent::AnalysisComplete {
            file: Box::new(file),
        });
    }

    /// First matching skip condition, if any
    pub fn skip_reason(&self, file: &CoredumpFile, now: DateTime<Utc>) -> Option<String> {
        if !file.container_name.is_empty() {
            for pattern in &self.config.ignore_patterns {
                if file.container_name.contains(pattern) {
                    return Some(format!("container matches ignore pattern '{}'", pattern));
                }
            }
        }

        if file.size > MAX_ANALYZABLE_SIZE {
            return Some(format!("file too large ({} bytes)", file.size));
        }

        if now - file.mod_time > MAX_ANALYZABLE_AGE {
            return Some("file older than 24h".to_string());
        }

        None
    }

    async fn analyze_with_gdb(&self, file: &CoredumpFile) -> Result<AnalysisResults> {
        let mut child = Command::new("gdb")
            .args(["-batch", "-x", "-"])
            .arg(&file.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn gdb")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(GDB_SCRIPT.as_bytes())
                .await
                .context("failed to write gdb script")?;
        }

        let output = tokio::time::timeout(self.config.gdb_timeout(), child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("gdb timed out after {:?}", self.config.gdb_timeout()))?
            .context("gdb execution failed")?;

        if !output.status.success() {
            bail!("gdb exited with status {}", output.status);
        }

        Ok(parse_gdb_output(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Signal-only analysis used when the debugger is unavailable
    async fn basic_analysis(&self, file: &CoredumpFile) -> Result<AnalysisResults> {
        let mut results = AnalysisResults {
            crash_reason: infer_crash_reason_from_signal(file.signal),
            thread_count: 1,
            ..Default::default()
        };

        if let Ok(output) = Command::new("file").arg(&file.path).output().await {
            let text = String::from_utf8_lossy(&output.stdout);
            if text.contains("from") {
                if let Some(caps) = from_file_pattern().captures(&text) {
                    results.crash_address = caps[1].to_string();
                }
            }
        }

        Ok(results)
    }

    fn persist(&self, file: &CoredumpFile) {
        if let Some(db) = &self.db {
            if let Err(e) = CoredumpStore::new(db).save(file) {
                warn!(path = %file.path, error = %e, "Failed to persist coredump record");
            }
        }
    }

    fn send_event(&self, event: AnalysisEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Analysis event channel is full, dropping event");
        }
    }
}

/// Split gdb output into its `=====NAME=====` sections
pub fn split_gdb_output(output: &str) -> HashMap<String, String> {
    let mut sections = HashMap::new();
    let mut current: Option<String> = None;
    let mut content: Vec<&str> = Vec::new();

    for line in output.lines() {
        if line.starts_with("=====") && line.ends_with("=====") {
            if let Some(section) = current.take() {
                sections.insert(section, content.join("\n"));
            }
            current = Some(line.trim_matches('=').to_string());
            content.clear();
        } else if current.is_some() {
            content.push(line);
        }
    }

    if let Some(section) = current {
        sections.insert(section, content.join("\n"));
    }

    sections
}

/// Assemble structured results from raw gdb output
pub fn parse_gdb_output(output: &str) -> AnalysisResults {
    let sections = split_gdb_output(output);
    let mut results = AnalysisResults::default();

    if let Some(backtrace) = sections.get("BACKTRACE") {
        results.stack_trace = backtrace.clone();
        results.crash_reason = extract_crash_reason(backtrace);
        results.crash_address = extract_crash_address(backtrace);
    }

    if let Some(registers) = sections.get("REGISTERS") {
        results.register_info = parse_register_info(registers);
    }

    if let Some(threads) = sections.get("THREADS") {
        results.thread_count = count_threads(threads);
    }

    if let Some(memory) = sections.get("MEMORY") {
        results.memory_info = parse_memory_info(memory);
    }

    if let Some(shared_libs) = sections.get("SHARED_LIBS") {
        results.shared_libraries = parse_shared_libraries(shared_libs);
    }

    results
}

/// First matching crash token wins
pub fn extract_crash_reason(backtrace: &str) -> String {
    for line in backtrace.lines() {
        let line = line.trim();
        if line.contains("SIGSEGV") {
            return "Segmentation fault (SIGSEGV)".to_string();
        }
        if line.contains("SIGABRT") {
            return "Abort signal (SIGABRT)".to_string();
        }
        if line.contains("SIGFPE") {
            return "Floating point exception (SIGFPE)".to_string();
        }
        if line.contains("assert") {
            return "Assertion failure".to_string();
        }
    }
    "Unknown crash reason".to_string()
}

/// First hexadecimal literal in the backtrace
pub fn extract_crash_address(backtrace: &str) -> String {
    hex_literal_pattern()
        .find(backtrace)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Parse `info registers` output into a name/value map
///
/// GDB prints `name  0xhex  decimal` columns; `name = value` lines from
/// annotated output are accepted too.
pub fn parse_register_info(registers: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for line in registers.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some((name, value)) = line.split_once('=') {
            map.insert(name.trim().to_string(), value.trim().to_string());
            continue;
        }

        let mut fields = line.split_whitespace();
        if let (Some(name), Some(value)) = (fields.next(), fields.next()) {
            if value.starts_with("0x") {
                map.insert(name.to_string(), value.to_string());
            }
        }
    }

    map
}

/// Count thread lines, never reporting fewer than one
pub fn count_threads(threads: &str) -> i32 {
    let count = threads.lines().filter(|l| l.contains("Thread")).count() as i32;
    count.max(1)
}

fn parse_memory_info(memory: &str) -> MemoryInfo {
    let mut info = MemoryInfo::default();

    for line in memory.lines() {
        if line.contains("heap") {
            if let Some(size) = extract_first_number(line) {
                info.heap_size = size;
            }
        }
        if line.contains("stack") {
            if let Some(size) = extract_first_number(line) {
                info.stack_size = size;
            }
        }
    }

    info
}

fn parse_shared_libraries(shared_libs: &str) -> Vec<String> {
    shared_libs
        .lines()
        .filter(|line| line.contains(".so"))
        .filter_map(|line| line.split_whitespace().last())
        .map(String::from)
        .collect()
}

/// Map a terminating signal to a crash reason string
pub fn infer_crash_reason_from_signal(signal: i32) -> String {
    match signal {
        11 => "Segmentation fault (SIGSEGV)".to_string(),
        6 => "Abort signal (SIGABRT)".to_string(),
        8 => "Floating point exception (SIGFPE)".to_string(),
        4 => "Illegal instruction (SIGILL)".to_string(),
        7 => "Bus error (SIGBUS)".to_string(),
        other => format!("Signal {}", other),
    }
}

fn extract_first_number(line: &str) -> Option<i64> {
    number_pattern()
        .find(line)
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_coredump_file;

    fn default_keywords() -> Vec<String> {
        AnalyzerConfig::default().panic_keywords
    }

    const SAMPLE_GDB_OUTPUT: &str = "\
=====BACKTRACE=====
Program terminated with signal SIGSEGV, Segmentation fault.
#0  0x00007f3a2c4b5e10 in faiss::IndexFlat::search () from /usr/lib/libfaiss.so
#1  0x00007f3a2c4b6000 in milvus::query::SearchOnSealed ()
#2  0x00007f3a2c4b7123 in milvus::segcore::SegmentSealedImpl::vector_search ()
=====REGISTERS=====
rip            0x7f3a2c4b5e10      0x7f3a2c4b5e10
rsp            0x7ffd1c000000      0x7ffd1c000000
rax            0x0                 0
=====THREADS=====
  Id   Target Id         Frame
* 1    Thread 0x7f3a2d000700 (LWP 100) 0x7f3a2c4b5e10
  2    Thread 0x7f3a2c800700 (LWP 101) futex_wait
  3    Thread 0x7f3a2c000700 (LWP 102) epoll_wait
=====MEMORY=====
0x555555554000 0x555555558000 [heap] 16384
0x7ffd1b000000 0x7ffd1c000000 [stack] 1048576
=====SHARED_LIBS=====
0x00007f3a2c400000  0x00007f3a2c600000  Yes  /usr/lib/libfaiss.so
0x00007f3a2c700000  0x00007f3a2c800000  Yes  /usr/lib/libstdc++.so.6
=====END=====
";

    #[test]
    fn test_split_sections() {
        let sections = split_gdb_output(SAMPLE_GDB_OUTPUT);
        assert!(sections.contains_key("BACKTRACE"));
        assert!(sections.contains_key("REGISTERS"));
        assert!(sections.contains_key("THREADS"));
        assert!(sections.contains_key("MEMORY"));
        assert!(sections.contains_key("SHARED_LIBS"));
    }

    #[test]
    fn test_parse_full_output() {
        let results = parse_gdb_output(SAMPLE_GDB_OUTPUT);
        assert_eq!(results.crash_reason, "Segmentation fault (SIGSEGV)");
        assert_eq!(results.crash_address, "0x00007f3a2c4b5e10");
        assert_eq!(results.thread_count, 3);
        assert_eq!(results.register_info["rip"], "0x7f3a2c4b5e10");
        assert_eq!(
            results.shared_libraries,
            vec!["/usr/lib/libfaiss.so", "/usr/lib/libstdc++.so.6"]
        );
        assert_eq!(results.memory_info.heap_size, 16384);
        assert_eq!(results.memory_info.stack_size, 1048576);
    }

    #[test]
    fn test_crash_reason_first_match_wins() {
        let trace = "line with SIGABRT\nline with SIGSEGV";
        assert_eq!(extract_crash_reason(trace), "Abort signal (SIGABRT)");

        assert_eq!(
            extract_crash_reason("assert failed: idx < size()"),
            "Assertion failure"
        );
        assert_eq!(extract_crash_reason("nothing here"), "Unknown crash reason");
    }

    #[test]
    fn test_thread_count_minimum_is_one() {
        assert_eq!(count_threads(""), 1);
        assert_eq!(count_threads("no threads mentioned"), 1);
        assert_eq!(count_threads("Thread 1\nThread 2"), 2);
    }

    #[test]
    fn test_signal_inference() {
        assert_eq!(
            infer_crash_reason_from_signal(11),
            "Segmentation fault (SIGSEGV)"
        );
        assert_eq!(infer_crash_reason_from_signal(6), "Abort signal (SIGABRT)");
        assert_eq!(
            infer_crash_reason_from_signal(8),
            "Floating point exception (SIGFPE)"
        );
        assert_eq!(infer_crash_reason_from_signal(15), "Signal 15");
    }

    #[test]
    fn test_score_all_dimensions_clamped() {
        // Mirrors the panic-restart-with-dump scenario: every dimension
        // fires and the raw sum of 12.0 clamps to 10.0.
        let mut file = test_coredump_file();
        file.pod_name = "p1".to_string();
        file.instance_name = "rel1".to_string();
        file.mod_time = Utc::now();

        let results = AnalysisResults {
            stack_trace: "x".repeat(150),
            crash_reason: "Segmentation fault (SIGSEGV)".to_string(),
            thread_count: 3,
            ..Default::default()
        };

        let breakdown = compute_value_score(&file, &results, &default_keywords(), Utc::now());
        let raw: f64 = breakdown.entries.iter().map(|e| e.points).sum();
        assert!((raw - 12.0).abs() < 1e-9);
        assert!((breakdown.total - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_basic_fallback_path() {
        // Debugger timeout path: no stack trace, single thread, pod known
        let mut file = test_coredump_file();
        file.pod_name = "p1".to_string();
        file.instance_name = "rel1".to_string();
        file.size = 500 * 1024 * 1024;
        file.mod_time = Utc::now() - chrono::Duration::hours(2);

        let results = AnalysisResults {
            crash_reason: infer_crash_reason_from_signal(11),
            thread_count: 1,
            ..Default::default()
        };

        let breakdown = compute_value_score(&file, &results, &default_keywords(), Utc::now());
        // base 4 + reason 2 + keyword 1 + pod 1 + signal 1 + size 0.5
        assert!((breakdown.total - 9.5).abs() < 1e-9);
        assert!(!breakdown
            .entries
            .iter()
            .any(|e| e.dimension == "stack_trace" || e.dimension == "multi_thread"));
    }

    #[test]
    fn test_score_is_deterministic_and_bounded() {
        let file = test_coredump_file();
        let results = AnalysisResults::default();
        let now = Utc::now();

        let a = compute_value_score(&file, &results, &default_keywords(), now);
        let b = compute_value_score(&file, &results, &default_keywords(), now);
        assert_eq!(a.describe(), b.describe());
        assert!((a.total - b.total).abs() < 1e-9);
        assert!(a.total >= 0.0 && a.total <= 10.0);
    }

    #[test]
    fn test_score_keyword_bonus_applies_once() {
        let file = test_coredump_file();
        let results = AnalysisResults {
            // Matches both "segmentation" and "sigsegv"
            crash_reason: "Segmentation fault (SIGSEGV)".to_string(),
            ..Default::default()
        };

        let breakdown = compute_value_score(&file, &results, &default_keywords(), Utc::now());
        let bonus_count = breakdown
            .entries
            .iter()
            .filter(|e| e.dimension == "panic_keyword")
            .count();
        assert_eq!(bonus_count, 1);
    }

    #[test]
    fn test_freshness_evaluated_at_analysis_time() {
        let mut file = test_coredump_file();
        file.mod_time = Utc::now();

        let results = AnalysisResults::default();
        let fresh = compute_value_score(&file, &results, &[], file.mod_time);
        let stale = compute_value_score(
            &file,
            &results,
            &[],
            file.mod_time + chrono::Duration::hours(2),
        );

        assert!((fresh.total - stale.total - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_skip_conditions() {
        let config = AnalyzerConfig {
            ignore_patterns: vec!["sidecar".to_string()],
            ..Default::default()
        };
        let (analyzer, _rx) = Analyzer::new(
            config,
            None,
            None,
            PipelineHealth::new(),
            AgentMetrics::new(),
            StructuredLogger::new("test-node"),
        );
        let now = Utc::now();

        let mut fresh = test_coredump_file();
        fresh.mod_time = now;
        assert!(analyzer.skip_reason(&fresh, now).is_none());

        let mut ignored = fresh.clone();
        ignored.container_name = "metrics-sidecar".to_string();
        assert!(analyzer.skip_reason(&ignored, now).is_some());

        let mut huge = fresh.clone();
        huge.size = MAX_ANALYZABLE_SIZE + 1;
        assert!(analyzer.skip_reason(&huge, now).is_some());

        let mut old = fresh.clone();
        old.mod_time = now - chrono::Duration::hours(25);
        assert!(analyzer.skip_reason(&old, now).is_some());
    }

    #[tokio::test]
    async fn test_skipped_file_not_forwarded_as_complete() {
        let config = AnalyzerConfig {
            ignore_patterns: vec!["sidecar".to_string()],
            ..Default::default()
        };
        let (analyzer, mut rx) = Analyzer::new(
            config,
            None,
            None,
            PipelineHealth::new(),
            AgentMetrics::new(),
            StructuredLogger::new("test-node"),
        );

        let mut file = test_coredump_file();
        file.mod_time = Utc::now();
        file.container_name = "log-sidecar".to_string();
        analyzer.analyze_file(file).await;

        match rx.try_recv().unwrap() {
            AnalysisEvent::AnalysisSkipped { file } => {
                assert_eq!(file.status, FileStatus::Skipped);
                assert!(!file.is_analyzed);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
