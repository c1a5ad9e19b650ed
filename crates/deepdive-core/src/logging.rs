//! Append-only JSONL audit trail of finished sessions.
//!
//! Records live under `<root>/<year>/<month>/session.jsonl`; a sibling
//! `audit.jsonl` notes which secret kinds were masked. Secrets are masked
//! before anything reaches disk and files older than the retention window
//! are removed after each write.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::backend::EngineKind;
use crate::workflow::SessionOutcome;

const LOG_DIR_ENV: &str = "DEEPDIVE_LOG_DIR";
const RETENTION_ENV: &str = "DEEPDIVE_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;

const SESSION_FILE: &str = "session.jsonl";
const AUDIT_FILE: &str = "audit.jsonl";
const LOG_FILES: [&str; 2] = [SESSION_FILE, AUDIT_FILE];

/// Secret kinds and their patterns. `lead` is kept, the rest of the match
/// becomes `[REDACTED]`.
const SECRET_RULES: &[(&str, &str)] = &[
    ("api_key", r"(?i)(?P<lead>api[_-]?key\s*[:=]\s*)[A-Za-z0-9\-_.+/]+"),
    ("bearer", r"(?i)(?P<lead>bearer\s+)[A-Za-z0-9\-_.+=/]+"),
    ("secret", r"(?i)(?P<lead>secret\s*[:=]\s*)[A-Za-z0-9\-_.+/]+"),
    ("sk_token", r"(?P<lead>)sk-[A-Za-z0-9]{16,}"),
];

static SECRET_MATCHERS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    SECRET_RULES
        .iter()
        .map(|(kind, pattern)| (*kind, Regex::new(pattern).expect("invalid secret pattern")))
        .collect()
});

/// Masks secrets in free text and remembers which kinds it saw.
#[derive(Default)]
struct SecretMasker {
    seen: BTreeSet<&'static str>,
}

impl SecretMasker {
    fn mask(&mut self, text: &str) -> String {
        let mut masked = text.to_string();
        for (kind, matcher) in SECRET_MATCHERS.iter() {
            if matcher.is_match(&masked) {
                self.seen.insert(*kind);
                masked = matcher.replace_all(&masked, "${lead}[REDACTED]").into_owned();
            }
        }
        masked
    }

    fn kinds(&self) -> Vec<String> {
        self.seen.iter().map(|kind| kind.to_string()).collect()
    }
}

/// What gets recorded about one finished session.
#[derive(Debug, Clone)]
pub struct SessionLogInput {
    pub session_id: String,
    pub query: String,
    pub engine: String,
    pub summary: String,
    pub stop_reason: String,
    pub citations: Vec<String>,
    pub findings: usize,
    pub learnings: usize,
    pub rounds: u32,
    pub trace_path: Option<String>,
}

impl SessionLogInput {
    pub fn from_outcome(outcome: &SessionOutcome, engine: EngineKind) -> Self {
        let report = &outcome.report;
        Self {
            session_id: outcome.session_id.clone(),
            query: report.query.clone(),
            engine: engine.as_str().to_string(),
            summary: report.summary.clone(),
            stop_reason: outcome.stop_reason.as_str().to_string(),
            citations: report.citations.iter().map(|c| c.url.clone()).collect(),
            findings: report.findings.len(),
            learnings: outcome.learnings.len(),
            rounds: outcome.stats.rounds,
            trace_path: None,
        }
    }

    pub fn with_trace_path(mut self, path: impl Into<String>) -> Self {
        self.trace_path = Some(path.into());
        self
    }
}

#[derive(Serialize)]
struct SessionRecord<'a> {
    timestamp: &'a str,
    session_id: &'a str,
    query: String,
    engine: &'a str,
    summary: String,
    stop_reason: &'a str,
    citations: Vec<String>,
    findings: usize,
    learnings: usize,
    rounds: u32,
    trace_path: Option<&'a str>,
    redactions: &'a [String],
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: &'a str,
    session_id: &'a str,
    redactions: &'a [String],
}

/// Only the field purging needs; the rest of a line is ignored.
#[derive(Deserialize)]
struct SessionTag {
    session_id: String,
}

pub fn log_base_dir() -> PathBuf {
    std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

fn retention_days() -> u64 {
    std::env::var(RETENTION_ENV)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

/// Append a session record under `DEEPDIVE_LOG_DIR` (default `data/logs`).
pub fn log_session_completion(input: SessionLogInput) -> Result<()> {
    log_session_completion_in(&log_base_dir(), retention_days(), input)
}

/// Append a session record under `base_dir`, then expire files older than
/// `retention_days` (0 keeps everything).
pub fn log_session_completion_in(
    base_dir: &Path,
    retention_days: u64,
    input: SessionLogInput,
) -> Result<()> {
    let now = Utc::now();
    let timestamp = now.to_rfc3339();
    let mut masker = SecretMasker::default();

    let query = masker.mask(&input.query);
    let summary = masker.mask(&input.summary);
    let citations = input.citations.iter().map(|url| masker.mask(url)).collect();
    let redactions = masker.kinds();

    let month = month_dir(base_dir, now);
    let record = SessionRecord {
        timestamp: &timestamp,
        session_id: &input.session_id,
        query,
        engine: &input.engine,
        summary,
        stop_reason: &input.stop_reason,
        citations,
        findings: input.findings,
        learnings: input.learnings,
        rounds: input.rounds,
        trace_path: input.trace_path.as_deref(),
        redactions: &redactions,
    };
    append_line(&month.join(SESSION_FILE), &record)?;

    if !redactions.is_empty() {
        let audit = AuditRecord {
            timestamp: &timestamp,
            session_id: &input.session_id,
            redactions: &redactions,
        };
        append_line(&month.join(AUDIT_FILE), &audit)?;
        tracing::warn!(
            session_id = %input.session_id,
            kinds = ?redactions,
            "masked secrets before writing the session log"
        );
    }

    let expired = expire_old_files(base_dir, retention_days)?;
    if expired > 0 {
        tracing::debug!(files = expired, "expired old session logs");
    }
    Ok(())
}

/// Delete every log line recorded for `session_id`.
pub fn remove_session_logs(session_id: &str) -> Result<()> {
    remove_session_logs_in(&log_base_dir(), session_id)
}

pub fn remove_session_logs_in(base_dir: &Path, session_id: &str) -> Result<()> {
    let mut removed = 0;
    for month in month_dirs(base_dir)? {
        for name in LOG_FILES {
            removed += drop_session_lines(&month.join(name), session_id)?;
        }
        remove_if_empty(&month)?;
    }
    for year in subdirs(base_dir)? {
        remove_if_empty(&year)?;
    }
    tracing::info!(session_id, lines = removed, "purged session log entries");
    Ok(())
}

fn month_dir(base_dir: &Path, at: DateTime<Utc>) -> PathBuf {
    base_dir
        .join(at.format("%Y").to_string())
        .join(at.format("%m").to_string())
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))
}

/// Rewrite `path` without the lines of `session_id`; returns how many went.
fn drop_session_lines(path: &Path, session_id: &str) -> Result<usize> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read log file {}", path.display()));
        }
    };
    let (dropped, kept): (Vec<&str>, Vec<&str>) = contents.lines().partition(|line| {
        serde_json::from_str::<SessionTag>(line).is_ok_and(|tag| tag.session_id == session_id)
    });
    if dropped.is_empty() {
        return Ok(0);
    }

    let rewritten = if kept.is_empty() {
        fs::remove_file(path)
    } else {
        let mut body = kept.join("\n");
        body.push('\n');
        fs::write(path, body)
    };
    rewritten.with_context(|| format!("failed to rewrite log file {}", path.display()))?;
    Ok(dropped.len())
}

/// Remove log files last modified before the retention window, and the
/// month and year directories they leave empty.
fn expire_old_files(base_dir: &Path, retention_days: u64) -> Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }
    let window = Duration::from_secs(retention_days.saturating_mul(86_400));
    let cutoff = SystemTime::now()
        .checked_sub(window)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut expired = 0;
    for month in month_dirs(base_dir)? {
        for name in LOG_FILES {
            let path = month.join(name);
            let stale = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .is_ok_and(|modified| modified < cutoff);
            if stale {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to expire {}", path.display()))?;
                expired += 1;
            }
        }
        remove_if_empty(&month)?;
    }
    for year in subdirs(base_dir)? {
        remove_if_empty(&year)?;
    }
    Ok(expired)
}

/// Every `<year>/<month>` directory under `base_dir`, oldest first.
fn month_dirs(base_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut months = Vec::new();
    for year in subdirs(base_dir)? {
        months.extend(subdirs(&year)?);
    }
    months.sort();
    Ok(months)
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn remove_if_empty(dir: &Path) -> Result<()> {
    if fs::read_dir(dir)?.next().is_none() {
        fs::remove_dir(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
    }
    Ok(())
}
