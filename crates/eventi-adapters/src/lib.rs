//! Producer registry, selection policy and the external scraper runner.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use eventi_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "eventi-adapters";

const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerRegistry {
    /// Tag given to batch files that match no source's `file_match`.
    pub default_source: String,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub runs: BTreeMap<String, RunKind>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: String,
    /// Batch files whose lowercased name contains this fragment belong to this source.
    #[serde(default)]
    pub file_match: Option<String>,
    /// Key of the run-parameter list that narrows this source's cities.
    pub group_key: String,
    /// Argv template; `{source}`, `{city}`, `{periodo}` and `{output_dir}` are substituted.
    pub command: Vec<String>,
    pub cities: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunKind {
    pub run_type: String,
    pub periodo: String,
    pub cron: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub cleanup: bool,
}

impl ProducerRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing producer registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.source(&self.default_source).is_none() {
            bail!("default_source `{}` is not a registered source", self.default_source);
        }
        for source in &self.sources {
            if source.command.is_empty() {
                bail!("source `{}` has an empty command", source.source);
            }
        }
        for (name, run) in &self.runs {
            for source in &run.sources {
                if self.source(source).is_none() {
                    bail!("run `{name}` references unknown source `{source}`");
                }
            }
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source == name)
    }

    pub fn run_kind(&self, name: &str) -> Option<&RunKind> {
        self.runs.get(name)
    }

    /// Source tag for a batch file, inferred from its name.
    pub fn source_for_file(&self, file_name: &str) -> &str {
        let lower = file_name.to_lowercase();
        self.sources
            .iter()
            .find(|s| {
                s.file_match
                    .as_deref()
                    .is_some_and(|needle| !needle.is_empty() && lower.contains(&needle.to_lowercase()))
            })
            .map(|s| s.source.as_str())
            .unwrap_or(self.default_source.as_str())
    }

    /// Every (source, city) producer of a run kind with its selection decision.
    pub fn plan(&self, run: &RunKind, filter: &RunFilter, output_dir: &Path) -> Vec<PlannedProducer> {
        let mut plan = Vec::new();
        for source in run.sources.iter().filter_map(|name| self.source(name)) {
            if !source.enabled {
                continue;
            }
            for city in &source.cities {
                let argv = render_command(&source.command, &source.source, city, &run.periodo, output_dir);
                plan.push(PlannedProducer {
                    selection: select(filter, &source.group_key, city),
                    job: ProducerJob {
                        source: source.source.clone(),
                        city: city.clone(),
                        group_key: source.group_key.clone(),
                        argv,
                    },
                });
            }
        }
        plan
    }
}

fn render_command(
    template: &[String],
    source: &str,
    city: &str,
    periodo: &str,
    output_dir: &Path,
) -> Vec<String> {
    let output_dir = output_dir.display().to_string();
    template
        .iter()
        .map(|part| {
            part.replace("{source}", source)
                .replace("{city}", city)
                .replace("{periodo}", periodo)
                .replace("{output_dir}", &output_dir)
        })
        .collect()
}

/// Run parameters narrowing which producers execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunFilter {
    /// Single-target override; wins over every group list.
    pub target: Option<String>,
    /// Allow-lists keyed by a source's `group_key`.
    pub groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("run parameters must be a JSON object")]
    NotAnObject,
    #[error("`city` must be a string")]
    InvalidTarget,
    #[error("`{0}` must be a comma-separated string or a list of strings")]
    InvalidGroup(String),
    #[error("expected KEY=a,b but got `{0}`")]
    InvalidPair(String),
}

impl RunFilter {
    /// Parse trigger parameters such as `{"city": "milano"}` or
    /// `{"cities_zero": "milano,roma"}`.
    pub fn from_conf(conf: &JsonValue) -> Result<Self, FilterError> {
        let map = match conf {
            JsonValue::Null => return Ok(Self::default()),
            JsonValue::Object(map) => map,
            _ => return Err(FilterError::NotAnObject),
        };
        let mut filter = Self::default();
        for (key, value) in map {
            if key == "city" {
                match value {
                    JsonValue::String(s) => filter = filter.with_target(s),
                    JsonValue::Null => {}
                    _ => return Err(FilterError::InvalidTarget),
                }
                continue;
            }
            let values = match value {
                JsonValue::String(s) => s.split(',').map(str::to_string).collect::<Vec<_>>(),
                JsonValue::Array(items) => items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| FilterError::InvalidGroup(key.clone()))?,
                _ => return Err(FilterError::InvalidGroup(key.clone())),
            };
            filter = filter.with_group(key, values);
        }
        Ok(filter)
    }

    pub fn with_target(mut self, target: &str) -> Self {
        let target = normalize(target);
        self.target = (!target.is_empty()).then_some(target);
        self
    }

    pub fn with_group<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = values
            .into_iter()
            .map(|v| normalize(v.as_ref()))
            .filter(|v| !v.is_empty())
            .collect();
        self.groups.insert(key.to_string(), values);
        self
    }

    /// Parse a `key=a,b` command-line pair.
    pub fn parse_group_arg(pair: &str) -> Result<(String, Vec<String>), FilterError> {
        let (key, values) = pair
            .split_once('=')
            .filter(|(key, _)| !key.trim().is_empty())
            .ok_or_else(|| FilterError::InvalidPair(pair.to_string()))?;
        Ok((
            key.trim().to_string(),
            values.split(',').map(str::to_string).collect(),
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_none() && self.groups.is_empty()
    }

    /// Targets named by the filter, for the run audit row.
    pub fn targets(&self) -> Option<Vec<String>> {
        if let Some(target) = &self.target {
            return Some(vec![target.clone()]);
        }
        let mut all: Vec<String> = self.groups.values().flatten().cloned().collect();
        all.sort();
        all.dedup();
        (!all.is_empty()).then_some(all)
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Selection {
    /// No filter applies to this producer.
    RunAll,
    /// Named by the override or by its group list.
    Selected,
    Skipped(String),
}

impl Selection {
    pub fn should_run(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}

/// Decide whether the producer for `target` in group `group_key` runs.
pub fn select(filter: &RunFilter, group_key: &str, target: &str) -> Selection {
    let target = normalize(target);
    if let Some(only) = &filter.target {
        return if *only == target {
            Selection::Selected
        } else {
            Selection::Skipped(format!("global target filter set to {only}"))
        };
    }
    if let Some(allowed) = filter.groups.get(group_key) {
        return if allowed.contains(&target) {
            Selection::Selected
        } else {
            Selection::Skipped(format!("not in {group_key} list"))
        };
    }
    Selection::RunAll
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerJob {
    pub source: String,
    pub city: String,
    pub group_key: String,
    pub argv: Vec<String>,
}

impl ProducerJob {
    pub fn label(&self) -> String {
        format!("{}/{}", self.source, self.city)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedProducer {
    pub job: ProducerJob,
    pub selection: Selection,
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("empty command for {0}")]
    EmptyCommand(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
}

#[async_trait]
pub trait ProducerRunner: Send + Sync {
    async fn run(&self, job: &ProducerJob) -> Result<(), ProducerError>;
}

/// Runs each producer as a child process.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProducerRunner for CommandRunner {
    async fn run(&self, job: &ProducerJob) -> Result<(), ProducerError> {
        let (program, args) = job
            .argv
            .split_first()
            .ok_or_else(|| ProducerError::EmptyCommand(job.label()))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProducerError::Timeout(self.timeout))?
            .map_err(|source| ProducerError::Spawn {
                program: program.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(ProducerError::Exit {
            status: output.status.to_string(),
            stderr: stderr_tail(&output.stderr),
        })
    }
}

fn stderr_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProducerStatus {
    Succeeded { attempts: usize },
    Failed { attempts: usize, error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerOutcome {
    pub source: String,
    pub city: String,
    #[serde(flatten)]
    pub status: ProducerStatus,
}

impl ProducerOutcome {
    fn new(job: &ProducerJob, status: ProducerStatus) -> Self {
        Self {
            source: job.source.clone(),
            city: job.city.clone(),
            status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerReport {
    /// In plan order.
    pub outcomes: Vec<ProducerOutcome>,
}

impl ProducerReport {
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ProducerStatus::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ProducerStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ProducerStatus::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&ProducerStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Run the selected producers concurrently. A failing producer is retried per
/// `backoff` and then recorded as failed; it never aborts the others.
pub async fn run_producers(
    runner: Arc<dyn ProducerRunner>,
    plan: Vec<PlannedProducer>,
    concurrency: usize,
    backoff: BackoffPolicy,
) -> ProducerReport {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut outcomes = Vec::with_capacity(plan.len());
    let mut tasks = JoinSet::new();

    for (index, planned) in plan.into_iter().enumerate() {
        if let Selection::Skipped(reason) = planned.selection {
            info!(producer = %planned.job.label(), %reason, "producer skipped");
            outcomes.push((index, ProducerOutcome::new(&planned.job, ProducerStatus::Skipped { reason })));
            continue;
        }
        let runner = Arc::clone(&runner);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let status = match semaphore.acquire_owned().await {
                Ok(_permit) => run_with_retries(runner.as_ref(), &planned.job, backoff).await,
                Err(_) => ProducerStatus::Failed {
                    attempts: 0,
                    error: "producer pool closed".to_string(),
                },
            };
            (index, ProducerOutcome::new(&planned.job, status))
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!(error = %err, "producer task aborted"),
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);
    ProducerReport {
        outcomes: outcomes.into_iter().map(|(_, o)| o).collect(),
    }
}

async fn run_with_retries(
    runner: &dyn ProducerRunner,
    job: &ProducerJob,
    backoff: BackoffPolicy,
) -> ProducerStatus {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match runner.run(job).await {
            Ok(()) => {
                info!(producer = %job.label(), attempts, "producer finished");
                return ProducerStatus::Succeeded { attempts };
            }
            Err(err) if attempts <= backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempts - 1);
                warn!(producer = %job.label(), attempts, error = %err, ?delay, "producer failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(producer = %job.label(), attempts, error = %err, "producer failed");
                return ProducerStatus::Failed {
                    attempts,
                    error: err.to_string(),
                };
            }
        }
    }
}

/// Fingerprint of the content that, when changed, should update production:
/// the first 16 hex chars of SHA-256 over description, price and time info.
pub fn content_fingerprint(
    description: Option<&str>,
    price: Option<&str>,
    time_info: Option<&str>,
) -> String {
    short_sha256(&[
        description.unwrap_or(""),
        price.unwrap_or(""),
        time_info.unwrap_or(""),
    ])
}

fn short_sha256(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const REGISTRY: &str = r#"
default_source: city_today
sources:
  - source: city_today
    group_key: cities_today
    command: ["scraper", "{source}", "{city}", "--periodo={periodo}", "--out={output_dir}"]
    cities: [milano, roma, napoli]
  - source: zero_eu
    file_match: zero
    group_key: cities_zero
    command: ["scraper", "{source}", "{city}"]
    cities: [milano, roma]
runs:
  daily:
    run_type: etl_events_daily
    periodo: questa-settimana
    cron: "0 6 * * *"
    sources: [city_today, zero_eu]
    cleanup: true
  weekly:
    run_type: etl_events_weekly
    periodo: prossima-settimana
    cron: "0 8 * * 0"
    sources: [city_today]
"#;

    fn registry() -> ProducerRegistry {
        ProducerRegistry::from_yaml_str(REGISTRY).expect("registry")
    }

    fn no_wait() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn workspace_registry_parses() {
        let registry = ProducerRegistry::from_yaml_str(include_str!("../../../producers.yaml"))
            .expect("producers.yaml");
        assert_eq!(registry.source("city_today").map(|s| s.cities.len()), Some(50));
        assert_eq!(registry.source("zero_eu").map(|s| s.cities.len()), Some(7));
        for kind in ["daily", "weekly", "monthly"] {
            assert!(registry.run_kind(kind).is_some(), "missing run kind {kind}");
        }
    }

    #[test]
    fn registry_rejects_unknown_run_source() {
        let text = REGISTRY.replace("sources: [city_today]\n", "sources: [artribune]\n");
        assert!(ProducerRegistry::from_yaml_str(&text).is_err());
    }

    #[test]
    fn source_is_inferred_from_file_name() {
        let registry = registry();
        assert_eq!(registry.source_for_file("ZERO_milano_2026.json"), "zero_eu");
        assert_eq!(registry.source_for_file("events_roma.json"), "city_today");
    }

    #[test]
    fn override_wins_over_group_lists() {
        let filter = RunFilter::default()
            .with_target(" Milano ")
            .with_group("cities_today", ["roma"]);
        assert_eq!(select(&filter, "cities_today", "milano"), Selection::Selected);
        assert!(matches!(select(&filter, "cities_today", "roma"), Selection::Skipped(_)));
    }

    #[test]
    fn group_list_only_narrows_its_own_group() {
        let filter = RunFilter::from_conf(&json!({"cities_zero": "Milano, roma"})).unwrap();
        assert_eq!(select(&filter, "cities_zero", "roma"), Selection::Selected);
        assert_eq!(
            select(&filter, "cities_zero", "napoli"),
            Selection::Skipped("not in cities_zero list".to_string())
        );
        assert_eq!(select(&filter, "cities_today", "napoli"), Selection::RunAll);
    }

    #[test]
    fn conf_accepts_lists_and_rejects_other_shapes() {
        let filter = RunFilter::from_conf(&json!({"cities_today": ["Roma", "BARI"]})).unwrap();
        assert_eq!(filter.groups["cities_today"], vec!["roma", "bari"]);
        assert_eq!(RunFilter::from_conf(&JsonValue::Null).unwrap(), RunFilter::default());
        assert_eq!(
            RunFilter::from_conf(&json!({"cities_today": 3})),
            Err(FilterError::InvalidGroup("cities_today".into()))
        );
        assert_eq!(RunFilter::from_conf(&json!(["milano"])), Err(FilterError::NotAnObject));
    }

    #[test]
    fn blank_override_is_ignored() {
        let filter = RunFilter::from_conf(&json!({"city": "  "})).unwrap();
        assert!(filter.is_empty());
        assert_eq!(select(&filter, "cities_today", "milano"), Selection::RunAll);
    }

    #[test]
    fn group_arg_parses_key_and_values() {
        let (key, values) = RunFilter::parse_group_arg("cities_zero=milano,roma").unwrap();
        assert_eq!(key, "cities_zero");
        assert_eq!(values, vec!["milano", "roma"]);
        assert!(RunFilter::parse_group_arg("milano").is_err());
    }

    #[test]
    fn plan_renders_commands_and_marks_skips() {
        let registry = registry();
        let run = registry.run_kind("daily").unwrap().clone();
        let filter = RunFilter::default().with_group("cities_zero", ["roma"]);
        let plan = registry.plan(&run, &filter, Path::new("/data/output"));

        assert_eq!(plan.len(), 5);
        assert_eq!(
            plan[0].job.argv,
            vec!["scraper", "city_today", "milano", "--periodo=questa-settimana", "--out=/data/output"]
        );
        assert_eq!(plan[0].selection, Selection::RunAll);
        let zero: Vec<_> = plan.iter().filter(|p| p.job.source == "zero_eu").collect();
        assert!(!zero[0].selection.should_run());
        assert_eq!(zero[1].selection, Selection::Selected);
        assert_eq!(filter.targets(), Some(vec!["roma".to_string()]));
    }

    struct ScriptedRunner {
        failures_before_success: BTreeMap<String, usize>,
        calls: Mutex<BTreeMap<String, usize>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(failures: &[(&str, usize)]) -> Self {
            Self {
                failures_before_success: failures.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                calls: Mutex::new(BTreeMap::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProducerRunner for ScriptedRunner {
        async fn run(&self, job: &ProducerJob) -> Result<(), ProducerError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let label = job.label();
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let entry = calls.entry(label.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let failures = self.failures_before_success.get(&label).copied().unwrap_or(0);
            if call <= failures {
                return Err(ProducerError::Exit {
                    status: "exit status: 1".into(),
                    stderr: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn planned(source: &str, city: &str, selection: Selection) -> PlannedProducer {
        PlannedProducer {
            job: ProducerJob {
                source: source.into(),
                city: city.into(),
                group_key: "cities_today".into(),
                argv: vec!["true".into()],
            },
            selection,
        }
    }

    #[tokio::test]
    async fn producers_retry_then_fail_without_stopping_others() {
        let runner = Arc::new(ScriptedRunner::new(&[("city_today/roma", 1), ("city_today/bari", 10)]));
        let plan = vec![
            planned("city_today", "milano", Selection::RunAll),
            planned("city_today", "roma", Selection::Selected),
            planned("city_today", "bari", Selection::RunAll),
            planned("city_today", "lecce", Selection::Skipped("not in cities_today list".into())),
        ];
        let report = run_producers(runner.clone(), plan, 2, no_wait()).await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.outcomes[1].status, ProducerStatus::Succeeded { attempts: 2 });
        assert!(matches!(report.outcomes[2].status, ProducerStatus::Failed { attempts: 4, .. }));
        assert_eq!(report.outcomes[3].city, "lecce");
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn command_runner_reports_exit_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker: PathBuf = dir.path().join("ran");
        let runner = CommandRunner::new(Duration::from_secs(10));
        let ok = ProducerJob {
            source: "city_today".into(),
            city: "milano".into(),
            group_key: "cities_today".into(),
            argv: vec!["touch".into(), marker.display().to_string()],
        };
        runner.run(&ok).await.expect("touch runs");
        assert!(marker.exists());

        let failing = ProducerJob {
            argv: vec!["sh".into(), "-c".into(), "echo nope >&2; exit 3".into()],
            ..ok.clone()
        };
        match runner.run(&failing).await {
            Err(ProducerError::Exit { stderr, .. }) => assert_eq!(stderr, "nope"),
            other => panic!("unexpected {other:?}"),
        }

        let empty = ProducerJob { argv: Vec::new(), ..ok };
        assert!(matches!(runner.run(&empty).await, Err(ProducerError::EmptyCommand(_))));
    }

    #[test]
    fn fingerprint_is_truncated_sha256_of_concatenated_parts() {
        assert_eq!(content_fingerprint(None, None, None), "e3b0c44298fc1c14");
        assert_eq!(content_fingerprint(Some("a"), Some("bc"), None), "ba7816bf8f01cfea");
        assert_eq!(content_fingerprint(None, Some("ab"), Some("c")), "ba7816bf8f01cfea");
        assert_ne!(
            content_fingerprint(Some("Jazz"), Some("10 EUR"), None),
            content_fingerprint(Some("Jazz"), Some("12 EUR"), None)
        );
    }
}
