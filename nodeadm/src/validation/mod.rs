//! Named, individually skippable validation phases.
//!
//! A [`Runner`] executes a check unless its phase is in the operator's
//! [`SkipSet`], and reports progress to an [`Informer`]. Checks return plain
//! `anyhow` errors, annotated with a remediation where the fix is known; the
//! caller decides whether a failure is fatal.
use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use strum_macros::{EnumString, VariantNames};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::remediation::remediation;

pub mod certificate;
pub mod cni;
pub mod credentials;
pub mod network;
pub mod node;
pub mod system;

#[derive(
    EnumString, strum_macros::Display, VariantNames, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    InstallValidation,
    CniValidation,
    NodeIpValidation,
    KubeletCertValidation,
    KubeletVersionSkewValidation,
    NtpSyncValidation,
    ApiServerEndpointResolutionValidation,
    AwsCredentialsValidation,
    InitValidation,
    NodeValidation,
    PodValidation,
    Preprocess,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkipSet(HashSet<Phase>);

impl SkipSet {
    /// Parses phase names. Unknown names are rejected so a typo does not
    /// silently leave a phase enabled.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> anyhow::Result<Self> {
        use strum::VariantNames;
        let mut phases = HashSet::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            let phase = Phase::from_str(name).map_err(|_| {
                anyhow!(
                    "unknown phase {name:?} in --skip, expected one of {:?}",
                    Phase::VARIANTS
                )
            })?;
            phases.insert(phase);
        }
        Ok(Self(phases))
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0.contains(&phase)
    }
}

/// Receives progress of each phase as it runs.
pub trait Informer: Send + Sync {
    fn starting(&self, phase: Phase, description: &str);
    fn done(&self, phase: Phase, err: Option<&anyhow::Error>);
}

pub struct LoggingInformer;

impl Informer for LoggingInformer {
    fn starting(&self, phase: Phase, description: &str) {
        info!(%phase, "{description}");
    }

    fn done(&self, phase: Phase, err: Option<&anyhow::Error>) {
        match err {
            None => info!(%phase, "validation succeeded"),
            Some(err) => match remediation(err) {
                Some(fix) => error!(%phase, remediation = fix, "validation failed: {err:#}"),
                None => error!(%phase, "validation failed: {err:#}"),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub description: String,
    pub error: Option<String>,
    pub remediation: Option<String>,
}

/// Collects a report per phase, used by `nodeadm debug`.
#[derive(Default)]
pub struct ReportInformer {
    reports: Mutex<Vec<PhaseReport>>,
}

impl ReportInformer {
    pub fn reports(&self) -> Vec<PhaseReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn failed(&self) -> bool {
        self.reports().iter().any(|r| r.error.is_some())
    }
}

impl Informer for ReportInformer {
    fn starting(&self, phase: Phase, description: &str) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(PhaseReport {
                phase,
                description: description.to_string(),
                error: None,
                remediation: None,
            });
        }
    }

    fn done(&self, phase: Phase, err: Option<&anyhow::Error>) {
        let Some(err) = err else { return };
        if let Ok(mut reports) = self.reports.lock() {
            if let Some(report) = reports.iter_mut().rev().find(|r| r.phase == phase) {
                report.error = Some(format!("{err:#}"));
                report.remediation = remediation(err).map(str::to_string);
            }
        }
    }
}

pub struct Runner<'a> {
    skip: &'a SkipSet,
    informer: &'a dyn Informer,
    keep_going: bool,
}

impl<'a> Runner<'a> {
    pub fn new(skip: &'a SkipSet, informer: &'a dyn Informer) -> Self {
        Self {
            skip,
            informer,
            keep_going: false,
        }
    }

    /// Failures are only reported to the informer and every later phase
    /// still runs.
    pub fn keep_going(mut self) -> Self {
        self.keep_going = true;
        self
    }

    pub fn is_skipped(&self, phase: Phase) -> bool {
        self.skip.contains(phase)
    }

    pub async fn run<F, Fut>(&self, phase: Phase, description: &str, check: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.skip.contains(phase) {
            info!(%phase, "skipping validation");
            return Ok(());
        }
        self.informer.starting(phase, description);
        let result = check().await;
        self.informer.done(phase, result.as_ref().err());
        if self.keep_going {
            return Ok(());
        }
        result
    }
}

/// Outcome of one poll attempt: `Ok(Some)` finishes, `Ok(None)` polls again.
pub type PollResult<T> = anyhow::Result<Option<T>>;

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Polls `attempt` from a single background task until it yields a value,
/// fails `MAX_CONSECUTIVE_FAILURES` times in a row, `timeout` elapses or
/// `cancel` fires. The task checks `cancel` between attempts and is left to
/// wind down on its own.
pub async fn poll<T, F, Fut>(
    description: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut attempt: F,
) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = PollResult<T>> + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    let task_cancel = cancel.child_token();
    let guard = task_cancel.clone().drop_guard();
    let task_description = description.to_string();

    tokio::spawn(async move {
        let mut failures = 0;
        let result = loop {
            if task_cancel.is_cancelled() {
                break Err(anyhow!("{task_description} cancelled"));
            }
            match attempt().await {
                Ok(Some(value)) => break Ok(value),
                Ok(None) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!("{task_description} failed ({failures}/{MAX_CONSECUTIVE_FAILURES}): {e:#}");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        break Err(e.context(format!(
                            "{task_description} failed {failures} times in a row"
                        )));
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = task_cancel.cancelled() => {}
            }
        };
        let _ = tx.send(result);
    });

    let result = tokio::select! {
        result = rx => result.unwrap_or_else(|_| Err(anyhow!("{description} task exited"))),
        _ = tokio::time::sleep(timeout) => Err(anyhow!("timed out after {} waiting for {description}", humantime::format_duration(timeout))),
        _ = cancel.cancelled() => Err(anyhow!("{description} cancelled")),
    };
    drop(guard);
    result
}
