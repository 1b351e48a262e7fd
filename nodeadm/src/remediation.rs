//! Error annotations understood by the command line front end.
//!
//! A validation failure carries a [`Remediation`]: human readable steps to
//! fix the problem. The annotation travels inside the `anyhow::Error` chain,
//! so any layer can add context without losing it, and the front end finds
//! it again by downcasting.
//!
//! A [`SilentError`] marks a failure whose details were already reported,
//! for example by a per-phase validation report. The process still exits
//! with status 1 but the final error line is not logged.
use std::fmt;

#[derive(Debug)]
pub struct Remediation {
    source: anyhow::Error,
    remediation: String,
}

// Displays as the wrapped error and exposes its causes directly, so the
// annotation adds nothing to the rendered chain.
impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl std::error::Error for Remediation {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}

impl Remediation {
    pub fn remediation(&self) -> &str {
        &self.remediation
    }
}

/// Attaches fix instructions to `err`.
pub fn with_remediation(err: impl Into<anyhow::Error>, remediation: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Remediation {
        source: err.into(),
        remediation: remediation.into(),
    })
}

/// Finds the outermost remediation attached anywhere in the chain.
pub fn remediation(err: &anyhow::Error) -> Option<&str> {
    err.chain()
        .find_map(|e| e.downcast_ref::<Remediation>())
        .map(Remediation::remediation)
}

/// Merges the remediation into the error message, for sinks that only show
/// plain error text.
pub fn flatten_remediation(err: anyhow::Error) -> anyhow::Error {
    match remediation(&err) {
        Some(fix) => {
            let fix = fix.to_string();
            anyhow::anyhow!("{err:#}. Remediation: {fix}")
        }
        None => err,
    }
}

#[derive(Debug)]
pub struct SilentError;

impl fmt::Display for SilentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("command failed")
    }
}

impl std::error::Error for SilentError {}

pub fn is_silent(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<SilentError>())
}
