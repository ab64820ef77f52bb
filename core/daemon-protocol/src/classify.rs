//! Failure classification and retry policy.
//!
//! Raw failure text is classified exactly once, where it is first observed. The
//! classified form is what gets persisted, pushed, and shown; raw messages never
//! reach a user unwrapped.
//!
//! Rules are an ordered table evaluated top-down; the first match wins.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Retries allowed per entity before the failure is surfaced as terminal.
pub const MAX_RETRIES: u32 = 3;

const RATE_LIMIT_DELAY_SECS: u64 = 60;
const NETWORK_BASE_DELAY_SECS: u64 = 5;
const NETWORK_MAX_DELAY_SECS: u64 = 30;
const UPSTREAM_DELAY_SECS: u64 = 10;
const GENERIC_DELAY_SECS: u64 = 2;
const CONCURRENCY_DELAY_SECS: u64 = 2;

const REPOSITORY_HELP_URL: &str =
    "https://docs.github.com/en/repositories/creating-and-managing-repositories/troubleshooting-cloning-errors";
const RATE_LIMIT_HELP_URL: &str =
    "https://docs.github.com/en/rest/using-the-rest-api/rate-limits-for-the-rest-api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTransition,
    Concurrency,
    RateLimit,
    Network,
    NotFound,
    Permission,
    Activation,
    Deactivation,
    Download,
    Upstream,
    Generic,
    /// The action does not apply to the entity's current state.
    Precondition,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Permission => "permission",
            ErrorKind::Activation => "activation",
            ErrorKind::Deactivation => "deactivation",
            ErrorKind::Download => "download",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Generic => "generic",
            ErrorKind::Precondition => "precondition",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "invalid_transition" => Some(ErrorKind::InvalidTransition),
            "concurrency" => Some(ErrorKind::Concurrency),
            "rate_limit" => Some(ErrorKind::RateLimit),
            "network" => Some(ErrorKind::Network),
            "not_found" => Some(ErrorKind::NotFound),
            "permission" => Some(ErrorKind::Permission),
            "activation" => Some(ErrorKind::Activation),
            "deactivation" => Some(ErrorKind::Deactivation),
            "download" => Some(ErrorKind::Download),
            "upstream" => Some(ErrorKind::Upstream),
            "generic" => Some(ErrorKind::Generic),
            "precondition" => Some(ErrorKind::Precondition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guidance {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub links: Vec<GuidanceLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub recoverable: bool,
    /// `None` means no automatic retry is scheduled.
    pub retry_delay_seconds: Option<u64>,
    pub guidance: Guidance,
}

impl Classification {
    pub fn severity(&self) -> Severity {
        if self.recoverable {
            Severity::Warning
        } else {
            Severity::Error
        }
    }

    /// Classification for a kind already known without pattern matching.
    pub fn for_kind(kind: ErrorKind, retry_count: u32) -> Self {
        outcome(kind, retry_count)
    }

    /// A request that cannot apply to the entity's current state. Terminal:
    /// retrying the same request against the same state cannot succeed.
    pub fn precondition(title: &str) -> Self {
        Self {
            kind: ErrorKind::Precondition,
            recoverable: false,
            retry_delay_seconds: None,
            guidance: guidance(
                title,
                "The plugin's current state does not allow this action.",
                &["Refresh the plugin and check its state"],
                &[],
            ),
        }
    }

    /// Lock contention. Not produced by [`classify`] because it never originates
    /// as raw failure text.
    pub fn concurrency() -> Self {
        Self {
            kind: ErrorKind::Concurrency,
            recoverable: true,
            retry_delay_seconds: Some(CONCURRENCY_DELAY_SECS),
            guidance: guidance(
                "Operation in progress",
                "Another operation is already running for this plugin.",
                &["Try again shortly"],
                &[],
            ),
        }
    }
}

struct Rule {
    kind: ErrorKind,
    pattern: &'static Lazy<Regex>,
    source: Option<&'static str>,
}

static RE_RATE_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate.?limit|forbidden|too many requests|\b403\b|\b429\b").unwrap()
});
static RE_NOT_FOUND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)not found|\b404\b|does not exist|no such repository").unwrap());
static RE_NETWORK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)network|time[d ]?out|connection|could not resolve|unreachable|curl error|dns")
        .unwrap()
});
static RE_PERMISSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)permission|unauthori[sz]ed|not allowed|access denied|capabilit").unwrap()
});
static RE_DEACTIVATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)deactivat").unwrap());
static RE_ACTIVATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bactivat").unwrap());
static RE_DOWNLOAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)download|package|\bzip\b|unzip|archive|unpack|extract").unwrap()
});
static RE_UPSTREAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)github|api error|upstream|bad gateway|service unavailable|\b50[234]\b")
        .unwrap()
});

static RULES: [Rule; 8] = [
    Rule {
        kind: ErrorKind::RateLimit,
        pattern: &RE_RATE_LIMIT,
        source: None,
    },
    Rule {
        kind: ErrorKind::NotFound,
        pattern: &RE_NOT_FOUND,
        source: None,
    },
    Rule {
        kind: ErrorKind::Network,
        pattern: &RE_NETWORK,
        source: None,
    },
    Rule {
        kind: ErrorKind::Permission,
        pattern: &RE_PERMISSION,
        source: Some("install"),
    },
    Rule {
        kind: ErrorKind::Deactivation,
        pattern: &RE_DEACTIVATION,
        source: None,
    },
    Rule {
        kind: ErrorKind::Activation,
        pattern: &RE_ACTIVATION,
        source: None,
    },
    Rule {
        kind: ErrorKind::Download,
        pattern: &RE_DOWNLOAD,
        source: None,
    },
    Rule {
        kind: ErrorKind::Upstream,
        pattern: &RE_UPSTREAM,
        source: None,
    },
];

/// Source tag used for failures reported by the upstream repository source.
pub const SOURCE_UPSTREAM: &str = "github_api";

/// Classify a raw failure message observed at `source`.
///
/// `retry_count` only affects the network backoff delay.
pub fn classify(raw_message: &str, source: &str, retry_count: u32) -> Classification {
    let kind = RULES
        .iter()
        .find(|rule| {
            rule.source.map(|tag| tag == source).unwrap_or(true)
                && rule.pattern.is_match(raw_message)
        })
        .map(|rule| rule.kind)
        .unwrap_or_else(|| {
            if source == SOURCE_UPSTREAM {
                ErrorKind::Upstream
            } else {
                ErrorKind::Generic
            }
        });

    outcome(kind, retry_count)
}

fn outcome(kind: ErrorKind, retry_count: u32) -> Classification {
    match kind {
        ErrorKind::RateLimit => Classification {
            kind,
            recoverable: true,
            retry_delay_seconds: Some(RATE_LIMIT_DELAY_SECS),
            guidance: guidance(
                "Rate limit reached",
                "The repository service is throttling requests.",
                &["Wait a minute and try again"],
                &[("Rate limits", RATE_LIMIT_HELP_URL)],
            ),
        },
        ErrorKind::NotFound => Classification {
            kind,
            recoverable: false,
            retry_delay_seconds: None,
            guidance: guidance(
                "Repository not found",
                "The repository could not be found or is no longer public.",
                &["Check the repository name"],
                &[("Troubleshooting repositories", REPOSITORY_HELP_URL)],
            ),
        },
        ErrorKind::Network => Classification {
            kind,
            recoverable: true,
            retry_delay_seconds: Some(network_delay(retry_count)),
            guidance: guidance(
                "Connection problem",
                "The request could not reach the remote service.",
                &["Check the network connection", "Retry"],
                &[],
            ),
        },
        ErrorKind::Permission => Classification {
            kind,
            recoverable: false,
            retry_delay_seconds: None,
            guidance: guidance(
                "Permission denied",
                "The host platform refused to install packages for this account.",
                &["Contact an administrator"],
                &[],
            ),
        },
        ErrorKind::Activation => Classification {
            kind,
            recoverable: false,
            retry_delay_seconds: None,
            guidance: guidance(
                "Activation failed",
                "The plugin was installed but could not be activated.",
                &["Check the host platform's plugin log"],
                &[],
            ),
        },
        ErrorKind::Deactivation => Classification {
            kind,
            recoverable: false,
            retry_delay_seconds: None,
            guidance: guidance(
                "Deactivation failed",
                "The plugin could not be deactivated.",
                &["Deactivate it from the host platform directly"],
                &[],
            ),
        },
        ErrorKind::Download => Classification {
            kind,
            recoverable: false,
            retry_delay_seconds: None,
            guidance: guidance(
                "Download failed",
                "The package could not be downloaded or unpacked.",
                &["Verify the repository publishes an installable package"],
                &[],
            ),
        },
        ErrorKind::Upstream => Classification {
            kind,
            recoverable: true,
            retry_delay_seconds: Some(UPSTREAM_DELAY_SECS),
            guidance: guidance(
                "Repository service error",
                "The repository service returned an unexpected error.",
                &["Retry in a few seconds"],
                &[],
            ),
        },
        ErrorKind::Concurrency => Classification::concurrency(),
        ErrorKind::Precondition => {
            Classification::precondition("Action not possible in the current state")
        }
        ErrorKind::InvalidTransition | ErrorKind::Generic => Classification {
            kind: ErrorKind::Generic,
            recoverable: true,
            retry_delay_seconds: Some(GENERIC_DELAY_SECS),
            guidance: guidance(
                "Something went wrong",
                "The operation did not complete.",
                &["Retry"],
                &[],
            ),
        },
    }
}

fn network_delay(retry_count: u32) -> u64 {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    NETWORK_BASE_DELAY_SECS
        .saturating_mul(factor)
        .min(NETWORK_MAX_DELAY_SECS)
}

/// Kinds where the failure is plausibly transient rather than caused by bad
/// input or missing permission.
pub fn should_auto_retry(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::Upstream
    )
}

/// Guidance shown once automatic retries are exhausted. Distinct from the
/// non-recoverable guidance because waiting may still help.
pub fn max_retries_guidance() -> Guidance {
    guidance(
        "Maximum retries reached",
        "Automatic retries were exhausted. The problem may be temporary.",
        &["Wait a few minutes, then retry manually"],
        &[],
    )
}

fn guidance(title: &str, description: &str, actions: &[&str], links: &[(&str, &str)]) -> Guidance {
    Guidance {
        title: title.to_string(),
        description: description.to_string(),
        actions: actions.iter().map(|action| action.to_string()).collect(),
        links: links
            .iter()
            .map(|(label, url)| GuidanceLink {
                label: label.to_string(),
                url: url.to_string(),
            })
            .collect(),
    }
}
