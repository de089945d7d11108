//! Error taxonomy shared across the engine.
//!
//! Every error that can reach a client implements [`UserFacingError`] so that
//! internal detail never leaks into a response body. Every error that can
//! reach a metric label implements [`ReportableError`] so dashboards group on
//! a small, closed set of kinds instead of free-text messages.

use std::fmt;

use thiserror::Error;

/// Coarse classification used for metric labels and log levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The named workload does not exist in any index.
    NotFound,
    /// The container runtime could not be reached or returned an opaque error.
    RuntimeUnreachable,
    /// A start/probe cycle failed (timeout, exited, probe failure, IP resolution).
    StartFailure,
    /// The upstream workload refused or dropped the proxied connection.
    ProxyUpstream,
    /// Per-IP rate limit exceeded.
    RateLimited,
    /// Admin auth rejected the request.
    Unauthorized,
    /// Same-origin check rejected the request.
    CrossOriginRejected,
}

impl ErrorKind {
    pub fn to_metric_label(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::RuntimeUnreachable => "runtime_unreachable",
            ErrorKind::StartFailure => "start_failure",
            ErrorKind::ProxyUpstream => "proxy_upstream",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::CrossOriginRejected => "cross_origin_rejected",
        }
    }
}

/// Marks errors that may be safely shown to a client.
///
/// NOTE: not implemented for [`anyhow::Error`] on purpose — anyhow is too
/// convenient and tends to proliferate, eventually leaking internals into a
/// response body.
pub trait UserFacingError: fmt::Display {
    /// Format the error for the client, stripping anything sensitive.
    fn to_string_client(&self) -> String {
        self.to_string()
    }
}

pub trait ReportableError: fmt::Display {
    fn kind(&self) -> ErrorKind;
}

/// Errors raised by the [`crate::runtime::RuntimeAdapter`] boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("no network interfaces")]
    NoNetworkInterfaces,

    #[error("runtime error: {0}")]
    Other(#[from] anyhow::Error),
}

impl UserFacingError for RuntimeError {
    fn to_string_client(&self) -> String {
        match self {
            RuntimeError::NotFound(name) => format!("container not found: {name}"),
            RuntimeError::NoNetworkInterfaces => "no network interfaces".to_string(),
            RuntimeError::Other(_) => "container runtime error".to_string(),
        }
    }
}

impl ReportableError for RuntimeError {
    fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::NotFound(_) => ErrorKind::NotFound,
            RuntimeError::NoNetworkInterfaces | RuntimeError::Other(_) => {
                ErrorKind::RuntimeUnreachable
            }
        }
    }
}

/// Errors raised while starting/probing a workload, persisted into
/// `start_state = failed` with a human-readable reason.
#[derive(Debug, Error, Clone)]
pub enum StartError {
    #[error("container exited unexpectedly (status={0})")]
    ExitedUnexpectedly(String),

    #[error("start timeout")]
    StartTimeout,

    #[error("{0}")]
    RuntimeStart(String),

    #[error("{0}")]
    ProbeFailed(String),

    #[error("{0}")]
    IpResolution(String),

    #[error("dependency {0} failed to start: {1}")]
    DependencyFailed(String, Box<StartError>),
}

impl UserFacingError for StartError {
    fn to_string_client(&self) -> String {
        self.to_string()
    }
}

impl ReportableError for StartError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::StartFailure
    }
}
