//! Contract for talking to the remote issue tracker, together with the Jira
//! REST realization. [TrackerClient] is the seam the tracking core is tested
//! against.

pub mod jira;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("tracker request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("tracker rejected {operation} for {issue_key}: HTTP {status} {message}")]
    Rejected {
        operation: &'static str,
        issue_key: String,
        status: u16,
        message: String,
    },
    #[error("issue {issue_key} has no transition named {transition:?}")]
    UnknownTransition {
        issue_key: String,
        transition: String,
    },
}

/// An issue as the presentation layer needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub key: String,
    pub summary: String,
    pub description: Option<String>,
    pub status: String,
}

/// A workflow transition currently legal for some issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub id: String,
    pub name: String,
}

/// Intended to serve as a contract every tracker backend must implement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Issues matching a JQL-style query.
    async fn search_issues(&self, query: &str) -> Result<Vec<Issue>, RemoteError>;

    /// Transitions the tracker currently allows on an issue.
    async fn list_transitions(&self, issue_key: &str) -> Result<Vec<Transition>, RemoteError>;

    /// Executes a transition by name. Fails if the tracker doesn't offer it.
    async fn execute_transition(
        &self,
        issue_key: &str,
        transition_name: &str,
    ) -> Result<(), RemoteError>;

    /// Records time spent on an issue. `started_at` carries the configured
    /// local offset so the tracker files the entry on the right day.
    async fn submit_work_log(
        &self,
        issue_key: &str,
        time_spent: Duration,
        comment: &str,
        started_at: DateTime<FixedOffset>,
    ) -> Result<(), RemoteError>;
}
