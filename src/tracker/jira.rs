use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Issue, RemoteError, TrackerClient, Transition};

/// How much of a rejected response body is worth keeping in the error.
const ERROR_BODY_LIMIT: usize = 300;

/// Client for the Jira REST v2 api with basic auth. Every request shares one
/// pooled [Client] with a bounded timeout, so no call can hang an invocation.
pub struct JiraClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl JiraClient {
    pub fn new(
        host: &str,
        username: &str,
        password: &str,
        timeout: StdDuration,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: host.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn check(
        response: Response,
        operation: &'static str,
        issue_key: &str,
    ) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut message = response.text().await.unwrap_or_default();
        if message.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Err(RemoteError::Rejected {
            operation,
            issue_key: issue_key.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    issues: Vec<IssueDto>,
}

#[derive(Deserialize)]
struct IssueDto {
    key: String,
    fields: IssueFieldsDto,
}

#[derive(Deserialize)]
struct IssueFieldsDto {
    summary: Option<String>,
    description: Option<String>,
    status: Option<StatusDto>,
}

#[derive(Deserialize)]
struct StatusDto {
    name: String,
}

#[derive(Deserialize)]
struct TransitionsResponse {
    transitions: Vec<TransitionDto>,
}

#[derive(Deserialize)]
struct TransitionDto {
    id: String,
    name: String,
}

impl From<IssueDto> for Issue {
    fn from(dto: IssueDto) -> Self {
        Issue {
            key: dto.key,
            summary: dto.fields.summary.unwrap_or_default(),
            description: dto.fields.description,
            status: dto
                .fields
                .status
                .map(|status| status.name)
                .unwrap_or_default(),
        }
    }
}

/// Jira wants the zone as `+0200`, without a colon.
fn format_started(started_at: DateTime<FixedOffset>) -> String {
    started_at.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()
}

#[async_trait]
impl TrackerClient for JiraClient {
    async fn search_issues(&self, query: &str) -> Result<Vec<Issue>, RemoteError> {
        debug!("Searching issues with {query:?}");
        let response = self
            .get("/rest/api/2/search")
            .query(&[("jql", query)])
            .send()
            .await?;
        let response = Self::check(response, "search", "").await?;
        let body = response.json::<SearchResponse>().await?;
        Ok(body.issues.into_iter().map(Issue::from).collect())
    }

    async fn list_transitions(&self, issue_key: &str) -> Result<Vec<Transition>, RemoteError> {
        debug!("Listing transitions of {issue_key}");
        let response = self
            .get(&format!("/rest/api/2/issue/{issue_key}/transitions"))
            .send()
            .await?;
        let response = Self::check(response, "list transitions", issue_key).await?;
        let body = response.json::<TransitionsResponse>().await?;
        Ok(body
            .transitions
            .into_iter()
            .map(|dto| Transition {
                id: dto.id,
                name: dto.name,
            })
            .collect())
    }

    async fn execute_transition(
        &self,
        issue_key: &str,
        transition_name: &str,
    ) -> Result<(), RemoteError> {
        // The rest api only accepts transition ids, so the name has to be
        // resolved through the listing first.
        let transitions = self.list_transitions(issue_key).await?;
        let transition = transitions
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(transition_name))
            .ok_or_else(|| RemoteError::UnknownTransition {
                issue_key: issue_key.to_string(),
                transition: transition_name.to_string(),
            })?;

        debug!("Executing {:?} ({}) on {issue_key}", transition.name, transition.id);
        let response = self
            .post(&format!("/rest/api/2/issue/{issue_key}/transitions"))
            .json(&json!({ "transition": { "id": transition.id } }))
            .send()
            .await?;
        Self::check(response, "transition", issue_key).await?;
        Ok(())
    }

    async fn submit_work_log(
        &self,
        issue_key: &str,
        time_spent: Duration,
        comment: &str,
        started_at: DateTime<FixedOffset>,
    ) -> Result<(), RemoteError> {
        debug!(
            "Logging {}m on {issue_key} started {started_at}",
            time_spent.num_minutes()
        );
        let response = self
            .post(&format!("/rest/api/2/issue/{issue_key}/worklog"))
            .json(&json!({
                "timeSpentSeconds": time_spent.num_seconds(),
                "comment": comment,
                "started": format_started(started_at),
            }))
            .send()
            .await?;
        Self::check(response, "work log", issue_key).await?;
        Ok(())
    }
}
