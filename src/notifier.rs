//! Execution notifications: a pre-run webhook when an execution starts and
//! webhook/cronitor deliveries once a run finishes.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::Config;
use crate::error::{CronmeshError, Result};
use crate::execution::Execution;
use crate::job::Job;

pub struct Notifier {
    http: reqwest::Client,
    pre_webhook_endpoint: Option<String>,
    pre_webhook_payload: Option<String>,
    webhook_endpoint: Option<String>,
    webhook_payload: Option<String>,
    webhook_headers: Vec<String>,
    cronitor_endpoint: Option<String>,
}

impl Notifier {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            pre_webhook_endpoint: config.pre_webhook_endpoint.clone(),
            pre_webhook_payload: config.pre_webhook_payload.clone(),
            webhook_endpoint: config.webhook_endpoint.clone(),
            webhook_payload: config.webhook_payload.clone(),
            webhook_headers: config.webhook_headers.clone(),
            cronitor_endpoint: config.cronitor_endpoint.clone(),
        }
    }

    /// Fired when an execution transitions to running (first stream frame).
    pub async fn send_pre_notifications(&self, job: &Job, execution: &Execution) -> Result<()> {
        if let Some(endpoint) = &self.pre_webhook_endpoint {
            let payload = self
                .pre_webhook_payload
                .as_deref()
                .map(|template| render_template(template, job, execution))
                .unwrap_or_else(|| default_payload(job, execution));
            self.post_webhook(endpoint, payload).await?;
        }
        Ok(())
    }

    /// Fired once per execution after the run (and any retries) finished.
    pub async fn send_post_notifications(
        &self,
        job: &Job,
        execution: &Execution,
        _group: &[Execution],
    ) -> Result<()> {
        if let Some(endpoint) = &self.webhook_endpoint {
            let payload = self
                .webhook_payload
                .as_deref()
                .map(|template| render_template(template, job, execution))
                .unwrap_or_else(|| default_payload(job, execution));
            self.post_webhook(endpoint, payload).await?;
        }

        if let Some(endpoint) = &self.cronitor_endpoint {
            let state = if execution.success { "complete" } else { "fail" };
            let url = format!("{endpoint}?state={state}&job={}", execution.job_name);
            self.http
                .get(&url)
                .send()
                .await
                .map_err(|e| CronmeshError::Internal(format!("cronitor ping failed: {e}")))?;
            tracing::debug!(job = %execution.job_name, state, "notifier: cronitor pinged");
        }

        Ok(())
    }

    async fn post_webhook(&self, endpoint: &str, payload: String) -> Result<()> {
        let mut headers = HeaderMap::new();
        for header in &self.webhook_headers {
            if let Some((name, value)) = header.split_once(':') {
                let name = name.trim().parse::<HeaderName>();
                let value = value.trim().parse::<HeaderValue>();
                if let (Ok(name), Ok(value)) = (name, value) {
                    headers.insert(name, value);
                }
            }
        }

        let response = self
            .http
            .post(endpoint)
            .headers(headers)
            .body(payload)
            .send()
            .await
            .map_err(|e| CronmeshError::Internal(format!("webhook delivery failed: {e}")))?;

        tracing::debug!(endpoint, status = %response.status(), "notifier: webhook delivered");
        Ok(())
    }
}

/// Expand `{{field}}` tokens in a payload template from the execution
/// record.
fn render_template(template: &str, job: &Job, execution: &Execution) -> String {
    let replacements = [
        ("{{job_name}}", execution.job_name.clone()),
        ("{{node_name}}", execution.node_name.clone()),
        (
            "{{output}}",
            String::from_utf8_lossy(&execution.output).to_string(),
        ),
        ("{{success}}", execution.success.to_string()),
        ("{{started_at}}", format_time(execution.started_at)),
        ("{{finished_at}}", format_time(execution.finished_at)),
        ("{{attempt}}", execution.attempt.to_string()),
        ("{{group}}", execution.group.to_string()),
        ("{{job_status}}", job.status.clone()),
    ];

    let mut rendered = template.to_string();
    for (token, value) in replacements {
        rendered = rendered.replace(token, &value);
    }
    rendered
}

fn default_payload(job: &Job, execution: &Execution) -> String {
    serde_json::json!({
        "job_name": execution.job_name,
        "node_name": execution.node_name,
        "success": execution.success,
        "output": String::from_utf8_lossy(&execution.output),
        "started_at": execution.started_at,
        "finished_at": execution.finished_at,
        "attempt": execution.attempt,
        "group": execution.group,
        "job_status": job.status,
    })
    .to_string()
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Job, Execution) {
        let job = Job {
            name: "job1".into(),
            status: crate::job::STATUS_SUCCESS.into(),
            ..Default::default()
        };
        let execution = Execution {
            job_name: "job1".into(),
            node_name: "node-a".into(),
            output: b"done".to_vec(),
            success: true,
            attempt: 2,
            group: 99,
            ..Execution::new("job1")
        };
        (job, execution)
    }

    #[test]
    fn test_render_template_expands_tokens() {
        let (job, execution) = sample();
        let rendered = render_template(
            "{{job_name}} on {{node_name}}: {{success}} ({{attempt}}) -> {{output}}",
            &job,
            &execution,
        );
        assert_eq!(rendered, "job1 on node-a: true (2) -> done");
    }

    #[test]
    fn test_render_template_leaves_unknown_tokens() {
        let (job, execution) = sample();
        let rendered = render_template("{{job_name}} {{unknown}}", &job, &execution);
        assert_eq!(rendered, "job1 {{unknown}}");
    }

    #[test]
    fn test_default_payload_is_json() {
        let (job, execution) = sample();
        let payload = default_payload(&job, &execution);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["job_name"], "job1");
        assert_eq!(value["success"], true);
        assert_eq!(value["job_status"], "success");
    }
}
