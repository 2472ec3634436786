// CLI client commands: create, list, show, generate, logs, stats

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use super::{base_url, connection_error_message};

/// Thin HTTP client for the service API. Non-success responses become errors
/// carrying the server's `message`.
pub struct ApiClient {
    client: Client,
    host: String,
    port: u16,
}

impl ApiClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: Client::new(),
            host: host.to_string(),
            port,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", base_url(&self.host, self.port), path)
    }

    fn handle_request_error(&self, err: reqwest::Error) -> anyhow::Error {
        if err.is_connect() || err.is_timeout() {
            anyhow::anyhow!("{}", connection_error_message(&self.host, self.port))
        } else {
            anyhow::anyhow!("Request failed: {}", err)
        }
    }

    async fn send(&self, request: RequestBuilder) -> anyhow::Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| self.handle_request_error(e))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("Unknown error");
            anyhow::bail!("{} ({})", message, status);
        }
        Ok(body)
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.send(self.client.get(self.url(path))).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }
}

fn format_timestamp(raw: &Value) -> String {
    raw.as_str()
        .and_then(|ts| ts.parse::<DateTime<Utc>>().ok())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

/// epl create
pub async fn cmd_create(
    client: &ApiClient,
    title: &str,
    episode: u32,
    script: Option<&str>,
) -> anyhow::Result<()> {
    let body = json!({
        "title": title,
        "episode_number": episode,
        "script": script,
    });
    let job = client.post("/api/jobs", &body).await?;

    println!("Job created.");
    println!("  ID:      {}", job["id"].as_str().unwrap_or("unknown"));
    println!("  Title:   {}", title);
    println!("  Episode: {}", episode);
    Ok(())
}

/// epl list
pub async fn cmd_list(client: &ApiClient, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let path = match status {
        Some(s) => format!("/api/jobs?status={}", s),
        None => "/api/jobs".to_string(),
    };
    let body = client.get(&path).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let empty = vec![];
    let jobs = body.as_array().unwrap_or(&empty);
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<38}{:<24}{:<6}{:<20}{:<6}{:<20}",
        "ID", "TITLE", "EP", "STATUS", "PCT", "UPDATED"
    );
    for job in jobs {
        println!(
            "{:<38}{:<24}{:<6}{:<20}{:<6}{:<20}",
            job["id"].as_str().unwrap_or("?"),
            truncate(job["title"].as_str().unwrap_or("?"), 23),
            job["episode_number"].as_u64().unwrap_or(0),
            job["status"].as_str().unwrap_or("?"),
            format!("{}%", job["progress"].as_u64().unwrap_or(0)),
            format_timestamp(&job["updated_at"]),
        );
    }
    Ok(())
}

fn print_log_line(entry: &Value) {
    let elapsed = entry["execution_time_ms"]
        .as_u64()
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<6}{:<20}{:<24}{:<12}{:<10}{}",
        entry["seq"].as_u64().unwrap_or(0),
        format_timestamp(&entry["created_at"]),
        entry["task_type"].as_str().unwrap_or("?"),
        entry["outcome"].as_str().unwrap_or("?"),
        elapsed,
        entry["message"].as_str().unwrap_or(""),
    );
}

fn print_log_header() {
    println!(
        "{:<6}{:<20}{:<24}{:<12}{:<10}{}",
        "SEQ", "TIME", "TASK", "OUTCOME", "ELAPSED", "MESSAGE"
    );
}

/// epl show
pub async fn cmd_show(client: &ApiClient, id: &str, json: bool) -> anyhow::Result<()> {
    let job = client.get(&format!("/api/jobs/{}", id)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("Job {}", job["id"].as_str().unwrap_or(id));
    println!("  Title:    {}", job["title"].as_str().unwrap_or("?"));
    println!("  Episode:  {}", job["episode_number"].as_u64().unwrap_or(0));
    println!(
        "  Status:   {} ({}%)",
        job["status"].as_str().unwrap_or("?"),
        job["progress"].as_u64().unwrap_or(0)
    );
    if let Some(message) = job["message"].as_str() {
        println!("  Message:  {}", message);
    }
    println!("  Created:  {}", format_timestamp(&job["created_at"]));
    println!("  Updated:  {}", format_timestamp(&job["updated_at"]));

    if let Some(artifacts) = job["artifacts"].as_object().filter(|a| !a.is_empty()) {
        println!("  Artifacts:");
        for (key, artifact) in artifacts {
            println!(
                "    {:<12} {} (from {})",
                key,
                artifact["value"].as_str().unwrap_or("?"),
                artifact["stage"].as_str().unwrap_or("?")
            );
        }
    }

    let empty = vec![];
    let logs = job["logs"].as_array().unwrap_or(&empty);
    if !logs.is_empty() {
        println!();
        print_log_header();
        for entry in logs {
            print_log_line(entry);
        }
    }
    Ok(())
}

/// epl generate
pub async fn cmd_generate(client: &ApiClient, id: &str, regenerate: bool) -> anyhow::Result<()> {
    let accepted = client
        .post(
            &format!("/api/jobs/{}/generate", id),
            &json!({ "regenerate": regenerate }),
        )
        .await?;

    println!(
        "Pipeline started for job {} (run {}).",
        accepted["job_id"].as_str().unwrap_or(id),
        accepted["run_id"].as_str().unwrap_or("unknown")
    );
    println!("Use 'epl show {}' to follow progress.", id);
    Ok(())
}

/// epl logs
pub async fn cmd_logs(client: &ApiClient, id: &str, limit: usize, json: bool) -> anyhow::Result<()> {
    let page = client
        .get(&format!("/api/jobs/{}/logs?limit={}", id, limit))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    let empty = vec![];
    let logs = page["logs"].as_array().unwrap_or(&empty);
    if logs.is_empty() {
        println!("No log entries.");
        return Ok(());
    }

    print_log_header();
    for entry in logs {
        print_log_line(entry);
    }
    let total = page["total"].as_u64().unwrap_or(0);
    if total as usize > logs.len() {
        println!("({} of {} entries shown)", logs.len(), total);
    }
    Ok(())
}

/// epl stats
pub async fn cmd_stats(client: &ApiClient, id: &str) -> anyhow::Result<()> {
    let body = client
        .get(&format!("/api/jobs/{}/logs/statistics", id))
        .await?;

    let empty = vec![];
    let stats = body["statistics"].as_array().unwrap_or(&empty);
    if stats.is_empty() {
        println!("No log entries.");
        return Ok(());
    }

    println!(
        "{:<28}{:<8}{:<11}{:<10}",
        "TASK", "TOTAL", "COMPLETED", "AVG MS"
    );
    for row in stats {
        println!(
            "{:<28}{:<8}{:<11}{:<10.1}",
            row["task_type"].as_str().unwrap_or("?"),
            row["total"].as_u64().unwrap_or(0),
            row["completed"].as_u64().unwrap_or(0),
            row["avg_execution_time_ms"].as_f64().unwrap_or(0.0),
        );
    }
    Ok(())
}
