//! CLI commands implementation

use anyhow::Result;
use chrono::{DateTime, Utc};
use gantry_core::{
    CreateSessionRequest, DashboardData, Interaction, ModelInstanceState, ModelName, OwnerType,
    RunnerTaskResponse, Session, SessionMode, SessionStatus, SessionSummary, SessionType,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    owner: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, owner: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header("x-owner", &self.owner)
            .header("x-owner-type", "user")
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("x-owner", &self.owner)
            .header("x-owner-type", "user")
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .delete(self.url(path))
            .header("x-owner", &self.owner)
            .header("x-owner-type", "user")
    }
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub queued_sessions: usize,
    pub instances: usize,
    pub runners: usize,
    pub local_instances: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Pull the message out of an API error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

/// Arguments for `create`
pub struct CreateArgs {
    pub session_type: SessionType,
    pub mode: SessionMode,
    pub prompt: String,
    pub model: Option<String>,
    pub finetune_file: String,
    pub name: String,
}

fn parse_session_id(id: &str) -> Result<String> {
    Uuid::parse_str(id)
        .map(|u| u.to_string())
        .map_err(|_| anyhow::anyhow!("'{}' is not a session ID", id))
}

/// Render the time since `created` as a short age like `42s` or `3h`
fn format_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86400),
    }
}

fn format_memory(bytes: u64) -> String {
    format!("{:.1}GB", bytes as f64 / 1e9)
}

/// List sessions
pub async fn ps(client: &ApiClient) -> Result<()> {
    let response = client.get("/api/v1/sessions").send().await?;

    if response.status().is_success() {
        let sessions: Vec<SessionSummary> = response.json().await?;

        if sessions.is_empty() {
            println!("No sessions found");
        } else {
            let now = Utc::now();
            println!(
                "{:<36} {:<10} {:<6} {:<36} {:<9} {:<5}",
                "ID", "MODE", "TYPE", "MODEL", "STATUS", "AGE"
            );
            println!("{}", "-".repeat(107));
            for s in sessions {
                println!(
                    "{:<36} {:<10} {:<6} {:<36} {:<9} {:<5}",
                    s.id,
                    s.mode.to_string(),
                    s.session_type.to_string(),
                    s.model_name.to_string(),
                    s.status.to_string(),
                    format_age(s.created, now)
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list sessions: {}", error_message(&error));
    }

    Ok(())
}

/// Show one session
pub async fn get(client: &ApiClient, id: String) -> Result<()> {
    let id = parse_session_id(&id)?;
    let response = client.get(&format!("/api/v1/sessions/{}", id)).send().await?;

    if response.status().is_success() {
        let session: Session = response.json().await?;
        print_session_details(&session);
    } else {
        let error = response.text().await?;
        eprintln!("Session not found: {}", error_message(&error));
    }

    Ok(())
}

/// Create a session
pub async fn create(client: &ApiClient, args: CreateArgs) -> Result<()> {
    let model_name = args
        .model
        .as_deref()
        .map(str::parse::<ModelName>)
        .transpose()?;

    let req = CreateSessionRequest {
        mode: args.mode,
        session_type: args.session_type,
        model_name,
        name: args.name,
        message: args.prompt,
        files: Vec::new(),
        finetune_file: args.finetune_file,
    };
    req.validate()?;

    let response = client.post("/api/v1/sessions").json(&req).send().await?;

    if response.status().is_success() {
        let session: Session = response.json().await?;
        println!("Session {} queued", session.id);
        println!("  Model: {}", session.model_name);
        println!("  Mode: {}", session.mode);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to create session: {}", error_message(&error));
    }

    Ok(())
}

/// Delete a session
pub async fn delete(client: &ApiClient, id: String) -> Result<()> {
    let id = parse_session_id(&id)?;
    let response = client
        .delete(&format!("/api/v1/sessions/{}", id))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Session '{}' deleted", id);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to delete session: {}", error_message(&error));
    }

    Ok(())
}

/// Show local model instances
pub async fn instances(client: &ApiClient) -> Result<()> {
    let response = client.get("/api/v1/instances").send().await?;

    if response.status().is_success() {
        let instances: Vec<ModelInstanceState> = response.json().await?;
        print_instances(&instances);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list instances: {}", error_message(&error));
    }

    Ok(())
}

fn print_instances(instances: &[ModelInstanceState]) {
    if instances.is_empty() {
        println!("No model instances running");
        return;
    }

    let now = Utc::now();
    println!(
        "{:<36} {:<36} {:<10} {:<9} {:<7} {:<6} {:<5}",
        "ID", "MODEL", "MODE", "STATUS", "MEMORY", "QUEUE", "IDLE"
    );
    println!("{}", "-".repeat(115));
    for i in instances {
        let status = if i.stale {
            format!("{}*", i.status)
        } else {
            i.status.to_string()
        };
        println!(
            "{:<36} {:<36} {:<10} {:<9} {:<7} {:<6} {:<5}",
            i.id,
            i.model_name.to_string(),
            i.mode.to_string(),
            status,
            format_memory(i.memory),
            i.queued_session_ids.len(),
            format_age(i.last_activity, now)
        );
        if !i.lora_dir.is_empty() {
            println!("  adapter: {}", i.lora_dir);
        }
    }
}

/// Show system status
pub async fn top(client: &ApiClient) -> Result<()> {
    let response = client.get("/api/v1/status").send().await?;

    if !response.status().is_success() {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error_message(&error));
        return Ok(());
    }
    let status: StatusResponse = response.json().await?;

    println!("gantry v{}", status.version);
    println!();
    println!("Queued sessions: {}", status.queued_sessions);
    println!("Runners: {}", status.runners);
    if status.local_instances {
        println!("Local instances: {}", status.instances);
    } else {
        println!("Local instances: disabled");
    }

    let response = client.get("/api/v1/dashboard").send().await?;
    if response.status().is_success() {
        let dashboard: DashboardData = response.json().await?;
        let now = Utc::now();

        if !dashboard.session_queue.is_empty() {
            println!("\nQueue:");
            for s in &dashboard.session_queue {
                println!(
                    "  {} {} {} ({} waiting)",
                    s.id,
                    s.model_name,
                    s.mode,
                    format_age(s.created, now)
                );
            }
        }

        if !dashboard.runners.is_empty() {
            println!("\nRunners:");
            for r in &dashboard.runners {
                println!(
                    "  {} - {}/{} free, {} instances",
                    r.id,
                    format_memory(r.free_memory),
                    format_memory(r.total_memory),
                    r.model_instances.len()
                );
            }
        }

        if !dashboard.instances.is_empty() {
            println!();
            print_instances(&dashboard.instances);
        }
    }

    Ok(())
}

/// Submit a session straight to a runner and wait for its answer
pub async fn run(
    client: &ApiClient,
    runner_url: &str,
    session_type: SessionType,
    prompt: String,
) -> Result<()> {
    let mut session = Session::new(
        SessionMode::Inference,
        session_type,
        ModelName::for_session_type(session_type),
        client.owner.clone(),
        OwnerType::User,
    );
    session.interactions.push(Interaction::user(prompt, Vec::new()));
    session.interactions.push(Interaction::system_waiting());

    let url = format!("{}/api/v1/worker/session", runner_url.trim_end_matches('/'));
    debug!(session_id = %session.id, url = %url, "Submitting session directly");

    let response = client.client.post(&url).json(&session).send().await?;

    if response.status().is_success() {
        let result: RunnerTaskResponse = response.json().await?;
        if result.error.is_empty() {
            if !result.message.is_empty() {
                println!("{}", result.message);
            }
            for file in &result.files {
                println!("{}", file);
            }
        } else {
            eprintln!("Runner failed: {}", result.error);
        }
    } else {
        let error = response.text().await?;
        eprintln!("Runner rejected session: {}", error_message(&error));
    }

    Ok(())
}

/// Helper to print session details
fn print_session_details(session: &Session) {
    println!("Session: {}", session.id);
    if !session.name.is_empty() {
        println!("  Name: {}", session.name);
    }
    println!("  Model: {}", session.model_name);
    println!("  Mode: {} ({})", session.mode, session.session_type);
    println!("  Status: {}", session.status);
    if !session.finetune_file.is_empty() {
        println!("  Adapter: {}", session.finetune_file);
    }
    if session.status == SessionStatus::Complete && !session.lora_dir.is_empty() {
        println!("  Produced adapter: {}", session.lora_dir);
    }

    println!("\nInteractions:");
    for interaction in &session.interactions {
        let who = match interaction.creator {
            gantry_core::CreatorType::User => "user",
            gantry_core::CreatorType::System => "system",
        };
        let text = if interaction.error.is_empty() {
            interaction.message.as_str()
        } else {
            interaction.error.as_str()
        };
        println!("  [{}] {}", who, text);
        for file in &interaction.files {
            println!("      {}", file);
        }
    }
}
