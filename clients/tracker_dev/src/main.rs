use anyhow::Context;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tracker_dev", version)]
struct Args {
    /// Tracker base URL, e.g. http://127.0.0.1:17610
    #[arg(long, default_value = "http://127.0.0.1:17610")]
    core_url: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Checkpoint the running session.
    Flush,
    /// Print today's bucket.
    Today,
    /// Print the day index with every referenced bucket.
    Days,
    /// Print every stored `day:*` key, referenced or not.
    Keys,
    /// Print the session state and focus/idle flags.
    State,
    /// Print recent engine events.
    Trace {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the aggregated report, or one domain's daily series.
    Report {
        #[arg(long, default_value_t = 7)]
        top: usize,
        #[arg(long, default_value_t = 60_000)]
        min_ms: u64,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Credit a synthetic interval ending now.
    AddInterval {
        domain: String,
        /// Interval length in minutes.
        #[arg(long, default_value_t = 5)]
        minutes: i64,
        /// How many minutes before now the interval ends.
        #[arg(long, default_value_t = 0)]
        ago_minutes: i64,
    },
    /// Pretend a tab with `url` is focused, starting a session for it.
    Visit {
        url: String,
        #[arg(long, default_value_t = 900_001)]
        tab_id: i64,
        #[arg(long, default_value_t = 900_001)]
        window_id: i64,
    },
    /// Seed `example.com` buckets N days back (defaults to 0-7, 10 and 20).
    SeedDays {
        #[arg(value_delimiter = ',')]
        days_ago: Vec<u32>,
    },
    /// Delete all stored data.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracker_dev=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let base = args.core_url.trim_end_matches('/').to_string();
    let client = Client::new();

    let out = match args.cmd {
        Cmd::Flush => post(&client, &base, "/flush", json!({})).await?,
        Cmd::Today => get(&client, &base, "/days/today", &[]).await?,
        Cmd::Days => get(&client, &base, "/days", &[]).await?,
        Cmd::Keys => get(&client, &base, "/keys", &[]).await?,
        Cmd::State => get(&client, &base, "/state", &[]).await?,
        Cmd::Trace { limit } => {
            get(&client, &base, "/trace", &[("limit", limit.to_string())]).await?
        }
        Cmd::Report {
            top,
            min_ms,
            domain,
        } => get(&client, &base, "/report", &report_query(top, min_ms, domain)).await?,
        Cmd::AddInterval {
            domain,
            minutes,
            ago_minutes,
        } => {
            let end_ms = chrono::Utc::now().timestamp_millis() - ago_minutes * 60_000;
            let start_ms = end_ms - minutes * 60_000;
            info!("adding {minutes}m for {domain}");
            post(
                &client,
                &base,
                "/dev/add_interval",
                json!({ "domain": domain, "startMs": start_ms, "endMs": end_ms }),
            )
            .await?
        }
        Cmd::Visit {
            url,
            tab_id,
            window_id,
        } => {
            post(
                &client,
                &base,
                "/signal",
                json!({
                    "kind": "tab_activated",
                    "tabId": tab_id,
                    "windowId": window_id,
                    "tab": { "id": tab_id, "windowId": window_id, "url": url, "active": true }
                }),
            )
            .await?;
            // Focus resumes from the window's active tab, i.e. the one above.
            post(
                &client,
                &base,
                "/signal",
                json!({ "kind": "window_focus_changed", "windowId": window_id }),
            )
            .await?;
            get(&client, &base, "/state", &[]).await?
        }
        Cmd::SeedDays { days_ago } => {
            let body = if days_ago.is_empty() {
                json!({})
            } else {
                json!({ "daysAgo": days_ago })
            };
            post(&client, &base, "/dev/seed_days", body).await?
        }
        Cmd::Reset => post(&client, &base, "/dev/reset", json!({})).await?,
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn report_query(top: usize, min_ms: u64, domain: Option<String>) -> Vec<(&'static str, String)> {
    let mut query = vec![("top", top.to_string()), ("min_ms", min_ms.to_string())];
    if let Some(d) = domain {
        query.push(("domain", d));
    }
    query
}

async fn get(
    client: &Client,
    base: &str,
    path: &str,
    query: &[(&str, String)],
) -> anyhow::Result<Value> {
    let url = format!("{base}{path}");
    let resp = client
        .get(&url)
        .query(query)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    read_envelope(resp).await
}

async fn post(client: &Client, base: &str, path: &str, body: Value) -> anyhow::Result<Value> {
    let url = format!("{base}{path}");
    let resp = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    read_envelope(resp).await
}

async fn read_envelope(resp: reqwest::Response) -> anyhow::Result<Value> {
    let status = resp.status();
    let body: Envelope = resp.json().await.context("response is not an envelope")?;
    unwrap_envelope(status, body)
}

fn unwrap_envelope(status: reqwest::StatusCode, body: Envelope) -> anyhow::Result<Value> {
    if !status.is_success() || !body.ok {
        let msg = body.error.as_deref().unwrap_or("request failed");
        anyhow::bail!("{status}: {msg}");
    }
    Ok(body.data.unwrap_or(Value::Null))
}
