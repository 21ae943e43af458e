//! Control-plane calls against the models endpoint: listing, auto-detection
//! and readiness polling.

use anyhow::{Result, anyhow, bail};
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};

use super::{Endpoint, Protocol};

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
}

fn models_url(protocol: Protocol, base_url: &str) -> Result<String> {
    let endpoint = Endpoint::parse(base_url).map_err(|e| anyhow!("invalid base URL {}: {}", base_url, e))?;
    let scheme = if endpoint.tls { "https" } else { "http" };
    Ok(format!(
        "{}://{}{}",
        scheme,
        endpoint.authority,
        protocol.api_path(&endpoint.base_path, "models")
    ))
}

/// List the models served at `base_url`.
pub async fn list_models(
    protocol: Protocol,
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Model>> {
    let client = Client::builder().timeout(timeout).build()?;
    let url = models_url(protocol, base_url)?;

    let mut req = client.get(&url);
    for (name, value) in protocol.auth_headers(api_key) {
        req = req.header(name, value);
    }

    let response = req
        .send()
        .await
        .map_err(|e| anyhow!("Failed to query models endpoint: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        bail!("Models endpoint returned {}: {}", status, text);
    }

    let models: ModelsResponse = response
        .json()
        .await
        .map_err(|e| anyhow!("Failed to parse models response: {}", e))?;

    Ok(models.data)
}

/// First model advertised by the server.
pub async fn detect_model(
    protocol: Protocol,
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    let models = list_models(protocol, base_url, api_key, timeout).await?;

    let Some(first) = models.first() else {
        bail!("No models available from server at {}", base_url);
    };

    if models.len() > 1 {
        info!("Found {} models, using: {}", models.len(), first.id);
        debug!(
            "Available models: {:?}",
            models.iter().map(|m| &m.id).collect::<Vec<_>>()
        );
    } else {
        info!("Detected model: {}", first.id);
    }

    Ok(first.id.clone())
}

/// Poll the models endpoint until it answers or `total_timeout` passes.
///
/// A successful listing means the server can serve requests, not merely that
/// the process is up.
pub async fn check_server_ready(
    protocol: Protocol,
    base_url: &str,
    api_key: Option<&str>,
    total_timeout: Duration,
    retry_interval: Duration,
) -> Result<()> {
    let start_time = Instant::now();
    let mut attempt = 0u32;

    info!("Waiting for server to be ready at {}...", base_url);

    loop {
        attempt += 1;
        debug!("Server readiness check attempt {}", attempt);

        let attempt_timeout = Duration::from_secs(10).min(total_timeout.max(Duration::from_secs(1)));
        match list_models(protocol, base_url, api_key, attempt_timeout).await {
            Ok(models) => {
                info!(
                    "Server is ready ({} model{} available after {:.1}s)",
                    models.len(),
                    if models.len() == 1 { "" } else { "s" },
                    start_time.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            Err(e) => debug!("Models endpoint not ready: {}", e),
        }

        let elapsed = start_time.elapsed();
        let remaining = total_timeout.saturating_sub(elapsed);
        if remaining.is_zero() {
            bail!(
                "Server readiness timeout after {:.1}s. Server at {} did not become ready.",
                total_timeout.as_secs_f64(),
                base_url
            );
        }

        if attempt % 6 == 0 {
            info!(
                "Still waiting for server (elapsed: {:.0}s, timeout: {:.0}s)...",
                elapsed.as_secs_f64(),
                total_timeout.as_secs_f64()
            );
        }

        tokio::time::sleep(retry_interval.min(remaining)).await;
    }
}
