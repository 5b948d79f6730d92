//! Launches a quick-tunnel binary next to the server and reports its public URL.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

lazy_static! {
    static ref TUNNEL_URL: Regex =
        Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").unwrap();
}

/// First public tunnel URL mentioned in a log line.
pub fn find_tunnel_url(line: &str) -> Option<&str> {
    TUNNEL_URL.find(line).map(|m| m.as_str())
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub binary: PathBuf,
    /// Local address the tunnel forwards to.
    pub local_url: String,
    /// How long to wait for the URL before giving up on it.
    pub timeout: Duration,
    pub url_file: Option<PathBuf>,
}

/// A running tunnel process. Dropping it kills the child.
pub struct Tunnel {
    child: Child,
    url: Option<String>,
}

impl Tunnel {
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("tunnel already gone: {e}");
        }
        info!("Tunnel stopped");
    }
}

/// Spawns `<binary> tunnel --url <local_url>` and waits up to the configured timeout for
/// it to print its public URL. A timeout only logs a warning; the tunnel keeps running.
pub async fn start(config: TunnelConfig) -> Result<Tunnel> {
    let mut child = Command::new(&config.binary)
        .args(["tunnel", "--url", &config.local_url])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to launch {}", config.binary.display()))?;
    info!("Tunnel starting via {}", config.binary.display());

    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, lines_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, lines_tx);
    }

    let scan = async {
        while let Some(line) = lines_rx.recv().await {
            if let Some(url) = find_tunnel_url(&line) {
                return Some(url.to_string());
            }
        }
        None
    };
    let url = tokio::time::timeout(config.timeout, scan).await.ok().flatten();

    // Keep draining so the child never blocks on a full pipe.
    tokio::spawn(async move { while lines_rx.recv().await.is_some() {} });

    match &url {
        Some(url) => {
            debug!("tunnel reported {url}");
            if let Some(path) = &config.url_file {
                // Write failures leave the tunnel running.
                if let Err(e) = tokio::fs::write(path, format!("{url}\n")).await {
                    warn!("failed to write {}: {e}", path.display());
                }
            }
        }
        None => warn!(
            "Tunnel did not report a public URL within {}s",
            config.timeout.as_secs()
        ),
    }
    Ok(Tunnel { child, url })
}

fn forward_lines<R>(reader: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(target: "kiln_server::tunnel::output", "{line}");
            if lines.send(line).is_err() {
                break;
            }
        }
    });
}
