use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use chromiumoxide::async_process::Child;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use tokio::time::{timeout, Duration};

use crate::error::{AdapterError, AdapterErrorKind};

/// Reads Chromium's stderr until it prints the DevTools websocket endpoint.
pub async fn extract_ws_url(child: &mut Child) -> Result<String, AdapterError> {
    let stderr = child.stderr.take().ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::Launch).with_hint("chromium stderr is not piped")
    })?;
    let mut lines = BufReader::new(stderr).lines();
    let mut seen: Vec<String> = Vec::new();

    let scan = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| {
                AdapterError::new(AdapterErrorKind::Launch).with_hint(err.to_string())
            })?;
            if let Some(url) = parse_ws_line(&line) {
                return Ok(url);
            }
            if seen.len() < 8 {
                seen.push(line);
            }
        }
        Err(AdapterError::new(AdapterErrorKind::Launch).with_hint(format!(
            "chromium exited before announcing its devtools endpoint; stderr: {}",
            seen.join(" | ")
        )))
    };

    timeout(Duration::from_secs(20), scan).await.map_err(|_| {
        AdapterError::new(AdapterErrorKind::Launch)
            .with_hint("timed out waiting for the devtools websocket url")
    })?
}

fn parse_ws_line(line: &str) -> Option<String> {
    let (_, url) = line.rsplit_once("listening on ")?;
    let url = url.trim();
    (url.starts_with("ws") && url.contains("devtools/browser")).then(|| url.to_string())
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(StdDuration::ZERO)
        .as_millis() as u64
}
