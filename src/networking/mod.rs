use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::util::{cancel_requested, format_speed};

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "nlul-launcher tag fetch";

/// Upper bound for connection probes. The OS default can stall a launch for minutes.
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct GitHubTag {
    name: Option<String>,
}

#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    /// Name of the newest tag of a GitHub repository (`owner/name`).
    pub async fn latest_tag(&self, repository: &str) -> Result<String, String> {
        let url = format!("{GITHUB_API}/repos/{repository}/tags");
        debug!("network: fetching tags from {url}");
        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| format!("failed to fetch tags for {repository}: {e}"))?;

        if !response.status().is_success() {
            return Err(format!(
                "GitHub API returned status {} for {repository}",
                response.status()
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read tags for {repository}: {e}"))?;
        first_tag(&body)
    }

    /// Download a file to `dest`, calling `progress` with (downloaded, total, speed_text).
    ///
    /// Data goes to a `.part` sibling that is renamed into place once complete, so
    /// `dest` never holds a truncated file. A raised `cancel` flag stops the transfer.
    pub async fn download_to_path<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: Option<Arc<AtomicBool>>,
        progress: F,
    ) -> Result<(), String>
    where
        F: FnMut(u64, Option<u64>, &str),
    {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create download dir: {e}"))?;
        }
        let part = partial_path(dest);
        if let Err(err) = self.stream_to_file(url, &part, cancel, progress).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(err);
        }
        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| format!("failed to move download into place: {e}"))
    }

    async fn stream_to_file<F>(
        &self,
        url: &str,
        path: &Path,
        cancel: Option<Arc<AtomicBool>>,
        mut progress: F,
    ) -> Result<(), String>
    where
        F: FnMut(u64, Option<u64>, &str),
    {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| format!("download request failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("download status error: {e}"))?;

        let mut file = File::create(path)
            .await
            .map_err(|e| format!("failed to create file: {e}"))?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_tick = Instant::now();
        let mut last_bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            if cancel_requested(&cancel) {
                return Err("download cancelled".into());
            }
            let chunk = chunk.map_err(|e| format!("stream error: {e}"))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("write error: {e}"))?;
            downloaded += chunk.len() as u64;

            let since = last_tick.elapsed().as_secs_f32();
            if since > 0.2 {
                let speed = (downloaded - last_bytes) as f32 / since;
                progress(downloaded, total, &format_speed(speed));
                last_tick = Instant::now();
                last_bytes = downloaded;
            }
        }

        progress(downloaded, total, "0 B/s");

        file.flush()
            .await
            .map_err(|e| format!("flush error: {e}"))?;

        if let Some(total) = total
            && downloaded < total
        {
            return Err(format!(
                "download incomplete: received {downloaded} of {total} bytes"
            ));
        }

        Ok(())
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn first_tag(body: &str) -> Result<String, String> {
    let tags: Vec<GitHubTag> =
        serde_json::from_str(body).map_err(|e| format!("failed to parse tags: {e}"))?;
    tags.into_iter()
        .next()
        .ok_or_else(|| "repository has no tags".to_owned())?
        .name
        .ok_or_else(|| "GitHub API returned tag without a name".to_owned())
}

/// Whether a TCP connection to `host:port` succeeds within `limit`.
pub async fn tcp_probe(host: &str, port: u16, limit: Duration) -> bool {
    let target = format!("{host} port {port}");
    let ok = matches!(timeout(limit, TcpStream::connect((host, port))).await, Ok(Ok(_)));
    if ok {
        debug!("network: TCP probe {target} ok");
    } else {
        debug!("network: TCP probe {target} failed");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn picks_first_tag() {
        let body = r#"[{"name": "v0.4.0", "commit": {}}, {"name": "v0.3.0"}]"#;
        assert_eq!(first_tag(body).unwrap(), "v0.4.0");
    }

    #[test]
    fn rejects_empty_or_nameless_tags() {
        assert!(first_tag("[]").is_err());
        assert!(first_tag(r#"[{"commit": {}}]"#).is_err());
        assert!(first_tag("{\"message\": \"API rate limit exceeded\"}").is_err());
    }

    #[tokio::test]
    async fn reports_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_probe("127.0.0.1", port, TCP_PROBE_TIMEOUT).await);

        drop(listener);
        assert!(!tcp_probe("127.0.0.1", port, TCP_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn connects_to_ipv6_literals() {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            // Host without IPv6 loopback.
            return;
        };
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_probe("::1", port, TCP_PROBE_TIMEOUT).await);
    }

    /// Serve one response that promises `declared` bytes but sends `body`.
    async fn serve_once(body: &'static [u8], declared: usize) -> String {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n");
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        format!("http://{addr}/file")
    }

    #[tokio::test]
    async fn completed_download_lands_at_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("mod.dll");
        let url = serve_once(b"0123456789", 10).await;

        NetworkClient::new()
            .download_to_path(&url, &dest, None, |_, _, _| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn truncated_download_leaves_no_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("mod.dll");
        let url = serve_once(b"0123456789", 100).await;

        let result = NetworkClient::new()
            .download_to_path(&url, &dest, None, |_, _, _| {})
            .await;
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn partial_path_is_a_sibling() {
        let dest = Path::new("/tmp/wine-download.tar.xz");
        assert_eq!(partial_path(dest), Path::new("/tmp/wine-download.tar.xz.part"));
    }
}
