//! Device preview stream
//!
//! The preview server is an external helper that mirrors a device screen as an
//! MJPEG stream. It prints the stream URL on stdout once ready and accepts
//! input commands on stdin, one per line:
//!
//! ```text
//! touchDown 0.5 0.25
//! keyUp 40
//! paste some text
//! ```

use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::mpsc;

use simdemon_core::events::ProcessEvent;
use simdemon_core::prelude::*;
use simdemon_core::{KeyDirection, TouchType};

use crate::process::{ManagedProcess, ProcessSpec};

static STREAM_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(http://[^ ]*stream\.mjpeg)").expect("Invalid stream URL regex")
});

/// Extract the MJPEG stream URL from a line of preview server output
pub fn parse_stream_url(line: &str) -> Option<String> {
    STREAM_URL
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// A running preview server
pub struct Preview {
    process: ManagedProcess,
    stream_url: String,
}

impl Preview {
    /// Spawn the preview server and wait for it to report its stream URL.
    ///
    /// Fails with [`Error::Preview`] if the server exits before printing one.
    pub async fn start(spec: &ProcessSpec) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<ProcessEvent>(64);
        let process = ManagedProcess::spawn(spec, tx)
            .map_err(|e| Error::preview(format!("failed to start preview server: {e}")))?;

        let stream_url = loop {
            match rx.recv().await {
                Some(ProcessEvent::Stdout(line)) | Some(ProcessEvent::Stderr(line)) => {
                    if let Some(url) = parse_stream_url(&line) {
                        debug!("Preview server ready {}", url);
                        break url;
                    }
                    debug!("Preview server: {}", line);
                }
                Some(ProcessEvent::Exited { code }) => {
                    return Err(Error::preview(format!(
                        "preview server exited without URL (code {code:?})"
                    )));
                }
                None => return Err(Error::preview("preview server output closed")),
            }
        };

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                        trace!("Preview server: {}", line);
                    }
                    ProcessEvent::Exited { code } => {
                        debug!("Preview server exited with {:?}", code);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            process,
            stream_url,
        })
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    /// Touch at a point given as ratios of the screen size
    pub async fn send_touch(&self, x: f64, y: f64, touch: TouchType) -> Result<()> {
        self.process
            .send_line(format!("{} {} {}", touch.command(), x, y))
            .await
    }

    pub async fn send_key(&self, key_code: u32, direction: KeyDirection) -> Result<()> {
        self.process
            .send_line(format!("{} {}", direction.command(), key_code))
            .await
    }

    pub async fn send_paste(&self, text: &str) -> Result<()> {
        // The protocol is line based
        let text = text.replace(['\r', '\n'], " ");
        self.process.send_line(format!("paste {text}")).await
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn dispose(&self) {
        self.process.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").args(["-c", script])
    }

    #[test]
    fn test_parse_stream_url() {
        assert_eq!(
            parse_stream_url("Streaming on http://127.0.0.1:8123/stream.mjpeg now").as_deref(),
            Some("http://127.0.0.1:8123/stream.mjpeg")
        );
        assert_eq!(parse_stream_url("booting..."), None);
        assert_eq!(parse_stream_url("https://example.com/stream.mjpeg"), None);
    }

    #[tokio::test]
    async fn test_start_waits_for_url() {
        let preview = Preview::start(&sh(
            "echo starting; echo 'ready http://localhost:9000/stream.mjpeg'; sleep 30",
        ))
        .await
        .unwrap();
        assert_eq!(preview.stream_url(), "http://localhost:9000/stream.mjpeg");
        assert!(preview.is_running());
        preview.dispose();
    }

    #[tokio::test]
    async fn test_exit_without_url_is_error() {
        let result = Preview::start(&sh("echo no url here")).await;
        assert!(matches!(result, Err(Error::Preview { .. })));
    }

    #[tokio::test]
    async fn test_input_commands_reach_server() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("input.txt");
        let script = format!(
            "echo http://localhost:1/stream.mjpeg; read a; read b; read c; printf '%s\\n%s\\n%s\\n' \"$a\" \"$b\" \"$c\" > {}",
            out.display()
        );
        let preview = Preview::start(&sh(&script)).await.unwrap();

        preview.send_touch(0.5, 0.25, TouchType::Down).await.unwrap();
        preview.send_key(40, KeyDirection::Up).await.unwrap();
        preview.send_paste("hello\nworld").await.unwrap();

        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&out).unwrap_or_default();
            if content.lines().count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            content.lines().collect::<Vec<_>>(),
            vec!["touchDown 0.5 0.25", "keyUp 40", "paste hello world"]
        );
    }
}
