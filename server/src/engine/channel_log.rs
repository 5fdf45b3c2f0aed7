use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Local;
use regex::Regex;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Tail reads return at most this many bytes.
pub const MAX_LOG_READ: u64 = 100 * 1024;

static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.(\d{1,3}\.\d{1,3})\b").expect("ipv4 pattern")
});
static IPV6_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){4}((?:[0-9a-fA-F]{1,4}:){3}[0-9a-fA-F]{1,4})\b")
        .expect("ipv6 pattern")
});

/// Redact the leading octets / groups of every address in `text`.
pub fn mask_addresses(text: &str) -> String {
    let v4 = IPV4_RE.replace_all(text, "x.x.${1}");
    IPV6_RE.replace_all(&v4, "x:x:x:x:${1}").into_owned()
}

enum LogOp {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Append-only per-room log. Writes go through a background task so callers
/// never wait on disk.
#[derive(Debug, Clone)]
pub struct ChannelLog {
    path: Option<PathBuf>,
    tx: Option<mpsc::UnboundedSender<LogOp>>,
}

impl ChannelLog {
    /// Log to `<dir>/<key>.log`. Must be called inside a tokio runtime.
    pub fn open(dir: &Path, key: &str) -> Self {
        let path = dir.join(format!("{key}.log"));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), rx));
        Self {
            path: Some(path),
            tx: Some(tx),
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self {
            path: None,
            tx: None,
        }
    }

    pub fn log(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        let Some(tx) = &self.tx else {
            debug!("{msg}");
            return;
        };
        let stamp = Local::now().format("%a %b %d %Y %H:%M:%S");
        let _ = tx.send(LogOp::Line(format!("[{stamp}] {msg}\n")));
    }

    /// Wait until every line logged so far is on disk.
    pub async fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (done, wait) = oneshot::channel();
            if tx.send(LogOp::Flush(done)).is_ok() {
                let _ = wait.await;
            }
        }
    }

    /// The last [`MAX_LOG_READ`] bytes of the log, optionally with addresses
    /// masked.
    pub async fn read_tail(&self, mask: bool) -> std::io::Result<String> {
        let Some(path) = &self.path else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "room log disabled",
            ));
        };
        self.flush().await;

        let mut file = fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let start = size.saturating_sub(MAX_LOG_READ);
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((size - start) as usize);
        file.read_to_end(&mut buf).await?;

        let text = String::from_utf8_lossy(&buf).into_owned();
        Ok(if mask { mask_addresses(&text) } else { text })
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogOp>) {
    if let Some(parent) = path.parent()
        && let Err(e) = fs::create_dir_all(parent).await
    {
        warn!(path = %path.display(), error = %e, "cannot create log directory");
    }

    while let Some(op) = rx.recv().await {
        match op {
            LogOp::Line(line) => {
                let result = async {
                    let mut file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await?;
                    file.write_all(line.as_bytes()).await
                }
                .await;
                if let Err(e) = result {
                    warn!(path = %path.display(), error = %e, "room log write failed");
                }
            }
            LogOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
