use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::Sink;
use crate::errors::{AuditError, AuditResult};

/// Appends one JSON document per line to `<dir>/<collection>.jsonl`.
pub struct JsonlSink {
    dir: PathBuf,
    files: HashMap<String, File>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn file(&mut self, collection: &str) -> AuditResult<&mut File> {
        if !self.files.contains_key(collection) {
            let path = self.dir.join(format!("{collection}.jsonl"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|err| AuditError::persistence("jsonl", path.display().to_string(), err))?;
            self.files.insert(collection.to_string(), file);
        }
        self.files
            .get_mut(collection)
            .ok_or_else(|| AuditError::persistence("jsonl", collection, "file handle missing"))
    }

    async fn append(&mut self, collection: &str, documents: &[Value]) -> AuditResult<()> {
        let mut payload = Vec::new();
        for document in documents {
            serde_json::to_writer(&mut payload, document)
                .map_err(|err| AuditError::persistence("jsonl", collection, err))?;
            payload.push(b'\n');
        }
        let file = self.file(collection).await?;
        file.write_all(&payload)
            .await
            .map_err(|err| AuditError::persistence("jsonl", collection, err))
    }
}

#[async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn open(&mut self) -> AuditResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| AuditError::persistence("jsonl", self.dir.display().to_string(), err))
    }

    async fn save(&mut self, collection: &str, document: &Value) -> AuditResult<()> {
        self.append(collection, std::slice::from_ref(document)).await
    }

    async fn save_many(&mut self, collection: &str, documents: &[Value]) -> AuditResult<()> {
        self.append(collection, documents).await
    }

    async fn close(&mut self) -> AuditResult<()> {
        flush_all(self.files.drain()).await
    }
}

/// Flushes and drops every handle, even after one of them failed.
async fn flush_all<W>(handles: impl IntoIterator<Item = (String, W)>) -> AuditResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut failed = Vec::new();
    let mut reasons = Vec::new();
    for (collection, mut handle) in handles {
        if let Err(err) = handle.flush().await {
            reasons.push(format!("{collection}: {err}"));
            failed.push(collection);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(AuditError::persistence("jsonl", failed.join(","), reasons.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tempfile::tempdir;

    struct Handle {
        fail: bool,
        flushed: Arc<AtomicUsize>,
    }

    impl AsyncWrite for Handle {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
            } else {
                Poll::Ready(Ok(()))
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn close_flushes_every_handle_after_a_failure() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let handle = |fail| Handle {
            fail,
            flushed: Arc::clone(&flushed),
        };
        let handles = vec![
            ("audit_events".to_string(), handle(true)),
            ("audit_summaries".to_string(), handle(false)),
            ("audit_routes".to_string(), handle(false)),
        ];

        let err = flush_all(handles).await.unwrap_err();
        assert_eq!(flushed.load(Ordering::SeqCst), 3);
        match err {
            AuditError::Persistence { document, reason, .. } => {
                assert_eq!(document, "audit_events");
                assert!(reason.contains("disk full"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn appends_lines_per_collection() {
        let dir = tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path().join("out"));
        sink.open().await.unwrap();
        sink.save_many("audit_events", &[json!({"n": 1}), json!({"n": 2})])
            .await
            .unwrap();
        sink.save("audit_summaries", &json!({"overallStatus": "PASSED"}))
            .await
            .unwrap();
        sink.close().await.unwrap();

        sink.open().await.unwrap();
        sink.save("audit_events", &json!({"n": 3})).await.unwrap();
        sink.close().await.unwrap();

        let events = std::fs::read_to_string(dir.path().join("out/audit_events.jsonl")).unwrap();
        let lines: Vec<Value> = events
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
        assert!(dir.path().join("out/audit_summaries.jsonl").exists());
    }
}
