//! The request-log sink (C4): a single-producer-many, single-consumer
//! pipeline. Handlers enqueue [`RequestLog`] records non-blockingly; one
//! writer task drains the channel in order and appends each record as
//! one line of JSON to `request_log.jsonl` under the data directory.

use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A single handled-query record.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    /// Unique id for this attempt.
    pub request_id: uuid::Uuid,
    /// The querying client's IP address, as text.
    pub client_ip: String,
    /// The queried name.
    pub name: String,
    /// The CNAME target actually queried upstream, if cloaking chased one.
    pub cname: Option<String>,
    /// The query type, as text (`"A"`, `"AAAA"`, ...).
    pub question_type: String,
    /// The final rcode, as text, or `None` if the query was dropped.
    pub response_status: Option<String>,
    /// `"<proto>://<ip>"` of the upstream used, or `None` for a
    /// pipeline-level decision that never reached an upstream.
    pub server: Option<String>,
    /// Elapsed wall time for this attempt, in milliseconds.
    pub elapsed_ms: f64,
    /// Newline-joined error-chain text, or `None` on success.
    pub error: Option<String>,
    /// UTC timestamp the record was created.
    pub created_utc: chrono::DateTime<chrono::Utc>,
}

impl RequestLog {
    /// Start building a record for `name`/`question_type`, stamped now.
    pub fn new(client_ip: impl Into<String>, name: impl Into<String>, question_type: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4(),
            client_ip: client_ip.into(),
            name: name.into(),
            cname: None,
            question_type: question_type.into(),
            response_status: None,
            server: None,
            elapsed_ms: 0.0,
            error: None,
            created_utc: chrono::Utc::now(),
        }
    }
}

/// A cloneable handle handlers use to enqueue log records.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<RequestLog>,
}

impl LogSink {
    /// Enqueue a record. Never blocks; drops are only possible once the
    /// writer task itself has been shut down.
    pub fn log(&self, record: RequestLog) {
        if self.tx.send(record).is_err() {
            log::warn!("request log writer has shut down, dropping a record");
        }
    }
}

/// Owns the receiving half and the spawned writer task; dropping this
/// (after all [`LogSink`] clones are dropped) lets the writer drain the
/// queue and exit.
pub struct LogWriter {
    handle: JoinHandle<()>,
}

impl LogWriter {
    /// Wait for the channel to drain and the writer task to exit. Call
    /// this during graceful shutdown after every handler has completed.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            log::warn!("request log writer task panicked: {e}");
        }
    }
}

/// Start the single-writer task appending JSONL records to
/// `data_dir/request_log.jsonl`. Returns a sink for handlers to log
/// through and a writer handle to join at shutdown.
pub fn spawn(data_dir: PathBuf) -> (LogSink, LogWriter) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RequestLog>();
    let handle = tokio::spawn(async move {
        let path = data_dir.join("request_log.jsonl");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                log::error!("could not open request log file {}: {}", path.display(), e);
                // Drain the channel so senders never block, but discard records.
                while rx.recv().await.is_some() {}
                return;
            }
        };

        while let Some(record) = rx.recv().await {
            match serde_json::to_string(&record) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        log::error!("failed to persist request log record: {e}");
                    }
                }
                Err(e) => log::error!("failed to serialize request log record: {e}"),
            }
        }
    });

    (LogSink { tx }, LogWriter { handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_enqueued_records_as_jsonl() {
        let dir = std::env::temp_dir().join(format!("droute-log-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let (sink, writer) = spawn(dir.clone());

        let mut rec = RequestLog::new("127.0.0.1", "example.com", "A");
        rec.response_status = Some("NOERROR".to_string());
        sink.log(rec);
        drop(sink);
        writer.join().await;

        let contents = tokio::fs::read_to_string(dir.join("request_log.jsonl"))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("example.com"));
    }
}
