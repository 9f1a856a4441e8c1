use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use toolhost_tools::{EventSink, ObservabilityEvent};
use tracing::warn;

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only JSONL log of observability events.
///
/// `on_event` only queues; a dedicated writer thread does the file I/O, so
/// the dispatcher never waits on disk.
pub struct JsonlEventLog {
    log_path: PathBuf,
    tx: Mutex<Option<mpsc::Sender<ObservabilityEvent>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl JsonlEventLog {
    pub fn new<P: AsRef<Path>>(log_path: P) -> Result<Arc<Self>, EventLogError> {
        let log_path = log_path.as_ref().to_path_buf();

        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let (tx, rx) = mpsc::channel::<ObservabilityEvent>();
        let handle = thread::Builder::new()
            .name("event-log-writer".into())
            .spawn(move || write_loop(file, rx))?;

        Ok(Arc::new(Self {
            log_path,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Flush queued events and stop the writer. Later events are dropped.
    pub fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Read a log back, skipping lines that do not parse.
    pub fn read<P: AsRef<Path>>(log_path: P) -> Result<Vec<ObservabilityEvent>, EventLogError> {
        let file = File::open(log_path)?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(_) => continue, // Skip corrupted lines
            }
        }
        Ok(events)
    }
}

fn write_loop(file: File, rx: mpsc::Receiver<ObservabilityEvent>) {
    let mut writer = BufWriter::new(file);
    while let Ok(event) = rx.recv() {
        if let Err(e) = write_event(&mut writer, &event) {
            warn!(error = %e, event = event.event_type(), "Failed to write event log entry");
        }
        // Drain whatever is queued before flushing.
        while let Ok(event) = rx.try_recv() {
            if let Err(e) = write_event(&mut writer, &event) {
                warn!(error = %e, event = event.event_type(), "Failed to write event log entry");
            }
        }
        if let Err(e) = writer.flush() {
            warn!(error = %e, "Failed to flush event log");
        }
    }
    if let Err(e) = writer.flush().and_then(|_| writer.get_ref().sync_all()) {
        warn!(error = %e, "Failed to sync event log");
    }
}

fn write_event(writer: &mut BufWriter<File>, event: &ObservabilityEvent) -> Result<(), EventLogError> {
    let json = serde_json::to_string(event)?;
    writeln!(writer, "{}", json)?;
    Ok(())
}

impl EventSink for JsonlEventLog {
    fn on_event(&self, event: &ObservabilityEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event.clone());
        }
    }
}

impl Drop for JsonlEventLog {
    fn drop(&mut self) {
        self.close();
    }
}
