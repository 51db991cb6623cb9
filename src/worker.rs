//! Runs a publish on a background thread and reports back over a channel.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::app::{App, ProgressEvent, ProgressSink, PublishOptions, RunReport};
use crate::audit::AuditSink;
use crate::error::UploadError;
use crate::qbench::QBenchClient;

#[derive(Debug)]
pub enum WorkerMessage {
    Progress(String),
    Success(Box<RunReport>),
    Failure(UploadError),
}

struct ChannelProgress {
    tx: Sender<WorkerMessage>,
}

impl ProgressSink for ChannelProgress {
    fn event(&self, event: ProgressEvent) {
        let _ = self.tx.send(WorkerMessage::Progress(event.message));
    }
}

pub struct UploadWorker {
    pub messages: Receiver<WorkerMessage>,
    handle: JoinHandle<()>,
}

impl UploadWorker {
    pub fn join(self) {
        self.handle.join().ok();
    }
}

/// Starts the run. Exactly one terminal message (success or failure) is sent.
pub fn spawn_publish<Q, A>(app: App<Q, A>, path: PathBuf, options: PublishOptions) -> UploadWorker
where
    Q: QBenchClient + 'static,
    A: AuditSink + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let sink = ChannelProgress { tx: tx.clone() };
        let message = match app.publish(&path, &options, &sink) {
            Ok(report) => WorkerMessage::Success(Box::new(report)),
            Err(err) => WorkerMessage::Failure(err),
        };
        let _ = tx.send(message);
    });
    UploadWorker {
        messages: rx,
        handle,
    }
}

/// Operator-facing wording; workbook and audit failures are kept distinct from upload
/// failures.
pub fn failure_message(err: &UploadError) -> String {
    match err {
        UploadError::Audit(_) => format!("could not save the backup record: {err}"),
        UploadError::MalformedWorkbook { .. } | UploadError::Workbook(..) => {
            format!("could not read the workbook: {err}")
        }
        _ => format!("failed to upload results to QBench: {err}"),
    }
}
