//! Service thread: coalesced last-committed reporting and out-of-band
//! messages to the group.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

use crate::core::Seqno;

use super::gcs::GroupChannel;

enum ServiceCmd {
    ReportLastCommitted(Seqno),
    Flush(Sender<()>),
    Shutdown,
}

/// Background worker owning all asynchronous writes to the group
/// channel. Last-committed reports are coalesced: a backlog collapses
/// into one send of the highest seqno.
pub struct ServiceThd {
    tx: Sender<ServiceCmd>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceThd {
    pub fn start(gcs: Arc<dyn GroupChannel>) -> Self {
        let (tx, rx) = unbounded();
        let join = thread::spawn(move || run_service(gcs, rx));
        Self {
            tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn report_last_committed(&self, seqno: Seqno) {
        let _ = self.tx.send(ServiceCmd::ReportLastCommitted(seqno));
    }

    /// Blocks until every command enqueued before the call has been
    /// handled.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(ServiceCmd::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ServiceCmd::Shutdown);
        if let Some(join) = self.join.lock().expect("service join lock poisoned").take() {
            let _ = join.join();
        }
    }
}

fn run_service(gcs: Arc<dyn GroupChannel>, rx: Receiver<ServiceCmd>) {
    let mut next = rx.recv().ok();
    while let Some(cmd) = next.take() {
        match cmd {
            ServiceCmd::ReportLastCommitted(seqno) => {
                let mut max = seqno;
                loop {
                    match rx.try_recv() {
                        Ok(ServiceCmd::ReportLastCommitted(more)) => {
                            if more > max {
                                max = more;
                            }
                        }
                        Ok(other) => {
                            next = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if let Err(err) = gcs.report_last_committed(max) {
                    tracing::warn!("last-committed report failed: {err}");
                }
                if next.is_none() {
                    next = rx.recv().ok();
                }
            }
            ServiceCmd::Flush(ack) => {
                let _ = ack.send(());
                next = rx.recv().ok();
            }
            ServiceCmd::Shutdown => break,
        }
    }
}
