use std::ops::Range;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use super::{Frame, OpenDataset, SharedFrames};
use crate::{Error, Result};

/// How frames are pulled from the source while iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IterationMode {
    /// Frame N+1 is read only when requested.
    Synchronous,
    /// A background worker reads frame N+1 while frame N is processed.
    #[default]
    ReadAhead,
}

/// Iterator over a contiguous frame range of an [`OpenDataset`].
///
/// Both modes yield the same frames in the same order. In read-ahead mode
/// the worker hands frames over through a rendezvous channel, so it is at
/// most one frame ahead of the consumer.
pub struct FrameIter<'a> {
    _dataset: &'a OpenDataset,
    shared: Arc<SharedFrames>,
    next: usize,
    end: usize,
    worker: Option<ReadAheadWorker>,
}

struct ReadAheadWorker {
    receiver: Option<Receiver<Result<Frame>>>,
    handle: Option<JoinHandle<()>>,
}

impl<'a> FrameIter<'a> {
    pub(super) fn new(
        dataset: &'a OpenDataset,
        shared: Arc<SharedFrames>,
        range: Range<usize>,
        mode: IterationMode,
    ) -> Self {
        let worker = match mode {
            IterationMode::Synchronous => None,
            IterationMode::ReadAhead if range.is_empty() => None,
            IterationMode::ReadAhead => Some(ReadAheadWorker::spawn(Arc::clone(&shared), range.clone())),
        };
        Self {
            _dataset: dataset,
            shared,
            next: range.start,
            end: range.end,
            worker,
        }
    }

    /// Index of the frame the next call to `next()` yields.
    pub fn position(&self) -> usize {
        self.next
    }
}

impl ReadAheadWorker {
    fn spawn(shared: Arc<SharedFrames>, range: Range<usize>) -> Self {
        let (sender, receiver) = mpsc::sync_channel(0);
        let handle = std::thread::Builder::new()
            .name("frame-read-ahead".into())
            .spawn(move || {
                for index in range {
                    let result = shared.stream(index);
                    let failed = result.is_err();
                    if sender.send(result).is_err() || failed {
                        break;
                    }
                }
            });

        match handle {
            Ok(handle) => Self {
                receiver: Some(receiver),
                handle: Some(handle),
            },
            Err(err) => {
                tracing::warn!("Failed to spawn read-ahead worker, reading synchronously: {err}");
                Self {
                    receiver: None,
                    handle: None,
                }
            }
        }
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let received = self
            .worker
            .as_ref()
            .and_then(|w| w.receiver.as_ref())
            .map(|rx| rx.recv());

        let result = match received {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(Error::Source(format!(
                "read-ahead worker stopped before frame {index}"
            ))),
            None => self.shared.stream(index),
        };

        if result.is_err() {
            // Stop after the first failure, like the synchronous path would.
            self.next = self.end;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.next;
        (remaining, Some(remaining))
    }
}

impl Drop for ReadAheadWorker {
    fn drop(&mut self) {
        // Dropping the receiver makes a blocked send fail, ending the worker.
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Read-ahead worker panicked");
            }
        }
    }
}
