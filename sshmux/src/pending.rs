use std::collections::VecDeque;

use log::warn;
use tokio::sync::oneshot;

use crate::Error;

/// Outstanding reply completions for one correlation key (a channel, or the
/// connection-wide "global" key).
///
/// The wire protocol carries no request/response identifier: a reply is
/// matched to the oldest outstanding request, so this queue is strictly
/// FIFO. A reply arriving with nothing outstanding is a peer anomaly and is
/// dropped rather than trusted.
pub(crate) struct ReplyQueue<T> {
    queue: VecDeque<oneshot::Sender<Result<T, Error>>>,
}

impl<T> Default for ReplyQueue<T> {
    fn default() -> Self {
        ReplyQueue {
            queue: VecDeque::new(),
        }
    }
}

impl<T> ReplyQueue<T> {
    pub fn push(&mut self, sender: oneshot::Sender<Result<T, Error>>) {
        self.queue.push_back(sender)
    }

    /// Resolve the oldest outstanding completion. Returns `false` if there
    /// was none.
    pub fn resolve(&mut self, result: Result<T, Error>) -> bool {
        match self.queue.pop_front() {
            Some(sender) => {
                // The receiver may already have been dropped.
                let _ = sender.send(result);
                true
            }
            None => {
                warn!("received a reply with no outstanding request");
                false
            }
        }
    }

    /// Fail every outstanding completion, oldest first.
    pub fn fail_all(&mut self, mut err: impl FnMut() -> Error) {
        while let Some(sender) = self.queue.pop_front() {
            let _ = sender.send(Err(err()));
        }
    }
}
