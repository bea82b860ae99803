//! Separates expected teardown noise from errors the operator should see.

use crate::client::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Expected: the stream is being torn down on purpose.
    Suppress,
    /// Real failure: notify and retry after backoff.
    Report,
}

/// `stop_requested` is true once stop has been invoked on the owning handle;
/// anything the stream produces from then on is teardown noise.
pub fn classify(err: &WatchError, stop_requested: bool) -> Verdict {
    if stop_requested {
        return Verdict::Suppress;
    }
    match err {
        WatchError::Aborted => Verdict::Suppress,
        WatchError::ListFailed(_)
        | WatchError::Transport(_)
        | WatchError::Decode(_)
        | WatchError::StartFailed(_) => Verdict::Report,
    }
}
