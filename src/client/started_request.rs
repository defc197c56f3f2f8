use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::connection::Connection;

/// Handle for one admission attempt.
///
/// Hold on to it for as long as the work runs and call [`end`](Self::end)
/// when done. A limited request carries no slot and ending it does nothing.
pub struct StartedRequest {
    id: Option<u64>,
    limited: bool,
    connection: Option<Arc<Connection>>,
    ended: AtomicBool,
}

impl StartedRequest {
    pub(crate) fn admitted(id: u64, connection: Arc<Connection>) -> Self {
        Self {
            id: Some(id),
            limited: false,
            connection: Some(connection),
            ended: AtomicBool::new(false),
        }
    }

    /// Rejected by the authority, or short-circuited locally (`id` is `None`)
    pub(crate) fn limited(id: Option<u64>) -> Self {
        Self {
            id,
            limited: true,
            connection: None,
            ended: AtomicBool::new(false),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limited
    }

    /// Wire id, if the request ever reached the authority
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Release the slot. Only the first call sends anything.
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        if let (Some(id), Some(connection)) = (self.id, &self.connection) {
            connection.end_request(id);
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for StartedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartedRequest")
            .field("id", &self.id)
            .field("limited", &self.limited)
            .field("ended", &self.is_ended())
            .finish()
    }
}
