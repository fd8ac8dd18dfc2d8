use std::sync::{Arc, RwLock};

/// Shared handle to the current realtime session identity.
///
/// The realtime channel writes the server-assigned session id here as soon as
/// it is announced; the storage client reads it and attaches it to every
/// request while one is set, giving REST calls session affinity with the live
/// websocket connection.
///
/// The id is not cleared automatically when the socket closes. Callers that
/// want a fresh identity before reconnecting call [`SessionState::clear`].
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    inner: Arc<RwLock<Option<String>>>,
}

impl SessionState {
    /// Creates an empty session state with no identity assigned.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current session id, if one has been assigned.
    pub fn get(&self) -> Option<String> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }

    /// Adopts `session_id` as the current identity.
    pub fn set(&self, session_id: impl Into<String>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(session_id.into());
        }
    }

    /// Drops the current identity, if any.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }
}
