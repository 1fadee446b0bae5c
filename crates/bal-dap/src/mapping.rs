//! Maps debug-server identities onto the small integer ids the IDE protocol expects.
//!
//! Threads get a 1-based index the first time they are seen, and keep it for the
//! whole session. A (frame, scope) pair is folded into a single variables reference
//! only at the protocol boundary; inside the adapter it stays a [`VariablesHandle`].

use std::collections::HashMap;

use serde::Deserialize;

use crate::config::DEFAULT_FRAME_LIMIT;
use crate::error::BalAdapterError;

/// A debug-server thread as the IDE sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub id: String,
    pub index: i64,
    pub name: String,
}

impl Thread {
    fn new(id: &str, index: i64) -> Self {
        // Worker ids look like `<worker>-<hash>`.
        let name = id.split('-').next().unwrap_or(id).to_string();
        Self {
            id: id.to_string(),
            index,
            name,
        }
    }
}

#[derive(Debug, Default)]
pub struct ThreadTable {
    threads: Vec<Thread>,
    indexes: HashMap<String, i64>,
    current: Option<String>,
}

impl ThreadTable {
    /// Returns the IDE index of `thread_id`, assigning the next one if the thread is new.
    /// The thread also becomes the current thread.
    pub fn resolve_or_assign(&mut self, thread_id: &str) -> i64 {
        let index = match self.indexes.get(thread_id) {
            Some(index) => *index,
            None => {
                let index = self.threads.len() as i64 + 1;
                self.threads.push(Thread::new(thread_id, index));
                self.indexes.insert(thread_id.to_string(), index);
                index
            }
        };
        self.current = Some(thread_id.to_string());
        index
    }

    pub fn thread_id(&self, index: i64) -> Result<&str, BalAdapterError> {
        if index < 1 {
            return Err(BalAdapterError::UnknownThread(index));
        }

        self.threads
            .get(index as usize - 1)
            .map(|thread| thread.id.as_str())
            .ok_or(BalAdapterError::UnknownThread(index))
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ScopeKind {
    Local,
    Global,
}

impl ScopeKind {
    pub fn name(self) -> &'static str {
        match self {
            ScopeKind::Local => "Local",
            ScopeKind::Global => "Global",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariablesHandle {
    pub frame_index: usize,
    pub scope: ScopeKind,
}

impl VariablesHandle {
    pub fn new(frame_index: usize, scope: ScopeKind) -> Self {
        Self { frame_index, scope }
    }
}

/// Encodes handles as `frame + 1` for locals and `frame + 1 + frame_limit` for globals.
///
/// 0 means "nothing to expand" in the IDE protocol, so it is never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleScheme {
    frame_limit: i64,
}

impl Default for HandleScheme {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_LIMIT)
    }
}

impl HandleScheme {
    pub fn new(frame_limit: i64) -> Self {
        Self {
            frame_limit: frame_limit.max(1),
        }
    }

    pub fn encode(&self, handle: VariablesHandle) -> Result<i64, BalAdapterError> {
        let frame = handle.frame_index as i64;
        if frame >= self.frame_limit {
            return Err(BalAdapterError::FrameLimitExceeded {
                frame,
                limit: self.frame_limit,
            });
        }

        Ok(match handle.scope {
            ScopeKind::Local => frame + 1,
            ScopeKind::Global => frame + 1 + self.frame_limit,
        })
    }

    pub fn decode(&self, reference: i64) -> Result<VariablesHandle, BalAdapterError> {
        if reference <= 0 || reference > 2 * self.frame_limit {
            return Err(BalAdapterError::UnknownHandle(reference));
        }

        let handle = if reference <= self.frame_limit {
            VariablesHandle::new((reference - 1) as usize, ScopeKind::Local)
        } else {
            VariablesHandle::new((reference - 1 - self.frame_limit) as usize, ScopeKind::Global)
        };
        Ok(handle)
    }
}
