//! Reassembly of base64-chunked images, one live session per group.
//!
//! Lifecycle per group: Idle → Open (after `begin`) → Assembling (after the
//! first fragment) → removed by `finish`, by exceeding the byte ceiling, by
//! a newer `begin`, or by the staleness reaper. A removed session is simply
//! gone; late fragments for it find no session and are ignored.
//!
//! All registry mutations go through one mutex. Concatenation and base64
//! decoding happen after the session has been taken out of the registry,
//! so the lock is only held for map operations.

use crate::config::TransferLimits;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("missing fragments: received {received} of {expected}")]
    MissingFragments { expected: usize, received: usize },
    #[error("decode error: {0}")]
    Decode(String),
}

/// Body of an `image/<group>/meta` message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMeta {
    pub credential: String,
    pub group: String,
    pub chunks: i64,
    #[serde(default)]
    pub total_size: Option<i64>,
}

impl TransferMeta {
    pub fn parse(payload: &[u8]) -> Result<Self, TransferError> {
        serde_json::from_slice(payload).map_err(|e| TransferError::InvalidMetadata(e.to_string()))
    }
}

/// Observable state of a live session.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, no fragment yet.
    Open,
    /// At least one fragment buffered.
    Assembling,
}

/// Result of offering a fragment to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    Stored { distinct: usize, expected: usize },
    /// No live session for the group, or the index is out of range.
    Ignored,
}

struct TransferSession {
    id: Uuid,
    expected: usize,
    fragments: BTreeMap<usize, Vec<u8>>,
    received_bytes: usize,
    /// Fingerprint of the credential that opened the session.
    opened_by: String,
    last_activity: Instant,
}

/// Session that reached `finish` with every fragment present.
pub struct CompletedTransfer {
    pub session_id: Uuid,
    pub opened_by: String,
    pub image: Vec<u8>,
}

pub struct SessionRegistry {
    limits: TransferLimits,
    sessions: Mutex<HashMap<String, TransferSession>>,
}

impl SessionRegistry {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            limits,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, TransferSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session for `group`, replacing any live one. The caller has
    /// already authenticated the sender; invalid declarations leave the
    /// registry untouched.
    pub fn begin(
        &self,
        group: &str,
        declared_chunks: i64,
        declared_size: Option<i64>,
        opened_by: &str,
        now: Instant,
    ) -> Result<Uuid, TransferError> {
        if declared_chunks <= 0 || declared_chunks as u64 > self.limits.max_chunks as u64 {
            return Err(TransferError::InvalidMetadata(format!(
                "chunks must be in 1..={}, got {declared_chunks}",
                self.limits.max_chunks
            )));
        }
        if let Some(size) = declared_size {
            if size < 0 {
                return Err(TransferError::InvalidMetadata(format!(
                    "negative totalSize {size}"
                )));
            }
            if size as u64 > self.limits.max_payload_bytes as u64 {
                return Err(TransferError::PayloadTooLarge);
            }
        }

        let session = TransferSession {
            id: Uuid::new_v4(),
            expected: declared_chunks as usize,
            fragments: BTreeMap::new(),
            received_bytes: 0,
            opened_by: opened_by.to_string(),
            last_activity: now,
        };
        let id = session.id;

        if let Some(old) = self.sessions().insert(group.to_string(), session) {
            tracing::info!(
                group,
                discarded = %old.id,
                buffered = old.fragments.len(),
                "session replaced by new begin"
            );
        }
        tracing::debug!(group, session = %id, chunks = declared_chunks, "session opened");
        Ok(id)
    }

    /// Buffer fragment `index`. Duplicates overwrite. Exceeding the byte
    /// ceiling discards the session and returns `PayloadTooLarge`.
    pub fn fragment(
        &self,
        group: &str,
        index: usize,
        payload: &[u8],
        now: Instant,
    ) -> Result<FragmentStatus, TransferError> {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(group) else {
            tracing::debug!(group, index, "fragment without live session ignored");
            return Ok(FragmentStatus::Ignored);
        };

        if index >= session.expected {
            tracing::warn!(group, index, expected = session.expected, "fragment index out of range");
            return Ok(FragmentStatus::Ignored);
        }

        session.received_bytes = session.received_bytes.saturating_add(payload.len());
        if session.received_bytes > self.limits.max_payload_bytes {
            let bytes = session.received_bytes;
            sessions.remove(group);
            tracing::warn!(group, bytes, limit = self.limits.max_payload_bytes, "session aborted: payload too large");
            return Err(TransferError::PayloadTooLarge);
        }

        session.fragments.insert(index, payload.to_vec());
        session.last_activity = now;
        tracing::trace!(group, index, bytes = payload.len(), "fragment buffered");

        Ok(FragmentStatus::Stored {
            distinct: session.fragments.len(),
            expected: session.expected,
        })
    }

    /// Close the group's session and reassemble it. The session is removed
    /// before anything else happens, whatever the outcome. `Ok(None)` means
    /// there was no live session.
    pub fn finish(&self, group: &str) -> Result<Option<CompletedTransfer>, TransferError> {
        let Some(session) = self.sessions().remove(group) else {
            tracing::debug!(group, "finish without live session ignored");
            return Ok(None);
        };

        if session.fragments.len() != session.expected {
            return Err(TransferError::MissingFragments {
                expected: session.expected,
                received: session.fragments.len(),
            });
        }

        let mut text = Vec::with_capacity(session.received_bytes);
        for fragment in session.fragments.values() {
            text.extend(fragment.iter().filter(|b| !b.is_ascii_whitespace()));
        }
        let image = STANDARD
            .decode(&text)
            .map_err(|e| TransferError::Decode(e.to_string()))?;

        tracing::debug!(group, session = %session.id, bytes = image.len(), "transfer reassembled");
        Ok(Some(CompletedTransfer {
            session_id: session.id,
            opened_by: session.opened_by,
            image,
        }))
    }

    /// Drop sessions idle for at least the configured timeout.
    /// Returns the groups whose sessions were discarded.
    pub fn reap_stale(&self, now: Instant) -> Vec<String> {
        let timeout = self.limits.session_timeout;
        let mut reaped = Vec::new();
        self.sessions().retain(|group, session| {
            let idle = now.saturating_duration_since(session.last_activity);
            if idle >= timeout {
                tracing::warn!(group, session = %session.id, idle_secs = idle.as_secs(), "stale session reaped");
                reaped.push(group.clone());
                false
            } else {
                true
            }
        });
        reaped
    }

    #[cfg(test)]
    pub fn state(&self, group: &str) -> Option<SessionState> {
        self.sessions().get(group).map(|s| {
            if s.fragments.is_empty() {
                SessionState::Open
            } else {
                SessionState::Assembling
            }
        })
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions().len()
    }
}
