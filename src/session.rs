//! ClientSession - Per-connection state
//!
//! Each training client connection has its own session tracking the
//! worker index it bound via GET_PARTITION and the monotonically
//! increasing sequence counter that pairs pipelined requests with
//! responses.

/// Unique identifier for a client connection. Assigned from a global
/// counter, never reused.
pub type SessionId = usize;

/// Session state for a client connection.
///
/// Created on connect, destroyed on disconnect or idle timeout.
pub struct ClientSession {
    pub id: SessionId,
    /// Worker index bound by a successful GetPartition, if any.
    worker: Option<usize>,
    /// Next server-assigned sequence number for this session.
    next_seq: u64,
    /// Requests dispatched on this session (lifetime total).
    requests_served: u64,
}

impl ClientSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            worker: None,
            next_seq: 0,
            requests_served: 0,
        }
    }

    /// Record the worker index this client serves.
    pub fn bind_worker(&mut self, worker: usize) {
        self.worker = Some(worker);
    }

    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    /// Resolve the sequence number for an incoming request: the
    /// client's own tag when supplied, otherwise the session's next
    /// counter value. Either way the counter advances, so
    /// server-assigned numbers stay monotonic.
    pub fn resolve_seq(&mut self, client_seq: Option<u64>) -> u64 {
        let assigned = self.next_seq;
        self.next_seq += 1;
        self.requests_served += 1;
        client_seq.unwrap_or(assigned)
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[test]
    fn test_session_new() {
        let session = ClientSession::new(1);
        assert_eq!(session.id, 1);
        assert!(session.worker().is_none());
        assert_eq!(session.requests_served(), 0);
    }

    #[test]
    fn test_bind_worker() {
        let mut session = ClientSession::new(1);
        session.bind_worker(3);
        assert_eq!(session.worker(), Some(3));
    }

    #[test]
    fn test_seq_assignment_monotonic() {
        let mut session = ClientSession::new(1);
        assert_eq!(session.resolve_seq(None), 0);
        assert_eq!(session.resolve_seq(None), 1);
        assert_eq!(session.resolve_seq(None), 2);
    }

    #[test]
    fn test_seq_client_tag_echoed() {
        let mut session = ClientSession::new(1);
        assert_eq!(session.resolve_seq(Some(41)), 41);
        // Counter advanced underneath the client tag
        assert_eq!(session.resolve_seq(None), 1);
        assert_eq!(session.requests_served(), 2);
    }
}
