//! Idle/busy pipe bookkeeping
//!
//! All state here is owned by a control's pipe-manager task; nothing is
//! shared. Idle order is newest-first so consumers get recently validated
//! sessions, and eviction closes surplus zero-stream pipes newest-first.

use std::collections::VecDeque;

use burrow_mux::MuxSession;
use tracing::debug;

use crate::config::ControlTuning;

pub(crate) struct PipePool {
    idle: VecDeque<MuxSession>,
    busy: Vec<MuxSession>,
    max_streams: usize,
    max_idle_pipes: usize,
}

impl PipePool {
    pub(crate) fn new(tuning: &ControlTuning) -> Self {
        Self {
            idle: VecDeque::new(),
            busy: Vec::new(),
            max_streams: tuning.max_streams,
            max_idle_pipes: tuning.max_idle_pipes,
        }
    }

    /// File a newly arrived pipe under idle or busy by capacity.
    /// Closed sessions are dropped on the floor.
    pub(crate) fn absorb(&mut self, session: MuxSession) {
        if session.is_closed() {
            return;
        }
        if session.num_streams() < self.max_streams {
            self.push_idle(session);
        } else {
            self.push_busy(session);
        }
    }

    pub(crate) fn push_idle(&mut self, session: MuxSession) {
        self.idle.push_front(session);
    }

    pub(crate) fn push_busy(&mut self, session: MuxSession) {
        self.busy.push(session);
    }

    /// Pop the freshest idle pipe, detaching any closed ones on the way
    pub(crate) fn pop_idle(&mut self) -> Option<MuxSession> {
        while let Some(session) = self.idle.pop_front() {
            if !session.is_closed() {
                return Some(session);
            }
        }
        None
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.busy.len()
    }

    /// Drop closed pipes, promote busy pipes whose stream count fell below
    /// the cap, and close surplus idle pipes with no live streams.
    pub(crate) fn clean(&mut self) {
        let mut still_busy = Vec::with_capacity(self.busy.len());
        for session in self.busy.drain(..) {
            if session.is_closed() {
                continue;
            }
            if session.num_streams() < self.max_streams {
                self.idle.push_front(session);
            } else {
                still_busy.push(session);
            }
        }
        self.busy = still_busy;

        self.idle.retain(|session| !session.is_closed());

        let mut i = 0;
        while self.idle.len() > self.max_idle_pipes && i < self.idle.len() {
            if self.idle[i].num_streams() == 0 {
                if let Some(session) = self.idle.remove(i) {
                    debug!("evicting surplus idle pipe");
                    session.close();
                }
            } else {
                i += 1;
            }
        }
    }

    /// Close everything; used when the owning control dies
    pub(crate) fn close_all(&mut self) {
        for session in self.idle.drain(..) {
            session.close();
        }
        for session in self.busy.drain(..) {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_mux::{MuxConfig, MuxSession};

    fn tuning() -> ControlTuning {
        ControlTuning::default()
    }

    fn new_session() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            MuxSession::client(a, MuxConfig::default()),
            MuxSession::server(b, MuxConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_newest_idle_first() {
        let mut pool = PipePool::new(&tuning());
        let (first, _keep1) = new_session();
        let (second, _keep2) = new_session();

        // Mark the first session with a live stream so the two are
        // distinguishable after popping
        let _stream = first.open_stream("mark").unwrap();
        pool.push_idle(first);
        pool.push_idle(second);

        let popped = pool.pop_idle().unwrap();
        assert_eq!(popped.num_streams(), 0, "second was pushed last, pops first");
        let popped = pool.pop_idle().unwrap();
        assert_eq!(popped.num_streams(), 1);
    }

    #[tokio::test]
    async fn test_pop_skips_closed() {
        let mut pool = PipePool::new(&tuning());
        let (open_session, _keep) = new_session();
        let (closed_session, _keep2) = new_session();
        closed_session.close();

        pool.push_idle(open_session);
        pool.push_idle(closed_session);

        let popped = pool.pop_idle().unwrap();
        assert!(!popped.is_closed());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_absorb_by_capacity() {
        let mut pool = PipePool::new(&tuning());

        let (idle_session, _keep) = new_session();
        pool.absorb(idle_session);
        assert_eq!(pool.idle_count(), 1);

        let (busy_session, _keep2) = new_session();
        let mut streams = Vec::new();
        for i in 0..tuning().max_streams {
            streams.push(busy_session.open_stream(&format!("s{i}")).unwrap());
        }
        pool.absorb(busy_session);
        assert_eq!(pool.busy_count(), 1);

        let (dead_session, _keep3) = new_session();
        dead_session.close();
        pool.absorb(dead_session);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.busy_count(), 1);
    }

    #[tokio::test]
    async fn test_clean_promotes_busy() {
        let mut pool = PipePool::new(&tuning());
        let (session, _keep) = new_session();

        let mut streams = Vec::new();
        for i in 0..tuning().max_streams {
            streams.push(session.open_stream(&format!("s{i}")).unwrap());
        }
        pool.push_busy(session);

        pool.clean();
        assert_eq!(pool.busy_count(), 1);
        assert_eq!(pool.idle_count(), 0);

        // One stream ends; the pipe has capacity again
        streams.pop();
        pool.clean();
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_clean_evicts_surplus_idle() {
        let mut pool = PipePool::new(&tuning());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let (session, keep) = new_session();
            handles.push((session.clone(), keep));
            pool.push_idle(session);
        }

        pool.clean();
        assert_eq!(pool.idle_count(), tuning().max_idle_pipes);

        let closed = handles
            .iter()
            .filter(|(session, _)| session.is_closed())
            .count();
        assert_eq!(closed, 5 - tuning().max_idle_pipes);
    }

    #[tokio::test]
    async fn test_clean_keeps_idle_pipes_with_streams() {
        let mut pool = PipePool::new(&tuning());
        let mut streams = Vec::new();
        for i in 0..5 {
            let (session, keep) = new_session();
            streams.push((session.open_stream(&format!("s{i}")).unwrap(), keep));
            pool.push_idle(session);
        }

        // All five carry a live stream, so none is evictable
        pool.clean();
        assert_eq!(pool.idle_count(), 5);
    }

    #[tokio::test]
    async fn test_close_all() {
        let mut pool = PipePool::new(&tuning());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (session, keep) = new_session();
            handles.push((session.clone(), keep));
            pool.push_idle(session);
        }
        let (busy, keep) = new_session();
        handles.push((busy.clone(), keep));
        pool.push_busy(busy);

        pool.close_all();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.busy_count(), 0);
        assert!(handles.iter().all(|(session, _)| session.is_closed()));
    }
}
