//! Process-wide registries
//!
//! Live control sessions by client id, tunnels by public address, and the
//! sub-domain counter. Inserts happen in the handshake and tunnel setup
//! paths; deletes only in a control's moderator. Each map is guarded by
//! its own reader-writer lock; the pipe-handshake path and the L7 router
//! are the readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use burrow_mux::Conn;
use burrow_proto::TunnelConfig;
use uuid::Uuid;

use crate::control::Control;
use crate::tunnel::dispatch_stream;

/// Alphabet for sub-domain labels: digits + lowercase letters
const LABEL_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A tunnel as seen by the registries and the L7 router
#[derive(Clone)]
pub struct TunnelEntry {
    /// Tunnel name; names the stream opened for each user connection
    pub name: String,
    pub config: TunnelConfig,
    /// Weak back-reference; must not keep a control alive past its
    /// explicit lifecycle
    pub control: Weak<Control>,
}

impl TunnelEntry {
    /// Splice a user connection into this tunnel.
    ///
    /// Returns false if the owning control is already gone.
    pub async fn dispatch<C: Conn + 'static>(&self, user_conn: C) -> bool {
        match self.control.upgrade() {
            Some(control) => {
                dispatch_stream(control, user_conn, self.name.clone()).await;
                true
            }
            None => false,
        }
    }
}

/// Process-wide indices shared by every control session
pub struct Registry {
    controls: RwLock<HashMap<Uuid, Arc<Control>>>,
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
    subdomain_seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            controls: RwLock::new(HashMap::new()),
            tunnels: RwLock::new(HashMap::new()),
            subdomain_seq: AtomicU64::new(0),
        }
    }

    pub fn insert_control(&self, control: Arc<Control>) {
        self.controls
            .write()
            .unwrap()
            .insert(control.client_id(), control);
    }

    pub fn remove_control(&self, client_id: &Uuid) -> Option<Arc<Control>> {
        self.controls.write().unwrap().remove(client_id)
    }

    /// Look up a live control; the pipe-handshake entry point
    pub fn control(&self, client_id: &Uuid) -> Option<Arc<Control>> {
        self.controls.read().unwrap().get(client_id).cloned()
    }

    pub fn controls(&self) -> Vec<Arc<Control>> {
        self.controls.read().unwrap().values().cloned().collect()
    }

    pub fn control_count(&self) -> usize {
        self.controls.read().unwrap().len()
    }

    pub fn insert_tunnel(&self, public_addr: String, entry: TunnelEntry) {
        self.tunnels.write().unwrap().insert(public_addr, entry);
    }

    pub fn remove_tunnel(&self, public_addr: &str) -> Option<TunnelEntry> {
        self.tunnels.write().unwrap().remove(public_addr)
    }

    /// Look up a tunnel by public address; the L7 router's entry point
    pub fn tunnel(&self, public_addr: &str) -> Option<TunnelEntry> {
        self.tunnels.read().unwrap().get(public_addr).cloned()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.read().unwrap().len()
    }

    /// Mint the next sub-domain label
    pub fn next_subdomain(&self) -> String {
        let n = self.subdomain_seq.fetch_add(1, Ordering::SeqCst) + 1;
        encode_label(n)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Short lexicographic encoding of a counter value
fn encode_label(mut n: u64) -> String {
    let base = LABEL_ALPHABET.len() as u64;
    let mut out = Vec::new();
    loop {
        out.push(LABEL_ALPHABET[(n % base) as usize]);
        n /= base;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}
