// SPDX-License-Identifier: AGPL-3.0-only
//! Multi-round session state.
//!
//! For each turn of a multi-round authentication conversation a state entry
//! holds the attributes and request data that must survive until the next
//! packet arrives. When a reply goes out, [`StateStore::from_request`]
//! transfers ownership of the Request's session data into an entry keyed by
//! the `State` token carried in the reply; when the next request comes in,
//! [`StateStore::to_request`] transfers it back. The data moves wholesale:
//!
//! ```text
//! request -> entry -> request -> entry -> request -> drop
//!        \-> reply            \-> reply            \-> pass/fail
//! ```

use crate::request::{Request, SessionData};
use openssl::rand::rand_bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tacplus_proto::{Attr, AttrList, Value};
use tracing::debug;

pub const TOKEN_LEN: usize = 16;
pub type Token = [u8; TOKEN_LEN];

/// Mixed into derived tokens so entries from different server builds never
/// alias. 0xMMmmpp from the crate version.
const SERVER_VERSION_HEX: u32 = 0x000400;

/// One tracked conversation.
#[derive(Debug)]
struct StateEntry {
    /// Monotonic id, for logs only.
    id: u64,
    token: Token,
    cleanup_at: Instant,
    /// Turns taken on this conversation so far.
    tries: u8,
    /// The conversation's arena. `None` while a Request holds it.
    session: Option<SessionData>,
}

/// Observable view of an entry, for callers outside the store lock.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub id: u64,
    pub token: Token,
    pub tries: u8,
    pub has_session: bool,
}

struct StoreInner {
    next_id: u64,
    index: BTreeMap<Token, StateEntry>,
    /// Insertion-ordered cleanup queue. Every entry gets the same lifetime,
    /// so insertion order equals expiry order.
    fifo: VecDeque<Token>,
}

pub struct StateStore {
    max_sessions: u32,
    timeout: Duration,
    /// Forced value for token byte 3 when < 256, so external load balancers
    /// can shard on a stable prefix. 256 and above disables the override.
    state_seed: u32,
    inner: Mutex<StoreInner>,
}

fn token_from_attrs(attrs: &AttrList) -> Option<Token> {
    let octets = attrs.find_octets(Attr::State)?;
    if octets.len() != TOKEN_LEN {
        return None;
    }
    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(octets);
    Some(token)
}

fn token_hex(token: &Token) -> String {
    token.iter().map(|b| format!("{b:02x}")).collect()
}

impl StateStore {
    pub fn new(max_sessions: u32, timeout: Duration, state_seed: u32) -> StateStore {
        StateStore {
            max_sessions,
            timeout,
            state_seed,
            inner: Mutex::new(StoreInner {
                next_id: 0,
                index: BTreeMap::new(),
                fifo: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("state store mutex poisoned")
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (index size, cleanup queue size). The two always match.
    pub fn sizes(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.index.len(), inner.fifo.len())
    }

    /// Pop every expired entry off the head of the cleanup queue. Expired
    /// entries are handed back so the caller can drop them after unlocking.
    fn reap_expired(inner: &mut StoreInner, now: Instant, reaped: &mut Vec<StateEntry>) {
        while let Some(token) = inner.fifo.front() {
            let expired = inner
                .index
                .get(token)
                .map(|entry| entry.cleanup_at < now)
                .unwrap_or(true);
            if !expired {
                break;
            }
            let token = inner.fifo.pop_front().expect("fifo head vanished");
            if let Some(entry) = inner.index.remove(&token) {
                debug!(id = entry.id, "state entry expired");
                reaped.push(entry);
            }
        }
    }

    fn unlink(inner: &mut StoreInner, token: &Token) -> Option<StateEntry> {
        let entry = inner.index.remove(token)?;
        inner.fifo.retain(|t| t != token);
        debug!(id = entry.id, "state entry unlinked");
        Some(entry)
    }

    /// Derive a fresh token. The caller seeds `token` with the previous
    /// conversation token (or zeroes); the variable bytes are overwritten
    /// from the random source and the structured bytes are stamped on top.
    fn derive_token(&self, token: &mut Token, tries: u8) -> bool {
        let mut rnd = [0u8; TOKEN_LEN];
        if rand_bytes(&mut rnd).is_err() {
            return false;
        }
        for i in [2usize, 3, 4, 5, 6, 7, 9, 11, 13, 14, 15] {
            token[i] = rnd[i];
        }
        token[0] = tries;
        token[1] = token[0] ^ tries;
        token[8] = token[2] ^ ((SERVER_VERSION_HEX >> 16) & 0xff) as u8;
        token[10] = token[2] ^ ((SERVER_VERSION_HEX >> 8) & 0xff) as u8;
        token[12] = token[2] ^ (SERVER_VERSION_HEX & 0xff) as u8;
        if self.state_seed < 256 {
            token[3] = self.state_seed as u8;
        }
        true
    }

    /// Create a new entry keyed by `packet`'s `State` attribute, deriving and
    /// appending one when the packet has none. `original` locates the
    /// previous turn's entry, whose tries counter carries over and which is
    /// freed here once it has no persisted data left.
    ///
    /// Returns `None` when the store is full or token generation fails.
    pub fn create(&self, packet: &mut AttrList, original: Option<&AttrList>) -> Option<Token> {
        self.create_at(Instant::now(), packet, original)
    }

    pub fn create_at(
        &self,
        now: Instant,
        packet: &mut AttrList,
        original: Option<&AttrList>,
    ) -> Option<Token> {
        let mut deferred: Vec<StateEntry> = Vec::new();
        let mut previous: Option<(Token, u8)> = None;

        {
            let mut inner = self.lock();
            Self::reap_expired(&mut inner, now, &mut deferred);

            if inner.index.len() >= self.max_sessions as usize {
                return None;
            }

            // Capture what we need from the old entry now; once the mutex is
            // released its state is indeterminate.
            if let Some(token) = original.and_then(token_from_attrs)
                && let Some(entry) = inner.index.get(&token)
            {
                previous = Some((entry.token, entry.tries));
                let dataless = entry
                    .session
                    .as_ref()
                    .map(|s| s.data.is_empty())
                    .unwrap_or(true);
                if dataless && let Some(old) = Self::unlink(&mut inner, &token) {
                    deferred.push(old);
                }
            }
        }

        // Freeing may run persisted-data destructors; keep that out of the
        // critical section.
        drop(deferred);

        let (mut token, tries) = match previous {
            Some((token, tries)) => (token, tries.wrapping_add(1)),
            None => ([0u8; TOKEN_LEN], 0),
        };

        // Policy modules may choose their own token; honor a State attribute
        // of the right length verbatim.
        let explicit = token_from_attrs(packet);
        match explicit {
            Some(chosen) => token = chosen,
            None => {
                if !self.derive_token(&mut token, tries) {
                    return None;
                }
            }
        }

        let mut entry = StateEntry {
            id: 0,
            token,
            cleanup_at: now + self.timeout,
            tries,
            session: None,
        };

        {
            let mut inner = self.lock();
            // We dropped the lock; another request may have taken the last
            // slot or the same token in the meantime.
            if inner.index.len() >= self.max_sessions as usize {
                return None;
            }
            if inner.index.contains_key(&token) {
                return None;
            }
            entry.id = inner.next_id;
            inner.next_id += 1;
            debug!(
                id = entry.id,
                token = %token_hex(&token),
                expires_s = self.timeout.as_secs(),
                "state entry created"
            );
            inner.fifo.push_back(token);
            inner.index.insert(token, entry);
        }

        if explicit.is_none() {
            packet.add(Attr::State, Value::Octets(token.to_vec()));
        }
        Some(token)
    }

    /// Look up the entry named by `packet`'s `State` attribute. Absent or
    /// wrong-length attributes find nothing. Does not touch the cleanup queue.
    pub fn find(&self, packet: &AttrList) -> Option<EntryInfo> {
        let token = token_from_attrs(packet)?;
        let inner = self.lock();
        inner.index.get(&token).map(|entry| EntryInfo {
            id: entry.id,
            token: entry.token,
            tries: entry.tries,
            has_session: entry.session.is_some(),
        })
    }

    /// Drop the entry for this Request's conversation, called when a reply
    /// ends it (pass, fail, error, restart, follow).
    pub fn discard(&self, request: &mut Request) {
        let Some(token) = token_from_attrs(&request.packet.attrs) else {
            return;
        };
        let entry = {
            let mut inner = self.lock();
            Self::unlink(&mut inner, &token)
        };
        drop(entry);
        request.session_state = None;
    }

    /// Move the stored conversation arena into the Request. The entry stays
    /// linked (its token remains claimable for the outgoing turn) but is left
    /// empty; the Request is the arena's sole owner until `from_request`.
    pub fn to_request(&self, request: &mut Request) {
        let Some(token) = token_from_attrs(&request.packet.attrs) else {
            debug!("no State attribute, cannot restore session-state");
            return;
        };

        let mut old: Option<SessionData> = None;
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.index.get_mut(&token) {
                old = request.session_state.take();
                if let Some(mut session) = entry.session.take() {
                    // Persisted request data goes back onto the request; the
                    // attribute arena becomes the request's session state.
                    request.data.append(&mut session.data);
                    request.session_state = Some(session);
                }
            }
        }
        // Free the displaced arena outside the mutex for less contention.
        drop(old);

        if request.session_state.is_some() {
            debug!("restored session-state");
        } else {
            debug!("no session-state attributes to restore");
        }
    }

    /// Transfer the Request's session arena into a fresh entry keyed by the
    /// reply's `State` attribute. Returns `true` when there was nothing to
    /// persist or the transfer succeeded, `false` when the store refused the
    /// entry (capacity); the conversation then simply cannot continue.
    pub fn from_request(&self, request: &mut Request) -> bool {
        self.from_request_at(Instant::now(), request)
    }

    pub fn from_request_at(&self, now: Instant, request: &mut Request) -> bool {
        let persisted = request.take_persistable();
        if request.session_state.is_none() && persisted.is_empty() {
            return true;
        }

        debug!("saving session-state");

        let (reply, inbound) = (&mut request.reply.attrs, &request.packet.attrs);
        let Some(token) = self.create_at(now, reply, Some(inbound)) else {
            // Hand the arena back; the Request still owns it until it dies.
            if !persisted.is_empty() {
                request
                    .session_state
                    .get_or_insert_with(SessionData::default)
                    .data
                    .extend(persisted);
            }
            return false;
        };

        let session = SessionData {
            vps: request
                .session_state
                .take()
                .map(|s| s.vps)
                .unwrap_or_default(),
            data: persisted,
        };

        let mut inner = self.lock();
        if let Some(entry) = inner.index.get_mut(&token) {
            entry.session = Some(session);
        }
        true
    }
}
