//! RAM-only resumption caches.
//!
//! [`SessionCache`] is the server side: tickets it issued, each with the
//! shared secret, negotiated cipher, expiry and the set of resumption randoms
//! already presented. [`ClientSessionCache`] is the client side: a single
//! slot holding the most recent ticket.
//!
//! Nothing here is ever written to disk.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::crypto::{CipherKind, SharedSecret, RANDOM_SIZE};
use crate::handshake::metrics::HandshakeMetrics;
use crate::handshake::Ticket;

/// Randoms tracked per ticket before the ticket is retired.
pub const MAX_REPLAY_ENTRIES: usize = 4096;

/// How often the server sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A resumable session held by the server.
pub struct ServerSession {
    secret: SharedSecret,
    cipher: CipherKind,
    expires_at: Instant,
    seen: Mutex<HashSet<[u8; RANDOM_SIZE]>>,
}

impl ServerSession {
    /// Shared secret of the full handshake that issued the ticket.
    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    /// Cipher negotiated by that handshake.
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// True once `now` is past the expiry.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Number of resumption randoms recorded so far.
    pub fn replay_set_len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Outcome of a resumption lookup.
pub enum Resumption {
    /// Known ticket, fresh random: the session may be resumed.
    Accepted(Arc<ServerSession>),
    /// Known ticket, random already used.
    Replayed,
    /// Ticket not in the cache (never issued, expired or retired).
    Unknown,
}

enum ReplayCheck {
    Fresh,
    Seen,
    Full,
}

/// Server-side ticket cache shared by every connection of one server.
pub struct SessionCache {
    ttl: Duration,
    sessions: RwLock<HashMap<Ticket, Arc<ServerSession>>>,
}

impl SessionCache {
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Lifetime of new entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store the session produced by a full handshake.
    pub fn insert(&self, ticket: Ticket, secret: SharedSecret, cipher: CipherKind) {
        let session = Arc::new(ServerSession {
            secret,
            cipher,
            expires_at: Instant::now() + self.ttl,
            seen: Mutex::new(HashSet::new()),
        });
        self.sessions.write().insert(ticket, session);
    }

    /// Look up a ticket and record the presented random.
    ///
    /// The cache-wide lock is only held for the map lookup; the replay check
    /// takes the per-ticket lock.
    pub fn resume(&self, ticket: &Ticket, random: &[u8; RANDOM_SIZE]) -> Resumption {
        let now = Instant::now();
        let session = match self.sessions.read().get(ticket) {
            Some(session) => Arc::clone(session),
            None => return Resumption::Unknown,
        };

        if session.is_expired(now) {
            self.remove_if_same(ticket, &session);
            return Resumption::Unknown;
        }

        let check = {
            let mut seen = session.seen.lock();
            if seen.contains(random) {
                ReplayCheck::Seen
            } else if seen.len() >= MAX_REPLAY_ENTRIES {
                ReplayCheck::Full
            } else {
                seen.insert(*random);
                ReplayCheck::Fresh
            }
        };

        match check {
            ReplayCheck::Fresh => Resumption::Accepted(session),
            ReplayCheck::Seen => Resumption::Replayed,
            ReplayCheck::Full => {
                tracing::debug!("retiring ticket after {} resumptions", MAX_REPLAY_ENTRIES);
                self.remove_if_same(ticket, &session);
                Resumption::Unknown
            }
        }
    }

    fn remove_if_same(&self, ticket: &Ticket, session: &Arc<ServerSession>) {
        let mut sessions = self.sessions.write();
        if sessions.get(ticket).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(ticket);
        }
    }

    /// Drop a ticket.
    pub fn remove(&self, ticket: &Ticket) -> bool {
        self.sessions.write().remove(ticket).is_some()
    }

    /// Remove every entry expired at `now`; returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Ticket> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter(|(_, s)| s.is_expired(now))
                .map(|(ticket, _)| *ticket)
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write();
        expired
            .iter()
            .filter(|ticket| {
                // Re-check under the write lock; the ticket may have been replaced.
                sessions.get(*ticket).is_some_and(|s| s.is_expired(now))
                    && sessions.remove(*ticket).is_some()
            })
            .count()
    }

    /// Number of live tickets.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// True if no tickets are held.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Drop every ticket.
    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    /// Spawn the periodic sweeper.
    ///
    /// The task holds only a weak reference and ends by itself once the
    /// cache is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        metrics: Arc<HandshakeMetrics>,
    ) -> JoinHandle<()> {
        let cache: Weak<SessionCache> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep(Instant::now());
                if removed > 0 {
                    metrics.add_sessions_evicted(removed as u64);
                    tracing::debug!("Evicted {} expired sessions", removed);
                }
            }
        })
    }
}

/// What the client remembers from its last full handshake.
#[derive(Clone)]
pub struct CachedSession {
    /// Shared secret
    pub secret: SharedSecret,
    /// Ticket to present
    pub ticket: Ticket,
    /// Cipher negotiated for it
    pub cipher: CipherKind,
    expires_at: Instant,
}

/// Client-side single-slot resumption cache.
pub struct ClientSessionCache {
    ttl: Duration,
    slot: RwLock<Option<CachedSession>>,
}

impl ClientSessionCache {
    /// Create an empty cache; a zero `ttl` disables it.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    /// True if sessions are cached at all.
    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Remember a freshly issued ticket, replacing the previous one.
    ///
    /// The ticket is kept for four fifths of the TTL so the client stops
    /// offering it before the server forgets it.
    pub fn store(&self, secret: SharedSecret, ticket: Ticket, cipher: CipherKind) {
        if !self.is_enabled() {
            return;
        }
        *self.slot.write() = Some(CachedSession {
            secret,
            ticket,
            cipher,
            expires_at: Instant::now() + self.ttl * 4 / 5,
        });
    }

    /// The cached session, if one exists and has not expired.
    pub fn current(&self) -> Option<CachedSession> {
        let slot = self.slot.read();
        slot.as_ref()
            .filter(|s| Instant::now() < s.expires_at)
            .cloned()
    }

    /// Forget `ticket` if it is still the cached one.
    pub fn invalidate(&self, ticket: &Ticket) -> bool {
        let mut slot = self.slot.write();
        if slot.as_ref().is_some_and(|s| &s.ticket == ticket) {
            *slot = None;
            return true;
        }
        false
    }

    /// Forget whatever is cached.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}

/// Lets a resumed client connection invalidate the ticket it was built on.
pub(crate) struct ResumeHandle {
    cache: Arc<ClientSessionCache>,
    ticket: Ticket,
}

impl ResumeHandle {
    pub(crate) fn new(cache: Arc<ClientSessionCache>, ticket: Ticket) -> Self {
        Self { cache, ticket }
    }

    pub(crate) fn invalidate(&self) {
        if self.cache.invalidate(&self.ticket) {
            tracing::debug!("Dropped cached session after rejected resumption");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> SharedSecret {
        SharedSecret::combine(&[byte; 32], &[byte; 32])
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_accepts_fresh_random_once() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let ticket = [1u8; 21];
        cache.insert(ticket, secret(7), CipherKind::Aes256Gcm);

        match cache.resume(&ticket, &[9u8; 32]) {
            Resumption::Accepted(session) => {
                assert_eq!(session.cipher(), CipherKind::Aes256Gcm);
                assert_eq!(session.secret(), &secret(7));
                assert_eq!(session.replay_set_len(), 1);
            }
            _ => panic!("expected resumption"),
        }

        assert!(matches!(cache.resume(&ticket, &[9u8; 32]), Resumption::Replayed));
        assert!(matches!(cache.resume(&ticket, &[10u8; 32]), Resumption::Accepted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_ticket() {
        let cache = SessionCache::new(Duration::from_secs(60));
        assert!(matches!(cache.resume(&[0u8; 21], &[0u8; 32]), Resumption::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let ticket = [2u8; 21];
        cache.insert(ticket, secret(1), CipherKind::ChaCha20Poly1305);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(matches!(cache.resume(&ticket, &[1u8; 32]), Resumption::Unknown));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_cap_retires_ticket() {
        let cache = SessionCache::new(Duration::from_secs(600));
        let ticket = [3u8; 21];
        cache.insert(ticket, secret(1), CipherKind::ChaCha20Poly1305);

        for i in 0..MAX_REPLAY_ENTRIES {
            let mut random = [0u8; 32];
            random[..8].copy_from_slice(&(i as u64).to_be_bytes());
            assert!(matches!(cache.resume(&ticket, &random), Resumption::Accepted(_)));
        }

        assert!(matches!(cache.resume(&ticket, &[0xee; 32]), Resumption::Unknown));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.insert([1u8; 21], secret(1), CipherKind::Aes256Gcm);

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert([2u8; 21], secret(2), CipherKind::Aes256Gcm);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.sweep(Instant::now()), 1);
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.resume(&[2u8; 21], &[0u8; 32]), Resumption::Accepted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts_and_stops() {
        let cache = Arc::new(SessionCache::new(Duration::from_secs(30)));
        let metrics = Arc::new(HandshakeMetrics::new());
        let handle = cache.spawn_sweeper(SWEEP_INTERVAL, Arc::clone(&metrics));

        cache.insert([4u8; 21], secret(4), CipherKind::Aes256Gcm);
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(cache.len(), 0);
        assert_eq!(metrics.sessions_evicted(), 1);

        drop(cache);
        tokio::time::sleep(SWEEP_INTERVAL * 2).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_cache_expiry_and_invalidate() {
        let cache = ClientSessionCache::new(Duration::from_secs(60));
        cache.store(secret(5), [5u8; 21], CipherKind::Aes256Gcm);
        assert_eq!(cache.current().unwrap().ticket, [5u8; 21]);

        assert!(!cache.invalidate(&[6u8; 21]));
        assert!(cache.current().is_some());
        assert!(cache.invalidate(&[5u8; 21]));
        assert!(cache.current().is_none());

        cache.store(secret(5), [7u8; 21], CipherKind::Aes256Gcm);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_cache_gives_up_before_server() {
        let ttl = Duration::from_secs(60);
        let server = SessionCache::new(ttl);
        let client = ClientSessionCache::new(ttl);
        server.insert([8u8; 21], secret(8), CipherKind::Aes256Gcm);
        client.store(secret(8), [8u8; 21], CipherKind::Aes256Gcm);

        tokio::time::advance(Duration::from_secs(47)).await;
        assert!(client.current().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(client.current().is_none());
        assert!(matches!(server.resume(&[8u8; 21], &[1u8; 32]), Resumption::Accepted(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resume_and_sweep() {
        const TASKS: usize = 64;
        let cache = Arc::new(SessionCache::new(Duration::from_secs(60)));
        let ticket = [8u8; 21];
        cache.insert(ticket, secret(8), CipherKind::ChaCha20Poly1305);

        let churn = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for i in 0..200u8 {
                    let mut other = [0u8; 21];
                    other[0] = i;
                    other[1] = 1;
                    cache.insert(other, secret(i), CipherKind::Aes256Gcm);
                    cache.sweep(Instant::now());
                    tokio::task::yield_now().await;
                }
            })
        };

        let distinct: Vec<_> = (0..TASKS)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    let mut random = [0u8; 32];
                    random[..8].copy_from_slice(&(i as u64).to_be_bytes());
                    matches!(cache.resume(&ticket, &random), Resumption::Accepted(_))
                })
            })
            .collect();

        let barrier = Arc::new(tokio::sync::Barrier::new(TASKS));
        let racing: Vec<_> = (0..TASKS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache.resume(&ticket, &[0xff; 32])
                })
            })
            .collect();

        for task in distinct {
            assert!(task.await.unwrap());
        }

        let (mut accepted, mut replayed) = (0, 0);
        for task in racing {
            match task.await.unwrap() {
                Resumption::Accepted(_) => accepted += 1,
                Resumption::Replayed => replayed += 1,
                Resumption::Unknown => panic!("ticket vanished"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(replayed, TASKS - 1);

        churn.await.unwrap();
        assert_eq!(cache.len(), 201);
        match cache.resume(&ticket, &[0xfe; 32]) {
            Resumption::Accepted(session) => assert_eq!(session.replay_set_len(), TASKS + 2),
            _ => panic!("expected resumption"),
        }
    }

    #[tokio::test]
    async fn test_disabled_client_cache_stores_nothing() {
        let cache = ClientSessionCache::new(Duration::ZERO);
        cache.store(secret(1), [1u8; 21], CipherKind::Aes256Gcm);
        assert!(!cache.is_enabled());
        assert!(cache.current().is_none());
    }
}
