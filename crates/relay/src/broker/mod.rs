// Identity-keyed connection broker between downstream sessions and upstream clients.
//
// All four tables live behind one mutex that is never held across I/O.

mod inspect;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::Caches,
    forceout::ForceoutRegistry,
    upstream::{
        client::{UpstreamClient, UpstreamTimings},
        resolver::UpstreamResolver,
    },
    ws::session::DownstreamSession,
};

pub const EVICTED_FRAME: &str =
    "{\"code\":-6,\"content\":\"由于新身份连接，您已被自动断开\",\"evicted\":true}";

pub fn forceout_reject_frame(remaining_seconds: i64) -> String {
    format!(
        "{{\"code\":-4,\"content\":\"由于重复登录，您的连接被暂时禁止，请{remaining_seconds}秒后再试\",\"forceout\":true}}"
    )
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_identities: usize,
    pub close_delay: Duration,
    pub eviction_delay: Duration,
    pub forceout_delay: Duration,
    pub downstream_write_deadline: Duration,
    pub upstream: UpstreamTimings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_identities: 2,
            close_delay: Duration::from_secs(80),
            eviction_delay: Duration::from_secs(1),
            forceout_delay: Duration::from_secs(1),
            downstream_write_deadline: Duration::from_secs(5),
            upstream: UpstreamTimings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub active: usize,
    pub upstream: usize,
    pub downstream: usize,
    pub max_identities: usize,
    pub available_slots: usize,
}

type SessionSet = HashMap<Uuid, Arc<DownstreamSession>>;

struct PendingClose {
    generation: u64,
    timer: AbortHandle,
}

#[derive(Default)]
struct Tables {
    upstream_clients: HashMap<String, Arc<UpstreamClient>>,
    downstream_sessions: HashMap<String, SessionSet>,
    pending_close: HashMap<String, PendingClose>,
    connection_create_millis: HashMap<String, i64>,
    last_create_millis: i64,
    next_generation: u64,
}

impl Tables {
    fn cancel_pending_close(&mut self, identity: &str) {
        if let Some(pending) = self.pending_close.remove(identity) {
            pending.timer.abort();
        }
    }

    fn sessions_of(&self, identity: &str) -> Vec<Arc<DownstreamSession>> {
        self.downstream_sessions
            .get(identity)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Oldest identity other than `identity`, by creation stamp.
    fn oldest_other(&self, identity: &str) -> Option<String> {
        self.connection_create_millis
            .iter()
            .filter(|(other, _)| other.as_str() != identity)
            .min_by_key(|(_, stamp)| **stamp)
            .map(|(other, _)| other.clone())
    }

    /// Creation stamps are wall-clock millis, forced strictly increasing.
    fn next_create_stamp(&mut self) -> i64 {
        let stamp = Utc::now().timestamp_millis().max(self.last_create_millis + 1);
        self.last_create_millis = stamp;
        stamp
    }

    fn remove_upstream(&mut self, identity: &str) -> Option<Arc<UpstreamClient>> {
        self.connection_create_millis.remove(identity);
        self.upstream_clients.remove(identity)
    }
}

pub struct Broker {
    config: BrokerConfig,
    resolver: UpstreamResolver,
    forceout: Arc<ForceoutRegistry>,
    caches: Caches,
    tables: Mutex<Tables>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        resolver: UpstreamResolver,
        forceout: Arc<ForceoutRegistry>,
        caches: Caches,
    ) -> Arc<Self> {
        let mut config = config;
        if config.max_identities == 0 {
            config.max_identities = BrokerConfig::default().max_identities;
        }
        Arc::new(Self { config, resolver, forceout, caches, tables: Mutex::new(Tables::default()) })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn forceout(&self) -> &Arc<ForceoutRegistry> {
        &self.forceout
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Bind `session` to `identity`, creating the upstream when needed.
    ///
    /// A force-banned identity gets a rejection frame and a closed session.
    /// Admitting a new identity at the cap evicts the oldest other one.
    pub async fn register_downstream(
        self: &Arc<Self>,
        identity: &str,
        session: Arc<DownstreamSession>,
        sign_frame: &str,
    ) {
        let identity = identity.trim();
        if identity.is_empty() {
            return;
        }

        if self.forceout.is_forbidden(identity) {
            let remaining = self.forceout.remaining_seconds(identity);
            info!(identity = %identity, remaining, "rejecting force-banned identity");
            if let Err(error) = session.send_text(&forceout_reject_frame(remaining)).await {
                debug!(identity = %identity, %error, "failed to deliver force-out rejection");
            }
            session.close().await;
            return;
        }

        let (should_create, evict) = {
            let mut tables = self.tables();
            tables.cancel_pending_close(identity);
            tables
                .downstream_sessions
                .entry(identity.to_owned())
                .or_default()
                .insert(session.id(), session);

            if tables.upstream_clients.contains_key(identity) {
                (false, None)
            } else if tables.upstream_clients.len() >= self.config.max_identities {
                (true, tables.oldest_other(identity))
            } else {
                (true, None)
            }
        };

        if let Some(evicted) = evict {
            self.evict(evicted).await;
        }
        if should_create {
            self.create_upstream(identity, sign_frame).await;
        }
    }

    /// Remove `session`; arm the delayed upstream close once the identity has none left.
    pub fn unregister_downstream(self: &Arc<Self>, identity: &str, session: &DownstreamSession) {
        let identity = identity.trim();
        if identity.is_empty() {
            return;
        }

        let mut tables = self.tables();
        let Some(sessions) = tables.downstream_sessions.get_mut(identity) else {
            return;
        };
        sessions.remove(&session.id());
        if !sessions.is_empty() {
            return;
        }
        tables.downstream_sessions.remove(identity);
        self.schedule_close_locked(&mut tables, identity);
    }

    /// Forward `raw` to the identity's upstream, creating one if a session exists.
    pub async fn send_to_upstream(self: &Arc<Self>, identity: &str, raw: &str) {
        let identity = identity.trim();
        if identity.is_empty() {
            return;
        }
        if self.forceout.is_forbidden(identity) {
            debug!(identity = %identity, "dropping frame from force-banned identity");
            return;
        }

        let (client, has_downstream) = {
            let tables = self.tables();
            (
                tables.upstream_clients.get(identity).cloned(),
                tables.downstream_sessions.contains_key(identity),
            )
        };

        let client = match client {
            Some(client) => Some(client),
            None if has_downstream => self.create_upstream(identity, "").await,
            None => None,
        };
        if let Some(client) = client {
            client.send_message(raw).await;
        }
    }

    /// Write `raw` to every session of `identity`; failed sessions are dropped.
    pub async fn broadcast_to_downstream(self: &Arc<Self>, identity: &str, raw: &str) {
        let sessions = self.tables().sessions_of(identity.trim());
        for session in sessions {
            if let Err(error) = session.send_text(raw).await {
                debug!(identity = %identity, session = %session.id(), %error, "downstream write failed");
                session.close().await;
                self.unregister_downstream(identity, &session);
            }
        }
    }

    /// Ban `identity`, deliver `frame`, drop the upstream, then close sessions after a grace delay.
    pub async fn handle_forceout(self: &Arc<Self>, identity: &str, frame: &str) {
        let identity = identity.trim();
        if identity.is_empty() {
            return;
        }

        info!(identity = %identity, "identity forced out");
        self.forceout.add(identity);
        self.broadcast_to_downstream(identity, frame).await;
        self.close_upstream_connection(identity).await;

        let broker = Arc::clone(self);
        let identity = identity.to_owned();
        let delay = self.config.forceout_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let sessions = broker.tables().sessions_of(&identity);
            for session in sessions {
                session.close().await;
            }
            broker.tables().downstream_sessions.remove(&identity);
        });
    }

    /// The identity's upstream is gone: forget it and close all its sessions.
    pub async fn handle_upstream_disconnect(&self, identity: &str) {
        let identity = identity.trim();
        if identity.is_empty() {
            return;
        }

        let sessions = {
            let mut tables = self.tables();
            tables.remove_upstream(identity);
            tables.downstream_sessions.remove(identity).unwrap_or_default()
        };
        for session in sessions.into_values() {
            session.close().await;
        }
    }

    /// Called by a client whose connection ended without an expected close.
    ///
    /// A stale client that has already been replaced leaves the newer one alone.
    pub(crate) async fn upstream_lost(&self, client: &Arc<UpstreamClient>) {
        let identity = client.identity();
        let replaced = self
            .tables()
            .upstream_clients
            .get(identity)
            .is_some_and(|current| !Arc::ptr_eq(current, client));
        if replaced {
            debug!(identity = %identity, "ignoring loss of a replaced upstream client");
            return;
        }
        self.handle_upstream_disconnect(identity).await;
    }

    /// Tear down every identity.
    pub async fn close_all_connections(&self) {
        let (clients, sessions) = {
            let mut tables = self.tables();
            for (_, pending) in tables.pending_close.drain() {
                pending.timer.abort();
            }
            tables.connection_create_millis.clear();
            let clients: Vec<_> = tables.upstream_clients.drain().map(|(_, client)| client).collect();
            let sessions: Vec<_> = tables
                .downstream_sessions
                .drain()
                .flat_map(|(_, sessions)| sessions.into_values())
                .collect();
            (clients, sessions)
        };

        info!(upstream = clients.len(), downstream = sessions.len(), "closing all connections");
        for client in clients {
            client.close_expected().await;
        }
        for session in sessions {
            session.close().await;
        }
    }

    pub async fn close_upstream_connection(&self, identity: &str) {
        let identity = identity.trim();
        if identity.is_empty() {
            return;
        }

        let client = self.tables().remove_upstream(identity);
        if let Some(client) = client {
            debug!(identity = %identity, "closing upstream connection");
            client.close_expected().await;
        }
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let tables = self.tables();
        let upstream = tables.upstream_clients.len();
        let downstream: usize = tables.downstream_sessions.values().map(HashMap::len).sum();
        ConnectionStats {
            active: upstream + downstream,
            upstream,
            downstream,
            max_identities: self.config.max_identities,
            available_slots: self.config.max_identities.saturating_sub(upstream),
        }
    }

    pub fn upstream_client(&self, identity: &str) -> Option<Arc<UpstreamClient>> {
        self.tables().upstream_clients.get(identity).cloned()
    }

    pub fn session_count(&self, identity: &str) -> usize {
        self.tables().downstream_sessions.get(identity).map_or(0, HashMap::len)
    }

    pub fn has_pending_close(&self, identity: &str) -> bool {
        self.tables().pending_close.contains_key(identity)
    }

    /// Warn `identity`'s sessions, then close everything it owns after the eviction delay.
    async fn evict(self: &Arc<Self>, identity: String) {
        info!(identity = %identity, "evicting oldest identity at capacity");
        self.broadcast_to_downstream(&identity, EVICTED_FRAME).await;

        let broker = Arc::clone(self);
        let delay = self.config.eviction_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.close_upstream_connection(&identity).await;
            let sessions = broker.tables().sessions_of(&identity);
            for session in sessions {
                session.close().await;
            }
            let mut tables = broker.tables();
            tables.downstream_sessions.remove(&identity);
            tables.cancel_pending_close(&identity);
        });
    }

    /// Create and register the identity's client unless another task already has.
    ///
    /// Returns `None` for a force-banned identity; the ban is checked again
    /// under the table lock so a force-out racing the dial setup wins.
    async fn create_upstream(
        self: &Arc<Self>,
        identity: &str,
        sign_frame: &str,
    ) -> Option<Arc<UpstreamClient>> {
        if let Some(existing) = self.upstream_client(identity) {
            return Some(existing);
        }
        if self.forceout.is_forbidden(identity) {
            return None;
        }

        let url = self.resolver.resolve().await;
        let client =
            UpstreamClient::new(identity, url, self.config.upstream, Arc::downgrade(self));
        if !sign_frame.trim().is_empty() {
            client.send_message(sign_frame).await;
        }

        let registered = {
            let mut tables = self.tables();
            if self.forceout.is_forbidden(identity) {
                Err(None)
            } else if let Some(existing) = tables.upstream_clients.get(identity) {
                Err(Some(Arc::clone(existing)))
            } else {
                let stamp = tables.next_create_stamp();
                tables.upstream_clients.insert(identity.to_owned(), Arc::clone(&client));
                tables.connection_create_millis.insert(identity.to_owned(), stamp);
                Ok(())
            }
        };
        if let Err(winner) = registered {
            client.close_expected().await;
            return winner;
        }

        info!(identity = %identity, url = %client.url(), "creating upstream connection");
        client.connect_async();
        Some(client)
    }

    fn schedule_close_locked(self: &Arc<Self>, tables: &mut Tables, identity: &str) {
        tables.cancel_pending_close(identity);
        let generation = tables.next_generation;
        tables.next_generation += 1;

        let broker = Arc::clone(self);
        let owned = identity.to_owned();
        let delay = self.config.close_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.fire_pending_close(&owned, generation).await;
        });
        tables
            .pending_close
            .insert(identity.to_owned(), PendingClose { generation, timer: timer.abort_handle() });
    }

    async fn fire_pending_close(&self, identity: &str, generation: u64) {
        {
            let mut tables = self.tables();
            let current = tables.pending_close.get(identity).map(|pending| pending.generation);
            if current != Some(generation) {
                return;
            }
            tables.pending_close.remove(identity);
            if tables.downstream_sessions.contains_key(identity) {
                return;
            }
        }
        info!(identity = %identity, "closing idle upstream after last session left");
        self.close_upstream_connection(identity).await;
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| {
            warn!("broker tables lock was poisoned");
            poisoned.into_inner()
        })
    }
}
