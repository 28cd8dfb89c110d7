// Short-term sign-in bans for identities that were forced out.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;

pub const DEFAULT_FORCEOUT_BAN: Duration = Duration::from_secs(5 * 60);

/// Time-bounded ban set keyed by identity.
///
/// Expired entries are dropped lazily by the lookups that touch them and by
/// [`ForceoutRegistry::count`], which sweeps the whole map.
#[derive(Debug)]
pub struct ForceoutRegistry {
    ban: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for ForceoutRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FORCEOUT_BAN)
    }
}

impl ForceoutRegistry {
    pub fn new(ban: Duration) -> Self {
        Self { ban, entries: Mutex::new(HashMap::new()) }
    }

    pub fn ban_length(&self) -> Duration {
        self.ban
    }

    pub fn is_forbidden(&self, id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                entries.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn add(&self, id: &str) {
        self.add_for(id, self.ban);
    }

    pub fn add_for(&self, id: &str, ban: Duration) {
        if id.trim().is_empty() {
            return;
        }
        self.lock().insert(id.to_owned(), Instant::now() + ban);
    }

    /// Whole seconds left on the ban, rounded up; `0` when not banned.
    pub fn remaining_seconds(&self, id: &str) -> i64 {
        let mut entries = self.lock();
        let Some(expires_at) = entries.get(id).copied() else {
            return 0;
        };

        let remaining = expires_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            entries.remove(id);
            return 0;
        }
        let whole = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        i64::try_from(whole).unwrap_or(i64::MAX)
    }

    pub fn count(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, expires_at| *expires_at > now);
        entries.len()
    }

    /// Drop every ban and return how many were present.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
