//! Affinity table — binds opaque client tokens to one live replica
//!
//! A binding lives for the rule's stickiness duration, measured from the
//! last request that used it. An unknown, expired, or dead binding is not an
//! error: the request falls back to least-connections distribution and the
//! token is re-bound.

use crate::service::{Replica, TargetGroup};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Default cap on tracked bindings per table
const DEFAULT_MAX_BINDINGS: usize = 100_000;

/// A token → replica binding
struct Binding {
    replica_id: String,
    last_access: Instant,
}

/// Outcome of an affinity-aware selection
#[derive(Debug, Clone)]
pub struct Selection {
    pub replica: Arc<Replica>,
    /// Token to hand back to the client when a new one was minted
    pub issued_token: Option<String>,
    /// Whether an existing binding was honored
    pub affinitized: bool,
}

/// Affinity table for one routing rule
pub struct AffinityTable {
    cookie_name: String,
    ttl: Duration,
    max_bindings: usize,
    bindings: RwLock<HashMap<String, Binding>>,
}

impl AffinityTable {
    pub fn new(cookie_name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            ttl,
            max_bindings: DEFAULT_MAX_BINDINGS,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Cap the number of tracked bindings
    pub fn with_max_bindings(mut self, max_bindings: usize) -> Self {
        self.max_bindings = max_bindings.max(1);
        self
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replica id bound to a token, refreshing its window
    pub fn lookup(&self, token: &str) -> Option<String> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(binding) = bindings.get_mut(token) {
            if now.duration_since(binding.last_access) < self.ttl {
                binding.last_access = now;
                return Some(binding.replica_id.clone());
            }
            bindings.remove(token);
        }
        None
    }

    /// Bind a token to a replica
    pub fn bind(&self, token: String, replica_id: String) {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);

        if bindings.len() >= self.max_bindings && !bindings.contains_key(&token) {
            self.evict_expired_locked(&mut bindings);
            if bindings.len() >= self.max_bindings {
                if let Some(oldest) = bindings
                    .iter()
                    .min_by_key(|(_, b)| b.last_access)
                    .map(|(k, _)| k.clone())
                {
                    bindings.remove(&oldest);
                }
            }
        }

        bindings.insert(
            token,
            Binding {
                replica_id,
                last_access: Instant::now(),
            },
        );
    }

    pub fn unbind(&self, token: &str) {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// Drop every binding to a replica (drained or failed)
    pub fn remove_replica(&self, replica_id: &str) -> usize {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        let before = bindings.len();
        bindings.retain(|_, b| b.replica_id != replica_id);
        before - bindings.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn evict_expired(&self) -> usize {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        self.evict_expired_locked(&mut bindings)
    }

    fn evict_expired_locked(&self, bindings: &mut HashMap<String, Binding>) -> usize {
        let before = bindings.len();
        let now = Instant::now();
        bindings.retain(|_, b| now.duration_since(b.last_access) < self.ttl);
        before - bindings.len()
    }

    /// Select a replica: honor a live binding, otherwise pick the
    /// least-connected healthy replica and (re)bind the token.
    pub fn select(&self, token: Option<&str>, group: &TargetGroup) -> Option<Selection> {
        if let Some(token) = token {
            if let Some(replica_id) = self.lookup(token) {
                if let Some(replica) = group
                    .healthy_replicas()
                    .into_iter()
                    .find(|r| r.id == replica_id)
                {
                    return Some(Selection {
                        replica,
                        issued_token: None,
                        affinitized: true,
                    });
                }
                self.unbind(token);
            }
        }

        let replica = group.least_connections()?;
        let issued_token = match token {
            Some(token) => {
                self.bind(token.to_string(), replica.id.clone());
                None
            }
            None => {
                let token = generate_token();
                self.bind(token.clone(), replica.id.clone());
                Some(token)
            }
        };

        Some(Selection {
            replica,
            issued_token,
            affinitized: false,
        })
    }

    /// Set-Cookie value carrying the affinity token
    pub fn build_cookie(&self, token: &str) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name,
            token,
            self.ttl.as_secs()
        )
    }

    /// Extract the affinity token from a Cookie header value
    pub fn extract_token<'a>(&self, cookie_header: &'a str) -> Option<&'a str> {
        let prefix = format!("{}=", self.cookie_name);
        cookie_header
            .split(';')
            .filter_map(|part| part.trim().strip_prefix(prefix.as_str()))
            .find(|value| !value.is_empty())
    }
}

fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(ids: &[&str]) -> TargetGroup {
        let group = TargetGroup::new("sandbox-9000", 9000);
        for id in ids {
            group.register(Arc::new(Replica::new(*id, format!("{}:9000", id), 1)));
        }
        group
    }

    fn table(ttl_secs: u64) -> AffinityTable {
        AffinityTable::new("a3s_affinity", Duration::from_secs(ttl_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_and_lookup() {
        let t = table(240);
        t.bind("tok".into(), "a".into());
        assert_eq!(t.lookup("tok"), Some("a".to_string()));
        assert_eq!(t.lookup("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_expires() {
        let t = table(240);
        t.bind("tok".into(), "a".into());
        tokio::time::advance(Duration::from_secs(239)).await;
        assert_eq!(t.lookup("tok"), Some("a".to_string()));
        // window slides from the last use
        tokio::time::advance(Duration::from_secs(239)).await;
        assert_eq!(t.lookup("tok"), Some("a".to_string()));
        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(t.lookup("tok"), None);
        assert_eq!(t.binding_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_mints_token() {
        let t = table(240);
        let g = group(&["a", "b"]);
        let selection = t.select(None, &g).unwrap();
        let token = selection.issued_token.clone().unwrap();
        assert!(!selection.affinitized);

        for _ in 0..5 {
            let again = t.select(Some(&token), &g).unwrap();
            assert!(again.affinitized);
            assert_eq!(again.replica.id, selection.replica.id);
            assert!(again.issued_token.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_binding_falls_back() {
        let t = table(60);
        let g = group(&["a", "b"]);
        t.bind("tok".into(), "a".into());
        g.replicas()[0].inc_connections();
        tokio::time::advance(Duration::from_secs(61)).await;

        let selection = t.select(Some("tok"), &g).unwrap();
        assert!(!selection.affinitized);
        assert_eq!(selection.replica.id, "b");
        assert_eq!(t.lookup("tok"), Some("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_replica_rebinds() {
        let t = table(240);
        let g = group(&["a", "b"]);
        t.bind("tok".into(), "a".into());
        g.deregister("a");
        let selection = t.select(Some("tok"), &g).unwrap();
        assert_eq!(selection.replica.id, "b");
        assert!(!selection.affinitized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_healthy_replicas() {
        let t = table(240);
        let g = group(&["a"]);
        g.replicas()[0].set_healthy(false);
        assert!(t.select(None, &g).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_replica_and_eviction() {
        let t = table(10).with_max_bindings(2);
        t.bind("s1".into(), "a".into());
        t.bind("s2".into(), "a".into());
        assert_eq!(t.remove_replica("a"), 2);

        t.bind("s1".into(), "a".into());
        t.bind("s2".into(), "b".into());
        t.bind("s3".into(), "b".into());
        assert_eq!(t.binding_count(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(t.evict_expired(), 2);
    }

    #[test]
    fn test_cookie_round_trip() {
        let t = table(240);
        let cookie = t.build_cookie("abc-123");
        assert!(cookie.starts_with("a3s_affinity=abc-123;"));
        assert!(cookie.contains("Max-Age=240"));
        assert_eq!(t.extract_token("x=1; a3s_affinity=abc-123"), Some("abc-123"));
        assert_eq!(t.extract_token("a3s_affinity="), None);
        assert_eq!(t.extract_token("other=v"), None);
    }
}
