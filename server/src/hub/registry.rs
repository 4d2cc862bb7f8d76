//! Connection registry: ordered map from username to the user's live
//! connections.
//!
//! Owned exclusively by the service center's event loop; nothing here is
//! synchronized. `add_conn` is the only growing operation and the only place
//! capacity is enforced.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::conn::Conn;
use crate::error::{HubError, Result};

#[derive(Default)]
pub struct ConnRegistry {
    entries: BTreeMap<String, Vec<Arc<dyn Conn>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its username.
    ///
    /// A cap of zero means unlimited. Re-adding a connection whose `uniq_id`
    /// already exists under the user succeeds without modification.
    pub fn add_conn(
        &mut self,
        conn: Arc<dyn Conn>,
        max_per_user: usize,
        max_users: usize,
    ) -> Result<()> {
        let username = conn.username().to_string();
        match self.entries.get_mut(&username) {
            None => {
                if max_users > 0 && self.entries.len() >= max_users {
                    return Err(HubError::TooManyUsers);
                }
                self.entries.insert(username, vec![conn]);
            }
            Some(list) => {
                if max_per_user > 0 && list.len() >= max_per_user {
                    return Err(HubError::TooManyConnForThisUser);
                }
                if list.iter().any(|c| c.uniq_id() == conn.uniq_id()) {
                    return Ok(());
                }
                list.push(conn);
            }
        }
        Ok(())
    }

    /// All live connections for a user; empty when the user has none.
    pub fn get_conn(&self, username: &str) -> &[Arc<dyn Conn>] {
        self.entries
            .get(username)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove a connection, matching by `uniq_id` under its username.
    /// Returns false when the connection was not registered. Entries left
    /// empty are dropped.
    pub fn del_conn(&mut self, conn: &dyn Conn) -> bool {
        let username = conn.username();
        let Some(list) = self.entries.get_mut(username) else {
            return false;
        };
        let Some(idx) = list.iter().position(|c| c.uniq_id() == conn.uniq_id()) else {
            return false;
        };
        list.swap_remove(idx);
        if list.is_empty() {
            self.entries.remove(username);
        }
        true
    }

    /// Number of users with at least one live connection.
    pub fn nr_users(&self) -> usize {
        self.entries.len()
    }

    /// Total number of live connections across all users.
    pub fn nr_conns(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cache::MessageCache;
    use crate::message::{ForwardRequest, Message, SubscribeRequest};

    struct StubConn {
        username: String,
        uniq_id: String,
    }

    fn stub(username: &str, uniq_id: &str) -> Arc<dyn Conn> {
        Arc::new(StubConn {
            username: username.to_string(),
            uniq_id: uniq_id.to_string(),
        })
    }

    #[async_trait]
    impl Conn for StubConn {
        fn service(&self) -> &str {
            "test"
        }
        fn username(&self) -> &str {
            &self.username
        }
        fn uniq_id(&self) -> &str {
            &self.uniq_id
        }
        fn remote_addr(&self) -> &str {
            "127.0.0.1:0"
        }
        fn visible(&self) -> bool {
            true
        }
        async fn send_message(
            &self,
            _msg: &Message,
            _extra: Option<&HashMap<String, String>>,
            _ttl: Duration,
        ) -> crate::error::Result<String> {
            Ok(String::new())
        }
        async fn read_message(&self) -> crate::error::Result<Message> {
            Err(HubError::ConnectionClosed)
        }
        async fn close(&self) {}
        fn set_forward_channel(&self, _tx: mpsc::Sender<ForwardRequest>) {}
        fn set_subscribe_channel(&self, _tx: mpsc::Sender<SubscribeRequest>) {}
        fn set_message_cache(&self, _cache: std::sync::Arc<dyn MessageCache>) {}
    }

    #[test]
    fn add_and_get() {
        let mut reg = ConnRegistry::new();
        reg.add_conn(stub("u1", "a"), 0, 0).unwrap();
        reg.add_conn(stub("u1", "b"), 0, 0).unwrap();
        assert_eq!(reg.get_conn("u1").len(), 2);
        assert!(reg.get_conn("nobody").is_empty());
        assert_eq!(reg.nr_conns(), 2);
        assert_eq!(reg.nr_users(), 1);
    }

    #[test]
    fn re_add_same_uniq_id_is_idempotent() {
        let mut reg = ConnRegistry::new();
        reg.add_conn(stub("u1", "a"), 2, 2).unwrap();
        reg.add_conn(stub("u1", "a"), 2, 2).unwrap();
        assert_eq!(reg.get_conn("u1").len(), 1);
    }

    #[test]
    fn per_user_cap() {
        let mut reg = ConnRegistry::new();
        reg.add_conn(stub("u1", "a"), 2, 0).unwrap();
        reg.add_conn(stub("u1", "b"), 2, 0).unwrap();
        let err = reg.add_conn(stub("u1", "c"), 2, 0).unwrap_err();
        assert!(matches!(err, HubError::TooManyConnForThisUser));
        assert_eq!(reg.get_conn("u1").len(), 2);
    }

    #[test]
    fn user_cap() {
        let mut reg = ConnRegistry::new();
        reg.add_conn(stub("u1", "a"), 0, 2).unwrap();
        reg.add_conn(stub("u2", "a"), 0, 2).unwrap();
        let err = reg.add_conn(stub("u3", "a"), 0, 2).unwrap_err();
        assert!(matches!(err, HubError::TooManyUsers));
        // Existing users can still add connections.
        reg.add_conn(stub("u2", "b"), 0, 2).unwrap();
    }

    #[test]
    fn del_conn_round_trip() {
        let mut reg = ConnRegistry::new();
        let c = stub("u1", "a");
        reg.add_conn(c.clone(), 0, 0).unwrap();
        assert!(reg.del_conn(c.as_ref()));
        assert!(reg.get_conn("u1").is_empty());
        assert_eq!(reg.nr_users(), 0);
    }

    #[test]
    fn del_conn_non_member_is_noop() {
        let mut reg = ConnRegistry::new();
        reg.add_conn(stub("u1", "a"), 0, 0).unwrap();
        assert!(!reg.del_conn(stub("u1", "b").as_ref()));
        assert!(!reg.del_conn(stub("u2", "a").as_ref()));
        assert_eq!(reg.nr_conns(), 1);
    }

    #[test]
    fn entry_dropped_frees_user_slot() {
        let mut reg = ConnRegistry::new();
        let c1 = stub("u1", "a");
        reg.add_conn(c1.clone(), 0, 1).unwrap();
        assert!(matches!(
            reg.add_conn(stub("u2", "a"), 0, 1),
            Err(HubError::TooManyUsers)
        ));
        reg.del_conn(c1.as_ref());
        reg.add_conn(stub("u2", "a"), 0, 1).unwrap();
    }
}
