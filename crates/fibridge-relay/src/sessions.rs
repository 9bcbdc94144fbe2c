//! Attached host sessions, keyed by session id.

use fibridge_proto::{ErrorCode, Message, ResumeTicket};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::id::{is_valid_session_id, IdGenerator, ResumeKey};
use crate::link::{CatalogEntry, ControlLink};

/// Public view of one session, as shown on the status page.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub in_flight: usize,
    pub paths: BTreeMap<String, CatalogEntry>,
}

#[derive(Default)]
pub struct SessionTable {
    links: RwLock<HashMap<String, Arc<ControlLink>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the link for a freshly handshaken host.
    ///
    /// A resume is honored only when its token was issued for that id under
    /// `key`, and then even when another link holds the id; that link is
    /// returned so the caller can close it. Any other resume gets a fresh id.
    pub fn attach(
        &self,
        resume: Option<ResumeTicket>,
        peer: SocketAddr,
        outbound: mpsc::Sender<Message>,
        ids: &dyn IdGenerator,
        key: &ResumeKey,
        body_buffer: usize,
    ) -> (Arc<ControlLink>, Option<Arc<ControlLink>>) {
        let resume = resume.and_then(|ticket| {
            let honored = is_valid_session_id(&ticket.session_id)
                && key.verify(&ticket.session_id, &ticket.token);
            if !honored {
                warn!("{} failed to resume {:?}: bad token", peer, ticket.session_id);
            }
            honored.then_some(ticket.session_id)
        });

        let mut links = self.links.write();
        let session_id = match resume {
            Some(id) => id,
            None => loop {
                let id = ids.generate();
                if !links.contains_key(&id) {
                    break id;
                }
            },
        };

        let link = Arc::new(ControlLink::new(
            session_id.clone(),
            peer,
            outbound,
            body_buffer,
        ));
        let replaced = links.insert(session_id, link.clone());
        (link, replaced)
    }

    /// Remove `link`, unless its id has since been taken over.
    pub fn detach(&self, link: &Arc<ControlLink>) -> bool {
        let mut links = self.links.write();
        let current = links
            .get(link.session_id())
            .is_some_and(|held| Arc::ptr_eq(held, link));
        if current {
            links.remove(link.session_id());
        }
        current
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ControlLink>> {
        self.links.read().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .links
            .read()
            .values()
            .map(|link| SessionSummary {
                id: link.session_id().to_string(),
                in_flight: link.in_flight(),
                paths: link.catalog(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Tell every host the relay is going away and close its link.
    pub fn close_all(&self) {
        for link in self.links.read().values() {
            link.notify_error(ErrorCode::Shutdown, "relay shutting down");
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ShortIdGenerator;

    fn attach(
        table: &SessionTable,
        key: &ResumeKey,
        resume: Option<(&str, &str)>,
    ) -> (Arc<ControlLink>, Option<Arc<ControlLink>>) {
        let (tx, _rx) = mpsc::channel(4);
        table.attach(
            resume.map(|(session_id, token)| ResumeTicket {
                session_id: session_id.to_string(),
                token: token.to_string(),
            }),
            "127.0.0.1:9".parse().unwrap(),
            tx,
            &ShortIdGenerator,
            key,
            4,
        )
    }

    #[test]
    fn test_fresh_sessions_get_distinct_ids() {
        let table = SessionTable::new();
        let key = ResumeKey::random();
        let (a, _) = attach(&table, &key, None);
        let (b, _) = attach(&table, &key, None);
        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_resume_takes_over_and_stale_detach_is_ignored() {
        let table = SessionTable::new();
        let key = ResumeKey::random();
        let token = key.token_for("k3x9-ab2c");
        let (old, replaced) = attach(&table, &key, Some(("k3x9-ab2c", &token)));
        assert!(replaced.is_none());

        let (new, replaced) = attach(&table, &key, Some(("k3x9-ab2c", &token)));
        assert!(Arc::ptr_eq(&replaced.unwrap(), &old));

        assert!(!table.detach(&old));
        assert!(Arc::ptr_eq(&table.get("k3x9-ab2c").unwrap(), &new));
        assert!(table.detach(&new));
        assert!(table.is_empty());
    }

    #[test]
    fn test_resume_without_matching_token_gets_fresh_id() {
        let table = SessionTable::new();
        let key = ResumeKey::random();
        let token = key.token_for("k3x9-ab2c");
        let (owner, _) = attach(&table, &key, Some(("k3x9-ab2c", &token)));

        for forged in ["", "00", &ResumeKey::random().token_for("k3x9-ab2c")] {
            let (intruder, replaced) = attach(&table, &key, Some(("k3x9-ab2c", forged)));
            assert!(replaced.is_none());
            assert_ne!(intruder.session_id(), "k3x9-ab2c");
        }
        assert!(Arc::ptr_eq(&table.get("k3x9-ab2c").unwrap(), &owner));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_invalid_resume_id_is_replaced() {
        let table = SessionTable::new();
        let key = ResumeKey::random();
        let token = key.token_for("../../etc");
        let (link, _) = attach(&table, &key, Some(("../../etc", &token)));
        assert_ne!(link.session_id(), "../../etc");
        assert_eq!(link.session_id().len(), 9);
    }
}
