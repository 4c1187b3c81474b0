//! Tab identity resolution.
//!
//! A browser tab declares a stable tab id after connecting. The resolver
//! keeps at most one live connection per tab id and per (auth id, chat type)
//! pair; the latest identify wins and the connections it displaces are
//! reported back so the caller can notify and close them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::ChatType;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSession {
    pub tab_id: String,
    pub connection_id: Uuid,
    pub chat_type: ChatType,
    pub auth_id: Option<String>,
    pub remote_addr: IpAddr,
    pub identified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub connection_id: Uuid,
    pub remote_addr: IpAddr,
    pub tab_id: String,
    pub chat_type: ChatType,
    pub auth_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IdentifyOutcome {
    pub session: TabSession,
    /// Live connection that previously held this tab id
    pub duplicate_of: Option<Uuid>,
    /// Live connections displaced for sharing (auth id, chat type)
    pub auth_conflicts: Vec<Uuid>,
    /// The connection already held this exact tab
    pub unchanged: bool,
}

#[derive(Debug, Default)]
pub struct TabResolver {
    /// tab id -> connection
    tabs: HashMap<String, Uuid>,
    /// connection -> session
    sessions: HashMap<Uuid, TabSession>,
    /// ip -> tab ids
    ip_tabs: HashMap<IpAddr, HashSet<String>>,
    /// auth id -> tab ids
    auth_tabs: HashMap<String, HashSet<String>>,
}

impl TabResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `request.tab_id` to `request.connection_id`.
    ///
    /// `is_live` reports whether a connection can still receive events;
    /// mappings owned by dead connections are dropped without being reported.
    pub fn identify(&mut self, request: IdentifyRequest, is_live: impl Fn(Uuid) -> bool) -> IdentifyOutcome {
        let conn = request.connection_id;

        let unchanged = self.sessions.get(&conn).is_some_and(|s| {
            s.tab_id == request.tab_id && s.chat_type == request.chat_type && s.auth_id == request.auth_id
        });
        if unchanged {
            return IdentifyOutcome {
                session: self.sessions[&conn].clone(),
                duplicate_of: None,
                auth_conflicts: Vec::new(),
                unchanged: true,
            };
        }

        // A connection re-identifying under another tab gives up its old one
        self.detach(conn);

        let mut duplicate_of = None;
        if let Some(&holder) = self.tabs.get(&request.tab_id) {
            if holder != conn {
                if is_live(holder) {
                    duplicate_of = Some(holder);
                } else {
                    tracing::debug!(tab_id = %request.tab_id, stale_connection = %holder, "Replacing stale tab mapping");
                }
                self.detach(holder);
            }
        }

        let mut auth_conflicts = Vec::new();
        if let Some(auth_id) = &request.auth_id {
            for other in self.connections_for_auth(auth_id, request.chat_type) {
                if other == conn {
                    continue;
                }
                if is_live(other) {
                    auth_conflicts.push(other);
                }
                self.detach(other);
            }
        }

        let session = TabSession {
            tab_id: request.tab_id.clone(),
            connection_id: conn,
            chat_type: request.chat_type,
            auth_id: request.auth_id.clone(),
            remote_addr: request.remote_addr,
            identified_at: Utc::now(),
        };

        self.tabs.insert(request.tab_id.clone(), conn);
        self.ip_tabs
            .entry(request.remote_addr)
            .or_default()
            .insert(request.tab_id.clone());
        if let Some(auth_id) = request.auth_id {
            self.auth_tabs
                .entry(auth_id)
                .or_default()
                .insert(request.tab_id);
        }
        self.sessions.insert(conn, session.clone());

        IdentifyOutcome {
            session,
            duplicate_of,
            auth_conflicts,
            unchanged: false,
        }
    }

    /// Remove every mapping owned by `connection_id`
    pub fn remove_connection(&mut self, connection_id: Uuid) -> Option<TabSession> {
        self.detach(connection_id)
    }

    /// Drop mappings whose connection is no longer live
    pub fn sweep(&mut self, is_live: impl Fn(Uuid) -> bool) -> usize {
        let dead: Vec<Uuid> = self
            .sessions
            .keys()
            .copied()
            .filter(|conn| !is_live(*conn))
            .collect();

        for conn in &dead {
            self.detach(*conn);
        }
        dead.len()
    }

    pub fn session(&self, connection_id: Uuid) -> Option<&TabSession> {
        self.sessions.get(&connection_id)
    }

    pub fn connection_for_tab(&self, tab_id: &str) -> Option<Uuid> {
        self.tabs.get(tab_id).copied()
    }

    /// Connections identified with `auth_id` in `chat_type`
    pub fn connections_for_auth(&self, auth_id: &str, chat_type: ChatType) -> Vec<Uuid> {
        self.auth_tabs
            .get(auth_id)
            .into_iter()
            .flatten()
            .filter_map(|tab| self.tabs.get(tab))
            .filter(|conn| {
                self.sessions
                    .get(conn)
                    .is_some_and(|s| s.chat_type == chat_type)
            })
            .copied()
            .collect()
    }

    pub fn tabs_for_ip(&self, ip: IpAddr) -> usize {
        self.ip_tabs.get(&ip).map(|tabs| tabs.len()).unwrap_or(0)
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &TabSession> {
        self.sessions.values()
    }

    fn detach(&mut self, connection_id: Uuid) -> Option<TabSession> {
        let session = self.sessions.remove(&connection_id)?;

        if self.tabs.get(&session.tab_id) == Some(&connection_id) {
            self.tabs.remove(&session.tab_id);
        }
        remove_from_index(&mut self.ip_tabs, &session.remote_addr, &session.tab_id);
        if let Some(auth_id) = &session.auth_id {
            remove_from_index(&mut self.auth_tabs, auth_id, &session.tab_id);
        }

        Some(session)
    }
}

fn remove_from_index<K>(index: &mut HashMap<K, HashSet<String>>, key: &K, tab_id: &str)
where
    K: std::hash::Hash + Eq,
{
    if let Some(tabs) = index.get_mut(key) {
        tabs.remove(tab_id);
        if tabs.is_empty() {
            index.remove(key);
        }
    }
}
