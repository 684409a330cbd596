use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::proto::Envelope;

pub type OutboundSender = mpsc::Sender<Envelope>;

#[derive(Clone)]
pub struct SessionHandle {
    pub conn_id: String,
    pub user_id: Option<String>,
    pub outbound: OutboundSender,
    pub connected_seq: u64,
}

enum HubCommand {
    Register { session: SessionHandle },
    Unregister { conn_id: String },
    SetAuthenticated { conn_id: String, user_id: String, max_per_user: usize },
    SendToUser { user_id: String, envelope: Envelope, reply: oneshot::Sender<bool> },
    BroadcastToGroup { member_ids: Vec<String>, envelope: Envelope, exclude_user_id: Option<String> },
}

/// Process-wide registry of active sessions, indexed by connection id and
/// by authenticated user id. Structural mutations (register/unregister/
/// authenticate) are serialized through a single run-loop task: a single
/// mutex suffices at this scale and makes deadlock between the two indexes
/// impossible by construction, at the cost of a channel round-trip per
/// lookup.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
}

struct HubState {
    by_conn: HashMap<String, SessionHandle>,
    by_user: HashMap<String, String>, // user_id -> conn_id
    next_seq: u64,
}

impl Hub {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<HubCommand>();
        let mut state = HubState { by_conn: HashMap::new(), by_user: HashMap::new(), next_seq: 0 };

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    HubCommand::Register { mut session } => {
                        state.next_seq += 1;
                        session.connected_seq = state.next_seq;
                        state.by_conn.insert(session.conn_id.clone(), session);
                    }
                    HubCommand::Unregister { conn_id } => {
                        if let Some(session) = state.by_conn.remove(&conn_id) {
                            if let Some(user_id) = session.user_id {
                                if state.by_user.get(&user_id) == Some(&conn_id) {
                                    state.by_user.remove(&user_id);
                                }
                            }
                        }
                    }
                    HubCommand::SetAuthenticated { conn_id, user_id, max_per_user } => {
                        let mut existing_for_user: Vec<(String, u64)> = state
                            .by_conn
                            .values()
                            .filter(|s| s.user_id.as_deref() == Some(user_id.as_str()))
                            .map(|s| (s.conn_id.clone(), s.connected_seq))
                            .collect();
                        existing_for_user.sort_by_key(|(_, seq)| *seq);

                        if existing_for_user.len() >= max_per_user {
                            if let Some((oldest, _)) = existing_for_user.first() {
                                if let Some(victim) = state.by_conn.get(oldest) {
                                    let _ = victim.outbound.try_send(super::proto::server_envelope(
                                        super::proto::MessageType::Error,
                                        super::proto::Error {
                                            code: 4003,
                                            message: "too many connections".to_string(),
                                            fatal: true,
                                            retry_after_ms: None,
                                        },
                                    ));
                                }
                                state.by_conn.remove(oldest);
                            }
                        }

                        if let Some(session) = state.by_conn.get_mut(&conn_id) {
                            session.user_id = Some(user_id.clone());
                        }
                        state.by_user.insert(user_id, conn_id);
                    }
                    HubCommand::SendToUser { user_id, envelope, reply } => {
                        let sent = state
                            .by_user
                            .get(&user_id)
                            .and_then(|conn_id| state.by_conn.get(conn_id))
                            .map(|session| session.outbound.try_send(envelope).is_ok())
                            .unwrap_or(false);
                        let _ = reply.send(sent);
                    }
                    HubCommand::BroadcastToGroup { member_ids, envelope, exclude_user_id } => {
                        for member_id in member_ids {
                            if Some(&member_id) == exclude_user_id.as_ref() {
                                continue;
                            }
                            if let Some(conn_id) = state.by_user.get(&member_id) {
                                if let Some(session) = state.by_conn.get(conn_id) {
                                    let _ = session.outbound.try_send(envelope.clone());
                                }
                            }
                        }
                    }
                }
            }
        });

        Self { commands: tx }
    }

    pub fn register(&self, session: SessionHandle) {
        let _ = self.commands.send(HubCommand::Register { session });
    }

    pub fn unregister(&self, conn_id: &str) {
        let _ = self.commands.send(HubCommand::Unregister { conn_id: conn_id.to_string() });
    }

    pub fn set_authenticated(&self, conn_id: &str, user_id: &str, max_per_user: usize) {
        let _ = self.commands.send(HubCommand::SetAuthenticated {
            conn_id: conn_id.to_string(),
            user_id: user_id.to_string(),
            max_per_user,
        });
    }

    /// Non-blocking enqueue to the target user's current session; `false`
    /// if the user is offline or its outbound queue is full.
    pub async fn send_to_user(&self, user_id: &str, envelope: Envelope) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::SendToUser { user_id: user_id.to_string(), envelope, reply: reply_tx })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Non-blocking fan-out; recipients whose queue is full are logged by
    /// the caller and silently skipped -- the durable receipt is the
    /// recovery path, not a blocking retry.
    pub fn broadcast_to_group(&self, member_ids: Vec<String>, envelope: Envelope, exclude_user_id: Option<String>) {
        let _ = self.commands.send(HubCommand::BroadcastToGroup { member_ids, envelope, exclude_user_id });
    }
}

pub fn outbound_channel(capacity: usize) -> (OutboundSender, mpsc::Receiver<Envelope>) {
    mpsc::channel(capacity)
}

pub type SharedHub = Arc<Hub>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::proto::{MessageType, Ping};

    #[tokio::test]
    async fn send_to_user_false_when_offline() {
        let hub = Hub::spawn();
        let sent = hub.send_to_user("nobody", super::super::proto::server_envelope(MessageType::Ping, Ping { timestamp_us: 1 })).await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn register_then_send_to_user_succeeds() {
        let hub = Hub::spawn();
        let (tx, mut rx) = outbound_channel(8);
        hub.register(SessionHandle { conn_id: "c1".to_string(), user_id: None, outbound: tx, connected_seq: 0 });
        hub.set_authenticated("c1", "alice", 5);

        let sent = hub
            .send_to_user("alice", super::super::proto::server_envelope(MessageType::Ping, Ping { timestamp_us: 1 }))
            .await;
        assert!(sent);
        let received = rx.recv().await;
        assert!(received.is_some());
    }
}
