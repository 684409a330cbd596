use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::StreamExt;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::auth::AuthService;
use crate::db::Store;
use crate::delivery::DeliveryEngine;
use crate::error::WireError;
use crate::middleware::TokenBucket;
use crate::mls::MlsService;

use super::hub::{outbound_channel, Hub, SessionHandle};
use super::proto::{self, Envelope, MessageType};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const SILENCE_TIMEOUT: Duration = Duration::from_secs(90);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Authenticating = 0,
    Ready = 1,
    Disconnected = 2,
}

/// Per-connection shared state. The phase transition from Authenticating to
/// Ready is a single compare-and-swap so the auth timeout and a late-
/// arriving success reply cannot both win.
pub struct ConnectionState {
    phase: AtomicU8,
}

impl ConnectionState {
    fn new() -> Self {
        Self { phase: AtomicU8::new(Phase::Authenticating as u8) }
    }

    fn try_become_ready(&self) -> bool {
        self.phase
            .compare_exchange(
                Phase::Authenticating as u8,
                Phase::Ready as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn try_disconnect(&self) -> bool {
        self.phase.swap(Phase::Disconnected as u8, Ordering::SeqCst) != Phase::Disconnected as u8
    }

    fn is_ready(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == Phase::Ready as u8
    }
}

pub struct GatewayContext {
    pub store: Store,
    pub auth: Arc<AuthService>,
    pub mls: Arc<MlsService>,
    pub delivery: Arc<DeliveryEngine>,
    pub hub: Hub,
    pub max_message_size: usize,
    pub max_connections_per_user: usize,
    pub rate_limit_capacity: u32,
    pub rate_limit_per_second: f64,
}

fn wire_error_for(err: &crate::delivery::DeliveryError) -> WireError {
    use crate::delivery::DeliveryError::*;
    match err {
        NotMember => WireError::NotGroupMember,
        MessageTooLarge => WireError::MessageTooLarge,
        GroupNotFound => WireError::GroupNotFound,
        NotGroupAdmin => WireError::NotGroupAdmin,
        AlreadyMember => WireError::AlreadyMember,
        CannotRemoveSelf => WireError::CannotRemoveSelf,
        GroupFull => WireError::GroupFull,
        Store(_) => WireError::DatabaseError,
    }
}

/// Close-code mapping the gateway originates (§4.5): session problems close
/// 4004, a disabled account closes 4005, a rejected credential or failed
/// ceremony closes 4002, everything else falls back to the generic protocol
/// error 4007.
fn close_code_for(err: WireError) -> u16 {
    match err {
        WireError::ExpiredSession | WireError::SessionRevoked => 4004,
        WireError::AccountDisabled => 4005,
        WireError::InvalidCredential | WireError::ChallengeFailed => 4002,
        _ => 4007,
    }
}

fn close_reason_text(code: u16) -> &'static str {
    match code {
        1003 => "unsupported data",
        1009 => "message too big",
        4001 => "auth timeout",
        4002 => "auth failed",
        4003 => "too many connections",
        4004 => "session expired",
        4005 => "account disabled",
        4006 => "server shutdown",
        4007 => "protocol error",
        _ => "",
    }
}

pub async fn handle_socket(socket: WebSocket, ctx: Arc<GatewayContext>) {
    let conn_id = Ulid::new().to_string();
    let state = Arc::new(ConnectionState::new());
    let (outbound_tx, mut outbound_rx) = outbound_channel(OUTBOUND_QUEUE_CAPACITY);

    ctx.hub.register(SessionHandle {
        conn_id: conn_id.clone(),
        user_id: None,
        outbound: outbound_tx.clone(),
        connected_seq: 0,
    });

    let (mut sender, mut receiver) = socket.split();
    let cancel = CancellationToken::new();
    let mut bucket = TokenBucket::new(ctx.rate_limit_capacity, ctx.rate_limit_per_second);
    let mut authenticated_user: Option<String> = None;
    let close_code = Arc::new(AtomicU16::new(1000));

    let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
    tokio::pin!(auth_deadline);
    let silence_deadline = tokio::time::sleep(SILENCE_TIMEOUT);
    tokio::pin!(silence_deadline);
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);

    let writer_cancel = cancel.clone();
    let writer_close_code = close_code.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                maybe_envelope = outbound_rx.recv() => {
                    match maybe_envelope {
                        Some(envelope) => {
                            let bytes = proto::encode(&envelope);
                            if sender.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let code = writer_close_code.load(Ordering::SeqCst);
        let frame = CloseFrame { code, reason: close_reason_text(code).into() };
        let _ = sender.send(Message::Close(Some(frame))).await;
        let _ = sender.close().await;
    });

    'pump: loop {
        tokio::select! {
            _ = &mut auth_deadline, if !state.is_ready() => {
                // E5: the transport closes with 4001 and no envelope is sent.
                close_code.store(4001, Ordering::SeqCst);
                break 'pump;
            }
            _ = &mut silence_deadline => {
                break 'pump;
            }
            _ = heartbeat.tick() => {
                let _ = outbound_tx.try_send(proto::server_envelope(
                    MessageType::Ping,
                    proto::Ping { timestamp_us: crate::models::now_micros() },
                ));
            }
            frame = receiver.next() => {
                silence_deadline.as_mut().reset(tokio::time::Instant::now() + SILENCE_TIMEOUT);
                match frame {
                    Some(Ok(Message::Binary(bytes))) => {
                        if bytes.len() > ctx.max_message_size {
                            let _ = outbound_tx.try_send(proto::server_envelope(
                                MessageType::Error,
                                proto::Error { code: WireError::MessageTooLarge.code(), message: "frame exceeds limit".to_string(), fatal: true, retry_after_ms: None },
                            ));
                            close_code.store(1009, Ordering::SeqCst);
                            break 'pump;
                        }
                        if !bucket.try_consume() {
                            let _ = outbound_tx.try_send(proto::server_envelope(
                                MessageType::Error,
                                proto::Error { code: WireError::RateLimited.code(), message: "rate limited".to_string(), fatal: false, retry_after_ms: Some(bucket.retry_after_ms()) },
                            ));
                            continue;
                        }

                        let envelope = match proto::decode(&bytes) {
                            Ok(e) => e,
                            Err(_) => {
                                let _ = outbound_tx.try_send(proto::server_envelope(
                                    MessageType::Error,
                                    proto::Error { code: WireError::InvalidEnvelope.code(), message: "malformed envelope".to_string(), fatal: true, retry_after_ms: None },
                                ));
                                close_code.store(4007, Ordering::SeqCst);
                                break 'pump;
                            }
                        };

                        if let Err(code) = dispatch(
                            &ctx,
                            &conn_id,
                            &state,
                            &mut authenticated_user,
                            &outbound_tx,
                            envelope,
                        ).await {
                            close_code.store(code, Ordering::SeqCst);
                            break 'pump;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break 'pump,
                    Some(Ok(_)) => {
                        let _ = outbound_tx.try_send(proto::server_envelope(
                            MessageType::Error,
                            proto::Error { code: WireError::InvalidEnvelope.code(), message: "binary frames only".to_string(), fatal: true, retry_after_ms: None },
                        ));
                        close_code.store(1003, Ordering::SeqCst);
                        break 'pump;
                    }
                    Some(Err(_)) => break 'pump,
                }
            }
        }
    }

    state.try_disconnect();
    cancel.cancel();
    let _ = writer.await;
    ctx.hub.unregister(&conn_id);
}

/// Returns `Err(close_code)` when the connection must close with that code
/// after this message.
async fn dispatch(
    ctx: &Arc<GatewayContext>,
    conn_id: &str,
    state: &ConnectionState,
    authenticated_user: &mut Option<String>,
    outbound_tx: &mpsc::Sender<Envelope>,
    envelope: Envelope,
) -> Result<(), u16> {
    let message_type = MessageType::try_from(envelope.r#type).unwrap_or(MessageType::MessageTypeUnspecified);

    if !state.is_ready() {
        return dispatch_authenticating(ctx, conn_id, state, authenticated_user, outbound_tx, message_type, &envelope).await;
    }

    dispatch_ready(ctx, authenticated_user.as_deref(), outbound_tx, message_type, &envelope).await
}

async fn dispatch_authenticating(
    ctx: &Arc<GatewayContext>,
    conn_id: &str,
    state: &ConnectionState,
    authenticated_user: &mut Option<String>,
    outbound_tx: &mpsc::Sender<Envelope>,
    message_type: MessageType,
    envelope: &Envelope,
) -> Result<(), u16> {
    match message_type {
        MessageType::Ping => {
            let _ = outbound_tx.try_send(proto::server_envelope(MessageType::Pong, proto::Pong { timestamp_us: crate::models::now_micros() }));
            Ok(())
        }
        MessageType::AuthRequest => {
            let request: proto::AuthRequest = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_fatal(outbound_tx, WireError::MalformedMessage),
            };

            // Session-token fast path: try parsing the principal as a
            // token before falling back to a WebAuthn ceremony (Open
            // Question decision, SPEC_FULL.md §9).
            if let Ok((user, session)) = ctx.auth.validate_session(&request.principal).await {
                if !state.try_become_ready() {
                    return Ok(());
                }
                *authenticated_user = Some(user.id.clone());
                ctx.hub.set_authenticated(conn_id, &user.id, ctx.max_connections_per_user);
                let _ = outbound_tx.try_send(proto::server_envelope(
                    MessageType::AuthSuccess,
                    proto::AuthSuccess {
                        session_token: String::new(),
                        user_id: user.id.clone(),
                        username: user.username,
                        display_name: user.display_name,
                    },
                ));
                drain_pending(ctx, outbound_tx, &user.id).await;
                let _ = session; // touched inside validate_session
                return Ok(());
            }

            match ctx.auth.begin_login(&request.principal).await {
                Ok(challenge) => {
                    let options = serde_json::to_vec(&challenge.options).unwrap_or_default();
                    let _ = outbound_tx.try_send(proto::envelope(
                        MessageType::AuthChallenge,
                        &envelope.request_id,
                        proto::AuthChallenge { options, challenge_id: challenge.challenge_id },
                    ));
                    Ok(())
                }
                Err(err) => send_fatal(outbound_tx, WireError::from(&err)),
            }
        }
        MessageType::AuthResponse => {
            let request: proto::AuthResponse = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_fatal(outbound_tx, WireError::MalformedMessage),
            };
            let credential: webauthn_rs::prelude::PublicKeyCredential =
                match serde_json::from_slice(&reconstruct_assertion(&request)) {
                    Ok(c) => c,
                    Err(_) => return send_fatal(outbound_tx, WireError::MalformedMessage),
                };

            match ctx.auth.finish_login(&request.challenge_id, &credential).await {
                Ok(issued) => {
                    if !state.try_become_ready() {
                        return Ok(());
                    }
                    *authenticated_user = Some(issued.user.id.clone());
                    ctx.hub.set_authenticated(conn_id, &issued.user.id, ctx.max_connections_per_user);
                    let _ = outbound_tx.try_send(proto::server_envelope(
                        MessageType::AuthSuccess,
                        proto::AuthSuccess {
                            session_token: issued.token,
                            user_id: issued.user.id.clone(),
                            username: issued.user.username,
                            display_name: issued.user.display_name,
                        },
                    ));
                    drain_pending(ctx, outbound_tx, &issued.user.id).await;
                    Ok(())
                }
                Err(err) => send_fatal(outbound_tx, WireError::from(&err)),
            }
        }
        MessageType::AuthRegisterRequest => {
            let request: proto::AuthRegisterRequest = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_fatal(outbound_tx, WireError::MalformedMessage),
            };
            match ctx.auth.begin_registration(&request.username, &request.display_name).await {
                Ok(challenge) => {
                    let options = serde_json::to_vec(&challenge.options).unwrap_or_default();
                    let _ = outbound_tx.try_send(proto::envelope(
                        MessageType::AuthRegisterChallenge,
                        &envelope.request_id,
                        proto::AuthChallenge { options, challenge_id: challenge.challenge_id },
                    ));
                    Ok(())
                }
                Err(err) => send_fatal(outbound_tx, WireError::from(&err)),
            }
        }
        MessageType::AuthRegisterResponse => {
            let request: proto::AuthRegisterResponse = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_fatal(outbound_tx, WireError::MalformedMessage),
            };
            let credential: webauthn_rs::prelude::RegisterPublicKeyCredential =
                match serde_json::from_slice(&reconstruct_attestation(&request)) {
                    Ok(c) => c,
                    Err(_) => return send_fatal(outbound_tx, WireError::MalformedMessage),
                };

            match ctx.auth.finish_registration(&request.challenge_id, &credential).await {
                Ok(issued) => {
                    if !state.try_become_ready() {
                        return Ok(());
                    }
                    *authenticated_user = Some(issued.user.id.clone());
                    ctx.hub.set_authenticated(conn_id, &issued.user.id, ctx.max_connections_per_user);
                    let _ = outbound_tx.try_send(proto::server_envelope(
                        MessageType::AuthRegisterSuccess,
                        proto::AuthSuccess {
                            session_token: issued.token,
                            user_id: issued.user.id.clone(),
                            username: issued.user.username,
                            display_name: issued.user.display_name,
                        },
                    ));
                    Ok(())
                }
                Err(err) => send_fatal(outbound_tx, WireError::from(&err)),
            }
        }
        _ => send_fatal(outbound_tx, WireError::MalformedMessage),
    }
}

async fn dispatch_ready(
    ctx: &Arc<GatewayContext>,
    user_id: Option<&str>,
    outbound_tx: &mpsc::Sender<Envelope>,
    message_type: MessageType,
    envelope: &Envelope,
) -> Result<(), u16> {
    let Some(user_id) = user_id else {
        return send_fatal(outbound_tx, WireError::InvalidCredential);
    };

    match message_type {
        MessageType::Ping => {
            let _ = outbound_tx.try_send(proto::server_envelope(MessageType::Pong, proto::Pong { timestamp_us: crate::models::now_micros() }));
            Ok(())
        }
        MessageType::MessageSend => {
            let request: proto::MessageSend = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            match ctx
                .delivery
                .send(user_id, &request.conversation_id, &request.encrypted_payload, &request.message_type, 0)
                .await
            {
                Ok(message) => {
                    let members = ctx.delivery.members_of(&message.conversation_id).await.unwrap_or_default();
                    let receive = proto::server_envelope(
                        MessageType::MessageReceive,
                        proto::MessageReceive {
                            conversation_id: message.conversation_id.clone(),
                            message_id: message.id.clone(),
                            sender_id: message.sender_id.clone(),
                            server_timestamp_us: message.server_timestamp,
                            encrypted_payload: message.payload.clone(),
                            message_type: message.message_type.clone(),
                        },
                    );
                    ctx.hub.broadcast_to_group(members, receive, Some(user_id.to_string()));
                    Ok(())
                }
                Err(err) => send_nonfatal(outbound_tx, wire_error_for(&err), &envelope.request_id),
            }
        }
        MessageType::MessageAck => {
            let request: proto::MessageAck = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            if ctx.delivery.ack(user_id, &request.message_id).await.is_ok() {
                if let Ok(Some(message)) = ctx.store.get_message(&request.message_id).await {
                    let delivered = proto::server_envelope(
                        MessageType::MessageDelivered,
                        proto::MessageDelivered { message_id: message.id },
                    );
                    ctx.hub.send_to_user(&message.sender_id, delivered).await;
                }
            }
            Ok(())
        }
        MessageType::GroupCreate => {
            let request: proto::GroupCreate = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            match ctx.delivery.create_conversation(user_id, &request.title, &request.member_ids).await {
                Ok(conversation) => {
                    let mut member_ids = request.member_ids.clone();
                    member_ids.push(user_id.to_string());
                    let created = proto::server_envelope(
                        MessageType::GroupCreated,
                        proto::GroupCreated {
                            conversation_id: conversation.id.clone(),
                            title: conversation.title.clone(),
                            member_ids: member_ids.clone(),
                        },
                    );
                    ctx.hub.broadcast_to_group(member_ids, created.clone(), None);
                    let _ = outbound_tx.try_send(proto::envelope(MessageType::GroupCreated, &envelope.request_id, proto::GroupCreated {
                        conversation_id: conversation.id,
                        title: conversation.title,
                        member_ids: request.member_ids,
                    }));
                    Ok(())
                }
                Err(err) => send_nonfatal(outbound_tx, wire_error_for(&err), &envelope.request_id),
            }
        }
        MessageType::GroupMemberAdded => {
            let request: proto::GroupMemberAdded = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            match ctx.delivery.add_member(user_id, &request.conversation_id, &request.user_id).await {
                Ok(()) => {
                    let members = ctx.delivery.members_of(&request.conversation_id).await.unwrap_or_default();
                    let notice = proto::server_envelope(
                        MessageType::GroupMemberAdded,
                        proto::GroupMemberAdded { conversation_id: request.conversation_id, user_id: request.user_id },
                    );
                    ctx.hub.broadcast_to_group(members, notice, None);
                    Ok(())
                }
                Err(err) => send_nonfatal(outbound_tx, wire_error_for(&err), &envelope.request_id),
            }
        }
        MessageType::GroupMemberRemoved => {
            let request: proto::GroupMemberRemoved = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            let members_before = ctx.delivery.members_of(&request.conversation_id).await.unwrap_or_default();
            match ctx.delivery.remove_member(user_id, &request.conversation_id, &request.user_id).await {
                Ok(()) => {
                    let notice = proto::server_envelope(
                        MessageType::GroupMemberRemoved,
                        proto::GroupMemberRemoved { conversation_id: request.conversation_id, user_id: request.user_id },
                    );
                    ctx.hub.broadcast_to_group(members_before, notice, None);
                    Ok(())
                }
                Err(err) => send_nonfatal(outbound_tx, wire_error_for(&err), &envelope.request_id),
            }
        }
        MessageType::MlsKeyPackageUpload => {
            let request: proto::MlsKeyPackageUpload = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            match ctx.mls.upload_key_package(user_id, &request.blob).await {
                Ok(_) => Ok(()),
                Err(_) => send_nonfatal(outbound_tx, WireError::InvalidKeyPackage, &envelope.request_id),
            }
        }
        MessageType::MlsKeyPackageFetch => {
            let request: proto::MlsKeyPackageFetch = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            match ctx.mls.fetch_key_package(&request.user_id).await {
                Ok(blob) => {
                    let _ = outbound_tx.try_send(proto::envelope(
                        MessageType::MlsKeyPackageResponse,
                        &envelope.request_id,
                        proto::MlsKeyPackageResponse { blob },
                    ));
                    Ok(())
                }
                Err(_) => send_nonfatal(outbound_tx, WireError::NoKeyPackageAvailable, &envelope.request_id),
            }
        }
        MessageType::MlsWelcome => {
            let request: proto::MlsWelcome = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            if ctx.mls.validate_welcome(&request.blob, ctx.max_message_size).is_err() {
                return send_nonfatal(outbound_tx, WireError::InvalidKeyPackage, &envelope.request_id);
            }
            let receive = proto::server_envelope(
                MessageType::MlsWelcomeReceive,
                proto::MlsWelcomeReceive { conversation_id: request.conversation_id, blob: request.blob },
            );
            ctx.hub.send_to_user(&request.recipient_id, receive).await;
            Ok(())
        }
        MessageType::MlsCommit => {
            let request: proto::MlsCommit = match prost::Message::decode(envelope.payload.as_slice()) {
                Ok(r) => r,
                Err(_) => return send_nonfatal(outbound_tx, WireError::MalformedMessage, &envelope.request_id),
            };
            match ctx
                .mls
                .apply_commit(&request.conversation_id, request.expected_epoch, &request.blob, ctx.max_message_size)
                .await
            {
                Ok(crate::mls::CommitResult::Accepted { .. }) => {
                    let members = ctx.delivery.members_of(&request.conversation_id).await.unwrap_or_default();
                    let broadcast = proto::server_envelope(
                        MessageType::MlsCommitBroadcast,
                        proto::MlsCommitBroadcast { conversation_id: request.conversation_id, blob: request.blob },
                    );
                    ctx.hub.broadcast_to_group(members, broadcast, Some(user_id.to_string()));
                    Ok(())
                }
                Ok(crate::mls::CommitResult::EpochMismatch { .. }) => {
                    send_nonfatal(outbound_tx, WireError::EpochMismatch, &envelope.request_id)
                }
                Err(_) => send_nonfatal(outbound_tx, WireError::DatabaseError, &envelope.request_id),
            }
        }
        _ => send_nonfatal(outbound_tx, WireError::UnknownMessageType, &envelope.request_id),
    }
}

async fn drain_pending(ctx: &Arc<GatewayContext>, outbound_tx: &mpsc::Sender<Envelope>, user_id: &str) {
    if let Ok(pending) = ctx.delivery.drain_pending(user_id).await {
        for message in pending {
            let _ = outbound_tx.try_send(proto::server_envelope(
                MessageType::MessageReceive,
                proto::MessageReceive {
                    conversation_id: message.conversation_id,
                    message_id: message.id,
                    sender_id: message.sender_id,
                    server_timestamp_us: message.server_timestamp,
                    encrypted_payload: message.payload,
                    message_type: message.message_type,
                },
            ));
        }
    }
}

fn send_fatal(outbound_tx: &mpsc::Sender<Envelope>, err: WireError) -> Result<(), u16> {
    let _ = outbound_tx.try_send(proto::server_envelope(
        MessageType::Error,
        proto::Error { code: err.code(), message: err.to_string(), fatal: true, retry_after_ms: None },
    ));
    Err(close_code_for(err))
}

fn send_nonfatal(outbound_tx: &mpsc::Sender<Envelope>, err: WireError, request_id: &str) -> Result<(), u16> {
    let _ = outbound_tx.try_send(proto::envelope(
        MessageType::Error,
        request_id,
        proto::Error { code: err.code(), message: err.to_string(), fatal: false, retry_after_ms: None },
    ));
    Ok(())
}

fn b64(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// The wire schema keeps the WebAuthn assertion's JSON fields split across
/// discrete `bytes` fields for forward-compatible framing; reassemble them
/// into the single JSON document `webauthn-rs` expects to deserialize.
fn reconstruct_assertion(request: &proto::AuthResponse) -> Vec<u8> {
    serde_json::json!({
        "id": b64(&request.credential_id),
        "rawId": b64(&request.credential_id),
        "type": "public-key",
        "response": {
            "authenticatorData": b64(&request.authenticator_data),
            "clientDataJSON": b64(&request.client_data_json),
            "signature": b64(&request.signature),
        }
    })
    .to_string()
    .into_bytes()
}

/// Same reassembly for the registration ceremony's attestation response.
fn reconstruct_attestation(request: &proto::AuthRegisterResponse) -> Vec<u8> {
    serde_json::json!({
        "id": b64(&request.credential_id),
        "rawId": b64(&request.credential_id),
        "type": "public-key",
        "response": {
            "attestationObject": b64(&request.attestation_object),
            "clientDataJSON": b64(&request.client_data_json),
        }
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_are_one_way() {
        let state = ConnectionState::new();
        assert!(state.try_become_ready());
        assert!(!state.try_become_ready());
        assert!(state.try_disconnect());
        assert!(!state.try_become_ready());
    }

    #[test]
    fn close_code_maps_session_errors_to_4004() {
        assert_eq!(close_code_for(WireError::SessionRevoked), 4004);
        assert_eq!(close_code_for(WireError::AccountDisabled), 4005);
    }

    #[test]
    fn close_code_maps_auth_failure_to_4002_and_falls_back_to_4007() {
        assert_eq!(close_code_for(WireError::InvalidCredential), 4002);
        assert_eq!(close_code_for(WireError::ChallengeFailed), 4002);
        assert_eq!(close_code_for(WireError::MalformedMessage), 4007);
    }
}
