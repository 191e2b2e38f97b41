//! In-memory fakes of the external collaborators, shared by the
//! integration tests.

use async_trait::async_trait;
use order_relay::factory::ClientFactory;
use order_relay::session_store::{SessionRole, SessionStore};
use order_relay::transport::{
    EventStream, Identity, InboundMessage, SubscriptionId, Transport, TransportError,
    TransportErrorKind,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const LOGIN_CODE: &str = "12345";
pub const SECOND_FACTOR: &str = "hunter2";

#[derive(Default)]
struct TransportInner {
    connected: AtomicBool,
    authorized: AtomicBool,
    password_required: AtomicBool,
    fail_forward: AtomicBool,
    fail_click: AtomicBool,
    token: Mutex<String>,
    valid_tokens: Arc<Mutex<HashSet<String>>>,
    probe_plan: Mutex<VecDeque<TransportErrorKind>>,
    forwarded: Mutex<Vec<i64>>,
    clicked: Mutex<Vec<(i64, String)>>,
    unsubscribed: Mutex<Vec<SubscriptionId>>,
    senders: Mutex<Vec<(SubscriptionId, mpsc::Sender<InboundMessage>)>>,
    next_sub_id: AtomicU64,
}

/// Scriptable transport double. Clones share state, so tests keep one clone
/// for inspection while the manager owns another.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<TransportInner>,
}

impl FakeTransport {
    fn with_valid_tokens(valid_tokens: Arc<Mutex<HashSet<String>>>, token: String) -> Self {
        let inner = TransportInner {
            valid_tokens,
            ..TransportInner::default()
        };
        inner.connected.store(true, Ordering::SeqCst);
        *inner.token.lock().expect("token lock") = token;
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.inner.authorized.store(authorized, Ordering::SeqCst);
    }

    pub fn require_password(&self) {
        self.inner.password_required.store(true, Ordering::SeqCst);
    }

    pub fn set_fail_forward(&self, fail: bool) {
        self.inner.fail_forward.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_click(&self, fail: bool) {
        self.inner.fail_click.store(fail, Ordering::SeqCst);
    }

    /// Queue probe failures returned by `get_identity` before normal behavior
    /// resumes.
    pub fn plan_probe_failures(&self, kinds: &[TransportErrorKind]) {
        let mut plan = self.inner.probe_plan.lock().expect("probe plan lock");
        plan.extend(kinds.iter().copied());
    }

    pub fn forwarded_ids(&self) -> Vec<i64> {
        self.inner.forwarded.lock().expect("forwarded lock").clone()
    }

    pub fn clicked(&self) -> Vec<(i64, String)> {
        self.inner.clicked.lock().expect("clicked lock").clone()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionId> {
        self.inner
            .unsubscribed
            .lock()
            .expect("unsubscribed lock")
            .clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.senders.lock().expect("senders lock").len()
    }

    /// Deliver an inbound message through the most recent subscription.
    pub async fn push_message(&self, message: InboundMessage) {
        let sender = {
            let senders = self.inner.senders.lock().expect("senders lock");
            senders
                .last()
                .map(|(_, sender)| sender.clone())
                .expect("no active subscription to push into")
        };
        sender.send(message).await.expect("event channel closed");
    }

    fn register_authorized(&self) {
        self.inner.authorized.store(true, Ordering::SeqCst);
        let token = self.inner.token.lock().expect("token lock").clone();
        self.inner
            .valid_tokens
            .lock()
            .expect("valid tokens lock")
            .insert(token);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    async fn send_login_code(&self, phone: &str) -> Result<String, TransportError> {
        if phone.starts_with('+') {
            Ok("code-hash".to_string())
        } else {
            Err(TransportError::new(
                TransportErrorKind::InvalidPhone,
                "phone rejected",
            ))
        }
    }

    async fn sign_in(
        &self,
        _phone: &str,
        code: &str,
        _code_hash: &str,
    ) -> Result<(), TransportError> {
        if self.inner.password_required.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::PasswordRequired,
                "cloud password enabled",
            ));
        }
        if code == LOGIN_CODE {
            self.register_authorized();
            Ok(())
        } else {
            Err(TransportError::new(
                TransportErrorKind::InvalidCode,
                "wrong code",
            ))
        }
    }

    async fn sign_in_with_password(&self, password: &str) -> Result<(), TransportError> {
        if password == SECOND_FACTOR {
            self.register_authorized();
            Ok(())
        } else {
            Err(TransportError::new(
                TransportErrorKind::Rpc,
                "wrong password",
            ))
        }
    }

    async fn export_session(&self) -> Result<String, TransportError> {
        Ok(self.inner.token.lock().expect("token lock").clone())
    }

    async fn get_identity(&self) -> Result<Option<Identity>, TransportError> {
        let planned = self
            .inner
            .probe_plan
            .lock()
            .expect("probe plan lock")
            .pop_front();
        if let Some(kind) = planned {
            return Err(TransportError::new(kind, "planned probe failure"));
        }
        if self.inner.authorized.load(Ordering::SeqCst) {
            Ok(Some(Identity {
                display_name: "Оператор".to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn chat_title(&self, _chat_id: i64) -> Result<Option<String>, TransportError> {
        Ok(Some("Заказы".to_string()))
    }

    async fn subscribe(&self, _chat_id: i64) -> Result<EventStream, TransportError> {
        let id = SubscriptionId(self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::channel(64);
        self.inner
            .senders
            .lock()
            .expect("senders lock")
            .push((id, sender));
        Ok(EventStream { id, receiver })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let mut senders = self.inner.senders.lock().expect("senders lock");
        senders.retain(|(sub_id, _)| *sub_id != id);
        drop(senders);
        self.inner
            .unsubscribed
            .lock()
            .expect("unsubscribed lock")
            .push(id);
        Ok(())
    }

    async fn forward_message(
        &self,
        _target: &str,
        message: &InboundMessage,
    ) -> Result<(), TransportError> {
        if self.inner.fail_forward.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::Rpc,
                "forward rejected",
            ));
        }
        self.inner
            .forwarded
            .lock()
            .expect("forwarded lock")
            .push(message.id);
        Ok(())
    }

    async fn click_button(
        &self,
        message: &InboundMessage,
        label: &str,
    ) -> Result<(), TransportError> {
        if self.inner.fail_click.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::Rpc,
                "click rejected",
            ));
        }
        self.inner
            .clicked
            .lock()
            .expect("clicked lock")
            .push((message.id, label.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct FactoryInner {
    valid_tokens: Arc<Mutex<HashSet<String>>>,
    created: Mutex<Vec<FakeTransport>>,
    counter: AtomicU64,
    fail_create: AtomicBool,
}

/// Factory double producing [`FakeTransport`] clients. Tokens exported by a
/// successful sign-in validate future `create` calls, mirroring the real
/// persisted-session flow.
#[derive(Clone, Default)]
pub struct FakeFactory {
    inner: Arc<FactoryInner>,
}

impl FakeFactory {
    pub fn set_fail_create(&self, fail: bool) {
        self.inner.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Pre-authorize a token so `create(Some(token))` yields an authorized
    /// client.
    pub fn accept_token(&self, token: &str) {
        self.inner
            .valid_tokens
            .lock()
            .expect("valid tokens lock")
            .insert(token.to_string());
    }

    /// Revoke every known token; newly created clients probe unauthorized.
    pub fn revoke_all_tokens(&self) {
        self.inner
            .valid_tokens
            .lock()
            .expect("valid tokens lock")
            .clear();
    }

    /// The client most recently handed to the manager.
    pub fn latest_client(&self) -> FakeTransport {
        self.inner
            .created
            .lock()
            .expect("created lock")
            .last()
            .cloned()
            .expect("no client created yet")
    }

    pub fn created_count(&self) -> usize {
        self.inner.created.lock().expect("created lock").len()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create<'a>(
        &self,
        session: Option<&'a str>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if self.inner.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::Network,
                "connect refused",
            ));
        }

        let token = match session {
            Some(token) => token.to_string(),
            None => format!("tok-{}", self.inner.counter.fetch_add(1, Ordering::SeqCst)),
        };
        let transport =
            FakeTransport::with_valid_tokens(self.inner.valid_tokens.clone(), token.clone());
        if session.is_some() {
            let authorized = self
                .inner
                .valid_tokens
                .lock()
                .expect("valid tokens lock")
                .contains(&token);
            transport.set_authorized(authorized);
        }

        self.inner
            .created
            .lock()
            .expect("created lock")
            .push(transport.clone());
        Ok(Arc::new(transport))
    }
}

/// In-memory credential store.
#[derive(Default)]
pub struct FakeSessionStore {
    tokens: Mutex<HashMap<&'static str, String>>,
}

impl FakeSessionStore {
    pub fn token(&self, role: SessionRole) -> Option<String> {
        self.tokens
            .lock()
            .expect("tokens lock")
            .get(role.file_name())
            .cloned()
    }

    pub fn put(&self, role: SessionRole, token: &str) {
        self.tokens
            .lock()
            .expect("tokens lock")
            .insert(role.file_name(), token.to_string());
    }
}

#[async_trait]
impl SessionStore for FakeSessionStore {
    async fn load(&self, role: SessionRole) -> Option<String> {
        self.token(role)
    }

    async fn save(&self, role: SessionRole, token: &str) -> bool {
        self.put(role, token);
        true
    }
}

/// An inbound order message without buttons.
pub fn order_message(id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        id,
        chat_id: -100_500,
        text: text.to_string(),
        buttons: Vec::new(),
    }
}
