//! Session lifecycle manager and health monitor
//!
//! Owns the single active transport client, drives login and code
//! verification, and runs one background health monitor per authenticated
//! session. The monitor is the sole owner of the transition into
//! `SessionLost` and of detaching the monitoring subscription on failure.

use crate::config::{Settings, RECONNECT_TICK_SECS};
use crate::dedup::DedupStore;
use crate::factory::{self, ClientFactory};
use crate::filter::{FilterRuleSource, OrderFilter};
use crate::pipeline::MessagePipeline;
use crate::session_store::{SessionRole, SessionStore};
use crate::transport::{
    EventStream, InboundMessage, SubscriptionId, Transport, TransportError, TransportErrorKind,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors surfaced to the control surface
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The transport rejected the login initiation (bad phone, send-code
    /// refused)
    #[error("login failed: {0}")]
    Login(TransportError),
    /// Sign-in or second-factor verification failed, or no login was started
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The operation requires a running session
    #[error("no active session")]
    NotRunning,
    /// A transport operation failed outside the login path
    #[error("transport error: {0}")]
    Transport(TransportError),
}

/// Lifecycle state of the managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No client, or the previous one was discarded
    Disconnected,
    /// Login initiated, waiting for the operator to supply the code
    AwaitingCode,
    /// Signed in; health monitor running, event subscription detached
    Authenticated,
    /// Signed in with the inbound event subscription attached
    Monitoring,
    /// Authorization was lost and could not be recovered; requires a fresh
    /// login or session to leave
    SessionLost,
}

/// Outcome of resuming from a persisted session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The persisted session is live; monitoring started
    Started,
    /// No persisted session exists; nothing attempted
    NoSession,
    /// A session existed but is no longer authorized
    Invalid,
}

/// Point-in-time status snapshot for the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Authenticated and the transport reports connected
    pub running: bool,
    /// The inbound event subscription is attached
    pub monitoring: bool,
    /// Authorization was lost and requires operator action
    pub session_lost: bool,
}

/// External collaborators the manager is constructed from
pub struct ManagerDeps {
    /// Creates transport clients from optional session tokens
    pub factory: Arc<dyn ClientFactory>,
    /// Persists session tokens across restarts
    pub sessions: Arc<dyn SessionStore>,
    /// Records processed message identifiers
    pub dedup: Arc<dyn DedupStore>,
    /// Supplies excluded keywords for the filter predicate
    pub rules: Arc<dyn FilterRuleSource>,
}

struct PendingLogin {
    phone: String,
    code_hash: String,
}

/// Handle to the attached inbound subscription. Holds the client it was
/// registered on so revocation always goes to the right instance.
struct MonitorSubscription {
    id: SubscriptionId,
    client: Arc<dyn Transport>,
    dispatch: JoinHandle<()>,
}

struct HealthMonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct StatusFlags {
    authenticated: AtomicBool,
    monitoring: AtomicBool,
    session_lost: AtomicBool,
    connected: AtomicBool,
    auth_failures: AtomicU32,
}

struct Inner {
    state: ConnectionState,
    client: Option<Arc<dyn Transport>>,
    pending: Option<PendingLogin>,
    subscription: Option<MonitorSubscription>,
    monitor: Option<HealthMonitorHandle>,
}

/// Owns one active transport client and its lifecycle.
///
/// Control operations (`start_login`, `verify_code`, `toggle_monitoring`)
/// are expected to be invoked serially by a single control surface; status
/// reads are lock-free and safe from anywhere.
pub struct SessionManager {
    factory: Arc<dyn ClientFactory>,
    sessions: Arc<dyn SessionStore>,
    dedup: Arc<dyn DedupStore>,
    rules: Arc<dyn FilterRuleSource>,
    settings: Arc<Settings>,
    inner: Mutex<Inner>,
    flags: StatusFlags,
}

impl SessionManager {
    /// Create a manager in the `Disconnected` state
    #[must_use]
    pub fn new(deps: ManagerDeps, settings: Arc<Settings>) -> Self {
        Self {
            factory: deps.factory,
            sessions: deps.sessions,
            dedup: deps.dedup,
            rules: deps.rules,
            settings,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                client: None,
                pending: None,
                subscription: None,
                monitor: None,
            }),
            flags: StatusFlags::default(),
        }
    }

    // ----- status reads (non-blocking, side-effect-free) -----

    /// Authenticated and the transport reports connected.
    ///
    /// The connected flag is refreshed by the health monitor tick, trading a
    /// small staleness window for a lock-free read.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.flags.authenticated.load(Ordering::SeqCst) && self.flags.connected.load(Ordering::SeqCst)
    }

    /// Whether the inbound event subscription is attached
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.flags.monitoring.load(Ordering::SeqCst)
    }

    /// Whether authorization was lost and requires operator action
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        self.flags.session_lost.load(Ordering::SeqCst)
    }

    /// Consecutive authorization probe failures observed by the current
    /// health check cycle
    #[must_use]
    pub fn auth_failures(&self) -> u32 {
        self.flags.auth_failures.load(Ordering::SeqCst)
    }

    /// Snapshot of the status booleans for the control surface
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.is_running(),
            monitoring: self.is_monitoring(),
            session_lost: self.is_session_lost(),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    // ----- control operations -----

    /// Initiate a login: discard any existing session, connect a fresh
    /// client, and request a login code for `phone`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Login`] when the transport rejects the phone
    /// number or the code request.
    pub async fn start_login(&self, phone: &str) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        self.teardown_session(&mut inner).await;

        let client = self
            .factory
            .create(None)
            .await
            .map_err(ManagerError::Login)?;
        let code_hash = match client.send_login_code(phone).await {
            Ok(code_hash) => code_hash,
            Err(e) => {
                client.disconnect().await;
                return Err(ManagerError::Login(e));
            }
        };

        inner.client = Some(client);
        inner.pending = Some(PendingLogin {
            phone: phone.to_string(),
            code_hash,
        });
        inner.state = ConnectionState::AwaitingCode;
        info!(phone, "login code requested");
        Ok(())
    }

    /// Complete the login with the code the operator received.
    ///
    /// On success the session token is persisted, the health monitor is
    /// spawned, and monitoring is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Auth`] when no login is in progress, the code
    /// is rejected, or the required second factor fails.
    pub async fn verify_code(self: &Arc<Self>, code: &str) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock().await;
        let client = inner
            .client
            .clone()
            .filter(|_| inner.pending.is_some())
            .ok_or_else(|| ManagerError::Auth("no login in progress".to_string()))?;
        let (phone, code_hash) = match &inner.pending {
            Some(pending) => (pending.phone.clone(), pending.code_hash.clone()),
            None => return Err(ManagerError::Auth("no login in progress".to_string())),
        };

        self.sign_in(&client, &phone, code, &code_hash).await?;
        inner.pending = None;

        match client.export_session().await {
            Ok(token) => {
                if !self.sessions.save(SessionRole::User, &token).await {
                    warn!("session token could not be persisted");
                }
            }
            Err(e) => warn!("session export failed: {}", e),
        }

        self.enter_authenticated(&mut inner, client).await;
        Ok(())
    }

    /// Resume from a persisted session token, if one exists.
    ///
    /// A missing token and a dead token are both reported through the
    /// [`StartOutcome`], never as an error: callers must not treat either as
    /// fatal to the process.
    pub async fn start_existing_session(self: &Arc<Self>) -> StartOutcome {
        let Some(token) = self.sessions.load(SessionRole::User).await else {
            info!("no persisted session found");
            return StartOutcome::NoSession;
        };

        let mut inner = self.inner.lock().await;
        self.teardown_session(&mut inner).await;

        let client = match self.factory.create(Some(&token)).await {
            Ok(client) => client,
            Err(e) => {
                warn!("could not connect with persisted session: {}", e);
                self.mark_session_lost(&mut inner);
                return StartOutcome::Invalid;
            }
        };

        if factory::check_authorization(client.as_ref()).await {
            self.enter_authenticated(&mut inner, client).await;
            StartOutcome::Started
        } else {
            let fault = factory::diagnose_failure(client.as_ref()).await;
            warn!(%fault, "persisted session is no longer authorized");
            client.disconnect().await;
            self.mark_session_lost(&mut inner);
            StartOutcome::Invalid
        }
    }

    /// Flip monitoring on or off; returns the new state.
    ///
    /// Attaching registers exactly one subscription on the source chat and
    /// routes its events into the message pipeline; detaching revokes that
    /// specific subscription by handle.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotRunning`] when no session is running, and
    /// [`ManagerError::Transport`] when the subscription itself fails.
    pub async fn toggle_monitoring(&self) -> Result<bool, ManagerError> {
        if !self.is_running() {
            return Err(ManagerError::NotRunning);
        }

        let mut inner = self.inner.lock().await;
        if inner.subscription.is_some() {
            self.detach_subscription(&mut inner).await;
            inner.state = ConnectionState::Authenticated;
            Ok(false)
        } else {
            self.attach_subscription(&mut inner).await?;
            inner.state = ConnectionState::Monitoring;
            Ok(true)
        }
    }

    // ----- internals -----

    async fn sign_in(
        &self,
        client: &Arc<dyn Transport>,
        phone: &str,
        code: &str,
        code_hash: &str,
    ) -> Result<(), ManagerError> {
        match client.sign_in(phone, code, code_hash).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == TransportErrorKind::PasswordRequired => {
                let Some(password) = self.settings.second_factor_password.as_deref() else {
                    return Err(ManagerError::Auth(
                        "second factor required but not configured".to_string(),
                    ));
                };
                info!("account requires second factor, retrying sign-in");
                client
                    .sign_in_with_password(password)
                    .await
                    .map_err(|e| ManagerError::Auth(e.to_string()))
            }
            Err(e) => Err(ManagerError::Auth(e.to_string())),
        }
    }

    /// Transition into `Authenticated`, spawn the health monitor, then
    /// enable monitoring. Requires the old monitor to be retired already.
    async fn enter_authenticated(self: &Arc<Self>, inner: &mut Inner, client: Arc<dyn Transport>) {
        self.flags.auth_failures.store(0, Ordering::SeqCst);
        self.flags.session_lost.store(false, Ordering::SeqCst);
        self.flags.authenticated.store(true, Ordering::SeqCst);
        self.flags
            .connected
            .store(client.is_connected(), Ordering::SeqCst);
        inner.client = Some(client);
        inner.state = ConnectionState::Authenticated;

        self.spawn_health_monitor(inner);

        match self.attach_subscription(inner).await {
            Ok(()) => inner.state = ConnectionState::Monitoring,
            Err(e) => warn!("monitoring could not be enabled: {}", e),
        }
        info!("session authenticated");
    }

    /// Retire the monitor, the subscription, and the client. Flags are reset
    /// so a fresh lifecycle attempt starts clean.
    async fn teardown_session(&self, inner: &mut Inner) {
        if let Some(monitor) = inner.monitor.take() {
            monitor.cancel.cancel();
            monitor.task.abort();
            debug!("health monitor retired");
        }
        self.detach_subscription(inner).await;
        if let Some(client) = inner.client.take() {
            client.disconnect().await;
        }
        inner.pending = None;
        inner.state = ConnectionState::Disconnected;
        self.flags.authenticated.store(false, Ordering::SeqCst);
        self.flags.monitoring.store(false, Ordering::SeqCst);
        self.flags.session_lost.store(false, Ordering::SeqCst);
        self.flags.connected.store(false, Ordering::SeqCst);
    }

    fn mark_session_lost(&self, inner: &mut Inner) {
        inner.state = ConnectionState::SessionLost;
        self.flags.session_lost.store(true, Ordering::SeqCst);
        self.flags.authenticated.store(false, Ordering::SeqCst);
        self.flags.connected.store(false, Ordering::SeqCst);
    }

    fn build_pipeline(&self, client: Arc<dyn Transport>) -> MessagePipeline {
        let filter = OrderFilter::new(self.rules.clone(), self.settings.order_amount_threshold);
        MessagePipeline::new(
            client,
            self.dedup.clone(),
            filter,
            self.settings.target_recipient.clone(),
        )
    }

    async fn attach_subscription(&self, inner: &mut Inner) -> Result<(), ManagerError> {
        let client = inner.client.clone().ok_or(ManagerError::NotRunning)?;
        let stream: EventStream = client
            .subscribe(self.settings.source_chat_id)
            .await
            .map_err(ManagerError::Transport)?;

        let pipeline = Arc::new(self.build_pipeline(client.clone()));
        let dispatch = tokio::spawn(dispatch_events(stream.receiver, pipeline));

        inner.subscription = Some(MonitorSubscription {
            id: stream.id,
            client,
            dispatch,
        });
        self.flags.monitoring.store(true, Ordering::SeqCst);
        info!(
            chat_id = self.settings.source_chat_id,
            "monitoring subscription attached"
        );
        Ok(())
    }

    async fn detach_subscription(&self, inner: &mut Inner) {
        if let Some(subscription) = inner.subscription.take() {
            subscription.dispatch.abort();
            if let Err(e) = subscription.client.unsubscribe(subscription.id).await {
                warn!("unsubscribe failed: {}", e);
            }
            info!("monitoring subscription detached");
        }
        self.flags.monitoring.store(false, Ordering::SeqCst);
    }

    fn spawn_health_monitor(self: &Arc<Self>, inner: &mut Inner) {
        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            manager.health_monitor_loop(token).await;
        });
        inner.monitor = Some(HealthMonitorHandle { cancel, task });
    }

    async fn current_client(&self) -> Option<Arc<dyn Transport>> {
        self.inner.lock().await.client.clone()
    }

    // ----- health monitor -----

    /// One instance per authenticated session. Exits when cancelled or when
    /// the session is declared lost.
    async fn health_monitor_loop(self: Arc<Self>, token: CancellationToken) {
        let tick = Duration::from_secs(RECONNECT_TICK_SECS);
        let check_interval = Duration::from_secs(self.settings.connection_check_interval_secs);
        let mut last_check = Instant::now();

        info!("health monitor started");
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!("health monitor cancelled");
                    return;
                }
                () = tokio::time::sleep(tick) => {}
            }

            let Some(client) = self.current_client().await else {
                continue;
            };

            if !client.is_connected() {
                self.flags.connected.store(false, Ordering::SeqCst);
                match client.reconnect().await {
                    Ok(()) => info!("transport reconnected"),
                    // Not escalated: retried on the next tick
                    Err(e) => warn!("reconnect attempt failed: {}", e),
                }
            }

            if last_check.elapsed() >= check_interval {
                last_check = Instant::now();
                if let Err(e) = self.run_detailed_check().await {
                    error!("authorization could not be restored: {}", e);
                    self.declare_session_lost().await;
                    return;
                }
            }

            if let Some(client) = self.current_client().await {
                self.flags
                    .connected
                    .store(client.is_connected(), Ordering::SeqCst);
            }
        }
    }

    /// Authorization check with retry and session recovery.
    ///
    /// A successful live probe resets the failure counter and short-circuits.
    /// Recoverable failures trigger a recovery attempt while budget remains;
    /// a non-recoverable failure aborts immediately.
    async fn run_detailed_check(&self) -> Result<(), TransportError> {
        let max_attempts = self.settings.max_auth_failures.max(1);
        let retry_delay = Duration::from_secs(self.settings.auth_retry_delay_secs);
        let mut last_error = TransportError::new(TransportErrorKind::Rpc, "no probe attempted");

        for attempt in 1..=max_attempts {
            let Some(client) = self.current_client().await else {
                return Err(TransportError::new(
                    TransportErrorKind::Network,
                    "no active client",
                ));
            };

            let probe_error = match client.get_identity().await {
                Ok(Some(me)) => {
                    self.flags.auth_failures.store(0, Ordering::SeqCst);
                    self.log_liveness(&client, &me.display_name).await;
                    return Ok(());
                }
                Ok(None) => TransportError::new(
                    TransportErrorKind::SessionExpired,
                    "authorization probe returned no identity",
                ),
                Err(e) => e,
            };

            let failures = self.flags.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                attempt,
                failures, "authorization probe failed: {}", probe_error
            );

            if !probe_error.is_recoverable() {
                return Err(probe_error);
            }
            last_error = probe_error;

            if attempt < max_attempts {
                if self.try_session_recovery().await {
                    self.flags.auth_failures.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                tokio::time::sleep(retry_delay).await;
            }
        }

        Err(last_error)
    }

    /// Reload the persisted token, build a replacement client, and swap it in
    /// when it probes authorized. Re-attaches the monitoring subscription to
    /// the replacement when monitoring was enabled.
    async fn try_session_recovery(&self) -> bool {
        info!("attempting session recovery from persisted token");

        let Some(token) = self.sessions.load(SessionRole::User).await else {
            warn!("no persisted session to recover from");
            return false;
        };
        let client = match self.factory.create(Some(&token)).await {
            Ok(client) => client,
            Err(e) => {
                warn!("recovery client could not connect: {}", e);
                return false;
            }
        };
        if !factory::check_authorization(client.as_ref()).await {
            warn!("recovered session is still unauthorized");
            client.disconnect().await;
            return false;
        }

        let mut inner = self.inner.lock().await;
        let was_monitoring = inner.subscription.is_some();
        self.detach_subscription(&mut inner).await;

        if let Some(old) = inner.client.replace(client.clone()) {
            old.disconnect().await;
        }
        self.flags
            .connected
            .store(client.is_connected(), Ordering::SeqCst);

        if was_monitoring {
            match self.attach_subscription(&mut inner).await {
                Ok(()) => inner.state = ConnectionState::Monitoring,
                Err(e) => warn!("monitoring could not be re-attached after recovery: {}", e),
            }
        }

        info!("session recovery succeeded");
        true
    }

    /// Terminal failure path of the health monitor
    async fn declare_session_lost(&self) {
        let mut inner = self.inner.lock().await;
        self.detach_subscription(&mut inner).await;
        self.mark_session_lost(&mut inner);
        inner.pending = None;
        // The monitor task is exiting on its own; only the handle is dropped
        inner.monitor = None;

        if let Some(client) = inner.client.clone() {
            let fault = factory::diagnose_failure(client.as_ref()).await;
            error!(%fault, "session lost; operator re-login required");
        } else {
            error!("session lost; operator re-login required");
        }
    }

    /// Best-effort liveness evidence after a successful probe
    async fn log_liveness(&self, client: &Arc<dyn Transport>, display_name: &str) {
        if let Err(e) = self.report_liveness(client, display_name).await {
            debug!("liveness reporting incomplete: {}", e);
        }
    }

    async fn report_liveness(
        &self,
        client: &Arc<dyn Transport>,
        display_name: &str,
    ) -> anyhow::Result<()> {
        info!(user = display_name, "authorization confirmed");
        let title = client.chat_title(self.settings.source_chat_id).await?;
        match title {
            Some(title) => info!(chat = %title, "source chat reachable"),
            None => anyhow::bail!("source chat not visible to this account"),
        }
        Ok(())
    }
}

/// Route inbound events into the pipeline, one independent task per event so
/// a slow or failing message never blocks the others.
async fn dispatch_events(
    mut receiver: mpsc::Receiver<InboundMessage>,
    pipeline: Arc<MessagePipeline>,
) {
    while let Some(message) = receiver.recv().await {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            match pipeline.process(&message).await {
                Ok(outcome) => debug!(message_id = message.id, ?outcome, "event processed"),
                Err(e) => error!(message_id = message.id, "event processing failed: {}", e),
            }
        });
    }
}
