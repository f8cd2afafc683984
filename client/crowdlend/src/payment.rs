//! Payment initiation and verification.
//!
//! Investments and repayments settle through the gateway's hosted checkout.
//! A workflow runs
//!
//! ```text
//! Idle ──► Initiating ──► AwaitingExternalCompletion ──► Verifying ──► Verified
//!              │                    ▲                        │    └──► VerificationFailed
//!              └──► Idle (error)    └───── (polling) ────────┘
//! ```
//!
//! [`PaymentCoordinator::initiate`] validates the amount, asks the backend
//! for a checkout, opens the checkout URL and spawns one verification task.
//! That task sleeps the policy's initial delay, then checks the backend; the
//! default policy checks exactly once. The caller gets a [`PaymentHandle`]
//! to observe, await or cancel the pending verification.
//!
//! At most one workflow per (campaign, kind) runs at a time; the
//! [`InFlightRegistry`] enforces this and remembers which campaign each
//! gateway reference was issued for.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, Body};
use crate::errors::{ClientError, Result};
use crate::models::{CampaignId, InitializeRequest};

pub const INVEST_VERIFY_DELAY: Duration = Duration::from_secs(30);
pub const REPAY_VERIFY_DELAY: Duration = Duration::from_secs(20);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────
// Kinds, states, policy
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// A lender funding a campaign.
    Investment,
    /// A founder paying back a funded campaign.
    Repayment,
}

impl PaymentKind {
    pub fn initialize_path(&self) -> &'static str {
        match self {
            Self::Investment => "/payments/initialize/",
            Self::Repayment => "/campaigns/repayment/initialize/",
        }
    }

    /// Verify endpoint as raw path segments. The reference is escaped by
    /// the client; the trailing empty segment keeps the trailing slash.
    pub fn verify_segments<'a>(&self, reference: &'a str) -> Vec<&'a str> {
        match self {
            Self::Investment => vec!["payments", "verify", reference, ""],
            Self::Repayment => vec!["campaigns", "repayment", "verify", reference, ""],
        }
    }

    pub fn default_delay(&self) -> Duration {
        match self {
            Self::Investment => INVEST_VERIFY_DELAY,
            Self::Repayment => REPAY_VERIFY_DELAY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Investment => "investment",
            Self::Repayment => "repayment",
        }
    }
}

impl fmt::Display for PaymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Initiating,
    AwaitingExternalCompletion,
    Verifying,
    Verified,
    VerificationFailed,
    /// The handle owner cancelled before verification finished.
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Verified | Self::VerificationFailed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    /// Carries the backend's own error message when it sent one.
    Failed(Option<String>),
    Cancelled,
}

/// When and how often to ask the backend whether a payment settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyPolicy {
    /// Wait between opening the checkout and the first check.
    pub initial_delay: Duration,
    /// Total checks, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Gap before the second check; doubles after each further miss.
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl VerifyPolicy {
    /// One check after `initial_delay`.
    pub fn single(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_attempts: 1,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
        }
    }

    pub fn for_kind(kind: PaymentKind) -> Self {
        Self::single(kind.default_delay())
    }

    /// Bounded polling: up to `max_attempts` checks with exponential gaps.
    pub fn with_polling(
        mut self,
        max_attempts: u32,
        retry_interval: Duration,
        max_retry_interval: Duration,
    ) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_interval = retry_interval;
        self.max_retry_interval = max_retry_interval.max(retry_interval);
        self
    }

    /// Wait before check number `attempt + 1`, for `attempt >= 1`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_interval
            .saturating_mul(factor)
            .min(self.max_retry_interval)
    }
}

// ─────────────────────────────────────────────────────────
// Intent and input validation
// ─────────────────────────────────────────────────────────

/// One checkout issued by the gateway. Lives for a single workflow.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub kind: PaymentKind,
    pub campaign_id: CampaignId,
    pub amount: Decimal,
    pub authorization_url: String,
    pub reference: String,
}

/// Parse a user-entered amount. Missing, non-numeric and non-positive
/// values are validation errors.
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ClientError::Validation("Please enter an amount.".into()));
    }
    let amount = Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| ClientError::Validation(format!("`{trimmed}` is not a valid amount.")))?;
    ensure_positive(amount)
}

/// Accept an already-numeric amount: finite and strictly positive.
pub fn amount_from_f64(value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(ClientError::Validation(
            "Please enter a valid amount.".into(),
        ));
    }
    let amount = Decimal::from_f64(value)
        .ok_or_else(|| ClientError::Validation("Please enter a valid amount.".into()))?;
    ensure_positive(amount)
}

fn ensure_positive(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(ClientError::Validation(
            "Amount must be greater than zero.".into(),
        ));
    }
    Ok(amount.normalize())
}

/// JavaScript truthiness, which is what the backend contract was written
/// against.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn extract_intent(
    kind: PaymentKind,
    campaign_id: CampaignId,
    amount: Decimal,
    body: &Value,
) -> Result<PaymentIntent> {
    let field = |name: &str| {
        body.get("data")
            .and_then(|data| data.get(name))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| {
                ClientError::MalformedResponse(format!(
                    "{kind} initialize response is missing data.{name}"
                ))
            })
    };

    Ok(PaymentIntent {
        kind,
        campaign_id,
        amount,
        authorization_url: field("authorization_url")?,
        reference: field("reference")?,
    })
}

// ─────────────────────────────────────────────────────────
// Seams
// ─────────────────────────────────────────────────────────

/// The two backend calls a workflow needs.
#[async_trait]
pub trait PaymentBackend: Send + Sync {
    async fn initialize(&self, kind: PaymentKind, request: &InitializeRequest) -> Result<Value>;

    async fn verify(
        &self,
        kind: PaymentKind,
        reference: &str,
        campaign_id: CampaignId,
    ) -> Result<Value>;
}

#[async_trait]
impl PaymentBackend for ApiClient {
    async fn initialize(&self, kind: PaymentKind, request: &InitializeRequest) -> Result<Value> {
        self.post(kind.initialize_path(), Body::json(request)?).await
    }

    async fn verify(
        &self,
        kind: PaymentKind,
        reference: &str,
        campaign_id: CampaignId,
    ) -> Result<Value> {
        self.get_segments(
            &kind.verify_segments(reference),
            &[("campaign_id", campaign_id.to_string())],
        )
        .await
    }
}

/// Hands the checkout URL to whatever shows it to the payer.
pub trait CheckoutOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens the checkout in the desktop's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl CheckoutOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        #[cfg(target_os = "macos")]
        let mut command = {
            let mut c = tokio::process::Command::new("open");
            c.arg(url);
            c
        };
        #[cfg(target_os = "windows")]
        let mut command = {
            let mut c = tokio::process::Command::new("cmd");
            c.args(["/C", "start", "", url]);
            c
        };
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let mut command = {
            let mut c = tokio::process::Command::new("xdg-open");
            c.arg(url);
            c
        };

        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map(|_| ())
    }
}

/// Leaves opening the checkout to the person; only logs the URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualCheckout;

impl CheckoutOpener for ManualCheckout {
    fn open(&self, url: &str) -> std::io::Result<()> {
        info!("Open {url} to complete the payment");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// In-flight registry
// ─────────────────────────────────────────────────────────

type SlotKey = (CampaignId, PaymentKind);

struct Slot {
    generation: u64,
    state: watch::Receiver<WorkflowState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    next_generation: u64,
    slots: HashMap<SlotKey, Slot>,
    /// Gateway reference → (campaign it was issued for, owning slot generation).
    /// Entries leave with the slot that claimed them.
    references: HashMap<String, (CampaignId, u64)>,
}

/// Shared record of running workflows, keyed by (campaign, kind).
///
/// Share one registry between the investment and repayment coordinators of
/// a session so both see the same references.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panic while holding the lock leaves the maps consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(
        &self,
        key: SlotKey,
        state: watch::Receiver<WorkflowState>,
        cancel: CancellationToken,
    ) -> Result<SlotGuard> {
        let mut inner = self.lock();
        if inner.slots.contains_key(&key) {
            return Err(ClientError::PaymentInFlight {
                campaign_id: key.0,
                kind: key.1,
            });
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.slots.insert(
            key,
            Slot {
                generation,
                state,
                cancel,
            },
        );
        Ok(SlotGuard {
            registry: self.clone(),
            key,
            generation,
            reference: None,
        })
    }

    /// Record that `reference` belongs to `campaign_id`. A reference held by
    /// a running workflow for a different campaign is refused.
    fn claim_reference(
        &self,
        reference: &str,
        campaign_id: CampaignId,
        generation: u64,
    ) -> Result<()> {
        let mut inner = self.lock();
        match inner.references.get(reference) {
            Some((owner, _)) if *owner != campaign_id => {
                Err(ClientError::MalformedResponse(format!(
                    "reference {reference} was already issued for campaign {owner}"
                )))
            }
            _ => {
                inner
                    .references
                    .insert(reference.to_string(), (campaign_id, generation));
                Ok(())
            }
        }
    }

    pub fn state_of(&self, campaign_id: CampaignId, kind: PaymentKind) -> WorkflowState {
        self.lock()
            .slots
            .get(&(campaign_id, kind))
            .map(|slot| *slot.state.borrow())
            .unwrap_or(WorkflowState::Idle)
    }

    /// Cancel the running workflow for (campaign, kind), if any.
    pub fn cancel(&self, campaign_id: CampaignId, kind: PaymentKind) -> bool {
        match self.lock().slots.get(&(campaign_id, kind)) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().slots.len()
    }
}

/// Frees its registry slot, and the reference it claimed, when dropped.
struct SlotGuard {
    registry: InFlightRegistry,
    key: SlotKey,
    generation: u64,
    reference: Option<String>,
}

impl SlotGuard {
    fn bind_reference(&mut self, reference: &str) -> Result<()> {
        self.registry
            .claim_reference(reference, self.key.0, self.generation)?;
        self.reference = Some(reference.to_string());
        Ok(())
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut inner = self.registry.lock();
        if let Some(reference) = self.reference.take() {
            if inner
                .references
                .get(&reference)
                .is_some_and(|(_, generation)| *generation == self.generation)
            {
                inner.references.remove(&reference);
            }
        }
        if inner
            .slots
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            inner.slots.remove(&self.key);
        }
    }
}

// ─────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────

type RefreshCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct PaymentCoordinator {
    kind: PaymentKind,
    backend: Arc<dyn PaymentBackend>,
    opener: Arc<dyn CheckoutOpener>,
    policy: VerifyPolicy,
    registry: InFlightRegistry,
}

impl PaymentCoordinator {
    pub fn new(
        kind: PaymentKind,
        backend: Arc<dyn PaymentBackend>,
        opener: Arc<dyn CheckoutOpener>,
    ) -> Self {
        Self {
            kind,
            backend,
            opener,
            policy: VerifyPolicy::for_kind(kind),
            registry: InFlightRegistry::new(),
        }
    }

    pub fn investment(backend: Arc<dyn PaymentBackend>, opener: Arc<dyn CheckoutOpener>) -> Self {
        Self::new(PaymentKind::Investment, backend, opener)
    }

    pub fn repayment(backend: Arc<dyn PaymentBackend>, opener: Arc<dyn CheckoutOpener>) -> Self {
        Self::new(PaymentKind::Repayment, backend, opener)
    }

    pub fn with_policy(mut self, policy: VerifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_registry(mut self, registry: InFlightRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn policy(&self) -> &VerifyPolicy {
        &self.policy
    }

    pub fn state_of(&self, campaign_id: CampaignId) -> WorkflowState {
        self.registry.state_of(campaign_id, self.kind)
    }

    pub fn cancel(&self, campaign_id: CampaignId) -> bool {
        self.registry.cancel(campaign_id, self.kind)
    }

    /// Start a payment from a user-entered amount.
    ///
    /// `on_verified` runs at most once, only after a successful check and
    /// only if the handle was not cancelled first.
    pub async fn initiate<F>(
        &self,
        campaign_id: CampaignId,
        raw_amount: &str,
        on_verified: F,
    ) -> Result<PaymentHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let amount = parse_amount(raw_amount)?;
        self.initiate_amount(campaign_id, amount, on_verified).await
    }

    pub async fn initiate_amount<F>(
        &self,
        campaign_id: CampaignId,
        amount: Decimal,
        on_verified: F,
    ) -> Result<PaymentHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let amount = ensure_positive(amount)?;
        let kind = self.kind;

        let (state_tx, state_rx) = watch::channel(WorkflowState::Initiating);
        let cancel = CancellationToken::new();
        // Dropped on every early return below, which puts the slot back to Idle.
        let mut guard = self
            .registry
            .claim((campaign_id, kind), state_rx.clone(), cancel.clone())?;

        debug!("Initializing {kind} of {amount} for campaign {campaign_id}");
        let body = self
            .backend
            .initialize(
                kind,
                &InitializeRequest {
                    campaign_id,
                    amount,
                },
            )
            .await?;

        let intent = extract_intent(kind, campaign_id, amount, &body)?;
        guard.bind_reference(&intent.reference)?;

        if let Err(e) = self.opener.open(&intent.authorization_url) {
            warn!(
                "Could not open checkout {} automatically: {e}",
                intent.authorization_url
            );
        }

        state_tx.send_replace(WorkflowState::AwaitingExternalCompletion);
        info!(
            "{kind} initiated for campaign {campaign_id} (reference {}); verifying in {:?}",
            intent.reference, self.policy.initial_delay
        );

        let task = tokio::spawn(run_verification(VerificationTask {
            backend: Arc::clone(&self.backend),
            kind,
            policy: self.policy.clone(),
            reference: intent.reference.clone(),
            campaign_id,
            state: state_tx,
            cancel: cancel.clone(),
            on_verified: Box::new(on_verified),
            _slot: guard,
        }));

        Ok(PaymentHandle {
            intent,
            cancel,
            state: state_rx,
            task,
        })
    }
}

struct VerificationTask {
    backend: Arc<dyn PaymentBackend>,
    kind: PaymentKind,
    policy: VerifyPolicy,
    reference: String,
    campaign_id: CampaignId,
    state: watch::Sender<WorkflowState>,
    cancel: CancellationToken,
    on_verified: RefreshCallback,
    _slot: SlotGuard,
}

enum Check {
    Verified,
    /// Not settled yet, or the check itself failed; polling may try again.
    Pending(Miss),
    /// Retrying cannot help.
    Rejected(Miss),
}

/// A check that did not verify.
struct Miss {
    reason: String,
    server_message: Option<String>,
}

impl Miss {
    fn unexpected(body: &Value) -> Self {
        Self {
            reason: format!("unexpected verify response: {body}"),
            server_message: None,
        }
    }
}

impl From<ClientError> for Miss {
    fn from(e: ClientError) -> Self {
        Self {
            server_message: e.server_message().map(String::from),
            reason: e.to_string(),
        }
    }
}

async fn run_verification(task: VerificationTask) -> VerificationOutcome {
    let VerificationTask {
        backend,
        kind,
        policy,
        reference,
        campaign_id,
        state,
        cancel,
        on_verified,
        _slot,
    } = task;

    let cancelled = |state: &watch::Sender<WorkflowState>| {
        info!("{kind} verification for {reference} cancelled");
        state.send_replace(WorkflowState::Cancelled);
        VerificationOutcome::Cancelled
    };

    let mut wait = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => return cancelled(&state),
            _ = tokio::time::sleep(wait) => {}
        }

        state.send_replace(WorkflowState::Verifying);
        let check = tokio::select! {
            _ = cancel.cancelled() => return cancelled(&state),
            check = check_once(backend.as_ref(), kind, &reference, campaign_id) => check,
        };

        let miss = match check {
            Check::Verified => {
                // The owner may have cancelled while the response was being read.
                if cancel.is_cancelled() {
                    return cancelled(&state);
                }
                state.send_replace(WorkflowState::Verified);
                info!("{kind} {reference} verified for campaign {campaign_id}");
                on_verified();
                return VerificationOutcome::Verified;
            }
            Check::Rejected(miss) => {
                attempt = policy.max_attempts;
                miss
            }
            Check::Pending(miss) => miss,
        };

        if attempt >= policy.max_attempts {
            error!(
                "{kind} {reference} verification failed after {attempt} check(s): {}",
                miss.reason
            );
            state.send_replace(WorkflowState::VerificationFailed);
            return VerificationOutcome::Failed(miss.server_message);
        }

        wait = policy.retry_delay(attempt);
        warn!(
            "{kind} {reference} not verified yet (will retry in {wait:?}): {}",
            miss.reason
        );
        state.send_replace(WorkflowState::AwaitingExternalCompletion);
    }
}

async fn check_once(
    backend: &dyn PaymentBackend,
    kind: PaymentKind,
    reference: &str,
    campaign_id: CampaignId,
) -> Check {
    match backend.verify(kind, reference, campaign_id).await {
        Ok(body) if body.get("message").is_some_and(is_truthy) => Check::Verified,
        Ok(body) => Check::Pending(Miss::unexpected(&body)),
        Err(e) if e.is_unauthorized() => Check::Rejected(e.into()),
        Err(e) => Check::Pending(e.into()),
    }
}

// ─────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────

/// A started payment. Dropping the handle detaches the verification task;
/// call [`PaymentHandle::cancel`] when the result is no longer wanted.
pub struct PaymentHandle {
    intent: PaymentIntent,
    cancel: CancellationToken,
    state: watch::Receiver<WorkflowState>,
    task: JoinHandle<VerificationOutcome>,
}

impl PaymentHandle {
    pub fn intent(&self) -> &PaymentIntent {
        &self.intent
    }

    pub fn reference(&self) -> &str {
        &self.intent.reference
    }

    pub fn authorization_url(&self) -> &str {
        &self.intent.authorization_url
    }

    pub fn state(&self) -> WorkflowState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkflowState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the verification task to finish.
    pub async fn wait(self) -> VerificationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} verification task ended abnormally: {e}", self.intent.kind);
                VerificationOutcome::Failed(None)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
