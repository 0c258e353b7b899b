//! Per-request context and its ambient propagation.
//!
//! A [`RequestContext`] is reachable from anywhere in the request's call
//! tree through [`current`]. Two storage slots back this:
//!
//! - a tokio task-local slot, opened per request by [`scope`]. Futures
//!   polled inside the scope share it, and [`spawn`] /
//!   [`InRequestExt::in_current_request`] carry it into child tasks;
//! - a thread-local slot for synchronous thread-per-request servers,
//!   installed by [`RequestContext::enter`] and restored when the guard
//!   drops.
//!
//! Async servers must run each request inside [`scope`]. The thread slot is
//! shared by every task a worker thread runs, so it is never used from
//! inside the tokio runtime; it only serves one-thread-per-request code.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::futures::TaskLocalFuture;
use tokio::task::JoinHandle;

use crate::config::ObservabilityConfig;
use crate::dedup::{DedupPolicy, OperationLedger};
use crate::error_context::ErrorContext;
use crate::errors::ContextError;
use crate::performance::PerformanceTracker;
use crate::types::{CorrelationId, InvestigationId, Phase, SessionId, UserId};

/// Identity fields supplied when a request starts.
#[derive(Debug, Clone, Default)]
pub struct RequestFields {
    /// Session tag
    pub session_id: Option<SessionId>,
    /// User tag
    pub user_id: Option<UserId>,
    /// Investigation tag
    pub investigation_id: Option<InvestigationId>,
    /// Phase tag
    pub phase: Option<Phase>,
    /// Initial ad-hoc attributes
    pub attributes: Vec<(String, Value)>,
}

impl RequestFields {
    /// Creates an empty set of fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session tag
    #[must_use]
    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    /// Sets the user tag
    #[must_use]
    pub fn with_user_id(mut self, id: UserId) -> Self {
        self.user_id = Some(id);
        self
    }

    /// Sets the investigation tag
    #[must_use]
    pub fn with_investigation_id(mut self, id: InvestigationId) -> Self {
        self.investigation_id = Some(id);
        self
    }

    /// Sets the phase tag
    #[must_use]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Adds an initial attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    fn try_tag(self, name: &str, value: &str) -> Result<Self, ContextError> {
        let invalid = |reason: String| ContextError::InvalidTag {
            tag: name.to_string(),
            reason,
        };
        Ok(match name {
            "session_id" => self.with_session_id(
                SessionId::try_new(value.to_string()).map_err(|e| invalid(e.to_string()))?,
            ),
            "user_id" => self
                .with_user_id(UserId::try_new(value.to_string()).map_err(|e| invalid(e.to_string()))?),
            "investigation_id" => self.with_investigation_id(
                InvestigationId::try_new(value.to_string()).map_err(|e| invalid(e.to_string()))?,
            ),
            "phase" => {
                self.with_phase(Phase::try_new(value.to_string()).map_err(|e| invalid(e.to_string()))?)
            }
            _ => return Err(invalid("unknown tag".to_string())),
        })
    }

    /// Builds fields from loose key/value pairs.
    ///
    /// Known tag names become tags; a tag that fails validation is skipped.
    /// Any other key becomes an attribute.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        pairs.into_iter().fold(Self::default(), |fields, (key, value)| {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "session_id" | "user_id" | "investigation_id" | "phase" => {
                    let fallback = fields.clone();
                    fields.try_tag(key, value).unwrap_or_else(|error| {
                        tracing::debug!(error = %error, "Skipping invalid request tag");
                        fallback
                    })
                }
                _ => fields.with_attribute(key, value),
            }
        })
    }
}

#[derive(Debug, Default)]
struct Attributes {
    values: BTreeMap<String, Value>,
    bytes: usize,
}

fn attribute_size(key: &str, value: &Value) -> usize {
    key.len() + value.to_string().len()
}

struct ContextInner {
    correlation_id: CorrelationId,
    session_id: Option<SessionId>,
    user_id: Option<UserId>,
    investigation_id: Option<InvestigationId>,
    phase: Option<Phase>,
    started_at: DateTime<Utc>,
    start: Instant,
    dedup_policy: DedupPolicy,
    ledger: OperationLedger,
    max_attribute_bytes: usize,
    attributes: Mutex<Attributes>,
    performance: PerformanceTracker,
    errors: ErrorContext,
    operations_logged: AtomicUsize,
    orphaned_records: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
    closing: AtomicBool,
    finalized: AtomicBool,
}

/// The per-request aggregate: identity, dedup ledger, attributes,
/// performance tracker and error context.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequestContext(Arc<ContextInner>);

impl RequestContext {
    /// Creates a context with a fresh correlation id.
    pub fn new(fields: RequestFields, config: &ObservabilityConfig) -> Self {
        let RequestFields {
            session_id,
            user_id,
            investigation_id,
            phase,
            attributes,
        } = fields;

        let ctx = Self(Arc::new(ContextInner {
            correlation_id: CorrelationId::new(),
            session_id,
            user_id,
            investigation_id,
            phase,
            started_at: Utc::now(),
            start: Instant::now(),
            dedup_policy: config.dedup_policy,
            ledger: OperationLedger::new(config.max_logged_operations.into_inner()),
            max_attribute_bytes: config.max_attribute_bytes.into_inner(),
            attributes: Mutex::new(Attributes::default()),
            performance: PerformanceTracker::new(
                config.thresholds,
                config.timing_history.into_inner(),
            ),
            errors: ErrorContext::new(),
            operations_logged: AtomicUsize::new(0),
            orphaned_records: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        }));

        for (key, value) in attributes {
            if let Err(error) = ctx.set_attribute(key, value) {
                tracing::warn!(error = %error, "Dropping initial request attribute");
            }
        }
        ctx
    }

    /// Creates a context with default configuration.
    pub fn with_fields(fields: RequestFields) -> Self {
        Self::new(fields, &ObservabilityConfig::default())
    }

    /// Correlation id of the request.
    pub fn correlation_id(&self) -> CorrelationId {
        self.0.correlation_id
    }

    /// Session tag.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.0.session_id.as_ref()
    }

    /// User tag.
    pub fn user_id(&self) -> Option<&UserId> {
        self.0.user_id.as_ref()
    }

    /// Investigation tag.
    pub fn investigation_id(&self) -> Option<&InvestigationId> {
        self.0.investigation_id.as_ref()
    }

    /// Phase tag.
    pub fn phase(&self) -> Option<&Phase> {
        self.0.phase.as_ref()
    }

    /// Wall-clock start time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.0.started_at
    }

    /// Time since the request started.
    pub fn elapsed(&self) -> Duration {
        self.0.start.elapsed()
    }

    /// Dedup policy in force for this request.
    pub fn dedup_policy(&self) -> DedupPolicy {
        self.0.dedup_policy
    }

    /// Atomically claims the right to emit `key`. Exactly one of several
    /// racing callers wins under the strict policy.
    pub fn mark_logged(&self, key: &str) -> bool {
        self.0.ledger.try_mark(key, self.0.dedup_policy)
    }

    /// Returns true if `key` has been emitted in this request.
    pub fn has_logged(&self, key: &str) -> bool {
        self.0.ledger.has_logged(key)
    }

    /// Sets an ad-hoc attribute, keeping the aggregate size under the cap.
    pub fn set_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ContextError> {
        let key = key.into();
        let value = value.into();
        let size = attribute_size(&key, &value);

        let mut attributes = self.0.attributes.lock();
        let replaced = attributes
            .values
            .get(&key)
            .map_or(0, |old| attribute_size(&key, old));
        let projected = attributes.bytes - replaced + size;
        if projected > self.0.max_attribute_bytes {
            return Err(ContextError::AttributeLimitExceeded {
                key,
                limit: self.0.max_attribute_bytes,
            });
        }
        attributes.bytes = projected;
        attributes.values.insert(key, value);
        Ok(())
    }

    /// One attribute.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.0.attributes.lock().values.get(key).cloned()
    }

    /// Snapshot of every attribute.
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        self.0.attributes.lock().values.clone()
    }

    /// The request's performance tracker.
    pub fn performance(&self) -> &PerformanceTracker {
        &self.0.performance
    }

    /// The request's error context.
    pub fn errors(&self) -> &ErrorContext {
        &self.0.errors
    }

    /// Records emitted for this request that count as logged operations.
    pub fn operations_logged(&self) -> usize {
        self.0.operations_logged.load(Ordering::Relaxed)
    }

    /// Records emitted after the request was finalized.
    pub fn orphaned_records(&self) -> usize {
        self.0.orphaned_records.load(Ordering::Relaxed)
    }

    pub(crate) fn count_operation(&self) {
        self.0.operations_logged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_orphan(&self) {
        self.0.orphaned_records.fetch_add(1, Ordering::Relaxed);
    }

    /// Operations currently running inside this request.
    pub fn in_flight(&self) -> usize {
        self.0.in_flight.load(Ordering::Acquire)
    }

    /// Returns true once the request has ended.
    pub fn is_finalized(&self) -> bool {
        self.0.finalized.load(Ordering::Acquire)
    }

    /// Claims the right to close the request; only the first caller wins.
    pub(crate) fn begin_close(&self) -> bool {
        !self.0.closing.swap(true, Ordering::AcqRel)
    }

    /// Marks the context finalized; returns false if it already was.
    pub(crate) fn finalize(&self) -> bool {
        !self.0.finalized.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn begin_work(&self) -> InFlight {
        self.0.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(&self.0))
    }

    /// Waits until no operation is in flight, for at most `grace`.
    /// Returns true if the request went idle in time.
    pub(crate) async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.0.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Returns true if both handles refer to the same request.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Installs this context in the current thread's slot until the guard
    /// drops. For synchronous thread-per-request servers.
    pub fn enter(&self) -> ContextGuard {
        let previous = THREAD_CONTEXT.with(|slot| slot.replace(Some(self.clone())));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("correlation_id", &self.0.correlation_id)
            .field("session_id", &self.0.session_id)
            .field("operations_logged", &self.operations_logged())
            .field("in_flight", &self.in_flight())
            .field("finalized", &self.is_finalized())
            .finish_non_exhaustive()
    }
}

/// Marks one operation as running until dropped.
pub(crate) struct InFlight(Arc<ContextInner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Restores the previous thread-slot context when dropped.
///
/// Not `Send`, so it cannot be held across an `.await` in a spawned task.
#[must_use = "the context is only installed while the guard lives"]
pub struct ContextGuard {
    previous: Option<RequestContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_CONTEXT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Shared storage for one logical request's context.
///
/// Every task of the request holds a clone, so installing or detaching the
/// context is seen by all of them.
#[derive(Clone, Default)]
pub struct RequestSlot(Arc<RwLock<Option<RequestContext>>>);

impl RequestSlot {
    fn holding(ctx: Option<RequestContext>) -> Self {
        Self(Arc::new(RwLock::new(ctx)))
    }

    fn get(&self) -> Option<RequestContext> {
        self.0.read().clone()
    }
}

impl fmt::Debug for RequestSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestSlot")
            .field(&self.get().map(|c| c.correlation_id()))
            .finish()
    }
}

tokio::task_local! {
    static REQUEST_SLOT: RequestSlot;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

fn thread_context() -> Option<RequestContext> {
    THREAD_CONTEXT.with(|slot| slot.borrow().clone())
}

/// The active request context, if any.
///
/// Finalized contexts are never returned.
pub fn current() -> Option<RequestContext> {
    REQUEST_SLOT
        .try_with(RequestSlot::get)
        .ok()
        .flatten()
        .or_else(thread_context)
        .filter(|ctx| !ctx.is_finalized())
}

/// Returns true when called inside a [`scope`].
pub fn in_scope() -> bool {
    REQUEST_SLOT.try_with(|_| ()).is_ok()
}

/// Installs `ctx` as the ambient context and returns the one it replaced.
///
/// Outside a [`scope`] the thread slot is used, but only off the async
/// runtime: a runtime worker thread is shared by unrelated tasks.
pub(crate) fn install(ctx: &RequestContext) -> Result<Option<RequestContext>, ContextError> {
    if let Ok(previous) = REQUEST_SLOT.try_with(|slot| slot.0.write().replace(ctx.clone())) {
        return Ok(previous);
    }
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(ContextError::Unscoped);
    }
    Ok(THREAD_CONTEXT.with(|slot| slot.replace(Some(ctx.clone()))))
}

/// Detaches and returns the ambient context.
pub(crate) fn detach() -> Option<RequestContext> {
    REQUEST_SLOT
        .try_with(|slot| slot.0.write().take())
        .unwrap_or_else(|_| THREAD_CONTEXT.with(|slot| slot.borrow_mut().take()))
}

/// Detaches the ambient context only if it is `ctx`.
pub(crate) fn detach_if(ctx: &RequestContext) {
    let matches = |held: &Option<RequestContext>| held.as_ref().is_some_and(|h| h.ptr_eq(ctx));
    let in_task = REQUEST_SLOT.try_with(|slot| {
        let mut held = slot.0.write();
        if matches(&held) {
            *held = None;
        }
    });
    if in_task.is_err() {
        THREAD_CONTEXT.with(|slot| {
            let mut held = slot.borrow_mut();
            if matches(&held) {
                *held = None;
            }
        });
    }
}

/// Runs `fut` with a fresh, isolated slot for one logical request.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    REQUEST_SLOT.scope(RequestSlot::default(), fut).await
}

/// Spawns a task that shares the current request's context.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut.in_current_request())
}

/// Adapter carrying the current request into a future that will be polled
/// elsewhere, for example on a `JoinSet` or another runtime.
pub trait InRequestExt: Future + Sized {
    /// Wraps the future so it observes the current request's slot.
    fn in_current_request(self) -> TaskLocalFuture<RequestSlot, Self>;
}

impl<F: Future> InRequestExt for F {
    fn in_current_request(self) -> TaskLocalFuture<RequestSlot, Self> {
        let slot = REQUEST_SLOT
            .try_with(Clone::clone)
            .unwrap_or_else(|_| RequestSlot::holding(thread_context()));
        REQUEST_SLOT.scope(slot, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaxAttributeBytes;

    fn fields(session: &str) -> RequestFields {
        RequestFields::new().with_session_id(SessionId::try_new(session).unwrap())
    }

    #[test]
    fn no_context_outside_request() {
        assert!(current().is_none());
        assert!(!in_scope());
    }

    #[test]
    fn thread_guard_restores_previous() {
        let outer = RequestContext::with_fields(fields("outer"));
        let inner = RequestContext::with_fields(fields("inner"));

        let _outer_guard = outer.enter();
        {
            let _inner_guard = inner.enter();
            assert!(current().unwrap().ptr_eq(&inner));
        }
        assert!(current().unwrap().ptr_eq(&outer));
    }

    #[tokio::test]
    async fn scope_isolates_and_detaches() {
        scope(async {
            let ctx = RequestContext::with_fields(fields("s1"));
            assert!(install(&ctx).unwrap().is_none());
            assert!(current().unwrap().ptr_eq(&ctx));
            detach();
            assert!(current().is_none());
        })
        .await;
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn spawned_tasks_inherit_the_slot() {
        scope(async {
            let ctx = RequestContext::with_fields(fields("s1"));
            install(&ctx).unwrap();
            let seen = spawn(async { current().map(|c| c.correlation_id()) })
                .await
                .unwrap();
            assert_eq!(seen, Some(ctx.correlation_id()));
        })
        .await;
    }

    #[tokio::test]
    async fn finalized_context_is_not_current() {
        scope(async {
            let ctx = RequestContext::with_fields(RequestFields::new());
            install(&ctx).unwrap();
            assert!(ctx.finalize());
            assert!(!ctx.finalize());
            assert!(current().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn unscoped_task_does_not_touch_the_thread_slot() {
        let ctx = RequestContext::with_fields(fields("unscoped"));
        assert!(matches!(install(&ctx), Err(ContextError::Unscoped)));
        assert!(current().is_none());
    }

    #[test]
    fn attributes_respect_byte_budget() {
        let config = ObservabilityConfig::default()
            .with_max_attribute_bytes(MaxAttributeBytes::try_new(64).unwrap());
        let ctx = RequestContext::new(RequestFields::new(), &config);

        ctx.set_attribute("route", "/orders").unwrap();
        let err = ctx.set_attribute("blob", "x".repeat(100)).unwrap_err();
        assert!(matches!(err, ContextError::AttributeLimitExceeded { limit: 64, .. }));
        ctx.set_attribute("route", "/users").unwrap();
        assert_eq!(ctx.attribute("route"), Some(Value::from("/users")));
        assert_eq!(ctx.attributes().len(), 1);
    }

    #[test]
    fn loose_pairs_become_tags_and_attributes() {
        let fields = RequestFields::from_pairs([
            ("session_id", "s1"),
            ("user_id", "   "),
            ("route", "/orders"),
        ]);
        assert_eq!(fields.session_id.unwrap().as_ref(), "s1");
        assert!(fields.user_id.is_none());
        assert_eq!(fields.attributes, vec![("route".to_string(), Value::from("/orders"))]);
    }

    #[tokio::test]
    async fn wait_idle_respects_grace() {
        let ctx = RequestContext::with_fields(RequestFields::new());
        let work = ctx.begin_work();
        assert!(!ctx.wait_idle(Duration::from_millis(20)).await);

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(work);
        assert!(waiter.await.unwrap());
    }
}
