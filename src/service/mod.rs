mod listener;
pub use listener::*;

mod event_queue;
pub use event_queue::*;

mod registry;
use registry::Registry;

use crate::messages::{
    EVENT_TYPE_START, InboundEvent, METHOD_QR_CODE_SCAN, METHOD_QR_CODE_SHOW, METHOD_RECIPROCATE, StartMethod,
    ValidCancel, ValidReady, ValidRequest, ValidStart, VerificationInfo,
};
use crate::request::now_millis;
use crate::transaction::{Outgoing, TransactionMethod, TransactionParams, VerificationTransaction};
use crate::transport::{MessageSender, RetryPolicy, RoomSendQueue, RoomTransport, ToDeviceTransport, Transport};
use crate::{
    CancelCode, CrossSigning, DeviceStore, Error, PendingVerificationRequest, TransactionSnapshot,
    VerificationConfig, VerificationMethod,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

enum OutboundJob {
    /// A message queued by a transaction; the delivery result is fed back
    /// to that instance only.
    Transaction {
        other_user_id: String,
        transaction_id: String,
        generation: u64,
        transport: Transport,
        outgoing: Outgoing,
    },
    /// A best-effort cancel outside any registered transaction.
    Cancel {
        transport: Transport,
        transaction_id: String,
        code: CancelCode,
    },
}

struct Inner {
    user_id: String,
    device_id: String,
    sender: Arc<dyn MessageSender>,
    device_store: Arc<dyn DeviceStore>,
    cross_signing: Arc<dyn CrossSigning>,
    config: VerificationConfig,
    registry: Mutex<Registry>,
    room_queues: std::sync::Mutex<HashMap<String, RoomSendQueue>>,
    listeners: ListenerHub,
    outbound: mpsc::UnboundedSender<OutboundJob>,
}

/// Registry and router of the verifications of one device.
///
/// All transactions and requests live behind a single lock, so the decision
/// to create or route on an inbound event is atomic. Transactions never do
/// I/O: the messages they queue are sent in order by an outbound worker,
/// which reports each delivery back to its transaction.
///
/// Cloning yields another handle to the same service.
#[derive(Clone)]
pub struct VerificationService {
    inner: Arc<Inner>,
}

fn method_values(methods: &[VerificationMethod]) -> Vec<String> {
    methods.iter().map(|m| m.value().to_string()).collect()
}

fn parse_methods(values: &[String]) -> Vec<VerificationMethod> {
    values.iter().filter_map(|v| VerificationMethod::from_value(v)).collect()
}

fn has_qr_method(methods: &[VerificationMethod]) -> bool {
    methods
        .iter()
        .any(|m| matches!(m, VerificationMethod::QrCodeScan | VerificationMethod::QrCodeShow))
}

impl VerificationService {
    /// Creates the service and spawns its workers. Must be called within a
    /// Tokio runtime.
    pub fn new(
        user_id: &str,
        device_id: &str,
        sender: Arc<dyn MessageSender>,
        device_store: Arc<dyn DeviceStore>,
        cross_signing: Arc<dyn CrossSigning>,
        config: Option<VerificationConfig>,
    ) -> Self {
        let config = config.unwrap_or_default();
        let (outbound, jobs) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            sender,
            device_store,
            cross_signing,
            registry: Mutex::new(Registry::new(config.max_past_transactions)),
            config,
            room_queues: std::sync::Mutex::default(),
            listeners: ListenerHub::spawn(),
            outbound,
        });
        spawn_outbound_worker(Arc::downgrade(&inner), jobs);

        Self { inner }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn add_listener(&self, listener: Arc<dyn VerificationListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn VerificationListener>) {
        self.inner.listeners.remove(listener);
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.inner.config)
    }

    fn room_queue(&self, room_id: &str) -> RoomSendQueue {
        self.inner
            .room_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room_id.to_string())
            .or_insert_with(|| RoomSendQueue::spawn(room_id, Arc::clone(&self.inner.sender), self.policy()))
            .clone()
    }

    /// The transport reaching a peer: its room, or one device (all of them
    /// when unknown).
    fn transport_for(&self, other_user_id: &str, room_id: Option<&str>, other_device_id: Option<&str>) -> Transport {
        match room_id {
            Some(room_id) => Transport::Room(RoomTransport::new(room_id, self.room_queue(room_id))),
            None => Transport::ToDevice(ToDeviceTransport::new(
                Arc::clone(&self.inner.sender),
                self.policy(),
                other_user_id,
                other_device_id.map(|d| vec![d.to_string()]).unwrap_or_default(),
            )),
        }
    }

    fn params(
        &self,
        transaction_id: &str,
        other_user_id: &str,
        other_device_id: Option<&str>,
        transport: Transport,
    ) -> TransactionParams {
        TransactionParams {
            transaction_id: transaction_id.to_string(),
            user_id: self.inner.user_id.clone(),
            device_id: self.inner.device_id.clone(),
            other_user_id: other_user_id.to_string(),
            other_device_id: other_device_id.map(str::to_string),
            transport,
            device_store: Arc::clone(&self.inner.device_store),
            cross_signing: Arc::clone(&self.inner.cross_signing),
        }
    }

    fn new_transaction_id(&self, other_user_id: &str, other_device_id: &str) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.inner.user_id,
            self.inner.device_id,
            other_user_id,
            other_device_id,
            Uuid::new_v4()
        )
    }

    /// QR codes need a cross-signing identity; self-verification only needs
    /// our master key to be known.
    fn qr_allowed(&self, other_user_id: &str) -> bool {
        self.inner.cross_signing.is_trusted()
            || (other_user_id == self.inner.user_id && self.inner.cross_signing.my_master_key().is_some())
    }

    /// Methods to advertise to a user. An empty list means the configured ones.
    fn advertised_methods(&self, methods: &[VerificationMethod], other_user_id: &str) -> Vec<VerificationMethod> {
        let methods: &[VerificationMethod] = if methods.is_empty() {
            &self.inner.config.supported_methods
        } else {
            methods
        };
        let qr = self.qr_allowed(other_user_id);

        let mut result = Vec::new();
        for method in methods {
            if (qr || !method.is_qr()) && !result.contains(method) {
                result.push(*method);
            }
        }

        if has_qr_method(&result) {
            if !result.contains(&VerificationMethod::Reciprocate) {
                result.push(VerificationMethod::Reciprocate);
            }
        } else {
            result.retain(|m| *m != VerificationMethod::Reciprocate);
        }
        result
    }

    /// Whether the peer wins a start collision: the lower `(user, device)` wins.
    fn is_other_prioritary(&self, other_user_id: &str, other_device_id: &str) -> bool {
        (other_user_id, other_device_id) < (self.inner.user_id.as_str(), self.inner.device_id.as_str())
    }

    pub fn is_request_stale(&self, request: &PendingVerificationRequest) -> bool {
        request.is_suspiciously_old(
            now_millis(),
            self.inner.config.request_validity_window,
            self.inner.config.request_future_tolerance,
        )
    }

    fn enqueue(&self, job: OutboundJob) {
        if self.inner.outbound.send(job).is_err() {
            warn!("Outbound worker gone, dropping message");
        }
    }

    fn send_cancel(&self, transport: Transport, transaction_id: &str, code: CancelCode) {
        self.enqueue(OutboundJob::Cancel {
            transport,
            transaction_id: transaction_id.to_string(),
            code,
        });
    }

    fn notify(&self, notification: Notification) {
        self.inner.listeners.notify(notification);
    }

    /// Runs `f` on a registered transaction, then flushes what it queued,
    /// notifies listeners of a change and evicts it once finished.
    fn drive<T>(
        &self,
        registry: &mut Registry,
        other_user_id: &str,
        transaction_id: &str,
        f: impl FnOnce(&mut VerificationTransaction) -> T,
    ) -> Option<T> {
        let transaction = registry.transaction_mut(other_user_id, transaction_id)?;
        let before = transaction.snapshot();
        let result = f(transaction);
        let after = transaction.snapshot();

        let transport = transaction.transport().clone();
        let generation = transaction.generation();
        for outgoing in transaction.take_outbox() {
            self.enqueue(OutboundJob::Transaction {
                other_user_id: other_user_id.to_string(),
                transaction_id: transaction_id.to_string(),
                generation,
                transport: transport.clone(),
                outgoing,
            });
        }

        let state = after.state;
        if after != before {
            self.notify(Notification::TransactionUpdated(after));
        }

        if state.is_terminal() {
            registry.evict(other_user_id, transaction_id);
            debug!(%transaction_id, %other_user_id, ?state, "Evicted finished transaction");

            let cancelled = state.cancel_code();
            self.update_request(registry, other_user_id, transaction_id, |request| {
                if request.is_finished() {
                    return;
                }
                match cancelled {
                    Some(code) => request.cancel_conclusion = Some(code),
                    None => request.is_successful = true,
                }
            });
        }

        Some(result)
    }

    fn register(&self, registry: &mut Registry, transaction: VerificationTransaction) {
        let other_user_id = transaction.other_user_id().to_string();
        let transaction_id = transaction.transaction_id().to_string();

        self.notify(Notification::TransactionCreated(transaction.snapshot()));
        if registry.insert_transaction(transaction).is_some() {
            debug!(%transaction_id, %other_user_id, "Replaced existing transaction");
        }
        self.drive(registry, &other_user_id, &transaction_id, |_| ());
    }

    /// Drops a transaction whose id is taken over by a new one. The request
    /// stays open and the id is not remembered as finished.
    fn supersede(&self, registry: &mut Registry, other_user_id: &str, transaction_id: &str) {
        if let Some(mut transaction) = registry.remove_transaction(other_user_id, transaction_id) {
            transaction.abandon();
            self.notify(Notification::TransactionUpdated(transaction.snapshot()));
        }
    }

    /// Updates the request with that id and notifies when it changed.
    fn update_request(
        &self,
        registry: &mut Registry,
        other_user_id: &str,
        transaction_id: &str,
        update: impl FnOnce(&mut PendingVerificationRequest),
    ) {
        let Some(before) = registry.request(other_user_id, transaction_id).cloned() else {
            return;
        };
        if let Some(after) = registry.update_request(other_user_id, &before.local_id, update)
            && after != before
        {
            self.notify(Notification::RequestUpdated(after));
        }
    }

    fn mark_request_started(&self, registry: &mut Registry, other_user_id: &str, transaction_id: &str) {
        self.update_request(registry, other_user_id, transaction_id, |request| request.started = true);
    }

    async fn on_delivery(
        &self,
        other_user_id: &str,
        transaction_id: &str,
        generation: u64,
        outgoing: &Outgoing,
        delivered: bool,
    ) {
        let mut registry = self.inner.registry.lock().await;
        let current = registry
            .transaction(other_user_id, transaction_id)
            .map(VerificationTransaction::generation);
        if current.is_some_and(|current| current != generation) {
            debug!(%transaction_id, delivered, "Delivery result for a superseded transaction");
            return;
        }
        if self
            .drive(&mut registry, other_user_id, transaction_id, |tx| tx.on_delivery(outgoing, delivered))
            .is_none()
        {
            debug!(%transaction_id, delivered, "Delivery result for a finished transaction");
        }
    }

    // Inbound

    /// Handles one inbound event. Events are expected one at a time, see
    /// [`EventQueue`].
    pub async fn on_event(&self, event: InboundEvent) {
        if !event.is_verification_event() {
            return;
        }

        let info = match event.parse() {
            Ok(info) => info,
            Err(err) => {
                debug!(
                    sender = %event.sender,
                    event_type = %event.event_type,
                    error = %err,
                    "Dropping invalid verification event"
                );
                self.cancel_invalid_start(&event);
                return;
            }
        };

        if event.sender == self.inner.user_id && !self.accept_own_event(&event, &info).await {
            return;
        }

        match info {
            VerificationInfo::Request(request) => self.on_request_received(&event, request).await,
            VerificationInfo::Ready(ready) => self.on_ready_received(&event, ready).await,
            VerificationInfo::Start(start) => self.on_start_received(&event, start).await,
            VerificationInfo::Cancel(cancel) => self.on_cancel_received(&event, cancel).await,
            info @ VerificationInfo::Done(_) => self.on_done_received(&event, &info).await,
            info => {
                let mut registry = self.inner.registry.lock().await;
                self.route(&mut registry, &event, &info);
            }
        }
    }

    /// A start we cannot parse but can name is refused.
    fn cancel_invalid_start(&self, event: &InboundEvent) {
        if event.event_type != EVENT_TYPE_START {
            return;
        }
        let Some(transaction_id) = event.raw_transaction_id() else {
            return;
        };

        let from_device = event.content.get("from_device").and_then(Value::as_str);
        let transport = self.transport_for(&event.sender, event.room_id(), from_device);
        self.send_cancel(transport, &transaction_id, CancelCode::UnknownMethod);
    }

    /// Filters events sent by our own user; returns whether to process it.
    ///
    /// Our own echoes are dropped. In rooms, a ready or start from another of
    /// our devices means that session took over the request.
    async fn accept_own_event(&self, event: &InboundEvent, info: &VerificationInfo) -> bool {
        let from_device = match info {
            VerificationInfo::Request(m) => Some(m.from_device.as_str()),
            VerificationInfo::Ready(m) => Some(m.from_device.as_str()),
            VerificationInfo::Start(m) => Some(m.from_device.as_str()),
            _ => None,
        };
        if from_device == Some(self.inner.device_id.as_str()) {
            return false;
        }

        let Some(room_id) = event.room_id() else {
            return true;
        };

        if matches!(info, VerificationInfo::Ready(_) | VerificationInfo::Start(_)) {
            let mut registry = self.inner.registry.lock().await;
            let other_user_id = registry
                .request_in_room(room_id, info.transaction_id())
                .map(|r| r.other_user_id.clone());

            if let Some(other_user_id) = other_user_id {
                info!(
                    transaction_id = %info.transaction_id(),
                    "Request handled by another of our sessions"
                );
                self.update_request(&mut registry, &other_user_id, info.transaction_id(), |request| {
                    request.handled_by_other_session = true;
                });
            }
        }
        false
    }

    /// Forwards a message to its transaction. Unknown ids are dropped.
    fn route(&self, registry: &mut Registry, event: &InboundEvent, info: &VerificationInfo) {
        let sender = event.sender.as_str();
        let transaction_id = info.transaction_id();

        match registry.transaction(sender, transaction_id) {
            None if registry.is_past(sender, transaction_id) => {
                debug!(%transaction_id, "Dropping message for a finished transaction");
                return;
            }
            None => {
                debug!(%transaction_id, %sender, "Dropping message for an unknown transaction");
                return;
            }
            Some(tx) if tx.transport().room_id() != event.room_id() => {
                warn!(%transaction_id, "Dropping message received over another transport");
                return;
            }
            Some(_) => {}
        }

        self.drive(registry, sender, transaction_id, |tx| tx.on_verification_info(info));
    }

    async fn on_request_received(&self, event: &InboundEvent, info: ValidRequest) {
        if let Some(to_user_id) = &info.to_user_id
            && *to_user_id != self.inner.user_id
        {
            debug!(transaction_id = %info.transaction_id, "Request addressed to another user");
            return;
        }

        let request = PendingVerificationRequest::incoming(info, &event.sender, event.room_id(), event.origin_server_ts);
        if self.is_request_stale(&request) {
            info!(local_id = %request.local_id, sender = %event.sender, "Ignoring stale verification request");
            return;
        }

        let mut registry = self.inner.registry.lock().await;
        if registry.request(&event.sender, &request.local_id).is_some() {
            debug!(local_id = %request.local_id, "Duplicate verification request");
            return;
        }

        info!(
            transaction_id = %request.local_id,
            sender = %event.sender,
            "Received verification request"
        );
        registry.add_request(request.clone());
        self.notify(Notification::RequestCreated(request));
    }

    async fn on_ready_received(&self, event: &InboundEvent, ready: ValidReady) {
        let sender = event.sender.as_str();
        let transaction_id = ready.transaction_id.clone();
        let mut registry = self.inner.registry.lock().await;

        let Some(request) = registry.request(sender, &transaction_id).cloned() else {
            debug!(%transaction_id, "Ready for an unknown request");
            return;
        };
        if request.is_incoming || request.room_id.as_deref() != event.room_id() {
            debug!(%transaction_id, "Ready does not match our request");
            return;
        }
        if request.is_ready() || request.is_finished() {
            debug!(%transaction_id, "Request already answered");
            return;
        }

        let ours = request
            .request_info
            .as_ref()
            .map(|info| info.methods.as_slice())
            .unwrap_or_default();
        let offered = |method: &str| ours.iter().any(|m| m == method);
        let readied = |method: &str| ready.methods.iter().any(|m| m == method);

        if offered(METHOD_RECIPROCATE) && readied(METHOD_RECIPROCATE) {
            let other_can_scan = readied(METHOD_QR_CODE_SCAN) && offered(METHOD_QR_CODE_SHOW);
            let transport = self.transport_for(sender, event.room_id(), Some(ready.from_device.as_str()));
            let params = self.params(&transaction_id, sender, Some(ready.from_device.as_str()), transport);
            self.register(&mut registry, VerificationTransaction::new_qr(params, false, other_can_scan));
        }

        info!(%transaction_id, from_device = %ready.from_device, "Request is ready");
        let from_device = ready.from_device.clone();
        self.update_request(&mut registry, sender, &transaction_id, |r| r.ready_info = Some(ready));

        // The other devices the request went to can stop showing it.
        if event.room_id().is_none() {
            let others: Vec<String> = request
                .target_devices
                .iter()
                .filter(|d| **d != from_device)
                .cloned()
                .collect();
            if !others.is_empty() {
                let transport = Transport::ToDevice(ToDeviceTransport::new(
                    Arc::clone(&self.inner.sender),
                    self.policy(),
                    sender,
                    others,
                ));
                self.send_cancel(transport, &transaction_id, CancelCode::AcceptedByAnotherDevice);
            }
        }
    }

    async fn on_start_received(&self, event: &InboundEvent, start: ValidStart) {
        let sender = event.sender.as_str();
        let transaction_id = start.transaction_id.clone();
        let mut registry = self.inner.registry.lock().await;

        if registry.is_past(sender, &transaction_id) {
            debug!(%transaction_id, "Dropping start for a finished transaction");
            return;
        }

        let request = registry.request(sender, &transaction_id).cloned();
        if let Some(request) = &request {
            if request.is_finished() {
                debug!(%transaction_id, "Dropping start for a finished request");
                return;
            }
            if request.handled_by_other_session {
                debug!(%transaction_id, "Ignoring start for a request handled elsewhere");
                return;
            }
            if request.room_id.as_deref() != event.room_id() {
                debug!(%transaction_id, "Start received over another transport than its request");
                return;
            }
        }

        if !matches!(start.method, StartMethod::Reciprocate { .. }) {
            self.on_sas_start_received(&mut registry, event, start, request.as_ref());
            return;
        }

        let is_qr = registry
            .transaction(sender, &transaction_id)
            .is_some_and(|tx| tx.method() == TransactionMethod::QrCode);
        if !is_qr {
            debug!(%transaction_id, "Reciprocate start without a QR transaction");
            let transport = self.transport_for(sender, event.room_id(), Some(start.from_device.as_str()));
            self.send_cancel(transport, &transaction_id, CancelCode::UnexpectedMessage);
            return;
        }

        let info = VerificationInfo::Start(start);
        self.drive(&mut registry, sender, &transaction_id, |tx| tx.on_verification_info(&info));
        self.mark_request_started(&mut registry, sender, &transaction_id);
    }

    fn on_sas_start_received(
        &self,
        registry: &mut Registry,
        event: &InboundEvent,
        start: ValidStart,
        request: Option<&PendingVerificationRequest>,
    ) {
        let sender = event.sender.as_str();
        let transaction_id = start.transaction_id.as_str();

        let existing = registry
            .transaction(sender, transaction_id)
            .map(|tx| (tx.method(), tx.is_incoming()));
        match existing {
            Some((TransactionMethod::Sas, false)) if request.is_some_and(PendingVerificationRequest::is_ready) => {
                // Both sides started the same request.
                if self.is_other_prioritary(sender, &start.from_device) {
                    info!(%transaction_id, "Both sides started, dropping our start");
                } else {
                    info!(%transaction_id, "Both sides started, ignoring the peer start");
                    return;
                }
            }
            Some((TransactionMethod::Sas, _)) => {
                warn!(%transaction_id, "Start for an existing transaction");
                self.drive(registry, sender, transaction_id, |tx| tx.cancel(CancelCode::UnexpectedMessage));
                return;
            }
            // The QR transaction prepared at ready time gives way to SAS.
            Some((TransactionMethod::QrCode, _)) | None => {}
        }

        let others: Vec<String> = registry
            .active_sas_ids(sender)
            .into_iter()
            .filter(|id| id != transaction_id)
            .collect();
        if !others.is_empty() {
            warn!(
                %transaction_id,
                other_user_id = %sender,
                active = others.len(),
                "Start while another verification is in flight, cancelling all"
            );
            for id in &others {
                self.drive(registry, sender, id, |tx| tx.cancel(CancelCode::UnexpectedMessage));
            }
            let transport = self.transport_for(sender, event.room_id(), Some(start.from_device.as_str()));
            self.send_cancel(transport, transaction_id, CancelCode::UnexpectedMessage);
            return;
        }

        let transport = self.transport_for(sender, event.room_id(), Some(start.from_device.as_str()));
        let params = self.params(transaction_id, sender, Some(start.from_device.as_str()), transport.clone());
        let transaction = match VerificationTransaction::new_incoming_sas(params, &start, &event.content) {
            Ok(transaction) => transaction,
            Err(err) => {
                warn!(%transaction_id, error = %err, "Cannot answer start");
                if existing.is_some() {
                    self.drive(registry, sender, transaction_id, |tx| tx.cancel(CancelCode::UnknownMethod));
                } else {
                    self.send_cancel(transport, transaction_id, CancelCode::UnknownMethod);
                }
                return;
            }
        };

        info!(%transaction_id, other_user_id = %sender, from_device = %start.from_device, "Incoming SAS verification");
        self.supersede(registry, sender, transaction_id);
        self.register(registry, transaction);

        if request.is_some_and(|r| r.involves_device(&self.inner.device_id)) {
            debug!(%transaction_id, "Auto-accepting start of our request");
            if let Some(Err(err)) = self.drive(registry, sender, transaction_id, |tx| tx.perform_accept()) {
                warn!(%transaction_id, error = %err, "Auto-accept failed");
            }
        }
        self.mark_request_started(registry, sender, transaction_id);
    }

    async fn on_cancel_received(&self, event: &InboundEvent, cancel: ValidCancel) {
        let sender = event.sender.as_str();
        let mut registry = self.inner.registry.lock().await;

        let request_matches = registry
            .request(sender, &cancel.transaction_id)
            .is_some_and(|r| r.room_id.as_deref() == event.room_id());
        if request_matches {
            let code = cancel.code;
            self.update_request(&mut registry, sender, &cancel.transaction_id, |request| {
                if !request.is_finished() {
                    request.cancel_conclusion = Some(code);
                }
            });
        }

        self.route(&mut registry, event, &VerificationInfo::Cancel(cancel));
    }

    async fn on_done_received(&self, event: &InboundEvent, info: &VerificationInfo) {
        let sender = event.sender.as_str();
        let transaction_id = info.transaction_id();
        let mut registry = self.inner.registry.lock().await;

        if registry.transaction(sender, transaction_id).is_some() {
            self.route(&mut registry, event, info);
            return;
        }

        // Nothing to verify here; the peer reports the request as done.
        let request_matches = registry
            .request(sender, transaction_id)
            .is_some_and(|r| r.room_id.as_deref() == event.room_id());
        if request_matches {
            self.update_request(&mut registry, sender, transaction_id, |request| {
                if !request.is_finished() {
                    request.is_successful = true;
                }
            });
        }
    }

    // Requests

    /// Sends a to-device request to some devices of a user, all of them when
    /// `other_devices` is empty.
    ///
    /// Unfinished requests to the same user are cancelled first.
    pub async fn request_verification(
        &self,
        methods: &[VerificationMethod],
        other_user_id: &str,
        other_devices: &[String],
    ) -> Result<PendingVerificationRequest, Error> {
        self.cancel_unfinished_requests(other_user_id).await;

        let methods = self.advertised_methods(methods, other_user_id);
        let transaction_id = Uuid::new_v4().to_string();
        let transport = Transport::ToDevice(ToDeviceTransport::new(
            Arc::clone(&self.inner.sender),
            self.policy(),
            other_user_id,
            other_devices.to_vec(),
        ));
        let info = transport.create_request(
            &transaction_id,
            &self.inner.device_id,
            other_user_id,
            method_values(&methods),
            now_millis(),
        );
        let VerificationInfo::Request(valid) = &info else {
            return Err(Error::Protocol("Not a request".to_string()));
        };

        let mut request = PendingVerificationRequest::outgoing(&transaction_id, other_user_id, None);
        request.transaction_id = Some(transaction_id.clone());
        request.request_info = Some(valid.clone());
        request.target_devices = other_devices.to_vec();

        // Registered before sending so that an early answer finds it.
        {
            let mut registry = self.inner.registry.lock().await;
            registry.add_request(request.clone());
            self.notify(Notification::RequestCreated(request.clone()));
        }

        info!(%transaction_id, %other_user_id, "Requesting verification");
        if let Err(err) = transport.send(&info).await {
            let mut registry = self.inner.registry.lock().await;
            self.update_request(&mut registry, other_user_id, &transaction_id, |r| {
                r.cancel_conclusion = Some(CancelCode::User);
            });
            return Err(err);
        }

        Ok(request)
    }

    /// Sends a request in a room. The event id of the request becomes the
    /// transaction id.
    pub async fn request_verification_in_room(
        &self,
        methods: &[VerificationMethod],
        other_user_id: &str,
        room_id: &str,
    ) -> Result<PendingVerificationRequest, Error> {
        self.cancel_unfinished_requests(other_user_id).await;

        let methods = self.advertised_methods(methods, other_user_id);
        let local_id = Uuid::new_v4().to_string();
        let transport = self.transport_for(other_user_id, Some(room_id), None);
        let info = transport.create_request(
            &local_id,
            &self.inner.device_id,
            other_user_id,
            method_values(&methods),
            now_millis(),
        );
        let VerificationInfo::Request(valid) = &info else {
            return Err(Error::Protocol("Not a request".to_string()));
        };

        // Held across the send: the answer references an id only known once sent.
        let mut registry = self.inner.registry.lock().await;
        let event_id = transport.send(&info).await?;
        info!(transaction_id = %event_id, %other_user_id, %room_id, "Requested verification in room");

        let mut request = PendingVerificationRequest::outgoing(&local_id, other_user_id, Some(room_id));
        request.transaction_id = Some(event_id.clone());
        request.request_info = Some(ValidRequest {
            transaction_id: event_id,
            ..valid.clone()
        });
        registry.add_request(request.clone());
        self.notify(Notification::RequestCreated(request.clone()));

        Ok(request)
    }

    async fn cancel_unfinished_requests(&self, other_user_id: &str) {
        let mut registry = self.inner.registry.lock().await;
        let unfinished: Vec<String> = registry
            .requests_for_user(other_user_id)
            .iter()
            .filter(|r| !r.is_finished())
            .filter_map(|r| r.transaction_id.clone())
            .collect();

        for transaction_id in unfinished {
            debug!(%transaction_id, "Cancelling previous request");
            self.cancel_request(&mut registry, other_user_id, &transaction_id, CancelCode::User);
        }
    }

    /// Concludes a request and tells the peer, through its transaction when
    /// one exists.
    fn cancel_request(&self, registry: &mut Registry, other_user_id: &str, transaction_id: &str, code: CancelCode) {
        let Some(request) = registry.request(other_user_id, transaction_id).cloned() else {
            return;
        };

        self.update_request(registry, other_user_id, transaction_id, |r| {
            if !r.is_finished() {
                r.cancel_conclusion = Some(code);
            }
        });

        if self
            .drive(registry, other_user_id, transaction_id, |tx| tx.cancel(code))
            .is_none()
        {
            let transport = match request.room_id.as_deref() {
                Some(room_id) => self.transport_for(other_user_id, Some(room_id), None),
                None => Transport::ToDevice(ToDeviceTransport::new(
                    Arc::clone(&self.inner.sender),
                    self.policy(),
                    other_user_id,
                    request
                        .other_device_id()
                        .map(|d| vec![d.to_string()])
                        .unwrap_or_else(|| request.target_devices.clone()),
                )),
            };
            self.send_cancel(transport, transaction_id, code);
        }
    }

    /// Accepts an incoming request with the methods both sides support.
    ///
    /// Returns `false`, sending nothing, when there is no common method. When
    /// both sides can do QR codes a QR transaction is prepared right away.
    pub async fn ready_pending_verification(
        &self,
        methods: &[VerificationMethod],
        other_user_id: &str,
        transaction_id: &str,
    ) -> Result<bool, Error> {
        // Held across the send so that a start answering our ready finds it.
        let mut registry = self.inner.registry.lock().await;

        let request = registry
            .request(other_user_id, transaction_id)
            .cloned()
            .ok_or(Error::UnknownTransaction)?;
        if !request.is_incoming || request.is_ready() || request.is_finished() {
            return Err(Error::Protocol("Request cannot be readied".to_string()));
        }
        let info = request
            .request_info
            .as_ref()
            .ok_or_else(|| Error::Protocol("Request without content".to_string()))?;

        let theirs = parse_methods(&info.methods);
        let ours = self.advertised_methods(methods, other_user_id);
        let mine = |method: VerificationMethod| ours.contains(&method);
        let peer = |method: VerificationMethod| theirs.contains(&method);

        let mut agreed = Vec::new();
        if mine(VerificationMethod::Sas) && peer(VerificationMethod::Sas) {
            agreed.push(VerificationMethod::Sas);
        }
        if peer(VerificationMethod::Reciprocate) && mine(VerificationMethod::Reciprocate) {
            if peer(VerificationMethod::QrCodeScan) && mine(VerificationMethod::QrCodeShow) {
                agreed.push(VerificationMethod::QrCodeShow);
            }
            if peer(VerificationMethod::QrCodeShow) && mine(VerificationMethod::QrCodeScan) {
                agreed.push(VerificationMethod::QrCodeScan);
            }
            if has_qr_method(&agreed) {
                agreed.push(VerificationMethod::Reciprocate);
            }
        }

        if agreed.is_empty() {
            info!(%transaction_id, "No common verification method");
            return Ok(false);
        }

        let other_device_id = info.from_device.clone();
        let transport = self.transport_for(other_user_id, request.room_id.as_deref(), Some(other_device_id.as_str()));
        let ready = transport.create_ready(transaction_id, &self.inner.device_id, method_values(&agreed));
        transport.send(&ready).await?;

        if agreed.contains(&VerificationMethod::Reciprocate) {
            let params = self.params(transaction_id, other_user_id, Some(other_device_id.as_str()), transport);
            let other_can_scan = agreed.contains(&VerificationMethod::QrCodeShow);
            self.register(&mut registry, VerificationTransaction::new_qr(params, true, other_can_scan));
        }

        if let VerificationInfo::Ready(valid) = ready {
            self.update_request(&mut registry, other_user_id, transaction_id, |r| r.ready_info = Some(valid));
        }
        info!(%transaction_id, methods = ?agreed, "Readied verification request");
        Ok(true)
    }

    /// Refuses an incoming request.
    pub async fn decline_verification_request(&self, other_user_id: &str, transaction_id: &str) -> Result<(), Error> {
        let mut registry = self.inner.registry.lock().await;
        let incoming = registry
            .request(other_user_id, transaction_id)
            .map(|r| r.is_incoming)
            .ok_or(Error::UnknownTransaction)?;
        if !incoming {
            return Err(Error::Protocol("Only incoming requests can be declined".to_string()));
        }

        info!(%transaction_id, %other_user_id, "Declining verification request");
        self.cancel_request(&mut registry, other_user_id, transaction_id, CancelCode::User);
        Ok(())
    }

    /// Cancels a request in either direction, with its transaction if any.
    pub async fn cancel_verification_request(&self, other_user_id: &str, transaction_id: &str) -> Result<(), Error> {
        let mut registry = self.inner.registry.lock().await;
        if registry.request(other_user_id, transaction_id).is_none() {
            return Err(Error::UnknownTransaction);
        }

        info!(%transaction_id, %other_user_id, "Cancelling verification request");
        self.cancel_request(&mut registry, other_user_id, transaction_id, CancelCode::User);
        Ok(())
    }

    // Transactions

    /// Starts a SAS verification with one device over to-device messages and
    /// returns its transaction id, generated unless given.
    pub async fn begin_verification(
        &self,
        method: VerificationMethod,
        other_user_id: &str,
        other_device_id: &str,
        transaction_id: Option<&str>,
    ) -> Result<String, Error> {
        if method != VerificationMethod::Sas {
            return Err(Error::UnknownMethod(method.value().to_string()));
        }

        let transaction_id = transaction_id
            .map(str::to_string)
            .unwrap_or_else(|| self.new_transaction_id(other_user_id, other_device_id));
        let transport = self.transport_for(other_user_id, None, Some(other_device_id));
        self.begin_sas(&transaction_id, other_user_id, other_device_id, transport).await?;
        Ok(transaction_id)
    }

    /// Starts a SAS verification in a room. `transaction_id` is the event id
    /// of the request.
    pub async fn begin_verification_in_room(
        &self,
        method: VerificationMethod,
        room_id: &str,
        other_user_id: &str,
        other_device_id: &str,
        transaction_id: &str,
    ) -> Result<String, Error> {
        if method != VerificationMethod::Sas {
            return Err(Error::UnknownMethod(method.value().to_string()));
        }

        let transport = self.transport_for(other_user_id, Some(room_id), Some(other_device_id));
        self.begin_sas(transaction_id, other_user_id, other_device_id, transport).await?;
        Ok(transaction_id.to_string())
    }

    async fn begin_sas(
        &self,
        transaction_id: &str,
        other_user_id: &str,
        other_device_id: &str,
        transport: Transport,
    ) -> Result<(), Error> {
        let params = self.params(transaction_id, other_user_id, Some(other_device_id), transport);
        let mut transaction = VerificationTransaction::new_outgoing_sas(params, self.inner.config.sas_offer());
        transaction.start()?;

        info!(%transaction_id, %other_user_id, %other_device_id, "Starting SAS verification");
        let mut registry = self.inner.registry.lock().await;
        self.register(&mut registry, transaction);
        self.mark_request_started(&mut registry, other_user_id, transaction_id);
        Ok(())
    }

    async fn with_transaction<T>(
        &self,
        other_user_id: &str,
        transaction_id: &str,
        method: TransactionMethod,
        f: impl FnOnce(&mut VerificationTransaction) -> T,
    ) -> Result<T, Error> {
        let mut registry = self.inner.registry.lock().await;
        match registry.transaction(other_user_id, transaction_id) {
            None => return Err(Error::UnknownTransaction),
            Some(tx) if tx.method() != method => {
                return Err(Error::UnknownMethod(format!("Not a {method:?} transaction")));
            }
            Some(_) => {}
        }

        let result = self
            .drive(&mut registry, other_user_id, transaction_id, f)
            .ok_or(Error::UnknownTransaction)?;
        self.mark_request_started(&mut registry, other_user_id, transaction_id);
        Ok(result)
    }

    /// Accepts an incoming SAS start.
    pub async fn accept_transaction(&self, other_user_id: &str, transaction_id: &str) -> Result<(), Error> {
        self.with_transaction(other_user_id, transaction_id, TransactionMethod::Sas, |tx| tx.perform_accept())
            .await?
    }

    /// The user confirmed both devices show the same short code.
    pub async fn user_has_verified_short_code(&self, other_user_id: &str, transaction_id: &str) -> Result<(), Error> {
        self.with_transaction(other_user_id, transaction_id, TransactionMethod::Sas, |tx| {
            tx.user_has_verified_short_code()
        })
        .await
    }

    /// The user said the short codes differ.
    pub async fn short_code_does_not_match(&self, other_user_id: &str, transaction_id: &str) -> Result<(), Error> {
        self.with_transaction(other_user_id, transaction_id, TransactionMethod::Sas, |tx| {
            tx.short_code_does_not_match()
        })
        .await
    }

    /// The user scanned the peer's QR code, given as its Latin-1 text.
    pub async fn user_has_scanned_other_qr_code(
        &self,
        other_user_id: &str,
        transaction_id: &str,
        text: &str,
    ) -> Result<(), Error> {
        self.with_transaction(other_user_id, transaction_id, TransactionMethod::QrCode, |tx| {
            tx.user_has_scanned_other_qr_code(text)
        })
        .await?
    }

    /// The user confirmed the peer scanned our QR code.
    pub async fn other_user_scanned_my_qr_code(&self, other_user_id: &str, transaction_id: &str) -> Result<(), Error> {
        self.with_transaction(other_user_id, transaction_id, TransactionMethod::QrCode, |tx| {
            tx.other_user_scanned_my_qr_code()
        })
        .await?
    }

    /// The user said the peer did not scan our QR code.
    pub async fn other_user_did_not_scan_my_qr_code(&self, other_user_id: &str, transaction_id: &str) -> Result<(), Error> {
        self.with_transaction(other_user_id, transaction_id, TransactionMethod::QrCode, |tx| {
            tx.other_user_did_not_scan_my_qr_code()
        })
        .await
    }

    /// Cancels a transaction of any method.
    pub async fn cancel_transaction(&self, other_user_id: &str, transaction_id: &str, code: CancelCode) -> Result<(), Error> {
        let mut registry = self.inner.registry.lock().await;
        self.drive(&mut registry, other_user_id, transaction_id, |tx| tx.cancel(code))
            .ok_or(Error::UnknownTransaction)
    }

    /// Trusts a device without running the protocol.
    pub fn mark_locally_as_manually_verified(&self, user_id: &str, device_id: &str) {
        info!(%user_id, %device_id, "Device manually verified");
        self.inner.device_store.mark_verified(user_id, device_id);
        self.notify(Notification::ManuallyVerified {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        });
    }

    // Accessors

    pub async fn existing_transaction(&self, other_user_id: &str, transaction_id: &str) -> Option<TransactionSnapshot> {
        let registry = self.inner.registry.lock().await;
        registry
            .transaction(other_user_id, transaction_id)
            .map(VerificationTransaction::snapshot)
    }

    pub async fn existing_transactions_for_user(&self, other_user_id: &str) -> Vec<TransactionSnapshot> {
        let registry = self.inner.registry.lock().await;
        registry
            .transactions_for_user(other_user_id)
            .map(VerificationTransaction::snapshot)
            .collect()
    }

    pub async fn existing_verification_request(
        &self,
        other_user_id: &str,
        transaction_id: &str,
    ) -> Option<PendingVerificationRequest> {
        let registry = self.inner.registry.lock().await;
        registry.request(other_user_id, transaction_id).cloned()
    }

    pub async fn existing_verification_requests(&self, other_user_id: &str) -> Vec<PendingVerificationRequest> {
        let registry = self.inner.registry.lock().await;
        registry.requests_for_user(other_user_id).to_vec()
    }

    pub async fn existing_verification_request_in_room(
        &self,
        room_id: &str,
        transaction_id: &str,
    ) -> Option<PendingVerificationRequest> {
        let registry = self.inner.registry.lock().await;
        registry.request_in_room(room_id, transaction_id).cloned()
    }
}

/// Sends queued messages one at a time and reports each delivery back.
fn spawn_outbound_worker(inner: Weak<Inner>, mut jobs: mpsc::UnboundedReceiver<OutboundJob>) {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            match job {
                OutboundJob::Cancel {
                    transport,
                    transaction_id,
                    code,
                } => transport.cancel_transaction(&transaction_id, code).await,
                OutboundJob::Transaction { transport, outgoing, .. } if outgoing.is_best_effort() => {
                    match &outgoing.info {
                        VerificationInfo::Cancel(cancel) => {
                            transport.cancel_transaction(&cancel.transaction_id, cancel.code).await;
                        }
                        VerificationInfo::Done(done) => transport.done(&done.transaction_id).await,
                        info => {
                            if let Err(err) = transport.send(info).await {
                                warn!(transaction_id = %info.transaction_id(), error = %err, "Failed to send message");
                            }
                        }
                    }
                }
                OutboundJob::Transaction {
                    other_user_id,
                    transaction_id,
                    generation,
                    transport,
                    outgoing,
                } => {
                    let delivered = match transport.send(&outgoing.info).await {
                        Ok(_) => true,
                        Err(err) => {
                            warn!(%transaction_id, error = %err, "Failed to deliver message");
                            false
                        }
                    };

                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    VerificationService { inner }
                        .on_delivery(&other_user_id, &transaction_id, generation, &outgoing, delivered)
                        .await;
                }
            }
        }
        debug!("Outbound worker stopped");
    });
}
