//! Connection engine.
//!
//! A `Connection` is an actor that owns the framed transport. Everything
//! else talks to it through a cloneable [`ConnectionHandle`].
//!
//! # Ordering
//!
//! - Frames are read and handled in arrival order.
//! - Each incoming `call` runs on its own task so a slow handler never
//!   blocks the reader; responses may therefore complete out of order.
//! - Incoming `cast`s run one at a time, in arrival order, on a dedicated
//!   task. Cast handlers may issue calls on the same connection.
//!
//! # Teardown
//!
//! Whatever stops the main loop, every outstanding call resolves to
//! [`CallError::Down`] exactly once and later calls fail immediately.

use crate::dispatch::{Args, HandlerRegistry};
use crate::errors::{CallError, CloseReason};
use crate::heartbeat::{Heartbeat, LatencyStats, Tick};
use crate::stream::PacketStream;

use relay_protocol::packet::{
    CallException, CallRequest, CallResponse, CastRequest, EXCEPTION_UNKNOWN,
};
use relay_protocol::{op, Packet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Default heartbeat interval when none is negotiated.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound packet queue depth.
const OUTBOUND_BUFFER: usize = 256;

/// Floor applied to the heartbeat interval (tokio intervals reject zero).
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Peer label used in logs, e.g. the worker id or the control address.
    pub label: String,
    /// Interval between pings.
    pub heartbeat_interval: Duration,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

struct PendingCall {
    method: String,
    respond_to: oneshot::Sender<Result<Value, CallError>>,
}

#[derive(Default)]
struct PendingCalls {
    next_ref: u64,
    calls: HashMap<u64, PendingCall>,
    closed: bool,
}

impl PendingCalls {
    /// Resolve every outstanding call to `Down`. Only the first invocation
    /// has any effect.
    fn fail_all(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;

        let count = self.calls.len();
        for (_, call) in self.calls.drain() {
            let _ = call.respond_to.send(Err(CallError::Down {
                method: call.method,
            }));
        }
        count
    }
}

struct Shared {
    label: String,
    remote_info: Value,
    outbound: mpsc::Sender<Packet>,
    pending: Mutex<PendingCalls>,
    latency: Mutex<LatencyStats>,
    /// Cancelled to request shutdown.
    shutdown: CancellationToken,
    /// Cancelled once teardown has completed.
    closed: CancellationToken,
}

/// Handle to a running [`Connection`].
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("label", &self.shared.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Peer label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Capability info the peer sent during the handshake.
    #[must_use]
    pub fn remote_info(&self) -> &Value {
        &self.shared.remote_info
    }

    /// Invoke `method` on the peer and wait for its result.
    ///
    /// With a `timeout`, an unanswered call resolves to
    /// [`CallError::Timeout`] and a late response is discarded.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();

        let reference = {
            let mut pending = self.shared.pending.lock().await;
            if pending.closed {
                return Err(CallError::Down {
                    method: method.to_string(),
                });
            }
            let reference = pending.next_ref;
            pending.next_ref = pending.next_ref.wrapping_add(1);
            pending.calls.insert(
                reference,
                PendingCall {
                    method: method.to_string(),
                    respond_to: tx,
                },
            );
            reference
        };

        let request = CallRequest {
            method: method.to_string(),
            reference,
            args,
        };
        let packet = match Packet::from_payload(op::CALL, &request) {
            Ok(packet) => packet,
            Err(e) => {
                self.forget(reference).await;
                return Err(CallError::Serialization(e.to_string()));
            }
        };

        if self.shared.outbound.send(packet).await.is_err() {
            self.forget(reference).await;
            return Err(CallError::Down {
                method: method.to_string(),
            });
        }

        let outcome = match timeout {
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, rx).await {
                    outcome
                } else {
                    self.forget(reference).await;
                    debug!(
                        target: "relay.rpc.connection",
                        peer = %self.shared.label,
                        method = %method,
                        reference,
                        "Call timed out"
                    );
                    return Err(CallError::Timeout {
                        method: method.to_string(),
                    });
                }
            }
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(CallError::Down {
                method: method.to_string(),
            })
        })
    }

    /// [`call`](Self::call) and decode the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<T, CallError> {
        let value = self.call(method, args, timeout).await?;
        serde_json::from_value(value).map_err(|e| CallError::Serialization(e.to_string()))
    }

    /// Fire-and-forget invocation. Fails only if the connection is gone.
    pub async fn cast(&self, method: &str, args: Vec<Value>) -> Result<(), CallError> {
        let request = CastRequest {
            method: method.to_string(),
            args,
        };
        self.send_payload(op::CAST, &request).await.map_err(|()| {
            CallError::Down {
                method: method.to_string(),
            }
        })
    }

    /// Recent round-trip measurements.
    pub async fn latency(&self) -> LatencyStats {
        *self.shared.latency.lock().await
    }

    /// Ask the connection to stop.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    /// Whether teardown has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until teardown has completed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    async fn forget(&self, reference: u64) {
        self.shared.pending.lock().await.calls.remove(&reference);
    }

    async fn send_payload<T: Serialize>(&self, op: &str, payload: &T) -> Result<(), ()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(());
        }

        let packet = Packet::from_payload(op, payload).map_err(|e| {
            warn!(
                target: "relay.rpc.connection",
                peer = %self.shared.label,
                op = %op,
                error = %e,
                "Failed to encode outgoing packet"
            );
        })?;

        self.shared.outbound.send(packet).await.map_err(|_| ())
    }
}

/// The connection actor.
pub struct Connection<S> {
    stream: PacketStream<S>,
    shared: Arc<Shared>,
    outbound_rx: mpsc::Receiver<Packet>,
    handlers: Arc<HandlerRegistry>,
    heartbeat: Heartbeat,
    heartbeat_interval: Duration,
    calls_in_flight: JoinSet<()>,
    casts: mpsc::UnboundedSender<CastRequest>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Start the main loop on an already-authenticated stream.
    ///
    /// Cancelling `cancel_token` (or calling [`ConnectionHandle::close`])
    /// stops the connection with [`CloseReason::Shutdown`]. The join handle
    /// yields the close reason once teardown is done.
    pub fn spawn(
        stream: PacketStream<S>,
        remote_info: Value,
        handlers: Arc<HandlerRegistry>,
        options: ConnectionOptions,
        cancel_token: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<CloseReason>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        let shared = Arc::new(Shared {
            label: options.label,
            remote_info,
            outbound,
            pending: Mutex::new(PendingCalls::default()),
            latency: Mutex::new(LatencyStats::default()),
            shutdown: cancel_token,
            closed: CancellationToken::new(),
        });
        let handle = ConnectionHandle {
            shared: Arc::clone(&shared),
        };

        let (casts, cast_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_casts(cast_rx, handle.clone(), Arc::clone(&handlers)));

        let connection = Self {
            stream,
            shared,
            outbound_rx,
            handlers,
            heartbeat: Heartbeat::new(),
            heartbeat_interval: options.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            calls_in_flight: JoinSet::new(),
            casts,
        };

        let task = tokio::spawn(connection.run());
        (handle, task)
    }

    #[instrument(skip_all, name = "relay.rpc.connection", fields(peer = %self.shared.label))]
    async fn run(mut self) -> CloseReason {
        debug!(
            target: "relay.rpc.connection",
            peer = %self.shared.label,
            heartbeat_secs = self.heartbeat_interval.as_secs_f64(),
            "Connection started"
        );

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                () = self.shared.shutdown.cancelled() => {
                    break CloseReason::Shutdown;
                }

                _ = ticker.tick() => {
                    if let Err(reason) = self.on_heartbeat_tick().await {
                        break reason;
                    }
                }

                Some(packet) = self.outbound_rx.recv() => {
                    if let Err(e) = self.stream.write_packet(packet).await {
                        break CloseReason::Transport(e.to_string());
                    }
                }

                Some(joined) = self.calls_in_flight.join_next(), if !self.calls_in_flight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(
                                target: "relay.rpc.connection",
                                peer = %self.shared.label,
                                "Call handler panicked"
                            );
                        }
                    }
                }

                frame = self.stream.next() => {
                    match frame {
                        Ok(Some(packet)) => {
                            if let Err(reason) = self.handle_packet(packet).await {
                                break reason;
                            }
                        }
                        Ok(None) => break CloseReason::Eof,
                        Err(e) => break CloseReason::Transport(e.to_string()),
                    }
                }
            }
        };

        self.teardown(&reason).await;
        reason
    }

    async fn on_heartbeat_tick(&mut self) -> Result<(), CloseReason> {
        match self.heartbeat.on_tick(Instant::now()) {
            Tick::SendPing => self.write(Packet::new(op::PING, Value::Bool(true))).await,
            Tick::Missed => {
                warn!(
                    target: "relay.rpc.connection",
                    peer = %self.shared.label,
                    "Ping timeout"
                );
                Err(CloseReason::PingTimeout)
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), CloseReason> {
        match packet.op.as_str() {
            op::PING => self.write(Packet::new(op::PONG, packet.data)).await,
            op::PONG => {
                if let Some(latency) = self.heartbeat.on_pong(Instant::now()) {
                    *self.shared.latency.lock().await = self.heartbeat.stats();
                    trace!(
                        target: "relay.rpc.connection",
                        peer = %self.shared.label,
                        latency_ms = latency.as_secs_f64() * 1000.0,
                        "Pong"
                    );
                }
                Ok(())
            }
            op::CALL => self.handle_call(&packet).await,
            op::CALL_RESPONSE => self.handle_call_response(&packet).await,
            op::CAST => self.handle_cast(&packet),
            other => {
                warn!(
                    target: "relay.rpc.connection",
                    peer = %self.shared.label,
                    op = %other,
                    "Unexpected opcode"
                );
                Ok(())
            }
        }
    }

    async fn handle_call(&mut self, packet: &Packet) -> Result<(), CloseReason> {
        let request: CallRequest = packet
            .payload()
            .map_err(|e| CloseReason::Protocol(e.to_string()))?;

        let Some(handler) = self.handlers.call_handler(&request.method) else {
            debug!(
                target: "relay.rpc.connection",
                peer = %self.shared.label,
                method = %request.method,
                "No handler for call"
            );
            let response = CallResponse::not_exists(request.reference);
            let packet = Packet::from_payload(op::CALL_RESPONSE, &response)
                .map_err(|e| CloseReason::Protocol(e.to_string()))?;
            return self.write(packet).await;
        };

        let conn = ConnectionHandle {
            shared: Arc::clone(&self.shared),
        };
        self.calls_in_flight.spawn(async move {
            let CallRequest {
                method,
                reference,
                args,
            } = request;

            let response = match handler(conn.clone(), Args::new(args)).await {
                Ok(result) => CallResponse::ok(reference, result),
                Err(e) => {
                    warn!(
                        target: "relay.rpc.connection",
                        peer = %conn.label(),
                        method = %method,
                        error = %e,
                        "Call handler failed"
                    );
                    CallResponse::failed(reference, e.to_string())
                }
            };

            let _ = conn.send_payload(op::CALL_RESPONSE, &response).await;
        });

        Ok(())
    }

    async fn handle_call_response(&mut self, packet: &Packet) -> Result<(), CloseReason> {
        let response: CallResponse = packet
            .payload()
            .map_err(|e| CloseReason::Protocol(e.to_string()))?;

        let pending = self
            .shared
            .pending
            .lock()
            .await
            .calls
            .remove(&response.reference);

        let Some(call) = pending else {
            debug!(
                target: "relay.rpc.connection",
                peer = %self.shared.label,
                reference = response.reference,
                "Response for unknown or expired call"
            );
            return Ok(());
        };

        let outcome = match (response.result, response.exception) {
            (Some(result), _) => Ok(result),
            (None, Some(CallException::Message { message })) => Err(CallError::Remote { message }),
            (None, Some(CallException::Code(code))) if code == EXCEPTION_UNKNOWN => {
                Err(CallError::Unknown {
                    method: call.method,
                })
            }
            (None, _) => Err(CallError::NotFound {
                method: call.method,
            }),
        };

        let _ = call.respond_to.send(outcome);
        Ok(())
    }

    fn handle_cast(&mut self, packet: &Packet) -> Result<(), CloseReason> {
        let request: CastRequest = packet
            .payload()
            .map_err(|e| CloseReason::Protocol(e.to_string()))?;
        let _ = self.casts.send(request);
        Ok(())
    }

    async fn write(&mut self, packet: Packet) -> Result<(), CloseReason> {
        self.stream
            .write_packet(packet)
            .await
            .map_err(|e| CloseReason::Transport(e.to_string()))
    }

    async fn teardown(&mut self, reason: &CloseReason) {
        self.shared.shutdown.cancel();
        let failed_calls = self.shared.pending.lock().await.fail_all();
        self.calls_in_flight.abort_all();
        self.shared.closed.cancel();

        info!(
            target: "relay.rpc.connection",
            peer = %self.shared.label,
            reason = %reason,
            failed_calls,
            "Connection closed"
        );
    }
}

async fn run_casts(
    mut receiver: mpsc::UnboundedReceiver<CastRequest>,
    conn: ConnectionHandle,
    handlers: Arc<HandlerRegistry>,
) {
    while let Some(request) = receiver.recv().await {
        let Some(handler) = handlers.cast_handler(&request.method) else {
            warn!(
                target: "relay.rpc.connection",
                peer = %conn.label(),
                method = %request.method,
                "No handler for cast"
            );
            continue;
        };

        if let Err(e) = handler(conn.clone(), Args::new(request.args)).await {
            warn!(
                target: "relay.rpc.connection",
                peer = %conn.label(),
                method = %request.method,
                error = %e,
                "Cast handler failed"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::HandlerError;
    use serde_json::json;
    use tokio::io::DuplexStream;

    fn pair(
        left_handlers: HandlerRegistry,
        right_handlers: HandlerRegistry,
    ) -> (
        (ConnectionHandle, JoinHandle<CloseReason>),
        (ConnectionHandle, JoinHandle<CloseReason>),
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = spawn_on(a, "left", left_handlers);
        let right = spawn_on(b, "right", right_handlers);
        (left, right)
    }

    fn spawn_on(
        io: DuplexStream,
        label: &str,
        handlers: HandlerRegistry,
    ) -> (ConnectionHandle, JoinHandle<CloseReason>) {
        Connection::spawn(
            PacketStream::new(io),
            json!({"label": label}),
            Arc::new(handlers),
            ConnectionOptions::new(label),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_call("add", |_conn, args| async move {
            let a: i64 = args.get(0, "a")?;
            let b: i64 = args.get(1, "b")?;
            Ok::<_, HandlerError>(json!(a + b))
        });

        let ((left, _lt), (_right, _rt)) = pair(HandlerRegistry::new(), handlers);

        let sum: i64 = left
            .call_as("add", vec![json!(2), json!(3)], None)
            .await
            .unwrap();
        assert_eq!(sum, 5);
    }

    #[tokio::test]
    async fn test_null_result_is_success() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_call("nothing", |_conn, _args| async { Ok(Value::Null) });
        let ((left, _lt), (_right, _rt)) = pair(HandlerRegistry::new(), handlers);

        let value = left.call("nothing", vec![], None).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_call_to_unregistered_method_is_not_found() {
        let ((left, _lt), (_right, _rt)) = pair(HandlerRegistry::new(), HandlerRegistry::new());

        let err = left.call("missing", vec![], None).await.unwrap_err();
        assert_eq!(
            err,
            CallError::NotFound {
                method: "missing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported_with_message() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_call("explode", |_conn, _args| async {
            Err::<Value, _>(HandlerError::Failed("no resource".to_string()))
        });
        let ((left, _lt), (right, _rt)) = pair(HandlerRegistry::new(), handlers);

        let err = left.call("explode", vec![], None).await.unwrap_err();
        assert_eq!(
            err,
            CallError::Remote {
                message: "no resource".to_string()
            }
        );

        // The connection survives a failing handler.
        assert!(!right.is_closed());
        let err = left.call("missing", vec![], None).await.unwrap_err();
        assert!(matches!(err, CallError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_discards_late_response() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_call("slow", |_conn, _args| async {
            tokio::time::sleep(Duration::from_secs(20)).await;
            Ok(json!("late"))
        });
        handlers.on_call("fast", |_conn, _args| async { Ok(json!("fast")) });
        let ((left, _lt), (_right, _rt)) = pair(HandlerRegistry::new(), handlers);

        let err = left
            .call("slow", vec![], Some(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CallError::Timeout {
                method: "slow".to_string()
            }
        );

        tokio::time::sleep(Duration::from_secs(15)).await;

        // Late response is dropped and later calls correlate correctly.
        let value = left.call("fast", vec![], None).await.unwrap();
        assert_eq!(value, json!("fast"));
    }

    #[tokio::test]
    async fn test_pending_calls_resolve_down_on_close() {
        let mut handlers = HandlerRegistry::new();
        handlers.on_call("hang", |_conn, _args| async {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        });
        let ((left, left_task), (right, _rt)) = pair(HandlerRegistry::new(), handlers);

        let caller = left.clone();
        let first = tokio::spawn(async move { caller.call("hang", vec![], None).await });
        let caller = left.clone();
        let second = tokio::spawn(async move { caller.call("hang", vec![], None).await });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        right.close();

        assert!(matches!(
            first.await.unwrap(),
            Err(CallError::Down { .. })
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(CallError::Down { .. })
        ));
        assert_eq!(left_task.await.unwrap(), CloseReason::Eof);

        let err = left.call("hang", vec![], None).await.unwrap_err();
        assert!(matches!(err, CallError::Down { .. }));
    }

    #[tokio::test]
    async fn test_casts_are_handled_in_order() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let mut handlers = HandlerRegistry::new();
        handlers.on_cast("note", move |_conn, args| {
            let seen_tx = seen_tx.clone();
            async move {
                let n: u32 = args.get(0, "n")?;
                // Later casts must wait for earlier ones even if those yield.
                tokio::task::yield_now().await;
                let _ = seen_tx.send(n);
                Ok::<_, HandlerError>(())
            }
        });
        let ((left, _lt), (_right, _rt)) = pair(HandlerRegistry::new(), handlers);

        for n in 0..10u32 {
            left.cast("note", vec![json!(n)]).await.unwrap();
        }

        for expected in 0..10u32 {
            assert_eq!(seen_rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_cast_handler_can_call_back() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut right_handlers = HandlerRegistry::new();
        right_handlers.on_cast("poke", move |conn, _args| {
            let done_tx = done_tx.clone();
            async move {
                let name: String = conn
                    .call_as("whoami", vec![], Some(Duration::from_secs(5)))
                    .await
                    .map_err(|e| HandlerError::Failed(e.to_string()))?;
                let _ = done_tx.send(name);
                Ok::<_, HandlerError>(())
            }
        });

        let mut left_handlers = HandlerRegistry::new();
        left_handlers.on_call("whoami", |_conn, _args| async { Ok(json!("left")) });

        let ((left, _lt), (_right, _rt)) = pair(left_handlers, right_handlers);
        left.cast("poke", vec![]).await.unwrap();

        assert_eq!(done_rx.recv().await.unwrap(), "left");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_closes_with_ping_timeout() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (handle, task) = Connection::spawn(
            PacketStream::new(a),
            Value::Null,
            Arc::new(HandlerRegistry::new()),
            ConnectionOptions::new("silent-peer").with_heartbeat_interval(Duration::from_secs(30)),
            CancellationToken::new(),
        );

        // Peer reads but never answers.
        let mut silent = PacketStream::new(b);
        let drain = tokio::spawn(async move { while let Ok(Some(_)) = silent.next().await {} });

        let reason = task.await.unwrap();
        assert_eq!(reason, CloseReason::PingTimeout);
        assert!(handle.is_closed());
        drain.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_healthy_connection_open() {
        let ((left, _lt), (right, _rt)) = pair(HandlerRegistry::new(), HandlerRegistry::new());

        tokio::time::sleep(Duration::from_secs(95)).await;

        assert!(!left.is_closed());
        assert!(!right.is_closed());
        assert!(left.latency().await.samples >= 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let ((left, left_task), (_right, _rt)) = pair(HandlerRegistry::new(), HandlerRegistry::new());

        left.close();
        left.close();
        assert_eq!(left_task.await.unwrap(), CloseReason::Shutdown);
        left.closed().await;
        assert!(left.is_closed());
        assert!(left.cast("anything", vec![]).await.is_err());
    }

    #[test]
    fn test_fail_all_runs_once() {
        let mut pending = PendingCalls::default();
        let (tx, mut rx) = oneshot::channel();
        pending.calls.insert(
            0,
            PendingCall {
                method: "play".to_string(),
                respond_to: tx,
            },
        );

        assert_eq!(pending.fail_all(), 1);
        assert_eq!(pending.fail_all(), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CallError::Down {
                method: "play".to_string()
            })
        );
    }
}
