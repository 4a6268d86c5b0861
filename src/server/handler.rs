//! Per-connection streaming protocol, independent of the transport.
//!
//! The transport feeds [`Inbound`] items in and drains [`Outbound`] items.
//! Audio goes to the active worker without waiting; results come back on a
//! separate pump task so output never waits on input. On `stop` or
//! disconnect the pending utterance is flushed and relayed before the
//! session is released.

use crate::audio::AudioChunk;
use crate::defaults::{MAX_AUDIO_CHUNK_BYTES, STOP_DRAIN_TIMEOUT_MS};
use crate::error::{LivescribeError, Result};
use crate::moderation::{FinalSegment, ModerationRelay};
use crate::server::AppState;
use crate::server::messages::{ClientMessage, ServerMessage};
use crate::worker::{AudioFrame, InputQueue, Subscription, WorkerInput, WorkerResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The client broke the protocol.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// What the transport received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

/// What the transport should send.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
enum PumpEvent {
    /// The worker's output queue closed under binding `binding`.
    OutputClosed { binding: u64 },
}

struct Binding {
    id: u64,
    model: &'static str,
    session_id: String,
    sample_rate: u32,
    input: InputQueue,
    /// Flushes sent under this binding.
    flushes: u64,
    /// Flush count after which the pump finishes.
    drain: watch::Sender<Option<u64>>,
    pump: JoinHandle<()>,
}

impl Binding {
    /// Ask the worker to finalize this session. Returns the flush count.
    fn flush(&mut self) -> Result<u64> {
        self.input.put_nowait(WorkerInput::Flush {
            session_id: Some(self.session_id.clone()),
        })?;
        self.flushes += 1;
        Ok(self.flushes)
    }

    /// Flush, then wait until the pump has relayed the answer. Returns
    /// `false` if the worker is gone or `timeout` passed first.
    async fn drain(&mut self, timeout: Duration) -> bool {
        self.drain.send_replace(Some(self.flushes + 1));
        if self.flush().is_err() {
            return false;
        }
        tokio::time::timeout(timeout, &mut self.pump).await.is_ok()
    }
}

enum Phase {
    AwaitingConfig,
    Streaming(Binding),
    Closed,
}

pub struct StreamingProtocolHandler {
    state: Arc<AppState>,
    out: mpsc::UnboundedSender<Outbound>,
    phase: Phase,
    /// Session to resume, or the one last bound.
    session_id: Option<String>,
    bindings: u64,
    events_tx: mpsc::UnboundedSender<PumpEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<PumpEvent>>,
}

impl StreamingProtocolHandler {
    pub fn new(state: Arc<AppState>, out: mpsc::UnboundedSender<Outbound>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state,
            out,
            phase: Phase::AwaitingConfig,
            session_id: None,
            bindings: 0,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Process inbound items until the client leaves or the connection is
    /// closed by the protocol.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        loop {
            tokio::select! {
                item = inbound.recv() => match item {
                    Some(Inbound::Text(text)) => self.on_text(&text).await,
                    Some(Inbound::Binary(bytes)) => self.on_binary(bytes),
                    Some(Inbound::Closed) | None => break,
                },
                Some(event) = events.recv() => self.on_pump_event(event),
            }
            if matches!(self.phase, Phase::Closed) {
                break;
            }
        }
        self.teardown().await;
    }

    fn send(&self, message: ServerMessage) {
        if self.out.send(Outbound::Message(message)).is_err() {
            debug!("client gone, dropping message");
        }
    }

    fn send_error(&self, error: &LivescribeError) {
        self.send(ServerMessage::error(error));
    }

    fn close(&mut self, code: u16, reason: &str) {
        if self
            .out
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_err()
        {
            debug!("client gone before close");
        }
        self.unbind();
        self.phase = Phase::Closed;
    }

    async fn on_text(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed client message");
                self.send_error(&e);
                self.close(CLOSE_POLICY_VIOLATION, "malformed message");
                return;
            }
        };

        match message {
            ClientMessage::Config { model, sample_rate } => self.configure(&model, sample_rate).await,
            ClientMessage::StartSession { session_id } => self.start_session(session_id),
            ClientMessage::Reset => self.forward_control(WorkerInput::Reset),
            ClientMessage::Flush => self.flush(),
            ClientMessage::Stop => self.stop().await,
            ClientMessage::SwitchModel { model } => self.switch_model(&model).await,
            ClientMessage::Ping => self.send(ServerMessage::pong()),
        }
    }

    fn on_binary(&mut self, bytes: Vec<u8>) {
        let Phase::Streaming(binding) = &self.phase else {
            debug!(bytes = bytes.len(), "audio before config dropped");
            self.send_error(&LivescribeError::NotConfigured);
            return;
        };
        if bytes.len() > MAX_AUDIO_CHUNK_BYTES {
            warn!(session = %binding.session_id, bytes = bytes.len(), "oversized audio chunk rejected");
            self.send_error(&LivescribeError::InvalidAudio {
                message: format!(
                    "chunk of {} bytes exceeds the {MAX_AUDIO_CHUNK_BYTES} byte limit",
                    bytes.len()
                ),
            });
            return;
        }

        match self.state.sessions.validate(&binding.session_id) {
            Ok(session) if session.is_active => {}
            Ok(_) => {
                let model = binding.model;
                self.lose_model(model);
                return;
            }
            Err(e) => {
                self.send_error(&e);
                self.close(CLOSE_POLICY_VIOLATION, "session expired");
                return;
            }
        }

        let chunk = match AudioChunk::mono(bytes, binding.sample_rate) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.send_error(&e);
                return;
            }
        };
        let frame = AudioFrame {
            session_id: Some(binding.session_id.clone()),
            chunk,
        };
        if binding.input.put_nowait(WorkerInput::Audio(frame)).is_err() {
            let model = binding.model;
            self.lose_model(model);
        }
    }

    fn forward_control(&mut self, item: WorkerInput) {
        let Phase::Streaming(binding) = &self.phase else {
            self.send_error(&LivescribeError::NotConfigured);
            return;
        };
        if binding.input.put_nowait(item).is_err() {
            let model = binding.model;
            self.lose_model(model);
        }
    }

    fn flush(&mut self) {
        let Phase::Streaming(binding) = &mut self.phase else {
            self.send_error(&LivescribeError::NotConfigured);
            return;
        };
        if binding.flush().is_err() {
            let model = binding.model;
            self.lose_model(model);
        }
    }

    /// Relay whatever the worker still holds for this session.
    async fn drain_binding(&mut self) {
        let timeout = Duration::from_millis(STOP_DRAIN_TIMEOUT_MS);
        if let Phase::Streaming(binding) = &mut self.phase
            && !binding.drain(timeout).await
        {
            warn!(session = %binding.session_id, "pending results not relayed before release");
        }
    }

    fn on_pump_event(&mut self, event: PumpEvent) {
        let PumpEvent::OutputClosed { binding } = event;
        if let Phase::Streaming(current) = &self.phase
            && current.id == binding
        {
            let model = current.model;
            self.lose_model(model);
        }
    }

    /// The worker went away underneath this connection.
    fn lose_model(&mut self, model: &str) {
        warn!(model, "active model became unavailable");
        self.send_error(&LivescribeError::ModelNotActive {
            model: model.to_string(),
        });
        if let Some(id) = self.unbind()
            && let Err(e) = self.state.sessions.deactivate(&id)
        {
            debug!(error = %e, "session already gone");
        }
    }

    /// Drop the current binding. Returns its session id.
    fn unbind(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.phase, Phase::AwaitingConfig) {
            Phase::Streaming(binding) => {
                binding.pump.abort();
                Some(binding.session_id)
            }
            Phase::AwaitingConfig => None,
            Phase::Closed => {
                self.phase = Phase::Closed;
                None
            }
        }
    }

    async fn configure(&mut self, name: &str, sample_rate: Option<u32>) {
        let model = match self.state.supervisor.catalog().resolve(name) {
            Ok(model) => model,
            Err(e) => return self.send_error(&e),
        };
        if let Some(rate) = sample_rate
            && rate != model.sample_rate
        {
            return self.send_error(&LivescribeError::InvalidAudio {
                message: format!("model '{}' expects {} Hz, got {rate} Hz", model.id, model.sample_rate),
            });
        }

        if let Err(e) = self.state.switch_model(model.id, false).await {
            warn!(model = model.id, error = %e, "config failed to start model");
            return self.send_error(&e);
        }
        self.unbind();
        if let Err(e) = self.bind(model.id, model.sample_rate) {
            self.send_error(&e);
            if matches!(e, LivescribeError::SessionExpired { .. }) {
                self.close(CLOSE_POLICY_VIOLATION, "session expired");
            }
        }
    }

    fn start_session(&mut self, session_id: String) {
        if let Err(e) = self.state.sessions.validate(&session_id) {
            self.send_error(&e);
            if matches!(e, LivescribeError::SessionExpired { .. }) {
                self.close(CLOSE_POLICY_VIOLATION, "session expired");
            }
            return;
        }

        let rebind = match &self.phase {
            Phase::Streaming(binding) => Some((binding.model, binding.sample_rate)),
            _ => None,
        };
        if let Some(previous) = self.unbind()
            && previous != session_id
            && let Err(e) = self.state.sessions.deactivate(&previous)
        {
            debug!(error = %e, "previous session already gone");
        }
        self.session_id = Some(session_id);

        if let Some((model, sample_rate)) = rebind
            && let Err(e) = self.bind(model, sample_rate)
        {
            self.send_error(&e);
        }
    }

    async fn switch_model(&mut self, name: &str) {
        let switch = match self.state.switch_model(name, false).await {
            Ok(switch) => switch,
            Err(e) => {
                // The previous model keeps serving this connection.
                return self.send_error(&e);
            }
        };
        info!(previous = ?switch.previous, current = %switch.current, "client switched model");

        let model = match self.state.supervisor.catalog().resolve(&switch.current) {
            Ok(model) => model,
            Err(e) => return self.send_error(&e),
        };
        if matches!(self.phase, Phase::Streaming(_)) || self.session_id.is_some() {
            self.unbind();
            if let Err(e) = self.bind(model.id, model.sample_rate) {
                return self.send_error(&e);
            }
        }
        self.send(ServerMessage::model_switched(switch.previous, &switch.current));
    }

    async fn stop(&mut self) {
        self.drain_binding().await;
        self.close(CLOSE_NORMAL, "session stopped");
        self.release_session().await;
    }

    /// Attach or create the session and start relaying results.
    fn bind(&mut self, model: &'static str, sample_rate: u32) -> Result<()> {
        let ttl = i64::from(self.state.config.session.ttl_hours);
        let session = match &self.session_id {
            Some(id) => self.state.sessions.attach(id, model)?,
            None => self.state.sessions.create(model, ttl)?,
        };
        self.session_id = Some(session.id.clone());

        let Some(queues) = self.state.supervisor.get_active_queues(model) else {
            self.state.sessions.deactivate(&session.id)?;
            return Err(LivescribeError::ModelNotActive {
                model: model.to_string(),
            });
        };
        let results = queues.output.subscribe(&session.id);
        queues.input.put_nowait(WorkerInput::Reset)?;

        self.bindings += 1;
        let (drain, drain_rx) = watch::channel(None);
        let pump = tokio::spawn(pump_results(
            results,
            drain_rx,
            Pump {
                binding: self.bindings,
                session_id: session.id.clone(),
                model: model.to_string(),
                state: Arc::clone(&self.state),
                out: self.out.clone(),
                events: self.events_tx.clone(),
            },
        ));
        self.phase = Phase::Streaming(Binding {
            id: self.bindings,
            model,
            session_id: session.id.clone(),
            sample_rate,
            input: queues.input,
            flushes: 0,
            drain,
            pump,
        });
        info!(session = %session.id, model, "streaming");
        self.send(ServerMessage::ready(&session.id, model));
        Ok(())
    }

    /// Deactivate this connection's session and, if configured, stop a model
    /// nobody uses any more.
    async fn release_session(&mut self) {
        let model = match &self.phase {
            Phase::Streaming(binding) => Some(binding.model),
            _ => None,
        };
        self.unbind();
        let Some(id) = self.session_id.take() else {
            return;
        };
        let bound_model = self
            .state
            .sessions
            .get(&id)
            .map(|s| s.model_id)
            .or(model.map(str::to_string));
        if let Err(e) = self.state.sessions.deactivate(&id) {
            debug!(error = %e, "session already gone");
        }
        if let Some(model) = bound_model {
            self.state.release_if_idle(&model).await;
        }
    }

    async fn teardown(&mut self) {
        self.drain_binding().await;
        self.release_session().await;
        self.phase = Phase::Closed;
        debug!("connection closed");
    }
}

struct Pump {
    binding: u64,
    session_id: String,
    model: String,
    state: Arc<AppState>,
    out: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<PumpEvent>,
}

impl Pump {
    fn send(&self, message: ServerMessage) {
        if self.out.send(Outbound::Message(message)).is_err() {
            debug!(session = %self.session_id, "client gone, result not delivered");
        }
    }

    /// Forward one result. With `inline` the final segment is stored and
    /// moderated before returning.
    async fn relay(&self, result: WorkerResult, inline: bool) {
        if result
            .session_id
            .as_deref()
            .is_some_and(|id| id != self.session_id)
        {
            debug!(session = %self.session_id, "dropping result of another session");
            return;
        }
        if let Some(detail) = &result.error {
            warn!(session = %self.session_id, model = %self.model, error = %detail, "worker failed on an item");
        }

        let text = result.text.trim();
        if result.is_final && !result.is_error() && text.is_empty() {
            // Flush answered with nothing pending.
            return;
        }
        self.send(ServerMessage::from_result(&result));
        if !result.is_final || result.is_error() {
            return;
        }

        if let Err(e) = self.state.sessions.increment_transcription_count(&self.session_id) {
            debug!(error = %e, "count not recorded");
        }
        let segment = FinalSegment {
            session_id: self.session_id.clone(),
            model_id: self.model.clone(),
            text: result.text,
            latency_ms: result.latency_ms,
        };
        let finalize = finalize(self.state.relay.clone(), self.out.clone(), segment);
        if inline {
            finalize.await;
        } else {
            tokio::spawn(finalize);
        }
    }
}

/// Store and moderate a final segment, then report the verdict.
async fn finalize(relay: ModerationRelay, out: mpsc::UnboundedSender<Outbound>, segment: FinalSegment) {
    let session_id = segment.session_id.clone();
    match relay.finalize(segment).await {
        Ok((stored, Some(verdict))) => {
            let message = ServerMessage::moderation(&session_id, &stored.id, verdict);
            if out.send(Outbound::Message(message)).is_err() {
                debug!("client gone before moderation verdict");
            }
        }
        Ok((_, None)) => {}
        Err(e) => warn!(session = %session_id, error = %e, "finalized segment not stored"),
    }
}

/// Forward worker results for one session, in order, until the worker goes
/// away or the flush awaited by `drain` has been answered.
async fn pump_results(mut results: Subscription, drain: watch::Receiver<Option<u64>>, pump: Pump) {
    let mut flushed = 0u64;
    while let Some(result) = results.recv().await {
        if result.flushed {
            flushed += 1;
        }
        let last = result.flushed && drain.borrow().is_some_and(|target| flushed >= target);
        pump.relay(result, last).await;
        if last {
            return;
        }
    }
    if pump
        .events
        .send(PumpEvent::OutputClosed {
            binding: pump.binding,
        })
        .is_err()
    {
        debug!("handler gone before output closed");
    }
}
