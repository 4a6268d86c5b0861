//! The loop a worker process runs.
//!
//! Input frames are read on a dedicated thread and handed over through a
//! crossbeam channel so the loop can wait with a timeout and periodically
//! check that its parent is still alive. Failures while handling one item
//! become error results; only a broken input or output stream ends the loop.

use crate::error::{LivescribeError, Result};
use crate::models::{Catalog, ModelDescriptor};
use crate::worker::decode::{DecodeState, Hypothesis};
use crate::worker::protocol::{WorkerInput, WorkerOutput, WorkerResult, read_frame, write_frame};
use crate::worker::settings::WorkerSettings;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io::{BufReader, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A Stop item was received.
    Stopped,
    /// The input stream closed.
    InputClosed,
    /// The parent process went away.
    Orphaned,
}

type Liveness = Box<dyn Fn() -> bool + Send>;

pub struct WorkerRuntime<W: Write> {
    model: &'static ModelDescriptor,
    decode: DecodeState,
    output: W,
    poll_interval: Duration,
    is_parent_alive: Liveness,
    session: Option<String>,
}

impl<W: Write> WorkerRuntime<W> {
    pub fn new(
        model: &'static ModelDescriptor,
        decode: DecodeState,
        output: W,
        poll_interval: Duration,
    ) -> Self {
        Self {
            model,
            decode,
            output,
            poll_interval,
            is_parent_alive: Box::new(|| true),
            session: None,
        }
    }

    pub fn with_liveness(mut self, check: impl Fn() -> bool + Send + 'static) -> Self {
        self.is_parent_alive = Box::new(check);
        self
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Report the outcome of the model load to the parent.
    pub fn announce_ready(&mut self) -> Result<()> {
        let loaded = self.decode.is_loaded();
        write_frame(
            &mut self.output,
            &WorkerOutput::Ready {
                model: self.model.id.to_string(),
                loaded,
            },
        )?;
        info!(model = self.model.id, loaded, "worker ready");
        Ok(())
    }

    /// Run until Stop, end of input, or orphaning.
    ///
    /// Returns `Err` only for failures outside a single item: a corrupted
    /// input frame or an unwritable output stream.
    pub fn run(&mut self, inputs: Receiver<Result<WorkerInput>>) -> Result<LoopExit> {
        loop {
            match inputs.recv_timeout(self.poll_interval) {
                Ok(Ok(WorkerInput::Stop)) => {
                    info!(model = self.model.id, "stop received");
                    return Ok(LoopExit::Stopped);
                }
                Ok(Ok(item)) => {
                    for result in self.process_item(item) {
                        write_frame(&mut self.output, &WorkerOutput::Result(result))?;
                    }
                }
                Ok(Err(e)) => {
                    error!(model = self.model.id, error = %e, "input queue corrupted, worker loop exiting");
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !(self.is_parent_alive)() {
                        warn!(model = self.model.id, "parent process gone, exiting");
                        return Ok(LoopExit::Orphaned);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(model = self.model.id, "input closed");
                    return Ok(LoopExit::InputClosed);
                }
            }
        }
    }

    /// Handle one item inside the error boundary.
    ///
    /// Errors and panics are turned into a single error result. The result
    /// answering a `Flush` (its final, or its failure) is marked `flushed`.
    pub fn process_item(&mut self, item: WorkerInput) -> Vec<WorkerResult> {
        let flushing = matches!(item, WorkerInput::Flush { .. });
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handle(item)));
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let failure = match outcome {
            Ok(Ok(results)) => {
                let mut results: Vec<WorkerResult> = results
                    .into_iter()
                    .map(|r| r.with_latency_ms(latency_ms))
                    .collect();
                if flushing && let Some(last) = results.iter_mut().rev().find(|r| r.is_final) {
                    last.flushed = true;
                }
                return results;
            }
            Ok(Err(e)) => {
                warn!(model = self.model.id, error = %e, "item failed");
                e.to_string()
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(model = self.model.id, panic = %message, "decoder panicked, resetting state");
                self.decode.reset();
                format!("decoder panicked: {message}")
            }
        };

        let mut result = WorkerResult::failure(self.model.id, failure)
            .with_session(self.session.clone())
            .with_latency_ms(latency_ms);
        result.flushed = flushing;
        vec![result]
    }

    fn handle(&mut self, item: WorkerInput) -> Result<Vec<WorkerResult>> {
        let hypotheses = match item {
            WorkerInput::Audio(frame) => {
                self.session = frame.session_id;
                if !self.decode.is_loaded() {
                    return Ok(Vec::new());
                }
                if frame.chunk.sample_rate != self.model.sample_rate {
                    return Err(LivescribeError::WorkerRuntime {
                        message: format!(
                            "sample rate {} does not match the model rate {}",
                            frame.chunk.sample_rate, self.model.sample_rate
                        ),
                    });
                }
                let samples = frame.chunk.to_mono_samples()?;
                self.decode.accept(&samples)?
            }
            WorkerInput::Flush { session_id } => {
                if session_id.is_some() {
                    self.session = session_id;
                }
                // A flush always ends in a final, empty when nothing was pending.
                let mut hypotheses = self.decode.flush()?;
                if !hypotheses.iter().any(|h| h.is_final) {
                    hypotheses.push(Hypothesis::finished(""));
                }
                hypotheses
            }
            WorkerInput::Reset => {
                debug!(model = self.model.id, "decode state reset");
                self.decode.reset();
                Vec::new()
            }
            WorkerInput::Stop => Vec::new(),
        };

        Ok(hypotheses
            .into_iter()
            .map(|h| {
                WorkerResult::transcript(self.model.id, h.text, h.is_final)
                    .with_session(self.session.clone())
            })
            .collect())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Read frames from `reader` on a background thread.
///
/// The channel closes on clean end of input; a codec error is delivered as
/// the last item.
pub fn spawn_input_reader<R: Read + Send + 'static>(
    reader: R,
) -> Result<Receiver<Result<WorkerInput>>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("worker-input".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            loop {
                match read_frame::<_, WorkerInput>(&mut reader) {
                    Ok(Some(item)) => {
                        if tx.send(Ok(item)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tx.send(Err(e)).ok();
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Entry point of the `worker` subcommand: serve `model_id` over stdio.
pub fn run_worker(model_id: &str, settings: &WorkerSettings) -> Result<LoopExit> {
    let model = Catalog::builtin().resolve(model_id)?;
    info!(model = model.id, dir = %settings.models_dir.display(), "loading model");
    let decode = DecodeState::load(model, &settings.models_dir, settings.buffer);

    // SAFETY: getppid has no preconditions and cannot fail.
    let parent = unsafe { libc::getppid() };
    let mut runtime = WorkerRuntime::new(
        model,
        decode,
        std::io::stdout().lock(),
        settings.poll_interval(),
    )
    // SAFETY: as above.
    .with_liveness(move || unsafe { libc::getppid() } == parent);

    runtime.announce_ready()?;
    let inputs = spawn_input_reader(std::io::stdin())?;
    runtime.run(inputs)
}
