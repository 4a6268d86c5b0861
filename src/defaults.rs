//! Default configuration constants for livescribe.
//!
//! Shared by the config layer, the worker command line and the tests so a
//! value is only written down once.

/// Default sample rate expected by the bundled models, in Hz.
pub const SAMPLE_RATE: u32 = 16000;

/// Default address the HTTP/WebSocket server binds to.
pub const LISTEN_ADDR: &str = "127.0.0.1:8765";

/// How long a worker gets to exit after a Stop before it is killed.
///
/// Matches the stop sequence of the supervisor: send Stop, wait, force.
pub const STOP_TIMEOUT_MS: u64 = 5000;

/// How long a freshly spawned worker gets to report `Ready`.
///
/// Large buffered models can take several seconds to load from disk.
pub const STARTUP_TIMEOUT_MS: u64 = 30_000;

/// Bounded wait of the worker loop before it re-checks liveness.
pub const WORKER_POLL_INTERVAL_MS: u64 = 1000;

/// Minimum buffered audio before a buffered model may finalize.
pub const BUFFER_MIN_MS: u64 = 3000;

/// Buffered audio length that forces a decode pass regardless of silence.
pub const BUFFER_MAX_MS: u64 = 15_000;

/// Trailing window inspected for silence by the buffered workflow.
pub const SILENCE_WINDOW_MS: u64 = 500;

/// RMS level (0.0 to 1.0) below which audio counts as silence.
///
/// 0.02 is tuned for typical microphone input and rejects room noise.
pub const SILENCE_THRESHOLD: f32 = 0.02;

/// Default session lifetime.
pub const SESSION_TTL_HOURS: u32 = 24;

/// Interval of the background sweep that reclaims expired sessions.
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 300;

/// Upper bound for a single worker frame.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Largest binary audio message accepted from a client.
///
/// Must stay below [`MAX_FRAME_BYTES`] once framed for the worker.
pub const MAX_AUDIO_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// How long `stop` waits for the final result of its last flush.
pub const STOP_DRAIN_TIMEOUT_MS: u64 = 10_000;

/// Token emitted per voiced chunk by the loopback diagnostic models.
pub const LOOPBACK_TOKEN: &str = "speech";

/// Built-in keyword lists for the moderation classifier.
pub const OFFENSIVE_KEYWORDS: &[&str] = &["damn", "crap", "idiot", "stupid"];
pub const HATE_KEYWORDS: &[&str] = &["kill you", "exterminate"];
