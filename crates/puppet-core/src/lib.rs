use serde_json::Value;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Sampling frequency shared with the remote client, in Hz.
pub const STANDARD_FREQUENCY: u32 = 30;

/// Polling tick used by every rendezvous loop.
pub fn standard_interval() -> Duration {
    Duration::from_secs(1) / STANDARD_FREQUENCY
}

/// Namespace prefix for every key the puppeteer writes. The remote client
/// writes under its own `Player.` namespace, so the two writers never
/// collide on key names.
pub const PUPPETEER_NAMESPACE: &str = "puppeteer.";

// Keys written by the puppeteer (namespaced on write).
pub const KEY_USERNAME: &str = "username";
pub const KEY_MODALITY: &str = "modality";
pub const KEY_GAME_STATUS: &str = "game-status";
pub const KEY_START_TIME: &str = "start-time";
pub const KEY_END_TIME: &str = "end-time";
pub const KEY_ORDER_OF_TASKS: &str = "order-of-tasks";
pub const KEY_CURRENT_TASK: &str = "current-task";
pub const KEY_TASK_STATUS: &str = "task-status";
pub const KEY_TASK_COMMENT: &str = "task-comment";
pub const KEY_SIMULATION_NAME: &str = "simulation-name";
pub const KEY_SIMULATION_SERVER_INDEX: &str = "simulation-server-index";
pub const KEY_SIMULATION_COUNTER: &str = "simulation-counter";
pub const KEY_TASK_COMPLETION_TIME: &str = "task-completion-time";
pub const KEY_TRIALS_SIMS: &str = "trials-simulations";
pub const KEY_NUMBER_OF_TRIALS: &str = "number-of-trials";
pub const KEY_NUMBER_OF_TRIAL_REPEATS: &str = "number-of-trial-repeats";
pub const KEY_TRIALS_TIMER: &str = "trials-timer";
pub const KEY_TRIALS_ANSWER: &str = "trials-answer";

// Keys written by the remote client (read-only on this side).
pub const KEY_PLAYER_CONNECTED: &str = "Player.Connected";
pub const KEY_PLAYER_TASK_TYPE: &str = "Player.TaskType";
pub const KEY_PLAYER_TASK_STATUS: &str = "Player.TaskStatus";
pub const KEY_PLAYER_TRIAL_NUMBER: &str = "Player.TrialNumber";
pub const KEY_PLAYER_TRIAL_ANSWER: &str = "Player.TrialAnswer";

// Status values.
pub const VAL_WAITING: &str = "waiting";
pub const VAL_READY: &str = "ready";
pub const VAL_STARTED: &str = "started";
pub const VAL_IN_PROGRESS: &str = "in-progress";
pub const VAL_FINISHED: &str = "finished";
pub const VAL_AMBIVALENT: &str = "ambivalent";
pub const VAL_TRUE: &str = "true";
pub const VAL_FALSE: &str = "false";
pub const VAL_MODALITY_HANDS: &str = "hands";
pub const VAL_MODALITY_CONTROLLERS: &str = "controllers";

// Remote-client status values.
pub const PLAYER_INTRO: &str = "Intro";
pub const PLAYER_IN_PROGRESS: &str = "InProgress";
pub const PLAYER_FINISHED: &str = "Finished";

// Named scalar values carried on simulation frames.
pub const FRAME_KEY_SIMULATION_COUNTER: &str = "system.simulation.counter";
pub const FRAME_KEY_KINETIC_ENERGY: &str = "energy.kinetic";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown shared state key '{key}'")]
    UnknownKey { key: String },
    #[error("invalid value '{value}' for shared state key '{key}', expected one of: {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid trial answer: {0}")]
    Validation(String),
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The five task kinds the experiment can sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Sandbox,
    Nanotube,
    KnotTying,
    Trials,
    TrialsTraining,
}

impl TaskKind {
    /// Name used for `current-task` and `order-of-tasks` values.
    pub fn shared_state_name(&self) -> &'static str {
        match self {
            TaskKind::Sandbox => "sandbox",
            TaskKind::Nanotube => "nanotube",
            TaskKind::KnotTying => "knot-tying",
            TaskKind::Trials => "trials",
            TaskKind::TrialsTraining => "trials-training",
        }
    }

    /// Name the remote client reports in `Player.TaskType`.
    pub fn player_task_type(&self) -> &'static str {
        match self {
            TaskKind::Sandbox => "Sandbox",
            TaskKind::Nanotube => "Nanotube",
            TaskKind::KnotTying => "KnotTying",
            TaskKind::Trials => "Trials",
            TaskKind::TrialsTraining => "TrialsTraining",
        }
    }

    pub fn from_shared_state_name(name: &str) -> Result<TaskKind> {
        match name {
            "sandbox" => Ok(TaskKind::Sandbox),
            "nanotube" => Ok(TaskKind::Nanotube),
            "knot-tying" => Ok(TaskKind::KnotTying),
            "trials" => Ok(TaskKind::Trials),
            "trials-training" => Ok(TaskKind::TrialsTraining),
            other => Err(Error::Configuration(format!(
                "unrecognised task type '{}'",
                other
            ))),
        }
    }
}

const TASK_NAMES: &[&str] = &[
    "sandbox",
    "nanotube",
    "knot-tying",
    "trials",
    "trials-training",
];

const ORDERABLE_TASK_NAMES: &[&str] = &["nanotube", "knot-tying", "trials", "trials-training"];

const KEYS_WITH_UNRESTRICTED_VALUES: &[&str] = &[
    KEY_USERNAME,
    KEY_START_TIME,
    KEY_END_TIME,
    KEY_SIMULATION_NAME,
    KEY_SIMULATION_SERVER_INDEX,
    KEY_SIMULATION_COUNTER,
    KEY_TASK_COMPLETION_TIME,
    KEY_TASK_COMMENT,
    KEY_TRIALS_SIMS,
    KEY_NUMBER_OF_TRIALS,
    KEY_NUMBER_OF_TRIAL_REPEATS,
];

/// Recognised-value set for a restricted key, `None` for unknown keys.
pub fn allowed_values(key: &str) -> Option<&'static [&'static str]> {
    match key {
        KEY_MODALITY => Some(&[VAL_MODALITY_HANDS, VAL_MODALITY_CONTROLLERS]),
        KEY_GAME_STATUS => Some(&[VAL_WAITING, VAL_IN_PROGRESS, VAL_FINISHED]),
        KEY_TASK_STATUS => Some(&[VAL_READY, VAL_IN_PROGRESS, VAL_FINISHED]),
        KEY_CURRENT_TASK => Some(TASK_NAMES),
        KEY_ORDER_OF_TASKS => Some(ORDERABLE_TASK_NAMES),
        KEY_TRIALS_TIMER => Some(&[VAL_STARTED, VAL_FINISHED]),
        KEY_TRIALS_ANSWER => Some(&[VAL_AMBIVALENT, VAL_TRUE, VAL_FALSE]),
        _ => None,
    }
}

pub fn is_unrestricted_key(key: &str) -> bool {
    KEYS_WITH_UNRESTRICTED_VALUES.contains(&key)
}

/// Checks a key-value pair against the shared-state schema before it is
/// transmitted. List values are checked member by member.
pub fn validate_key_value(key: &str, value: &Value) -> Result<()> {
    if is_unrestricted_key(key) {
        return Ok(());
    }
    let Some(allowed) = allowed_values(key) else {
        return Err(Error::UnknownKey {
            key: key.to_string(),
        });
    };
    match value {
        Value::Array(items) => {
            for item in items {
                check_member(key, item, allowed)?;
            }
            Ok(())
        }
        other => check_member(key, other, allowed),
    }
}

fn check_member(key: &str, value: &Value, allowed: &'static [&'static str]) -> Result<()> {
    let text = value_as_text(value);
    if allowed.contains(&text.as_str()) {
        return Ok(());
    }
    Err(Error::InvalidValue {
        key: key.to_string(),
        value: text,
        expected: allowed.join(", "),
    })
}

/// Text form of a shared-state value used for comparisons: strings are
/// taken verbatim, everything else renders as compact JSON.
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One simulation frame from the streaming frame source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationFrame {
    pub particle_positions: Option<Vec<[f64; 3]>>,
    pub particle_names: Option<Vec<String>>,
    pub residue_ids: Option<Vec<u32>>,
    pub values: BTreeMap<String, f64>,
}

impl SimulationFrame {
    /// Monotonically increasing load-generation counter, when present.
    pub fn simulation_counter(&self) -> Option<u64> {
        self.values
            .get(FRAME_KEY_SIMULATION_COUNTER)
            .map(|v| v.round() as u64)
    }

    pub fn kinetic_energy(&self) -> Option<f64> {
        self.values.get(FRAME_KEY_KINETIC_ENERGY).copied()
    }
}

/// Surface of the remote simulation/VR session this process talks to.
/// Playback commands are fire-and-forget: their effects are observed via
/// the frame stream and the generation counter, never acknowledged.
/// Implementations report connection and transmission failures as
/// [`Error::Transport`].
pub trait Session {
    fn shared_value(&mut self, key: &str) -> Option<Value>;
    fn set_shared_value(&mut self, key: &str, value: Value) -> Result<()>;
    fn remove_shared_value(&mut self, key: &str) -> Result<()>;

    fn latest_frame(&mut self) -> Option<SimulationFrame>;

    /// Catalog of simulation identifiers loaded on the server, in
    /// server-index order.
    fn list_simulations(&mut self) -> Result<Vec<String>>;
    fn load_simulation(&mut self, server_index: u64) -> Result<()>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn reset(&mut self) -> Result<()>;

    fn clear_selections(&mut self) -> Result<()>;
    fn update_selection(&mut self, name: &str, particles: &[usize], renderer: Value)
        -> Result<()>;
}

/// Discrete topology label reported by the external classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyLabel {
    Knotted,
    Unknotted,
}

/// External classifier that maps bead positions to a topology label.
pub trait TopologyClassifier {
    fn classify(&mut self, frame: &SimulationFrame) -> Result<TopologyLabel>;
}

/// Controls a single wait loop: the polling tick and an optional bound.
/// The production default has no timeout, matching the rendezvous
/// semantics the remote client expects.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions {
            interval: standard_interval(),
            timeout: None,
        }
    }
}

impl WaitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        WaitOptions {
            interval: standard_interval(),
            timeout: Some(timeout),
        }
    }
}

/// Polls `poll` at the configured interval until it yields a value.
/// Key-not-present and frame-not-arrived conditions are expressed as
/// `Ok(None)` and retried; errors abort the wait immediately.
pub fn wait_until<T, F>(options: &WaitOptions, operation: &str, mut poll: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = poll()? {
            return Ok(value);
        }
        if let Some(timeout) = options.timeout {
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::Timeout {
                    operation: operation.to_string(),
                    waited,
                });
            }
        }
        thread::sleep(options.interval);
    }
}

/// Validates and writes a key-value pair under the puppeteer namespace.
pub fn write_to_shared_state(session: &mut dyn Session, key: &str, value: Value) -> Result<()> {
    validate_key_value(key, &value)?;
    let namespaced = format!("{}{}", PUPPETEER_NAMESPACE, key);
    tracing::debug!(key = namespaced.as_str(), "shared state write");
    session.set_shared_value(&namespaced, value)
}

/// Best-effort removal of a puppeteer-namespaced key. Absent keys are not
/// an error.
pub fn remove_from_shared_state(session: &mut dyn Session, key: &str) -> Result<()> {
    let namespaced = format!("{}{}", PUPPETEER_NAMESPACE, key);
    session.remove_shared_value(&namespaced)
}

/// Rendezvous: blocks until `key` takes one of the accepted values, and
/// returns the observed value. The key is polled raw, so callers pass
/// fully-qualified remote-client keys such as `Player.TaskStatus`.
pub fn wait_for_shared_value(
    session: &mut dyn Session,
    key: &str,
    accepted: &[&str],
    options: &WaitOptions,
) -> Result<String> {
    let operation = format!("shared state key '{}' in {:?}", key, accepted);
    wait_until(options, &operation, || {
        let Some(value) = session.shared_value(key) else {
            return Ok(None);
        };
        let text = value_as_text(&value);
        if accepted.contains(&text.as_str()) {
            Ok(Some(text))
        } else {
            Ok(None)
        }
    })
}
