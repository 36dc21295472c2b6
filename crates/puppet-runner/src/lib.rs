use chrono::{DateTime, Utc};
use puppet_core::{
    remove_from_shared_state, value_as_text, wait_for_shared_value, wait_until,
    write_to_shared_state, Error, Result, Session, SimulationFrame, TaskKind, TopologyClassifier,
    TopologyLabel, WaitOptions, KEY_CURRENT_TASK, KEY_END_TIME, KEY_GAME_STATUS, KEY_MODALITY,
    KEY_NUMBER_OF_TRIALS, KEY_NUMBER_OF_TRIAL_REPEATS, KEY_ORDER_OF_TASKS, KEY_PLAYER_CONNECTED,
    KEY_PLAYER_TASK_STATUS, KEY_PLAYER_TASK_TYPE, KEY_PLAYER_TRIAL_ANSWER, KEY_PLAYER_TRIAL_NUMBER,
    KEY_SIMULATION_COUNTER, KEY_SIMULATION_NAME, KEY_SIMULATION_SERVER_INDEX, KEY_START_TIME,
    KEY_TASK_COMMENT, KEY_TASK_COMPLETION_TIME, KEY_TASK_STATUS, KEY_TRIALS_ANSWER,
    KEY_TRIALS_SIMS, KEY_TRIALS_TIMER, KEY_USERNAME, PLAYER_FINISHED, PLAYER_INTRO,
    PLAYER_IN_PROGRESS, VAL_AMBIVALENT, VAL_FALSE, VAL_FINISHED, VAL_IN_PROGRESS,
    VAL_MODALITY_CONTROLLERS, VAL_MODALITY_HANDS, VAL_READY, VAL_STARTED, VAL_TRUE, VAL_WAITING,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::ops::Range;
use std::thread;

// Search terms used against the server catalog, one per task kind.
pub const SIM_NAME_SANDBOX: &str = "sandbox";
pub const SIM_NAME_NANOTUBE: &str = "nanotube-methane";
pub const SIM_NAME_KNOT_TYING: &str = "17-ala";
pub const SIM_NAME_TRIALS: &str = "buckyball";

/// Kinetic energy above which the simulation is considered to have
/// diverged and is reset.
pub const KINETIC_ENERGY_THRESHOLD: f64 = 1e11;

/// Consecutive knotted frames required before the knot-tying task is
/// accepted as complete, about one second at the sampling rate.
pub const KNOT_DEBOUNCE_FRAMES: u32 = 30;

/// Particle layout of the nanotube simulation: the tube carbons followed
/// by the methane, whose first carbon is the tracked probe.
pub const METHANE_CARBON_INDEX: usize = 60;

pub fn nanotube_particles() -> Range<usize> {
    0..60
}

// Task comments written when a completion condition fires.
pub const COMMENT_METHANE_THREADED: &str = "methane-in-nanotube";
pub const COMMENT_CHAIN_KNOTTED: &str = "knotted";

const GEOM_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn distance_sq(a: [f64; 3], b: [f64; 3]) -> f64 {
    let d = sub(a, b);
    dot(d, d)
}

fn spans_volume(cloud: &[[f64; 3]]) -> bool {
    let a = cloud[0];
    let Some(&b) = cloud.iter().find(|p| distance_sq(**p, a) > GEOM_EPS) else {
        return false;
    };
    let ab = sub(b, a);
    let Some(normal) = cloud.iter().find_map(|p| {
        let n = cross(ab, sub(*p, a));
        (dot(n, n) > GEOM_EPS).then_some(n)
    }) else {
        return false;
    };
    cloud.iter().any(|p| dot(normal, sub(*p, a)).abs() > GEOM_EPS)
}

/// Membership of `point` in the convex region bounded by `cloud`,
/// equivalent to a Delaunay find-simplex test: the point is inside iff
/// some simplex of the triangulated cloud contains it. The point is
/// outside exactly when some plane through three cloud points separates
/// it from the whole cloud, so all candidate planes are scanned; planes
/// with cloud points on both sides terminate early.
pub fn point_inside_convex_cloud(point: [f64; 3], cloud: &[[f64; 3]]) -> Result<bool> {
    if cloud.len() < 4 {
        return Err(Error::DegenerateGeometry(format!(
            "cannot triangulate {} points, at least 4 required",
            cloud.len()
        )));
    }
    if !spans_volume(cloud) {
        return Err(Error::DegenerateGeometry(
            "point cloud does not span a volume".to_string(),
        ));
    }
    for i in 0..cloud.len() {
        for j in (i + 1)..cloud.len() {
            for k in (j + 1)..cloud.len() {
                let a = cloud[i];
                let normal = cross(sub(cloud[j], a), sub(cloud[k], a));
                if dot(normal, normal) < GEOM_EPS {
                    continue;
                }
                let mut positive = false;
                let mut negative = false;
                for q in cloud {
                    let side = dot(normal, sub(*q, a));
                    if side > GEOM_EPS {
                        positive = true;
                    } else if side < -GEOM_EPS {
                        negative = true;
                    }
                    if positive && negative {
                        break;
                    }
                }
                if positive && negative {
                    continue;
                }
                let side = dot(normal, sub(point, a));
                if (!positive && side > GEOM_EPS) || (!negative && side < -GEOM_EPS) {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Threading detector
// ---------------------------------------------------------------------------

/// Which end of the tube a point is nearest, measured against the first
/// and last atoms of the tube cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TubeEnd {
    First,
    Last,
}

pub fn closest_end(point: [f64; 3], cloud: &[[f64; 3]]) -> TubeEnd {
    let first = cloud[0];
    let last = cloud[cloud.len() - 1];
    if distance_sq(point, first) < distance_sq(point, last) {
        TubeEnd::First
    } else {
        TubeEnd::Last
    }
}

/// Detects a point fully passing through a tubular point cloud: entering
/// at one end and exiting at the other. Exiting from the entry end is a
/// false re-entry and resets the recorded entry.
#[derive(Debug, Default)]
pub struct ThreadingDetector {
    was_inside: bool,
    is_inside: bool,
    entry_end: Option<TubeEnd>,
}

impl ThreadingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_end(&self) -> Option<TubeEnd> {
        self.entry_end
    }

    /// Feeds one frame's probe position and tube cloud; returns true once
    /// the point has threaded the tube.
    pub fn update(&mut self, point: [f64; 3], cloud: &[[f64; 3]]) -> Result<bool> {
        self.was_inside = self.is_inside;
        self.is_inside = point_inside_convex_cloud(point, cloud)?;

        if !self.was_inside && self.is_inside {
            self.entry_end = Some(closest_end(point, cloud));
        }

        if self.was_inside && !self.is_inside {
            let exit_end = closest_end(point, cloud);
            match self.entry_end {
                Some(entry_end) if entry_end != exit_end => return Ok(true),
                _ => self.entry_end = None,
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Knot debouncer
// ---------------------------------------------------------------------------

/// Temporal hysteresis around the external topology classifier: the
/// chain counts as knotted only after a sustained run of knotted frames,
/// since the classifier can emit spurious single-frame labels during
/// fast conformational motion.
#[derive(Debug)]
pub struct KnotDebouncer {
    threshold: u32,
    consecutive_knotted: u32,
    currently_knotted: bool,
}

impl KnotDebouncer {
    pub fn new(threshold: u32) -> Self {
        KnotDebouncer {
            threshold,
            consecutive_knotted: 0,
            currently_knotted: false,
        }
    }

    pub fn consecutive_knotted(&self) -> u32 {
        self.consecutive_knotted
    }

    /// Label from the most recent frame, before any debouncing.
    pub fn is_knotted(&self) -> bool {
        self.currently_knotted
    }

    /// Feeds one frame's label; returns true once the threshold run of
    /// consecutive knotted frames has been observed.
    pub fn observe(&mut self, knotted: bool) -> bool {
        self.currently_knotted = knotted;
        if knotted {
            self.consecutive_knotted += 1;
        } else {
            self.consecutive_knotted = 0;
        }
        self.consecutive_knotted >= self.threshold
    }
}

// ---------------------------------------------------------------------------
// Trials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Molecule {
    A,
    B,
}

impl Molecule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Molecule::A => "A",
            Molecule::B => "B",
        }
    }

    pub fn other(&self) -> Molecule {
        match self {
            Molecule::A => Molecule::B,
            Molecule::B => Molecule::A,
        }
    }
}

/// Parses a submitted trial answer; anything outside the two valid
/// labels is rejected.
pub fn parse_answer(text: &str) -> Result<Molecule> {
    match text {
        "A" => Ok(Molecule::A),
        "B" => Ok(Molecule::B),
        other => Err(Error::Validation(format!(
            "answer must be 'A' or 'B', got '{}'",
            other
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundTruth {
    Molecule(Molecule),
    Ambivalent,
}

/// The designated-correct answer for a trial. With a multiplier of 1 the
/// molecules are indistinguishable; below 1 the modified molecule is the
/// softer, designated-correct one; above 1 the unmodified molecule is.
pub fn ground_truth_for(multiplier: f64, modified_molecule: Molecule) -> GroundTruth {
    if multiplier == 1.0 {
        GroundTruth::Ambivalent
    } else if multiplier < 1.0 {
        GroundTruth::Molecule(modified_molecule)
    } else {
        GroundTruth::Molecule(modified_molecule.other())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ambivalent,
    True,
    False,
}

impl Verdict {
    pub fn shared_state_value(&self) -> &'static str {
        match self {
            Verdict::Ambivalent => VAL_AMBIVALENT,
            Verdict::True => VAL_TRUE,
            Verdict::False => VAL_FALSE,
        }
    }
}

/// Verdict for a submitted answer: ambivalent ground truth always scores
/// ambivalent, otherwise the answer is compared against the ground truth.
pub fn score_answer(ground_truth: GroundTruth, answer: Molecule) -> Verdict {
    match ground_truth {
        GroundTruth::Ambivalent => Verdict::Ambivalent,
        GroundTruth::Molecule(correct) if correct == answer => Verdict::True,
        GroundTruth::Molecule(_) => Verdict::False,
    }
}

/// One candidate simulation for the psychophysics trials, derived from
/// its identifier string and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialDescriptor {
    pub simulation_name: String,
    pub server_index: u64,
    pub multiplier: f64,
    pub modified_molecule: Molecule,
    pub ground_truth: GroundTruth,
}

/// Parses an identifier of the positional convention
/// `<category>_<variant>_<molecule>_<multiplier>.xml`, ignoring any
/// leading path components.
pub fn parse_trial_descriptor(simulation_name: &str, server_index: u64) -> Result<TrialDescriptor> {
    let basename = simulation_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(simulation_name);
    let stem = basename.strip_suffix(".xml").unwrap_or(basename);
    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() < 4 {
        return Err(Error::Configuration(format!(
            "simulation identifier '{}' does not follow the <category>_<variant>_<molecule>_<multiplier> convention",
            simulation_name
        )));
    }
    let modified_molecule = match tokens[2].trim() {
        "A" => Molecule::A,
        "B" => Molecule::B,
        other => {
            return Err(Error::Configuration(format!(
                "simulation identifier '{}' encodes unknown molecule '{}'",
                simulation_name, other
            )))
        }
    };
    let multiplier: f64 = tokens[3].trim().parse().map_err(|_| {
        Error::Configuration(format!(
            "simulation identifier '{}' encodes unparsable multiplier '{}'",
            simulation_name, tokens[3]
        ))
    })?;
    Ok(TrialDescriptor {
        simulation_name: simulation_name.to_string(),
        server_index,
        multiplier,
        modified_molecule,
        ground_truth: ground_truth_for(multiplier, modified_molecule),
    })
}

/// The frozen trial plan for one run of the trials block.
#[derive(Debug, Clone)]
pub struct TrialSet {
    pub practice: Vec<TrialDescriptor>,
    pub main: Vec<TrialDescriptor>,
}

/// Builds a randomized, stratified trial plan. The practice pair is
/// drawn from the extreme multipliers; the main sequence draws `repeats`
/// trials with replacement from every multiplier group. Regenerating
/// for the same catalog yields a different draw by design, to avoid
/// order learning effects.
pub fn generate_trial_set<R: Rng>(
    catalog: &[TrialDescriptor],
    repeats: usize,
    rng: &mut R,
) -> Result<TrialSet> {
    if catalog.is_empty() {
        return Err(Error::Configuration(
            "cannot generate trials from an empty catalog".to_string(),
        ));
    }
    // Zero repeats would leave the non-extreme multipliers out of the
    // plan entirely.
    if repeats == 0 {
        return Err(Error::Configuration(
            "trial repeats must be at least 1".to_string(),
        ));
    }
    let mut multipliers: Vec<f64> = catalog.iter().map(|t| t.multiplier).collect();
    multipliers.sort_by(|a, b| a.partial_cmp(b).expect("multipliers are finite"));
    multipliers.dedup();

    let group = |multiplier: f64| -> Vec<&TrialDescriptor> {
        catalog
            .iter()
            .filter(|t| t.multiplier == multiplier)
            .collect()
    };

    let mut main = Vec::new();
    for &multiplier in &multipliers {
        let candidates = group(multiplier);
        for _ in 0..repeats {
            let chosen = candidates.choose(rng).expect("group is non-empty");
            main.push((*chosen).clone());
        }
    }

    // The extremes are reserved preferentially for practice; with a
    // single distinct multiplier both practice draws come from it.
    let min_multiplier = multipliers[0];
    let max_multiplier = multipliers[multipliers.len() - 1];
    let mut practice = vec![
        (*group(max_multiplier).choose(rng).expect("non-empty")).clone(),
        (*group(min_multiplier).choose(rng).expect("non-empty")).clone(),
    ];

    practice.shuffle(rng);
    main.shuffle(rng);
    Ok(TrialSet { practice, main })
}

// ---------------------------------------------------------------------------
// Task lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a single task; transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Preparing,
    Ready,
    Intro,
    InProgress,
    Completing,
    Finished,
}

#[derive(Debug)]
struct Lifecycle {
    kind: TaskKind,
    state: LifecycleState,
}

impl Lifecycle {
    fn new(kind: TaskKind) -> Self {
        Lifecycle {
            kind,
            state: LifecycleState::Preparing,
        }
    }

    fn advance(&mut self, next: LifecycleState) {
        debug_assert!(next > self.state, "lifecycle cannot move backwards");
        self.state = next;
        tracing::debug!(task = ?self.kind, state = ?self.state, "lifecycle transition");
    }
}

/// A simulation loaded (or about to be loaded) on the server for one task.
#[derive(Debug, Clone)]
pub struct SimulationSlot {
    pub name: String,
    pub server_index: u64,
    pub loaded_generation: u64,
}

/// A catalog match: a simulation identifier and its server index.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub server_index: u64,
}

/// Queries the server catalog for simulations whose identifier contains
/// `term`. An empty result means the server was started without the
/// required simulation and the run cannot proceed.
pub fn resolve_simulation_pool(session: &mut dyn Session, term: &str) -> Result<Vec<CatalogEntry>> {
    let listing = session.list_simulations()?;
    let entries: Vec<CatalogEntry> = listing
        .iter()
        .enumerate()
        .filter(|(_, name)| name.contains(term))
        .map(|(server_index, name)| CatalogEntry {
            name: name.clone(),
            server_index: server_index as u64,
        })
        .collect();
    if entries.is_empty() {
        return Err(Error::Configuration(format!(
            "no simulation matching '{}' found on the server; has it been loaded?",
            term
        )));
    }
    Ok(entries)
}

/// Per-task view of the session: the transport handle plus the wait
/// policy every rendezvous in the task uses.
pub struct TaskContext<'a> {
    pub session: &'a mut dyn Session,
    pub wait: WaitOptions,
}

impl<'a> TaskContext<'a> {
    pub fn new(session: &'a mut dyn Session, wait: WaitOptions) -> Self {
        TaskContext { session, wait }
    }

    fn write(&mut self, key: &str, value: Value) -> Result<()> {
        write_to_shared_state(self.session, key, value)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        remove_from_shared_state(self.session, key)
    }

    fn wait_player_status(&mut self, accepted: &[&str]) -> Result<String> {
        wait_for_shared_value(self.session, KEY_PLAYER_TASK_STATUS, accepted, &self.wait)
    }

    /// Blocks until a frame carrying the generation counter has arrived
    /// and returns the counter value.
    fn current_counter(&mut self) -> Result<u64> {
        let session = &mut self.session;
        wait_until(&self.wait, "a frame carrying the simulation counter", || {
            Ok(session.latest_frame().and_then(|f| f.simulation_counter()))
        })
    }

    /// Blocks until the generation counter has advanced by exactly one
    /// past the slot's recorded generation, which signals the load has
    /// taken effect.
    fn await_simulation_loaded(&mut self, slot: &mut SimulationSlot) -> Result<()> {
        let expected = slot.loaded_generation + 1;
        let session = &mut self.session;
        wait_until(&self.wait, "the simulation load to take effect", || {
            match session.latest_frame().and_then(|f| f.simulation_counter()) {
                Some(counter) if counter == expected => Ok(Some(())),
                _ => Ok(None),
            }
        })?;
        slot.loaded_generation = expected;
        Ok(())
    }

    /// Blocks until a frame with particle-position data has arrived.
    fn await_frame_with_positions(&mut self) -> Result<SimulationFrame> {
        let session = &mut self.session;
        wait_until(&self.wait, "a frame with particle positions", || {
            match session.latest_frame() {
                Some(frame) if frame.particle_positions.is_some() => Ok(Some(frame)),
                _ => Ok(None),
            }
        })
    }

    /// Resets the simulation if it has diverged. Auto-recovered, never
    /// surfaced to the caller.
    fn check_divergence(&mut self, frame: &SimulationFrame) -> Result<()> {
        if frame
            .kinetic_energy()
            .is_some_and(|ke| ke > KINETIC_ENERGY_THRESHOLD)
        {
            tracing::warn!("kinetic energy above threshold, resetting simulation");
            self.session.reset()?;
        }
        Ok(())
    }

    fn tick(&self) {
        thread::sleep(self.wait.interval);
    }
}

fn wipe_previous_task_keys(ctx: &mut TaskContext) -> Result<()> {
    ctx.remove(KEY_TASK_COMPLETION_TIME)?;
    ctx.remove(KEY_TASK_COMMENT)
}

fn configure_visualisation(ctx: &mut TaskContext, kind: TaskKind) -> Result<()> {
    match kind {
        TaskKind::Sandbox | TaskKind::Nanotube => {
            ctx.session.clear_selections()?;
            let tube: Vec<usize> = nanotube_particles().collect();
            ctx.session.update_selection(
                "CNT",
                &tube,
                json!({
                    "render": "ball and stick",
                    "color": {
                        "type": "particle index",
                        "gradient": ["white", "SlateGrey", [0.1, 0.5, 0.3]],
                    },
                }),
            )?;
            let methane: Vec<usize> = (60..65).collect();
            ctx.session.update_selection(
                "MET",
                &methane,
                json!({
                    "render": "ball and stick",
                    "color": "CornflowerBlue",
                    "scale": 0.1,
                }),
            )
        }
        TaskKind::Trials | TaskKind::TrialsTraining => {
            ctx.session.clear_selections()?;
            let buckyball_a: Vec<usize> = (0..60).collect();
            let buckyball_b: Vec<usize> = (60..120).collect();
            let renderer = json!({"render": "ball and stick", "color": "grey"});
            ctx.session
                .update_selection("BUC_A", &buckyball_a, renderer.clone())?;
            ctx.session
                .update_selection("BUC_B", &buckyball_b, renderer)
        }
        TaskKind::KnotTying => Ok(()),
    }
}

/// The `Preparing` step shared by every task kind: load the slot's
/// simulation, wait for the load to take effect, apply the task's
/// visualisation, pause, and publish the task metadata.
fn prepare_simulation(ctx: &mut TaskContext, kind: TaskKind, slot: &mut SimulationSlot) -> Result<()> {
    ctx.session.load_simulation(slot.server_index)?;
    tracing::info!(simulation = slot.name.as_str(), "waiting for simulation to load");
    ctx.await_simulation_loaded(slot)?;
    tracing::info!(simulation = slot.name.as_str(), "simulation loaded");

    configure_visualisation(ctx, kind)?;
    ctx.session.pause()?;

    ctx.write(KEY_SIMULATION_NAME, json!(slot.name))?;
    ctx.write(KEY_SIMULATION_SERVER_INDEX, json!(slot.server_index))?;
    ctx.write(KEY_SIMULATION_COUNTER, json!(slot.loaded_generation))?;
    ctx.write(KEY_CURRENT_TASK, json!(kind.shared_state_name()))?;
    ctx.write(KEY_TASK_STATUS, json!(VAL_READY))
}

/// The `Completing -> Finished` step: publish the completion status,
/// comment, and elapsed duration, then wait for the remote client to
/// acknowledge the end of the task.
fn finish_task(
    ctx: &mut TaskContext,
    comment: Option<&str>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
) -> Result<()> {
    ctx.write(KEY_TASK_STATUS, json!(VAL_FINISHED))?;
    if let Some(comment) = comment {
        ctx.write(KEY_TASK_COMMENT, json!(comment))?;
    }
    if let (Some(started), Some(ended)) = (started_at, ended_at) {
        let elapsed = ended - started;
        let seconds = elapsed.num_milliseconds() as f64 / 1000.0;
        ctx.write(KEY_TASK_COMPLETION_TIME, json!(format!("{:.3}", seconds)))?;
    }
    tracing::info!("waiting for remote client to confirm end of task");
    ctx.wait_player_status(&[PLAYER_FINISHED])?;
    Ok(())
}

/// Outcome of one task run.
#[derive(Debug)]
pub struct TaskReport {
    pub kind: TaskKind,
    pub comment: Option<String>,
    pub completion_time: Option<chrono::Duration>,
    pub verdicts: Vec<Verdict>,
}

/// Task-specific completion logic, fed one frame per tick. Returning a
/// comment declares the task complete.
pub trait CompletionLogic {
    fn tick(&mut self, frame: &SimulationFrame) -> Result<Option<String>>;
}

/// Completion logic of the nanotube task: the methane carbon must fully
/// thread the tube.
pub struct ThreadingCompletion {
    detector: ThreadingDetector,
    tube: Range<usize>,
    probe: usize,
}

impl ThreadingCompletion {
    pub fn new(tube: Range<usize>, probe: usize) -> Self {
        ThreadingCompletion {
            detector: ThreadingDetector::new(),
            tube,
            probe,
        }
    }
}

impl CompletionLogic for ThreadingCompletion {
    fn tick(&mut self, frame: &SimulationFrame) -> Result<Option<String>> {
        let positions = frame.particle_positions.as_deref().ok_or_else(|| {
            Error::DegenerateGeometry("frame carries no particle positions".to_string())
        })?;
        if positions.len() <= self.probe || positions.len() < self.tube.end {
            return Err(Error::DegenerateGeometry(format!(
                "frame carries {} positions, fewer than the nanotube layout requires",
                positions.len()
            )));
        }
        let cloud = &positions[self.tube.clone()];
        if self.detector.update(positions[self.probe], cloud)? {
            return Ok(Some(COMMENT_METHANE_THREADED.to_string()));
        }
        Ok(None)
    }
}

/// Completion logic of the knot-tying task: a debounced run of knotted
/// classifications.
pub struct KnotCompletion<'a> {
    debouncer: KnotDebouncer,
    classifier: &'a mut dyn TopologyClassifier,
}

impl<'a> KnotCompletion<'a> {
    pub fn new(classifier: &'a mut dyn TopologyClassifier) -> Self {
        KnotCompletion {
            debouncer: KnotDebouncer::new(KNOT_DEBOUNCE_FRAMES),
            classifier,
        }
    }
}

impl CompletionLogic for KnotCompletion<'_> {
    fn tick(&mut self, frame: &SimulationFrame) -> Result<Option<String>> {
        let label = self.classifier.classify(frame)?;
        if self.debouncer.observe(label == TopologyLabel::Knotted) {
            return Ok(Some(COMMENT_CHAIN_KNOTTED.to_string()));
        }
        Ok(None)
    }
}

/// Drives one nanotube or knot-tying task through its whole lifecycle.
pub fn run_standard_task(
    ctx: &mut TaskContext,
    kind: TaskKind,
    mut slot: SimulationSlot,
    logic: &mut dyn CompletionLogic,
) -> Result<TaskReport> {
    tracing::info!(task = kind.shared_state_name(), "running task");
    let mut lifecycle = Lifecycle::new(kind);

    wipe_previous_task_keys(ctx)?;
    prepare_simulation(ctx, kind, &mut slot)?;
    lifecycle.advance(LifecycleState::Ready);

    tracing::info!("waiting for player to start the task");
    let status = ctx.wait_player_status(&[PLAYER_INTRO, PLAYER_IN_PROGRESS])?;
    if status == PLAYER_INTRO {
        lifecycle.advance(LifecycleState::Intro);
        ctx.wait_player_status(&[PLAYER_IN_PROGRESS])?;
    }

    let started_at = Utc::now();
    ctx.session.play()?;
    ctx.await_frame_with_positions()?;
    ctx.write(KEY_TASK_STATUS, json!(VAL_IN_PROGRESS))?;
    lifecycle.advance(LifecycleState::InProgress);

    let comment = loop {
        let frame = ctx.await_frame_with_positions()?;
        ctx.check_divergence(&frame)?;
        if let Some(comment) = logic.tick(&frame)? {
            break comment;
        }
        ctx.tick();
    };
    lifecycle.advance(LifecycleState::Completing);

    let ended_at = Utc::now();
    finish_task(ctx, Some(&comment), Some(started_at), Some(ended_at))?;
    lifecycle.advance(LifecycleState::Finished);
    tracing::info!(task = kind.shared_state_name(), comment = comment.as_str(), "task finished");

    Ok(TaskReport {
        kind,
        comment: Some(comment),
        completion_time: Some(ended_at - started_at),
        verdicts: Vec::new(),
    })
}

fn wait_for_trial_answer(
    ctx: &mut TaskContext,
    trial_number: usize,
    descriptor: &TrialDescriptor,
) -> Result<Verdict> {
    // The previous verdict must be gone before the player answers again.
    ctx.remove(KEY_TRIALS_ANSWER)?;

    tracing::info!(trial = trial_number, "waiting for player to answer");
    let ordinal = trial_number.to_string();
    wait_for_shared_value(
        ctx.session,
        KEY_PLAYER_TRIAL_NUMBER,
        &[ordinal.as_str()],
        &ctx.wait,
    )?;
    ctx.write(KEY_TRIALS_TIMER, json!(VAL_FINISHED))?;

    let answer_value = ctx
        .session
        .shared_value(KEY_PLAYER_TRIAL_ANSWER)
        .ok_or_else(|| {
            Error::Validation(format!(
                "player reported trial {} without submitting an answer",
                trial_number
            ))
        })?;
    let answer = parse_answer(&value_as_text(&answer_value))?;
    let verdict = score_answer(descriptor.ground_truth, answer);
    ctx.write(KEY_TRIALS_ANSWER, json!(verdict.shared_state_value()))?;
    Ok(verdict)
}

/// Drives the psychophysics trials task (or its training variant) over a
/// frozen trial plan: each trial loads its simulation, rendezvous with
/// the player, and scores the submitted answer. Training runs the
/// practice pair, the main task runs the main sequence; both advertise
/// the planned main sequence in shared state, which the remote client
/// uses to size the block ahead.
pub fn run_trials_task(
    ctx: &mut TaskContext,
    kind: TaskKind,
    set: &TrialSet,
    repeats: usize,
) -> Result<TaskReport> {
    let sequence: &[TrialDescriptor] = match kind {
        TaskKind::TrialsTraining => &set.practice,
        _ => &set.main,
    };
    tracing::info!(task = kind.shared_state_name(), trials = sequence.len(), "running trials task");
    let mut lifecycle = Lifecycle::new(kind);
    wipe_previous_task_keys(ctx)?;

    let main_names: Vec<&str> = set.main.iter().map(|t| t.simulation_name.as_str()).collect();
    ctx.write(KEY_TRIALS_SIMS, json!(main_names))?;
    ctx.write(KEY_NUMBER_OF_TRIALS, json!(set.main.len()))?;
    ctx.write(KEY_NUMBER_OF_TRIAL_REPEATS, json!(repeats))?;

    let started_at = Utc::now();
    let mut verdicts = Vec::new();
    for (trial_number, descriptor) in sequence.iter().enumerate() {
        // Recorded playback stays paused after a load; nudge it along
        // for every trial after the first.
        if kind == TaskKind::TrialsTraining && trial_number > 0 {
            ctx.session.play()?;
        }

        let generation = ctx.current_counter()?;
        let mut slot = SimulationSlot {
            name: descriptor.simulation_name.clone(),
            server_index: descriptor.server_index,
            loaded_generation: generation,
        };
        prepare_simulation(ctx, kind, &mut slot)?;
        if trial_number == 0 {
            lifecycle.advance(LifecycleState::Ready);
        }

        ctx.wait_player_status(&[PLAYER_IN_PROGRESS])?;
        if trial_number == 0 {
            ctx.write(KEY_TASK_STATUS, json!(VAL_IN_PROGRESS))?;
            lifecycle.advance(LifecycleState::InProgress);
        }

        ctx.write(KEY_TRIALS_TIMER, json!(VAL_STARTED))?;
        let verdict = wait_for_trial_answer(ctx, trial_number, descriptor)?;
        tracing::info!(trial = trial_number, verdict = verdict.shared_state_value(), "trial scored");
        verdicts.push(verdict);
    }
    lifecycle.advance(LifecycleState::Completing);

    let ended_at = Utc::now();
    finish_task(ctx, None, Some(started_at), Some(ended_at))?;
    lifecycle.advance(LifecycleState::Finished);

    Ok(TaskReport {
        kind,
        comment: None,
        completion_time: Some(ended_at - started_at),
        verdicts,
    })
}

/// Free play: loads the sandbox simulation and lets the player interact
/// until they leave the sandbox.
pub fn run_sandbox_task(ctx: &mut TaskContext, mut slot: SimulationSlot) -> Result<TaskReport> {
    tracing::info!("running sandbox task");
    wipe_previous_task_keys(ctx)?;

    ctx.session.load_simulation(slot.server_index)?;
    ctx.await_simulation_loaded(&mut slot)?;
    configure_visualisation(ctx, TaskKind::Sandbox)?;

    ctx.write(KEY_TASK_STATUS, json!(VAL_IN_PROGRESS))?;
    ctx.session.play()?;

    let session = &mut ctx.session;
    wait_until(&ctx.wait, "the player to leave the sandbox", || {
        match session.shared_value(KEY_PLAYER_TASK_TYPE) {
            Some(value) if value_as_text(&value) == TaskKind::Sandbox.player_task_type() => Ok(None),
            _ => Ok(Some(())),
        }
    })?;
    ctx.session.pause()?;
    tracing::info!("player left the sandbox");

    Ok(TaskReport {
        kind: TaskKind::Sandbox,
        comment: None,
        completion_time: None,
        verdicts: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

/// Ordered task list for the experiment: two sections, each opening with
/// the nanotube task followed by a shuffled arrangement of the knot-tying
/// task and the trials block (training immediately before main trials).
pub fn build_order_of_tasks<R: Rng>(short_game: bool, rng: &mut R) -> Vec<TaskKind> {
    if short_game {
        return vec![TaskKind::Nanotube, TaskKind::Nanotube];
    }
    let mut order = Vec::new();
    for _ in 0..2 {
        let mut blocks: Vec<Vec<TaskKind>> = vec![
            vec![TaskKind::KnotTying],
            vec![TaskKind::TrialsTraining, TaskKind::Trials],
        ];
        blocks.shuffle(rng);
        order.push(TaskKind::Nanotube);
        order.extend(blocks.into_iter().flatten());
    }
    order
}

/// Randomized order in which the two interaction modalities are used,
/// one per section.
pub fn randomised_modality_order<R: Rng>(rng: &mut R) -> [&'static str; 2] {
    let mut order = [VAL_MODALITY_HANDS, VAL_MODALITY_CONTROLLERS];
    order.shuffle(rng);
    order
}

#[derive(Debug, Clone)]
pub struct GameConfig {
    pub participant: String,
    pub trial_repeats: usize,
    pub short_game: bool,
    /// Explicit task order (shared-state task names); randomized when
    /// absent. An unrecognized name aborts the run before it starts.
    pub task_order: Option<Vec<String>>,
    pub wait: WaitOptions,
}

impl GameConfig {
    pub fn new(participant: impl Into<String>) -> Self {
        GameConfig {
            participant: participant.into(),
            trial_repeats: 3,
            short_game: false,
            task_order: None,
            wait: WaitOptions::default(),
        }
    }
}

fn slot_from(entry: &CatalogEntry, loaded_generation: u64) -> SimulationSlot {
    SimulationSlot {
        name: entry.name.clone(),
        server_index: entry.server_index,
        loaded_generation,
    }
}

enum MenuSelection {
    Sandbox,
    StartGame,
}

/// Drives a whole experiment run: initial shared-state population, the
/// connection rendezvous and main menu, then each task in order, and the
/// end-of-game bookkeeping.
pub struct Orchestrator<'a, R: Rng> {
    session: &'a mut dyn Session,
    classifier: &'a mut dyn TopologyClassifier,
    config: GameConfig,
    rng: R,
}

impl<'a, R: Rng> Orchestrator<'a, R> {
    pub fn new(
        session: &'a mut dyn Session,
        classifier: &'a mut dyn TopologyClassifier,
        config: GameConfig,
        rng: R,
    ) -> Self {
        Orchestrator {
            session,
            classifier,
            config,
            rng,
        }
    }

    pub fn run(&mut self) -> Result<Vec<TaskReport>> {
        let order = match &self.config.task_order {
            Some(names) => names
                .iter()
                .map(|name| TaskKind::from_shared_state_name(name))
                .collect::<Result<Vec<_>>>()?,
            None => build_order_of_tasks(self.config.short_game, &mut self.rng),
        };
        let modalities = randomised_modality_order(&mut self.rng);

        // Resolve every task's simulation pool up front so a misloaded
        // server fails the run before the player puts the headset on.
        let sandbox_pool = resolve_simulation_pool(self.session, SIM_NAME_SANDBOX)?;
        let nanotube_pool = resolve_simulation_pool(self.session, SIM_NAME_NANOTUBE)?;
        let knot_pool = resolve_simulation_pool(self.session, SIM_NAME_KNOT_TYING)?;
        let trials_pool = resolve_simulation_pool(self.session, SIM_NAME_TRIALS)?;
        let trials_catalog: Vec<TrialDescriptor> = trials_pool
            .iter()
            .map(|entry| parse_trial_descriptor(&entry.name, entry.server_index))
            .collect::<Result<_>>()?;

        let order_names: Vec<&str> = order.iter().map(|k| k.shared_state_name()).collect();
        tracing::info!(order = ?order_names, modality = modalities[0], "game initialised");

        write_to_shared_state(self.session, KEY_USERNAME, json!(self.config.participant))?;
        write_to_shared_state(self.session, KEY_GAME_STATUS, json!(VAL_WAITING))?;
        write_to_shared_state(self.session, KEY_MODALITY, json!(modalities[0]))?;
        write_to_shared_state(self.session, KEY_ORDER_OF_TASKS, json!(order_names))?;
        write_to_shared_state(self.session, KEY_START_TIME, json!(Utc::now().to_rfc3339()))?;

        tracing::info!("waiting for remote client to connect");
        wait_for_shared_value(
            self.session,
            KEY_PLAYER_CONNECTED,
            &[VAL_TRUE],
            &self.config.wait,
        )?;
        write_to_shared_state(self.session, KEY_GAME_STATUS, json!(VAL_IN_PROGRESS))?;

        self.main_menu(&sandbox_pool)?;

        let mut reports = Vec::new();
        let mut stashed_trials: Option<TrialSet> = None;
        let mut nanotube_count = 0usize;
        for &kind in &order {
            let mut ctx = TaskContext::new(&mut *self.session, self.config.wait.clone());
            let report = match kind {
                TaskKind::Nanotube => {
                    nanotube_count += 1;
                    if nanotube_count > 1 {
                        // Second section: switch interaction modality.
                        write_to_shared_state(ctx.session, KEY_MODALITY, json!(modalities[1]))?;
                    }
                    let generation = ctx.current_counter()?;
                    let slot = slot_from(&nanotube_pool[0], generation);
                    let mut logic =
                        ThreadingCompletion::new(nanotube_particles(), METHANE_CARBON_INDEX);
                    run_standard_task(&mut ctx, kind, slot, &mut logic)?
                }
                TaskKind::KnotTying => {
                    let generation = ctx.current_counter()?;
                    let slot = slot_from(&knot_pool[0], generation);
                    let mut logic = KnotCompletion::new(&mut *self.classifier);
                    run_standard_task(&mut ctx, kind, slot, &mut logic)?
                }
                TaskKind::TrialsTraining => {
                    let set =
                        generate_trial_set(&trials_catalog, self.config.trial_repeats, &mut self.rng)?;
                    let report = run_trials_task(&mut ctx, kind, &set, self.config.trial_repeats)?;
                    stashed_trials = Some(set);
                    report
                }
                TaskKind::Trials => {
                    let set = match stashed_trials.take() {
                        Some(set) => set,
                        None => generate_trial_set(
                            &trials_catalog,
                            self.config.trial_repeats,
                            &mut self.rng,
                        )?,
                    };
                    run_trials_task(&mut ctx, kind, &set, self.config.trial_repeats)?
                }
                TaskKind::Sandbox => {
                    let generation = ctx.current_counter()?;
                    let slot = slot_from(&sandbox_pool[0], generation);
                    run_sandbox_task(&mut ctx, slot)?
                }
            };
            reports.push(report);
        }

        write_to_shared_state(self.session, KEY_GAME_STATUS, json!(VAL_FINISHED))?;
        write_to_shared_state(self.session, KEY_END_TIME, json!(Utc::now().to_rfc3339()))?;
        tracing::info!("game finished");
        Ok(reports)
    }

    /// The player chooses between free play and the main game; the
    /// sandbox can be entered any number of times.
    fn main_menu(&mut self, sandbox_pool: &[CatalogEntry]) -> Result<()> {
        tracing::info!("player connected, waiting for them to choose a task");
        loop {
            let session = &mut *self.session;
            let selection = wait_until(&self.config.wait, "the player's menu selection", || {
                let Some(value) = session.shared_value(KEY_PLAYER_TASK_TYPE) else {
                    return Ok(None);
                };
                let text = value_as_text(&value);
                if text == TaskKind::Sandbox.player_task_type() {
                    return Ok(Some(MenuSelection::Sandbox));
                }
                let starts_game = [
                    TaskKind::Nanotube,
                    TaskKind::KnotTying,
                    TaskKind::Trials,
                    TaskKind::TrialsTraining,
                ]
                .iter()
                .any(|kind| text == kind.player_task_type());
                if starts_game {
                    Ok(Some(MenuSelection::StartGame))
                } else {
                    Ok(None)
                }
            })?;
            match selection {
                MenuSelection::StartGame => return Ok(()),
                MenuSelection::Sandbox => {
                    let mut ctx = TaskContext::new(&mut *self.session, self.config.wait.clone());
                    let generation = ctx.current_counter()?;
                    let slot = slot_from(&sandbox_pool[0], generation);
                    run_sandbox_task(&mut ctx, slot)?;
                }
            }
        }
    }
}
