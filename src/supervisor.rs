//! Runnable supervision.
//!
//! The `Supervisor` owns every runnable instance: it expands and validates
//! start targets, starts them in dependency order, tracks readiness, feeds
//! their output into the `LogStore`, publishes events on the `EventBus`, and
//! enforces the escalating stop protocol. Instances gated on dependencies
//! stay `waiting`; a single recovery watcher re-issues their start whenever a
//! dependency reaches `running`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::config::{Config, ConfigError};
use crate::events::{EventBus, SupervisorEvent};
use crate::logs::{strip_ansi, LogStore, StreamKind};
use crate::runnable::{
    EnvWriter, OnReadyHook, ReadyContext, RunnableSpec, RunnableState, RunnableStatus,
};
use crate::spawn::{self, Signal};

/// How many combined lines feed the readiness predicate and the `on_ready`
/// output snapshot.
const READY_SNAPSHOT_LINES: usize = 500;

struct Instance {
    spec: Arc<RunnableSpec>,
    status: RunnableStatus,
    hidden: bool,
    pid: Option<u32>,
    started_at: Option<SystemTime>,
    error: Option<String>,
    waiting_for: Vec<String>,
    /// Bumped on every spawn; tasks from older epochs drop their results.
    epoch: u64,
    /// Bumped whenever the dependency gate is re-armed or cancelled.
    gate_seq: u64,
    /// Set while a stop sequence is in flight; any exit then counts as stopped.
    stopping: bool,
    /// Once-per-epoch guard for the ready transition.
    ready_claimed: bool,
    status_tx: watch::Sender<RunnableStatus>,
}

impl Instance {
    fn new(spec: Arc<RunnableSpec>) -> Self {
        let (status_tx, _) = watch::channel(RunnableStatus::Stopped);
        Self {
            spec,
            status: RunnableStatus::Stopped,
            hidden: true,
            pid: None,
            started_at: None,
            error: None,
            waiting_for: Vec::new(),
            epoch: 0,
            gate_seq: 0,
            stopping: false,
            ready_claimed: false,
            status_tx,
        }
    }

    fn snapshot(&self) -> RunnableState {
        RunnableState {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            status: self.status,
            hidden: self.hidden,
            pid: self.pid,
            started_at: self.started_at,
            error: self.error.clone(),
            waiting_for: self.waiting_for.clone(),
        }
    }
}

struct Inner {
    specs: BTreeMap<String, Arc<RunnableSpec>>,
    instances: Mutex<HashMap<String, Instance>>,
    logs: Arc<LogStore>,
    bus: Arc<EventBus>,
    /// Runtime env published by `on_ready` hooks, keyed by runnable id.
    runtime_env: Mutex<HashMap<String, Vec<(String, String)>>>,
    hooks: Mutex<HashMap<String, OnReadyHook>>,
    defaults_env: Vec<(String, String)>,
}

/// The runnable supervisor. Cheap to clone; all clones share state.
///
/// Must be created inside a tokio runtime: the event bus dispatcher and the
/// recovery watcher run as background tasks.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Builds instances for every configured runnable (`stopped`, hidden)
    /// and installs the recovery watcher.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let specs: BTreeMap<String, Arc<RunnableSpec>> = config
            .specs()?
            .into_iter()
            .map(|(id, spec)| (id, Arc::new(spec)))
            .collect();
        let instances = specs
            .values()
            .map(|spec| (spec.id.clone(), Instance::new(spec.clone())))
            .collect();

        let mut defaults_env: Vec<(String, String)> = config
            .defaults
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        defaults_env.sort();

        let inner = Arc::new(Inner {
            specs,
            instances: Mutex::new(instances),
            logs: Arc::new(LogStore::new(config.max_output_lines())),
            bus: Arc::new(EventBus::new()),
            runtime_env: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashMap::new()),
            defaults_env,
        });
        install_recovery_watcher(&inner);
        Ok(Self { inner })
    }

    /// The event bus carrying `status-change`, `output` and `hidden-change`.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The shared log store.
    pub fn logs(&self) -> Arc<LogStore> {
        self.inner.logs.clone()
    }

    /// Registers the `on_ready` hook for a runnable. Replaces any previous
    /// hook; takes effect from the next start epoch.
    pub fn set_on_ready(&self, id: &str, hook: OnReadyHook) {
        self.inner.hooks.lock().unwrap().insert(id.to_string(), hook);
    }

    /// Starts the transitive closure of `targets` in dependency order.
    /// An empty target list selects every runnable. Fails fast, before any
    /// spawn, on unknown ids, missing dependencies, or cycles.
    pub async fn start_all(&self, targets: &[String]) -> Result<(), ConfigError> {
        let all: Vec<String>;
        let targets = if targets.is_empty() {
            all = self.inner.specs.keys().cloned().collect();
            &all
        } else {
            targets
        };
        let set = self.closure(targets)?;
        let order = self.topo_order(&set)?;
        for id in &order {
            start_internal(&self.inner, id);
        }
        Ok(())
    }

    /// Starts one runnable, gated on its dependencies. No-op when already
    /// `running` or `starting`.
    pub async fn start(&self, id: &str) -> Result<(), ConfigError> {
        let spec = self
            .inner
            .specs
            .get(id)
            .ok_or_else(|| ConfigError::UnknownRunnable { id: id.to_string() })?;
        for dep in &spec.depends_on {
            if !self.inner.specs.contains_key(dep) {
                return Err(ConfigError::MissingDependency {
                    id: id.to_string(),
                    dep: dep.clone(),
                    known: self.inner.specs.keys().cloned().collect(),
                });
            }
        }
        start_internal(&self.inner, id);
        Ok(())
    }

    /// Unhides `id` and its transitive dependencies, then starts whichever
    /// of them are not already active, in dependency order.
    pub async fn start_with_dependencies(&self, id: &str) -> Result<(), ConfigError> {
        let set = self.closure(std::slice::from_ref(&id.to_string()))?;
        let pending: Vec<String> = {
            let mut instances = self.inner.instances.lock().unwrap();
            for member in &set {
                if let Some(inst) = instances.get_mut(member) {
                    if inst.hidden {
                        inst.hidden = false;
                        self.inner.bus.emit(SupervisorEvent::HiddenChange {
                            id: member.clone(),
                            hidden: false,
                        });
                    }
                }
            }
            set.iter()
                .filter(|member| {
                    instances.get(member.as_str()).is_some_and(|inst| {
                        matches!(
                            inst.status,
                            RunnableStatus::Stopped | RunnableStatus::Error
                        )
                    })
                })
                .cloned()
                .collect()
        };
        let order = self.topo_order(&pending)?;
        for member in &order {
            start_internal(&self.inner, member);
        }
        Ok(())
    }

    /// Stops a runnable: SIGTERM to its process group, SIGKILL after 5 s.
    /// Resolves when the child has exited. No-op when not active.
    pub async fn stop(&self, id: &str) {
        let (pid, mut rx) = {
            let mut instances = self.inner.instances.lock().unwrap();
            let Some(inst) = instances.get_mut(id) else { return };
            match inst.status {
                RunnableStatus::Stopped | RunnableStatus::Error => return,
                RunnableStatus::Waiting => {
                    // Nothing spawned yet; cancel the gate.
                    inst.gate_seq += 1;
                    inst.waiting_for.clear();
                    apply_status(&self.inner.bus, inst, RunnableStatus::Stopped, None);
                    return;
                }
                RunnableStatus::Starting | RunnableStatus::Running => {
                    inst.stopping = true;
                    (inst.pid, inst.status_tx.subscribe())
                }
            }
        };
        if let Some(pid) = pid {
            spawn::signal_group(pid, Signal::Term);
        }
        // A pid of None means the spawn is still in flight; the spawn path
        // observes `stopping` and sends the signal itself.
        if tokio::time::timeout(spawn::STOP_GRACE, wait_until_exited(&mut rx))
            .await
            .is_err()
        {
            let pid = {
                let instances = self.inner.instances.lock().unwrap();
                instances.get(id).and_then(|inst| inst.pid)
            };
            if let Some(pid) = pid {
                spawn::signal_group(pid, Signal::Kill);
            }
            wait_until_exited(&mut rx).await;
        }
    }

    /// Stops every runnable concurrently and waits for all of them.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .inner
            .instances
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        let mut set = tokio::task::JoinSet::new();
        for id in ids {
            let supervisor = self.clone();
            set.spawn(async move { supervisor.stop(&id).await });
        }
        while set.join_next().await.is_some() {}
    }

    /// Stops then starts one runnable. Dependents are not restarted.
    pub async fn restart(&self, id: &str) -> Result<(), ConfigError> {
        self.stop(id).await;
        self.start(id).await
    }

    /// Snapshot of one instance.
    pub fn get(&self, id: &str) -> Option<RunnableState> {
        let instances = self.inner.instances.lock().unwrap();
        instances.get(id).map(Instance::snapshot)
    }

    /// Snapshots of every instance, ordered by id.
    pub fn get_all(&self) -> Vec<RunnableState> {
        let instances = self.inner.instances.lock().unwrap();
        let mut all: Vec<RunnableState> = instances.values().map(Instance::snapshot).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Stored log lines for a stream; `limit` keeps only the most recent.
    pub fn get_output_lines(
        &self,
        id: &str,
        stream: StreamKind,
        limit: Option<usize>,
    ) -> Vec<String> {
        match limit {
            Some(n) => self.inner.logs.tail(id, stream, n),
            None => self.inner.logs.to_vec(id, stream),
        }
    }

    /// Number of stored log lines for a stream.
    pub fn get_output_length(&self, id: &str, stream: StreamKind) -> usize {
        self.inner.logs.len(id, stream)
    }

    /// Ids of runnables never started since init, ordered.
    pub fn get_hidden_services(&self) -> Vec<String> {
        self.filtered_ids(true)
    }

    /// Ids of runnables visible to UIs, ordered.
    pub fn get_visible_services(&self) -> Vec<String> {
        self.filtered_ids(false)
    }

    fn filtered_ids(&self, hidden: bool) -> Vec<String> {
        let instances = self.inner.instances.lock().unwrap();
        let mut ids: Vec<String> = instances
            .values()
            .filter(|inst| inst.hidden == hidden)
            .map(|inst| inst.spec.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Expands targets to their transitive dependency closure (BFS),
    /// validating that every id and every dependency is defined.
    fn closure(&self, targets: &[String]) -> Result<Vec<String>, ConfigError> {
        let specs = &self.inner.specs;
        let mut set = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for id in targets {
            if !specs.contains_key(id) {
                return Err(ConfigError::UnknownRunnable { id: id.clone() });
            }
            if seen.insert(id.clone()) {
                queue.push_back(id.clone());
            }
        }
        while let Some(id) = queue.pop_front() {
            let spec = &specs[&id];
            for dep in &spec.depends_on {
                if !specs.contains_key(dep) {
                    return Err(ConfigError::MissingDependency {
                        id: id.clone(),
                        dep: dep.clone(),
                        known: specs.keys().cloned().collect(),
                    });
                }
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
            set.push(id);
        }
        Ok(set)
    }

    /// Kahn's algorithm over the set, edges restricted to the set. The
    /// remaining ids name the cycle on failure.
    fn topo_order(&self, set: &[String]) -> Result<Vec<String>, ConfigError> {
        let members: HashSet<&str> = set.iter().map(String::as_str).collect();
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for id in set {
            let spec = &self.inner.specs[id];
            let deps_in_set = spec
                .depends_on
                .iter()
                .filter(|dep| members.contains(dep.as_str()))
                .count();
            indegree.insert(id, deps_in_set);
            for dep in &spec.depends_on {
                if members.contains(dep.as_str()) {
                    dependents.entry(dep).or_default().push(id);
                }
            }
        }

        let mut queue: VecDeque<&str> = set
            .iter()
            .map(String::as_str)
            .filter(|id| indegree[id] == 0)
            .collect();
        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let degree = indegree.get_mut(child).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if order.len() < set.len() {
            let mut remaining: Vec<String> = set
                .iter()
                .filter(|id| !order.contains(id))
                .cloned()
                .collect();
            remaining.sort();
            return Err(ConfigError::DependencyCycle { ids: remaining });
        }
        Ok(order)
    }
}

/// Waits until the watched status is `stopped` or `error`.
async fn wait_until_exited(rx: &mut watch::Receiver<RunnableStatus>) {
    loop {
        let status = *rx.borrow_and_update();
        if matches!(status, RunnableStatus::Stopped | RunnableStatus::Error) {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Waits until the watched status is `running`; errors when the dependency
/// lands in `stopped` or `error` instead. The caller stays `waiting` either
/// way; the recovery watcher retries after an error.
async fn wait_until_running(rx: &mut watch::Receiver<RunnableStatus>) -> Result<(), ()> {
    loop {
        let status = *rx.borrow_and_update();
        match status {
            RunnableStatus::Running => return Ok(()),
            RunnableStatus::Stopped | RunnableStatus::Error => return Err(()),
            RunnableStatus::Waiting | RunnableStatus::Starting => {}
        }
        if rx.changed().await.is_err() {
            return Err(());
        }
    }
}

// Applies a status mutation and publishes it, all under the instances lock,
// so per-id event order matches transition order.
fn apply_status(
    bus: &EventBus,
    inst: &mut Instance,
    status: RunnableStatus,
    error: Option<String>,
) {
    inst.status = status;
    inst.error = error.clone();
    inst.status_tx.send_replace(status);
    bus.emit(SupervisorEvent::StatusChange {
        id: inst.spec.id.clone(),
        status,
        error,
    });
}

/// The gated start path: unhide, skip active instances, spawn immediately
/// when every dependency is running, otherwise park in `waiting` and arm a
/// dependency gate.
fn start_internal(inner: &Arc<Inner>, id: &str) {
    let mut instances = inner.instances.lock().unwrap();
    let Some(inst) = instances.get(id) else { return };
    let spec = inst.spec.clone();
    let was_hidden = inst.hidden;
    let active = matches!(
        inst.status,
        RunnableStatus::Running | RunnableStatus::Starting
    );
    if was_hidden {
        let inst = instances.get_mut(id).unwrap();
        inst.hidden = false;
        inner.bus.emit(SupervisorEvent::HiddenChange {
            id: id.to_string(),
            hidden: false,
        });
    }
    if active {
        return;
    }

    let not_running: Vec<String> = spec
        .depends_on
        .iter()
        .filter(|dep| {
            instances
                .get(dep.as_str())
                .map_or(true, |dep_inst| dep_inst.status != RunnableStatus::Running)
        })
        .cloned()
        .collect();

    if not_running.is_empty() {
        let overlay = collect_inherited_env(inner, &spec.depends_on);
        begin_spawn(inner, &mut instances, id, overlay);
        return;
    }

    // Subscribe to every dependency before publishing `waiting`, so no
    // transition can slip between the snapshot and the wait.
    let gates: Vec<watch::Receiver<RunnableStatus>> = spec
        .depends_on
        .iter()
        .filter_map(|dep| instances.get(dep.as_str()))
        .map(|dep_inst| dep_inst.status_tx.subscribe())
        .collect();

    let inst = instances.get_mut(id).unwrap();
    inst.waiting_for = not_running;
    inst.gate_seq += 1;
    let seq = inst.gate_seq;
    if inst.status != RunnableStatus::Waiting {
        apply_status(&inner.bus, inst, RunnableStatus::Waiting, None);
    }
    drop(instances);

    let weak = Arc::downgrade(inner);
    let id = id.to_string();
    tokio::spawn(async move {
        for mut rx in gates {
            if wait_until_running(&mut rx).await.is_err() {
                // A dependency failed or stopped; stay waiting with
                // `waiting_for` intact for the recovery watcher.
                return;
            }
        }
        let Some(inner) = weak.upgrade() else { return };
        let mut instances = inner.instances.lock().unwrap();
        let Some(inst) = instances.get(&id) else { return };
        if inst.gate_seq != seq || inst.status != RunnableStatus::Waiting {
            return;
        }
        let deps = inst.spec.depends_on.clone();
        let all_running = deps.iter().all(|dep| {
            instances
                .get(dep.as_str())
                .is_some_and(|dep_inst| dep_inst.status == RunnableStatus::Running)
        });
        if !all_running {
            return;
        }
        let overlay = collect_inherited_env(&inner, &deps);
        begin_spawn(&inner, &mut instances, &id, overlay);
    });
}

/// Starts a fresh epoch: resets per-epoch state, clears the log buffers and
/// the published runtime env, emits `starting`, and hands off to the spawn
/// task.
fn begin_spawn(
    inner: &Arc<Inner>,
    instances: &mut MutexGuard<'_, HashMap<String, Instance>>,
    id: &str,
    overlay: Vec<(String, String)>,
) {
    let inst = instances.get_mut(id).unwrap();
    inst.epoch += 1;
    let epoch = inst.epoch;
    inst.gate_seq += 1;
    inst.waiting_for.clear();
    inst.stopping = false;
    inst.ready_claimed = false;
    inst.pid = None;
    inst.started_at = Some(SystemTime::now());
    let spec = inst.spec.clone();
    inner.logs.clear(id);
    inner.runtime_env.lock().unwrap().remove(id);
    apply_status(&inner.bus, inst, RunnableStatus::Starting, None);

    let inner = inner.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        run_child(inner, id, spec, overlay, epoch).await;
    });
}

/// Spawns the child and supervises it until exit.
async fn run_child(
    inner: Arc<Inner>,
    id: String,
    spec: Arc<RunnableSpec>,
    overlay: Vec<(String, String)>,
    epoch: u64,
) {
    let env = build_env(&inner.defaults_env, &spec.env, &overlay);
    let mut child = match spawn::spawn_shell(&spec.command, spec.cwd.as_deref(), &env) {
        Ok(child) => child,
        Err(err) => {
            finish_exit(&inner, &id, epoch, Some(err.to_string()));
            return;
        }
    };
    let pid = child.id();

    let stop_requested = {
        let mut instances = inner.instances.lock().unwrap();
        match instances.get_mut(&id) {
            Some(inst) if inst.epoch == epoch => {
                inst.pid = pid;
                inst.stopping
            }
            // Superseded before the child was recorded; kill_on_drop reaps it.
            _ => return,
        }
    };
    if stop_requested {
        if let Some(pid) = pid {
            spawn::signal_group(pid, Signal::Term);
        }
    }

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_stream(
            inner.clone(),
            id.clone(),
            spec.clone(),
            epoch,
            StreamKind::Stdout,
            stdout,
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_stream(
            inner.clone(),
            id.clone(),
            spec.clone(),
            epoch,
            StreamKind::Stderr,
            stderr,
        ));
    }

    if spec.ready_when.is_none() {
        let inner = inner.clone();
        let id = id.clone();
        let grace = spec.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            become_ready(&inner, &id, epoch).await;
        });
    }

    match child.wait().await {
        Ok(status) => {
            let stopping = {
                let instances = inner.instances.lock().unwrap();
                match instances.get(&id) {
                    Some(inst) if inst.epoch == epoch => inst.stopping,
                    _ => return,
                }
            };
            let kind = spawn::classify_exit(&status);
            let error = if stopping { None } else { kind.error_message() };
            finish_exit(&inner, &id, epoch, error);
        }
        Err(err) => finish_exit(&inner, &id, epoch, Some(err.to_string())),
    }
}

/// Reads one pipe line by line into the log store, publishing `output` and
/// evaluating the readiness predicate on each appended line.
async fn read_stream<R>(
    inner: Arc<Inner>,
    id: String,
    spec: Arc<RunnableSpec>,
    epoch: u64,
    stream: StreamKind,
    reader: R,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        let check_ready = {
            let instances = inner.instances.lock().unwrap();
            let Some(inst) = instances.get(&id) else { return };
            if inst.epoch != epoch {
                return;
            }
            // Push and publish under the lock so an epoch reset cannot
            // interleave between the check and the append.
            inner.logs.push(&id, line.clone(), stream);
            inner.bus.emit(SupervisorEvent::Output {
                id: id.clone(),
                line: line.clone(),
                stream,
            });
            spec.ready_when.is_some()
                && inst.status == RunnableStatus::Starting
                && !inst.ready_claimed
        };
        if check_ready {
            let tail = inner
                .logs
                .tail(&id, StreamKind::Combined, READY_SNAPSHOT_LINES)
                .join("\n");
            let text = strip_ansi(&tail);
            if spec.ready_when.as_ref().unwrap().is_match(&text) {
                become_ready(&inner, &id, epoch).await;
            }
        }
    }
}

/// The `starting → running` transition: claims the once-per-epoch slot, runs
/// the `on_ready` hook (best-effort), publishes its env entries, then emits
/// `running`. Skipped when the instance already left `starting`.
async fn become_ready(inner: &Arc<Inner>, id: &str, epoch: u64) {
    {
        let mut instances = inner.instances.lock().unwrap();
        let Some(inst) = instances.get_mut(id) else { return };
        if inst.epoch != epoch || inst.status != RunnableStatus::Starting || inst.ready_claimed {
            return;
        }
        inst.ready_claimed = true;
    }

    let hook = inner.hooks.lock().unwrap().get(id).cloned();
    if let Some(hook) = hook {
        let tail = inner
            .logs
            .tail(id, StreamKind::Combined, READY_SNAPSHOT_LINES)
            .join("\n");
        let writer = EnvWriter::new();
        let context = ReadyContext {
            output: strip_ansi(&tail),
            env: writer.clone(),
        };
        if let Err(err) = hook(context).await {
            tracing::warn!(id, error = %err, "on_ready hook failed");
        }
        let entries = writer.drain();
        if !entries.is_empty() {
            inner
                .runtime_env
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default()
                .extend(entries);
        }
    }

    let mut instances = inner.instances.lock().unwrap();
    let Some(inst) = instances.get_mut(id) else { return };
    if inst.epoch != epoch || inst.status != RunnableStatus::Starting {
        return;
    }
    apply_status(&inner.bus, inst, RunnableStatus::Running, None);
}

/// Terminal transition for an epoch: `stopped` without an error, `error`
/// with one.
fn finish_exit(inner: &Arc<Inner>, id: &str, epoch: u64, error: Option<String>) {
    let mut instances = inner.instances.lock().unwrap();
    let Some(inst) = instances.get_mut(id) else { return };
    if inst.epoch != epoch {
        return;
    }
    inst.pid = None;
    inst.stopping = false;
    let status = if error.is_some() {
        RunnableStatus::Error
    } else {
        RunnableStatus::Stopped
    };
    apply_status(&inner.bus, inst, status, error);
}

/// Union of the runtime env published by each dependency, in dependency
/// order; later entries win when spawned.
fn collect_inherited_env(inner: &Inner, deps: &[String]) -> Vec<(String, String)> {
    let runtime_env = inner.runtime_env.lock().unwrap();
    let mut overlay = Vec::new();
    for dep in deps {
        if let Some(entries) = runtime_env.get(dep) {
            overlay.extend(entries.iter().cloned());
        }
    }
    overlay
}

// Merge order, later wins: process env (inherited by the child), config
// defaults, definition env, inherited runtime env, forced FORCE_COLOR.
fn build_env(
    defaults: &[(String, String)],
    definition: &HashMap<String, String>,
    overlay: &[(String, String)],
) -> Vec<(String, String)> {
    let mut env = defaults.to_vec();
    let mut definition: Vec<(String, String)> = definition
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    definition.sort();
    env.extend(definition);
    env.extend(overlay.iter().cloned());
    env.push(("FORCE_COLOR".to_string(), "1".to_string()));
    env
}

/// Subscribes once per supervisor: whenever any runnable reaches `running`,
/// re-issues the gated start for every waiter whose dependencies are now all
/// `running`.
fn install_recovery_watcher(inner: &Arc<Inner>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    inner.bus.on_status_change(move |event| {
        if let SupervisorEvent::StatusChange {
            status: RunnableStatus::Running,
            ..
        } = event
        {
            let _ = tx.send(());
        }
    });

    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            let Some(inner) = weak.upgrade() else { break };
            let recovered: Vec<String> = {
                let instances = inner.instances.lock().unwrap();
                instances
                    .values()
                    .filter(|inst| inst.status == RunnableStatus::Waiting)
                    .filter(|inst| {
                        inst.spec.depends_on.iter().all(|dep| {
                            instances
                                .get(dep.as_str())
                                .is_some_and(|dep_inst| dep_inst.status == RunnableStatus::Running)
                        })
                    })
                    .map(|inst| inst.spec.id.clone())
                    .collect()
            };
            for id in recovered {
                start_internal(&inner, &id);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::runnable::ReadyFuture;

    fn supervisor(raw: &str) -> Supervisor {
        let config: Config = toml::from_str(raw).unwrap();
        Supervisor::new(&config).unwrap()
    }

    async fn wait_for_status(
        supervisor: &Supervisor,
        id: &str,
        status: RunnableStatus,
        timeout: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if supervisor.get(id).map(|state| state.status) == Some(status) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "{} never reached {} (currently {:?})",
                    id,
                    status,
                    supervisor.get(id).map(|state| state.status)
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn single_service_reaches_running_after_grace() {
        let supervisor = supervisor(
            r#"
[runnables.api]
command = "echo hi && sleep 30"
grace_ms = 100
"#,
        );
        supervisor.start_all(&["api".into()]).await.unwrap();
        assert_eq!(
            supervisor.get("api").unwrap().status,
            RunnableStatus::Starting
        );
        wait_for_status(&supervisor, "api", RunnableStatus::Running, Duration::from_secs(5)).await;
        assert_eq!(
            supervisor.get_output_lines("api", StreamKind::Stdout, None),
            vec!["hi"]
        );
        assert!(supervisor.get("api").unwrap().pid.is_some());
        supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_predicate_fires_on_matching_line() {
        let supervisor = supervisor(
            r#"
[runnables.db]
command = "echo booting; printf '\\033[32mlistening\\033[0m on 5432\\n'; sleep 30"
ready_when = "listening on \\d+"
grace_ms = 10000
"#,
        );
        supervisor.start_all(&["db".into()]).await.unwrap();
        // The grace timer is far away; only the predicate can fire.
        wait_for_status(&supervisor, "db", RunnableStatus::Running, Duration::from_secs(5)).await;
        assert_eq!(
            supervisor.get_output_length("db", StreamKind::Combined),
            2
        );
        supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dependent_waits_then_inherits_runtime_env() {
        let supervisor = supervisor(
            r#"
[runnables.a]
command = "echo up && sleep 30"
grace_ms = 100
[runnables.b]
command = "echo \"url=$URL\" && sleep 30"
grace_ms = 50
depends_on = ["a"]
"#,
        );
        supervisor.set_on_ready(
            "a",
            Arc::new(|context: ReadyContext| {
                Box::pin(async move {
                    context.env.set("URL", "http://x");
                    Ok(())
                }) as ReadyFuture
            }),
        );
        supervisor.start_all(&["b".into()]).await.unwrap();

        let b = supervisor.get("b").unwrap();
        assert_eq!(b.status, RunnableStatus::Waiting);
        assert_eq!(b.waiting_for, vec!["a"]);

        wait_for_status(&supervisor, "b", RunnableStatus::Running, Duration::from_secs(5)).await;
        assert_eq!(
            supervisor.get_output_lines("b", StreamKind::Stdout, None),
            vec!["url=http://x"]
        );
        assert!(supervisor.get("b").unwrap().waiting_for.is_empty());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn cycle_fails_fast_without_spawning() {
        let supervisor = supervisor(
            r#"
[runnables.a]
command = "sleep 30"
depends_on = ["b"]
[runnables.b]
command = "sleep 30"
depends_on = ["a"]
"#,
        );
        let err = supervisor
            .start_all(&["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Dependency cycle detected: a, b");
        assert_eq!(supervisor.get("a").unwrap().status, RunnableStatus::Stopped);
        assert_eq!(supervisor.get("b").unwrap().status, RunnableStatus::Stopped);
    }

    #[tokio::test]
    async fn missing_dependency_is_a_config_error() {
        let supervisor = supervisor(
            r#"
[runnables.a]
command = "sleep 30"
depends_on = ["ghost"]
"#,
        );
        let err = supervisor.start_all(&["a".into()]).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("ghost"), "unexpected: {}", message);
        assert!(message.contains("known runnables: a"), "unexpected: {}", message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_error_status() {
        let supervisor = supervisor(
            r#"
[runnables.api]
command = "exit 3"
grace_ms = 50
"#,
        );
        supervisor.start_all(&["api".into()]).await.unwrap();
        wait_for_status(&supervisor, "api", RunnableStatus::Error, Duration::from_secs(5)).await;
        let state = supervisor.get("api").unwrap();
        assert_eq!(state.error.as_deref(), Some("Exited with code 3"));
        assert!(state.pid.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_the_whole_group_and_classifies_as_stopped() {
        let supervisor = supervisor(
            r#"
[runnables.api]
command = "echo spawned && sleep 300 & sleep 300 & wait"
grace_ms = 100
"#,
        );
        supervisor.start_all(&["api".into()]).await.unwrap();
        wait_for_status(&supervisor, "api", RunnableStatus::Running, Duration::from_secs(5)).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while supervisor.get_output_length("api", StreamKind::Combined) < 1 {
            assert!(tokio::time::Instant::now() < deadline, "output never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lines_before = supervisor.get_output_length("api", StreamKind::Combined);
        supervisor.stop("api").await;
        let state = supervisor.get("api").unwrap();
        assert_eq!(state.status, RunnableStatus::Stopped);
        assert!(state.error.is_none());
        assert!(state.pid.is_none());
        // Stopping does not touch the buffers.
        assert_eq!(
            supervisor.get_output_length("api", StreamKind::Combined),
            lines_before
        );
        // Idempotent.
        supervisor.stop("api").await;
        assert_eq!(supervisor.get("api").unwrap().status, RunnableStatus::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_is_a_noop_while_active() {
        let supervisor = supervisor(
            r#"
[runnables.api]
command = "sleep 30"
grace_ms = 50
"#,
        );
        supervisor.start("api").await.unwrap();
        wait_for_status(&supervisor, "api", RunnableStatus::Running, Duration::from_secs(5)).await;
        let pid = supervisor.get("api").unwrap().pid;
        supervisor.start("api").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.get("api").unwrap().pid, pid);
        supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_begins_a_fresh_epoch() {
        let supervisor = supervisor(
            r#"
[runnables.api]
command = "echo once && sleep 30"
grace_ms = 50
"#,
        );
        supervisor.start("api").await.unwrap();
        wait_for_status(&supervisor, "api", RunnableStatus::Running, Duration::from_secs(5)).await;
        let first_started = supervisor.get("api").unwrap().started_at;

        supervisor.restart("api").await.unwrap();
        wait_for_status(&supervisor, "api", RunnableStatus::Running, Duration::from_secs(5)).await;
        let state = supervisor.get("api").unwrap();
        assert!(state.error.is_none());
        assert!(state.started_at > first_started);
        // Buffers were cleared and refilled by the new epoch only.
        assert_eq!(
            supervisor.get_output_lines("api", StreamKind::Combined, None),
            vec!["once"]
        );
        supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn waiter_survives_dep_failure_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("flag");
        let supervisor = supervisor(&format!(
            r#"
[runnables.a]
command = "test -f {flag} && sleep 30"
grace_ms = 50
[runnables.b]
command = "sleep 30"
grace_ms = 50
depends_on = ["a"]
"#,
            flag = flag.display()
        ));
        supervisor.start_all(&["b".into()]).await.unwrap();
        wait_for_status(&supervisor, "a", RunnableStatus::Error, Duration::from_secs(5)).await;

        // The waiter stays parked with its gate intact.
        let b = supervisor.get("b").unwrap();
        assert_eq!(b.status, RunnableStatus::Waiting);
        assert_eq!(b.waiting_for, vec!["a"]);

        std::fs::write(&flag, b"").unwrap();
        supervisor.start("a").await.unwrap();
        wait_for_status(&supervisor, "b", RunnableStatus::Running, Duration::from_secs(5)).await;
        supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hidden_until_first_start() {
        let supervisor = supervisor(
            r#"
[runnables.a]
command = "sleep 30"
grace_ms = 50
[runnables.b]
command = "sleep 30"
grace_ms = 50
depends_on = ["a"]
[runnables.c]
command = "sleep 30"
"#,
        );
        assert_eq!(supervisor.get_hidden_services(), vec!["a", "b", "c"]);
        supervisor.start_with_dependencies("b").await.unwrap();
        assert_eq!(supervisor.get_visible_services(), vec!["a", "b"]);
        assert_eq!(supervisor.get_hidden_services(), vec!["c"]);
        supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_on_a_waiting_instance_cancels_the_gate() {
        let supervisor = supervisor(
            r#"
[runnables.a]
command = "sleep 30"
grace_ms = 2000
[runnables.b]
command = "sleep 30"
grace_ms = 50
depends_on = ["a"]
"#,
        );
        supervisor.start_all(&["b".into()]).await.unwrap();
        assert_eq!(supervisor.get("b").unwrap().status, RunnableStatus::Waiting);
        supervisor.stop("b").await;
        let b = supervisor.get("b").unwrap();
        assert_eq!(b.status, RunnableStatus::Stopped);
        assert!(b.waiting_for.is_empty());
        // a becoming ready later must not resurrect the cancelled gate.
        wait_for_status(&supervisor, "a", RunnableStatus::Running, Duration::from_secs(6)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.get("b").unwrap().status, RunnableStatus::Stopped);
        supervisor.stop_all().await;
    }

    #[test]
    fn env_merge_precedence_later_wins() {
        let defaults = vec![
            ("SHARED".to_string(), "defaults".to_string()),
            ("ONLY_DEFAULT".to_string(), "1".to_string()),
        ];
        let mut definition = HashMap::new();
        definition.insert("SHARED".to_string(), "definition".to_string());
        definition.insert("ONLY_DEF".to_string(), "1".to_string());
        let overlay = vec![("SHARED".to_string(), "runtime".to_string())];

        let env = build_env(&defaults, &definition, &overlay);
        let last = |key: &str| {
            env.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(last("SHARED").as_deref(), Some("runtime"));
        assert_eq!(last("ONLY_DEFAULT").as_deref(), Some("1"));
        assert_eq!(last("ONLY_DEF").as_deref(), Some("1"));
        assert_eq!(last("FORCE_COLOR").as_deref(), Some("1"));
        assert_eq!(env.last().unwrap().0, "FORCE_COLOR");
    }
}
