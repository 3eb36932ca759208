//! Coordinator - スケジューリング状態を 1 タスクで持つ event loop
//!
//! # フロー
//! 1. 起動: journal recovery → graph 読み込み → 依存カウンタ構築 → persister 起動
//! 2. 全 slot を launch
//! 3. `select!` で accept / connection event / tick を待つ
//! 4. Ready と Running が空になったら drain（idle worker に terminate）
//! 5. persister を drain-then-join して `RunReport` を返す
//!
//! slot table・依存エンジン・グラフのミラーはこのタスクだけが触るので
//! ロックは不要。ディスク書き込みは persister に enqueue するだけ。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::CoordinatorConfig;
use super::connection::{ConnEvent, ConnId, Directive, Report, Welcome, serve_connection};
use super::slots::{ConnHandle, Slot, SlotState, SlotTable};
use crate::agent::{ExecutorRegistry, required_modules};
use crate::domain::{
    ExitOutcome, ExternalJobId, GroupId, RunRecord, SlotId, Task, TaskRef, WORKER_LOST_STATUS,
};
use crate::error::DroverError;
use crate::observability::ProgressCounts;
use crate::ports::{LaunchRequest, Launcher};
use crate::queue::{Decision, DependencyEngine, RetryPolicy};
use crate::store::journal::{self, Recovery};
use crate::store::{GraphStore, MetaLog, PersistStats, Persister, meta_path};
use crate::wire::Assignment;

/// Final state of one coordinator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Some task ran out of attempts without ignore-failure.
    pub failed: bool,
    pub failed_tasks: Vec<TaskRef>,
    pub tasks: usize,
    pub completed: usize,
    pub persisted: PersistStats,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    store: GraphStore,
    engine: DependencyEngine,
    slots: SlotTable,
    persister: Persister,
    meta: MetaLog,
    launcher: Arc<dyn Launcher>,
    retry: RetryPolicy,
    worker_threads: u32,
    /// Host and port workers connect back to.
    endpoint: (String, u16),
    failed_tasks: Vec<TaskRef>,
    /// Failed attempts in this run. Persisted `attempts` spans all runs.
    failures: HashMap<TaskRef, u32>,
    draining: bool,
    next_conn: u64,
    last_progress: Option<ProgressCounts>,
}

impl Coordinator {
    /// Recover, load and validate the graph. Must be called inside a tokio runtime.
    pub fn open(
        config: CoordinatorConfig,
        graph: &Path,
        launcher: Arc<dyn Launcher>,
        registry: &ExecutorRegistry,
    ) -> Result<Self, DroverError> {
        match journal::recover(graph)? {
            Recovery::Clean => debug!(graph = %graph.display(), "no journal to replay"),
            Recovery::Replayed { writes } => {
                warn!(writes, "replayed journal left by an interrupted run")
            }
        }

        let store = GraphStore::open(graph)?;
        let required = required_modules(store.groups());
        registry.expect(required.iter().map(String::as_str))?;

        let engine = DependencyEngine::from_groups(store.groups());
        let meta = MetaLog::open(meta_path(graph))?;
        let slots = SlotTable::new(config.workers.max(1), &config.resolve_tmp_prefix(graph));
        let worker_threads = config.worker_threads.unwrap_or_else(|| store.max_threads());
        let endpoint = (config.resolve_advertise_host(), config.port);
        let persister = Persister::spawn(graph.to_path_buf(), config.flush_threshold);

        info!(
            groups = store.len(),
            tasks = store.task_count(),
            completed = store.completed_count(),
            ready = engine.ready_len(),
            "graph loaded"
        );

        Ok(Self {
            config,
            store,
            engine,
            slots,
            persister,
            meta,
            launcher,
            retry: RetryPolicy,
            worker_threads,
            endpoint,
            failed_tasks: Vec::new(),
            failures: HashMap::new(),
            draining: false,
            next_conn: 0,
            last_progress: None,
        })
    }

    pub fn failed(&self) -> bool {
        !self.failed_tasks.is_empty()
    }

    /// Serve workers until every task has settled, then drain and shut down.
    pub async fn run(mut self, listener: TcpListener) -> Result<RunReport, DroverError> {
        self.endpoint.1 = listener.local_addr()?.port();
        info!(
            host = %self.endpoint.0,
            port = self.endpoint.1,
            workers = self.slots.len(),
            threads = self.worker_threads,
            launcher = self.launcher.name(),
            "coordinator listening"
        );

        let (events_tx, mut events) = mpsc::unbounded_channel();
        if !self.engine.is_drained() {
            self.launch_all().await;
        }

        let mut tick = tokio::time::interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.engine.is_drained() {
            tokio::select! {
                accepted = listener.accept() => self.accept(accepted, &events_tx),
                Some(event) = events.recv() => self.handle_event(event).await?,
                _ = tick.tick() => self.on_tick().await,
            }
            self.log_progress();
        }

        self.begin_drain();
        while self.slots.connected() > 0 {
            tokio::select! {
                accepted = listener.accept() => self.accept(accepted, &events_tx),
                Some(event) = events.recv() => self.handle_event(event).await?,
            }
        }

        self.into_report().await
    }

    async fn launch_all(&mut self) {
        for slot in self.slots.ids() {
            self.launch(slot).await;
        }
    }

    fn accept(
        &mut self,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
        events: &mpsc::UnboundedSender<ConnEvent>,
    ) {
        match accepted {
            Ok((stream, peer)) => {
                let conn = ConnId(self.next_conn);
                self.next_conn += 1;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%conn, error = %e, "set_nodelay failed");
                }
                debug!(%conn, %peer, "accepted connection");
                tokio::spawn(serve_connection(conn, stream, events.clone()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    async fn handle_event(&mut self, event: ConnEvent) -> Result<(), DroverError> {
        match event {
            ConnEvent::Hello {
                conn,
                job_id,
                directives,
                reply,
            } => {
                let welcome = self.on_hello(conn, job_id, directives).await?;
                // a dropped reply means the socket is already gone; Closed follows
                let _ = reply.send(welcome);
            }
            ConnEvent::Registered { conn, capture } => {
                if let Some(slot) = self.slots.slot_for_conn(conn) {
                    info!(%slot, out = %capture.out.display(), "worker connected");
                    self.slots.register(slot, capture);
                }
            }
            ConnEvent::Started { conn, record } => {
                debug!(%conn, run = %record.run_id, group = %record.group, task = record.task, "task started");
            }
            ConnEvent::Report { conn, report } => {
                let Some(slot) = self.slots.slot_for_conn(conn) else {
                    debug!(%conn, "report from a released connection");
                    return Ok(());
                };
                match report {
                    Report::Idle => self.on_idle(slot).await?,
                    Report::Finished { status, record } => {
                        self.on_finished(slot, status, record).await?
                    }
                    Report::Running => {
                        debug!(%slot, "still running");
                        self.slots.send(slot, Directive::Ack);
                    }
                }
            }
            ConnEvent::Closed { conn, reason } => {
                if let Some(slot) = self.slots.slot_for_conn(conn) {
                    warn!(%slot, %reason, "worker connection lost");
                    self.fail_slot(slot).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_hello(
        &mut self,
        conn: ConnId,
        job_id: ExternalJobId,
        directives: mpsc::UnboundedSender<Directive>,
    ) -> Result<Option<Welcome>, DroverError> {
        let Some(slot) = self.slots.slot_for_job(job_id) else {
            warn!(%conn, %job_id, "connection from unknown job id");
            return Ok(None);
        };
        if self.slots.get(slot).is_some_and(Slot::is_active) {
            warn!(%slot, %job_id, "second connection for one worker, resetting slot");
            self.fail_slot(slot).await?;
            return Ok(None);
        }

        self.slots.attach(slot, ConnHandle { id: conn, directives });
        let tmp_base = self
            .slots
            .get(slot)
            .map(|s| s.tmp_base.clone())
            .unwrap_or_default();
        debug!(%slot, %job_id, %conn, "handshake");
        Ok(Some(Welcome {
            slot,
            working_dir: self.config.working_dir.clone(),
            tmp_base,
        }))
    }

    async fn on_idle(&mut self, slot: SlotId) -> Result<(), DroverError> {
        if self.slots.get(slot).is_some_and(|s| s.assignment.is_some()) {
            warn!(%slot, "idle report while a task is assigned");
            return self.fail_slot(slot).await;
        }
        if self.draining {
            self.slots.send(slot, Directive::Terminate);
            self.slots.reset(slot);
            return Ok(());
        }

        if let Some(task_ref) = self.engine.pop_ready() {
            let task = self.task(task_ref)?;
            let deep_sleep = task.deep_sleep;
            let assignment = Assignment {
                group: task_ref.group,
                task: task_ref.task,
                attempt: task.attempts + 1,
                command: task.command.clone(),
            };
            self.engine.start(task_ref, deep_sleep);
            self.slots.assign(slot, task_ref);
            info!(
                %slot,
                task = %task_ref,
                attempt = assignment.attempt,
                command = %assignment.command.label(),
                "assigned"
            );
            self.slots.send(slot, Directive::Assign(assignment));
        } else if self.engine.only_deep_sleepers_left() {
            info!(
                %slot,
                deep_sleepers = self.engine.deep_sleep_running(),
                "only deep sleepers running, retiring worker"
            );
            self.slots.send(slot, Directive::Terminate);
            self.slots.retire(slot);
        } else {
            self.slots.await_wakeup(slot);
        }
        Ok(())
    }

    async fn on_finished(
        &mut self,
        slot: SlotId,
        status: i32,
        record: RunRecord,
    ) -> Result<(), DroverError> {
        self.meta.append(&record)?;
        self.slots.send(slot, Directive::Ack);

        let Some(task_ref) = self.slots.take_assignment(slot) else {
            warn!(%slot, "finished report without an assignment");
            return Ok(());
        };
        if record.group != task_ref.group || record.task != task_ref.task {
            warn!(%slot, expected = %task_ref, group = %record.group, task = record.task, "run record names another task");
        }
        let deep_sleep = self.task(task_ref)?.deep_sleep;
        self.engine.finish(task_ref, deep_sleep);

        let outcome = ExitOutcome::from_raw(status);
        if outcome.is_success() {
            self.task_mut(task_ref)?.mark_completed(status);
            self.complete(task_ref).await
        } else {
            warn!(%slot, task = %task_ref, outcome = %outcome.describe(), "task failed");
            self.on_failure(task_ref, status).await
        }
    }

    /// Persist the task's group, then release downstream groups.
    async fn complete(&mut self, task_ref: TaskRef) -> Result<(), DroverError> {
        self.persist(task_ref.group)?;
        let activated = self.engine.complete(task_ref.group, self.store.groups());
        debug!(task = %task_ref, "task completed");
        if activated > 0 {
            info!(activated, "new tasks ready");
            self.process_wakeups();
            self.process_resubmits().await;
        }
        Ok(())
    }

    async fn on_failure(&mut self, task_ref: TaskRef, status: i32) -> Result<(), DroverError> {
        let group_max = self
            .store
            .group(task_ref.group)
            .map(|g| g.max_attempts)
            .ok_or(DroverError::UnknownTask(task_ref))?;
        let policy = self.retry;
        let failures = self.failures.entry(task_ref).or_default();
        *failures += 1;
        let failures = *failures;
        let task = self.task_mut(task_ref)?;
        task.record_failure(status);

        match policy.decide(task, group_max, failures) {
            Decision::Forgive { attempts, limit } => {
                warn!(task = %task_ref, attempts, limit, "out of attempts, failure ignored");
                task.completed = true;
                self.complete(task_ref).await
            }
            Decision::GiveUp { attempts, limit } => {
                error!(task = %task_ref, attempts, limit, "out of attempts, pipeline failed");
                self.failed_tasks.push(task_ref);
                self.persist(task_ref.group)
            }
            Decision::Requeue { attempts, limit } => {
                info!(task = %task_ref, attempts, limit, "requeueing");
                self.persist(task_ref.group)?;
                self.engine.requeue(task_ref);
                self.process_wakeups();
                self.process_resubmits().await;
                Ok(())
            }
        }
    }

    /// Protocol violation or lost connection: book the running task as
    /// failed and free the slot.
    async fn fail_slot(&mut self, slot: SlotId) -> Result<(), DroverError> {
        let assignment = self.slots.take_assignment(slot);
        if self.draining {
            self.slots.reset(slot);
        } else {
            self.slots.park_restart(slot);
        }

        if let Some(task_ref) = assignment {
            warn!(%slot, task = %task_ref, "worker lost while running a task");
            let deep_sleep = self.task(task_ref)?.deep_sleep;
            self.engine.finish(task_ref, deep_sleep);
            self.on_failure(task_ref, WORKER_LOST_STATUS).await?;
        }
        Ok(())
    }

    fn process_wakeups(&mut self) {
        for slot in self.slots.take_wakeups() {
            if self.slots.send(slot, Directive::Wakeup) {
                debug!(%slot, "woke worker");
                self.slots.set_state(slot, SlotState::Idle);
            }
        }
    }

    async fn process_resubmits(&mut self) {
        for slot in self.slots.take_resubmits() {
            info!(%slot, "resubmitting retired worker");
            self.launch(slot).await;
        }
    }

    async fn on_tick(&mut self) {
        if self.draining {
            return;
        }
        for slot in self.slots.take_restarts() {
            self.launch(slot).await;
        }
    }

    async fn launch(&mut self, slot: SlotId) {
        let Some(tmp_base) = self.slots.get(slot).map(|s| s.tmp_base.clone()) else {
            return;
        };
        let request = LaunchRequest {
            slot,
            coordinator_host: self.endpoint.0.clone(),
            coordinator_port: self.endpoint.1,
            threads: self.worker_threads,
            memory_mb: self.config.worker_mem_mb,
            time_minutes: self.config.worker_time_min,
            partition: self.config.partition.clone(),
            tmp_base,
            working_dir: self.config.working_dir.clone(),
        };
        match self.launcher.launch(&request).await {
            Ok(job_id) => {
                self.slots.bind_job(slot, job_id);
                let launches = self.slots.get(slot).map_or(0, |s| s.launches);
                info!(%slot, %job_id, launches, "worker launched");
            }
            Err(e) => {
                warn!(%slot, error = %e, "launch failed, retrying on next tick");
                self.slots.mark_restart(slot);
            }
        }
    }

    fn begin_drain(&mut self) {
        self.draining = true;
        info!(
            failed = self.failed(),
            connected = self.slots.connected(),
            "all tasks settled, draining workers"
        );
        for slot in self.slots.awaiting_wakeup() {
            self.slots.send(slot, Directive::Terminate);
            self.slots.reset(slot);
        }
    }

    async fn into_report(self) -> Result<RunReport, DroverError> {
        let Coordinator {
            store,
            persister,
            failed_tasks,
            ..
        } = self;
        let persisted = persister.shutdown().await?;
        let report = RunReport {
            failed: !failed_tasks.is_empty(),
            failed_tasks,
            tasks: store.task_count(),
            completed: store.completed_count(),
            persisted,
        };
        info!(
            failed = report.failed,
            completed = report.completed,
            tasks = report.tasks,
            batches = report.persisted.batches,
            "coordinator finished"
        );
        Ok(report)
    }

    fn persist(&mut self, group: GroupId) -> Result<(), DroverError> {
        let write = self.store.encode_update(group)?;
        self.persister.enqueue(write)?;
        Ok(())
    }

    fn task(&self, task_ref: TaskRef) -> Result<&Task, DroverError> {
        self.store
            .group(task_ref.group)
            .and_then(|g| g.task(task_ref.task))
            .ok_or(DroverError::UnknownTask(task_ref))
    }

    fn task_mut(&mut self, task_ref: TaskRef) -> Result<&mut Task, DroverError> {
        self.store
            .group_mut(task_ref.group)
            .and_then(|g| g.task_mut(task_ref.task))
            .ok_or(DroverError::UnknownTask(task_ref))
    }

    fn log_progress(&mut self) {
        let now = ProgressCounts::of(&self.engine);
        if self.last_progress != Some(now) {
            info!(
                ready = now.ready,
                running = now.running,
                unfinished = now.unfinished,
                "progress"
            );
            self.last_progress = Some(now);
        }
    }
}
