use crate::buffer::{OutputBuffer, OutputLine};
use crate::console_log::ConsoleLog;
use crate::control::{self, ChildHandle, ExitReport, PumpMsg};
use crate::error::SupervisorError;
use crate::hub::{NotificationHub, Subscription};
use crate::parse::SupervisorConfig;
use crate::probe::{HttpProbe, Probe, Readiness, ReadinessProber};
use crate::state::{state_cell, LifecycleState, StateChange, StateReader, StateWriter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    Restart(Reply),
}

/// Everything the background tasks tell the monitor. Each carries the generation
/// of the run it belongs to, so results from an earlier child are dropped.
#[derive(Debug)]
enum Event {
    Ready { generation: u64, attempts: u32, elapsed: Duration },
    TimedOut { generation: u64, elapsed: Duration },
    Degraded { generation: u64, failures: u32 },
    Exited { generation: u64, report: ExitReport },
}


/// Handle to one supervised service. Cheap to clone; all clones drive the same child.
///
/// Must be created inside a Tokio runtime. When the last handle is dropped the
/// monitor task stops the child and exits.
#[derive(Clone)]
pub struct Supervisor {
    commands: mpsc::UnboundedSender<Command>,
    state: StateReader,
    output: Arc<OutputBuffer>,
    hub: Arc<NotificationHub>,
    last_error: Arc<Mutex<Option<String>>>,
    config: Arc<SupervisorConfig>,
}

impl Supervisor {
    /// Supervises with the HTTP readiness probe against `http://<host>:<port>/`.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let probe = HttpProbe::new(&config.host, config.port, config.probe_timeout)
            .map_err(SupervisorError::Probe)?;
        Ok(Self::with_probe(config, Arc::new(probe)))
    }



    /*
        @@@
        @with_probe();
        . Builds the shared pieces: state cell, output buffer, notification hub.
        . Spawns the output collector, the single appender of the buffer.
        . Spawns the monitor task, which alone holds the StateWriter and the child handle.
    */
    pub fn with_probe(config: SupervisorConfig, probe: Arc<dyn Probe>) -> Self {
        let config = Arc::new(config);
        let (writer, reader) = state_cell(LifecycleState::Stopped);
        let output = Arc::new(OutputBuffer::new(config.max_console_lines));
        let hub = Arc::new(NotificationHub::new());
        let last_error = Arc::new(Mutex::new(None));

        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        let console_log = config.console_log.clone().map(ConsoleLog::new);
        tokio::spawn(
            collect_output(pump_rx, output.clone(), hub.clone(), console_log)
                .instrument(info_span!("output-collector")),
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let monitor = Monitor {
            prober: Arc::new(ReadinessProber::new(probe, config.probe_interval)),
            config: config.clone(),
            state: writer,
            hub: hub.clone(),
            last_error: last_error.clone(),
            pump_tx,
            events: event_tx,
            child: None,
            generation: 0,
        };
        tokio::spawn(monitor.run(cmd_rx, event_rx).instrument(info_span!("monitor")));

        info!(cmd = %config.command_line(), host = %config.host, port = config.port, "supervisor initialized");

        Self {
            commands: cmd_tx,
            state: reader,
            output,
            hub,
            last_error,
            config,
        }
    }

    /// Spawns the child and returns once it is Starting; readiness arrives later as a state change.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.request(Command::Start).await
    }

    /// Returns once the child is gone and the state is Stopped. A no-op when already Stopped.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.request(Command::Stop).await
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.request(Command::Restart).await
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn output_lines(&self) -> Vec<OutputLine> {
        self.output.snapshot()
    }

    pub fn output_tail(&self, n: usize) -> Vec<OutputLine> {
        self.output.tail(n)
    }

    pub fn clear_output(&self) {
        self.output.clear();
    }

    /// Reason recorded by the last move into Error; cleared on the next start.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn subscribe_state<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hub.subscribe_state(callback)
    }

    pub fn subscribe_output<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OutputLine) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hub.subscribe_output(callback)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.hub.unsubscribe(subscription)
    }

    async fn request(&self, make: fn(Reply) -> Command) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)?
    }
}


async fn collect_output(
    mut rx: mpsc::UnboundedReceiver<PumpMsg>,
    buffer: Arc<OutputBuffer>,
    hub: Arc<NotificationHub>,
    mut console_log: Option<ConsoleLog>,
) {
    let mut seq = 0u64;
    while let Some(msg) = rx.recv().await {
        match msg {
            PumpMsg::Line(stream, text) => {
                seq += 1;
                if let Some(log) = console_log.as_mut() {
                    log.write_line(&text).await;
                }
                let line = OutputLine::new(seq, stream, text);
                buffer.append(line.clone());
                hub.publish_output(&line);
            }
            PumpMsg::Marker(action) => {
                if let Some(log) = console_log.as_mut() {
                    log.write_marker(action).await;
                }
            }
        }
    }
    debug!("output collector ended");
}


/// The single writer of the lifecycle state and sole owner of the child.
struct Monitor {
    config: Arc<SupervisorConfig>,
    state: StateWriter,
    hub: Arc<NotificationHub>,
    last_error: Arc<Mutex<Option<String>>>,
    prober: Arc<ReadinessProber>,
    pump_tx: mpsc::UnboundedSender<PumpMsg>,
    events: mpsc::UnboundedSender<Event>,
    child: Option<ChildHandle>,
    generation: u64,
}

impl Monitor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        debug!("all supervisor handles dropped; shutting down");
        self.stop().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(Ok(()));
            }
            Command::Restart(reply) => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
        }
    }



    /*
        @@@
        @start();
        . Rejects the call while a child may be alive (Starting, Running, Stopping).
        . From Error, first tears down whatever is left of the failed run.
        . Moves to Starting, spawns the child and kicks off the readiness wait in the background.
        . A spawn failure lands in Error and is also returned to the caller.
    */
    async fn start(&mut self) -> Result<(), SupervisorError> {
        let current = self.state.current();
        if current.is_live() {
            warn!(state = %current, "cannot start");
            return Err(SupervisorError::InvalidOperation { op: "start", state: current });
        }
        if current == LifecycleState::Error {
            self.teardown().await;
        }

        self.set_state(LifecycleState::Starting, None);
        self.marker("STARTING");

        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        let spawned = control::spawn_child(&self.config, generation, self.pump_tx.clone(), move |report| {
            let _ = events.send(Event::Exited { generation, report });
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to start service");
                self.set_state(LifecycleState::Error, Some(e.to_string()));
                return Err(e);
            }
        };
        info!(pid = handle.pid, generation, cmd = %self.config.command_line(), "service process spawned");

        let prober = self.prober.clone();
        let timeout = self.config.health_check_timeout;
        let token = handle.cancel.clone();
        let events = self.events.clone();
        tokio::spawn(
            async move {
                let event = match prober.wait_until_ready(timeout, &token).await {
                    Readiness::Ready { attempts, elapsed } => Event::Ready { generation, attempts, elapsed },
                    Readiness::TimedOut { elapsed, .. } => Event::TimedOut { generation, elapsed },
                    Readiness::Cancelled => {
                        debug!("readiness wait cancelled");
                        return;
                    }
                };
                let _ = events.send(event);
            }
            .instrument(info_span!("readiness-wait", generation)),
        );

        self.child = Some(handle);
        Ok(())
    }



    /*
        @@@
        @stop();
        . Stopped: nothing to do.
        . Error: clears any leftover child and goes straight to Stopped.
        . Starting/Running: Stopping, cancel the readiness wait and monitoring, terminate the child
          (SIGTERM, grace period, SIGKILL), then Stopped.
    */
    async fn stop(&mut self) {
        match self.state.current() {
            LifecycleState::Stopped => {
                debug!("stop ignored: already stopped");
            }
            LifecycleState::Error => {
                self.teardown().await;
                self.marker("STOPPED");
                self.set_state(LifecycleState::Stopped, None);
            }
            LifecycleState::Starting | LifecycleState::Running => {
                self.set_state(LifecycleState::Stopping, None);
                self.marker("STOPPING");
                self.teardown().await;
                self.marker("STOPPED");
                self.set_state(LifecycleState::Stopped, None);
            }
            LifecycleState::Stopping => {
                warn!("stop requested while already stopping");
            }
        }
    }

    async fn restart(&mut self) -> Result<(), SupervisorError> {
        info!(state = %self.state.current(), "restarting service");
        self.marker("RESTARTING");
        if matches!(self.state.current(), LifecycleState::Starting | LifecycleState::Running) {
            self.stop().await;
        }
        self.start().await
    }

    async fn teardown(&mut self) {
        self.prober.stop_monitoring();
        if let Some(mut child) = self.child.take() {
            child.cancel.cancel();
            let outcome = control::terminate(&mut child, self.config.shutdown_timeout).await;
            debug!(pid = child.pid, outcome = ?outcome, "child torn down");
        }
    }



    /*
        @@@
        @handle_event();
        . Drops anything whose generation is not the live child's (late results from a stopped run).
        . Ready while Starting: Running, then periodic monitoring.
        . TimedOut while Starting, Degraded while Running: Error with a reason; the child is left for stop/start to clear.
        . Exited: Starting or Running become Error, then the rest of the process group is cleared
          and the pumps drained before the handle is released.
    */
    async fn handle_event(&mut self, event: Event) {
        let live = self.child.as_ref().map(|c| c.generation);
        let current = self.state.current();

        match event {
            Event::Ready { generation, attempts, elapsed } => {
                if live != Some(generation) || current != LifecycleState::Starting {
                    debug!(generation, state = %current, "stale readiness result ignored");
                    return;
                }
                info!(attempts, elapsed_ms = elapsed.as_millis() as u64, "service became available");
                if self.set_state(LifecycleState::Running, None) {
                    let events = self.events.clone();
                    self.prober.start_monitoring(
                        self.config.monitor_interval,
                        self.config.failure_threshold,
                        move |failures| {
                            let _ = events.send(Event::Degraded { generation, failures });
                        },
                    );
                }
            }

            Event::TimedOut { generation, elapsed } => {
                if live != Some(generation) || current != LifecycleState::Starting {
                    debug!(generation, state = %current, "stale readiness timeout ignored");
                    return;
                }
                let reason = format!(
                    "service did not become ready on {}:{} within {:?}",
                    self.config.host, self.config.port, self.config.health_check_timeout
                );
                warn!(elapsed_ms = elapsed.as_millis() as u64, "{reason}");
                self.set_state(LifecycleState::Error, Some(reason));
            }

            Event::Degraded { generation, failures } => {
                if live != Some(generation) || current != LifecycleState::Running {
                    debug!(generation, state = %current, "stale degradation ignored");
                    return;
                }
                let reason = format!("health check failed {failures} time(s) in a row");
                self.set_state(LifecycleState::Error, Some(reason));
            }

            Event::Exited { generation, report } => {
                if live != Some(generation) {
                    debug!(generation, "exit of an already released child ignored");
                    return;
                }
                self.prober.stop_monitoring();
                if let Some(child) = self.child.as_ref() {
                    child.cancel.cancel();
                }

                match current {
                    LifecycleState::Starting => {
                        let reason = format!("process exited before becoming ready ({report})");
                        self.set_state(LifecycleState::Error, Some(reason));
                    }
                    LifecycleState::Running => {
                        let reason = format!("process exited unexpectedly ({report})");
                        self.set_state(LifecycleState::Error, Some(reason));
                    }
                    other => {
                        info!(state = %other, status = %report, "service process exited");
                    }
                }

                if let Some(mut child) = self.child.take() {
                    let outcome = control::terminate(&mut child, self.config.shutdown_timeout).await;
                    debug!(pid = child.pid, outcome = ?outcome, "exited child released");
                }
            }
        }
    }

    /// Applies and publishes a transition. Returns false if the table rejected it.
    fn set_state(&mut self, to: LifecycleState, reason: Option<String>) -> bool {
        match self.state.transition(to) {
            Ok(mut change) => {
                {
                    let mut last = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
                    if to == LifecycleState::Starting {
                        *last = None;
                    }
                    if let Some(reason) = &reason {
                        *last = Some(reason.clone());
                    }
                }
                change.reason = reason;
                info!(from = %change.from, to = %change.to, reason = ?change.reason, "state transition");
                self.hub.publish_state(&change);
                true
            }
            Err(e) => {
                error!(error = %e, "rejected state transition");
                false
            }
        }
    }

    fn marker(&self, action: &'static str) {
        let _ = self.pump_tx.send(PumpMsg::Marker(action));
    }
}
