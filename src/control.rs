use crate::buffer::OutputStream;
use crate::error::SupervisorError;
use crate::parse::SupervisorConfig;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long to wait for the reap after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// How long the pumps get to drain what is left in the pipes.
const PUMP_DRAIN: Duration = Duration::from_secs(2);
/// How often to look for group members still alive after the leader is gone.
const GROUP_POLL: Duration = Duration::from_millis(50);


/// What the output pumps and the monitor feed to the output collector.
#[derive(Debug)]
pub(crate) enum PumpMsg {
    Line(OutputStream, String),
    Marker(&'static str),
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self { code: status.code(), signal: status.signal() },
            Err(e) => {
                error!(error = %e, "failed to wait on child");
                Self { code: None, signal: None }
            }
        }
    }

    /// Shell-style status: the exit code, or 128 + signal number.
    pub fn as_status(&self) -> Option<i32> {
        self.code.or(self.signal.map(|s| 128 + s))
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}


/// The one live child. Owned by the monitor task; dropped once the process is reaped.
pub struct ChildHandle {
    pub pid: u32,
    pub generation: u64,
    /// Cancelled when this run ends, stopping its readiness wait.
    pub cancel: CancellationToken,
    exit: watch::Receiver<Option<ExitReport>>,
    pumps: Vec<JoinHandle<()>>,
}

impl ChildHandle {
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub async fn wait_exit(&self, within: Duration) -> Option<ExitReport> {
        let mut rx = self.exit.clone();
        let report = match tokio::time::timeout(within, rx.wait_for(|s| s.is_some())).await {
            Ok(Ok(report)) => report.clone(),
            _ => None,
        };
        report
    }

    async fn drain_pumps(&mut self) {
        for mut pump in self.pumps.drain(..) {
            if tokio::time::timeout(PUMP_DRAIN, &mut pump).await.is_err() {
                debug!(pid = self.pid, "output pump still open after exit; aborting it");
                pump.abort();
            }
        }
    }
}



/*
    @@@
    @spawn_child();
    . Starts the configured command in its own process group (the setsid of this crate) with piped stdout/stderr.
    . Sets working directory and environment if specified, substituting {host}/{port} into the arguments.
    . Starts one output pump per stream, feeding the output collector.
    . Starts the reaper, which owns the tokio Child, waits for it and hands the exit report to `on_exit`.
*/
pub(crate) fn spawn_child<F>(
    cfg: &SupervisorConfig,
    generation: u64,
    pump_tx: mpsc::UnboundedSender<PumpMsg>,
    on_exit: F,
) -> Result<ChildHandle, SupervisorError>
where
    F: FnOnce(ExitReport) + Send + 'static,
{
    let mut command = Command::new(&cfg.cmd);
    command
        .args(cfg.resolved_args())
        .envs(&cfg.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
    if let Some(dir) = &cfg.workingdir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        cmd: cfg.command_line(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(
            pump(stdout, OutputStream::Stdout, pump_tx.clone())
                .instrument(info_span!("output-pump", pid, stream = "stdout")),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(
            pump(stderr, OutputStream::Stderr, pump_tx)
                .instrument(info_span!("output-pump", pid, stream = "stderr")),
        ));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(
        async move {
            let report = ExitReport::from_wait(child.wait().await);
            info!(pid, status = %report, "child process exited");
            exit_tx.send_replace(Some(report.clone()));
            on_exit(report);
        }
        .instrument(info_span!("reaper", pid, generation)),
    );

    Ok(ChildHandle {
        pid,
        generation,
        cancel: CancellationToken::new(),
        exit: exit_rx,
        pumps,
    })
}


/// Reads one stream line by line until EOF. Invalid UTF-8 is replaced, trailing whitespace trimmed.
async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<PumpMsg>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(PumpMsg::Line(stream, text)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "error reading process output");
                break;
            }
        }
    }
    debug!("output pump ended");
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited(ExitReport),
    Graceful(ExitReport),
    /// SIGKILL was needed; `None` if even that was not confirmed in time.
    Forced(Option<ExitReport>),
}



/*
    @@@
    @terminate();
    . 1) Send SIGTERM to the child's process group.
    . 2) Wait up to `grace` for the reaper to confirm the exit.
    . 3) Escalate to SIGKILL and wait a little longer for the reap.
    . 4) Unless SIGKILL already went out, clear whatever is left of the group, even when the leader exited on its own.
    . 5) Let the pumps drain the pipes, aborting any that stay open.
*/
pub(crate) async fn terminate(handle: &mut ChildHandle, grace: Duration) -> Termination {
    let pid = handle.pid;

    let outcome = if let Some(report) = handle.exit_report() {
        debug!(pid, status = %report, "child already exited");
        Termination::AlreadyExited(report)
    } else {
        info!(pid, grace_ms = grace.as_millis() as u64, "sending SIGTERM");
        signal_group(pid, Signal::SIGTERM);

        match handle.wait_exit(grace).await {
            Some(report) => {
                info!(pid, status = %report, "process terminated gracefully");
                Termination::Graceful(report)
            }
            None => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "process did not terminate in time, sending SIGKILL");
                signal_group(pid, Signal::SIGKILL);
                let report = handle.wait_exit(KILL_WAIT).await;
                match &report {
                    Some(r) => info!(pid, status = %r, "process killed forcefully"),
                    None => error!(pid, "process still not reaped after SIGKILL"),
                }
                Termination::Forced(report)
            }
        }
    };

    if !matches!(outcome, Termination::Forced(_)) {
        clear_group(pid, grace).await;
    }
    handle.drain_pumps().await;
    outcome
}

/// SIGTERM to the leftover group members, SIGKILL if any are still there after `grace`.
async fn clear_group(pid: u32, grace: Duration) {
    if !group_alive(pid) {
        return;
    }
    info!(pid, "process group outlived its leader, sending SIGTERM");
    signal_group(pid, Signal::SIGTERM);
    if wait_group_gone(pid, grace).await {
        return;
    }
    warn!(pid, grace_ms = grace.as_millis() as u64, "process group still alive, sending SIGKILL");
    signal_group(pid, Signal::SIGKILL);
}

async fn wait_group_gone(pid: u32, within: Duration) -> bool {
    let gone = tokio::time::timeout(within, async {
        while group_alive(pid) {
            tokio::time::sleep(GROUP_POLL).await;
        }
    })
    .await;
    gone.is_ok()
}

fn group_alive(pid: u32) -> bool {
    pid != 0 && killpg(Pid::from_raw(pid as i32), None).is_ok()
}

fn signal_group(pid: u32, sig: Signal) {
    // pid 0 would address our own process group.
    if pid == 0 {
        return;
    }
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {}
        Err(Errno::ESRCH) => debug!(pid, signal = ?sig, "process group already gone"),
        Err(e) => error!(pid, signal = ?sig, error = %e, "failed to signal process group"),
    }
}
