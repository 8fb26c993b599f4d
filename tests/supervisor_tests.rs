use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use webvisor::{
    LifecycleState, OutputStream, Probe, Supervisor, SupervisorConfig, SupervisorError,
};

use LifecycleState::*;


// A probe the test flips by hand
struct SwitchProbe(Arc<AtomicBool>);

#[async_trait]
impl Probe for SwitchProbe {
    async fn check(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn sh_config(script: &str) -> SupervisorConfig {
    SupervisorConfig {
        cmd: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        health_check_timeout: Duration::from_secs(10),
        probe_interval: Duration::from_millis(20),
        monitor_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn supervised(cfg: SupervisorConfig, ready: bool) -> (Supervisor, Arc<AtomicBool>) {
    let switch = Arc::new(AtomicBool::new(ready));
    let sup = Supervisor::with_probe(cfg, Arc::new(SwitchProbe(switch.clone())));
    (sup, switch)
}

fn record_states(sup: &Supervisor) -> Arc<Mutex<Vec<LifecycleState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _ = sup.subscribe_state(move |change| {
        sink.lock().unwrap().push(change.to);
        Ok(())
    });
    seen
}

fn states(seen: &Arc<Mutex<Vec<LifecycleState>>>) -> Vec<LifecycleState> {
    seen.lock().unwrap().clone()
}

async fn wait_for_state(sup: &Supervisor, target: LifecycleState, within: Duration) {
    let reached = timeout(within, async {
        while sup.state() != target {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "never reached {target}, stuck in {}", sup.state());
}

async fn wait_until<F: Fn() -> bool>(what: &str, within: Duration, cond: F) {
    let done = timeout(within, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(done.is_ok(), "timed out waiting for {what}");
}

const LONG: Duration = Duration::from_secs(5);


#[tokio::test]
async fn start_reaches_running_then_stops() {
    let (sup, _) = supervised(sh_config("echo booting; sleep 30"), true);
    let seen = record_states(&sup);

    sup.start().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;
    wait_until("output", LONG, || sup.output_lines().iter().any(|l| l.text == "booting")).await;

    sup.stop().await.unwrap();
    assert_eq!(sup.state(), Stopped);
    assert_eq!(states(&seen), vec![Starting, Running, Stopping, Stopped]);
    assert_eq!(sup.last_error(), None);
}

#[tokio::test]
async fn start_while_live_is_rejected_without_state_change() {
    let (sup, _) = supervised(sh_config("sleep 30"), false);
    sup.start().await.unwrap();

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidOperation { op: "start", state: Starting }), "{err}");
    assert_eq!(sup.state(), Starting);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn stop_before_ready_never_visits_running_or_error() {
    let (sup, _) = supervised(sh_config("sleep 30"), false);
    let seen = record_states(&sup);

    sup.start().await.unwrap();
    sup.stop().await.unwrap();

    assert_eq!(states(&seen), vec![Starting, Stopping, Stopped]);
    // nothing from the cancelled run may move the state afterwards
    sleep(Duration::from_millis(100)).await;
    assert_eq!(sup.state(), Stopped);
}

#[tokio::test]
async fn failing_probe_errors_at_the_timeout_not_before() {
    let mut cfg = sh_config("sleep 30");
    cfg.health_check_timeout = Duration::from_millis(400);
    let (sup, _) = supervised(cfg, false);

    let errored_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    {
        let errored_at = errored_at.clone();
        let _ = sup.subscribe_state(move |change| {
            if change.to == Error {
                *errored_at.lock().unwrap() = Some(Instant::now());
            }
            Ok(())
        });
    }
    let seen = record_states(&sup);

    let started = Instant::now();
    sup.start().await.unwrap();
    wait_for_state(&sup, Error, LONG).await;

    let took = errored_at.lock().unwrap().unwrap() - started;
    assert!(took >= Duration::from_millis(400), "errored after {took:?}");
    assert!(took < Duration::from_millis(2400), "errored after {took:?}");
    assert!(sup.last_error().unwrap().contains("did not become ready"));

    sup.stop().await.unwrap();
    assert_eq!(states(&seen), vec![Starting, Error, Stopped]);
}

#[tokio::test]
async fn restart_while_running_sequences_stop_and_start() {
    let (sup, _) = supervised(sh_config("sleep 30"), true);
    let seen = record_states(&sup);

    sup.start().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;
    sup.restart().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;

    assert_eq!(
        states(&seen),
        vec![Starting, Running, Stopping, Stopped, Starting, Running]
    );

    // same final state as doing it by hand
    let (manual, _) = supervised(sh_config("sleep 30"), true);
    manual.start().await.unwrap();
    wait_for_state(&manual, Running, LONG).await;
    manual.stop().await.unwrap();
    manual.start().await.unwrap();
    wait_for_state(&manual, Running, LONG).await;
    assert_eq!(manual.state(), sup.state());

    sup.stop().await.unwrap();
    manual.stop().await.unwrap();
}

#[tokio::test]
async fn restart_after_failure_fails_the_same_way_as_stop_then_start() {
    let mut cfg = sh_config("sleep 30");
    cfg.health_check_timeout = Duration::from_millis(200);

    let (sup, _) = supervised(cfg.clone(), false);
    let seen = record_states(&sup);
    sup.start().await.unwrap();
    wait_for_state(&sup, Error, LONG).await;
    sup.restart().await.unwrap();
    wait_for_state(&sup, Error, LONG).await;
    assert_eq!(states(&seen), vec![Starting, Error, Starting, Error]);

    let (manual, _) = supervised(cfg, false);
    manual.start().await.unwrap();
    wait_for_state(&manual, Error, LONG).await;
    manual.stop().await.unwrap();
    manual.start().await.unwrap();
    wait_for_state(&manual, Error, LONG).await;
    assert_eq!(manual.state(), sup.state());

    sup.stop().await.unwrap();
    manual.stop().await.unwrap();
}

#[tokio::test]
async fn largest_env_timeout_still_reaches_running() {
    let mut cfg = sh_config("sleep 30");
    let max = u64::MAX.to_string();
    cfg.apply_env_overrides(|var| (var == "HEALTH_CHECK_TIMEOUT").then(|| max.clone()))
        .unwrap();
    cfg.validate().unwrap();
    let (sup, switch) = supervised(cfg, false);

    sup.start().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(sup.state(), Starting);

    switch.store(true, Ordering::SeqCst);
    wait_for_state(&sup, Running, LONG).await;
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn recovers_from_error_once_the_service_comes_up() {
    let mut cfg = sh_config("sleep 30");
    cfg.health_check_timeout = Duration::from_millis(200);
    let (sup, switch) = supervised(cfg, false);

    sup.start().await.unwrap();
    wait_for_state(&sup, Error, LONG).await;
    assert!(sup.last_error().is_some());

    switch.store(true, Ordering::SeqCst);
    sup.start().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;
    assert_eq!(sup.last_error(), None);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn child_exiting_before_ready_is_a_startup_failure() {
    let (sup, _) = supervised(sh_config("echo dying; exit 3"), false);
    let seen = record_states(&sup);

    sup.start().await.unwrap();
    wait_for_state(&sup, Error, LONG).await;

    assert_eq!(states(&seen), vec![Starting, Error]);
    let reason = sup.last_error().unwrap();
    assert!(reason.contains("before becoming ready"), "{reason}");
    assert!(reason.contains("exit code 3"), "{reason}");

    sup.stop().await.unwrap();
    assert_eq!(sup.state(), Stopped);
}

// alive and not just waiting to be reaped by init
fn process_alive(pid: i32) -> bool {
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

#[tokio::test]
async fn workers_left_by_an_exited_service_are_cleaned_up() {
    let (sup, _) = supervised(sh_config("sleep 30 & echo $!; exit 1"), false);

    sup.start().await.unwrap();
    wait_for_state(&sup, Error, LONG).await;
    wait_until("worker pid", LONG, || !sup.output_lines().is_empty()).await;
    let worker: i32 = sup.output_lines()[0].text.parse().unwrap();
    assert!(sup.last_error().unwrap().contains("exit code 1"));

    sup.stop().await.unwrap();
    assert_eq!(sup.state(), Stopped);
    // without the group sweep the worker lives on for its full 30 s
    wait_until("worker to die", LONG, || !process_alive(worker)).await;
}

#[tokio::test]
async fn child_exiting_while_running_is_a_runtime_failure() {
    let (sup, _) = supervised(sh_config("sleep 0.5; exit 0"), true);
    let seen = record_states(&sup);

    sup.start().await.unwrap();
    wait_for_state(&sup, Error, LONG).await;

    assert_eq!(states(&seen), vec![Starting, Running, Error]);
    assert!(sup.last_error().unwrap().contains("exited unexpectedly"));
}

#[tokio::test]
async fn degraded_health_demotes_running_to_error() {
    let (sup, switch) = supervised(sh_config("sleep 30"), true);
    let seen = record_states(&sup);

    sup.start().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;
    switch.store(false, Ordering::SeqCst);
    wait_for_state(&sup, Error, LONG).await;

    assert_eq!(states(&seen), vec![Starting, Running, Error]);
    assert!(sup.last_error().unwrap().contains("health check failed"));

    sup.stop().await.unwrap();
    assert_eq!(sup.state(), Stopped);
}

#[tokio::test]
async fn output_is_tagged_ordered_and_published() {
    let (sup, _) = supervised(sh_config("echo one; echo two >&2; sleep 30"), true);
    let published = Arc::new(Mutex::new(Vec::new()));
    {
        let published = published.clone();
        let _ = sup.subscribe_output(move |line| {
            published.lock().unwrap().push(line.clone());
            Ok(())
        });
    }

    sup.start().await.unwrap();
    wait_until("two lines", LONG, || published.lock().unwrap().len() >= 2).await;

    let lines = sup.output_lines();
    let one = lines.iter().find(|l| l.text == "one").unwrap();
    let two = lines.iter().find(|l| l.text == "two").unwrap();
    assert_eq!(one.stream, OutputStream::Stdout);
    assert_eq!(two.stream, OutputStream::Stderr);
    assert!(lines.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(*published.lock().unwrap(), lines);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn each_stream_keeps_its_own_line_order() {
    let script = "for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; done; sleep 30";
    let (sup, _) = supervised(sh_config(script), true);

    sup.start().await.unwrap();
    wait_until("ten lines", LONG, || sup.output_lines().len() >= 10).await;

    let lines = sup.output_lines();
    for (stream, prefix) in [(OutputStream::Stdout, "out"), (OutputStream::Stderr, "err")] {
        let texts: Vec<String> = lines
            .iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.text.clone())
            .collect();
        let expected: Vec<String> = (1..=5).map(|i| format!("{prefix}{i}")).collect();
        assert_eq!(texts, expected);
    }

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn output_buffer_keeps_only_the_newest_lines() {
    let mut cfg = sh_config("for i in 1 2 3 4 5 6; do echo $i; done; sleep 30");
    cfg.max_console_lines = 3;
    let (sup, _) = supervised(cfg, true);
    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        let _ = sup.subscribe_output(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    sup.start().await.unwrap();
    wait_until("six lines", LONG, || count.load(Ordering::SeqCst) >= 6).await;

    let texts: Vec<String> = sup.output_lines().into_iter().map(|l| l.text).collect();
    assert_eq!(texts, vec!["4", "5", "6"]);
    assert_eq!(sup.output_tail(1)[0].text, "6");

    sup.clear_output();
    assert!(sup.output_lines().is_empty());
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn erroring_subscriber_does_not_starve_the_next_one() {
    let (sup, _) = supervised(sh_config("sleep 30"), true);
    let bad = Arc::new(AtomicUsize::new(0));
    let good = Arc::new(AtomicUsize::new(0));
    {
        let bad = bad.clone();
        let _ = sup.subscribe_state(move |_| {
            bad.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("presentation layer exploded")
        });
    }
    {
        let good = good.clone();
        let _ = sup.subscribe_state(move |_| {
            good.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    sup.start().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;
    sup.stop().await.unwrap();

    assert_eq!(bad.load(Ordering::SeqCst), 4);
    assert_eq!(good.load(Ordering::SeqCst), 4);
    assert_eq!(sup.state(), Stopped);
}

#[tokio::test]
async fn unsubscribed_observer_hears_nothing_more() {
    let (sup, _) = supervised(sh_config("sleep 30"), false);
    let calls = Arc::new(AtomicUsize::new(0));
    let sub = {
        let calls = calls.clone();
        sup.subscribe_state(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };

    sup.start().await.unwrap();
    assert!(sup.unsubscribe(sub));
    sup.stop().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_when_stopped_is_a_quiet_noop() {
    let (sup, _) = supervised(sh_config("sleep 30"), true);
    let seen = record_states(&sup);

    sup.stop().await.unwrap();
    assert_eq!(sup.state(), Stopped);
    assert!(states(&seen).is_empty());
}

#[tokio::test]
async fn spawn_failure_lands_in_error_and_is_recoverable_by_restart() {
    let cfg = SupervisorConfig {
        cmd: "/nonexistent/webvisor-service".into(),
        ..sh_config("")
    };
    let (sup, _) = supervised(cfg, true);
    let seen = record_states(&sup);

    let err = sup.start().await.unwrap_err();
    assert_eq!(err.as_label(), "spawn_failed");
    assert_eq!(sup.state(), Error);
    assert!(sup.last_error().unwrap().contains("failed to spawn"));

    assert!(sup.restart().await.is_err());
    assert_eq!(states(&seen), vec![Starting, Error, Starting, Error]);
}

#[tokio::test]
async fn stubborn_child_is_force_killed_and_still_stops() {
    let mut cfg = sh_config("trap '' TERM; echo armed; while true; do sleep 0.1; done");
    cfg.shutdown_timeout = Duration::from_millis(300);
    let (sup, _) = supervised(cfg, true);

    sup.start().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;
    wait_until("trap installed", LONG, || sup.output_lines().iter().any(|l| l.text == "armed")).await;

    let started = Instant::now();
    sup.stop().await.unwrap();
    let took = started.elapsed();

    assert_eq!(sup.state(), Stopped);
    assert!(took >= Duration::from_millis(300), "stopped after {took:?}");
    assert!(took < Duration::from_secs(5), "stopped after {took:?}");
}

#[tokio::test]
async fn session_log_records_output_and_markers() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("service.log");
    let mut cfg = sh_config("echo hello from the service; sleep 30");
    cfg.console_log = Some(log_path.clone());
    let (sup, _) = supervised(cfg, true);

    sup.start().await.unwrap();
    wait_for_state(&sup, Running, LONG).await;
    wait_until("output", LONG, || !sup.output_lines().is_empty()).await;
    sup.stop().await.unwrap();

    wait_until("STOPPED marker", LONG, || {
        std::fs::read_to_string(&log_path).is_ok_and(|t| t.contains(" - STOPPED"))
    })
    .await;
    let text = std::fs::read_to_string(&log_path).unwrap();
    assert!(text.contains(" - STARTING"));
    assert!(text.contains("hello from the service"));
    assert!(text.contains(" - STOPPING"));
}

#[tokio::test]
async fn dropping_the_last_handle_stops_the_child() {
    let (sup, _) = supervised(sh_config("echo $$; sleep 30"), true);
    sup.start().await.unwrap();
    wait_until("pid line", LONG, || !sup.output_lines().is_empty()).await;
    let pid: i32 = sup.output_lines()[0].text.parse().unwrap();

    drop(sup);

    let alive = || nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
    wait_until("child to be reaped", LONG, || !alive()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_state_reads_are_always_valid() {
    let (sup, _) = supervised(sh_config("sleep 30"), true);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let sup = sup.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut reads = 0u64;
                while !done.load(Ordering::SeqCst) {
                    assert!(LifecycleState::ALL.contains(&sup.state()));
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for _ in 0..3 {
        sup.start().await.unwrap();
        wait_for_state(&sup, Running, LONG).await;
        sup.stop().await.unwrap();
    }
    done.store(true, Ordering::SeqCst);

    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
}
