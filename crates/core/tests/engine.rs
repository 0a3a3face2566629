//! End-to-end scenarios for the hook engine: scripts on disk, real child
//! processes, notifiers observing terminal requests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use async_trait::async_trait;
use tempfile::TempDir;
use whd_core::log::SUBSCRIBER_BUFFER;
use whd_core::notify::{extract_body, DEFAULT_PREFIX};
use whd_core::{
    EngineConfig, HookError, HookInvocation, HookService, LogEvent, Notifier, NotifyError,
    WorkRequest, WorkStatus,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Notification {
    name: String,
    status: String,
    body: String,
}

#[derive(Default)]
struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, req: &WorkRequest) -> Result<(), NotifyError> {
        let Some(body) = extract_body(req, DEFAULT_PREFIX) else {
            return Ok(());
        };
        self.received.lock().unwrap().push(Notification {
            name: req.name().to_string(),
            status: req.status_label().to_string(),
            body,
        });
        Ok(())
    }
}

fn write_script(root: &Path, name: &str, body: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

struct Engine {
    dir: TempDir,
    service: HookService,
    notifier: Arc<RecordingNotifier>,
}

fn engine(scripts: &[(&str, &str)], configure: impl FnOnce(&mut EngineConfig)) -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("scripts");
    fs::create_dir(&root).unwrap();
    for (name, body) in scripts {
        write_script(&root, name, body);
    }

    let mut config = EngineConfig::new(&root);
    config.kill_grace = Duration::from_millis(500);
    configure(&mut config);

    let notifier = Arc::new(RecordingNotifier::default());
    let service = HookService::start(config, vec![notifier.clone()]).unwrap();
    Engine {
        dir,
        service,
        notifier,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_notifies_with_prefixed_lines() {
    let engine = engine(
        &[("echo.sh", "#!/bin/sh\necho hello\necho notify:ok\n")],
        |_| {},
    );

    let handle = engine
        .service
        .submit(HookInvocation::new("echo").payload("{}"))
        .await
        .unwrap();
    assert_eq!(handle.wait().await, WorkStatus::Success);
    engine.service.shutdown(Duration::from_secs(5)).await;

    let received = engine.notifier.received.lock().unwrap().clone();
    assert_eq!(
        received,
        vec![Notification {
            name: "echo".into(),
            status: "success".into(),
            body: "ok".into(),
        }]
    );
}

#[tokio::test]
async fn timeout_kills_the_process_group() {
    let engine = engine(
        &[(
            "sleepy.sh",
            "#!/bin/sh\necho $$ > \"$hook_PIDFILE\"\necho notify:never\nsleep 30\n",
        )],
        |config| config.hook_timeout = Duration::from_secs(1),
    );
    let pidfile = engine.dir.path().join("pid");

    let start = Instant::now();
    let handle = engine
        .service
        .submit(HookInvocation::new("sleepy").arg("pidfile", pidfile.display().to_string()))
        .await
        .unwrap();
    assert_eq!(handle.wait().await, WorkStatus::Timeout);
    assert!(start.elapsed() <= Duration::from_secs(3), "took {:?}", start.elapsed());

    let pid: i32 = fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
    assert!(!alive, "script process {pid} survived the timeout");

    engine.service.shutdown(Duration::from_secs(5)).await;
    let received = engine.notifier.received.lock().unwrap().clone();
    assert_eq!(received[0].status, "timeout");
}

#[tokio::test]
async fn non_zero_exit_is_reported_as_error() {
    let engine = engine(
        &[("fail.sh", "#!/bin/sh\necho notify:failed\nexit 2\n")],
        |_| {},
    );

    let mut handle = engine.service.submit(HookInvocation::new("fail")).await.unwrap();
    let mut sub = handle.take_subscription().unwrap();
    let mut last = None;
    while let Some(event) = sub.next().await {
        last = Some(event);
    }

    assert_matches!(last, Some(LogEvent::Closed(msg)) if msg.contains(" error ("));
    assert_eq!(handle.wait().await, WorkStatus::Error);

    engine.service.shutdown(Duration::from_secs(5)).await;
    let received = engine.notifier.received.lock().unwrap().clone();
    assert_eq!(received[0].status, "error");
    assert_eq!(received[0].body, "failed");
}

#[tokio::test]
async fn slow_reader_is_truncated_but_file_is_complete() {
    let engine = engine(
        &[(
            "flood.sh",
            "#!/bin/sh\ni=1\nwhile [ $i -le 10000 ]; do echo \"line $i\"; i=$((i+1)); done\n",
        )],
        |config| {
            config.hook_timeout = Duration::from_secs(30);
            config.log_dir = Some(config.scripts_dir.with_file_name("logs"));
        },
    );
    let service = &engine.service;

    let mut handle = service.submit(HookInvocation::new("flood")).await.unwrap();
    let mut sub = handle.take_subscription().unwrap();

    // Do not read until the script is done.
    assert_eq!(handle.wait().await, WorkStatus::Success);
    service.shutdown(Duration::from_secs(5)).await;

    let mut events = Vec::new();
    while let Some(event) = sub.next().await {
        events.push(event);
    }
    assert_eq!(events.len(), SUBSCRIBER_BUFFER + 2);
    assert_matches!(&events[0], LogEvent::Line(line) if line.text == "line 1" && line.seq == 1);
    assert_matches!(&events[SUBSCRIBER_BUFFER], LogEvent::Truncated);
    assert_matches!(&events[SUBSCRIBER_BUFFER + 1], LogEvent::Closed(_));

    let content = fs::read_to_string(handle.log_file().unwrap()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 10_001);
    assert_eq!(lines[9_999], "line 10000");
    assert!(lines[10_000].starts_with(&format!("hook flood#{} success", handle.id())));
}

#[tokio::test]
async fn many_jobs_with_bounded_concurrency() {
    let engine = engine(
        &[("job.sh", "#!/bin/sh\nsleep 0.05\necho \"done $hook_id\"\n")],
        |config| config.nb_workers = 4,
    );

    let mut handles = Vec::new();
    for _ in 0..100 {
        handles.push(engine.service.submit(HookInvocation::new("job")).await.unwrap());
    }

    let ids: Vec<u64> = handles.iter().map(|h| h.id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids follow submission order");

    let sampler = async {
        let mut max_running = 0;
        for _ in 0..50 {
            max_running = max_running.max(engine.service.stats().running);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        max_running
    };
    let (max_running, statuses) = tokio::join!(sampler, async {
        let mut statuses = Vec::new();
        for handle in &handles {
            statuses.push(handle.wait().await);
        }
        statuses
    });

    assert!(max_running <= 4, "saw {max_running} concurrent hooks");
    assert!(statuses.iter().all(|s| *s == WorkStatus::Success));
    for handle in &handles {
        assert_eq!(handle.log_content("done "), handle.id().to_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_submissions_run_in_id_order() {
    const SUBMITTERS: usize = 8;
    const PER_SUBMITTER: usize = 40;

    let Engine { dir, service, .. } = engine(
        &[("rec.sh", "#!/bin/sh\necho \"$hook_id\" >> \"$hook_ORDER\"\n")],
        |config| {
            config.nb_workers = 1;
            config.log_dir = Some(config.scripts_dir.with_file_name("logs"));
        },
    );
    let service = Arc::new(service);
    let order_file = dir.path().join("order");
    let barrier = Arc::new(tokio::sync::Barrier::new(SUBMITTERS));

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            let order = order_file.display().to_string();
            tokio::spawn(async move {
                barrier.wait().await;
                let mut handles = Vec::new();
                for _ in 0..PER_SUBMITTER {
                    let invocation = HookInvocation::new("rec").arg("order", order.as_str());
                    handles.push(service.submit(invocation).await.unwrap());
                }
                handles
            })
        })
        .collect();

    let mut handles = Vec::new();
    for submitter in submitters {
        handles.extend(submitter.await.unwrap());
    }
    for handle in &handles {
        assert_eq!(handle.wait().await, WorkStatus::Success);
    }
    service.shutdown(Duration::from_secs(5)).await;

    // A single worker runs requests in queue order.
    let executed: Vec<u64> = fs::read_to_string(&order_file)
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect();
    assert_eq!(executed.len(), SUBMITTERS * PER_SUBMITTER);
    let inversion = executed.windows(2).find(|w| w[0] >= w[1]);
    assert!(inversion.is_none(), "queued out of id order: {inversion:?}");
}

#[tokio::test]
async fn traversal_never_reaches_the_runner() {
    let engine = engine(&[("ok.sh", "#!/bin/sh\n")], |_| {});
    write_script(engine.dir.path(), "secret.sh", "#!/bin/sh\ntouch pwned\n");

    for name in ["../secret", "..%2Fsecret", "ok/../../secret"] {
        assert_matches!(
            engine.service.submit(HookInvocation::new(name)).await,
            Err(HookError::NotFound(_)),
            "{name}"
        );
    }
    assert_eq!(engine.service.stats().queued, 0);
    assert!(!engine.dir.path().join("pwned").exists());
}
