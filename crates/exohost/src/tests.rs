//! Tests for the handshake and the container and VM backends.
//!
//! The platform tools are scripted; the worker itself runs in-process on the directory port the
//! backend was told to use, so everything past the tool invocations is real.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use exocode::CodeProvider;
use exocode::CodeUnit;
use exocode::CodeUnitStore;
use exowire::Closure;
use exowire::Shutdown;
use exowire::ShutdownTrigger;
use exowire::Value;
use exowire::poll;
use exowire::shutdown;
use exoworker::PRELUDE_UNIT;
use exoworker::Worker;
use exoworker::WorkerOptions;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::backend::BackendState;
use crate::backend::ContainerBackend;
use crate::backend::Error;
use crate::backend::VmBackend;
use crate::config::BootOptions;
use crate::handshake;
use crate::platform::CommandOutput;
use crate::platform::Platform;
use crate::worker::CallError;

/// `answer()` returns `Value::Str("test")` through the encoded ABI.
const ANSWER_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (data (i32.const 16) "\04\04test")
  (func (export "alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "answer") (param i32 i32) (result i64)
    i64.const 68719476742))
"#;

fn code() -> Arc<dyn CodeProvider> {
    let store = CodeUnitStore::new();
    store.record(CodeUnit::new("demo.answer", ANSWER_WAT.as_bytes().to_vec()));
    Arc::new(store)
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn options(port: u16) -> BootOptions {
    BootOptions::default()
        .with_directory_port(port)
        .with_bootstrap_timeout(Duration::from_secs(10))
}

/// A worker serving in this process, standing in for whatever the platform would have launched.
struct LocalWorker {
    trigger: ShutdownTrigger,
    task: JoinHandle<exoworker::bootstrap::Result<()>>,
}

impl LocalWorker {
    async fn start(directory_port: u16) -> Self {
        let (trigger, signal) = shutdown::channel();
        let options = WorkerOptions {
            directory_port,
            listen_host: "127.0.0.1".into(),
            code_source: PathBuf::from("/nonexistent/exohost-test"),
            ..WorkerOptions::default()
        };
        let worker = Worker::listen(options, signal.clone()).await.unwrap();
        let task = tokio::spawn(worker.serve(signal));
        Self { trigger, task }
    }

    async fn stop(self) {
        self.trigger.trigger();
        self.task.await.unwrap().unwrap();
    }
}

type Script = Box<dyn Fn(&str) -> CommandOutput + Send + Sync>;

/// Answers platform commands from a script and records every command line it saw.
struct Scripted {
    calls: Mutex<Vec<String>>,
    script: Script,
}

impl Scripted {
    fn new(script: impl Fn(&str) -> CommandOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }

    fn answer(&self, program: &str, args: &[String]) -> CommandOutput {
        let line = format!("{} {}", program, args.join(" "));
        let output = (self.script)(&line);
        self.calls.lock().unwrap().push(line);
        output
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|line| line.starts_with(prefix)).count()
    }
}

#[async_trait::async_trait]
impl Platform for Scripted {
    async fn run(&self, program: &str, args: &[String], _cwd: Option<&Path>) -> std::io::Result<CommandOutput> {
        Ok(self.answer(program, args))
    }

    async fn spawn(&self, program: &str, args: &[String], _cwd: Option<&Path>) -> std::io::Result<()> {
        self.answer(program, args);
        Ok(())
    }

    fn run_blocking(&self, program: &str, args: &[String], _cwd: Option<&Path>) -> std::io::Result<CommandOutput> {
        Ok(self.answer(program, args))
    }
}

// --- Handshake ---

#[tokio::test]
async fn test_handshake_connects_to_worker() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;

    let addr = format!("127.0.0.1:{}", port);
    let connection = handshake::establish(&addr, code(), &options(port), &Shutdown::never())
        .await
        .unwrap();
    let remote = &connection.worker;
    assert!(remote.is_connected());

    remote.run(Closure::new(PRELUDE_UNIT, "hello")).await.unwrap();

    let answer = remote.call(Closure::new("demo.answer", "answer")).await.unwrap();
    assert_eq!(answer.owner, remote.owner());
    assert_eq!(remote.get(answer).await.unwrap(), Value::from("test"));

    let pushed = remote.wrap(41i64).await.unwrap();
    let echoed = remote
        .call_with(vec![pushed], Closure::new(PRELUDE_UNIT, "echo"))
        .await
        .unwrap();
    assert_eq!(remote.get(echoed).await.unwrap(), Value::List(vec![Value::Int(41)]));

    let Err(CallError::Fault(fault)) = remote.call(Closure::new(PRELUDE_UNIT, "fail")).await else {
        panic!("trap was not reported as a fault");
    };
    let info = fault.info.unwrap();
    assert_eq!(info.function, "fail");

    remote.remove(pushed).await.unwrap();
    assert!(matches!(remote.get(pushed).await, Err(CallError::UnknownHandle(h)) if h == pushed));
    assert!(remote.release_all().await.unwrap() >= 2);

    drop(connection);
    worker.stop().await;
}

#[tokio::test]
async fn test_handshake_times_out_without_worker() {
    let port = free_port();
    let addr = format!("127.0.0.1:{}", port);
    let options = options(port).with_bootstrap_timeout(Duration::from_millis(200));

    let result = handshake::establish(&addr, code(), &options, &Shutdown::never()).await;
    assert!(matches!(result, Err(handshake::Error::TimedOut(_))));
}

#[tokio::test]
async fn test_handshake_gives_up_on_shutdown() {
    let port = free_port();
    let addr = format!("127.0.0.1:{}", port);
    let (trigger, signal) = shutdown::channel();
    trigger.trigger();

    let result = handshake::establish(&addr, code(), &options(port), &signal).await;
    assert!(matches!(result, Err(handshake::Error::NotReady(poll::Error::Cancelled))));
}

// --- Container ---

fn docker(alive: Arc<AtomicBool>) -> Arc<Scripted> {
    Scripted::new(move |line| {
        let rest = line.strip_prefix("docker ").unwrap_or(line);
        let verb = rest.split_whitespace().next().unwrap_or_default();
        match verb {
            "image" | "start" | "logs" | "rm" => CommandOutput::ok(""),
            "create" => CommandOutput::ok("c0ffee\n"),
            "inspect" if alive.load(Ordering::SeqCst) => CommandOutput::ok("true\n"),
            "inspect" => CommandOutput::ok("false\n"),
            "stop" => {
                alive.store(false, Ordering::SeqCst);
                CommandOutput::ok("c0ffee\n")
            }
            "wait" => CommandOutput::ok("0\n"),
            _ => CommandOutput::failed(format!("unexpected command: {}", line)),
        }
    })
}

#[tokio::test]
async fn test_container_lifecycle_and_idempotent_terminate() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let alive = Arc::new(AtomicBool::new(true));
    let platform = docker(alive.clone());

    let options = options(port).with_image("alpine:3").with_shared_path("/nonexistent/shared");
    let backend = ContainerBackend::start_with(platform.clone(), code(), options).await.unwrap();
    assert_eq!(backend.id(), "c0ffee");
    assert_eq!(backend.state(), BackendState::Running);
    assert!(backend.is_alive().await);

    let create = platform.calls().into_iter().find(|line| line.starts_with("docker create")).unwrap();
    assert!(create.contains("--network host"), "{}", create);
    assert!(create.contains(":/exo "), "{}", create);
    assert!(create.contains("/exo/exoworker --directory-port"), "{}", create);
    assert!(create.contains(&format!("--directory-port {}", port)), "{}", create);
    assert!(create.contains("-v /nonexistent/shared:/shared/nonexistent/shared"), "{}", create);
    assert!(create.contains("alpine:3 /exo/exoworker"), "{}", create);
    assert_eq!(platform.count("docker image inspect alpine:3"), 1);
    assert_eq!(platform.count("docker logs -f c0ffee"), 1);

    let answer = backend.worker().call(Closure::new("demo.answer", "answer")).await.unwrap();
    assert_eq!(backend.worker().get(answer).await.unwrap(), Value::from("test"));

    backend.terminate().await.unwrap();
    backend.terminate().await.unwrap();
    assert_eq!(platform.count("docker stop"), 1);
    assert_eq!(platform.count("docker rm c0ffee"), 1);
    assert_eq!(backend.state(), BackendState::Terminated);

    let inspections = platform.count("docker inspect");
    assert!(!backend.is_alive().await);
    assert_eq!(platform.count("docker inspect"), inspections);
    backend.wait_for_exit().await.unwrap();

    drop(backend);
    assert_eq!(platform.count("docker rm -f"), 0);
    worker.stop().await;
}

#[tokio::test]
async fn test_stopped_container_is_still_removed() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let alive = Arc::new(AtomicBool::new(true));
    let platform = docker(alive.clone());

    let backend = ContainerBackend::start_with(platform.clone(), code(), options(port)).await.unwrap();
    alive.store(false, Ordering::SeqCst);
    assert!(!backend.is_alive().await);
    assert_eq!(backend.state(), BackendState::Terminated);
    backend.wait_for_exit().await.unwrap();

    backend.terminate().await.unwrap();
    backend.terminate().await.unwrap();
    assert_eq!(platform.count("docker stop c0ffee"), 1);
    assert_eq!(platform.count("docker rm c0ffee"), 1);

    drop(backend);
    assert_eq!(platform.count("docker rm -f"), 0);
    worker.stop().await;
}

#[tokio::test]
async fn test_dropped_stopped_container_is_removed() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let alive = Arc::new(AtomicBool::new(true));
    let platform = docker(alive.clone());

    let backend = ContainerBackend::start_with(platform.clone(), code(), options(port)).await.unwrap();
    alive.store(false, Ordering::SeqCst);
    assert!(!backend.is_alive().await);

    drop(backend);
    assert_eq!(platform.count("docker rm -f c0ffee"), 1);
    worker.stop().await;
}

#[tokio::test]
async fn test_failed_inspection_is_not_death() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let healthy = docker(Arc::new(AtomicBool::new(true)));
    let platform = Scripted::new(move |line| {
        if line.starts_with("docker inspect") {
            CommandOutput::failed("error during connect: context deadline exceeded")
        } else {
            (healthy.script)(line)
        }
    });

    let backend = ContainerBackend::start_with(platform.clone(), code(), options(port)).await.unwrap();
    assert!(!backend.is_alive().await);
    assert_eq!(backend.state(), BackendState::Running);

    backend.terminate().await.unwrap();
    assert_eq!(platform.count("docker rm c0ffee"), 1);
    assert_eq!(backend.state(), BackendState::Terminated);
    worker.stop().await;
}

#[tokio::test]
async fn test_dropped_container_is_removed() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let platform = docker(Arc::new(AtomicBool::new(true)));

    let backend = ContainerBackend::start_with(platform.clone(), code(), options(port)).await.unwrap();
    drop(backend);
    assert_eq!(platform.count("docker rm -f c0ffee"), 1);
    worker.stop().await;
}

#[tokio::test]
async fn test_failed_container_startup_cleans_up() {
    let port = free_port();
    let platform = docker(Arc::new(AtomicBool::new(true)));
    let options = options(port).with_bootstrap_timeout(Duration::from_millis(300));

    let result = ContainerBackend::start_with(platform.clone(), code(), options).await;
    assert!(matches!(result, Err(Error::Handshake(handshake::Error::TimedOut(_)))));
    assert_eq!(platform.count("docker rm -f c0ffee"), 1);
}

#[tokio::test]
async fn test_unreachable_daemon() {
    let platform = Scripted::new(|_| CommandOutput::failed("Cannot connect to the Docker daemon at unix:///var/run/docker.sock."));
    let result = ContainerBackend::start_with(platform.clone(), code(), options(free_port())).await;
    assert!(matches!(result, Err(Error::PlatformUnreachable)));
    assert_eq!(platform.count("docker create"), 0);
}

#[tokio::test]
async fn test_missing_image_is_pulled() {
    let platform = Scripted::new(|line| {
        if line.starts_with("docker image inspect") {
            CommandOutput::failed("Error: No such image: debian:bookworm-slim")
        } else if line.starts_with("docker pull") {
            CommandOutput::failed("manifest unknown")
        } else {
            CommandOutput::ok("")
        }
    });
    let result = ContainerBackend::start_with(platform.clone(), code(), options(free_port())).await;
    let Err(Error::ImagePull(detail)) = result else {
        panic!("pull failure was not reported");
    };
    assert_eq!(detail, "manifest unknown");
    assert_eq!(platform.count("docker pull debian:bookworm-slim"), 1);
}

// --- Virtual machine ---

fn vagrant(alive: Arc<AtomicBool>) -> Arc<Scripted> {
    Scripted::new(move |line| match line {
        "vagrant up" => CommandOutput::ok(""),
        "vagrant status" if alive.load(Ordering::SeqCst) => {
            CommandOutput::ok("Current machine states:\n\ndefault                   running (virtualbox)\n")
        }
        "vagrant status" => CommandOutput::ok("Current machine states:\n\ndefault                   poweroff (virtualbox)\n"),
        "vagrant destroy -f" => {
            alive.store(false, Ordering::SeqCst);
            CommandOutput::ok("")
        }
        _ => CommandOutput::failed(format!("unexpected command: {}", line)),
    })
}

fn vm_options(port: u16) -> BootOptions {
    options(port).with_lookup_advertise_host("127.0.0.1")
}

#[tokio::test]
async fn test_vm_lifecycle_and_idempotent_terminate() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let platform = vagrant(Arc::new(AtomicBool::new(true)));

    let backend = VmBackend::start_with(platform.clone(), code(), vm_options(port)).await.unwrap();
    assert_eq!(backend.state(), BackendState::Running);
    let scratch = backend.scratch_dir().to_path_buf();
    assert!(scratch.file_name().unwrap().to_string_lossy().starts_with("exo-vm-"));

    let definition = std::fs::read_to_string(scratch.join("Vagrantfile")).unwrap();
    assert!(definition.contains(&format!("guest: {}, host: {}", port, port)), "{}", definition);
    assert!(definition.contains(&format!("--worker-port {}", port + 1)), "{}", definition);
    assert!(definition.contains("--listen-host 0.0.0.0"), "{}", definition);

    assert!(backend.is_alive().await);
    let answer = backend.worker().call(Closure::new("demo.answer", "answer")).await.unwrap();
    assert_eq!(backend.worker().get(answer).await.unwrap(), Value::from("test"));

    backend.terminate().await.unwrap();
    backend.terminate().await.unwrap();
    assert_eq!(platform.count("vagrant destroy -f"), 1);
    assert!(!scratch.exists());
    assert_eq!(backend.state(), BackendState::Terminated);
    assert!(!backend.is_alive().await);

    worker.stop().await;
}

#[tokio::test]
async fn test_vm_without_scratch_dir_is_terminated() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let platform = vagrant(Arc::new(AtomicBool::new(true)));

    let backend = VmBackend::start_with(platform.clone(), code(), vm_options(port)).await.unwrap();
    std::fs::remove_dir_all(backend.scratch_dir()).unwrap();

    let status_checks = platform.count("vagrant status");
    assert!(!backend.is_alive().await);
    assert_eq!(backend.state(), BackendState::Terminated);
    backend.terminate().await.unwrap();
    assert_eq!(platform.count("vagrant status"), status_checks);
    assert_eq!(platform.count("vagrant destroy"), 0);

    worker.stop().await;
}

#[tokio::test]
async fn test_vm_wait_for_exit_then_destroy() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let alive = Arc::new(AtomicBool::new(true));
    let platform = vagrant(alive.clone());

    let mut options = vm_options(port);
    options.exit_poll_interval = Duration::from_millis(20);
    let backend = VmBackend::start_with(platform.clone(), code(), options).await.unwrap();
    let scratch = backend.scratch_dir().to_path_buf();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        alive.store(false, Ordering::SeqCst);
    });
    tokio::time::timeout(Duration::from_secs(5), backend.wait_for_exit())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(backend.state(), BackendState::Terminated);
    assert!(scratch.exists());

    backend.terminate().await.unwrap();
    backend.terminate().await.unwrap();
    assert_eq!(platform.count("vagrant destroy -f"), 1);
    assert!(!scratch.exists());

    drop(backend);
    assert_eq!(platform.count("vagrant destroy -f"), 1);
    worker.stop().await;
}

#[tokio::test]
async fn test_dropped_stopped_vm_is_destroyed() {
    let port = free_port();
    let worker = LocalWorker::start(port).await;
    let alive = Arc::new(AtomicBool::new(true));
    let platform = vagrant(alive.clone());

    let options = vm_options(port).with_vm_template("# <port> <worker_port>\n<command>\n");
    let backend = VmBackend::start_with(platform.clone(), code(), options).await.unwrap();
    let scratch = backend.scratch_dir().to_path_buf();
    let definition = std::fs::read_to_string(scratch.join("Vagrantfile")).unwrap();
    assert!(definition.starts_with(&format!("# {} {}\n/exo/exoworker ", port, port + 1)), "{}", definition);
    alive.store(false, Ordering::SeqCst);
    assert!(!backend.is_alive().await);

    drop(backend);
    assert_eq!(platform.count("vagrant destroy -f"), 1);
    assert!(!scratch.exists());
    worker.stop().await;
}

#[tokio::test]
async fn test_failed_vm_startup_cleans_up() {
    let port = free_port();
    let platform = vagrant(Arc::new(AtomicBool::new(false)));
    let options = vm_options(port).with_bootstrap_timeout(Duration::from_millis(200));

    let result = VmBackend::start_with(platform.clone(), code(), options).await;
    assert!(matches!(
        result,
        Err(Error::Handshake(handshake::Error::NotReady(poll::Error::TimedOut(_))))
    ));
    assert_eq!(platform.count("vagrant up"), 1);
    assert_eq!(platform.count("vagrant destroy -f"), 1);
}
