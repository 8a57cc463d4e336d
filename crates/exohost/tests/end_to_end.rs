//! Runs the real `exoworker` binary as a child process and ships closures to it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use exocode::CodeProvider;
use exocode::CodeRoot;
use exocode::ScopedRoots;
use exohost::Backend;
use exohost::BackendState;
use exohost::BootOptions;
use exohost::CallError;
use exohost::ProcessBackend;
use exohost::backend::Error;
use exowire::Closure;
use exowire::Value;
use exoworker::PRELUDE_UNIT;

const ANSWER_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (data (i32.const 16) "\04\04test")
  (func (export "alloc") (param i32) (result i32)
    i32.const 1024)
  (func (export "answer") (param i32 i32) (result i64)
    i64.const 68719476742))
"#;

/// A code source directory removed when the test ends.
struct CodeDir(PathBuf);

impl CodeDir {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("exohost-e2e-{:016x}", rand::random::<u64>()));
        std::fs::create_dir_all(root.join("demo")).unwrap();
        std::fs::write(root.join("demo").join("answer.wasm"), ANSWER_WAT).unwrap();
        Self(root)
    }

    fn provider(&self) -> Arc<dyn CodeProvider> {
        ScopedRoots::scan(vec![CodeRoot::detect(&self.0)]).unwrap().into_provider()
    }

    fn options(&self) -> BootOptions {
        BootOptions::default()
            .with_worker_program(env!("CARGO_BIN_EXE_exoworker"))
            .with_code_source(&self.0)
            .with_bootstrap_timeout(Duration::from_secs(30))
    }
}

impl Drop for CodeDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[tokio::test]
async fn test_process_round_trip() {
    let code = CodeDir::new();
    let backend = ProcessBackend::start(code.provider(), code.options()).await.unwrap();
    assert_eq!(backend.state(), BackendState::Running);
    assert!(backend.is_alive().await);
    assert!(backend.pid().is_some());

    let worker = backend.worker();
    let answer = worker.call(Closure::new("demo.answer", "answer")).await.unwrap();
    assert_eq!(worker.get(answer).await.unwrap(), Value::from("test"));

    let left = worker.wrap(40i64).await.unwrap();
    let right = worker.wrap(2i64).await.unwrap();
    let sum = worker
        .call_with(vec![left, right], Closure::new(PRELUDE_UNIT, "add"))
        .await
        .unwrap();
    assert_eq!(worker.get(sum).await.unwrap(), Value::Int(42));

    let copy = worker.copy(sum).await.unwrap();
    worker.remove(sum).await.unwrap();
    assert_eq!(worker.get(copy).await.unwrap(), Value::Int(42));
    assert!(matches!(worker.get(sum).await, Err(CallError::UnknownHandle(_))));

    let missing = worker.call(Closure::new("demo.missing", "answer")).await;
    assert!(matches!(missing, Err(CallError::CodeNotFound(name)) if name == "demo.missing"));

    backend.terminate().await.unwrap();
    backend.terminate().await.unwrap();
    assert!(!backend.is_alive().await);
    assert_eq!(backend.state(), BackendState::Terminated);
    tokio::time::timeout(Duration::from_secs(5), backend.wait_for_exit())
        .await
        .unwrap()
        .unwrap();
    assert!(backend.exit_status().is_some());
}

#[tokio::test]
async fn test_missing_worker_program() {
    let code = CodeDir::new();
    let options = code.options().with_worker_program("/nonexistent/exoworker");
    let result = ProcessBackend::start(code.provider(), options).await;
    assert!(matches!(result, Err(Error::Spawn(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_exiting_during_startup() {
    let code = CodeDir::new();
    let options = code.options().with_worker_program("/bin/false");
    let result = ProcessBackend::start(code.provider(), options).await;
    assert!(matches!(result, Err(Error::ExitedDuringStartup(Some(1)))));
}
