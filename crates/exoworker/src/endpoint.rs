//! # Worker Endpoint
//!
//! Answers the host's remote-object requests against this worker's object table.
//!
//! A closure that traps or does not fit the ABI never fails the request outright: its failure
//! is stored as a `Value::Fault` under a fresh handle and the caller gets `Failure::Fault`
//! pointing at it. Unknown handles are reported as they are and never wrapped.

use std::sync::Arc;

use exocode::CodeLoader;
use exocode::LoadError;
use exowire::Closure;
use exowire::Failure;
use exowire::FaultInfo;
use exowire::Handle;
use exowire::Outcome;
use exowire::Request;
use exowire::Response;
use exowire::Service;
use exowire::Value;

use crate::invoke::Invoker;
use crate::table;
use crate::table::ObjectTable;

impl From<table::Error> for Failure {
    fn from(e: table::Error) -> Self {
        match e {
            table::Error::UnknownHandle(h) => Failure::UnknownHandle(h),
        }
    }
}

pub struct WorkerEndpoint {
    table: ObjectTable,
    loader: Arc<CodeLoader>,
    invoker: Arc<Invoker>,
}

impl WorkerEndpoint {
    pub fn new(table: ObjectTable, loader: Arc<CodeLoader>, invoker: Arc<Invoker>) -> Arc<Self> {
        Arc::new(Self { table, loader, invoker })
    }

    pub fn table(&self) -> &ObjectTable {
        &self.table
    }

    /// Resolves the closure's unit, then runs it on the blocking pool.
    async fn execute(&self, closure: &Closure, args: Vec<Value>) -> Result<Value, Failure> {
        let unit = self.loader.resolve(&closure.unit).await.map_err(|e| {
            tracing::warn!(closure = %closure, error = %e, "closure code unavailable");
            match e {
                LoadError::NotFound { name, .. } | LoadError::Compile { name, .. } => Failure::CodeNotFound(name),
                LoadError::AlreadyBound => Failure::CodeNotFound(closure.unit.clone()),
            }
        })?;

        let invoker = self.invoker.clone();
        let function = closure.function.clone();
        let outcome = tokio::task::spawn_blocking(move || invoker.invoke(&unit, &function, args)).await;

        let message = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(join) => format!("closure panicked: {}", join),
        };

        let fault = self.table.wrap(Value::Fault(FaultInfo {
            unit: closure.unit.clone(),
            function: closure.function.clone(),
            message,
        }));
        tracing::debug!(closure = %closure, handle = %fault, "closure faulted");
        Err(Failure::Fault(fault))
    }

    async fn call(&self, args: Vec<Handle>, closure: Closure) -> Result<Handle, Failure> {
        let values = self.table.get_all(&args)?;
        let result = self.execute(&closure, values).await?;
        Ok(self.table.wrap(result))
    }
}

#[async_trait::async_trait]
impl Service for WorkerEndpoint {
    async fn handle(&self, request: Request) -> Outcome {
        match request {
            Request::Identify => Ok(Response::Owner(self.table.owner())),
            Request::Run { closure } => {
                self.execute(&closure, Vec::new()).await?;
                Ok(Response::Done)
            }
            Request::Call { args, closure } => Ok(Response::Handle(self.call(args, closure).await?)),
            Request::Copy { handle } => Ok(Response::Handle(self.table.copy(handle)?)),
            Request::Remove { handle } => {
                self.table.remove(handle)?;
                Ok(Response::Done)
            }
            Request::Get { handle } => Ok(Response::Value(self.table.get(handle)?)),
            Request::Wrap { value } => Ok(Response::Handle(self.table.wrap(value))),
            Request::ReleaseAll => {
                let released = self.table.release_all();
                tracing::info!(released, "object table released");
                Ok(Response::Released(released as u64))
            }
            other => Err(Failure::Unsupported(other.op().to_string())),
        }
    }
}
