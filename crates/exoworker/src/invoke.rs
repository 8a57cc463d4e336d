//! # Closure invocation
//!
//! Runs one export of a compiled unit against a list of argument values. Every call gets a
//! fresh `Store` and instance, so closures share nothing but their module.
//!
//! ## ABI
//!
//! - **Encoded**: the function has type `(i32, i32) -> i64` and the module exports `memory` and
//!   `alloc(len: i32) -> i32`. Arguments go in as `postcard(Value::List(args))` written at
//!   `alloc(len)`; the result comes back as a packed `(ptr << 32) | len` pointing at
//!   `postcard(Value)`.
//! - **Scalar**: any other signature whose parameters are all `i32`, `i64`, `f32` or `f64`.
//!   Integer parameters take `Int` arguments, float parameters take `Float`. No result maps to
//!   `Unit`, one result to `Int` or `Float`.
//!
//! Guests may import `exo.log(ptr, len)` to emit UTF-8 text on the `exo::guest` tracing target.

use exocode::loader::LoadedUnit;
use exowire::Value;
use exowire::frame;
use wasmtime::Caller;
use wasmtime::Engine;
use wasmtime::Func;
use wasmtime::Instance;
use wasmtime::Linker;
use wasmtime::Store;
use wasmtime::Val;
use wasmtime::ValType;

#[derive(Debug, Clone)]
pub enum Error {
    /// The unit could not be instantiated (unknown imports, start function trapped).
    Instantiate(String),
    /// The export is missing or its signature does not fit either ABI or the arguments.
    Signature(String),
    /// The guest trapped, or its encoded result could not be read back.
    Trap(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instantiate(msg) => write!(f, "instantiation failed: {}", msg),
            Self::Signature(msg) => write!(f, "signature mismatch: {}", msg),
            Self::Trap(msg) => write!(f, "trapped: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-call guest state.
struct Guest {
    unit: String,
}

pub struct Invoker {
    engine: Engine,
    linker: Linker<Guest>,
}

impl Invoker {
    pub fn new(engine: &Engine) -> wasmtime::Result<Self> {
        let mut linker = Linker::new(engine);
        linker.func_wrap("exo", "log", |mut caller: Caller<'_, Guest>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let memory = caller
                .get_export("memory")
                .and_then(|export| export.into_memory())
                .ok_or_else(|| wasmtime::Error::msg("exo.log needs an exported memory"))?;
            let bytes = memory
                .data(&caller)
                .get(ptr as u32 as usize..)
                .and_then(|tail| tail.get(..len as u32 as usize))
                .ok_or_else(|| wasmtime::Error::msg("exo.log range is out of bounds"))?;
            tracing::info!(target: "exo::guest", unit = %caller.data().unit, "{}", String::from_utf8_lossy(bytes));
            Ok(())
        })?;

        Ok(Self {
            engine: engine.clone(),
            linker,
        })
    }

    /// Runs `function` from `unit` with `args`. Blocking: call it off the async runtime.
    pub fn invoke(&self, unit: &LoadedUnit, function: &str, args: Vec<Value>) -> Result<Value> {
        let mut store = Store::new(
            &self.engine,
            Guest {
                unit: unit.name.clone(),
            },
        );
        let instance = self
            .linker
            .instantiate(&mut store, &unit.module)
            .map_err(|e| Error::Instantiate(format!("{:#}", e)))?;
        let func = instance
            .get_func(&mut store, function)
            .ok_or_else(|| Error::Signature(format!("'{}' exports no function '{}'", unit.name, function)))?;

        if is_encoded(&mut store, &instance, &func) {
            call_encoded(&mut store, &instance, &func, args)
        } else {
            call_scalar(&mut store, &func, function, args)
        }
    }
}

fn is_encoded(store: &mut Store<Guest>, instance: &Instance, func: &Func) -> bool {
    let ty = func.ty(&*store);
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    let shape = matches!(params.as_slice(), [ValType::I32, ValType::I32]) && matches!(results.as_slice(), [ValType::I64]);
    shape && instance.get_memory(&mut *store, "memory").is_some() && instance.get_func(&mut *store, "alloc").is_some()
}

fn call_encoded(store: &mut Store<Guest>, instance: &Instance, func: &Func, args: Vec<Value>) -> Result<Value> {
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| Error::Signature("no exported memory".into()))?;
    let alloc = instance
        .get_typed_func::<i32, i32>(&mut *store, "alloc")
        .map_err(|e| Error::Signature(format!("alloc: {}", e)))?;
    let entry = func
        .typed::<(i32, i32), i64>(&*store)
        .map_err(|e| Error::Signature(e.to_string()))?;

    let input = frame::encode_value(&Value::List(args)).map_err(|e| Error::Signature(e.to_string()))?;
    let len = i32::try_from(input.len()).map_err(|_| Error::Signature("arguments exceed guest memory".into()))?;

    let ptr = alloc.call(&mut *store, len).map_err(trap)?;
    memory
        .write(&mut *store, ptr as u32 as usize, &input)
        .map_err(|e| Error::Trap(format!("argument write: {}", e)))?;

    let packed = entry.call(&mut *store, (ptr, len)).map_err(trap)? as u64;
    let (out_ptr, out_len) = ((packed >> 32) as usize, (packed & 0xffff_ffff) as usize);

    let output = out_ptr
        .checked_add(out_len)
        .and_then(|end| memory.data(&*store).get(out_ptr..end))
        .ok_or_else(|| Error::Trap(format!("result {}+{} lies outside guest memory", out_ptr, out_len)))?;
    frame::decode_value(output).map_err(|e| Error::Trap(format!("result decode: {}", e)))
}

fn call_scalar(store: &mut Store<Guest>, func: &Func, function: &str, args: Vec<Value>) -> Result<Value> {
    let ty = func.ty(&*store);
    let param_types: Vec<ValType> = ty.params().collect();
    let result_types: Vec<ValType> = ty.results().collect();

    if param_types.len() != args.len() {
        return Err(Error::Signature(format!(
            "'{}' takes {} arguments, got {}",
            function,
            param_types.len(),
            args.len()
        )));
    }
    if result_types.len() > 1 {
        return Err(Error::Signature(format!("'{}' returns more than one value", function)));
    }

    let params = param_types
        .iter()
        .zip(args.iter())
        .enumerate()
        .map(|(index, (ty, arg))| to_val(ty, arg).ok_or_else(|| mismatch(function, index, ty, arg)))
        .collect::<Result<Vec<Val>>>()?;

    let mut results = result_types
        .iter()
        .map(|ty| match ty {
            ValType::I32 => Ok(Val::I32(0)),
            ValType::I64 => Ok(Val::I64(0)),
            ValType::F32 => Ok(Val::F32(0)),
            ValType::F64 => Ok(Val::F64(0)),
            other => Err(Error::Signature(format!("'{}' returns unsupported type {}", function, other))),
        })
        .collect::<Result<Vec<Val>>>()?;

    func.call(&mut *store, &params, &mut results).map_err(trap)?;

    Ok(match results.first() {
        None => Value::Unit,
        Some(Val::I32(v)) => Value::Int(*v as i64),
        Some(Val::I64(v)) => Value::Int(*v),
        Some(Val::F32(bits)) => Value::Float(f32::from_bits(*bits) as f64),
        Some(Val::F64(bits)) => Value::Float(f64::from_bits(*bits)),
        Some(_) => return Err(Error::Signature(format!("'{}' returned an unsupported value", function))),
    })
}

fn to_val(ty: &ValType, arg: &Value) -> Option<Val> {
    match (ty, arg) {
        (ValType::I32, Value::Int(v)) => i32::try_from(*v).ok().map(Val::I32),
        (ValType::I64, Value::Int(v)) => Some(Val::I64(*v)),
        (ValType::F32, Value::Float(v)) => Some(Val::F32((*v as f32).to_bits())),
        (ValType::F64, Value::Float(v)) => Some(Val::F64(v.to_bits())),
        _ => None,
    }
}

fn mismatch(function: &str, index: usize, ty: &ValType, arg: &Value) -> Error {
    Error::Signature(format!(
        "'{}' argument {} expects {}, got {}",
        function,
        index,
        ty,
        arg.kind()
    ))
}

fn trap(e: wasmtime::Error) -> Error {
    Error::Trap(format!("{:#}", e))
}
