//! Script execution context: one embedded QuickJS interpreter shared by
//! every loaded plugin.
//!
//! The interpreter lives on a dedicated thread and is driven through a
//! FIFO command queue, so exactly one evaluation or entry-point call is in
//! flight at any time. Each plugin's source is compiled as the body of its
//! own function; its top-level bindings stay local to that namespace.
//!
//! Every call into script code is wrapped so that exceptions, syntax errors
//! and execution-deadline interrupts come back as `PluginError::Script`
//! and never take the interpreter down.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::convert::Coerced;
use rquickjs::function::This;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Object, Persistent, Runtime,
    Value,
};
use tokio::sync::{mpsc, oneshot};

use crate::capability::CapabilitySet;
use crate::error::PluginError;
use crate::host::{HostConfig, HostContext, HostServices, Notifier};

/// Entry points every plugin namespace must expose.
pub const ENTRY_POINTS: [&str; 3] = ["initialize", "execute", "cleanup"];

/// Appended to each plugin body; collects the entry points it declared.
const NAMESPACE_TRAILER: &str = "\n;return {\n\
    initialize: typeof initialize === 'function' ? initialize : undefined,\n\
    execute: typeof execute === 'function' ? execute : undefined,\n\
    cleanup: typeof cleanup === 'function' ? cleanup : undefined,\n\
};";

/// Installs the host API as a frozen, non-writable global.
const HOST_BOOTSTRAP: &str = "(function (api) {\n\
    Object.freeze(api);\n\
    Object.defineProperty(globalThis, 'host', {\n\
        value: api, writable: false, configurable: false, enumerable: true,\n\
    });\n\
})";

const THREAD_NAME: &str = "catu-plugin-js";

// ─── Configuration ──────────────────────────────────────────────────────

/// Resource limits for the shared interpreter.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum interpreter heap in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum native stack used by script code in bytes (default: 512 KB).
    pub max_stack_size: usize,
    /// Wall-clock budget for a single entry-point call, host calls
    /// included (default: 15 s). `None` disables the deadline.
    pub execution_timeout: Option<Duration>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            max_stack_size: 512 * 1024,
            execution_timeout: Some(Duration::from_millis(15_000)),
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .and_then(|mb| mb.checked_mul(1024 * 1024))
                .unwrap_or(defaults.memory_limit),
            max_stack_size: std::env::var("PLUGIN_MAX_STACK_KB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .and_then(|kb| kb.checked_mul(1024))
                .unwrap_or(defaults.max_stack_size),
            execution_timeout: match std::env::var("PLUGIN_EXEC_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.execution_timeout,
            },
        }
    }
}

// ─── Handles and requests ───────────────────────────────────────────────

/// Opaque reference to one evaluated plugin namespace.
///
/// Every successful evaluation gets a fresh generation, so a namespace and
/// its replacement can coexist while a reload is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceHandle {
    plugin_id: String,
    generation: u64,
}

impl NamespaceHandle {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for NamespaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.plugin_id, self.generation)
    }
}

/// What the context needs to evaluate a plugin.
#[derive(Debug, Clone)]
pub struct DefineRequest {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub source: String,
    pub capabilities: CapabilitySet,
}

enum Command {
    Evaluate {
        request: DefineRequest,
        reply: oneshot::Sender<Result<NamespaceHandle, PluginError>>,
    },
    Initialize {
        handle: NamespaceHandle,
        reply: oneshot::Sender<Result<(), PluginError>>,
    },
    Invoke {
        handle: NamespaceHandle,
        input: serde_json::Value,
        reply: oneshot::Sender<Result<serde_json::Value, PluginError>>,
    },
    Retire {
        handle: NamespaceHandle,
        reply: oneshot::Sender<Result<(), PluginError>>,
    },
    NamespaceCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ─── Public handle ──────────────────────────────────────────────────────

/// Handle to the interpreter thread. Cheap to clone.
#[derive(Clone)]
pub struct ScriptContext {
    tx: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("running", &self.is_running())
            .finish()
    }
}

fn unavailable() -> PluginError {
    PluginError::Sandbox("script context is not running".into())
}

impl ScriptContext {
    /// Start the interpreter thread.
    ///
    /// Returns once the runtime is built and the host API is installed.
    pub fn spawn(
        config: SandboxConfig,
        host: HostConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, PluginError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let engine = match Engine::new(&config, host, notifier) {
                    Ok(engine) => {
                        let _ = ready_tx.send(Ok(()));
                        engine
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                engine.run(rx);
            })?;

        ready_rx
            .recv()
            .map_err(|_| PluginError::Sandbox("interpreter thread exited during startup".into()))??;

        tracing::debug!(thread = THREAD_NAME, "plugin script context started");
        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PluginError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| unavailable())?;
        rx.await.map_err(|_| unavailable())
    }

    /// Evaluate a plugin body into a new namespace without running
    /// `initialize`. Nothing is kept if evaluation fails.
    pub async fn evaluate(&self, request: DefineRequest) -> Result<NamespaceHandle, PluginError> {
        self.request(|reply| Command::Evaluate { request, reply })
            .await?
    }

    /// Run `initialize` in an evaluated namespace. The namespace is
    /// dropped, without `cleanup`, if it throws.
    pub async fn initialize(&self, handle: &NamespaceHandle) -> Result<(), PluginError> {
        let handle = handle.clone();
        self.request(|reply| Command::Initialize { handle, reply })
            .await?
    }

    /// Evaluate and initialize in one step.
    #[cfg(test)]
    pub(crate) async fn define(
        &self,
        request: DefineRequest,
    ) -> Result<NamespaceHandle, PluginError> {
        let handle = self.evaluate(request).await?;
        self.initialize(&handle).await?;
        Ok(handle)
    }

    /// Call `execute(input)` in a namespace.
    pub async fn invoke(
        &self,
        handle: &NamespaceHandle,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let handle = handle.clone();
        self.request(|reply| Command::Invoke {
            handle,
            input,
            reply,
        })
        .await?
    }

    /// Run `cleanup` and drop the namespace. The namespace is dropped even
    /// when `cleanup` throws.
    pub async fn retire(&self, handle: &NamespaceHandle) -> Result<(), PluginError> {
        let handle = handle.clone();
        self.request(|reply| Command::Retire { handle, reply })
            .await?
    }

    /// Number of live namespaces.
    pub async fn namespace_count(&self) -> Result<usize, PluginError> {
        self.request(|reply| Command::NamespaceCount { reply }).await
    }

    /// Stop the interpreter after the commands already queued. Namespaces
    /// still defined are dropped without running `cleanup`.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

// ─── Interpreter thread ─────────────────────────────────────────────────

type ActiveSlot = Rc<RefCell<Option<HostContext>>>;

#[derive(Default)]
struct Watchdog {
    deadline: Option<Instant>,
    tripped: bool,
}

struct Namespace {
    object: Persistent<Object<'static>>,
    host: HostContext,
}

/// Owned by the interpreter thread. Field order matters: persistent values
/// must be released before the context and runtime.
struct Engine {
    namespaces: HashMap<NamespaceHandle, Namespace>,
    function_ctor: Persistent<Function<'static>>,
    active: ActiveSlot,
    watchdog: Arc<Mutex<Watchdog>>,
    timeout: Option<Duration>,
    services: Arc<HostServices>,
    next_generation: u64,
    context: Context,
    runtime: Runtime,
}

fn sandbox_err(e: rquickjs::Error) -> PluginError {
    PluginError::Sandbox(e.to_string())
}

fn script_err(e: CaughtError<'_>) -> PluginError {
    PluginError::Script(e.to_string())
}

impl Engine {
    fn new(
        config: &SandboxConfig,
        host: HostConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, PluginError> {
        let services = Arc::new(HostServices::new(host, notifier)?);

        let runtime = Runtime::new().map_err(sandbox_err)?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);

        let watchdog = Arc::new(Mutex::new(Watchdog::default()));
        let flag = watchdog.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            let Ok(mut w) = flag.lock() else {
                return false;
            };
            if matches!(w.deadline, Some(at) if Instant::now() >= at) {
                w.tripped = true;
            }
            w.tripped
        })));

        let context = Context::full(&runtime).map_err(sandbox_err)?;
        let active = ActiveSlot::default();

        let function_ctor = context.with(|ctx| -> Result<_, PluginError> {
            install_host_api(&ctx, active.clone())
                .catch(&ctx)
                .map_err(script_err)?;
            let ctor: Function = ctx.globals().get("Function").catch(&ctx).map_err(script_err)?;
            Ok(Persistent::save(&ctx, ctor))
        })?;

        Ok(Self {
            namespaces: HashMap::new(),
            function_ctor,
            active,
            watchdog,
            timeout: config.execution_timeout,
            services,
            next_generation: 1,
            context,
            runtime,
        })
    }

    fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut engine = self;
        let mut shutdown_reply = None;

        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Evaluate { request, reply } => {
                    let _ = reply.send(engine.evaluate(request));
                }
                Command::Initialize { handle, reply } => {
                    let _ = reply.send(engine.initialize(&handle));
                }
                Command::Invoke {
                    handle,
                    input,
                    reply,
                } => {
                    let _ = reply.send(engine.invoke(&handle, input));
                }
                Command::Retire { handle, reply } => {
                    let _ = reply.send(engine.retire(&handle));
                }
                Command::NamespaceCount { reply } => {
                    let _ = reply.send(engine.namespaces.len());
                }
                Command::Shutdown { reply } => {
                    shutdown_reply = Some(reply);
                    break;
                }
            }
        }

        rx.close();
        let remaining = engine.namespaces.len();
        drop(engine);
        tracing::info!(remaining, "plugin script context stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Make `host` the caller for host API checks and start the deadline.
    fn arm(&self, host: HostContext) {
        *self.active.borrow_mut() = Some(host);
        if let Ok(mut w) = self.watchdog.lock() {
            w.deadline = self.timeout.map(|t| Instant::now() + t);
            w.tripped = false;
        }
    }

    /// Clear the caller and deadline; report a tripped deadline as a
    /// timeout instead of the interpreter's generic interrupt error.
    fn disarm<T>(&self, outcome: Result<T, PluginError>) -> Result<T, PluginError> {
        self.active.borrow_mut().take();
        let tripped = self
            .watchdog
            .lock()
            .map(|mut w| {
                w.deadline = None;
                std::mem::take(&mut w.tripped)
            })
            .unwrap_or(false);

        match outcome {
            Err(_) if tripped => Err(PluginError::Script(format!(
                "execution exceeded {} ms",
                self.timeout.map(|t| t.as_millis()).unwrap_or_default()
            ))),
            other => other,
        }
    }

    fn evaluate(&mut self, request: DefineRequest) -> Result<NamespaceHandle, PluginError> {
        let start = Instant::now();
        let handle = NamespaceHandle {
            plugin_id: request.plugin_id.clone(),
            generation: self.next_generation,
        };
        self.next_generation += 1;

        let host = HostContext::new(
            self.services.clone(),
            request.plugin_id.clone(),
            request.capabilities.clone(),
        );
        let body = format!("{}{NAMESPACE_TRAILER}", request.source);
        let ctor = self.function_ctor.clone();

        self.arm(host.clone());
        let outcome = self.context.with(|ctx| -> Result<_, PluginError> {
            let ctor = ctor.restore(&ctx).catch(&ctx).map_err(script_err)?;
            let factory: Function = ctor.call((body,)).catch(&ctx).map_err(script_err)?;
            let value: Value = factory.call(()).catch(&ctx).map_err(script_err)?;
            let object = value.into_object().ok_or_else(|| {
                PluginError::Script("plugin body did not produce a namespace object".into())
            })?;

            for name in ENTRY_POINTS {
                let entry: Value = object.get(name).catch(&ctx).map_err(script_err)?;
                if !entry.is_function() {
                    return Err(PluginError::Script(format!("missing entry point '{name}'")));
                }
            }

            object.set("id", request.plugin_id.as_str()).catch(&ctx).map_err(script_err)?;
            object.set("name", request.name.as_str()).catch(&ctx).map_err(script_err)?;
            object
                .set("version", request.version.as_str())
                .catch(&ctx)
                .map_err(script_err)?;

            Ok(Persistent::save(&ctx, object))
        });
        let outcome = self.disarm(outcome);

        match outcome {
            Ok(object) => {
                tracing::debug!(
                    namespace = %handle,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "plugin namespace evaluated"
                );
                self.namespaces.insert(handle.clone(), Namespace { object, host });
                Ok(handle)
            }
            Err(e) => {
                self.runtime.run_gc();
                Err(e)
            }
        }
    }

    fn initialize(&mut self, handle: &NamespaceHandle) -> Result<(), PluginError> {
        let namespace = self
            .namespaces
            .get(handle)
            .ok_or_else(|| PluginError::NotFound(handle.to_string()))?;
        let object = namespace.object.clone();
        let host = namespace.host.clone();

        self.arm(host);
        let outcome = self.context.with(|ctx| -> Result<(), PluginError> {
            let object = object.restore(&ctx).catch(&ctx).map_err(script_err)?;
            let initialize: Function = object.get("initialize").catch(&ctx).map_err(script_err)?;
            let _: Value = initialize
                .call((This(object),))
                .catch(&ctx)
                .map_err(script_err)?;
            Ok(())
        });
        let outcome = self.disarm(outcome);

        if outcome.is_err() {
            self.namespaces.remove(handle);
            self.runtime.run_gc();
        }
        tracing::debug!(namespace = %handle, ok = outcome.is_ok(), "plugin namespace initialized");
        outcome
    }

    fn invoke(
        &mut self,
        handle: &NamespaceHandle,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let start = Instant::now();
        let namespace = self
            .namespaces
            .get(handle)
            .ok_or_else(|| PluginError::NotFound(handle.to_string()))?;
        let object = namespace.object.clone();
        let host = namespace.host.clone();
        let input_json = serde_json::to_string(&input)?;

        self.arm(host);
        let outcome = self.context.with(|ctx| -> Result<_, PluginError> {
            let object = object.restore(&ctx).catch(&ctx).map_err(script_err)?;
            let execute: Function = object.get("execute").catch(&ctx).map_err(script_err)?;
            let arg = ctx.json_parse(input_json).catch(&ctx).map_err(script_err)?;
            let result: Value = execute
                .call((This(object), arg))
                .catch(&ctx)
                .map_err(script_err)?;
            to_json(&ctx, result)
        });
        let outcome = self.disarm(outcome);

        tracing::debug!(
            namespace = %handle,
            ok = outcome.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "plugin execute finished"
        );
        outcome
    }

    fn retire(&mut self, handle: &NamespaceHandle) -> Result<(), PluginError> {
        let Namespace { object, host } = self
            .namespaces
            .remove(handle)
            .ok_or_else(|| PluginError::NotFound(handle.to_string()))?;

        self.arm(host);
        let outcome = self.context.with(|ctx| -> Result<(), PluginError> {
            let object = object.restore(&ctx).catch(&ctx).map_err(script_err)?;
            let cleanup: Function = object.get("cleanup").catch(&ctx).map_err(script_err)?;
            let _: Value = cleanup
                .call((This(object),))
                .catch(&ctx)
                .map_err(script_err)?;
            Ok(())
        });
        let outcome = self.disarm(outcome);
        self.runtime.run_gc();

        tracing::debug!(namespace = %handle, ok = outcome.is_ok(), "plugin namespace retired");
        outcome
    }
}

/// Convert a script value to JSON. `undefined`, functions and other
/// values `JSON.stringify` skips become `null`.
fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value, PluginError> {
    let Some(text) = ctx.json_stringify(value).catch(ctx).map_err(script_err)? else {
        return Ok(serde_json::Value::Null);
    };
    let text = text.to_string().catch(ctx).map_err(script_err)?;
    Ok(serde_json::from_str(&text)?)
}

// ─── Host API bindings ──────────────────────────────────────────────────

fn active_host(ctx: &Ctx<'_>, slot: &ActiveSlot) -> rquickjs::Result<HostContext> {
    slot.borrow()
        .clone()
        .ok_or_else(|| Exception::throw_message(ctx, "host API called outside a plugin call"))
}

fn throw(ctx: &Ctx<'_>, err: PluginError) -> rquickjs::Error {
    let message = match err {
        PluginError::HostFunction(msg) => msg,
        other => other.to_string(),
    };
    Exception::throw_message(ctx, &message)
}

/// Define the global `host` object. Each binding resolves the calling
/// plugin from `slot`, so capability checks apply to whoever is running.
fn install_host_api<'js>(ctx: &Ctx<'js>, slot: ActiveSlot) -> rquickjs::Result<()> {
    let api = Object::new(ctx.clone())?;

    let s = slot.clone();
    api.set(
        "readFile",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: String| {
            let host = active_host(&ctx, &s)?;
            host.read_file(&path).map_err(|e| throw(&ctx, e))
        })?
        .with_name("readFile")?,
    )?;

    let s = slot.clone();
    api.set(
        "writeFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: String, content: Coerced<String>| {
                let host = active_host(&ctx, &s)?;
                host.write_file(&path, &content.0).map_err(|e| throw(&ctx, e))
            },
        )?
        .with_name("writeFile")?,
    )?;

    let s = slot.clone();
    api.set(
        "fetch",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, url: String| {
            let host = active_host(&ctx, &s)?;
            host.fetch(&url).map_err(|e| throw(&ctx, e))
        })?
        .with_name("fetch")?,
    )?;

    let s = slot.clone();
    api.set(
        "log",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, level: Coerced<String>, message: Coerced<String>| {
                let host = active_host(&ctx, &s)?;
                host.log(&level.0, &message.0);
                Ok::<_, rquickjs::Error>(())
            },
        )?
        .with_name("log")?,
    )?;

    let s = slot;
    api.set(
        "notifyUser",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, message: Coerced<String>| {
            let host = active_host(&ctx, &s)?;
            host.notify_user(&message.0).map_err(|e| throw(&ctx, e))
        })?
        .with_name("notifyUser")?,
    )?;

    let bootstrap: Function = ctx.eval(HOST_BOOTSTRAP)?;
    bootstrap.call::<_, ()>((api,))
}

// ─── Tests ──────────────────────────────────────────────────────────────
