use crate::error::{HostError, Result};
use crate::registry::Action;
use rhai::module_resolvers::FileModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, Scope, AST};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// InvocationResult
// ---------------------------------------------------------------------------

/// Structured outcome of a successful invocation, ready to be translated
/// into a transport response.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// A warm action instance: the compiled script plus the scope its top-level
/// statements ran in. Created on first use, cached by entrypoint path, never
/// evicted. Concurrent calls to the same instance serialize on the scope.
struct ActionInstance {
    ast: AST,
    scope: Mutex<Scope<'static>>,
}

/// One cache entry per entrypoint. Cold-start work (read, compile, top-level
/// run) happens under this entry's own lock, never under the table lock, so
/// one action's initialization cannot stall invocations of other actions.
/// A failed cold start leaves the slot empty and is retried on the next call.
type InstanceSlot = Arc<Mutex<Option<Arc<ActionInstance>>>>;

/// Executes action scripts in isolated per-invocation contexts.
///
/// Each call builds a fresh [`Engine`] exposing only an enumerated capability
/// surface (module loader rooted at the action directory, `log`, `now_ms`,
/// `sleep_ms`, and `env` over the invocation's effective environment). The
/// compiled script is cached per entrypoint path; top-level state persists
/// across calls to the same action, which is intentional warm reuse.
#[derive(Clone, Default)]
pub struct Sandbox {
    instances: Arc<RwLock<HashMap<PathBuf, InstanceSlot>>>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one invocation of `action` with the given arguments and effective
    /// environment, bounded by the action's wall-clock timeout.
    ///
    /// The script runs on a blocking thread. On expiry the caller is released
    /// immediately with [`HostError::Timeout`] and a termination flag is
    /// raised; the engine's progress hook halts the script at its next
    /// operation boundary. Preemption is therefore best-effort: a script
    /// stuck inside a single host call cannot be interrupted mid-call.
    pub async fn invoke(
        &self,
        action: &Action,
        args: serde_json::Value,
        env: BTreeMap<String, String>,
    ) -> Result<InvocationResult> {
        let budget = Duration::from_millis(action.timeout_ms);
        let deadline = Instant::now() + budget;
        let cancel = Arc::new(AtomicBool::new(false));

        let this = self.clone();
        let entrypoint = action.entrypoint.clone();
        let flag = Arc::clone(&cancel);
        let timeout_ms = action.timeout_ms;
        let handle = tokio::task::spawn_blocking(move || {
            this.run_blocking(&entrypoint, args, env, flag, deadline, timeout_ms)
        });

        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(HostError::Runtime(format!("invocation task failed: {join}"))),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                Err(HostError::Timeout(action.timeout_ms))
            }
        }
    }

    fn run_blocking(
        &self,
        entrypoint: &Path,
        args: serde_json::Value,
        env: BTreeMap<String, String>,
        cancel: Arc<AtomicBool>,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<InvocationResult> {
        let action_dir = entrypoint.parent().unwrap_or(Path::new(".")).to_path_buf();
        let engine = build_engine(&action_dir, env, Arc::clone(&cancel), deadline);

        let instance = self.instance(&engine, entrypoint, timeout_ms)?;
        let args_dyn = rhai::serde::to_dynamic(args)
            .map_err(|e| HostError::Runtime(format!("cannot convert arguments: {e}")))?;

        // Top-level already ran at instance creation; call only the entry
        // function, on the instance's persistent scope.
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let mut scope = instance.scope.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = engine.call_fn_with_options::<Dynamic>(
            options,
            &mut scope,
            &instance.ast,
            "main",
            (args_dyn,),
        );
        drop(scope);

        match outcome {
            Ok(value) => map_result(value),
            Err(err) => Err(classify(err, timeout_ms)),
        }
    }

    /// Return the warm instance for an entrypoint, creating it on first use:
    /// read the script, compile it, and run its top-level statements once.
    ///
    /// The table lock is held only long enough to find or insert the entry's
    /// slot; the cold-start work itself runs under the slot's lock, so other
    /// entrypoints' lookups are never blocked behind it.
    fn instance(
        &self,
        engine: &Engine,
        entrypoint: &Path,
        timeout_ms: u64,
    ) -> Result<Arc<ActionInstance>> {
        let slot = {
            let table = self.instances.read().unwrap_or_else(|e| e.into_inner());
            table.get(entrypoint).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut table = self.instances.write().unwrap_or_else(|e| e.into_inner());
                Arc::clone(table.entry(entrypoint.to_path_buf()).or_default())
            }
        };

        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(instance) = guard.as_ref() {
            return Ok(Arc::clone(instance));
        }

        let source = std::fs::read_to_string(entrypoint)
            .map_err(|e| HostError::Load(format!("cannot read {}: {e}", entrypoint.display())))?;
        let ast = engine
            .compile(&source)
            .map_err(|e| HostError::Load(format!("cannot parse {}: {e}", entrypoint.display())))?;

        let mut scope = Scope::new();
        engine.run_ast_with_scope(&mut scope, &ast).map_err(|e| {
            // A top-level halted by the deadline is a timeout of this
            // invocation, not a defect in the script's code.
            if matches!(*e, rhai::EvalAltResult::ErrorTerminated(..)) {
                HostError::Timeout(timeout_ms)
            } else {
                HostError::Load(format!("top-level of {} failed: {e}", entrypoint.display()))
            }
        })?;

        let instance = Arc::new(ActionInstance {
            ast,
            scope: Mutex::new(scope),
        });
        *guard = Some(Arc::clone(&instance));
        tracing::debug!("warm instance created for {}", entrypoint.display());
        Ok(instance)
    }
}

// ---------------------------------------------------------------------------
// Engine construction — the enumerated capability surface
// ---------------------------------------------------------------------------

fn build_engine(
    action_dir: &Path,
    env: BTreeMap<String, String>,
    cancel: Arc<AtomicBool>,
    deadline: Instant,
) -> Engine {
    let mut engine = Engine::new();

    // Module loader restricted to the action's own directory.
    engine.set_module_resolver(FileModuleResolver::new_with_path(action_dir.to_path_buf()));

    // Logger: `print`, `debug`, and an explicit `log` capability all route to
    // the host's tracing output, tagged as action output.
    engine.on_print(|text| tracing::info!(target: "whisklet_action", "{text}"));
    engine.on_debug(|text, source, pos| {
        tracing::debug!(target: "whisklet_action", "{} @ {pos}: {text}", source.unwrap_or("action"));
    });
    engine.register_fn("log", |msg: &str| {
        tracing::info!(target: "whisklet_action", "{msg}");
    });

    // Timer capabilities.
    engine.register_fn("now_ms", || -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    });
    {
        let cancel = Arc::clone(&cancel);
        engine.register_fn("sleep_ms", move |ms: i64| {
            // Sliced so a timed-out invocation stops sleeping promptly.
            let until = Instant::now() + Duration::from_millis(ms.max(0) as u64);
            while Instant::now() < until && !cancel.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
        });
    }

    // The invocation's effective environment, read-only. Passed by value so
    // concurrent invocations can never observe each other's variables.
    engine.register_fn("env", move |name: &str| -> Dynamic {
        match env.get(name) {
            Some(value) => Dynamic::from(value.clone()),
            None => Dynamic::UNIT,
        }
    });

    // Cooperative termination: checked between operations, so already-running
    // host calls finish before the script is halted.
    engine.on_progress(move |_ops| {
        if cancel.load(Ordering::Relaxed) || Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    engine
}

// ---------------------------------------------------------------------------
// Result mapping
// ---------------------------------------------------------------------------

/// Translate the value returned by `main` into an [`InvocationResult`].
///
/// No `body` field (or a unit/null body) means 204 with an empty body. With a
/// body, `statusCode` wins when present; otherwise 200, or 500 when the
/// object carries a truthy `error` field. A unit return is "no response" and
/// a runtime failure.
fn map_result(value: Dynamic) -> Result<InvocationResult> {
    if value.is_unit() {
        return Err(HostError::Runtime("No response!".to_string()));
    }

    let json: serde_json::Value = rhai::serde::from_dynamic(&value)
        .map_err(|e| HostError::Runtime(format!("unserializable action result: {e}")))?;
    let Some(object) = json.as_object() else {
        return Err(HostError::Runtime(
            "action returned a non-object result".to_string(),
        ));
    };

    let mut headers = BTreeMap::new();
    if let Some(declared) = object.get("headers").and_then(|h| h.as_object()) {
        for (name, value) in declared {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            headers.insert(name.clone(), value);
        }
    }

    let body = object.get("body").filter(|b| !b.is_null()).cloned();
    match body {
        None => Ok(InvocationResult {
            status: 204,
            headers,
            body: None,
        }),
        Some(body) => {
            let status = match object.get("statusCode") {
                Some(declared) => declared
                    .as_u64()
                    .and_then(|s| u16::try_from(s).ok())
                    .filter(|s| (100..=599).contains(s))
                    .ok_or_else(|| {
                        HostError::Runtime(format!("invalid statusCode: {declared}"))
                    })?,
                None => {
                    if truthy(object.get("error")) {
                        500
                    } else {
                        200
                    }
                }
            };
            Ok(InvocationResult {
                status,
                headers,
                body: Some(body),
            })
        }
    }
}

fn truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn classify(err: Box<rhai::EvalAltResult>, timeout_ms: u64) -> HostError {
    use rhai::EvalAltResult;
    match *err {
        EvalAltResult::ErrorTerminated(..) => HostError::Timeout(timeout_ms),
        // The engine reports the full call signature, e.g. `main (map)`.
        // Match only the entry call itself; a script calling some other
        // missing function is a runtime failure, not a load failure.
        EvalAltResult::ErrorFunctionNotFound(ref name, _)
            if name == "main" || name.starts_with("main (") =>
        {
            HostError::Load(format!("entry function not found: {name}"))
        }
        _ => HostError::Runtime(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scaffold(dir: &tempfile::TempDir, script: &str) -> Action {
        scaffold_named(dir, "pkg", "act", script)
    }

    fn scaffold_named(dir: &tempfile::TempDir, package: &str, name: &str, script: &str) -> Action {
        let action_dir = dir.path().join(package).join(name);
        std::fs::create_dir_all(&action_dir).unwrap();
        let entrypoint = action_dir.join("main.rhai");
        std::fs::write(&entrypoint, script).unwrap();
        Action {
            package: package.to_string(),
            name: name.to_string(),
            route: format!("/{package}/{name}"),
            entrypoint,
            timeout_ms: 30_000,
            environment: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn maps_body_status_and_headers() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(
            &dir,
            r#"fn main(args) {
                #{ body: #{ ok: true }, statusCode: 201, headers: #{ "X-Test": "1" } }
            }"#,
        );

        let sandbox = Sandbox::new();
        let result = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.status, 201);
        assert_eq!(result.headers["X-Test"], "1");
        assert_eq!(result.body, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn empty_object_is_204_no_body() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args) { #{} }");

        let sandbox = Sandbox::new();
        let result = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.status, 204);
        assert_eq!(result.body, None);
    }

    #[tokio::test]
    async fn body_without_status_is_200() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, r#"fn main(args) { #{ body: #{ hi: "there" } } }"#);

        let sandbox = Sandbox::new();
        let result = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.status, 200);
    }

    #[tokio::test]
    async fn error_body_without_status_is_500() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(
            &dir,
            r#"fn main(args) { #{ error: true, body: #{ message: "boom" } } }"#,
        );

        let sandbox = Sandbox::new();
        let result = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.status, 500);
    }

    #[tokio::test]
    async fn unit_return_is_no_response() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args) { }");

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            HostError::Runtime(msg) => assert_eq!(msg, "No response!"),
            other => panic!("expected Runtime, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_object_return_is_runtime_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args) { 42 }");

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Runtime(_)));
    }

    #[tokio::test]
    async fn args_reach_the_entry_function() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args) { #{ body: #{ got: args.x } } }");

        let sandbox = Sandbox::new();
        let result = sandbox
            .invoke(&action, json!({ "x": 7 }), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result.body, Some(json!({ "got": 7 })));
    }

    #[tokio::test]
    async fn env_capability_reads_only_this_invocations_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(
            &dir,
            r#"fn main(args) { #{ body: #{ val: env("MY_VAR"), missing: env("ABSENT") == () } } }"#,
        );

        let mut env = BTreeMap::new();
        env.insert("MY_VAR".to_string(), "alpha".to_string());

        let sandbox = Sandbox::new();
        let result = sandbox.invoke(&action, json!({}), env).await.unwrap();
        assert_eq!(result.body, Some(json!({ "val": "alpha", "missing": true })));
    }

    #[tokio::test]
    async fn concurrent_invocations_see_independent_environments() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = scaffold_named(
            &dir,
            "pkg",
            "a",
            r#"fn main(args) { sleep_ms(30); #{ body: #{ val: env("WHO") } } }"#,
        );
        let b = scaffold_named(
            &dir,
            "pkg",
            "b",
            r#"fn main(args) { sleep_ms(30); #{ body: #{ val: env("WHO") } } }"#,
        );

        let mut env_a = BTreeMap::new();
        env_a.insert("WHO".to_string(), "alpha".to_string());
        let mut env_b = BTreeMap::new();
        env_b.insert("WHO".to_string(), "beta".to_string());

        let sandbox = Sandbox::new();
        let (ra, rb) = tokio::join!(
            sandbox.invoke(&a, json!({}), env_a),
            sandbox.invoke(&b, json!({}), env_b),
        );
        assert_eq!(ra.unwrap().body, Some(json!({ "val": "alpha" })));
        assert_eq!(rb.unwrap().body, Some(json!({ "val": "beta" })));
    }

    #[tokio::test]
    async fn runaway_script_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut action = scaffold(&dir, "fn main(args) { loop { } }");
        action.timeout_ms = 100;

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Timeout(100)));
    }

    #[tokio::test]
    async fn sleeping_script_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut action = scaffold(&dir, "fn main(args) { sleep_ms(60000); #{} }");
        action.timeout_ms = 100;

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Timeout(_)));
    }

    #[tokio::test]
    async fn script_is_cached_by_entrypoint_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args) { #{ body: #{ v: 1 } } }");

        let sandbox = Sandbox::new();
        let first = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(first.body, Some(json!({ "v": 1 })));

        // Rewriting the file does not affect a warm instance: the code unit
        // was loaded once and cached by path.
        std::fs::write(&action.entrypoint, "fn main(args) { #{ body: #{ v: 2 } } }").unwrap();
        let second = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(second.body, Some(json!({ "v": 1 })));
    }

    #[tokio::test]
    async fn top_level_state_persists_across_calls() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(
            &dir,
            r#"
let count = 0;

fn main(args) {
    count += 1;
    #{ body: #{ count: count } }
}
"#,
        );

        let sandbox = Sandbox::new();
        let first = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(first.body, Some(json!({ "count": 1 })));

        let second = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(second.body, Some(json!({ "count": 2 })));
    }

    #[tokio::test]
    async fn cold_start_of_one_action_does_not_stall_another() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut slow = scaffold_named(&dir, "pkg", "slowboot", "loop { }\n\nfn main(args) { #{} }");
        slow.timeout_ms = 1000;
        let mut fast = scaffold_named(
            &dir,
            "pkg",
            "fast",
            r#"fn main(args) { #{ body: #{ ok: true } } }"#,
        );
        fast.timeout_ms = 300;

        let sandbox = Sandbox::new();
        let (rs, rf) = tokio::join!(
            sandbox.invoke(&slow, json!({}), BTreeMap::new()),
            sandbox.invoke(&fast, json!({}), BTreeMap::new()),
        );
        // The unrelated action completes while the other is still stuck in
        // its top-level; only the offender's own budget expires.
        assert_eq!(rf.unwrap().body, Some(json!({ "ok": true })));
        assert!(matches!(rs.unwrap_err(), HostError::Timeout(1000)));
    }

    #[tokio::test]
    async fn out_of_range_status_code_is_runtime_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args) { #{ body: #{}, statusCode: 99999 } }");

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            HostError::Runtime(msg) => assert!(msg.contains("invalid statusCode")),
            other => panic!("expected Runtime, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_entry_function_is_load_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn not_main() { #{} }");

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Load(_)));
    }

    #[tokio::test]
    async fn unparsable_script_is_load_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args { nope");

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Load(_)));
    }

    #[tokio::test]
    async fn missing_script_file_is_load_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut action = scaffold(&dir, "fn main(args) { #{} }");
        action.entrypoint = dir.path().join("pkg/act/ghost.rhai");

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Load(_)));
    }

    #[tokio::test]
    async fn call_to_missing_helper_is_runtime_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, "fn main(args) { main_helper() }");

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Runtime(_)));
    }

    #[tokio::test]
    async fn script_exception_is_runtime_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let action = scaffold(&dir, r#"fn main(args) { throw "kaboom"; }"#);

        let sandbox = Sandbox::new();
        let err = sandbox
            .invoke(&action, json!({}), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Runtime(_)));
    }
}
