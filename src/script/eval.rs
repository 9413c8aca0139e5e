//! Script evaluation
//!
//! Every call is resolved through a static dispatch table. Verbs go through
//! the cache first: the step line is printed, the cache key derived from the
//! verb and its stringified arguments, and the verb body only runs on a miss.
//! Funcs are read-only; they return values and never touch the cache.

use super::ast::{Call, Expr, Segment, Stmt};
use super::parser::parse;
use super::value::Value;
use crate::build::cache_key::verb_key;
use crate::build::interpreter::{SaveRequest, Scope};
use crate::build::{Globals, Interpreter};
use crate::error::{KilnError, KilnResult};
use crate::signal::TrackedFunc;
use crate::ui;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Nesting limit for `import`
const MAX_IMPORT_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    After,
    Label,
    Debug,
    SetExec,
    Workdir,
    User,
    Flatten,
    Tag,
    Entrypoint,
    From,
    WithUser,
    Inside,
    Env,
    Cmd,
    Run,
    Copy,
    Var,
    Import,
    Save,
    Getenv,
    Getuid,
    Getgid,
    Read,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Verb,
    Func,
}

/// Positional argument count a handler accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    None,
    Exactly(usize),
    Range(usize, usize),
    Any,
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Arity::None => count == 0,
            Arity::Exactly(n) => count == n,
            Arity::Range(min, max) => (min..=max).contains(&count),
            Arity::Any => true,
        }
    }

    fn describe(self) -> String {
        match self {
            Arity::None => "0".into(),
            Arity::Exactly(n) => n.to_string(),
            Arity::Range(min, max) => format!("{} to {}", min, max),
            Arity::Any => "any number of".into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    handler: Handler,
    kind: Kind,
    arity: Arity,
    block: bool,
}

const fn verb(handler: Handler, arity: Arity, block: bool) -> Entry {
    Entry {
        handler,
        kind: Kind::Verb,
        arity,
        block,
    }
}

const fn func(handler: Handler, arity: Arity, block: bool) -> Entry {
    Entry {
        handler,
        kind: Kind::Func,
        arity,
        block,
    }
}

const TABLE: &[(&str, Entry)] = &[
    ("after", verb(Handler::After, Arity::None, true)),
    ("label", verb(Handler::Label, Arity::Exactly(1), false)),
    ("debug", verb(Handler::Debug, Arity::Range(0, 1), false)),
    ("set_exec", verb(Handler::SetExec, Arity::Exactly(1), false)),
    ("workdir", verb(Handler::Workdir, Arity::Exactly(1), false)),
    ("user", verb(Handler::User, Arity::Exactly(1), false)),
    ("flatten", verb(Handler::Flatten, Arity::None, false)),
    ("tag", verb(Handler::Tag, Arity::Exactly(1), false)),
    ("entrypoint", verb(Handler::Entrypoint, Arity::Any, false)),
    ("from", verb(Handler::From, Arity::Exactly(1), false)),
    ("with_user", verb(Handler::WithUser, Arity::Exactly(1), true)),
    ("inside", verb(Handler::Inside, Arity::Exactly(1), true)),
    ("env", verb(Handler::Env, Arity::Any, false)),
    ("cmd", verb(Handler::Cmd, Arity::Any, false)),
    ("run", verb(Handler::Run, Arity::Any, false)),
    ("copy", verb(Handler::Copy, Arity::Range(2, 3), false)),
    ("var", func(Handler::Var, Arity::Exactly(1), false)),
    ("import", func(Handler::Import, Arity::Exactly(1), false)),
    ("save", func(Handler::Save, Arity::Exactly(1), false)),
    ("getenv", func(Handler::Getenv, Arity::Exactly(1), false)),
    ("getuid", func(Handler::Getuid, Arity::Exactly(1), false)),
    ("getgid", func(Handler::Getgid, Arity::Exactly(1), false)),
    ("read", func(Handler::Read, Arity::Exactly(1), false)),
    ("skip", func(Handler::Skip, Arity::None, true)),
];

/// Names in the dispatch table, verbs and funcs alike
pub fn known_names() -> impl Iterator<Item = &'static str> {
    TABLE.iter().map(|(name, _)| *name)
}

fn dispatch_table(omit: &[String]) -> HashMap<&'static str, Entry> {
    TABLE
        .iter()
        .filter(|(name, _)| !omit.iter().any(|o| o == name))
        .map(|(name, entry)| (*name, *entry))
        .collect()
}

/// Outcome of one script, tagged with its file name
#[derive(Debug)]
pub struct BuildResult {
    pub file_name: String,
    pub outcome: KilnResult<String>,
}

impl BuildResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Outcome of one incremental evaluation
#[derive(Debug)]
pub struct CodeResult {
    pub result: BuildResult,
    /// Statements that completed before any error
    pub evaluated: usize,
    /// The input ended inside an open construct; feed more lines
    pub incomplete: bool,
}

pub struct Evaluator {
    interp: Interpreter,
    file_name: String,
    table: HashMap<&'static str, Entry>,
    locals: HashMap<String, Value>,
    after: Option<Vec<Stmt>>,
    shell: String,
    cancel: CancellationToken,
    _cancel_hook: Option<TrackedFunc>,
    imports: usize,
}

impl Evaluator {
    pub fn new(interp: Interpreter, globals: &Globals, file_name: impl Into<String>) -> Self {
        Self {
            interp,
            file_name: file_name.into(),
            table: dispatch_table(&globals.omit),
            locals: HashMap::new(),
            after: None,
            shell: globals.shell.clone(),
            cancel: globals.cancel.clone(),
            _cancel_hook: None,
            imports: 0,
        }
    }

    /// Keep `hook` registered until the evaluator is dropped
    pub fn with_cancel_hook(mut self, hook: TrackedFunc) -> Self {
        self._cancel_hook = Some(hook);
        self
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interp
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Run a whole script: every statement, then the final image, then the
    /// `after` block
    pub async fn run_script(&mut self, source: &str) -> BuildResult {
        let outcome = self.script(source).await;
        BuildResult {
            file_name: self.file_name.clone(),
            outcome,
        }
    }

    async fn script(&mut self, source: &str) -> KilnResult<String> {
        let stmts = parse(source)?;
        self.block(&stmts).await?;

        let id = self.interp.make_image().await?;
        debug!("Final image before after block: {}", id);

        if let Some(after) = self.after.take() {
            self.block(&after).await?;
        }
        Ok(self.interp.image_id().to_string())
    }

    /// Evaluate a fragment against the running build
    ///
    /// State carries over between calls. The result is the fragment's last
    /// value when it has a string form, otherwise the current image id.
    /// `after` blocks are recorded but never run here.
    pub async fn run_code(&mut self, source: &str) -> CodeResult {
        let stmts = match parse(source) {
            Ok(stmts) => stmts,
            Err(e) => {
                let incomplete = super::parser::is_incomplete(&e);
                return CodeResult {
                    result: self.result(Err(e)),
                    evaluated: 0,
                    incomplete,
                };
            }
        };

        let mut evaluated = 0;
        let mut last = Value::Nil;
        for stmt in &stmts {
            match self.statement(stmt).await {
                Ok(value) => {
                    last = value;
                    evaluated += 1;
                }
                Err(e) => {
                    return CodeResult {
                        result: self.result(Err(e)),
                        evaluated,
                        incomplete: false,
                    }
                }
            }
        }

        let text = last.to_string();
        let value = if text.is_empty() {
            self.interp.image_id().to_string()
        } else {
            text
        };
        CodeResult {
            result: self.result(Ok(value)),
            evaluated,
            incomplete: false,
        }
    }

    fn result(&self, outcome: KilnResult<String>) -> BuildResult {
        BuildResult {
            file_name: self.file_name.clone(),
            outcome,
        }
    }

    async fn block(&mut self, stmts: &[Stmt]) -> KilnResult<Value> {
        let mut last = Value::Nil;
        for stmt in stmts {
            last = self.statement(stmt).await?;
        }
        Ok(last)
    }

    async fn statement(&mut self, stmt: &Stmt) -> KilnResult<Value> {
        match stmt {
            Stmt::Expr(expr) => self.expression(expr).await,
            Stmt::Assign { name, value, line } => {
                if self.table.contains_key(name.as_str()) {
                    return Err(KilnError::Parse {
                        line: *line,
                        message: format!("cannot assign to {:?}: it names a verb or function", name),
                    });
                }
                let value = self.expression(value).await?;
                self.locals.insert(name.clone(), value.clone());
                Ok(value)
            }
        }
    }

    fn expression<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, KilnResult<Value>> {
        Box::pin(async move {
            match expr {
                Expr::Nil => Ok(Value::Nil),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Int(i) => Ok(Value::Int(*i)),
                Expr::Str(segments) => {
                    let mut out = String::new();
                    for segment in segments {
                        match segment {
                            Segment::Lit(text) => out.push_str(text),
                            Segment::Interp(inner) => {
                                out.push_str(&self.expression(inner).await?.to_string())
                            }
                        }
                    }
                    Ok(Value::Str(out))
                }
                Expr::Array(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.expression(item).await?);
                    }
                    Ok(Value::List(values))
                }
                Expr::Hash(pairs) => {
                    let mut entries = Vec::with_capacity(pairs.len());
                    for (key, value) in pairs {
                        let key = self.expression(key).await?.to_string();
                        let value = self.expression(value).await?;
                        Value::map_insert(&mut entries, key, value);
                    }
                    Ok(Value::Map(entries))
                }
                Expr::Call(call) => self.call(call).await,
            }
        })
    }

    async fn call(&mut self, call: &Call) -> KilnResult<Value> {
        if call.bare {
            if let Some(value) = self.locals.get(&call.name) {
                return Ok(value.clone());
            }
        }

        let entry = *self.table.get(call.name.as_str()).ok_or_else(|| {
            KilnError::script(&call.name, "undefined verb or function").at_step(&call.name, call.line)
        })?;

        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.expression(arg).await?);
        }

        check_call(&call.name, entry, args.len(), call.block.is_some())
            .map_err(|e| e.at_step(&call.name, call.line))?;

        let block = call.block.as_deref().unwrap_or_default();
        let result = match entry.kind {
            Kind::Verb => self
                .verb(&call.name, entry.handler, args, block)
                .await
                .map(|()| Value::Nil),
            Kind::Func => self.func(&call.name, entry.handler, args, block).await,
        };
        result.map_err(|e| e.at_step(&call.name, call.line))
    }

    async fn verb(
        &mut self,
        name: &str,
        handler: Handler,
        args: Vec<Value>,
        block: &[Stmt],
    ) -> KilnResult<()> {
        if self.cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }

        let str_args: Vec<String> = args.iter().map(Value::to_string).collect();
        let key = verb_key(name, &str_args);
        ui::build_step(self.interp.executor().ui(), name, &str_args);

        if std::env::var_os("KILN_DEBUG").is_some_and(|v| !v.is_empty()) {
            let config = serde_json::to_string_pretty(self.interp.executor().config())?;
            debug!("Configuration before {}:\n{}", name, config);
        }

        let cached = self.interp.executor_mut().check_cache(&key).await?;
        self.interp.set_cache_key(key);

        // debug is interactive; replaying it from the cache would skip the session
        if cached && handler != Handler::Debug {
            return Ok(());
        }

        match handler {
            Handler::After => {
                self.after = Some(block.to_vec());
                Ok(())
            }
            Handler::Label => {
                let pairs = string_pairs(name, &args[0])?;
                self.interp.label(&pairs).await
            }
            Handler::Debug => {
                let shell = match args.first() {
                    Some(value) => value.to_string(),
                    None => self.shell.clone(),
                };
                self.interp.debug(&shell).await
            }
            Handler::SetExec => {
                let Value::Map(entries) = &args[0] else {
                    return Err(expected(name, "a hash", &args[0]));
                };
                let mut targets = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let Value::List(items) = value else {
                        return Err(KilnError::script(
                            name,
                            format!("value for key {:?} is not array, must be array", key),
                        ));
                    };
                    targets.push((key.clone(), items.iter().map(Value::to_string).collect()));
                }
                self.interp.set_exec(&targets).await
            }
            Handler::Workdir => self.interp.workdir(&str_args[0]).await,
            Handler::User => self.interp.user(&str_args[0]).await,
            Handler::Flatten => self.interp.flatten().await,
            Handler::Tag => self.interp.tag(&str_args[0]).await,
            Handler::Entrypoint => self.interp.entrypoint(string_or_array(&args)).await,
            Handler::Cmd => self.interp.cmd(string_or_array(&args)).await,
            Handler::From => self.interp.from(&str_args[0]).await,
            Handler::WithUser => {
                self.scoped(Scope::User(str_args[0].clone()), block)
                    .await
            }
            Handler::Inside => {
                self.scoped(Scope::Inside(str_args[0].clone()), block)
                    .await
            }
            Handler::Env => {
                if args.is_empty() {
                    return Err(KilnError::script(name, "expected a hash of variables"));
                }
                let mut pairs = Vec::new();
                for arg in &args {
                    pairs.extend(string_pairs(name, arg)?);
                }
                self.interp.env(&pairs).await
            }
            Handler::Run => {
                let Some(Value::Str(command)) = args.first() else {
                    return Err(KilnError::script(name, "no command to run in run statement"));
                };
                let output = match args.get(1) {
                    None => true,
                    Some(Value::Map(options)) => !options
                        .iter()
                        .any(|(k, v)| k == "output" && v.to_string() == "false"),
                    Some(other) => {
                        return Err(KilnError::script(
                            name,
                            format!("invalid argument {:?} for run statement", other.to_string()),
                        ))
                    }
                };
                if args.len() > 2 {
                    return Err(KilnError::script(name, "too many arguments to run"));
                }
                self.interp.run(command, output).await
            }
            Handler::Copy => {
                let request = copy_args(name, &args)?;
                self.interp
                    .copy(
                        &request.source,
                        &request.target,
                        request.ignore_list,
                        request.ignore_file.as_deref(),
                    )
                    .await
            }
            other => Err(KilnError::Internal(format!("{:?} is not a verb", other))),
        }
    }

    async fn func(
        &mut self,
        name: &str,
        handler: Handler,
        args: Vec<Value>,
        block: &[Stmt],
    ) -> KilnResult<Value> {
        let arg = args.first().map(Value::to_string).unwrap_or_default();
        match handler {
            Handler::Var => {
                let value = self.interp.var(&arg)?;
                debug!("var {} = {}", arg, value);
                Ok(Value::Str(value))
            }
            Handler::Getenv => Ok(Value::Str(self.interp.getenv(&arg))),
            Handler::Getuid => Ok(Value::Str(self.interp.getuid(&arg).await?)),
            Handler::Getgid => Ok(Value::Str(self.interp.getgid(&arg).await?)),
            Handler::Read => Ok(Value::Str(self.interp.read(&arg).await?)),
            Handler::Import => self.import(&arg).await,
            Handler::Save => {
                let request = save_args(name, &args[0])?;
                self.interp.save(request).await?;
                Ok(Value::Nil)
            }
            Handler::Skip => {
                self.scoped(Scope::Skip, block).await?;
                Ok(Value::Nil)
            }
            other => Err(KilnError::Internal(format!("{:?} is not a func", other))),
        }
    }

    /// Run a block under an override that is undone however the block ends
    async fn scoped(&mut self, scope: Scope, block: &[Stmt]) -> KilnResult<()> {
        let saved = self.interp.enter_scope(scope)?;
        let result = self.block(block).await;
        self.interp.leave_scope(saved);
        result.map(|_| ())
    }

    async fn import(&mut self, path: &str) -> KilnResult<Value> {
        if self.imports >= MAX_IMPORT_DEPTH {
            return Err(KilnError::script("import", format!("imports nested deeper than {}", MAX_IMPORT_DEPTH)));
        }
        let full = self.interp.build_dir().join(path);
        let source = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", full.display()), e))?;
        let stmts = parse(&source)?;

        self.imports += 1;
        let result = self.block(&stmts).await;
        self.imports -= 1;
        result?;

        Ok(Value::Str(self.interp.image_id().to_string()))
    }
}

fn check_call(name: &str, entry: Entry, count: usize, has_block: bool) -> KilnResult<()> {
    if !entry.arity.accepts(count) {
        return Err(KilnError::script(
            name,
            format!("expected {} arg(s), got {}", entry.arity.describe(), count),
        ));
    }
    match (entry.block, has_block) {
        (true, false) => Err(KilnError::script(name, "requires a do ... end block")),
        (false, true) => Err(KilnError::script(name, "does not take a block")),
        _ => Ok(()),
    }
}

fn expected(verb: &str, what: &str, got: &Value) -> KilnError {
    KilnError::script(verb, format!("expected {}, got {}", what, got.type_name()))
}

/// Hash entries with their values stringified
fn string_pairs(verb: &str, value: &Value) -> KilnResult<Vec<(String, String)>> {
    match value {
        Value::Map(entries) => Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()),
        other => Err(expected(verb, "a hash", other)),
    }
}

/// A single array argument, or the arguments themselves
fn string_or_array(args: &[Value]) -> Vec<String> {
    match args {
        [Value::List(items)] => items.iter().map(Value::to_string).collect(),
        _ => args.iter().map(Value::to_string).collect(),
    }
}

#[derive(Debug, Default)]
struct CopyRequest {
    source: String,
    target: String,
    ignore_list: Vec<String>,
    ignore_file: Option<String>,
}

fn copy_args(verb: &str, args: &[Value]) -> KilnResult<CopyRequest> {
    let mut request = CopyRequest::default();
    let mut strings = 0;

    for arg in args {
        match arg {
            Value::Str(s) => {
                match strings {
                    0 => request.source = s.clone(),
                    1 => request.target = s.clone(),
                    _ => return Err(KilnError::script(verb, "too many arguments in copy")),
                }
                strings += 1;
            }
            Value::Map(options) => {
                for (key, value) in options {
                    match (key.as_str(), value) {
                        ("ignore_list", Value::List(items)) => request
                            .ignore_list
                            .extend(items.iter().map(Value::to_string)),
                        ("ignore_file", value) => request.ignore_file = Some(value.to_string()),
                        (key, _) => {
                            return Err(KilnError::script(
                                verb,
                                format!("{:?} is not a valid copy option", key),
                            ))
                        }
                    }
                }
            }
            other => return Err(expected(verb, "a string or a hash", other)),
        }
    }

    if strings < 2 {
        return Err(KilnError::script(verb, "copy needs a source and a target"));
    }
    Ok(request)
}

fn save_args(func: &str, value: &Value) -> KilnResult<SaveRequest> {
    let Value::Map(entries) = value else {
        return Err(expected(func, "a hash", value));
    };
    if entries.is_empty() {
        return Err(KilnError::script(func, "save must be called with parameters"));
    }

    let mut request = SaveRequest::default();
    for (key, value) in entries {
        let value = Some(value.to_string());
        match key.as_str() {
            "tag" => request.tag = value,
            "file" => request.file = value,
            "kind" => request.kind = value,
            other => {
                return Err(KilnError::script(
                    func,
                    format!("{:?} is not a valid parameter to the save function", other),
                ))
            }
        }
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerEngine, MemoryEngine};
    use crate::executor::Executor;
    use crate::pull::PullCoordinator;
    use crate::signal::CancellationRegistry;
    use crate::ui::UiContext;
    use serial_test::serial;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn evaluator_with(engine: Arc<MemoryEngine>, dir: &Path, globals: &Globals) -> Evaluator {
        let exec = Executor::new(
            engine,
            PullCoordinator::new(),
            CancellationRegistry::new(),
            globals,
            UiContext::non_interactive().with_quiet(true),
        );
        let vars = HashMap::from([("name".to_string(), "web".to_string())]);
        Evaluator::new(Interpreter::new(exec, vars, dir), globals, "test.kiln")
    }

    fn evaluator(engine: Arc<MemoryEngine>, dir: &Path) -> Evaluator {
        evaluator_with(engine, dir, &Globals::default())
    }

    #[test]
    fn table_respects_omit_list() {
        let table = dispatch_table(&["run".to_string(), "getenv".to_string()]);
        assert!(!table.contains_key("run"));
        assert!(!table.contains_key("getenv"));
        assert!(table.contains_key("copy"));
        assert_eq!(known_names().count(), TABLE.len());
    }

    #[test]
    fn arity_contracts() {
        let copy = dispatch_table(&[])["copy"];
        assert!(check_call("copy", copy, 2, false).is_ok());
        assert!(check_call("copy", copy, 3, false).is_ok());
        assert!(check_call("copy", copy, 1, false).is_err());

        let skip = dispatch_table(&[])["skip"];
        assert!(check_call("skip", skip, 0, true).is_ok());
        assert!(check_call("skip", skip, 0, false).is_err());
        assert!(check_call("flatten", dispatch_table(&[])["flatten"], 0, true).is_err());
    }

    #[test]
    fn copy_argument_parsing() {
        let args = vec![
            Value::from("src"),
            Value::from("/app"),
            Value::Map(vec![(
                "ignore_list".into(),
                Value::List(vec!["*.o".into(), "target".into()]),
            )]),
        ];
        let request = copy_args("copy", &args).unwrap();
        assert_eq!(request.source, "src");
        assert_eq!(request.target, "/app");
        assert_eq!(request.ignore_list, ["*.o", "target"]);

        let err = copy_args("copy", &["a".into(), "b".into(), "c".into()]).unwrap_err();
        assert!(err.to_string().contains("too many arguments"));
    }

    #[test]
    fn save_argument_parsing() {
        let request = save_args(
            "save",
            &Value::Map(vec![("file".into(), "out.tar".into()), ("kind".into(), "oci".into())]),
        )
        .unwrap();
        assert_eq!(request.file.as_deref(), Some("out.tar"));
        assert!(request.tag.is_none());

        assert!(save_args("save", &Value::Map(vec![])).is_err());
        let err = save_args("save", &Value::Map(vec![("bogus".into(), "x".into())])).unwrap_err();
        assert!(err.to_string().contains("not a valid parameter"));
    }

    #[tokio::test]
    async fn script_produces_final_image() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut eval = evaluator(engine.clone(), temp.path());
        let result = eval
            .run_script("from \"debian\"\nrun \"make\"\ntag \"t1\"\n")
            .await;
        let id = result.outcome.unwrap();
        assert_eq!(engine.lookup("t1").await.unwrap(), id);
        assert_eq!(result.file_name, "test.kiln");
    }

    #[tokio::test]
    async fn second_run_is_fully_cached() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let script = "from \"debian\"\nrun \"make-file\"\ntag \"t1\"\n";

        let first = evaluator(engine.clone(), temp.path())
            .run_script(script)
            .await
            .outcome
            .unwrap();
        let runs = engine.runs();
        assert_eq!(runs, 1);

        let second = evaluator(engine.clone(), temp.path())
            .run_script(script)
            .await
            .outcome
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.runs(), runs);
    }

    #[tokio::test]
    async fn failing_run_keeps_previous_image() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new().fail_on("cmd-that-fails"));
        let mut eval = evaluator(engine.clone(), temp.path());
        let base = engine.pull("base").await.unwrap();

        let result = eval
            .run_script("from \"base\"\nrun \"cmd-that-fails\"\n")
            .await;
        let err = result.outcome.unwrap_err();
        assert!(matches!(err, KilnError::Step { ref verb, line: 2, .. } if verb == "run"));
        assert_eq!(eval.interpreter().image_id(), base);
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn skip_then_flatten_drops_skipped_layers() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut eval = evaluator(engine.clone(), temp.path());

        let script = r#"
from "debian"
run "one"
skip do
  run "two"
  run "three"
end
run "four"
"#;
        let id = eval.run_script(script).await.outcome.unwrap();
        let layers = engine.inspect_image(&id).await.unwrap().layers;
        // base, one, four
        assert_eq!(layers.len(), 3);
    }

    #[tokio::test]
    async fn scoped_override_restored_after_error() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new().fail_on("boom"));
        let mut eval = evaluator(engine, temp.path());

        let result = eval
            .run_script("from \"debian\"\nwith_user \"nobody\" do\n  inside \"/tmp\" do\n    run \"boom\"\n  end\nend\n")
            .await;
        assert!(result.outcome.is_err());
        let config = eval.interpreter().executor().config();
        assert!(config.user.temporary.is_empty());
        assert!(config.workdir.temporary.is_empty());
    }

    #[tokio::test]
    async fn verbs_need_from() {
        let temp = TempDir::new().unwrap();
        let mut eval = evaluator(Arc::new(MemoryEngine::new()), temp.path());
        let err = eval.run_script("user \"app\"\n").await.outcome.unwrap_err();
        assert!(matches!(err.root(), KilnError::NoImage));
    }

    #[tokio::test]
    async fn omitted_verbs_are_unknown() {
        let temp = TempDir::new().unwrap();
        let globals = Globals {
            omit: vec!["run".to_string()],
            ..Globals::default()
        };
        let mut eval = evaluator_with(Arc::new(MemoryEngine::new()), temp.path(), &globals);
        let err = eval
            .run_script("from \"debian\"\nrun \"make\"\n")
            .await
            .outcome
            .unwrap_err();
        assert!(err.to_string().contains("undefined verb or function"));
    }

    #[tokio::test]
    async fn after_block_runs_last_and_only_in_scripts() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut eval = evaluator(engine.clone(), temp.path());
        eval.run_script("after do\n  tag \"done\"\nend\nfrom \"debian\"\n")
            .await
            .outcome
            .unwrap();
        assert!(engine.lookup("done").await.is_ok());

        let mut repl = evaluator(engine.clone(), temp.path());
        repl.run_code("after do\n  tag \"never\"\nend\nfrom \"debian\"").await;
        assert!(engine.lookup("never").await.is_err());
    }

    #[tokio::test]
    async fn funcs_and_locals() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut eval = evaluator(engine.clone(), temp.path());
        let script = r##"
from "debian"
uid = getuid "nobody"
env APP: var("name"), UID: uid
tag "#{var "name"}:#{uid}"
"##;
        eval.run_script(script).await.outcome.unwrap();
        assert_eq!(eval.interpreter().executor().config().env, ["APP=web", "UID=65534"]);
        assert!(engine.lookup("web:65534").await.is_ok());
    }

    #[tokio::test]
    async fn import_runs_in_same_build() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("base.kiln"), "from \"debian\"\nuser \"nobody\"\n").unwrap();
        let mut eval = evaluator(Arc::new(MemoryEngine::new()), temp.path());
        let id = eval
            .run_script("import \"base.kiln\"\nworkdir \"/srv\"\n")
            .await
            .outcome
            .unwrap();
        assert_eq!(eval.interpreter().image_id(), id);
        assert_eq!(eval.interpreter().executor().config().user.effective(), "nobody");
    }

    #[tokio::test]
    async fn run_code_is_incremental() {
        let temp = TempDir::new().unwrap();
        let mut eval = evaluator(Arc::new(MemoryEngine::new()), temp.path());

        let first = eval.run_code("from \"debian\"").await;
        let base = first.result.outcome.unwrap();
        assert_eq!(first.evaluated, 1);

        let value = eval.run_code("getuid \"root\"").await;
        assert_eq!(value.result.outcome.unwrap(), "0");

        let open = eval.run_code("skip do").await;
        assert!(open.incomplete);

        let failed = eval.run_code("user \"x\"\nworkdir \"rel\"\nuser \"y\"").await;
        assert!(failed.result.outcome.is_err());
        assert_eq!(failed.evaluated, 1);
        assert_ne!(eval.interpreter().image_id(), base);
    }

    #[tokio::test]
    #[serial]
    async fn getenv_reads_host_environment() {
        std::env::set_var("KILN_TEST_GETENV", "from-host");
        let temp = TempDir::new().unwrap();
        let mut eval = evaluator(Arc::new(MemoryEngine::new()), temp.path());
        let result = eval.run_code("getenv \"KILN_TEST_GETENV\"").await;
        std::env::remove_var("KILN_TEST_GETENV");
        assert_eq!(result.result.outcome.unwrap(), "from-host");
    }

    #[tokio::test]
    async fn cancelled_build_stops_at_next_verb() {
        let temp = TempDir::new().unwrap();
        let globals = Globals::default();
        globals.cancel.cancel();
        let engine = Arc::new(MemoryEngine::new());
        let mut eval = evaluator_with(engine.clone(), temp.path(), &globals);
        let err = eval.run_script("from \"debian\"\n").await.outcome.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(engine.pulls(), 0);
    }
}
