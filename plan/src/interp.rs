//! The plan runtime: a tree-walking async interpreter.
//!
//! The program runs as one implicitly-awaited async function. Tool calls
//! suspend; `map` fans out with bounded concurrency; a wall-clock deadline,
//! a global loop-iteration budget, and the session cancellation token bound
//! the execution. Thrown values ride a fiber-local last-error slot so user
//! `throw`/`catch` round-trips values without host boxing. Budget and
//! cancellation faults are not catchable by plan code.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::debug_span;

use crate::ast::CatchClause;
use crate::ast::DeclKind;
use crate::ast::Element;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::FnBody;
use crate::ast::Lit;
use crate::ast::MemberProp;
use crate::ast::ObjectProperty;
use crate::ast::Program;
use crate::ast::PropKey;
use crate::ast::Stmt;
use crate::ast::StmtKind;
use crate::ast::SwitchCase;
use crate::builtins;
use crate::host::ToolHost;
use crate::host::normalize_tool_result;
use crate::parser;
use crate::token::Span;
use crate::transform;
use crate::transform::Analysis;
use crate::validate;
use crate::value::Closure;
use crate::value::Native;
use crate::value::Scope;
use crate::value::Value;

const MAX_CALL_DEPTH: u64 = 512;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Wall-clock deadline for the whole plan.
    pub deadline: Duration,
    /// Total loop-iteration budget across the program.
    pub loop_budget: u64,
    /// Simultaneous in-flight items for `map`.
    pub concurrency: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            loop_budget: 5_000,
            concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Success,
    Error,
}

/// What the caller gets back, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<String>,
}

impl PlanOutcome {
    fn failure(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            status: PlanStatus::Error,
            result: None,
            error: Some(error.into()),
            logs,
        }
    }
}

/// Validate, analyze, and run a plan source against `host`.
pub async fn execute(
    source: &str,
    host: Arc<dyn ToolHost>,
    options: RuntimeOptions,
    cancel: CancellationToken,
) -> PlanOutcome {
    let program = match parser::parse(source) {
        Ok(program) => program,
        Err(error) => {
            return PlanOutcome::failure(format!("Plan parse failed: {error}"), Vec::new());
        }
    };
    let errors = validate::check_program(&program, source);
    if let Some(first) = errors.first() {
        return PlanOutcome::failure(
            format!(
                "Plan validation failed: {} at {}:{}",
                first.message, first.line, first.column
            ),
            Vec::new(),
        );
    }

    let extra: HashSet<String> = host.extra_tool_names().into_iter().collect();
    let analysis = transform::transform(&program, &extra);
    let deadline = options.deadline;
    let interp = Interp {
        host,
        analysis,
        options,
        cancel: cancel.clone(),
        deadline_at: Instant::now() + deadline,
        iterations: AtomicU64::new(0),
        call_depth: AtomicU64::new(0),
        logs: Mutex::new(Vec::new()),
        last_error: Mutex::new(Value::Undefined),
    };

    let run = interp.run(&program);
    let result = tokio::select! {
        result = run => result,
        _ = tokio::time::sleep_until(interp.deadline_at) => {
            Err(format!("Plan deadline exceeded after {}s", deadline.as_secs()))
        }
        _ = cancel.cancelled() => Err("Plan execution cancelled".to_string()),
    };

    let mut logs = interp.take_logs();
    match result {
        Ok(value) => PlanOutcome {
            status: PlanStatus::Success,
            result: Some(value.to_json().unwrap_or(serde_json::Value::Null)),
            error: None,
            logs,
        },
        Err(message) => {
            logs.push(message.clone());
            PlanOutcome::failure(message, logs)
        }
    }
}

/// Non-local control flow during evaluation. `Fault` is uncatchable.
#[derive(Debug)]
enum Flow {
    Return(Value),
    Break,
    Continue,
    Throw(Value),
    Fault(String),
}

type EvalResult = Result<Value, Flow>;
type ExecResult = Result<(), Flow>;

struct Interp {
    host: Arc<dyn ToolHost>,
    analysis: Analysis,
    options: RuntimeOptions,
    cancel: CancellationToken,
    deadline_at: Instant,
    iterations: AtomicU64,
    call_depth: AtomicU64,
    logs: Mutex<Vec<String>>,
    last_error: Mutex<Value>,
}

fn thrown_to_message(value: &Value) -> String {
    value.to_display()
}

fn error_object(message: impl Into<String>) -> Value {
    let mut map = BTreeMap::new();
    map.insert("name".to_string(), Value::str("Error"));
    map.insert("message".to_string(), Value::str(message.into()));
    Value::object(map)
}

impl Interp {
    fn take_logs(&self) -> Vec<String> {
        match self.logs.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        }
    }

    fn push_log(&self, line: String) {
        if let Ok(mut guard) = self.logs.lock() {
            guard.push(line);
        }
    }

    fn set_last_error(&self, value: Value) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = value;
        }
    }

    fn last_error(&self) -> Value {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Value::Undefined,
        }
    }

    fn throw(&self, message: impl Into<String>) -> Flow {
        let value = Value::Str(message.into());
        self.set_last_error(value.clone());
        Flow::Throw(value)
    }

    /// Cancellation and deadline, consulted at every suspension point.
    fn check_suspension(&self) -> Result<(), Flow> {
        if self.cancel.is_cancelled() {
            return Err(Flow::Fault("Plan execution cancelled".to_string()));
        }
        if Instant::now() >= self.deadline_at {
            return Err(Flow::Fault(format!(
                "Plan deadline exceeded after {}s",
                self.options.deadline.as_secs()
            )));
        }
        Ok(())
    }

    /// One backward branch. Every `for`/`while`/`for-of`/`for-in` iteration
    /// lands here, bounded versions and `for (;;)` alike.
    fn tick_loop(&self) -> Result<(), Flow> {
        self.check_suspension()?;
        let count = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.options.loop_budget {
            return Err(Flow::Fault(format!(
                "Loop iteration budget exceeded ({})",
                self.options.loop_budget
            )));
        }
        Ok(())
    }

    fn global_scope(&self) -> Arc<Scope> {
        let scope = Scope::root();
        for name in transform::BUILTIN_ASYNC_NAMES {
            if *name == "map" {
                continue;
            }
            scope.declare(name, Value::Native(Native::Tool(name.to_string())), true);
        }
        for name in self.host.extra_tool_names() {
            scope.declare(&name, Value::Native(Native::Tool(name.clone())), true);
        }
        scope.declare("map", Value::Native(Native::Map), true);
        scope.declare("chunk", Value::Native(Native::Chunk), true);
        scope.declare("range", Value::Native(Native::Range), true);
        scope.declare("flatten", Value::Native(Native::Flatten), true);
        scope.declare("groupBy", Value::Native(Native::GroupBy), true);
        scope.declare("log", Value::Native(Native::Log), true);

        let mut json = BTreeMap::new();
        json.insert("parse".to_string(), Value::Native(Native::JsonParse));
        json.insert("stringify".to_string(), Value::Native(Native::JsonStringify));
        scope.declare("JSON", Value::object(json), true);

        let mut math = BTreeMap::new();
        for name in [
            "floor", "ceil", "round", "trunc", "abs", "sqrt", "sign", "pow", "min", "max",
        ] {
            math.insert(name.to_string(), Value::Native(Native::MathFn(name)));
        }
        math.insert("PI".to_string(), Value::Number(std::f64::consts::PI));
        scope.declare("Math", Value::object(math), true);

        let mut object = BTreeMap::new();
        object.insert("keys".to_string(), Value::Native(Native::ObjectKeys));
        object.insert("values".to_string(), Value::Native(Native::ObjectValues));
        object.insert("entries".to_string(), Value::Native(Native::ObjectEntries));
        scope.declare("Object", Value::object(object), true);

        let mut array = BTreeMap::new();
        array.insert("isArray".to_string(), Value::Native(Native::ArrayIsArray));
        scope.declare("Array", Value::object(array), true);

        scope.declare("String", Value::Native(Native::StringCast), true);
        scope.declare("Number", Value::Native(Native::NumberCast), true);
        scope.declare("Boolean", Value::Native(Native::BooleanCast), true);
        scope.declare("Error", Value::Native(Native::ErrorCtor), true);
        scope.declare("parseInt", Value::Native(Native::ParseInt), true);
        scope.declare("parseFloat", Value::Native(Native::ParseFloat), true);
        scope.declare("isNaN", Value::Native(Native::IsNan), true);
        scope.declare("NaN", Value::Number(f64::NAN), true);
        scope.declare("Infinity", Value::Number(f64::INFINITY), true);
        scope
    }

    fn hoist(&self, body: &[Stmt], scope: &Arc<Scope>) {
        for stmt in body {
            if let StmtKind::FunctionDecl(function) = &stmt.kind {
                if let Some(name) = &function.name {
                    let closure = Value::Function(Arc::new(Closure {
                        function: Arc::clone(function),
                        scope: Arc::clone(scope),
                    }));
                    scope.declare(name, closure, false);
                }
            }
        }
    }

    async fn run(&self, program: &Program) -> Result<Value, String> {
        let scope = self.global_scope();
        self.hoist(&program.body, &scope);
        let mut completion = Value::Undefined;
        for stmt in &program.body {
            let result = match &stmt.kind {
                StmtKind::Expression(expr) => match self.eval(expr, &scope).await {
                    Ok(value) => {
                        completion = value;
                        Ok(())
                    }
                    Err(flow) => Err(flow),
                },
                _ => self.exec_stmt(stmt, &scope).await,
            };
            match result {
                Ok(()) => {}
                Err(Flow::Return(value)) => return Ok(value),
                Err(Flow::Throw(value)) => return Err(thrown_to_message(&value)),
                Err(Flow::Fault(message)) => return Err(message),
                Err(Flow::Break | Flow::Continue) => {
                    return Err("Illegal 'break' or 'continue' at top level".to_string());
                }
            }
        }
        Ok(completion)
    }

    fn exec_stmt<'a>(&'a self, stmt: &'a Stmt, scope: &'a Arc<Scope>) -> BoxFuture<'a, ExecResult> {
        async move {
            match &stmt.kind {
                StmtKind::Expression(expr) => {
                    self.eval(expr, scope).await?;
                    Ok(())
                }
                StmtKind::Block(body) => {
                    let block_scope = Scope::child(scope);
                    self.hoist(body, &block_scope);
                    for s in body {
                        self.exec_stmt(s, &block_scope).await?;
                    }
                    Ok(())
                }
                StmtKind::VarDecl { kind, declarators } => {
                    for declarator in declarators {
                        let value = match &declarator.init {
                            Some(init) => self.eval(init, scope).await?,
                            None => Value::Undefined,
                        };
                        scope.declare(&declarator.name, value, *kind == DeclKind::Const);
                    }
                    Ok(())
                }
                // Bound at block entry by `hoist`.
                StmtKind::FunctionDecl(_) => Ok(()),
                StmtKind::If {
                    test,
                    consequent,
                    alternate,
                } => {
                    if self.eval(test, scope).await?.truthy() {
                        self.exec_stmt(consequent, scope).await
                    } else if let Some(alternate) = alternate {
                        self.exec_stmt(alternate, scope).await
                    } else {
                        Ok(())
                    }
                }
                StmtKind::Switch {
                    discriminant,
                    cases,
                } => self.exec_switch(discriminant, cases, scope).await,
                StmtKind::While { test, body } => {
                    loop {
                        self.tick_loop()?;
                        if !self.eval(test, scope).await?.truthy() {
                            break;
                        }
                        match self.exec_stmt(body, scope).await {
                            Ok(()) | Err(Flow::Continue) => {}
                            Err(Flow::Break) => break,
                            Err(other) => return Err(other),
                        }
                    }
                    Ok(())
                }
                StmtKind::For {
                    init,
                    test,
                    update,
                    body,
                } => {
                    let loop_scope = Scope::child(scope);
                    if let Some(init) = init {
                        self.exec_stmt(init, &loop_scope).await?;
                    }
                    loop {
                        self.tick_loop()?;
                        if let Some(test) = test {
                            if !self.eval(test, &loop_scope).await?.truthy() {
                                break;
                            }
                        }
                        match self.exec_stmt(body, &loop_scope).await {
                            Ok(()) | Err(Flow::Continue) => {}
                            Err(Flow::Break) => break,
                            Err(other) => return Err(other),
                        }
                        if let Some(update) = update {
                            self.eval(update, &loop_scope).await?;
                        }
                    }
                    Ok(())
                }
                StmtKind::ForOf {
                    decl,
                    binding,
                    iterable,
                    body,
                    ..
                } => {
                    let iterable = self.eval(iterable, scope).await?;
                    let items: Vec<Value> = match &iterable {
                        Value::Array(items) => match items.lock() {
                            Ok(guard) => guard.clone(),
                            Err(_) => Vec::new(),
                        },
                        Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
                        other => {
                            return Err(self.throw(format!("{} is not iterable", other.type_of())));
                        }
                    };
                    self.iterate(items, *decl, binding, body, scope).await
                }
                StmtKind::ForIn {
                    decl,
                    binding,
                    object,
                    body,
                    ..
                } => {
                    let object = self.eval(object, scope).await?;
                    let keys: Vec<Value> = match &object {
                        Value::Object(map) => match map.lock() {
                            Ok(guard) => guard.keys().cloned().map(Value::Str).collect(),
                            Err(_) => Vec::new(),
                        },
                        Value::Array(items) => {
                            let len = items.lock().map(|g| g.len()).unwrap_or(0);
                            (0..len).map(|i| Value::str(i.to_string())).collect()
                        }
                        _ => Vec::new(),
                    };
                    self.iterate(keys, *decl, binding, body, scope).await
                }
                StmtKind::Try {
                    block,
                    handler,
                    finalizer,
                } => self.exec_try(block, handler.as_ref(), finalizer.as_deref(), scope).await,
                StmtKind::Throw(expr) => {
                    let value = self.eval(expr, scope).await?;
                    self.set_last_error(value.clone());
                    Err(Flow::Throw(value))
                }
                StmtKind::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, scope).await?,
                        None => Value::Undefined,
                    };
                    Err(Flow::Return(value))
                }
                StmtKind::Break => Err(Flow::Break),
                StmtKind::Continue => Err(Flow::Continue),
                StmtKind::Empty => Ok(()),
                StmtKind::Unsupported { kind } => Err(Flow::Fault(format!(
                    "Unsupported syntax reached the runtime: {kind}"
                ))),
            }
        }
        .boxed()
    }

    async fn iterate(
        &self,
        items: Vec<Value>,
        decl: Option<DeclKind>,
        binding: &str,
        body: &Stmt,
        scope: &Arc<Scope>,
    ) -> ExecResult {
        for item in items {
            self.tick_loop()?;
            let iter_scope = Scope::child(scope);
            match decl {
                Some(kind) => iter_scope.declare(binding, item, kind == DeclKind::Const),
                None => {
                    scope
                        .assign(binding, item)
                        .map_err(|message| self.throw(message))?;
                }
            }
            match self.exec_stmt(body, &iter_scope).await {
                Ok(()) | Err(Flow::Continue) => {}
                Err(Flow::Break) => break,
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    async fn exec_switch(
        &self,
        discriminant: &Expr,
        cases: &[SwitchCase],
        scope: &Arc<Scope>,
    ) -> ExecResult {
        let value = self.eval(discriminant, scope).await?;
        let mut start = None;
        for (i, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                let test_value = self.eval(test, scope).await?;
                if value.strict_eq(&test_value) {
                    start = Some(i);
                    break;
                }
            }
        }
        let start = start.or_else(|| cases.iter().position(|c| c.test.is_none()));
        let Some(start) = start else {
            return Ok(());
        };
        let switch_scope = Scope::child(scope);
        'cases: for case in &cases[start..] {
            for s in &case.body {
                match self.exec_stmt(s, &switch_scope).await {
                    Ok(()) => {}
                    Err(Flow::Break) => break 'cases,
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(())
    }

    async fn exec_try(
        &self,
        block: &[Stmt],
        handler: Option<&CatchClause>,
        finalizer: Option<&[Stmt]>,
        scope: &Arc<Scope>,
    ) -> ExecResult {
        let try_scope = Scope::child(scope);
        self.hoist(block, &try_scope);
        let mut outcome: ExecResult = Ok(());
        for s in block {
            if let Err(flow) = self.exec_stmt(s, &try_scope).await {
                outcome = Err(flow);
                break;
            }
        }

        if let (Err(Flow::Throw(_)), Some(handler)) = (&outcome, handler) {
            let catch_scope = Scope::child(scope);
            if let Some(param) = &handler.param {
                // The catch binding reads from the last-error slot, so the
                // thrown value arrives exactly as the user threw it.
                catch_scope.declare(param, self.last_error(), false);
            }
            self.hoist(&handler.body, &catch_scope);
            outcome = Ok(());
            for s in &handler.body {
                if let Err(flow) = self.exec_stmt(s, &catch_scope).await {
                    outcome = Err(flow);
                    break;
                }
            }
        }

        if let Some(finalizer) = finalizer {
            let finally_scope = Scope::child(scope);
            for s in finalizer {
                // A flow out of `finally` supersedes the try/catch outcome.
                self.exec_stmt(s, &finally_scope).await?;
            }
        }
        outcome
    }

    fn eval<'a>(&'a self, expr: &'a Expr, scope: &'a Arc<Scope>) -> BoxFuture<'a, EvalResult> {
        async move {
            match &expr.kind {
                ExprKind::Identifier(name) => scope
                    .get(name)
                    .ok_or_else(|| self.throw(format!("'{name}' is not defined"))),
                ExprKind::Literal(lit) => Ok(match lit {
                    Lit::Number(n) => Value::Number(*n),
                    Lit::Str(s) => Value::Str(s.clone()),
                    Lit::Bool(b) => Value::Bool(*b),
                    Lit::Null => Value::Null,
                    Lit::Undefined => Value::Undefined,
                }),
                ExprKind::Template { quasis, exprs } => {
                    let mut out = String::new();
                    for (i, quasi) in quasis.iter().enumerate() {
                        out.push_str(quasi);
                        if let Some(e) = exprs.get(i) {
                            out.push_str(&self.eval(e, scope).await?.to_display());
                        }
                    }
                    Ok(Value::Str(out))
                }
                ExprKind::TaggedTemplate { tag, quasis, exprs } => {
                    let tag_value = self.eval(tag, scope).await?;
                    let mut args =
                        vec![Value::array(quasis.iter().map(Value::str).collect())];
                    for e in exprs {
                        args.push(self.eval(e, scope).await?);
                    }
                    self.call_value(tag_value, args, expr.span).await
                }
                ExprKind::Array(elements) => {
                    Ok(Value::array(self.eval_elements(elements, scope).await?))
                }
                ExprKind::Object(properties) => {
                    let mut map = BTreeMap::new();
                    for property in properties {
                        match property {
                            ObjectProperty::Property { key, value, .. } => {
                                let key = match key {
                                    PropKey::Ident(name) | PropKey::Str(name) => name.clone(),
                                    PropKey::Number(n) => crate::value::format_number(*n),
                                    PropKey::Computed(key_expr) => {
                                        self.eval(key_expr, scope).await?.to_display()
                                    }
                                };
                                let value = self.eval(value, scope).await?;
                                map.insert(key, value);
                            }
                            ObjectProperty::Spread { argument, .. } => {
                                let value = self.eval(argument, scope).await?;
                                match &value {
                                    Value::Object(source) => {
                                        let entries = match source.lock() {
                                            Ok(guard) => guard.clone(),
                                            Err(_) => BTreeMap::new(),
                                        };
                                        map.extend(entries);
                                    }
                                    Value::Null | Value::Undefined => {}
                                    other => {
                                        return Err(self.throw(format!(
                                            "Cannot spread {} into an object",
                                            other.type_of()
                                        )));
                                    }
                                }
                            }
                        }
                    }
                    Ok(Value::object(map))
                }
                ExprKind::Function(function) => Ok(Value::Function(Arc::new(Closure {
                    function: Arc::clone(function),
                    scope: Arc::clone(scope),
                }))),
                ExprKind::Call {
                    callee,
                    args,
                    optional,
                } => self.eval_call(expr, callee, args, *optional, scope).await,
                ExprKind::New { callee, args } => {
                    let callee_value = self.eval(callee, scope).await?;
                    let args = self.eval_elements(args, scope).await?;
                    match callee_value {
                        Value::Native(Native::ErrorCtor) => Ok(error_object(
                            args.first().map(Value::to_display).unwrap_or_default(),
                        )),
                        Value::Function(_) => {
                            let result =
                                self.call_value(callee_value, args, expr.span).await?;
                            Ok(match result {
                                Value::Object(_) | Value::Array(_) => result,
                                _ => Value::object(BTreeMap::new()),
                            })
                        }
                        other => {
                            Err(self.throw(format!("{} is not a constructor", other.to_display())))
                        }
                    }
                }
                ExprKind::Member {
                    object,
                    property,
                    optional,
                } => {
                    let receiver = self.eval(object, scope).await?;
                    if *optional && matches!(receiver, Value::Null | Value::Undefined) {
                        return Ok(Value::Undefined);
                    }
                    let key = match property {
                        MemberProp::Ident(name) => Value::Str(name.clone()),
                        MemberProp::Computed(key) => self.eval(key, scope).await?,
                    };
                    self.property_of(&receiver, &key, expr.span)
                }
                ExprKind::Conditional {
                    test,
                    consequent,
                    alternate,
                } => {
                    if self.eval(test, scope).await?.truthy() {
                        self.eval(consequent, scope).await
                    } else {
                        self.eval(alternate, scope).await
                    }
                }
                ExprKind::Assignment { op, target, value } => {
                    self.eval_assignment(op, target, value, scope).await
                }
                ExprKind::Update { op, prefix, target } => {
                    let current = self.read_target(target, scope).await?.to_number();
                    let next = if *op == "++" { current + 1.0 } else { current - 1.0 };
                    self.assign_target(target, Value::Number(next), scope).await?;
                    Ok(Value::Number(if *prefix { next } else { current }))
                }
                ExprKind::Binary { op, left, right } => {
                    let left = self.eval(left, scope).await?;
                    let right = self.eval(right, scope).await?;
                    self.apply_binary(op, &left, &right)
                }
                ExprKind::Logical { op, left, right } => {
                    let left_value = self.eval(left, scope).await?;
                    match *op {
                        "&&" => {
                            if left_value.truthy() {
                                self.eval(right, scope).await
                            } else {
                                Ok(left_value)
                            }
                        }
                        "||" => {
                            if left_value.truthy() {
                                Ok(left_value)
                            } else {
                                self.eval(right, scope).await
                            }
                        }
                        "??" => {
                            if matches!(left_value, Value::Null | Value::Undefined) {
                                self.eval(right, scope).await
                            } else {
                                Ok(left_value)
                            }
                        }
                        other => Err(Flow::Fault(format!("Unknown logical operator {other}"))),
                    }
                }
                ExprKind::Unary { op, operand } => self.eval_unary(op, operand, scope).await,
                ExprKind::Sequence(exprs) => {
                    let mut last = Value::Undefined;
                    for e in exprs {
                        last = self.eval(e, scope).await?;
                    }
                    Ok(last)
                }
                ExprKind::Unsupported { kind } => Err(Flow::Fault(format!(
                    "Unsupported syntax reached the runtime: {kind}"
                ))),
            }
        }
        .boxed()
    }

    async fn eval_elements(
        &self,
        elements: &[Element],
        scope: &Arc<Scope>,
    ) -> Result<Vec<Value>, Flow> {
        let mut out = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                Element::Item(expr) => out.push(self.eval(expr, scope).await?),
                Element::Spread { argument, .. } => {
                    let value = self.eval(argument, scope).await?;
                    match &value {
                        Value::Array(items) => {
                            let items = match items.lock() {
                                Ok(guard) => guard.clone(),
                                Err(_) => Vec::new(),
                            };
                            out.extend(items);
                        }
                        Value::Str(s) => {
                            out.extend(s.chars().map(|c| Value::str(c.to_string())));
                        }
                        other => {
                            return Err(
                                self.throw(format!("{} is not spreadable", other.type_of()))
                            );
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn eval_unary(
        &self,
        op: &'static str,
        operand: &Expr,
        scope: &Arc<Scope>,
    ) -> EvalResult {
        match op {
            "typeof" => {
                // `typeof missing` answers "undefined" instead of throwing.
                if let ExprKind::Identifier(name) = &operand.kind {
                    match scope.get(name) {
                        Some(value) => return Ok(Value::str(value.type_of())),
                        None => return Ok(Value::str("undefined")),
                    }
                }
                let value = self.eval(operand, scope).await?;
                Ok(Value::str(value.type_of()))
            }
            "delete" => {
                if let ExprKind::Member {
                    object, property, ..
                } = &operand.kind
                {
                    let receiver = self.eval(object, scope).await?;
                    let key = match property {
                        MemberProp::Ident(name) => name.clone(),
                        MemberProp::Computed(key) => self.eval(key, scope).await?.to_display(),
                    };
                    if let Value::Object(map) = &receiver {
                        if let Ok(mut guard) = map.lock() {
                            guard.remove(&key);
                        }
                    }
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(true))
            }
            "void" => {
                self.eval(operand, scope).await?;
                Ok(Value::Undefined)
            }
            "!" => {
                let value = self.eval(operand, scope).await?;
                Ok(Value::Bool(!value.truthy()))
            }
            "-" => {
                let value = self.eval(operand, scope).await?;
                Ok(Value::Number(-value.to_number()))
            }
            "+" => {
                let value = self.eval(operand, scope).await?;
                Ok(Value::Number(value.to_number()))
            }
            "~" => {
                let value = self.eval(operand, scope).await?;
                Ok(Value::Number(!(to_i32(value.to_number())) as f64))
            }
            other => Err(Flow::Fault(format!("Unknown unary operator {other}"))),
        }
    }

    async fn eval_assignment(
        &self,
        op: &'static str,
        target: &Expr,
        value: &Expr,
        scope: &Arc<Scope>,
    ) -> EvalResult {
        match op {
            "=" => {
                let new = self.eval(value, scope).await?;
                self.assign_target(target, new.clone(), scope).await?;
                Ok(new)
            }
            "&&=" | "||=" | "??=" => {
                let current = self.read_target(target, scope).await?;
                let should_assign = match op {
                    "&&=" => current.truthy(),
                    "||=" => !current.truthy(),
                    _ => matches!(current, Value::Null | Value::Undefined),
                };
                if !should_assign {
                    return Ok(current);
                }
                let new = self.eval(value, scope).await?;
                self.assign_target(target, new.clone(), scope).await?;
                Ok(new)
            }
            _ => {
                let current = self.read_target(target, scope).await?;
                let rhs = self.eval(value, scope).await?;
                let base = op.trim_end_matches('=');
                let new = self.apply_binary(base, &current, &rhs)?;
                self.assign_target(target, new.clone(), scope).await?;
                Ok(new)
            }
        }
    }

    async fn read_target(&self, target: &Expr, scope: &Arc<Scope>) -> EvalResult {
        match &target.kind {
            ExprKind::Identifier(name) => scope
                .get(name)
                .ok_or_else(|| self.throw(format!("'{name}' is not defined"))),
            ExprKind::Member {
                object, property, ..
            } => {
                let receiver = self.eval(object, scope).await?;
                let key = match property {
                    MemberProp::Ident(name) => Value::Str(name.clone()),
                    MemberProp::Computed(key) => self.eval(key, scope).await?,
                };
                self.property_of(&receiver, &key, target.span)
            }
            _ => Err(self.throw("Invalid assignment target")),
        }
    }

    async fn assign_target(
        &self,
        target: &Expr,
        value: Value,
        scope: &Arc<Scope>,
    ) -> Result<(), Flow> {
        match &target.kind {
            ExprKind::Identifier(name) => scope
                .assign(name, value)
                .map_err(|message| self.throw(message)),
            ExprKind::Member {
                object, property, ..
            } => {
                let receiver = self.eval(object, scope).await?;
                let key = match property {
                    MemberProp::Ident(name) => Value::Str(name.clone()),
                    MemberProp::Computed(key) => self.eval(key, scope).await?,
                };
                self.set_property(&receiver, &key, value)
            }
            _ => Err(self.throw("Invalid assignment target")),
        }
    }

    fn property_of(&self, receiver: &Value, key: &Value, _span: Span) -> EvalResult {
        let key_text = key.to_display();
        match receiver {
            Value::Null | Value::Undefined => Err(self.throw(format!(
                "Cannot read properties of {} (reading '{key_text}')",
                receiver.to_display()
            ))),
            Value::Array(items) => {
                if key_text == "length" {
                    let len = items.lock().map(|g| g.len()).unwrap_or(0);
                    return Ok(Value::Number(len as f64));
                }
                if let Ok(index) = key_text.parse::<usize>() {
                    let item = items
                        .lock()
                        .ok()
                        .and_then(|g| g.get(index).cloned())
                        .unwrap_or(Value::Undefined);
                    return Ok(item);
                }
                Ok(Value::Undefined)
            }
            Value::Str(s) => {
                if key_text == "length" {
                    return Ok(Value::Number(s.chars().count() as f64));
                }
                if let Ok(index) = key_text.parse::<usize>() {
                    return Ok(s
                        .chars()
                        .nth(index)
                        .map(|c| Value::str(c.to_string()))
                        .unwrap_or(Value::Undefined));
                }
                Ok(Value::Undefined)
            }
            Value::Object(map) => Ok(map
                .lock()
                .ok()
                .and_then(|g| g.get(&key_text).cloned())
                .unwrap_or(Value::Undefined)),
            _ => Ok(Value::Undefined),
        }
    }

    fn set_property(&self, receiver: &Value, key: &Value, value: Value) -> Result<(), Flow> {
        let key_text = key.to_display();
        match receiver {
            Value::Object(map) => {
                if let Ok(mut guard) = map.lock() {
                    guard.insert(key_text, value);
                }
                Ok(())
            }
            Value::Array(items) => {
                if let Ok(mut guard) = items.lock() {
                    if key_text == "length" {
                        let new_len = value.to_number().max(0.0) as usize;
                        guard.resize(new_len, Value::Undefined);
                        return Ok(());
                    }
                    if let Ok(index) = key_text.parse::<usize>() {
                        if index >= guard.len() {
                            guard.resize(index + 1, Value::Undefined);
                        }
                        guard[index] = value;
                        return Ok(());
                    }
                }
                Ok(())
            }
            other => Err(self.throw(format!("Cannot set property on {}", other.type_of()))),
        }
    }

    fn apply_binary(&self, op: &str, left: &Value, right: &Value) -> EvalResult {
        let value = match op {
            "+" => match (left, right) {
                (Value::Str(_), _) | (_, Value::Str(_)) => {
                    Value::Str(format!("{}{}", left.to_display(), right.to_display()))
                }
                _ => Value::Number(left.to_number() + right.to_number()),
            },
            "-" => Value::Number(left.to_number() - right.to_number()),
            "*" => Value::Number(left.to_number() * right.to_number()),
            "/" => Value::Number(left.to_number() / right.to_number()),
            "%" => Value::Number(left.to_number() % right.to_number()),
            "**" => Value::Number(left.to_number().powf(right.to_number())),
            "==" | "===" => Value::Bool(left.strict_eq(right)),
            "!=" | "!==" => Value::Bool(!left.strict_eq(right)),
            "<" | ">" | "<=" | ">=" => {
                let ordering = match (left, right) {
                    (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                    _ => left.to_number().partial_cmp(&right.to_number()),
                };
                let result = match (op, ordering) {
                    (_, None) => false,
                    ("<", Some(o)) => o.is_lt(),
                    (">", Some(o)) => o.is_gt(),
                    ("<=", Some(o)) => o.is_le(),
                    (_, Some(o)) => o.is_ge(),
                };
                Value::Bool(result)
            }
            "&" => Value::Number((to_i32(left.to_number()) & to_i32(right.to_number())) as f64),
            "|" => Value::Number((to_i32(left.to_number()) | to_i32(right.to_number())) as f64),
            "^" => Value::Number((to_i32(left.to_number()) ^ to_i32(right.to_number())) as f64),
            "<<" => Value::Number(
                (to_i32(left.to_number()) << (to_i32(right.to_number()) & 31)) as f64,
            ),
            ">>" => Value::Number(
                (to_i32(left.to_number()) >> (to_i32(right.to_number()) & 31)) as f64,
            ),
            ">>>" => Value::Number(
                ((to_i32(left.to_number()) as u32) >> (to_i32(right.to_number()) & 31)) as f64,
            ),
            "in" => match right {
                Value::Object(map) => Value::Bool(
                    map.lock()
                        .map(|g| g.contains_key(&left.to_display()))
                        .unwrap_or(false),
                ),
                Value::Array(items) => {
                    let len = items.lock().map(|g| g.len()).unwrap_or(0);
                    let index = left.to_number();
                    Value::Bool(index >= 0.0 && (index as usize) < len)
                }
                other => {
                    return Err(
                        self.throw(format!("Cannot use 'in' on {}", other.type_of()))
                    );
                }
            },
            "instanceof" => {
                // Only `x instanceof Error` is meaningful here.
                let is_error = matches!(right, Value::Native(Native::ErrorCtor))
                    && matches!(left, Value::Object(map) if map
                        .lock()
                        .map(|g| g.contains_key("message") && g.contains_key("name"))
                        .unwrap_or(false));
                Value::Bool(is_error)
            }
            other => return Err(Flow::Fault(format!("Unknown binary operator {other}"))),
        };
        Ok(value)
    }

    async fn eval_call(
        &self,
        call: &Expr,
        callee: &Expr,
        args: &[Element],
        optional: bool,
        scope: &Arc<Scope>,
    ) -> EvalResult {
        if self.analysis.is_await_call(call.id) {
            self.check_suspension()?;
        }
        if let ExprKind::Member {
            object,
            property,
            optional: member_optional,
        } = &callee.kind
        {
            let receiver = self.eval(object, scope).await?;
            if (*member_optional || optional)
                && matches!(receiver, Value::Null | Value::Undefined)
            {
                return Ok(Value::Undefined);
            }
            let name = match property {
                MemberProp::Ident(name) => name.clone(),
                MemberProp::Computed(key) => self.eval(key, scope).await?.to_display(),
            };
            let arg_values = self.eval_elements(args, scope).await?;
            return self.call_method(receiver, &name, arg_values, call.span).await;
        }

        let callee_value = self.eval(callee, scope).await?;
        if optional && matches!(callee_value, Value::Null | Value::Undefined) {
            return Ok(Value::Undefined);
        }
        let arg_values = self.eval_elements(args, scope).await?;
        self.call_value(callee_value, arg_values, call.span).await
    }

    fn call_method<'a>(
        &'a self,
        receiver: Value,
        name: &'a str,
        args: Vec<Value>,
        span: Span,
    ) -> BoxFuture<'a, EvalResult> {
        async move {
            match &receiver {
                Value::Object(map) => {
                    let member = map.lock().ok().and_then(|g| g.get(name).cloned());
                    match member {
                        Some(f @ (Value::Function(_) | Value::Native(_))) => {
                            self.call_value(f, args, span).await
                        }
                        Some(other) => Err(self.throw(format!(
                            "'{name}' is not a function (it is {})",
                            other.type_of()
                        ))),
                        None if name == "hasOwnProperty" => {
                            let key = args.first().map(Value::to_display).unwrap_or_default();
                            Ok(Value::Bool(
                                map.lock().map(|g| g.contains_key(&key)).unwrap_or(false),
                            ))
                        }
                        None => Err(self.throw(format!("Object has no method '{name}'"))),
                    }
                }
                Value::Array(_) => self.array_method(&receiver, name, args, span).await,
                Value::Str(s) => builtins::string_method(s, name, &args)
                    .map_err(|message| self.throw(message)),
                Value::Number(n) => builtins::number_method(*n, name, &args)
                    .map_err(|message| self.throw(message)),
                Value::Function(_) | Value::Native(_) if name == "call" => {
                    // f.call(null, …args) — thisless, so just drop the receiver.
                    let mut args = args;
                    if !args.is_empty() {
                        args.remove(0);
                    }
                    self.call_value(receiver.clone(), args, span).await
                }
                other => Err(self.throw(format!(
                    "{} has no method '{name}'",
                    other.type_of()
                ))),
            }
        }
        .boxed()
    }

    async fn array_method(
        &self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        span: Span,
    ) -> EvalResult {
        let Value::Array(items_ref) = receiver else {
            return Err(self.throw("not an array"));
        };
        let snapshot: Vec<Value> = match items_ref.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        };
        let len = snapshot.len();
        let arg0 = args.first().cloned().unwrap_or(Value::Undefined);

        match name {
            "push" => {
                if let Ok(mut guard) = items_ref.lock() {
                    guard.extend(args);
                    return Ok(Value::Number(guard.len() as f64));
                }
                Ok(Value::Number(len as f64))
            }
            "pop" => Ok(items_ref
                .lock()
                .ok()
                .and_then(|mut g| g.pop())
                .unwrap_or(Value::Undefined)),
            "shift" => {
                if let Ok(mut guard) = items_ref.lock() {
                    if guard.is_empty() {
                        return Ok(Value::Undefined);
                    }
                    return Ok(guard.remove(0));
                }
                Ok(Value::Undefined)
            }
            "unshift" => {
                if let Ok(mut guard) = items_ref.lock() {
                    for (i, arg) in args.into_iter().enumerate() {
                        guard.insert(i, arg);
                    }
                    return Ok(Value::Number(guard.len() as f64));
                }
                Ok(Value::Number(len as f64))
            }
            "slice" => {
                let start = index_for(&args, 0, len, 0);
                let end = index_for(&args, 1, len, len);
                Ok(Value::array(
                    snapshot[start.min(len)..end.max(start).min(len)].to_vec(),
                ))
            }
            "join" => {
                let sep = match args.first() {
                    Some(Value::Str(s)) => s.clone(),
                    Some(Value::Undefined) | None => ",".to_string(),
                    Some(other) => other.to_display(),
                };
                Ok(Value::str(
                    snapshot
                        .iter()
                        .map(|v| match v {
                            Value::Null | Value::Undefined => String::new(),
                            other => other.to_display(),
                        })
                        .collect::<Vec<_>>()
                        .join(&sep),
                ))
            }
            "includes" => Ok(Value::Bool(snapshot.iter().any(|v| v.strict_eq(&arg0)))),
            "indexOf" => Ok(Value::Number(
                snapshot
                    .iter()
                    .position(|v| v.strict_eq(&arg0))
                    .map(|i| i as f64)
                    .unwrap_or(-1.0),
            )),
            "concat" => {
                let mut out = snapshot;
                for arg in args {
                    match arg {
                        Value::Array(more) => {
                            if let Ok(guard) = more.lock() {
                                out.extend(guard.clone());
                            }
                        }
                        other => out.push(other),
                    }
                }
                Ok(Value::array(out))
            }
            "reverse" => {
                if let Ok(mut guard) = items_ref.lock() {
                    guard.reverse();
                }
                Ok(receiver.clone())
            }
            "flat" => {
                let depth = match args.first() {
                    Some(Value::Number(n)) => *n as usize,
                    _ => 1,
                };
                Ok(Value::array(builtins::flatten_depth(receiver, depth)))
            }
            "sort" => {
                let mut sorted = snapshot;
                match args.first() {
                    Some(f @ (Value::Function(_) | Value::Native(_))) => {
                        // Insertion sort so the async comparator can be awaited.
                        for i in 1..sorted.len() {
                            let mut j = i;
                            while j > 0 {
                                let ordering = self
                                    .call_value(
                                        f.clone(),
                                        vec![sorted[j - 1].clone(), sorted[j].clone()],
                                        span,
                                    )
                                    .await?
                                    .to_number();
                                if ordering > 0.0 {
                                    sorted.swap(j - 1, j);
                                    j -= 1;
                                } else {
                                    break;
                                }
                            }
                        }
                    }
                    _ => {
                        sorted.sort_by(|a, b| a.to_display().cmp(&b.to_display()));
                    }
                }
                if let Ok(mut guard) = items_ref.lock() {
                    *guard = sorted;
                }
                Ok(receiver.clone())
            }
            "map" => {
                let f = self.callable_arg(&args, 0, "map")?;
                let mut out = Vec::with_capacity(len);
                for (i, item) in snapshot.into_iter().enumerate() {
                    out.push(
                        self.call_value(f.clone(), vec![item, Value::Number(i as f64)], span)
                            .await?,
                    );
                }
                Ok(Value::array(out))
            }
            "filter" => {
                let f = self.callable_arg(&args, 0, "filter")?;
                let mut out = Vec::new();
                for (i, item) in snapshot.into_iter().enumerate() {
                    if self
                        .call_value(f.clone(), vec![item.clone(), Value::Number(i as f64)], span)
                        .await?
                        .truthy()
                    {
                        out.push(item);
                    }
                }
                Ok(Value::array(out))
            }
            "forEach" => {
                let f = self.callable_arg(&args, 0, "forEach")?;
                for (i, item) in snapshot.into_iter().enumerate() {
                    self.call_value(f.clone(), vec![item, Value::Number(i as f64)], span)
                        .await?;
                }
                Ok(Value::Undefined)
            }
            "find" | "findIndex" => {
                let f = self.callable_arg(&args, 0, name)?;
                for (i, item) in snapshot.into_iter().enumerate() {
                    if self
                        .call_value(f.clone(), vec![item.clone(), Value::Number(i as f64)], span)
                        .await?
                        .truthy()
                    {
                        return Ok(if name == "find" {
                            item
                        } else {
                            Value::Number(i as f64)
                        });
                    }
                }
                Ok(if name == "find" {
                    Value::Undefined
                } else {
                    Value::Number(-1.0)
                })
            }
            "some" | "every" => {
                let f = self.callable_arg(&args, 0, name)?;
                for (i, item) in snapshot.into_iter().enumerate() {
                    let hit = self
                        .call_value(f.clone(), vec![item, Value::Number(i as f64)], span)
                        .await?
                        .truthy();
                    if name == "some" && hit {
                        return Ok(Value::Bool(true));
                    }
                    if name == "every" && !hit {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(name == "every"))
            }
            "reduce" => {
                let f = self.callable_arg(&args, 0, "reduce")?;
                let mut iter = snapshot.into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(init) => init.clone(),
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(self.throw("Reduce of empty array with no initial value"));
                        }
                    },
                };
                for (i, item) in iter {
                    acc = self
                        .call_value(
                            f.clone(),
                            vec![acc, item, Value::Number(i as f64)],
                            span,
                        )
                        .await?;
                }
                Ok(acc)
            }
            "toString" => Ok(Value::str(receiver.to_display())),
            _ => Err(self.throw(format!("Array has no method '{name}'"))),
        }
    }

    fn callable_arg(&self, args: &[Value], index: usize, method: &str) -> Result<Value, Flow> {
        match args.get(index) {
            Some(f @ (Value::Function(_) | Value::Native(_))) => Ok(f.clone()),
            _ => Err(self.throw(format!("{method} expects a function argument"))),
        }
    }

    fn call_value<'a>(
        &'a self,
        callee: Value,
        args: Vec<Value>,
        span: Span,
    ) -> BoxFuture<'a, EvalResult> {
        async move {
            match callee {
                Value::Native(native) => self.call_native(native, args, span).await,
                Value::Function(closure) => {
                    let depth = self.call_depth.fetch_add(1, Ordering::Relaxed) + 1;
                    if depth > MAX_CALL_DEPTH {
                        self.call_depth.fetch_sub(1, Ordering::Relaxed);
                        return Err(Flow::Fault(format!(
                            "Maximum call depth exceeded ({MAX_CALL_DEPTH})"
                        )));
                    }
                    let result = self.call_closure(&closure, args).await;
                    self.call_depth.fetch_sub(1, Ordering::Relaxed);
                    result
                }
                other => Err(self.throw(format!("{} is not a function", other.to_display()))),
            }
        }
        .boxed()
    }

    async fn call_closure(&self, closure: &Closure, args: Vec<Value>) -> EvalResult {
        let function = &closure.function;
        let fn_scope = Scope::child(&closure.scope);
        for (i, param) in function.params.iter().enumerate() {
            fn_scope.declare(
                &param.name,
                args.get(i).cloned().unwrap_or(Value::Undefined),
                false,
            );
        }
        match &function.body {
            FnBody::Expr(expr) => self.eval(expr, &fn_scope).await,
            FnBody::Block(body) => {
                self.hoist(body, &fn_scope);
                for stmt in body {
                    match self.exec_stmt(stmt, &fn_scope).await {
                        Ok(()) => {}
                        Err(Flow::Return(value)) => return Ok(value),
                        Err(Flow::Break | Flow::Continue) => {
                            return Err(Flow::Fault(
                                "'break' or 'continue' outside of a loop".to_string(),
                            ));
                        }
                        Err(other) => return Err(other),
                    }
                }
                Ok(Value::Undefined)
            }
        }
    }

    async fn call_native(&self, native: Native, args: Vec<Value>, span: Span) -> EvalResult {
        match native {
            Native::Tool(name) => self.call_tool(&name, args).await,
            Native::Map => self.builtin_map(args, span).await,
            Native::GroupBy => self.builtin_group_by(args, span).await,
            Native::Log => {
                let line = args
                    .iter()
                    .map(Value::to_display)
                    .collect::<Vec<_>>()
                    .join(" ");
                debug!(target: "plan", "log: {line}");
                self.push_log(line);
                Ok(Value::Undefined)
            }
            Native::Chunk => {
                let text = args.first().map(Value::to_display).unwrap_or_default();
                let size = match args.get(1) {
                    Some(Value::Number(n)) if *n >= 1.0 => *n as usize,
                    _ => builtins::DEFAULT_CHUNK_SIZE,
                };
                Ok(Value::array(
                    builtins::chunk(&text, size).into_iter().map(Value::Str).collect(),
                ))
            }
            Native::Range => {
                let start = args.first().map(Value::to_number).unwrap_or(0.0);
                let end = args.get(1).map(Value::to_number);
                Ok(Value::array(builtins::range(start, end)))
            }
            Native::Flatten => Ok(Value::array(builtins::flatten(
                args.first().unwrap_or(&Value::Undefined),
            ))),
            Native::JsonParse => {
                let text = args.first().map(Value::to_display).unwrap_or_default();
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(json) => Ok(Value::from_json(&json)),
                    Err(error) => Err(self.throw(format!("JSON.parse: {error}"))),
                }
            }
            Native::JsonStringify => {
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                if matches!(value, Value::Undefined | Value::Function(_) | Value::Native(_)) {
                    return Ok(Value::Undefined);
                }
                let json = value.to_json().map_err(|message| self.throw(message))?;
                let indent = args.get(2).map(Value::to_number).unwrap_or(0.0);
                let text = if indent >= 1.0 {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                };
                text.map(Value::Str)
                    .map_err(|error| self.throw(format!("JSON.stringify: {error}")))
            }
            Native::MathFn(name) => {
                builtins::math_fn(name, &args).map_err(|message| self.throw(message))
            }
            Native::ObjectKeys | Native::ObjectValues | Native::ObjectEntries => {
                let entries: Vec<(String, Value)> = match args.first() {
                    Some(Value::Object(map)) => map
                        .lock()
                        .map(|g| g.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default(),
                    _ => Vec::new(),
                };
                let out = match native {
                    Native::ObjectKeys => {
                        entries.into_iter().map(|(k, _)| Value::Str(k)).collect()
                    }
                    Native::ObjectValues => entries.into_iter().map(|(_, v)| v).collect(),
                    _ => entries
                        .into_iter()
                        .map(|(k, v)| Value::array(vec![Value::Str(k), v]))
                        .collect(),
                };
                Ok(Value::array(out))
            }
            Native::ArrayIsArray => Ok(Value::Bool(matches!(
                args.first(),
                Some(Value::Array(_))
            ))),
            Native::StringCast => Ok(Value::str(
                args.first().map(Value::to_display).unwrap_or_default(),
            )),
            Native::NumberCast => Ok(Value::Number(
                args.first().map(Value::to_number).unwrap_or(0.0),
            )),
            Native::BooleanCast => Ok(Value::Bool(
                args.first().map(Value::truthy).unwrap_or(false),
            )),
            Native::ErrorCtor => Ok(error_object(
                args.first().map(Value::to_display).unwrap_or_default(),
            )),
            Native::ParseInt => {
                let text = args.first().map(Value::to_display).unwrap_or_default();
                let trimmed = text.trim();
                let (sign, digits) = match trimmed.strip_prefix('-') {
                    Some(rest) => (-1.0, rest),
                    None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
                };
                let leading: String =
                    digits.chars().take_while(|c| c.is_ascii_digit()).collect();
                Ok(match leading.parse::<f64>() {
                    Ok(n) => Value::Number(sign * n),
                    Err(_) => Value::Number(f64::NAN),
                })
            }
            Native::ParseFloat => {
                let text = args.first().map(Value::to_display).unwrap_or_default();
                let trimmed = text.trim();
                let end = trimmed
                    .char_indices()
                    .take_while(|(i, c)| {
                        c.is_ascii_digit()
                            || *c == '.'
                            || ((*c == '-' || *c == '+') && *i == 0)
                    })
                    .map(|(i, c)| i + c.len_utf8())
                    .last()
                    .unwrap_or(0);
                Ok(trimmed[..end]
                    .parse::<f64>()
                    .map(Value::Number)
                    .unwrap_or(Value::Number(f64::NAN)))
            }
            Native::IsNan => Ok(Value::Bool(
                args.first().map(Value::to_number).unwrap_or(f64::NAN).is_nan(),
            )),
        }
    }

    async fn call_tool(&self, name: &str, args: Vec<Value>) -> EvalResult {
        self.check_suspension()?;
        let mut json_args = Vec::with_capacity(args.len());
        for arg in &args {
            json_args.push(arg.to_json().map_err(|message| {
                self.throw(format!("Cannot pass {message} to tool '{name}'"))
            })?);
        }
        let span = debug_span!("dsl", tool = %name);
        let result = self
            .host
            .call_tool(name, json_args, self.cancel.child_token())
            .instrument(span)
            .await;
        match result {
            Ok(raw) => Ok(Value::from_json(&normalize_tool_result(raw))),
            Err(message) => {
                let value = Value::Str(message);
                self.set_last_error(value.clone());
                Err(Flow::Throw(value))
            }
        }
    }

    /// `map(items, fn)`: bounded fan-out, order-preserving; a failed item
    /// becomes `"ERROR: <message>"` instead of aborting the whole map.
    async fn builtin_map(&self, args: Vec<Value>, span: Span) -> EvalResult {
        let items: Vec<Value> = match args.first() {
            Some(Value::Array(items)) => match items.lock() {
                Ok(guard) => guard.clone(),
                Err(_) => Vec::new(),
            },
            _ => return Err(self.throw("map expects an array as its first argument")),
        };
        let f = self.callable_arg(&args, 1, "map")?;
        let concurrency = self.options.concurrency.max(1);

        let results: Vec<Result<Value, Flow>> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let f = f.clone();
                async move {
                    self.check_suspension()?;
                    match self
                        .call_value(f, vec![item, Value::Number(index as f64)], span)
                        .await
                    {
                        Ok(value) => Ok(value),
                        Err(Flow::Throw(value)) => Ok(Value::str(format!(
                            "ERROR: {}",
                            thrown_to_message(&value)
                        ))),
                        Err(other) => Err(other),
                    }
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut out = Vec::with_capacity(results.len());
        for result in results {
            out.push(result?);
        }
        Ok(Value::array(out))
    }

    async fn builtin_group_by(&self, args: Vec<Value>, span: Span) -> EvalResult {
        let items: Vec<Value> = match args.first() {
            Some(Value::Array(items)) => match items.lock() {
                Ok(guard) => guard.clone(),
                Err(_) => Vec::new(),
            },
            _ => return Err(self.throw("groupBy expects an array as its first argument")),
        };
        let key = args.get(1).cloned().unwrap_or(Value::Undefined);
        let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for item in items {
            let group = match &key {
                Value::Str(field) => self
                    .property_of(&item, &Value::Str(field.clone()), span)
                    .map(|v| v.to_display())
                    .unwrap_or_else(|_| "undefined".to_string()),
                f @ (Value::Function(_) | Value::Native(_)) => self
                    .call_value(f.clone(), vec![item.clone()], span)
                    .await?
                    .to_display(),
                _ => {
                    return Err(
                        self.throw("groupBy expects a key name or function as its second argument")
                    );
                }
            };
            groups.entry(group).or_default().push(item);
        }
        Ok(Value::object(
            groups
                .into_iter()
                .map(|(k, v)| (k, Value::array(v)))
                .collect(),
        ))
    }
}

fn index_for(args: &[Value], index: usize, len: usize, default: usize) -> usize {
    match args.get(index) {
        Some(Value::Undefined) | None => default,
        Some(v) => {
            let n = v.to_number();
            if n.is_nan() {
                return 0;
            }
            let n = n.trunc() as i64;
            if n < 0 {
                len.saturating_sub(n.unsigned_abs() as usize)
            } else {
                (n as usize).min(len)
            }
        }
    }
}

fn to_i32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64) as i32
}
