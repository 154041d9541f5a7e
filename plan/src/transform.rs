//! Await-point analysis over a validated plan.
//!
//! The runtime executes the whole program as one implicitly-awaited async
//! function, so "await injection" here means computing which call sites
//! suspend: direct calls to asynchronous tools, calls to `map`, and calls to
//! user functions that transitively contain such a call. A callback handed
//! to `map` is itself treated as asynchronous, and the treatment cascades
//! through nested callbacks to a fixpoint.
//!
//! Thrown-value isolation (the catch-parameter rewrite of the source
//! language) is realized directly by the interpreter's fiber-local
//! last-error slot, so no tree rewrite happens here; user identifiers and
//! statement order are never touched.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::ast::Element;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::FnBody;
use crate::ast::Function;
use crate::ast::NodeId;
use crate::ast::Program;
use crate::ast::Stmt;
use crate::ast::StmtKind;

/// Tools whose calls suspend. MCP-imported tools are appended at runtime.
pub const BUILTIN_ASYNC_NAMES: &[&str] = &[
    "search",
    "query",
    "extract",
    "listFiles",
    "bash",
    "LLM",
    "delegate",
    "map",
];

#[derive(Debug, Default)]
pub struct Analysis {
    /// Call-site node ids that are await points.
    pub await_calls: HashSet<NodeId>,
    /// Function node ids that must run as async (map callbacks and any
    /// function containing an await point).
    pub async_functions: HashSet<NodeId>,
}

impl Analysis {
    pub fn is_await_call(&self, id: NodeId) -> bool {
        self.await_calls.contains(&id)
    }

    pub fn is_async_function(&self, id: NodeId) -> bool {
        self.async_functions.contains(&id)
    }
}

struct CallSite {
    id: NodeId,
    callee: Option<String>,
    enclosing: Option<NodeId>,
    /// Function-literal arguments, in position order.
    fn_args: Vec<NodeId>,
}

#[derive(Default)]
struct Collected {
    calls: Vec<CallSite>,
    /// name → function node, for declarations and `const f = fn` bindings.
    named: HashMap<String, NodeId>,
}

pub fn transform(program: &Program, extra_async: &HashSet<String>) -> Analysis {
    let mut collected = Collected::default();
    let mut stack = Vec::new();
    for stmt in &program.body {
        collect_stmt(stmt, &mut stack, &mut collected);
    }

    let mut async_names: HashSet<String> = BUILTIN_ASYNC_NAMES
        .iter()
        .map(|s| s.to_string())
        .collect();
    async_names.extend(extra_async.iter().cloned());

    let mut analysis = Analysis::default();
    loop {
        let mut changed = false;

        for call in &collected.calls {
            let is_async_callee = call
                .callee
                .as_deref()
                .is_some_and(|name| async_names.contains(name));
            if is_async_callee && analysis.await_calls.insert(call.id) {
                changed = true;
            }
            // `map(items, cb)` forces cb async; cascade to nested callbacks.
            if call.callee.as_deref() == Some("map") {
                for fn_id in &call.fn_args {
                    if analysis.async_functions.insert(*fn_id) {
                        changed = true;
                    }
                }
            }
        }

        // A function containing an await point is async.
        for call in &collected.calls {
            if analysis.await_calls.contains(&call.id) {
                if let Some(enclosing) = call.enclosing {
                    if analysis.async_functions.insert(enclosing) {
                        changed = true;
                    }
                }
            }
        }

        // Calls to an async user function are await points.
        for (name, fn_id) in &collected.named {
            if analysis.async_functions.contains(fn_id) && async_names.insert(name.clone()) {
                changed = true;
            }
        }

        if !changed {
            return analysis;
        }
    }
}

fn collect_function(function: &Function, stack: &mut Vec<NodeId>, out: &mut Collected) {
    stack.push(function.id);
    match &function.body {
        FnBody::Block(body) => {
            for stmt in body {
                collect_stmt(stmt, stack, out);
            }
        }
        FnBody::Expr(expr) => collect_expr(expr, stack, out),
    }
    stack.pop();
}

fn collect_stmt(stmt: &Stmt, stack: &mut Vec<NodeId>, out: &mut Collected) {
    match &stmt.kind {
        StmtKind::Expression(expr) | StmtKind::Throw(expr) => collect_expr(expr, stack, out),
        StmtKind::Block(body) => {
            for s in body {
                collect_stmt(s, stack, out);
            }
        }
        StmtKind::VarDecl { declarators, .. } => {
            for declarator in declarators {
                if let Some(init) = &declarator.init {
                    if let ExprKind::Function(function) = &init.kind {
                        out.named.insert(declarator.name.clone(), function.id);
                    }
                    collect_expr(init, stack, out);
                }
            }
        }
        StmtKind::FunctionDecl(function) => {
            if let Some(name) = &function.name {
                out.named.insert(name.clone(), function.id);
            }
            collect_function(function, stack, out);
        }
        StmtKind::If {
            test,
            consequent,
            alternate,
        } => {
            collect_expr(test, stack, out);
            collect_stmt(consequent, stack, out);
            if let Some(alternate) = alternate {
                collect_stmt(alternate, stack, out);
            }
        }
        StmtKind::Switch {
            discriminant,
            cases,
        } => {
            collect_expr(discriminant, stack, out);
            for case in cases {
                if let Some(test) = &case.test {
                    collect_expr(test, stack, out);
                }
                for s in &case.body {
                    collect_stmt(s, stack, out);
                }
            }
        }
        StmtKind::ForOf {
            iterable: expr,
            body,
            ..
        }
        | StmtKind::ForIn {
            object: expr, body, ..
        } => {
            collect_expr(expr, stack, out);
            collect_stmt(body, stack, out);
        }
        StmtKind::For {
            init,
            test,
            update,
            body,
        } => {
            if let Some(init) = init {
                collect_stmt(init, stack, out);
            }
            if let Some(test) = test {
                collect_expr(test, stack, out);
            }
            if let Some(update) = update {
                collect_expr(update, stack, out);
            }
            collect_stmt(body, stack, out);
        }
        StmtKind::While { test, body } => {
            collect_expr(test, stack, out);
            collect_stmt(body, stack, out);
        }
        StmtKind::Try {
            block,
            handler,
            finalizer,
        } => {
            for s in block {
                collect_stmt(s, stack, out);
            }
            if let Some(handler) = handler {
                for s in &handler.body {
                    collect_stmt(s, stack, out);
                }
            }
            if let Some(finalizer) = finalizer {
                for s in finalizer {
                    collect_stmt(s, stack, out);
                }
            }
        }
        StmtKind::Return(Some(expr)) => collect_expr(expr, stack, out),
        StmtKind::Return(None)
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Empty
        | StmtKind::Unsupported { .. } => {}
    }
}

fn collect_elements(elements: &[Element], stack: &mut Vec<NodeId>, out: &mut Collected) {
    for element in elements {
        match element {
            Element::Item(expr) | Element::Spread { argument: expr, .. } => {
                collect_expr(expr, stack, out);
            }
        }
    }
}

fn collect_expr(expr: &Expr, stack: &mut Vec<NodeId>, out: &mut Collected) {
    match &expr.kind {
        ExprKind::Call { callee, args, .. } => {
            let callee_name = match &callee.kind {
                ExprKind::Identifier(name) => Some(name.clone()),
                _ => None,
            };
            let fn_args = args
                .iter()
                .filter_map(|arg| match arg {
                    Element::Item(Expr {
                        kind: ExprKind::Function(function),
                        ..
                    }) => Some(function.id),
                    _ => None,
                })
                .collect();
            out.calls.push(CallSite {
                id: expr.id,
                callee: callee_name,
                enclosing: stack.last().copied(),
                fn_args,
            });
            collect_expr(callee, stack, out);
            collect_elements(args, stack, out);
        }
        ExprKind::New { callee, args } => {
            collect_expr(callee, stack, out);
            collect_elements(args, stack, out);
        }
        ExprKind::Function(function) => collect_function(function, stack, out),
        ExprKind::Member {
            object, property, ..
        } => {
            collect_expr(object, stack, out);
            if let crate::ast::MemberProp::Computed(key) = property {
                collect_expr(key, stack, out);
            }
        }
        ExprKind::Template { exprs, .. } => {
            for e in exprs {
                collect_expr(e, stack, out);
            }
        }
        ExprKind::TaggedTemplate { tag, exprs, .. } => {
            collect_expr(tag, stack, out);
            for e in exprs {
                collect_expr(e, stack, out);
            }
        }
        ExprKind::Array(elements) => collect_elements(elements, stack, out),
        ExprKind::Object(properties) => {
            for property in properties {
                match property {
                    crate::ast::ObjectProperty::Property { key, value, .. } => {
                        if let crate::ast::PropKey::Computed(key_expr) = key {
                            collect_expr(key_expr, stack, out);
                        }
                        collect_expr(value, stack, out);
                    }
                    crate::ast::ObjectProperty::Spread { argument, .. } => {
                        collect_expr(argument, stack, out);
                    }
                }
            }
        }
        ExprKind::Conditional {
            test,
            consequent,
            alternate,
        } => {
            collect_expr(test, stack, out);
            collect_expr(consequent, stack, out);
            collect_expr(alternate, stack, out);
        }
        ExprKind::Assignment { target, value, .. } => {
            if let ExprKind::Identifier(name) = &target.kind {
                if let ExprKind::Function(function) = &value.kind {
                    out.named.insert(name.clone(), function.id);
                }
            }
            collect_expr(target, stack, out);
            collect_expr(value, stack, out);
        }
        ExprKind::Update { target, .. } => collect_expr(target, stack, out),
        ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
            collect_expr(left, stack, out);
            collect_expr(right, stack, out);
        }
        ExprKind::Unary { operand, .. } => collect_expr(operand, stack, out),
        ExprKind::Sequence(exprs) => {
            for e in exprs {
                collect_expr(e, stack, out);
            }
        }
        ExprKind::Identifier(_) | ExprKind::Literal(_) | ExprKind::Unsupported { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::parser::parse;

    fn analyze(source: &str) -> (Program, Analysis) {
        let program = parse(source).unwrap();
        let analysis = transform(&program, &HashSet::new());
        (program, analysis)
    }

    fn call_ids<'a>(program: &'a Program, analysis: &Analysis) -> usize {
        let _ = program;
        analysis.await_calls.len()
    }

    #[test]
    fn direct_tool_calls_are_await_points() {
        let (program, analysis) = analyze("const r = search('x'); log(r)");
        // `search` suspends, `log` does not.
        assert_eq!(call_ids(&program, &analysis), 1);
    }

    #[test]
    fn map_callback_becomes_async() {
        let (_, analysis) = analyze("map(items, item => extract(item))");
        // Both the map call and the nested extract call suspend, and the
        // callback is forced async.
        assert_eq!(analysis.await_calls.len(), 2);
        assert_eq!(analysis.async_functions.len(), 1);
    }

    #[test]
    fn cascade_reaches_nested_map_closures() {
        let (_, analysis) =
            analyze("map(groups, g => map(g, item => bash(item)))");
        // Outer map, inner map, bash: three await points; two async closures.
        assert_eq!(analysis.await_calls.len(), 3);
        assert_eq!(analysis.async_functions.len(), 2);
    }

    #[test]
    fn user_functions_containing_tool_calls_propagate() {
        let (_, analysis) = analyze(
            "function lookup(q) { return search(q); }\nconst r = lookup('a');",
        );
        // `search(q)` and `lookup('a')` both suspend.
        assert_eq!(analysis.await_calls.len(), 2);
        assert_eq!(analysis.async_functions.len(), 1);
    }

    #[test]
    fn const_bound_arrow_functions_propagate() {
        let (_, analysis) = analyze(
            "const lookup = q => search(q);\nlookup('a'); lookup('b');",
        );
        assert_eq!(analysis.await_calls.len(), 3);
    }

    #[test]
    fn pure_helpers_do_not_suspend() {
        let (_, analysis) = analyze("const c = chunk(text, 100); const r = range(0, 5); flatten(c)");
        assert!(analysis.await_calls.is_empty());
        assert!(analysis.async_functions.is_empty());
    }

    #[test]
    fn extra_async_names_extend_the_set() {
        let program = parse("github_search('x')").unwrap();
        let mut extra = HashSet::new();
        extra.insert("github_search".to_string());
        let analysis = transform(&program, &extra);
        assert_eq!(analysis.await_calls.len(), 1);
    }
}
