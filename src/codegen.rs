//! Evaluator and closure emission.
//!
//! Binding evaluators are thunks over the original markup expression with
//! every reactive-ref read rewritten to an explicit `__read(...)` call; the
//! dependency set is exactly the refs whose reads were rewritten. Handler
//! closures keep their body verbatim, minus the `use(...)` declaration, with
//! the canonical `__capture(...)` declaration injected up front. Both are
//! re-parsed and printed once to normalize formatting.

use crate::capture::HandlerFn;
use crate::scope::ScopeChain;
use crate::validate::CompiledClosure;
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    ArrowFunctionExpression, AssignmentExpression, AssignmentTarget, AssignmentTargetMaybeDefault,
    AssignmentTargetProperty, BindingPattern, Expression, Function, IdentifierReference,
    ObjectProperty, PropertyKey, SimpleAssignmentTarget, Statement, TSTypeName, UpdateExpression,
};
use oxc_ast_visit::{walk, Visit};
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use oxc_syntax::scope::ScopeFlags;
use std::collections::HashSet;

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct EvaluatorOutput {
    /// Thunk source, `() => (...)`, async when the expression awaits.
    pub source: String,
    /// Ref ids whose reads were rewritten, first-use order.
    pub deps: Vec<String>,
    pub is_async: bool,
}

/// Compiles one markup expression into its evaluator thunk.
pub fn compile_evaluator(expr: &Expression, chain: &ScopeChain, source: &str) -> EvaluatorOutput {
    let span = expr.span();
    let mut rewriter = ReadRewriter::new(chain);
    rewriter.visit_expression(expr);

    let body = apply_replacements(source, span, rewriter.replacements);
    let is_async = crate::capture::contains_await(expr);
    let prefix = if is_async { "async " } else { "" };
    let thunk = format!("{}() => ({})", prefix, body);

    EvaluatorOutput {
        source: normalize_source(&thunk),
        deps: rewriter.deps,
        is_async,
    }
}

/// Span edits collected by a rewriter, applied back-to-front so earlier
/// offsets stay valid.
fn apply_replacements(source: &str, span: Span, mut replacements: Vec<(u32, u32, String)>) -> String {
    let base = span.start as usize;
    let mut result = source[base..span.end as usize].to_string();
    replacements.sort_by(|a, b| b.0.cmp(&a.0));
    for (start, end, replacement) in replacements {
        result.replace_range((start as usize - base)..(end as usize - base), &replacement);
    }
    result
}

/// Re-parses emitted source and prints it once, collapsing the whitespace the
/// span edits leave behind. Unparseable input is returned untouched.
fn normalize_source(text: &str) -> String {
    let allocator = Allocator::default();
    let source_type = SourceType::default()
        .with_typescript(true)
        .with_module(true)
        .with_jsx(true);
    let ret = Parser::new(&allocator, text, source_type).parse();
    if !ret.errors.is_empty() {
        return text.to_string();
    }
    Codegen::new()
        .build(&ret.program)
        .code
        .trim()
        .trim_end_matches(';')
        .to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// READ REWRITING
// ═══════════════════════════════════════════════════════════════════════════════

/// Rewrites every identifier that resolves to a ref into `__read(name)`.
/// Direct assignment and update targets are left alone; member writes read
/// the cell first (`__read(x).val = ...`), so their roots are rewritten.
struct ReadRewriter<'b> {
    chain: &'b ScopeChain,
    local_scopes: Vec<HashSet<String>>,
    assignment_targets: HashSet<u32>,
    replacements: Vec<(u32, u32, String)>,
    deps: Vec<String>,
    seen: HashSet<String>,
}

impl<'b> ReadRewriter<'b> {
    fn new(chain: &'b ScopeChain) -> Self {
        ReadRewriter {
            chain,
            local_scopes: Vec::new(),
            assignment_targets: HashSet::new(),
            replacements: Vec::new(),
            deps: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.local_scopes.iter().rev().any(|s| s.contains(name))
    }

    fn add_pattern(&mut self, pattern: &BindingPattern) {
        let mut names = Vec::new();
        crate::scope::collect_pattern_names(pattern, &mut names);
        if let Some(scope) = self.local_scopes.last_mut() {
            for (name, _) in names {
                scope.insert(name);
            }
        }
    }

    fn ref_id_for(&self, name: &str) -> Option<String> {
        if self.is_local(name) {
            return None;
        }
        self.chain.resolve(name).and_then(|b| b.ref_id.clone())
    }

    fn rewrite(&mut self, span: Span, replacement: String, ref_id: String) {
        self.replacements.push((span.start, span.end, replacement));
        if self.seen.insert(ref_id.clone()) {
            self.deps.push(ref_id);
        }
    }

    fn mark_direct_targets(&mut self, target: &AssignmentTarget) {
        match target {
            AssignmentTarget::AssignmentTargetIdentifier(id) => {
                self.assignment_targets.insert(id.span.start);
            }
            AssignmentTarget::ObjectAssignmentTarget(obj) => {
                for prop in &obj.properties {
                    match prop {
                        AssignmentTargetProperty::AssignmentTargetPropertyIdentifier(ident) => {
                            self.assignment_targets.insert(ident.binding.span.start);
                        }
                        AssignmentTargetProperty::AssignmentTargetPropertyProperty(prop) => {
                            self.mark_maybe_default(&prop.binding);
                        }
                    }
                }
                if let Some(rest) = &obj.rest {
                    self.mark_direct_targets(&rest.target);
                }
            }
            AssignmentTarget::ArrayAssignmentTarget(arr) => {
                for elem in arr.elements.iter().flatten() {
                    self.mark_maybe_default(elem);
                }
                if let Some(rest) = &arr.rest {
                    self.mark_direct_targets(&rest.target);
                }
            }
            _ => {}
        }
    }

    fn mark_maybe_default(&mut self, target: &AssignmentTargetMaybeDefault) {
        match target {
            AssignmentTargetMaybeDefault::AssignmentTargetWithDefault(def) => {
                self.mark_direct_targets(&def.binding);
            }
            AssignmentTargetMaybeDefault::AssignmentTargetIdentifier(id) => {
                self.assignment_targets.insert(id.span.start);
            }
            _ => {}
        }
    }
}

impl<'a, 'b> Visit<'a> for ReadRewriter<'b> {
    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        let name = ident.name.as_str();
        if self.assignment_targets.contains(&ident.span.start) {
            return;
        }
        if let Some(ref_id) = self.ref_id_for(name) {
            self.rewrite(ident.span, format!("__read({})", name), ref_id);
        }
    }

    // Shorthand `{ x }` expands to `{ x: __read(x) }`.
    fn visit_object_property(&mut self, prop: &ObjectProperty<'a>) {
        if prop.shorthand {
            if let PropertyKey::StaticIdentifier(key) = &prop.key {
                let name = key.name.to_string();
                if let Some(ref_id) = self.ref_id_for(&name) {
                    let span = prop.value.span();
                    self.rewrite(span, format!("{}: __read({})", name, name), ref_id);
                    return;
                }
            }
        }
        walk::walk_object_property(self, prop);
    }

    fn visit_ts_type_name(&mut self, _name: &TSTypeName<'a>) {}

    fn visit_assignment_expression(&mut self, expr: &AssignmentExpression<'a>) {
        self.mark_direct_targets(&expr.left);
        walk::walk_assignment_expression(self, expr);
    }

    fn visit_update_expression(&mut self, expr: &UpdateExpression<'a>) {
        if let SimpleAssignmentTarget::AssignmentTargetIdentifier(id) = &expr.argument {
            self.assignment_targets.insert(id.span.start);
        }
        walk::walk_update_expression(self, expr);
    }

    fn visit_arrow_function_expression(&mut self, arrow: &ArrowFunctionExpression<'a>) {
        self.local_scopes.push(HashSet::new());
        for param in &arrow.params.items {
            self.add_pattern(&param.pattern);
        }
        for stmt in &arrow.body.statements {
            self.visit_statement(stmt);
        }
        self.local_scopes.pop();
    }

    fn visit_function(&mut self, func: &Function<'a>, _flags: ScopeFlags) {
        self.local_scopes.push(HashSet::new());
        if let Some(id) = &func.id {
            if let Some(scope) = self.local_scopes.last_mut() {
                scope.insert(id.name.to_string());
            }
        }
        for param in &func.params.items {
            self.add_pattern(&param.pattern);
        }
        if let Some(body) = &func.body {
            for stmt in &body.statements {
                self.visit_statement(stmt);
            }
        }
        self.local_scopes.pop();
    }

    fn visit_statement(&mut self, stmt: &Statement<'a>) {
        if let Statement::VariableDeclaration(var) = stmt {
            for decl in &var.declarations {
                if let Some(init) = &decl.init {
                    self.visit_expression(init);
                }
                self.add_pattern(&decl.id);
            }
            return;
        }
        walk::walk_statement(self, stmt);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLOSURE ASSEMBLY
// ═══════════════════════════════════════════════════════════════════════════════

/// Builds the emitted closure for an alternate-realm handler: parameters kept,
/// `use(...)` stripped, `__capture(...)` injected first, concise bodies turned
/// into blocks with an explicit return.
pub fn assemble_closure(
    handler: &HandlerFn,
    capture_names: &[String],
    use_span: Option<Span>,
    source: &str,
) -> CompiledClosure {
    let params = handler.param_sources(source);
    let is_async = handler.is_async();
    let prefix = if is_async { "async " } else { "" };
    let capture_stmt = format!("__capture({});", capture_names.join(", "));

    let body = match handler.expression_body() {
        Some(expr) => {
            let span = expr.span();
            let text = &source[span.start as usize..span.end as usize];
            format!("{}\n  return ({});", capture_stmt, text)
        }
        None => {
            let mut lines = vec![capture_stmt];
            for stmt in handler.body_statements() {
                let span = stmt.span();
                if use_span == Some(span) {
                    continue;
                }
                lines.push(source[span.start as usize..span.end as usize].to_string());
            }
            lines.join("\n  ")
        }
    };

    let assembled = format!("{}({}) => {{\n  {}\n}}", prefix, params.join(", "), body);

    CompiledClosure {
        source: normalize_source(&assembled),
        params,
        is_async,
    }
}

/// Replacement body for a handler that failed capture analysis.
pub fn noop_closure(params: &[String]) -> CompiledClosure {
    CompiledClosure {
        source: format!("({}) => {{}}", params.join(", ")),
        params: params.to_vec(),
        is_async: false,
    }
}
