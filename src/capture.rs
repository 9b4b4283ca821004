//! Capture analysis for realm-split handlers.
//!
//! Walks a handler closure and computes its free variables: every identifier
//! the body reads or writes that is not bound by the handler's own parameters
//! or internal declarations. Entries keep first-use order so recompiling the
//! same input yields the same manifest. Nested closures fold transitively into
//! the enclosing handler's capture set; their locals do not.

use crate::scope::{
    collect_pattern_names, unwrap_expression, BindingInit, ScopeChain, FRAMEWORK_HELPERS,
    KNOWN_GLOBALS, RESERVED_IDENTIFIERS,
};
use crate::validate::{BindingKind, SourceLocation};
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    ArrowFunctionExpression, AssignmentExpression, AssignmentTarget, AssignmentTargetMaybeDefault,
    AssignmentTargetProperty, BindingPattern, CatchClause, ClassBody, Expression, ForStatementInit,
    ForStatementLeft, Function, IdentifierReference, JSXElementName, SimpleAssignmentTarget,
    Statement, SwitchStatement, TSTypeName, UpdateExpression,
};
use oxc_ast_visit::{walk, Visit};
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use oxc_syntax::scope::ScopeFlags;
use std::collections::{HashMap, HashSet};

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER NODES
// ═══════════════════════════════════════════════════════════════════════════════

/// A handler closure as it appears in markup: an arrow or a function
/// expression.
pub enum HandlerFn<'a, 'b> {
    Arrow(&'b ArrowFunctionExpression<'a>),
    Function(&'b Function<'a>),
}

impl<'a, 'b> HandlerFn<'a, 'b> {
    pub fn from_expression(expr: &'b Expression<'a>) -> Option<HandlerFn<'a, 'b>> {
        match unwrap_expression(expr) {
            Expression::ArrowFunctionExpression(arrow) => Some(HandlerFn::Arrow(arrow)),
            Expression::FunctionExpression(func) => Some(HandlerFn::Function(func)),
            _ => None,
        }
    }

    pub fn is_async(&self) -> bool {
        match self {
            HandlerFn::Arrow(arrow) => arrow.r#async,
            HandlerFn::Function(func) => func.r#async,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            HandlerFn::Arrow(arrow) => arrow.span,
            HandlerFn::Function(func) => func.span,
        }
    }

    pub fn body_statements(&self) -> &'b [Statement<'a>] {
        match self {
            HandlerFn::Arrow(arrow) => &arrow.body.statements,
            HandlerFn::Function(func) => {
                func.body.as_ref().map(|b| &b.statements[..]).unwrap_or(&[])
            }
        }
    }

    /// The single expression of a concise arrow body, if this is one.
    pub fn expression_body(&self) -> Option<&'b Expression<'a>> {
        if let HandlerFn::Arrow(arrow) = self {
            if arrow.expression {
                if let Some(Statement::ExpressionStatement(stmt)) = arrow.body.statements.first() {
                    return Some(&stmt.expression);
                }
            }
        }
        None
    }

    /// Parameter source text, one entry per declared parameter. Plain
    /// identifier parameters drop their type annotation.
    pub fn param_sources(&self, source: &str) -> Vec<String> {
        let params = match self {
            HandlerFn::Arrow(arrow) => &arrow.params,
            HandlerFn::Function(func) => &func.params,
        };
        params
            .items
            .iter()
            .map(|param| match &param.pattern {
                BindingPattern::BindingIdentifier(id) => id.name.to_string(),
                pattern => {
                    let span = pattern.span();
                    source[span.start as usize..span.end as usize].to_string()
                }
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FREE VARIABLE COLLECTION
// ═══════════════════════════════════════════════════════════════════════════════

struct RawCapture {
    name: String,
    first_used_at: SourceLocation,
    written: bool,
}

/// Scope-aware free-variable visitor. Local scopes shadow outward; reserved
/// names and framework helpers never count as captures. `this` is recorded
/// only where it still means the component (not inside nested non-arrow
/// functions or class bodies).
struct FreeVarCollector<'b> {
    source: &'b str,
    local_scopes: Vec<HashSet<String>>,
    captures: Vec<RawCapture>,
    seen: HashMap<String, usize>,
    this_rebind_depth: u32,
}

impl<'b> FreeVarCollector<'b> {
    fn new(source: &'b str) -> Self {
        FreeVarCollector {
            source,
            local_scopes: Vec::new(),
            captures: Vec::new(),
            seen: HashMap::new(),
            this_rebind_depth: 0,
        }
    }

    fn push_scope(&mut self) {
        self.local_scopes.push(HashSet::new());
    }

    fn pop_scope(&mut self) {
        self.local_scopes.pop();
    }

    fn add_local(&mut self, name: String) {
        if let Some(scope) = self.local_scopes.last_mut() {
            scope.insert(name);
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.local_scopes.iter().rev().any(|s| s.contains(name))
    }

    fn skip_name(&self, name: &str) -> bool {
        self.is_local(name)
            || RESERVED_IDENTIFIERS.contains(name)
            || FRAMEWORK_HELPERS.contains(name)
    }

    fn record_use(&mut self, name: &str, span: Span) {
        if self.skip_name(name) || self.seen.contains_key(name) {
            return;
        }
        self.seen.insert(name.to_string(), self.captures.len());
        self.captures.push(RawCapture {
            name: name.to_string(),
            first_used_at: SourceLocation::at(self.source, span.start),
            written: false,
        });
    }

    fn record_write(&mut self, name: &str, span: Span) {
        if name == "this" && self.this_rebind_depth > 0 {
            return;
        }
        if self.skip_name(name) {
            return;
        }
        match self.seen.get(name) {
            Some(&idx) => self.captures[idx].written = true,
            None => {
                self.seen.insert(name.to_string(), self.captures.len());
                self.captures.push(RawCapture {
                    name: name.to_string(),
                    first_used_at: SourceLocation::at(self.source, span.start),
                    written: true,
                });
            }
        }
    }

    fn declare_pattern(&mut self, pattern: &BindingPattern) {
        let mut names = Vec::new();
        collect_pattern_names(pattern, &mut names);
        for (name, _) in names {
            self.add_local(name);
        }
    }

    /// Declarations in a statement list bind before any statement runs, as
    /// far as capture analysis is concerned.
    fn hoist_statements(&mut self, statements: &[Statement]) {
        for stmt in statements {
            match stmt {
                Statement::VariableDeclaration(var) => {
                    for decl in &var.declarations {
                        self.declare_pattern(&decl.id);
                    }
                }
                Statement::FunctionDeclaration(func) => {
                    if let Some(id) = &func.id {
                        self.add_local(id.name.to_string());
                    }
                }
                Statement::ClassDeclaration(class) => {
                    if let Some(id) = &class.id {
                        self.add_local(id.name.to_string());
                    }
                }
                Statement::TSEnumDeclaration(en) => {
                    self.add_local(en.id.name.to_string());
                }
                _ => {}
            }
        }
    }

    fn expression_root(&self, expr: &Expression, roots: &mut Vec<(String, Span)>) {
        match unwrap_expression(expr) {
            Expression::Identifier(id) => roots.push((id.name.to_string(), id.span)),
            Expression::ThisExpression(this) => roots.push(("this".to_string(), this.span)),
            Expression::StaticMemberExpression(member) => {
                self.expression_root(&member.object, roots)
            }
            Expression::ComputedMemberExpression(member) => {
                self.expression_root(&member.object, roots)
            }
            Expression::PrivateFieldExpression(member) => {
                self.expression_root(&member.object, roots)
            }
            _ => {}
        }
    }

    fn assignment_target_roots(&self, target: &AssignmentTarget, roots: &mut Vec<(String, Span)>) {
        match target {
            AssignmentTarget::AssignmentTargetIdentifier(id) => {
                roots.push((id.name.to_string(), id.span));
            }
            AssignmentTarget::StaticMemberExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            AssignmentTarget::ComputedMemberExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            AssignmentTarget::PrivateFieldExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            AssignmentTarget::ObjectAssignmentTarget(obj) => {
                for prop in &obj.properties {
                    match prop {
                        AssignmentTargetProperty::AssignmentTargetPropertyIdentifier(ident) => {
                            roots.push((ident.binding.name.to_string(), ident.binding.span));
                        }
                        AssignmentTargetProperty::AssignmentTargetPropertyProperty(prop) => {
                            self.maybe_default_roots(&prop.binding, roots);
                        }
                    }
                }
                if let Some(rest) = &obj.rest {
                    self.assignment_target_roots(&rest.target, roots);
                }
            }
            AssignmentTarget::ArrayAssignmentTarget(arr) => {
                for elem in arr.elements.iter().flatten() {
                    self.maybe_default_roots(elem, roots);
                }
                if let Some(rest) = &arr.rest {
                    self.assignment_target_roots(&rest.target, roots);
                }
            }
            _ => {}
        }
    }

    fn maybe_default_roots(
        &self,
        target: &AssignmentTargetMaybeDefault,
        roots: &mut Vec<(String, Span)>,
    ) {
        match target {
            AssignmentTargetMaybeDefault::AssignmentTargetWithDefault(def) => {
                self.assignment_target_roots(&def.binding, roots);
            }
            AssignmentTargetMaybeDefault::AssignmentTargetIdentifier(id) => {
                roots.push((id.name.to_string(), id.span));
            }
            AssignmentTargetMaybeDefault::StaticMemberExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            AssignmentTargetMaybeDefault::ComputedMemberExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            _ => {}
        }
    }

    fn simple_target_roots(
        &self,
        target: &SimpleAssignmentTarget,
        roots: &mut Vec<(String, Span)>,
    ) {
        match target {
            SimpleAssignmentTarget::AssignmentTargetIdentifier(id) => {
                roots.push((id.name.to_string(), id.span));
            }
            SimpleAssignmentTarget::StaticMemberExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            SimpleAssignmentTarget::ComputedMemberExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            SimpleAssignmentTarget::PrivateFieldExpression(member) => {
                self.expression_root(&member.object, roots);
            }
            _ => {}
        }
    }
}

impl<'a, 'b> Visit<'a> for FreeVarCollector<'b> {
    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        self.record_use(ident.name.as_str(), ident.span);
    }

    fn visit_expression(&mut self, expr: &Expression<'a>) {
        if let Expression::ThisExpression(this) = expr {
            if self.this_rebind_depth == 0 {
                self.record_use("this", this.span);
            }
            return;
        }
        walk::walk_expression(self, expr);
    }

    // Identifiers in type position are not value uses.
    fn visit_ts_type_name(&mut self, _name: &TSTypeName<'a>) {}

    // Markup element names resolve through the renderer, not the scope chain.
    // Attributes and children of the element are still walked.
    fn visit_jsx_element_name(&mut self, _name: &JSXElementName<'a>) {}

    fn visit_function(&mut self, func: &Function<'a>, _flags: ScopeFlags) {
        self.this_rebind_depth += 1;
        self.push_scope();
        if let Some(id) = &func.id {
            self.add_local(id.name.to_string());
        }
        for param in &func.params.items {
            self.declare_pattern(&param.pattern);
        }
        walk::walk_formal_parameters(self, &func.params);
        if let Some(body) = &func.body {
            self.push_scope();
            self.hoist_statements(&body.statements);
            for stmt in &body.statements {
                self.visit_statement(stmt);
            }
            self.pop_scope();
        }
        self.pop_scope();
        self.this_rebind_depth -= 1;
    }

    fn visit_arrow_function_expression(&mut self, arrow: &ArrowFunctionExpression<'a>) {
        self.push_scope();
        for param in &arrow.params.items {
            self.declare_pattern(&param.pattern);
        }
        walk::walk_formal_parameters(self, &arrow.params);
        self.push_scope();
        self.hoist_statements(&arrow.body.statements);
        for stmt in &arrow.body.statements {
            self.visit_statement(stmt);
        }
        self.pop_scope();
        self.pop_scope();
    }

    fn visit_statement(&mut self, stmt: &Statement<'a>) {
        match stmt {
            Statement::BlockStatement(block) => {
                self.push_scope();
                self.hoist_statements(&block.body);
                for s in &block.body {
                    self.visit_statement(s);
                }
                self.pop_scope();
            }
            Statement::ForStatement(for_stmt) => {
                self.push_scope();
                if let Some(ForStatementInit::VariableDeclaration(var)) = &for_stmt.init {
                    for decl in &var.declarations {
                        self.declare_pattern(&decl.id);
                    }
                }
                walk::walk_for_statement(self, for_stmt);
                self.pop_scope();
            }
            Statement::ForInStatement(for_stmt) => {
                self.push_scope();
                if let ForStatementLeft::VariableDeclaration(var) = &for_stmt.left {
                    for decl in &var.declarations {
                        self.declare_pattern(&decl.id);
                    }
                }
                walk::walk_for_in_statement(self, for_stmt);
                self.pop_scope();
            }
            Statement::ForOfStatement(for_stmt) => {
                self.push_scope();
                if let ForStatementLeft::VariableDeclaration(var) = &for_stmt.left {
                    for decl in &var.declarations {
                        self.declare_pattern(&decl.id);
                    }
                }
                walk::walk_for_of_statement(self, for_stmt);
                self.pop_scope();
            }
            _ => walk::walk_statement(self, stmt),
        }
    }

    fn visit_switch_statement(&mut self, stmt: &SwitchStatement<'a>) {
        self.push_scope();
        for case in &stmt.cases {
            self.hoist_statements(&case.consequent);
        }
        walk::walk_switch_statement(self, stmt);
        self.pop_scope();
    }

    fn visit_catch_clause(&mut self, clause: &CatchClause<'a>) {
        self.push_scope();
        if let Some(param) = &clause.param {
            self.declare_pattern(&param.pattern);
        }
        walk::walk_catch_clause(self, clause);
        self.pop_scope();
    }

    fn visit_class_body(&mut self, body: &ClassBody<'a>) {
        self.this_rebind_depth += 1;
        walk::walk_class_body(self, body);
        self.this_rebind_depth -= 1;
    }

    fn visit_assignment_expression(&mut self, expr: &AssignmentExpression<'a>) {
        let mut roots = Vec::new();
        self.assignment_target_roots(&expr.left, &mut roots);
        walk::walk_assignment_expression(self, expr);
        for (name, span) in roots {
            self.record_write(&name, span);
        }
    }

    fn visit_update_expression(&mut self, expr: &UpdateExpression<'a>) {
        let mut roots = Vec::new();
        self.simple_target_roots(&expr.argument, &mut roots);
        walk::walk_update_expression(self, expr);
        for (name, span) in roots {
            self.record_write(&name, span);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPTURE SCAN
// ═══════════════════════════════════════════════════════════════════════════════

/// One free variable of a handler, resolved against the enclosing scope.
/// `kind` is `None` for unbound names.
#[derive(Debug, Clone)]
pub struct ResolvedCapture {
    pub name: String,
    pub kind: Option<BindingKind>,
    pub written: bool,
    pub first_used_at: SourceLocation,
    pub declared_at: SourceLocation,
    pub ref_id: Option<String>,
    pub reactive_prop: bool,
    /// The capture is bound to a function value. Such captures travel by copy
    /// only when the function's own free variables all resolve externally.
    pub is_function_value: bool,
    pub init_span: Option<Span>,
}

#[derive(Debug)]
pub struct CaptureScan {
    /// First-use order, each name exactly once.
    pub captures: Vec<ResolvedCapture>,
    pub is_async: bool,
    /// Set by a leading `use("silent-errors", ...)` declaration: unresolvable
    /// names degrade to name lookup without a diagnostic.
    pub silent: bool,
    /// Span of the leading `use(...)` statement, removed from the emitted
    /// closure.
    pub use_span: Option<Span>,
}

/// Computes the capture scan for one handler against the scope chain at its
/// markup position.
pub fn analyze_captures(handler: &HandlerFn, chain: &ScopeChain, source: &str) -> CaptureScan {
    let mut silent = false;
    let mut use_span = None;
    let mut forced: Vec<(String, Span)> = Vec::new();

    if handler.expression_body().is_none() {
        if let Some(Statement::ExpressionStatement(stmt)) = handler.body_statements().first() {
            if let Expression::CallExpression(call) = unwrap_expression(&stmt.expression) {
                if let Expression::Identifier(callee) = unwrap_expression(&call.callee) {
                    if callee.name == "use" {
                        use_span = Some(stmt.span);
                        for (i, arg) in call.arguments.iter().enumerate() {
                            if let Some(expr) = arg.as_expression() {
                                match unwrap_expression(expr) {
                                    Expression::StringLiteral(s)
                                        if i == 0 && s.value == "silent-errors" =>
                                    {
                                        silent = true;
                                    }
                                    Expression::Identifier(id) => {
                                        forced.push((id.name.to_string(), id.span));
                                    }
                                    Expression::ThisExpression(this) => {
                                        forced.push(("this".to_string(), this.span));
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let mut collector = FreeVarCollector::new(source);
    for (name, span) in &forced {
        collector.record_use(name, *span);
    }
    match handler {
        HandlerFn::Arrow(arrow) => collector.visit_arrow_function_expression(arrow),
        HandlerFn::Function(func) => collector.visit_function(func, ScopeFlags::Function),
    }

    let captures = collector
        .captures
        .into_iter()
        .map(|raw| resolve_capture(raw, chain))
        .collect();

    CaptureScan {
        captures,
        is_async: handler.is_async(),
        silent,
        use_span,
    }
}

fn resolve_capture(raw: RawCapture, chain: &ScopeChain) -> ResolvedCapture {
    if raw.name == "this" {
        // The component instance travels by identity, like a reactive prop.
        return ResolvedCapture {
            name: raw.name,
            kind: Some(BindingKind::ComponentProp),
            written: raw.written,
            first_used_at: raw.first_used_at,
            declared_at: SourceLocation::default(),
            ref_id: None,
            reactive_prop: true,
            is_function_value: false,
            init_span: None,
        };
    }
    if let Some(binding) = chain.resolve(&raw.name) {
        return ResolvedCapture {
            name: raw.name,
            kind: Some(binding.kind),
            written: raw.written,
            first_used_at: raw.first_used_at,
            declared_at: binding.declared_at.clone(),
            ref_id: binding.ref_id.clone(),
            reactive_prop: binding.reactive_prop,
            is_function_value: binding.init == BindingInit::Function,
            init_span: binding.init_span,
        };
    }
    let kind = if KNOWN_GLOBALS.contains(raw.name.as_str()) {
        Some(BindingKind::ExternalBinding)
    } else {
        None
    };
    ResolvedCapture {
        name: raw.name,
        kind,
        written: raw.written,
        first_used_at: raw.first_used_at,
        declared_at: SourceLocation::default(),
        ref_id: None,
        reactive_prop: false,
        is_function_value: false,
        init_span: None,
    }
}

/// Free variables of a bare markup expression, resolved like handler
/// captures. The binder uses this to surface unbound identifiers and to probe
/// branch reactivity before committing to a binding form.
pub fn expression_free_vars(
    expr: &Expression,
    chain: &ScopeChain,
    source: &str,
) -> Vec<ResolvedCapture> {
    let mut collector = FreeVarCollector::new(source);
    collector.visit_expression(expr);
    collector
        .captures
        .into_iter()
        .map(|raw| resolve_capture(raw, chain))
        .collect()
}

/// Re-parses a captured function's source span and scans its free variables
/// against the same chain. Used to decide whether a function value can cross
/// the realm boundary. Locations in the result are relative to the slice.
pub fn scan_function_at(span: Span, chain: &ScopeChain, source: &str) -> Option<CaptureScan> {
    let start = span.start as usize;
    let end = (span.end as usize).min(source.len());
    if start >= end {
        return None;
    }
    let slice = &source[start..end];

    let allocator = Allocator::default();
    let source_type = SourceType::default()
        .with_typescript(true)
        .with_module(true)
        .with_jsx(true);
    let ret = Parser::new(&allocator, slice, source_type).parse();
    if !ret.errors.is_empty() {
        return None;
    }

    match ret.program.body.first()? {
        Statement::FunctionDeclaration(func) => {
            Some(analyze_captures(&HandlerFn::Function(func), chain, slice))
        }
        Statement::ExpressionStatement(stmt) => {
            let handler = HandlerFn::from_expression(&stmt.expression)?;
            Some(analyze_captures(&handler, chain, slice))
        }
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASYNC DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

struct AwaitFinder {
    found: bool,
}

impl<'a> Visit<'a> for AwaitFinder {
    fn visit_await_expression(&mut self, _expr: &oxc_ast::ast::AwaitExpression<'a>) {
        self.found = true;
    }

    // Awaits inside nested functions belong to those functions.
    fn visit_function(&mut self, _func: &Function<'a>, _flags: ScopeFlags) {}

    fn visit_arrow_function_expression(&mut self, _arrow: &ArrowFunctionExpression<'a>) {}
}

/// True when the expression itself awaits; awaits inside nested closures do
/// not count.
pub fn contains_await(expr: &Expression) -> bool {
    let mut finder = AwaitFinder { found: false };
    finder.visit_expression(expr);
    finder.found
}
