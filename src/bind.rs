//! Dependency binding: template markup to render programs.
//!
//! Walks the markup a template returns and splits it into a static skeleton
//! plus the records that attach to its anchors. Every embedded expression
//! lands in exactly one bucket: folded into the skeleton, evaluated once as
//! a static fragment, or tracked as a binding whose dependency set is the
//! exact ref set its evaluator reads. Conditionals and lists carry their own
//! sub-programs so only the active branch or the live items hold bindings.

use crate::capture::{expression_free_vars, HandlerFn};
use crate::codegen::compile_evaluator;
use crate::realm;
use crate::scope::{collect_pattern_names, unwrap_expression, Binding, ScopeChain, LIST_METHODS};
use crate::static_eval::fold_const;
use crate::validate::{
    BindingRecord, BranchPrograms, ClosureArtifact, CompilerError, ItemProgram, RealmTag,
    RenderKind, RenderProgram, SourceLocation, StaticFragment, INV_MALFORMED_BINDING,
    INV_UNBOUND_IDENTIFIER,
};
use oxc_ast::ast::{
    Expression, JSXAttribute, JSXAttributeItem, JSXAttributeName, JSXAttributeValue, JSXChild,
    JSXElement, JSXElementName, JSXFragment, JSXMemberExpression, JSXMemberExpressionObject,
    LogicalOperator, Statement,
};
use oxc_ast_visit::Visit;
use oxc_span::{GetSpan, Span};

// ═══════════════════════════════════════════════════════════════════════════════
// SKELETON TEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Tags that take no children and self-close in the skeleton.
const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Text node marker pinning the next embedded expression as a one-shot
/// fragment.
const STATIC_MARKER: &str = "#static";

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Markup text cleanup. Whitespace touching a newline is formatting and
/// disappears; a same-line gap keeps a single space; interior runs collapse.
fn clean_jsx_text(raw: &str) -> Option<String> {
    let mut text = raw;
    if let Some(idx) = text.find(|c: char| !c.is_whitespace()) {
        if text[..idx].contains('\n') {
            text = &text[idx..];
        }
    }
    if let Some(idx) = text.rfind(|c: char| !c.is_whitespace()) {
        if text[idx + 1..].contains('\n') {
            text = &text[..idx + 1];
        }
    }
    if text.trim().is_empty() {
        if text.is_empty() || text.contains('\n') {
            return None;
        }
        return Some(" ".to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut in_whitespace = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                out.push(' ');
            }
            in_whitespace = true;
        } else {
            out.push(ch);
            in_whitespace = false;
        }
    }
    Some(out)
}

fn element_name(name: &JSXElementName) -> String {
    match name {
        JSXElementName::Identifier(id) => id.name.to_string(),
        JSXElementName::IdentifierReference(id) => id.name.to_string(),
        JSXElementName::NamespacedName(ns) => format!("{}:{}", ns.namespace.name, ns.name.name),
        JSXElementName::MemberExpression(member) => jsx_member_name(member),
        JSXElementName::ThisExpression(_) => "this".to_string(),
    }
}

fn jsx_member_name(member: &JSXMemberExpression) -> String {
    let object = match &member.object {
        JSXMemberExpressionObject::IdentifierReference(id) => id.name.to_string(),
        JSXMemberExpressionObject::MemberExpression(inner) => jsx_member_name(inner),
        _ => "this".to_string(),
    };
    format!("{}.{}", object, member.property.name)
}

fn attribute_name(name: &JSXAttributeName) -> String {
    match name {
        JSXAttributeName::Identifier(id) => id.name.to_string(),
        JSXAttributeName::NamespacedName(ns) => format!("{}:{}", ns.namespace.name, ns.name.name),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STRUCTURAL FORMS
// ═══════════════════════════════════════════════════════════════════════════════

struct JsxProbe {
    found: bool,
}

impl<'a> Visit<'a> for JsxProbe {
    fn visit_jsx_element(&mut self, _element: &JSXElement<'a>) {
        self.found = true;
    }

    fn visit_jsx_fragment(&mut self, _fragment: &JSXFragment<'a>) {
        self.found = true;
    }
}

pub(crate) fn contains_jsx(expr: &Expression) -> bool {
    let mut probe = JsxProbe { found: false };
    probe.visit_expression(expr);
    probe.found
}

pub(crate) fn is_jsx(expr: &Expression) -> bool {
    matches!(
        expr,
        Expression::JSXElement(_) | Expression::JSXFragment(_)
    )
}

/// A two-branch form: ternary, logical-AND short circuit, or an unshadowed
/// `toggle(cond, a, b)` call. Logical-AND has no alternate.
struct ConditionalParts<'a, 'b> {
    test: &'b Expression<'a>,
    consequent: &'b Expression<'a>,
    alternate: Option<&'b Expression<'a>>,
}

fn conditional_parts<'a, 'b>(
    expr: &'b Expression<'a>,
    chain: &ScopeChain,
) -> Option<ConditionalParts<'a, 'b>> {
    match expr {
        Expression::ConditionalExpression(cond) => Some(ConditionalParts {
            test: &cond.test,
            consequent: &cond.consequent,
            alternate: Some(&cond.alternate),
        }),
        Expression::LogicalExpression(logical) if logical.operator == LogicalOperator::And => {
            Some(ConditionalParts {
                test: &logical.left,
                consequent: &logical.right,
                alternate: None,
            })
        }
        Expression::CallExpression(call) => {
            let Expression::Identifier(id) = unwrap_expression(&call.callee) else {
                return None;
            };
            if id.name != "toggle" || chain.resolve("toggle").is_some() {
                return None;
            }
            let mut args = Vec::new();
            for arg in &call.arguments {
                args.push(arg.as_expression()?);
            }
            if args.len() < 2 || args.len() > 3 {
                return None;
            }
            Some(ConditionalParts {
                test: args[0],
                consequent: args[1],
                alternate: args.get(2).copied(),
            })
        }
        _ => None,
    }
}

struct ListParts<'a, 'b> {
    sequence: &'b Expression<'a>,
    callback: HandlerFn<'a, 'b>,
    item: &'b Expression<'a>,
}

enum ListForm<'a, 'b> {
    None,
    /// The callback holds markup but not as a single returned expression.
    Malformed(Span),
    List(ListParts<'a, 'b>),
}

fn list_form<'a, 'b>(expr: &'b Expression<'a>) -> ListForm<'a, 'b> {
    let Expression::CallExpression(call) = expr else {
        return ListForm::None;
    };
    let Expression::StaticMemberExpression(member) = unwrap_expression(&call.callee) else {
        return ListForm::None;
    };
    if !LIST_METHODS.contains(member.property.name.as_str()) {
        return ListForm::None;
    }
    let Some(first) = call.arguments.first().and_then(|arg| arg.as_expression()) else {
        return ListForm::None;
    };
    let Some(callback) = HandlerFn::from_expression(first) else {
        return ListForm::None;
    };
    match jsx_return(&callback) {
        Some(item) => ListForm::List(ListParts {
            sequence: &member.object,
            callback,
            item,
        }),
        None if contains_jsx(first) => ListForm::Malformed(callback.span()),
        None => ListForm::None,
    }
}

/// The callback's single returned markup expression, if that is all the body
/// does.
fn jsx_return<'a, 'b>(callback: &HandlerFn<'a, 'b>) -> Option<&'b Expression<'a>> {
    if let Some(body) = callback.expression_body() {
        let body = unwrap_expression(body);
        return is_jsx(body).then_some(body);
    }
    if let [Statement::ReturnStatement(ret)] = callback.body_statements() {
        if let Some(argument) = &ret.argument {
            let argument = unwrap_expression(argument);
            if is_jsx(argument) {
                return Some(argument);
            }
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct BindResult {
    pub program: RenderProgram,
    pub closures: Vec<ClosureArtifact>,
    pub diagnostics: Vec<CompilerError>,
}

/// Binds one template's returned markup against the scope chain at its
/// definition. The chain is cloned because list callbacks open item scopes
/// while their sub-programs bind.
pub fn bind_template(
    root: &Expression,
    chain: &ScopeChain,
    source: &str,
    file_path: &str,
) -> BindResult {
    let mut binder = Binder {
        chain: chain.clone(),
        source,
        file_path,
        next_id: 0,
        closures: Vec::new(),
        diagnostics: Vec::new(),
    };
    let mut program = RenderProgram::default();
    let mut skeleton = String::new();
    binder.bind_expression_position(root, &mut skeleton, &mut program, false);
    program.skeleton = skeleton;
    BindResult {
        program,
        closures: binder.closures,
        diagnostics: binder.diagnostics,
    }
}

struct Binder<'s> {
    chain: ScopeChain,
    source: &'s str,
    file_path: &'s str,
    /// One counter across all kinds, so ids never collide within a template.
    next_id: usize,
    closures: Vec<ClosureArtifact>,
    diagnostics: Vec<CompilerError>,
}

impl<'s> Binder<'s> {
    fn alloc_id(&mut self, prefix: &str) -> String {
        let id = format!("{}_{}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    fn error_at(&mut self, code: &str, message: &str, offset: u32) {
        let location = SourceLocation::at(self.source, offset);
        self.diagnostics.push(CompilerError::new(
            code,
            message,
            self.file_path,
            location.line,
            location.column,
        ));
    }

    /// Reports every unbound identifier in the expression. Returns true when
    /// any was found; the caller then treats the position as opaque.
    fn report_unbound(&mut self, expr: &Expression) -> bool {
        let free = expression_free_vars(expr, &self.chain, self.source);
        let mut any = false;
        for capture in free.iter().filter(|c| c.kind.is_none()) {
            any = true;
            self.diagnostics.push(CompilerError::new(
                INV_UNBOUND_IDENTIFIER,
                &format!("'{}' is not defined in the template scope", capture.name),
                self.file_path,
                capture.first_used_at.line,
                capture.first_used_at.column,
            ));
        }
        any
    }

    fn bind_children(
        &mut self,
        children: &[JSXChild],
        out: &mut String,
        program: &mut RenderProgram,
    ) {
        let mut force_static_next = false;
        for child in children {
            match child {
                JSXChild::Text(text) => {
                    let raw = text.value.as_str();
                    let trimmed = raw.trim_end();
                    let (content, marks_next) = if trimmed.ends_with(STATIC_MARKER) {
                        (&trimmed[..trimmed.len() - STATIC_MARKER.len()], true)
                    } else {
                        (raw, false)
                    };
                    if let Some(clean) = clean_jsx_text(content) {
                        out.push_str(&escape_html(&clean));
                    }
                    force_static_next = marks_next;
                }
                JSXChild::ExpressionContainer(container) => {
                    let forced = force_static_next;
                    force_static_next = false;
                    if let Some(expr) = container.expression.as_expression() {
                        self.bind_expression_position(expr, out, program, forced);
                    }
                }
                JSXChild::Element(element) => {
                    force_static_next = false;
                    self.bind_element(element, out, program);
                }
                JSXChild::Fragment(fragment) => {
                    force_static_next = false;
                    self.bind_children(&fragment.children, out, program);
                }
                JSXChild::Spread(spread) => {
                    force_static_next = false;
                    self.bind_spread_children(&spread.expression, out, program);
                }
            }
        }
    }

    fn bind_element(
        &mut self,
        element: &JSXElement,
        out: &mut String,
        program: &mut RenderProgram,
    ) {
        let tag = element_name(&element.opening_element.name);
        let mut attrs = String::new();
        for item in &element.opening_element.attributes {
            match item {
                JSXAttributeItem::Attribute(attr) => self.bind_attribute(attr, &mut attrs, program),
                JSXAttributeItem::SpreadAttribute(spread) => {
                    self.error_at(
                        INV_MALFORMED_BINDING,
                        "spread attributes cannot be compiled into a skeleton",
                        spread.span.start,
                    );
                }
            }
        }
        let mut children = String::new();
        self.bind_children(&element.children, &mut children, program);
        if children.is_empty() && VOID_ELEMENTS.contains(&tag.as_str()) {
            out.push_str(&format!("<{}{} />", tag, attrs));
        } else {
            out.push_str(&format!("<{}{}>{}</{}>", tag, attrs, children, tag));
        }
    }

    fn bind_attribute(
        &mut self,
        attr: &JSXAttribute,
        attrs: &mut String,
        program: &mut RenderProgram,
    ) {
        let raw_name = attribute_name(&attr.name);
        let (base, tag) = realm::parse_realm_tag(&raw_name);

        if base.starts_with("on") {
            if let Some(JSXAttributeValue::ExpressionContainer(container)) = &attr.value {
                if let Some(expr) = container.expression.as_expression() {
                    self.bind_handler(&base, &tag, expr, attrs);
                    return;
                }
            }
        }

        match &attr.value {
            None => attrs.push_str(&format!(" {}", raw_name)),
            Some(JSXAttributeValue::StringLiteral(s)) => {
                attrs.push_str(&format!(" {}=\"{}\"", raw_name, escape_html(&s.value)));
            }
            Some(JSXAttributeValue::ExpressionContainer(container)) => {
                if let Some(expr) = container.expression.as_expression() {
                    self.bind_attribute_expression(&raw_name, expr, attrs, program);
                }
            }
            Some(JSXAttributeValue::Element(el)) => {
                self.error_at(
                    INV_MALFORMED_BINDING,
                    "markup is not a valid attribute value",
                    el.span.start,
                );
            }
            Some(JSXAttributeValue::Fragment(fragment)) => {
                self.error_at(
                    INV_MALFORMED_BINDING,
                    "markup is not a valid attribute value",
                    fragment.span.start,
                );
            }
        }
    }

    /// Handlers anchor by content hash in both realms; only alternate-realm
    /// handlers also produce a closure artifact.
    fn bind_handler(&mut self, base: &str, tag: &RealmTag, expr: &Expression, attrs: &mut String) {
        let outcome = realm::split_handler(expr, tag, &self.chain, self.source, self.file_path);
        self.diagnostics.extend(outcome.diagnostics);
        let id = match outcome.artifact {
            Some(artifact) => {
                let id = artifact.handler_id.clone();
                self.closures.push(artifact);
                id
            }
            None => realm::handler_id(self.file_path, expr.span(), self.source),
        };
        attrs.push_str(&format!(" data-tandem-handler-{}=\"{}\"", base, id));
    }

    fn bind_attribute_expression(
        &mut self,
        name: &str,
        expr: &Expression,
        attrs: &mut String,
        program: &mut RenderProgram,
    ) {
        let expr = unwrap_expression(expr);
        if self.report_unbound(expr) {
            return;
        }
        if contains_jsx(expr) {
            self.error_at(
                INV_MALFORMED_BINDING,
                "markup is not a valid attribute value",
                expr.span().start,
            );
            return;
        }
        if let Some(value) = fold_const(expr) {
            attrs.push_str(&format!(" {}=\"{}\"", name, escape_html(&value.render())));
            return;
        }
        let eval = compile_evaluator(expr, &self.chain, self.source);
        let location = SourceLocation::at(self.source, expr.span().start);
        if eval.deps.is_empty() {
            let id = self.alloc_id("static");
            attrs.push_str(&format!(" data-tandem-attr-{}=\"{}\"", name, id));
            program.statics.push(StaticFragment {
                id: id.clone(),
                anchor: id,
                evaluator: eval.source,
                is_async: eval.is_async,
                location,
            });
            return;
        }
        let id = self.alloc_id("attr");
        attrs.push_str(&format!(" data-tandem-attr-{}=\"{}\"", name, id));
        program.bindings.push(BindingRecord {
            id: id.clone(),
            kind: RenderKind::Attribute,
            anchor: id,
            deps: eval.deps,
            evaluator: eval.source,
            is_async: eval.is_async,
            location,
            attribute: Some(name.to_string()),
            branches: None,
            item: None,
        });
    }

    /// One embedded expression in child position. Decides among skeleton
    /// folding, a one-shot static fragment, a tracked text binding, and the
    /// structural conditional/list forms with their sub-programs.
    fn bind_expression_position(
        &mut self,
        expr: &Expression,
        out: &mut String,
        program: &mut RenderProgram,
        force_static: bool,
    ) {
        let expr = unwrap_expression(expr);

        match expr {
            Expression::JSXElement(element) => {
                self.bind_element(element, out, program);
                return;
            }
            Expression::JSXFragment(fragment) => {
                self.bind_children(&fragment.children, out, program);
                return;
            }
            // Nullish and boolean literals render nothing in child position.
            Expression::NullLiteral(_) | Expression::BooleanLiteral(_) => return,
            Expression::Identifier(id) if id.name == "undefined" => return,
            _ => {}
        }

        if let Some(parts) = conditional_parts(expr, &self.chain) {
            if self.try_bind_conditional(expr, &parts, out, program) {
                return;
            }
        }

        match list_form(expr) {
            ListForm::List(parts) => {
                self.bind_list(expr, &parts, out, program);
                return;
            }
            ListForm::Malformed(span) => {
                self.error_at(
                    INV_MALFORMED_BINDING,
                    "list callback must return markup as its only statement",
                    span.start,
                );
                return;
            }
            ListForm::None => {}
        }

        if self.report_unbound(expr) {
            return;
        }
        if contains_jsx(expr) {
            self.error_at(
                INV_MALFORMED_BINDING,
                "markup may appear as a child, a branch of a conditional, or a list callback return",
                expr.span().start,
            );
            return;
        }

        if let Some(value) = fold_const(expr) {
            out.push_str(&escape_html(&value.render()));
            return;
        }

        let eval = compile_evaluator(expr, &self.chain, self.source);
        let location = SourceLocation::at(self.source, expr.span().start);
        if force_static || eval.deps.is_empty() {
            let id = self.alloc_id("static");
            out.push_str(&format!("<span data-tandem-text=\"{}\"></span>", id));
            program.statics.push(StaticFragment {
                id: id.clone(),
                anchor: id,
                evaluator: eval.source,
                is_async: eval.is_async,
                location,
            });
            return;
        }
        let id = self.alloc_id("expr");
        out.push_str(&format!("<span data-tandem-text=\"{}\"></span>", id));
        program.bindings.push(BindingRecord {
            id: id.clone(),
            kind: RenderKind::Text,
            anchor: id,
            deps: eval.deps,
            evaluator: eval.source,
            is_async: eval.is_async,
            location,
            attribute: None,
            branches: None,
            item: None,
        });
    }

    /// Commits to a conditional binding when a branch holds markup or any ref
    /// is involved. Plain data ternaries fall through to the ordinary
    /// evaluator path, so the caller continues when this returns false.
    fn try_bind_conditional(
        &mut self,
        expr: &Expression,
        parts: &ConditionalParts,
        out: &mut String,
        program: &mut RenderProgram,
    ) -> bool {
        if contains_jsx(parts.test) {
            return false;
        }
        let branch_markup = contains_jsx(parts.consequent)
            || parts.alternate.map(contains_jsx).unwrap_or(false);
        if !branch_markup {
            let reactive = expression_free_vars(expr, &self.chain, self.source)
                .iter()
                .any(|c| c.ref_id.is_some());
            if !reactive {
                return false;
            }
        }
        if self.report_unbound(parts.test) {
            // The test cannot be evaluated; the whole position is opaque.
            return true;
        }

        let eval = compile_evaluator(parts.test, &self.chain, self.source);
        let id = self.alloc_id("cond");
        let location = SourceLocation::at(self.source, expr.span().start);
        let consequent = self.bind_branch(parts.consequent);
        let alternate = match parts.alternate {
            Some(alt) => self.bind_branch(alt),
            None => RenderProgram::default(),
        };
        out.push_str(&format!("<template data-tandem-cond=\"{}\"></template>", id));
        program.bindings.push(BindingRecord {
            id: id.clone(),
            kind: RenderKind::Conditional,
            anchor: id,
            deps: eval.deps,
            evaluator: eval.source,
            is_async: eval.is_async,
            location,
            attribute: None,
            branches: Some(BranchPrograms {
                consequent,
                alternate,
            }),
            item: None,
        });
        true
    }

    fn bind_branch(&mut self, expr: &Expression) -> RenderProgram {
        let mut program = RenderProgram::default();
        let mut skeleton = String::new();
        self.bind_expression_position(expr, &mut skeleton, &mut program, false);
        program.skeleton = skeleton;
        program
    }

    /// `sequence.map(callback)` with a markup-returning callback. The callback
    /// parameters bind as plain item-scope values inside the sub-program; the
    /// sequence itself is the binding's evaluator.
    fn bind_list(
        &mut self,
        expr: &Expression,
        parts: &ListParts,
        out: &mut String,
        program: &mut RenderProgram,
    ) {
        if self.report_unbound(parts.sequence) {
            return;
        }
        let eval = compile_evaluator(parts.sequence, &self.chain, self.source);
        let params = parts.callback.param_sources(self.source);
        let item_var = params.first().cloned().unwrap_or_else(|| "_".to_string());
        let index_var = params.get(1).cloned();
        let id = self.alloc_id("list");
        let location = SourceLocation::at(self.source, expr.span().start);

        self.chain.push_scope();
        let mut names = Vec::new();
        match &parts.callback {
            HandlerFn::Arrow(arrow) => {
                for param in &arrow.params.items {
                    collect_pattern_names(&param.pattern, &mut names);
                }
            }
            HandlerFn::Function(func) => {
                for param in &func.params.items {
                    collect_pattern_names(&param.pattern, &mut names);
                }
            }
        }
        for (name, span) in names {
            let declared_at = SourceLocation::at(self.source, span.start);
            self.chain.declare(Binding::plain(&name, declared_at));
        }
        let item_program = self.bind_branch(parts.item);
        self.chain.pop_scope();

        out.push_str(&format!("<template data-tandem-list=\"{}\"></template>", id));
        program.bindings.push(BindingRecord {
            id: id.clone(),
            kind: RenderKind::List,
            anchor: id,
            deps: eval.deps,
            evaluator: eval.source,
            is_async: eval.is_async,
            location,
            attribute: None,
            branches: None,
            item: Some(ItemProgram {
                item_var,
                index_var,
                program: item_program,
            }),
        });
    }

    /// `{...children}` is an opaque pass-through: the renderer moves the given
    /// nodes under the anchor and tracks nothing beyond their identity.
    fn bind_spread_children(
        &mut self,
        expr: &Expression,
        out: &mut String,
        program: &mut RenderProgram,
    ) {
        if self.report_unbound(expr) {
            return;
        }
        let eval = compile_evaluator(expr, &self.chain, self.source);
        let id = self.alloc_id("children");
        out.push_str(&format!(
            "<template data-tandem-children=\"{}\"></template>",
            id
        ));
        program.bindings.push(BindingRecord {
            id: id.clone(),
            kind: RenderKind::Children,
            anchor: id,
            deps: Vec::new(),
            evaluator: eval.source,
            is_async: eval.is_async,
            location: SourceLocation::at(self.source, expr.span().start),
            attribute: None,
            branches: None,
            item: None,
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
