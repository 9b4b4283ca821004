//! Scope chain and reference classification.
//!
//! Every free identifier a template reads resolves here: innermost scope
//! first, then known globals. The resolved kind (reactive ref, plain value,
//! component prop, external binding) drives both dependency tracking and the
//! realm-transfer strategy of captures.

use crate::validate::{BindingKind, RefInfo, SourceLocation};
use oxc_ast::ast::{
    BindingPattern, Declaration, Expression, ImportDeclarationSpecifier, Program, Statement,
};
use oxc_span::{GetSpan, Span};
use std::collections::HashSet;

lazy_static::lazy_static! {
    /// Ambient globals present in both realms. References resolve as
    /// `ExternalBinding` and cross the realm boundary by name lookup.
    pub static ref KNOWN_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("globalThis");
        s.insert("self");
        s.insert("window");
        s.insert("document");
        s.insert("console");
        s.insert("alert");
        s.insert("confirm");
        s.insert("prompt");
        s.insert("fetch");
        s.insert("navigator");
        s.insert("location");
        s.insert("localStorage");
        s.insert("sessionStorage");
        s.insert("setTimeout");
        s.insert("setInterval");
        s.insert("clearTimeout");
        s.insert("clearInterval");
        s.insert("queueMicrotask");
        s.insert("structuredClone");
        s.insert("Math");
        s.insert("JSON");
        s.insert("Date");
        s.insert("String");
        s.insert("Number");
        s.insert("Boolean");
        s.insert("Array");
        s.insert("Object");
        s.insert("Promise");
        s.insert("Map");
        s.insert("Set");
        s.insert("WeakMap");
        s.insert("WeakSet");
        s.insert("Symbol");
        s.insert("BigInt");
        s.insert("RegExp");
        s.insert("Error");
        s.insert("TypeError");
        s.insert("URL");
        s.insert("parseInt");
        s.insert("parseFloat");
        s.insert("isNaN");
        s.insert("encodeURIComponent");
        s.insert("decodeURIComponent");
        s
    };

    /// Names that are values of the language, never bindings to capture.
    pub static ref RESERVED_IDENTIFIERS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("undefined");
        s.insert("null");
        s.insert("true");
        s.insert("false");
        s.insert("NaN");
        s.insert("Infinity");
        s.insert("arguments");
        s.insert("eval");
        s
    };

    /// Runtime helpers injected into both realms; resolve as external but are
    /// never captured into a manifest.
    pub static ref FRAMEWORK_HELPERS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("$");
        s.insert("$$");
        s.insert("always");
        s.insert("toggle");
        s.insert("effect");
        s.insert("use");
        s.insert("__read");
        s.insert("__capture");
        s
    };

    /// Boxed-value wrapper: tracks reads and writes of the cell itself.
    pub static ref VALUE_WRAPPERS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("$");
        s
    };

    /// Deep wrapper: nested object/array mutations are reactive too.
    pub static ref DEEP_WRAPPERS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("$$");
        s
    };

    /// Derived-ref wrapper.
    pub static ref COMPUTED_WRAPPERS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("always");
        s
    };

    /// Realm-tag aliases that pin the default realm explicitly; any other tag
    /// names the alternate realm.
    pub static ref DEFAULT_REALM_ALIASES: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("default");
        s.insert("backend");
        s.insert("server");
        s
    };

    /// Sequence methods whose JSX-returning callbacks become list bindings.
    pub static ref LIST_METHODS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("map");
        s
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Shape of a binding's initializer, as far as classification cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingInit {
    None,
    ReactiveWrapper { deep: bool },
    Computed,
    Function,
    Other,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub kind: BindingKind,
    /// Ref id for `ReactiveRef` bindings and reactive component props.
    pub ref_id: Option<String>,
    pub init: BindingInit,
    /// Span of a function-valued initializer, for nested capture checks.
    pub init_span: Option<Span>,
    /// True for component props whose declared value is itself reactive.
    pub reactive_prop: bool,
    pub declared_at: SourceLocation,
}

impl Binding {
    pub fn plain(name: &str, declared_at: SourceLocation) -> Self {
        Binding {
            name: name.to_string(),
            kind: BindingKind::PlainValue,
            ref_id: None,
            init: BindingInit::Other,
            init_span: None,
            reactive_prop: false,
            declared_at,
        }
    }

    pub fn external(name: &str, declared_at: SourceLocation) -> Self {
        Binding {
            name: name.to_string(),
            kind: BindingKind::ExternalBinding,
            ref_id: None,
            init: BindingInit::None,
            init_span: None,
            reactive_prop: false,
            declared_at,
        }
    }
}

/// Allocates ref ids in declaration order, so identical input compiles to
/// identical ids.
#[derive(Debug, Default)]
pub struct RefTable {
    refs: Vec<RefInfo>,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &mut self,
        name: &str,
        deep: bool,
        computed: bool,
        declared_at: SourceLocation,
    ) -> String {
        let id = format!("r{}", self.refs.len());
        self.refs.push(RefInfo {
            id: id.clone(),
            name: name.to_string(),
            deep,
            computed,
            declared_at,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&RefInfo> {
        self.refs.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn into_refs(self) -> Vec<RefInfo> {
        self.refs
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCOPE CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered scope stack. Index 0 is the module scope; each function/block pushes
/// a child scope and pops it when its subtree is done.
#[derive(Debug, Default, Clone)]
pub struct ScopeChain {
    scopes: Vec<Vec<Binding>>,
}

impl ScopeChain {
    pub fn new() -> Self {
        ScopeChain {
            scopes: vec![Vec::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn declare(&mut self, binding: Binding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(binding);
        }
    }

    /// Innermost-first resolution; within one scope the latest declaration
    /// shadows earlier ones.
    pub fn resolve(&self, name: &str) -> Option<&Binding> {
        for scope in self.scopes.iter().rev() {
            if let Some(binding) = scope.iter().rev().find(|b| b.name == name) {
                return Some(binding);
            }
        }
        None
    }

    /// Classification per the scope chain, with known globals and framework
    /// helpers as the outermost fallback. `None` means unbound.
    pub fn classify(&self, name: &str) -> Option<BindingKind> {
        if let Some(binding) = self.resolve(name) {
            return Some(binding.kind);
        }
        if KNOWN_GLOBALS.contains(name) || FRAMEWORK_HELPERS.contains(name) {
            return Some(BindingKind::ExternalBinding);
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECLARATION COLLECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Unwraps TS-only expression wrappers and parentheses.
pub fn unwrap_expression<'a, 'b>(expr: &'b Expression<'a>) -> &'b Expression<'a> {
    match expr {
        Expression::TSAsExpression(inner) => unwrap_expression(&inner.expression),
        Expression::TSSatisfiesExpression(inner) => unwrap_expression(&inner.expression),
        Expression::TSNonNullExpression(inner) => unwrap_expression(&inner.expression),
        Expression::ParenthesizedExpression(inner) => unwrap_expression(&inner.expression),
        _ => expr,
    }
}

/// Initializer shape for a declarator, after unwrapping TS sugar.
pub fn classify_init(init: &Expression) -> BindingInit {
    match unwrap_expression(init) {
        Expression::CallExpression(call) => {
            if let Expression::Identifier(callee) = unwrap_expression(&call.callee) {
                let name = callee.name.as_str();
                if VALUE_WRAPPERS.contains(name) {
                    return BindingInit::ReactiveWrapper { deep: false };
                }
                if DEEP_WRAPPERS.contains(name) {
                    return BindingInit::ReactiveWrapper { deep: true };
                }
                if COMPUTED_WRAPPERS.contains(name) {
                    return BindingInit::Computed;
                }
            }
            BindingInit::Other
        }
        Expression::ArrowFunctionExpression(_) | Expression::FunctionExpression(_) => {
            BindingInit::Function
        }
        _ => BindingInit::Other,
    }
}

pub fn collect_pattern_names(pattern: &BindingPattern, names: &mut Vec<(String, Span)>) {
    match pattern {
        BindingPattern::BindingIdentifier(id) => {
            names.push((id.name.to_string(), id.span));
        }
        BindingPattern::ObjectPattern(obj) => {
            for prop in &obj.properties {
                collect_pattern_names(&prop.value, names);
            }
            if let Some(rest) = &obj.rest {
                collect_pattern_names(&rest.argument, names);
            }
        }
        BindingPattern::ArrayPattern(arr) => {
            for elem in arr.elements.iter().flatten() {
                collect_pattern_names(elem, names);
            }
            if let Some(rest) = &arr.rest {
                collect_pattern_names(&rest.argument, names);
            }
        }
        BindingPattern::AssignmentPattern(assign) => {
            collect_pattern_names(&assign.left, names);
        }
    }
}

/// Declares one `const`/`let` declarator into the current scope. A direct
/// reactive-wrapper initializer makes the binding a ref; destructured wrapper
/// results stay plain.
pub fn declare_variable(
    chain: &mut ScopeChain,
    refs: &mut RefTable,
    pattern: &BindingPattern,
    init: Option<&Expression>,
    source: &str,
) {
    if let BindingPattern::BindingIdentifier(id) = pattern {
        let declared_at = SourceLocation::at(source, id.span.start);
        let init_shape = init.map(classify_init).unwrap_or(BindingInit::None);
        let binding = match init_shape {
            BindingInit::ReactiveWrapper { deep } => Binding {
                name: id.name.to_string(),
                kind: BindingKind::ReactiveRef,
                ref_id: Some(refs.alloc(&id.name, deep, false, declared_at.clone())),
                init: init_shape,
                init_span: None,
                reactive_prop: false,
                declared_at,
            },
            BindingInit::Computed => Binding {
                name: id.name.to_string(),
                kind: BindingKind::ReactiveRef,
                ref_id: Some(refs.alloc(&id.name, false, true, declared_at.clone())),
                init: init_shape,
                init_span: None,
                reactive_prop: false,
                declared_at,
            },
            BindingInit::Function => Binding {
                name: id.name.to_string(),
                kind: BindingKind::PlainValue,
                ref_id: None,
                init: init_shape,
                init_span: init.map(|e| unwrap_expression(e).span()),
                reactive_prop: false,
                declared_at,
            },
            _ => Binding {
                name: id.name.to_string(),
                kind: BindingKind::PlainValue,
                ref_id: None,
                init: init_shape,
                init_span: None,
                reactive_prop: false,
                declared_at,
            },
        };
        chain.declare(binding);
        return;
    }

    let mut names = Vec::new();
    collect_pattern_names(pattern, &mut names);
    for (name, span) in names {
        chain.declare(Binding::plain(&name, SourceLocation::at(source, span.start)));
    }
}

fn declare_declaration(
    chain: &mut ScopeChain,
    refs: &mut RefTable,
    decl: &Declaration,
    source: &str,
) {
    match decl {
        Declaration::VariableDeclaration(var) => {
            for declarator in &var.declarations {
                declare_variable(chain, refs, &declarator.id, declarator.init.as_ref(), source);
            }
        }
        Declaration::FunctionDeclaration(func) => {
            if let Some(id) = &func.id {
                let mut binding =
                    Binding::plain(&id.name, SourceLocation::at(source, id.span.start));
                binding.init = BindingInit::Function;
                binding.init_span = Some(func.span);
                chain.declare(binding);
            }
        }
        Declaration::ClassDeclaration(class) => {
            if let Some(id) = &class.id {
                chain.declare(Binding::plain(
                    &id.name,
                    SourceLocation::at(source, id.span.start),
                ));
            }
        }
        Declaration::TSEnumDeclaration(en) => {
            // Enum objects are values; the members resolve through them.
            chain.declare(Binding::plain(
                &en.id.name,
                SourceLocation::at(source, en.id.span.start),
            ));
        }
        // Type-only declarations never produce value bindings.
        _ => {}
    }
}

/// Builds the module scope: imports as external bindings, top-level
/// declarations classified by initializer shape. Type-only imports and
/// declarations are skipped.
pub fn collect_module_scope(program: &Program, refs: &mut RefTable, source: &str) -> ScopeChain {
    let mut chain = ScopeChain::new();

    for stmt in &program.body {
        match stmt {
            Statement::ImportDeclaration(import) => {
                if import.import_kind.is_type() {
                    continue;
                }
                if let Some(specifiers) = &import.specifiers {
                    for specifier in specifiers {
                        match specifier {
                            ImportDeclarationSpecifier::ImportSpecifier(s) => {
                                if s.import_kind.is_type() {
                                    continue;
                                }
                                chain.declare(Binding::external(
                                    &s.local.name,
                                    SourceLocation::at(source, s.local.span.start),
                                ));
                            }
                            ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => {
                                chain.declare(Binding::external(
                                    &s.local.name,
                                    SourceLocation::at(source, s.local.span.start),
                                ));
                            }
                            ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => {
                                chain.declare(Binding::external(
                                    &s.local.name,
                                    SourceLocation::at(source, s.local.span.start),
                                ));
                            }
                        }
                    }
                }
            }
            other => declare_statement(&mut chain, refs, other, source),
        }
    }

    chain
}

/// Declares whatever bindings a single statement introduces into the current
/// scope. Statements that introduce nothing are ignored.
pub fn declare_statement(
    chain: &mut ScopeChain,
    refs: &mut RefTable,
    stmt: &Statement,
    source: &str,
) {
    match stmt {
        Statement::VariableDeclaration(var) => {
            for declarator in &var.declarations {
                declare_variable(chain, refs, &declarator.id, declarator.init.as_ref(), source);
            }
        }
        Statement::FunctionDeclaration(func) => {
            if let Some(id) = &func.id {
                let mut binding =
                    Binding::plain(&id.name, SourceLocation::at(source, id.span.start));
                binding.init = BindingInit::Function;
                binding.init_span = Some(func.span);
                chain.declare(binding);
            }
        }
        Statement::ClassDeclaration(class) => {
            if let Some(id) = &class.id {
                chain.declare(Binding::plain(
                    &id.name,
                    SourceLocation::at(source, id.span.start),
                ));
            }
        }
        Statement::TSEnumDeclaration(en) => {
            chain.declare(Binding::plain(
                &en.id.name,
                SourceLocation::at(source, en.id.span.start),
            ));
        }
        Statement::ExportNamedDeclaration(export) => {
            if let Some(decl) = &export.declaration {
                declare_declaration(chain, refs, decl, source);
            }
        }
        Statement::ExportDefaultDeclaration(_) => {
            // Default exports are anonymous from the scope's point of view;
            // named default-exported templates are picked up by compile.
        }
        _ => {}
    }
}

/// Declares destructured template parameters as component props. Reactive
/// props get a ref id so reads of them participate in dependency sets.
pub fn declare_props_pattern(
    chain: &mut ScopeChain,
    refs: &mut RefTable,
    pattern: &BindingPattern,
    reactive: impl Fn(&str) -> bool,
    source: &str,
) {
    let mut names = Vec::new();
    collect_pattern_names(pattern, &mut names);
    for (name, span) in names {
        let declared_at = SourceLocation::at(source, span.start);
        let is_reactive = reactive(&name);
        let ref_id = if is_reactive {
            Some(refs.alloc(&name, false, false, declared_at.clone()))
        } else {
            None
        };
        chain.declare(Binding {
            name,
            kind: BindingKind::ComponentProp,
            ref_id,
            init: BindingInit::None,
            init_span: None,
            reactive_prop: is_reactive,
            declared_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn module_scope(source: &str) -> (ScopeChain, Vec<RefInfo>) {
        let allocator = Allocator::default();
        let source_type = SourceType::default()
            .with_typescript(true)
            .with_module(true)
            .with_jsx(true);
        let ret = Parser::new(&allocator, source, source_type).parse();
        assert!(ret.errors.is_empty(), "fixture must parse: {:?}", ret.errors);
        let mut refs = RefTable::new();
        let chain = collect_module_scope(&ret.program, &mut refs, source);
        (chain, refs.into_refs())
    }

    #[test]
    fn wrapper_calls_become_reactive_refs() {
        let (chain, refs) = module_scope("const count = $(0);\nconst items = $$([1, 2]);\n");
        assert_eq!(chain.classify("count"), Some(BindingKind::ReactiveRef));
        assert_eq!(chain.classify("items"), Some(BindingKind::ReactiveRef));
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].id, "r0");
        assert_eq!(refs[0].name, "count");
        assert!(!refs[0].deep);
        assert!(refs[1].deep);
    }

    #[test]
    fn computed_wrapper_is_a_derived_ref() {
        let (chain, refs) = module_scope("const label = always(() => 1 + 2);\n");
        assert_eq!(chain.classify("label"), Some(BindingKind::ReactiveRef));
        assert!(refs[0].computed);
    }

    #[test]
    fn imports_resolve_external() {
        let (chain, _) = module_scope("import { helper } from \"./util.ts\";\n");
        assert_eq!(chain.classify("helper"), Some(BindingKind::ExternalBinding));
    }

    #[test]
    fn type_only_imports_are_skipped() {
        let (chain, _) = module_scope("import type { Config } from \"./types.ts\";\n");
        assert_eq!(chain.classify("Config"), None);
    }

    #[test]
    fn globals_fall_back_external() {
        let (chain, _) = module_scope("const x = 1;\n");
        assert_eq!(chain.classify("Math"), Some(BindingKind::ExternalBinding));
        assert_eq!(chain.classify("nowhere"), None);
    }

    #[test]
    fn shadowing_resolves_innermost_first() {
        let (mut chain, _) = module_scope("const value = $(0);\n");
        assert_eq!(chain.classify("value"), Some(BindingKind::ReactiveRef));
        chain.push_scope();
        chain.declare(Binding::plain("value", SourceLocation::default()));
        assert_eq!(chain.classify("value"), Some(BindingKind::PlainValue));
        chain.pop_scope();
        assert_eq!(chain.classify("value"), Some(BindingKind::ReactiveRef));
    }

    #[test]
    fn destructured_wrapper_results_stay_plain() {
        let (chain, refs) = module_scope("const { a, b } = $({ a: 1, b: 2 });\n");
        assert_eq!(chain.classify("a"), Some(BindingKind::PlainValue));
        assert_eq!(chain.classify("b"), Some(BindingKind::PlainValue));
        assert!(refs.is_empty());
    }

    #[test]
    fn function_declarations_keep_their_span() {
        let (chain, _) = module_scope("function helper() { return 1; }\n");
        let binding = chain.resolve("helper").unwrap();
        assert_eq!(binding.init, BindingInit::Function);
        assert!(binding.init_span.is_some());
    }
}
