//! Realm splitting for tagged event handlers.
//!
//! Handlers carry their execution realm in the attribute name: `onclick` runs
//! in the default realm alongside the render pass, `onclick:frontend` must run
//! in the alternate realm. Alternate-realm handlers are compiled into a
//! standalone closure plus a capture manifest that names every outer-scope
//! identifier the closure needs, each with a transfer strategy the delivery
//! layer can satisfy without the original lexical scope.

use crate::capture::{analyze_captures, scan_function_at, CaptureScan, HandlerFn, ResolvedCapture};
use crate::codegen;
use crate::scope::{ScopeChain, DEFAULT_REALM_ALIASES};
use crate::validate::{
    BindingKind, CaptureEntry, CaptureManifest, ClosureArtifact, CompiledClosure, CompilerError,
    RealmTag, SourceLocation, TransferStrategy, INV_UNBOUND_IDENTIFIER, INV_UNCAPTURABLE_CLOSURE,
};
use oxc_ast::ast::Expression;
use oxc_span::{GetSpan, Span};
use sha2::{Digest, Sha256};

// ═══════════════════════════════════════════════════════════════════════════════
// REALM TAGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Splits an event-handler attribute name into its base name and realm tag.
/// `onclick` and `onclick:server` stay in the default realm; any other suffix
/// names the alternate realm the handler must execute in.
pub fn parse_realm_tag(attr_name: &str) -> (String, RealmTag) {
    match attr_name.split_once(':') {
        Some((base, suffix)) if !suffix.is_empty() => {
            if DEFAULT_REALM_ALIASES.contains(suffix) {
                (base.to_string(), RealmTag::Default)
            } else {
                (
                    base.to_string(),
                    RealmTag::Alternate {
                        name: suffix.to_string(),
                    },
                )
            }
        }
        _ => (attr_name.to_string(), RealmTag::Default),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER STATES
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of one handler through the splitter. Only `AlternateRealm`
/// handlers move on to `Compiled`; default-realm handlers stay in place and
/// produce no artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerState {
    Unmarked,
    DefaultRealm,
    AlternateRealm { realm: String },
    Compiled,
}

impl HandlerState {
    pub fn mark(tag: &RealmTag) -> HandlerState {
        match tag {
            RealmTag::Default => HandlerState::DefaultRealm,
            RealmTag::Alternate { name } => HandlerState::AlternateRealm {
                realm: name.clone(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLER SPLITTING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct SplitOutcome {
    /// `None` for default-realm handlers.
    pub artifact: Option<ClosureArtifact>,
    pub state: HandlerState,
    pub diagnostics: Vec<CompilerError>,
}

/// Compiles one handler attribute value according to its realm tag.
pub fn split_handler(
    expr: &Expression,
    tag: &RealmTag,
    chain: &ScopeChain,
    source: &str,
    file_path: &str,
) -> SplitOutcome {
    let state = HandlerState::mark(tag);
    if state == HandlerState::DefaultRealm {
        return SplitOutcome {
            artifact: None,
            state,
            diagnostics: Vec::new(),
        };
    }

    let span = expr.span();
    let location = SourceLocation::at(source, span.start);
    let handler_id = handler_id(file_path, span, source);
    let mut diagnostics = Vec::new();

    let (closure, manifest, failed) = match HandlerFn::from_expression(expr) {
        Some(handler) => {
            let scan = analyze_captures(&handler, chain, source);
            let (manifest, failed) =
                resolve_manifest(&scan, chain, source, file_path, &mut diagnostics);
            let params = handler.param_sources(source);
            let closure = if failed {
                codegen::noop_closure(&params)
            } else {
                let names: Vec<String> =
                    manifest.entries.iter().map(|e| e.name.clone()).collect();
                codegen::assemble_closure(&handler, &names, scan.use_span, source)
            };
            (closure, manifest, failed)
        }
        None => compile_delegating_handler(expr, chain, source, file_path, &mut diagnostics),
    };

    SplitOutcome {
        artifact: Some(ClosureArtifact {
            handler_id,
            realm: tag.clone(),
            closure,
            manifest,
            location,
            failed,
        }),
        state: HandlerState::Compiled,
        diagnostics,
    }
}

/// Content-derived handler id, stable across recompilations of identical
/// input.
pub(crate) fn handler_id(file_path: &str, span: Span, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update(b":");
    hasher.update(span.start.to_le_bytes());
    hasher.update(b":");
    let end = (span.end as usize).min(source.len());
    hasher.update(&source.as_bytes()[(span.start as usize).min(end)..end]);
    let digest = format!("{:x}", hasher.finalize());
    format!("h_{}", &digest[..16])
}

/// A handler attribute referencing a named function instead of holding a
/// literal one compiles to a delegating closure over a single forced capture:
/// `{save}` becomes `(...args) => save(...args)` with `save` in the manifest.
fn compile_delegating_handler(
    expr: &Expression,
    chain: &ScopeChain,
    source: &str,
    file_path: &str,
    diagnostics: &mut Vec<CompilerError>,
) -> (CompiledClosure, CaptureManifest, bool) {
    let span = expr.span();
    if let Expression::Identifier(ident) = crate::scope::unwrap_expression(expr) {
        let raw = lookup_named_handler(ident.name.as_str(), ident.span, chain, source);
        let mut failed = false;
        let entry = resolve_entry(&raw, false, chain, source, file_path, &mut failed, diagnostics);
        let manifest = CaptureManifest {
            entries: vec![entry],
        };
        let closure = if failed {
            codegen::noop_closure(&[])
        } else {
            CompiledClosure {
                source: format!(
                    "(...args) => {{\n  __capture({});\n  return {}(...args);\n}}",
                    ident.name, ident.name
                ),
                params: Vec::new(),
                is_async: false,
            }
        };
        return (closure, manifest, failed);
    }

    let location = SourceLocation::at(source, span.start);
    diagnostics.push(CompilerError::new(
        INV_UNCAPTURABLE_CLOSURE,
        "Handler must be a function literal or the name of one; a computed handler expression cannot cross the realm boundary",
        file_path,
        location.line,
        location.column,
    ));
    (codegen::noop_closure(&[]), CaptureManifest::default(), true)
}

fn lookup_named_handler(
    name: &str,
    use_span: Span,
    chain: &ScopeChain,
    source: &str,
) -> ResolvedCapture {
    let first_used_at = SourceLocation::at(source, use_span.start);
    if let Some(binding) = chain.resolve(name) {
        return ResolvedCapture {
            name: name.to_string(),
            kind: Some(binding.kind),
            written: false,
            first_used_at,
            declared_at: binding.declared_at.clone(),
            ref_id: binding.ref_id.clone(),
            reactive_prop: binding.reactive_prop,
            is_function_value: binding.init == crate::scope::BindingInit::Function,
            init_span: binding.init_span,
        };
    }
    ResolvedCapture {
        name: name.to_string(),
        kind: None,
        written: false,
        first_used_at,
        declared_at: SourceLocation::default(),
        ref_id: None,
        reactive_prop: false,
        is_function_value: false,
        init_span: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFER STRATEGIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves every capture of a scan into a manifest entry. Returns the
/// manifest plus whether the handler failed and must be replaced with a no-op.
fn resolve_manifest(
    scan: &CaptureScan,
    chain: &ScopeChain,
    source: &str,
    file_path: &str,
    diagnostics: &mut Vec<CompilerError>,
) -> (CaptureManifest, bool) {
    let mut failed = false;
    let mut entries = Vec::with_capacity(scan.captures.len());
    for capture in &scan.captures {
        entries.push(resolve_entry(
            capture,
            scan.silent,
            chain,
            source,
            file_path,
            &mut failed,
            diagnostics,
        ));
    }
    (CaptureManifest { entries }, failed)
}

fn resolve_entry(
    capture: &ResolvedCapture,
    silent: bool,
    chain: &ScopeChain,
    source: &str,
    file_path: &str,
    failed: &mut bool,
    diagnostics: &mut Vec<CompilerError>,
) -> CaptureEntry {
    let (classification, strategy) = match capture.kind {
        Some(BindingKind::ReactiveRef) => (BindingKind::ReactiveRef, TransferStrategy::Identity),
        Some(BindingKind::ExternalBinding) => {
            // Resolution happens remotely; absence there raises
            // UnresolvedExternalBindingError at invocation time, never here.
            (BindingKind::ExternalBinding, TransferStrategy::NameLookup)
        }
        Some(BindingKind::ComponentProp) => {
            if capture.name == "this" {
                (BindingKind::ComponentProp, TransferStrategy::Identity)
            } else if capture.reactive_prop {
                (BindingKind::ReactiveRef, TransferStrategy::Identity)
            } else {
                (BindingKind::PlainValue, TransferStrategy::Copy)
            }
        }
        Some(BindingKind::PlainValue) => {
            if capture.is_function_value && !function_is_transferable(capture, chain, source) {
                *failed = true;
                diagnostics.push(CompilerError::with_details(
                    INV_UNCAPTURABLE_CLOSURE,
                    &format!(
                        "Captured function '{}' closes over state that cannot cross the realm boundary",
                        capture.name
                    ),
                    file_path,
                    capture.declared_at.line,
                    capture.declared_at.column,
                    Some(format!("captured as '{}'", capture.name)),
                    vec![format!(
                        "Move '{}' fully into the handler body, or rewrite it to use only globals",
                        capture.name
                    )],
                ));
            }
            (BindingKind::PlainValue, TransferStrategy::Copy)
        }
        None => {
            if !silent {
                diagnostics.push(CompilerError::new(
                    INV_UNBOUND_IDENTIFIER,
                    &format!("'{}' is not defined in the template scope", capture.name),
                    file_path,
                    capture.first_used_at.line,
                    capture.first_used_at.column,
                ));
            }
            (BindingKind::ExternalBinding, TransferStrategy::NameLookup)
        }
    };

    CaptureEntry {
        name: capture.name.clone(),
        classification,
        strategy,
        written: capture.written,
        declared_at: capture.declared_at.clone(),
    }
}

/// A captured function travels by source copy, so it is transferable only
/// when every free variable of its own body resolves externally. Template
/// state it closes over would be dangling in the remote realm.
fn function_is_transferable(capture: &ResolvedCapture, chain: &ScopeChain, source: &str) -> bool {
    let span = match capture.init_span {
        Some(span) => span,
        None => return false,
    };
    match scan_function_at(span, chain, source) {
        Some(inner) => inner
            .captures
            .iter()
            .all(|c| c.kind == Some(BindingKind::ExternalBinding)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{collect_module_scope, RefTable};
    use oxc_allocator::Allocator;
    use oxc_ast::ast::{BindingPattern, Program, Statement};
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn with_fixture<T>(source: &str, f: impl FnOnce(&Program, &ScopeChain, &str) -> T) -> T {
        let allocator = Allocator::default();
        let source_type = SourceType::default()
            .with_typescript(true)
            .with_module(true)
            .with_jsx(true);
        let ret = Parser::new(&allocator, source, source_type).parse();
        assert!(ret.errors.is_empty(), "fixture must parse: {:?}", ret.errors);
        let mut refs = RefTable::new();
        let chain = collect_module_scope(&ret.program, &mut refs, source);
        f(&ret.program, &chain, source)
    }

    fn expr_named<'a, 'b>(
        program: &'b Program<'a>,
        name: &str,
    ) -> &'b oxc_ast::ast::Expression<'a> {
        for stmt in &program.body {
            if let Statement::VariableDeclaration(var) = stmt {
                for decl in &var.declarations {
                    if let BindingPattern::BindingIdentifier(id) = &decl.id {
                        if id.name == name {
                            return decl.init.as_ref().expect("fixture binding needs an init");
                        }
                    }
                }
            }
        }
        panic!("fixture has no binding named {}", name);
    }

    fn frontend() -> RealmTag {
        RealmTag::Alternate {
            name: "frontend".to_string(),
        }
    }

    #[test]
    fn default_realm_handlers_produce_no_artifact() {
        let source = "const count = $(0);\nconst handler = () => count.val++;\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &RealmTag::Default,
                chain,
                source,
                "app.tsx",
            );
            assert!(outcome.artifact.is_none());
            assert_eq!(outcome.state, HandlerState::DefaultRealm);
            assert!(outcome.diagnostics.is_empty());
        });
    }

    #[test]
    fn ref_writes_transfer_by_identity() {
        let source = "const count = $(0);\nconst handler = () => count.val++;\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.expect("alternate handler compiles");
            assert_eq!(outcome.state, HandlerState::Compiled);
            assert!(!artifact.failed);
            assert_eq!(artifact.realm, frontend());
            assert!(artifact.handler_id.starts_with("h_"));

            let entry = artifact.manifest.get("count").expect("count captured");
            assert_eq!(entry.classification, BindingKind::ReactiveRef);
            assert_eq!(entry.strategy, TransferStrategy::Identity);
            assert!(entry.written);
            assert!(artifact.closure.source.contains("__capture(count)"));
        });
    }

    #[test]
    fn plain_values_transfer_by_copy() {
        let source = "const step = 2;\nconst count = $(0);\n\
                      const handler = () => { count.val += step; };\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.unwrap();
            let entry = artifact.manifest.get("step").unwrap();
            assert_eq!(entry.classification, BindingKind::PlainValue);
            assert_eq!(entry.strategy, TransferStrategy::Copy);
            assert!(!entry.written);
        });
    }

    #[test]
    fn globals_transfer_by_name_lookup() {
        let source = "const handler = () => console.log(1);\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.unwrap();
            let entry = artifact.manifest.get("console").unwrap();
            assert_eq!(entry.classification, BindingKind::ExternalBinding);
            assert_eq!(entry.strategy, TransferStrategy::NameLookup);
        });
    }

    #[test]
    fn unbound_names_degrade_with_a_diagnostic() {
        let source = "const handler = () => missing();\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.unwrap();
            assert!(!artifact.failed, "unbound names are recoverable");
            let entry = artifact.manifest.get("missing").unwrap();
            assert_eq!(entry.strategy, TransferStrategy::NameLookup);
            assert_eq!(outcome.diagnostics.len(), 1);
            assert_eq!(outcome.diagnostics[0].code, INV_UNBOUND_IDENTIFIER);
        });
    }

    #[test]
    fn silent_errors_suppresses_unbound_diagnostics() {
        let source = "const handler = () => { use(\"silent-errors\"); missing(); };\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.unwrap();
            assert!(outcome.diagnostics.is_empty());
            let entry = artifact.manifest.get("missing").unwrap();
            assert_eq!(entry.strategy, TransferStrategy::NameLookup);
        });
    }

    #[test]
    fn functions_over_template_state_are_uncapturable() {
        let source = "const secret = $(1);\nconst leak = () => secret.val;\n\
                      const handler = () => leak();\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.unwrap();
            assert!(artifact.failed);
            assert_eq!(artifact.closure.source, "() => {}");
            assert_eq!(outcome.diagnostics.len(), 1);
            assert_eq!(outcome.diagnostics[0].code, INV_UNCAPTURABLE_CLOSURE);
            assert_eq!(outcome.diagnostics[0].line, 2, "reported at the declaration site");
        });
    }

    #[test]
    fn functions_over_globals_travel_by_copy() {
        let source = "const beep = () => console.log(\"beep\");\n\
                      const handler = () => beep();\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.unwrap();
            assert!(!artifact.failed);
            let entry = artifact.manifest.get("beep").unwrap();
            assert_eq!(entry.strategy, TransferStrategy::Copy);
        });
    }

    #[test]
    fn named_handlers_delegate_through_a_forced_capture() {
        let source = "const save = () => console.log(\"saved\");\n\
                      const handler = save;\n";
        with_fixture(source, |program, chain, source| {
            let outcome = split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            );
            let artifact = outcome.artifact.unwrap();
            assert!(!artifact.failed);
            assert_eq!(artifact.manifest.names(), vec!["save"]);
            assert!(artifact.closure.source.contains("save(...args)"));
        });
    }

    #[test]
    fn identical_input_yields_identical_handler_ids() {
        let source = "const count = $(0);\nconst handler = () => count.val++;\n";
        let first = with_fixture(source, |program, chain, source| {
            split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            )
            .artifact
            .unwrap()
            .handler_id
        });
        let second = with_fixture(source, |program, chain, source| {
            split_handler(
                expr_named(program, "handler"),
                &frontend(),
                chain,
                source,
                "app.tsx",
            )
            .artifact
            .unwrap()
            .handler_id
        });
        assert_eq!(first, second);
    }

    #[test]
    fn attribute_suffix_selects_the_realm() {
        let (base, tag) = parse_realm_tag("onclick:frontend");
        assert_eq!(base, "onclick");
        assert_eq!(
            tag,
            RealmTag::Alternate {
                name: "frontend".to_string()
            }
        );

        let (base, tag) = parse_realm_tag("onclick");
        assert_eq!(base, "onclick");
        assert_eq!(tag, RealmTag::Default);

        let (base, tag) = parse_realm_tag("onsubmit:server");
        assert_eq!(base, "onsubmit");
        assert_eq!(tag, RealmTag::Default);
    }

    #[test]
    fn marking_follows_the_tag() {
        assert_eq!(
            HandlerState::mark(&RealmTag::Default),
            HandlerState::DefaultRealm
        );
        assert_eq!(
            HandlerState::mark(&RealmTag::Alternate {
                name: "frontend".to_string()
            }),
            HandlerState::AlternateRealm {
                realm: "frontend".to_string()
            }
        );
    }
}
