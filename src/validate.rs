#[cfg(feature = "napi")]
use napi_derive::napi;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const INV_PARSE_FAILED: &str = "TDM-ERR-PARSE-001";
pub const INV_UNBOUND_IDENTIFIER: &str = "TDM-ERR-SCOPE-001";
pub const INV_UNCAPTURABLE_CLOSURE: &str = "TDM-ERR-REALM-001";
pub const INV_UNRESOLVED_EXTERNAL: &str = "TDM-ERR-REALM-002";
pub const INV_CONSTRUCTION_ORDER: &str = "TDM-ERR-CLASS-001";
pub const INV_TEMPLATE_DECORATOR: &str = "TDM-ERR-CLASS-002";
pub const INV_DUPLICATE_CAPTURE: &str = "TDM-INV-CAPTURE-001";
pub const INV_STRATEGY_MISMATCH: &str = "TDM-INV-CAPTURE-002";
pub const INV_EMPTY_DEPENDENCY_SET: &str = "TDM-INV-BIND-001";
pub const INV_UNKNOWN_REF: &str = "TDM-INV-BIND-002";
pub const INV_MALFORMED_BINDING: &str = "TDM-INV-BIND-003";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        INV_PARSE_FAILED => "Template sources parse as TypeScript + JSX modules.",
        INV_UNBOUND_IDENTIFIER => {
            "Every identifier read by a template expression resolves somewhere in the scope chain."
        }
        INV_UNCAPTURABLE_CLOSURE => {
            "Every capture of an alternate-realm handler has a transfer strategy; handlers never throw on missing scope in the remote realm."
        }
        INV_UNRESOLVED_EXTERNAL => {
            "Name-lookup captures resolve in the remote realm's global environment at invocation time."
        }
        INV_CONSTRUCTION_ORDER => {
            "A derived construction step always invokes the base construction step before its own field assignments."
        }
        INV_TEMPLATE_DECORATOR => {
            "The template decorator carries exactly one template function or JSX argument."
        }
        INV_DUPLICATE_CAPTURE => "A capture manifest lists every free identifier exactly once.",
        INV_STRATEGY_MISMATCH => {
            "Transfer strategies agree with capture classifications: refs travel by identity, plain values by copy, externals by name lookup."
        }
        INV_EMPTY_DEPENDENCY_SET => {
            "A binding with no reactive dependencies is a static fragment, compiled once."
        }
        INV_UNKNOWN_REF => "Binding dependency sets reference refs declared in this compilation.",
        INV_MALFORMED_BINDING => {
            "Conditional bindings carry two branch programs; list bindings carry one item program; no other kind carries either."
        }
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
pub struct CompilerError {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, message, file, line, column, None, vec![])
    }

    pub fn with_details(
        code: &str,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        CompilerError {
            code: code.to_string(),
            error_type: "COMPILER_INVARIANT_VIOLATION".to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            file: file.to_string(),
            line,
            column,
            context,
            hints,
        }
    }

    /// Fatal diagnostics flip the overall compilation status; recoverable ones
    /// (unbound identifiers) leave the rest of the template usable.
    pub fn is_fatal(&self) -> bool {
        self.code != INV_UNBOUND_IDENTIFIER
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARTIFACT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    /// 1-based line/column of a byte offset into `source`.
    pub fn at(source: &str, offset: u32) -> Self {
        let offset = (offset as usize).min(source.len());
        let mut line = 1u32;
        let mut column = 1u32;
        for ch in source[..offset].chars() {
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        SourceLocation { line, column }
    }
}

/// Origin of an identifier as resolved by the reference classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BindingKind {
    ReactiveRef,
    PlainValue,
    ComponentProp,
    ExternalBinding,
}

/// How a captured identifier crosses the realm boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStrategy {
    /// Both realms hold a handle to the same logical cell.
    Identity,
    /// Snapshot at compile time; later mutations are not observed remotely.
    Copy,
    /// Resolved in the remote global environment at invocation time.
    NameLookup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RealmTag {
    Default,
    Alternate { name: String },
}

/// A reactive cell declared in the compiled template, identified by declaration
/// site. Dependency sets and identity transfers reference these ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefInfo {
    pub id: String,
    pub name: String,
    /// True for the deep wrapper form (nested object/array mutations tracked).
    pub deep: bool,
    /// True for derived refs (computed wrapper).
    pub computed: bool,
    #[serde(default)]
    pub declared_at: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEntry {
    pub name: String,
    pub classification: BindingKind,
    pub strategy: TransferStrategy,
    /// Assignment or update through this capture inside the handler body.
    pub written: bool,
    #[serde(default)]
    pub declared_at: SourceLocation,
}

/// Ordered free-variable list of a cross-realm closure. Order is first use
/// inside the handler body, so recompiling identical input is byte-stable.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureManifest {
    pub entries: Vec<CaptureEntry>,
}

impl CaptureManifest {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&CaptureEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledClosure {
    pub source: String,
    pub params: Vec<String>,
    pub is_async: bool,
}

/// One alternate-realm handler, ready for delivery: the closure source, the
/// manifest the delivery layer serializes, and the realm it must run in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureArtifact {
    pub handler_id: String,
    pub realm: RealmTag,
    pub closure: CompiledClosure,
    pub manifest: CaptureManifest,
    #[serde(default)]
    pub location: SourceLocation,
    /// True when capture analysis failed and the closure was replaced with a
    /// no-op; the recorded error lives in the compilation diagnostics.
    #[serde(default)]
    pub failed: bool,
}

/// Render kind of a binding record. `Children` is the opaque spread
/// pass-through; it tracks no dependencies of its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RenderKind {
    Text,
    Attribute,
    Conditional,
    List,
    Children,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchPrograms {
    pub consequent: RenderProgram,
    pub alternate: RenderProgram,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemProgram {
    pub item_var: String,
    pub index_var: Option<String>,
    pub program: RenderProgram,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingRecord {
    pub id: String,
    pub kind: RenderKind,
    /// Value of the data-tandem-* anchor attribute this binding attaches to.
    pub anchor: String,
    /// ReactiveRef ids whose version changes trigger re-evaluation. Exact:
    /// never a superset, never a subset of the refs the expression reads.
    pub deps: Vec<String>,
    pub evaluator: String,
    pub is_async: bool,
    #[serde(default)]
    pub location: SourceLocation,
    /// Attribute name, for `Attribute` bindings.
    pub attribute: Option<String>,
    /// Branch sub-programs, for `Conditional` bindings. Switching branches
    /// tears down the active branch's bindings before instantiating the other.
    pub branches: Option<BranchPrograms>,
    /// Per-item sub-program, for `List` bindings. Item identity is reused on
    /// insert/remove when determinable; ordering follows the sequence.
    pub item: Option<ItemProgram>,
}

/// An embedded expression with an empty dependency set: evaluated once at
/// first render, never revisited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticFragment {
    pub id: String,
    pub anchor: String,
    pub evaluator: String,
    pub is_async: bool,
    #[serde(default)]
    pub location: SourceLocation,
}

/// The render program for one template: a skeleton emitted once, plus the
/// bindings and static fragments that attach to its anchors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderProgram {
    pub skeleton: String,
    pub statics: Vec<StaticFragment>,
    pub bindings: Vec<BindingRecord>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPONENT SCHEMA
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropSpec {
    pub name: String,
    pub type_tag: Option<String>,
    /// A prop with a default is optional; one with only a declared type is
    /// required.
    pub optional: bool,
    /// True when the declared default is itself reactive; drives the
    /// component-prop transfer strategy.
    pub reactive: bool,
    pub default_realm_visible: bool,
    /// Source text of the declared default, for the instantiation runtime.
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MangledMember {
    pub original: String,
    pub mangled: String,
    pub is_static: bool,
}

/// Desugared, inheritance-flattened description of a component class. Base
/// schema entries precede derived ones; derived overrides base on collision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSchema {
    pub name: String,
    pub base: Option<String>,
    pub props: Vec<PropSpec>,
    /// Class names whose construction steps run, base first.
    pub construction_chain: Vec<String>,
    pub mangled_members: Vec<MangledMember>,
    #[serde(default)]
    pub location: SourceLocation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILE OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutput {
    pub file_path: String,
    pub program: RenderProgram,
    pub refs: Vec<RefInfo>,
    pub closures: Vec<ClosureArtifact>,
    pub schemas: Vec<ComponentSchema>,
    pub diagnostics: Vec<CompilerError>,
    /// False when any fatal diagnostic was recorded. The program above is
    /// still best-effort usable for the unaffected parts.
    pub ok: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALIDATION FUNCTIONS (Return Option, not Result)
// ═══════════════════════════════════════════════════════════════════════════════

pub fn validate_manifest(manifest: &CaptureManifest, file: &str) -> Option<CompilerError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for entry in &manifest.entries {
        if !seen.insert(entry.name.as_str()) {
            return Some(CompilerError::new(
                INV_DUPLICATE_CAPTURE,
                &format!("Capture \"{}\" listed more than once.", entry.name),
                file,
                entry.declared_at.line,
                entry.declared_at.column,
            ));
        }
        let agrees = match entry.classification {
            BindingKind::ReactiveRef => entry.strategy == TransferStrategy::Identity,
            BindingKind::PlainValue => entry.strategy == TransferStrategy::Copy,
            BindingKind::ExternalBinding => entry.strategy == TransferStrategy::NameLookup,
            BindingKind::ComponentProp => {
                entry.strategy == TransferStrategy::Identity
                    || entry.strategy == TransferStrategy::Copy
            }
        };
        if !agrees {
            return Some(CompilerError::new(
                INV_STRATEGY_MISMATCH,
                &format!(
                    "Capture \"{}\" is {:?} but travels as {:?}.",
                    entry.name, entry.classification, entry.strategy
                ),
                file,
                entry.declared_at.line,
                entry.declared_at.column,
            ));
        }
    }
    None
}

pub fn validate_program(
    program: &RenderProgram,
    known_refs: &HashSet<&str>,
    file: &str,
) -> Option<CompilerError> {
    for binding in &program.bindings {
        // Text and attribute bindings exist only to re-run an expression, so an
        // empty set means the position should have been a static fragment.
        // Conditional and list bindings may carry an empty set when only their
        // sub-programs are reactive; children pass-throughs track nothing.
        let needs_deps = matches!(binding.kind, RenderKind::Text | RenderKind::Attribute);
        if binding.deps.is_empty() && needs_deps {
            return Some(CompilerError::new(
                INV_EMPTY_DEPENDENCY_SET,
                &format!("Binding \"{}\" has no dependencies.", binding.id),
                file,
                binding.location.line,
                binding.location.column,
            ));
        }
        for dep in &binding.deps {
            if !known_refs.contains(dep.as_str()) {
                return Some(CompilerError::new(
                    INV_UNKNOWN_REF,
                    &format!(
                        "Binding \"{}\" depends on undeclared ref \"{}\".",
                        binding.id, dep
                    ),
                    file,
                    binding.location.line,
                    binding.location.column,
                ));
            }
        }
        let shape_ok = match binding.kind {
            RenderKind::Conditional => binding.branches.is_some() && binding.item.is_none(),
            RenderKind::List => binding.item.is_some() && binding.branches.is_none(),
            RenderKind::Attribute => {
                binding.attribute.is_some() && binding.branches.is_none() && binding.item.is_none()
            }
            _ => binding.branches.is_none() && binding.item.is_none(),
        };
        if !shape_ok {
            return Some(CompilerError::new(
                INV_MALFORMED_BINDING,
                &format!("Binding \"{}\" has a malformed {:?} shape.", binding.id, binding.kind),
                file,
                binding.location.line,
                binding.location.column,
            ));
        }
        if let Some(branches) = &binding.branches {
            if let Some(e) = validate_program(&branches.consequent, known_refs, file) {
                return Some(e);
            }
            if let Some(e) = validate_program(&branches.alternate, known_refs, file) {
                return Some(e);
            }
        }
        if let Some(item) = &binding.item {
            if let Some(e) = validate_program(&item.program, known_refs, file) {
                return Some(e);
            }
        }
    }
    None
}

pub fn validate_output(output: &CompileOutput) -> Option<CompilerError> {
    let file = &output.file_path;
    let known_refs: HashSet<&str> = output.refs.iter().map(|r| r.id.as_str()).collect();

    if let Some(e) = validate_program(&output.program, &known_refs, file) {
        return Some(e);
    }
    for artifact in &output.closures {
        if let Some(e) = validate_manifest(&artifact.manifest, file) {
            return Some(e);
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI ENTRY POINT
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
#[napi]
pub fn validate_output_native(output_json: String) -> Option<CompilerError> {
    let output: CompileOutput = match serde_json::from_str(&output_json) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Some(CompilerError::new(
                "PARSE_ERROR",
                &format!("Failed to parse output JSON: {}", e),
                "unknown",
                1,
                1,
            ));
        }
    };

    validate_output(&output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, classification: BindingKind, strategy: TransferStrategy) -> CaptureEntry {
        CaptureEntry {
            name: name.to_string(),
            classification,
            strategy,
            written: false,
            declared_at: SourceLocation::default(),
        }
    }

    fn text_binding(id: &str, deps: &[&str]) -> BindingRecord {
        BindingRecord {
            id: id.to_string(),
            kind: RenderKind::Text,
            anchor: id.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            evaluator: "() => 1".to_string(),
            is_async: false,
            location: SourceLocation::default(),
            attribute: None,
            branches: None,
            item: None,
        }
    }

    #[test]
    fn duplicate_captures_are_rejected() {
        let manifest = CaptureManifest {
            entries: vec![
                entry("count", BindingKind::ReactiveRef, TransferStrategy::Identity),
                entry("count", BindingKind::ReactiveRef, TransferStrategy::Identity),
            ],
        };
        let err = validate_manifest(&manifest, "app.tsx").expect("duplicate must fail");
        assert_eq!(err.code, INV_DUPLICATE_CAPTURE);
    }

    #[test]
    fn strategies_must_agree_with_classification() {
        let manifest = CaptureManifest {
            entries: vec![entry(
                "count",
                BindingKind::ReactiveRef,
                TransferStrategy::Copy,
            )],
        };
        let err = validate_manifest(&manifest, "app.tsx").expect("mismatch must fail");
        assert_eq!(err.code, INV_STRATEGY_MISMATCH);
    }

    #[test]
    fn props_may_travel_by_identity_or_copy() {
        for strategy in [TransferStrategy::Identity, TransferStrategy::Copy] {
            let manifest = CaptureManifest {
                entries: vec![entry("title", BindingKind::ComponentProp, strategy)],
            };
            assert!(validate_manifest(&manifest, "app.tsx").is_none());
        }
    }

    #[test]
    fn text_bindings_need_dependencies() {
        let program = RenderProgram {
            skeleton: "<span data-tandem-text=\"expr_0\"></span>".to_string(),
            statics: vec![],
            bindings: vec![text_binding("expr_0", &[])],
        };
        let err = validate_program(&program, &HashSet::new(), "app.tsx").unwrap();
        assert_eq!(err.code, INV_EMPTY_DEPENDENCY_SET);
    }

    #[test]
    fn conditional_bindings_may_have_empty_deps() {
        let branches = BranchPrograms {
            consequent: RenderProgram {
                skeleton: String::new(),
                statics: vec![],
                bindings: vec![text_binding("expr_1", &["r0"])],
            },
            alternate: RenderProgram::default(),
        };
        let mut binding = text_binding("cond_0", &[]);
        binding.kind = RenderKind::Conditional;
        binding.branches = Some(branches);
        let program = RenderProgram {
            skeleton: "<template data-tandem-cond=\"cond_0\"></template>".to_string(),
            statics: vec![],
            bindings: vec![binding],
        };
        let known: HashSet<&str> = ["r0"].into_iter().collect();
        assert!(validate_program(&program, &known, "app.tsx").is_none());
    }

    #[test]
    fn deps_must_name_declared_refs() {
        let program = RenderProgram {
            skeleton: String::new(),
            statics: vec![],
            bindings: vec![text_binding("expr_0", &["r9"])],
        };
        let err = validate_program(&program, &HashSet::new(), "app.tsx").unwrap();
        assert_eq!(err.code, INV_UNKNOWN_REF);
    }

    #[test]
    fn conditionals_without_branches_are_malformed() {
        let mut binding = text_binding("cond_0", &["r0"]);
        binding.kind = RenderKind::Conditional;
        let program = RenderProgram {
            skeleton: String::new(),
            statics: vec![],
            bindings: vec![binding],
        };
        let known: HashSet<&str> = ["r0"].into_iter().collect();
        let err = validate_program(&program, &known, "app.tsx").unwrap();
        assert_eq!(err.code, INV_MALFORMED_BINDING);
    }

    #[test]
    fn locations_are_one_based() {
        let source = "ab\ncd";
        assert_eq!(SourceLocation::at(source, 0), SourceLocation { line: 1, column: 1 });
        assert_eq!(SourceLocation::at(source, 3), SourceLocation { line: 2, column: 1 });
        assert_eq!(SourceLocation::at(source, 4), SourceLocation { line: 2, column: 2 });
    }

    #[test]
    fn unbound_identifiers_are_the_only_recoverable_code() {
        let recoverable = CompilerError::new(INV_UNBOUND_IDENTIFIER, "x", "app.tsx", 1, 1);
        assert!(!recoverable.is_fatal());
        let fatal = CompilerError::new(INV_UNCAPTURABLE_CLOSURE, "x", "app.tsx", 1, 1);
        assert!(fatal.is_fatal());
    }

    #[test]
    fn artifacts_serialize_camel_case() {
        let artifact = ClosureArtifact {
            handler_id: "h_0".to_string(),
            realm: RealmTag::Alternate {
                name: "frontend".to_string(),
            },
            closure: CompiledClosure {
                source: "() => {}".to_string(),
                params: vec![],
                is_async: false,
            },
            manifest: CaptureManifest::default(),
            location: SourceLocation::default(),
            failed: false,
        };
        let json = serde_json::to_string(&artifact).unwrap();
        assert!(json.contains("\"handlerId\""));
        assert!(json.contains("\"isAsync\""));
        assert!(json.contains("\"kind\":\"alternate\""));
    }
}
