//! Pipeline orchestration: source text in, `CompileOutput` out.
//!
//! One compilation parses a TSX module, desugars its component classes in
//! statement order, discovers its template functions, and binds each template
//! against the module scope. The first template in the file provides the
//! render program; every template contributes closures and diagnostics, and
//! every successfully desugared class contributes a schema.

#[cfg(feature = "napi")]
use napi_derive::napi;
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    BindingPattern, Class, Declaration, ExportDefaultDeclarationKind, Expression, Program,
    Statement, VariableDeclaration,
};
use oxc_parser::Parser;
use oxc_span::SourceType;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::bind::{bind_template, contains_jsx, BindResult};
use crate::cache::IncrementalCache;
use crate::capture::HandlerFn;
use crate::desugar::{declare_schema_props, desugar_class, DecoratorNames, TemplateSource};
use crate::scope::{
    classify_init, collect_module_scope, collect_pattern_names, declare_props_pattern,
    declare_statement, BindingInit, RefTable, ScopeChain,
};
use crate::validate::{
    validate_output, CompileOutput, CompilerError, ComponentSchema, RenderProgram, SourceLocation,
    INV_PARSE_FAILED, INV_TEMPLATE_DECORATOR,
};

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-run compile options, deserialized from the build tooling's config.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    /// Decorator naming a class's template argument. Defaults to `template`.
    pub template_decorator: Option<String>,
    /// Decorator marking schema fields. Defaults to `property`.
    pub property_decorator: Option<String>,
}

impl CompileOptions {
    fn decorator_names(&self) -> DecoratorNames {
        let mut names = DecoratorNames::default();
        if let Some(template) = &self.template_decorator {
            names.template = template.clone();
        }
        if let Some(property) = &self.property_decorator {
            names.property = property.clone();
        }
        names
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SINGLE-FILE COMPILATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Compiles one module's source text. Parse failures yield an empty program
/// with fatal diagnostics; everything after the parse is collected
/// best-effort so one run reports all independent defects.
pub fn compile_source(source: &str, file_path: &str, options: &CompileOptions) -> CompileOutput {
    let allocator = Allocator::default();
    let source_type = SourceType::default()
        .with_typescript(true)
        .with_module(true)
        .with_jsx(true);
    let ret = Parser::new(&allocator, source, source_type).parse();

    if !ret.errors.is_empty() {
        let diagnostics = ret
            .errors
            .iter()
            .map(|error| {
                CompilerError::new(INV_PARSE_FAILED, &error.to_string(), file_path, 1, 1)
            })
            .collect();
        return CompileOutput {
            file_path: file_path.to_string(),
            program: RenderProgram::default(),
            refs: Vec::new(),
            closures: Vec::new(),
            schemas: Vec::new(),
            diagnostics,
            ok: false,
        };
    }

    compile_program(&ret.program, source, file_path, options)
}

fn compile_program(
    module: &Program,
    source: &str,
    file_path: &str,
    options: &CompileOptions,
) -> CompileOutput {
    let names = options.decorator_names();
    let mut refs = RefTable::new();
    let chain = collect_module_scope(module, &mut refs, source);

    let mut known: HashMap<String, ComponentSchema> = HashMap::new();
    let mut schemas = Vec::new();
    let mut closures = Vec::new();
    let mut diagnostics = Vec::new();
    let mut render_program: Option<RenderProgram> = None;

    for stmt in &module.body {
        if let Some(class) = class_of_statement(stmt) {
            let Some(desugared) = desugar_class(class, &known, &names, source, file_path) else {
                continue;
            };
            diagnostics.extend(desugared.diagnostics);
            let Some(schema) = desugared.schema else {
                // Construction-order failure: no schema, and the class's
                // template has no prop scope to bind against.
                continue;
            };
            if let Some(template) = &desugared.template {
                match bind_class_template(template, &schema, &chain, &mut refs, source, file_path)
                {
                    Ok(result) => {
                        closures.extend(result.closures);
                        diagnostics.extend(result.diagnostics);
                        if render_program.is_none() {
                            render_program = Some(result.program);
                        }
                    }
                    Err(error) => diagnostics.push(error),
                }
            }
            known.insert(schema.name.clone(), schema.clone());
            schemas.push(schema);
            continue;
        }

        for handler in template_candidates(stmt) {
            let Some(root) = template_root(&handler) else {
                continue;
            };
            let result = bind_plain_template(&handler, root, &chain, &mut refs, source, file_path);
            closures.extend(result.closures);
            diagnostics.extend(result.diagnostics);
            if render_program.is_none() {
                render_program = Some(result.program);
            }
        }
    }

    let mut output = CompileOutput {
        file_path: file_path.to_string(),
        program: render_program.unwrap_or_default(),
        refs: refs.into_refs(),
        closures,
        schemas,
        diagnostics,
        ok: true,
    };
    if let Some(error) = validate_output(&output) {
        output.diagnostics.push(error);
    }
    output.ok = !output.diagnostics.iter().any(|d| d.is_fatal());
    output
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPLATE DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

fn class_of_statement<'a, 'b>(stmt: &'b Statement<'a>) -> Option<&'b Class<'a>> {
    match stmt {
        Statement::ClassDeclaration(class) => Some(class),
        Statement::ExportNamedDeclaration(export) => match &export.declaration {
            Some(Declaration::ClassDeclaration(class)) => Some(class),
            _ => None,
        },
        Statement::ExportDefaultDeclaration(export) => match &export.declaration {
            ExportDefaultDeclarationKind::ClassDeclaration(class) => Some(class),
            _ => None,
        },
        _ => None,
    }
}

/// Functions this statement puts in template position: declarations,
/// const-bound arrows, and their export-wrapped forms. Whether one actually
/// is a template depends on `template_root`.
fn template_candidates<'a, 'b>(stmt: &'b Statement<'a>) -> Vec<HandlerFn<'a, 'b>> {
    match stmt {
        Statement::FunctionDeclaration(func) => vec![HandlerFn::Function(func)],
        Statement::VariableDeclaration(var) => declarator_functions(var),
        Statement::ExportNamedDeclaration(export) => match &export.declaration {
            Some(Declaration::FunctionDeclaration(func)) => vec![HandlerFn::Function(func)],
            Some(Declaration::VariableDeclaration(var)) => declarator_functions(var),
            _ => Vec::new(),
        },
        Statement::ExportDefaultDeclaration(export) => match &export.declaration {
            ExportDefaultDeclarationKind::FunctionDeclaration(func) => {
                vec![HandlerFn::Function(func)]
            }
            other => other
                .as_expression()
                .and_then(HandlerFn::from_expression)
                .into_iter()
                .collect(),
        },
        _ => Vec::new(),
    }
}

fn declarator_functions<'a, 'b>(var: &'b VariableDeclaration<'a>) -> Vec<HandlerFn<'a, 'b>> {
    var.declarations
        .iter()
        .filter_map(|declarator| declarator.init.as_ref())
        .filter_map(HandlerFn::from_expression)
        .collect()
}

/// The returned markup of a template function: an expression body containing
/// JSX, or the argument of the first top-level `return` that does. `None`
/// means the function is not a template.
fn template_root<'a, 'b>(handler: &HandlerFn<'a, 'b>) -> Option<&'b Expression<'a>> {
    if let Some(expr) = handler.expression_body() {
        return contains_jsx(expr).then_some(expr);
    }
    for stmt in handler.body_statements() {
        if let Statement::ReturnStatement(ret) = stmt {
            if let Some(argument) = &ret.argument {
                if contains_jsx(argument) {
                    return Some(argument);
                }
            }
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPLATE SCOPE SETUP
// ═══════════════════════════════════════════════════════════════════════════════

fn bind_plain_template(
    handler: &HandlerFn,
    root: &Expression,
    chain: &ScopeChain,
    refs: &mut RefTable,
    source: &str,
    file_path: &str,
) -> BindResult {
    let mut scope = chain.clone();
    scope.push_scope();
    for pattern in handler_param_patterns(handler) {
        let mut reactive_names = HashSet::new();
        reactive_default_names(pattern, &mut reactive_names);
        declare_props_pattern(
            &mut scope,
            refs,
            pattern,
            |name| reactive_names.contains(name),
            source,
        );
    }
    for stmt in handler.body_statements() {
        declare_statement(&mut scope, refs, stmt, source);
    }
    bind_template(root, &scope, source, file_path)
}

/// Binds a class template against its schema. A template function with
/// parameters takes its prop names from the destructuring (reactivity still
/// comes from the schema); a parameterless one sees every schema prop by
/// name, as does bare markup.
fn bind_class_template(
    template: &TemplateSource,
    schema: &ComponentSchema,
    chain: &ScopeChain,
    refs: &mut RefTable,
    source: &str,
    file_path: &str,
) -> Result<BindResult, CompilerError> {
    let mut scope = chain.clone();
    scope.push_scope();
    match template {
        TemplateSource::Markup(root) => {
            declare_schema_props(&mut scope, refs, schema);
            Ok(bind_template(root, &scope, source, file_path))
        }
        TemplateSource::Function(handler) => {
            let patterns = handler_param_patterns(handler);
            if patterns.is_empty() {
                declare_schema_props(&mut scope, refs, schema);
            } else {
                for pattern in patterns {
                    declare_props_pattern(
                        &mut scope,
                        refs,
                        pattern,
                        |name| schema.props.iter().any(|p| p.name == name && p.reactive),
                        source,
                    );
                }
            }
            for stmt in handler.body_statements() {
                declare_statement(&mut scope, refs, stmt, source);
            }
            match template_root(handler) {
                Some(root) => Ok(bind_template(root, &scope, source, file_path)),
                None => {
                    let location = SourceLocation::at(source, handler.span().start);
                    Err(CompilerError::new(
                        INV_TEMPLATE_DECORATOR,
                        &format!("Template function of \"{}\" never returns markup.", schema.name),
                        file_path,
                        location.line,
                        location.column,
                    ))
                }
            }
        }
    }
}

fn handler_param_patterns<'a, 'b>(handler: &HandlerFn<'a, 'b>) -> Vec<&'b BindingPattern<'a>> {
    let params = match handler {
        HandlerFn::Arrow(arrow) => &arrow.params,
        HandlerFn::Function(func) => &func.params,
    };
    params.items.iter().map(|item| &item.pattern).collect()
}

/// Names bound with a reactive-wrapper default (`{ x = $(0) }`), which makes
/// the prop a reactive ref at every use site in the template.
fn reactive_default_names(pattern: &BindingPattern, out: &mut HashSet<String>) {
    match pattern {
        BindingPattern::AssignmentPattern(assign) => {
            let shape = classify_init(&assign.right);
            if matches!(
                shape,
                BindingInit::ReactiveWrapper { .. } | BindingInit::Computed
            ) {
                let mut names = Vec::new();
                collect_pattern_names(&assign.left, &mut names);
                for (name, _) in names {
                    out.insert(name);
                }
            } else {
                reactive_default_names(&assign.left, out);
            }
        }
        BindingPattern::ObjectPattern(obj) => {
            for prop in &obj.properties {
                reactive_default_names(&prop.value, out);
            }
            if let Some(rest) = &obj.rest {
                reactive_default_names(&rest.argument, out);
            }
        }
        BindingPattern::ArrayPattern(array) => {
            for element in array.elements.iter().flatten() {
                reactive_default_names(element, out);
            }
        }
        BindingPattern::BindingIdentifier(_) => {}
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BATCH COMPILATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Compiles one file through the incremental cache.
pub fn compile_file(path: &Path, options: &CompileOptions, cache: &IncrementalCache) -> CompileOutput {
    let file_path = path.to_string_lossy().to_string();
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            let error = CompilerError::new(
                INV_PARSE_FAILED,
                &format!("Failed to read {}: {}", file_path, e),
                &file_path,
                1,
                1,
            );
            return CompileOutput {
                file_path,
                program: RenderProgram::default(),
                refs: Vec::new(),
                closures: Vec::new(),
                schemas: Vec::new(),
                diagnostics: vec![error],
                ok: false,
            };
        }
    };

    // Options are part of the cache key so a decorator rename invalidates
    // entries compiled under the old name.
    let keyed = format!(
        "{}\n{}",
        serde_json::to_string(options).unwrap_or_default(),
        source
    );
    if let Some(hit) = cache.get(&file_path, &keyed) {
        return hit;
    }
    let output = compile_source(&source, &file_path, options);
    cache.set(&file_path, &keyed, &output);
    output
}

/// Compiles a batch of files in parallel. Each compilation owns its scope
/// chain and ref table, so units never contend.
pub fn compile_many(paths: &[PathBuf], options: &CompileOptions) -> Vec<CompileOutput> {
    let cache = IncrementalCache::new();
    paths
        .par_iter()
        .map(|path| compile_file(path, options, &cache))
        .collect()
}

/// Recursively compiles every `.tsx`/`.jsx` file under `root`.
pub fn compile_dir(root: &Path, options: &CompileOptions) -> Vec<CompileOutput> {
    compile_many(&find_template_files(root), options)
}

fn find_template_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(true) {
        if let Ok(entry) = entry {
            let path = entry.path();
            if path.is_file() {
                if let Some(ext) = path.extension() {
                    if ext == "tsx" || ext == "jsx" {
                        files.push(path.to_path_buf());
                    }
                }
            }
        }
    }

    files
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
#[napi]
pub fn compile_source_native(
    source: String,
    file_path: String,
    options_json: Option<String>,
) -> serde_json::Value {
    let options = parse_options(options_json.as_deref());
    serde_json::to_value(compile_source(&source, &file_path, &options))
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(feature = "napi")]
#[napi]
pub fn compile_many_native(paths: Vec<String>, options_json: Option<String>) -> serde_json::Value {
    let options = parse_options(options_json.as_deref());
    let paths: Vec<PathBuf> = paths.into_iter().map(PathBuf::from).collect();
    serde_json::to_value(compile_many(&paths, &options)).unwrap_or(serde_json::Value::Null)
}

#[cfg(feature = "napi")]
fn parse_options(raw: Option<&str>) -> CompileOptions {
    raw.and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{
        RealmTag, INV_CONSTRUCTION_ORDER, INV_UNBOUND_IDENTIFIER,
    };
    use std::env;

    fn compile(source: &str) -> CompileOutput {
        compile_source(source, "test.tsx", &CompileOptions::default())
    }

    fn strip_locations(program: &mut RenderProgram) {
        for fragment in &mut program.statics {
            fragment.location = SourceLocation::default();
        }
        for binding in &mut program.bindings {
            binding.location = SourceLocation::default();
            if let Some(branches) = &mut binding.branches {
                strip_locations(&mut branches.consequent);
                strip_locations(&mut branches.alternate);
            }
            if let Some(item) = &mut binding.item {
                strip_locations(&mut item.program);
            }
        }
    }

    #[test]
    fn options_deserialize_with_camel_case_names() {
        let options: CompileOptions =
            serde_json::from_str(r#"{"templateDecorator":"view"}"#).unwrap();
        assert_eq!(options.template_decorator.as_deref(), Some("view"));
        assert!(options.property_decorator.is_none());

        let names = options.decorator_names();
        assert_eq!(names.template, "view");
        assert_eq!(names.property, "property");
    }

    #[test]
    fn parse_failures_are_fatal_for_the_file() {
        let output = compile("const = ;");
        assert!(!output.ok);
        assert!(!output.diagnostics.is_empty());
        assert_eq!(output.diagnostics[0].code, INV_PARSE_FAILED);
        assert!(output.program.skeleton.is_empty());
    }

    #[test]
    fn function_declarations_with_reactive_props_compile() {
        let output =
            compile(r#"function App({ count = $(0) }) { return <p>{count.val}</p>; }"#);
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        assert_eq!(output.program.bindings.len(), 1);
        assert_eq!(output.program.bindings[0].deps, vec!["r0"]);
        assert_eq!(output.refs.len(), 1);
        assert_eq!(output.refs[0].name, "count");
    }

    #[test]
    fn local_reactive_declarations_join_dependency_sets() {
        let output = compile(
            r#"function Counter() {
  const count = $(0);
  return <button>{count.val}</button>;
}"#,
        );
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        assert_eq!(output.refs.len(), 1);
        assert_eq!(output.refs[0].name, "count");
        assert_eq!(output.program.bindings[0].deps, vec!["r0"]);
    }

    #[test]
    fn export_default_arrow_templates_compile() {
        let output = compile(r#"export default ({ msg = $("hi") }) => <h1>{msg.val}</h1>;"#);
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        assert_eq!(output.program.bindings.len(), 1);
    }

    #[test]
    fn imports_resolve_as_externals() {
        let output = compile(
            r#"import { fmt } from "./fmt";
const App = ({ n = $(0) }) => <p>{fmt(n.val)}</p>;"#,
        );
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        assert_eq!(output.program.bindings.len(), 1);
        assert!(output.program.bindings[0].evaluator.contains("fmt("));
    }

    #[test]
    fn unbound_identifiers_do_not_fail_the_file() {
        let output = compile(r#"const App = () => <p>{mystery}</p>;"#);
        assert!(output.ok);
        assert_eq!(output.diagnostics.len(), 1);
        assert_eq!(output.diagnostics[0].code, INV_UNBOUND_IDENTIFIER);
        assert!(output.program.bindings.is_empty());
        assert_eq!(output.program.skeleton, "<p></p>");
    }

    #[test]
    fn desugared_and_handwritten_templates_agree() {
        let class_output = compile(
            r#"@template(({ label = $("") }) => <button>{label.val}</button>)
class Chip {
  @property label = $("");
}"#,
        );
        let plain_output =
            compile(r#"const Chip = ({ label = $("") }) => <button>{label.val}</button>;"#);

        assert!(class_output.ok, "diagnostics: {:?}", class_output.diagnostics);
        assert!(plain_output.ok, "diagnostics: {:?}", plain_output.diagnostics);

        let mut from_class = class_output.program;
        let mut from_plain = plain_output.program;
        strip_locations(&mut from_class);
        strip_locations(&mut from_plain);
        assert_eq!(from_class, from_plain);
    }

    #[test]
    fn class_components_bundle_schema_and_program() {
        let output = compile(
            r#"@template(() => <section>{title.val}</section>)
class Panel {
  @property title = $("untitled");
  @property width: number;
}"#,
        );
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        assert_eq!(output.schemas.len(), 1);
        assert_eq!(output.schemas[0].props.len(), 2);
        assert_eq!(output.schemas[0].construction_chain, vec!["Panel"]);
        assert_eq!(output.program.bindings.len(), 1);
        assert_eq!(output.program.bindings[0].deps, vec!["r0"]);
    }

    #[test]
    fn first_template_claims_the_program_slot() {
        let output = compile(
            r#"const First = ({ a = $(1) }) => <p>{a.val}</p>;
const Second = ({ b = $(2) }) => <div onclick:frontend={() => b.val++}>{b.val}</div>;"#,
        );
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        assert!(output.program.skeleton.starts_with("<p>"));
        assert_eq!(output.refs.len(), 2);
        assert_eq!(output.closures.len(), 1);
        assert_eq!(
            output.closures[0].realm,
            RealmTag::Alternate {
                name: "frontend".to_string()
            }
        );
    }

    #[test]
    fn failed_construction_keeps_other_classes_compiling() {
        let output = compile(
            r#"class Base {
  @property id = 0;
}
class Broken extends Base {
  @property extra = 0;
  constructor() { this.extra = 1; }
}"#,
        );
        assert!(!output.ok);
        assert_eq!(output.schemas.len(), 1);
        assert_eq!(output.schemas[0].name, "Base");
        assert!(output
            .diagnostics
            .iter()
            .any(|d| d.code == INV_CONSTRUCTION_ORDER));
    }

    #[test]
    fn decorator_names_can_be_remapped() {
        let options = CompileOptions {
            template_decorator: Some("view".to_string()),
            property_decorator: Some("field".to_string()),
        };
        let output = compile_source(
            r#"@view(() => <em>{note.val}</em>)
class Note {
  @field note = $("");
}"#,
            "test.tsx",
            &options,
        );
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        assert_eq!(output.schemas.len(), 1);
        assert_eq!(output.program.bindings.len(), 1);
    }

    #[test]
    fn missing_files_report_read_failures() {
        let dir = env::temp_dir().join(format!("tandem-compile-missing-{}", std::process::id()));
        let cache = IncrementalCache::with_dir(dir.clone());

        let output = compile_file(
            Path::new("/definitely/not/here.tsx"),
            &CompileOptions::default(),
            &cache,
        );
        assert!(!output.ok);
        assert_eq!(output.diagnostics[0].code, INV_PARSE_FAILED);
        assert!(output.diagnostics[0].message.contains("Failed to read"));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn template_files_are_discovered_recursively() {
        let root = env::temp_dir().join(format!("tandem-compile-walk-{}", std::process::id()));
        fs::create_dir_all(root.join("pages")).unwrap();
        fs::write(root.join("app.tsx"), "const A = () => <p>a</p>;").unwrap();
        fs::write(root.join("pages/index.jsx"), "const B = () => <p>b</p>;").unwrap();
        fs::write(root.join("pages/util.ts"), "export const n = 1;").unwrap();
        fs::write(root.join("notes.md"), "not code").unwrap();

        let files = find_template_files(&root);
        assert_eq!(files.len(), 2);

        fs::remove_dir_all(root).ok();
    }
}
