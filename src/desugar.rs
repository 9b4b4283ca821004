//! Decorator desugaring: class components to template functions and schemas.
//!
//! A decorated class is two declarations folded into one: the template the
//! class renders and the prop/construction contract it exposes. Desugaring
//! pulls them apart so the classifier and binder only ever see a plain
//! template function, and the instantiation runtime only ever sees a flat,
//! inheritance-merged schema. Private and static members become mangled
//! plain bindings; capture analysis treats them like any other name.

use crate::capture::HandlerFn;
use crate::scope::{
    classify_init, unwrap_expression, Binding, BindingInit, RefTable, ScopeChain,
};
use crate::validate::{
    BindingKind, CompilerError, ComponentSchema, MangledMember, PropSpec, SourceLocation,
    INV_CONSTRUCTION_ORDER, INV_TEMPLATE_DECORATOR,
};
use oxc_ast::ast::{
    CallExpression, Class, ClassElement, Decorator, Expression, MethodDefinitionKind, PropertyKey,
};
use oxc_ast_visit::{walk, Visit};
use oxc_span::{GetSpan, Span};
use std::collections::HashMap;

// ═══════════════════════════════════════════════════════════════════════════════
// DECORATOR TABLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Which decorator names mark templates and properties. The defaults match
/// the runtime's exports; build tooling may rename them per compilation.
#[derive(Debug, Clone)]
pub struct DecoratorNames {
    pub template: String,
    pub property: String,
}

impl Default for DecoratorNames {
    fn default() -> Self {
        DecoratorNames {
            template: "template".to_string(),
            property: "property".to_string(),
        }
    }
}

/// `@name(arg)` yields `Some(Some(arg))`, bare `@name` yields `Some(None)`,
/// anything else `None`.
fn decorator_argument<'a, 'b>(
    decorator: &'b Decorator<'a>,
    name: &str,
) -> Option<Option<&'b Expression<'a>>> {
    match unwrap_expression(&decorator.expression) {
        Expression::Identifier(id) if id.name == name => Some(None),
        Expression::CallExpression(call) => {
            let Expression::Identifier(id) = unwrap_expression(&call.callee) else {
                return None;
            };
            if id.name != name {
                return None;
            }
            Some(call.arguments.first().and_then(|arg| arg.as_expression()))
        }
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DESUGARING
// ═══════════════════════════════════════════════════════════════════════════════

/// The template decorator's argument: a function, or bare markup treated as
/// a zero-parameter template.
pub enum TemplateSource<'a, 'b> {
    Function(HandlerFn<'a, 'b>),
    Markup(&'b Expression<'a>),
}

pub struct DesugaredClass<'a, 'b> {
    pub name: String,
    /// `None` when construction-order checking failed for this class.
    pub schema: Option<ComponentSchema>,
    pub template: Option<TemplateSource<'a, 'b>>,
    pub diagnostics: Vec<CompilerError>,
}

/// Desugars one class. Returns `None` for classes that are not components:
/// no template decorator, no decorated fields, and no known component base.
/// `known` holds the schemas of classes desugared earlier in the module, so
/// bases must be declared before the classes that extend them.
pub fn desugar_class<'a, 'b>(
    class: &'b Class<'a>,
    known: &HashMap<String, ComponentSchema>,
    names: &DecoratorNames,
    source: &str,
    file_path: &str,
) -> Option<DesugaredClass<'a, 'b>> {
    let class_name = class.id.as_ref()?.name.to_string();
    let base = class
        .super_class
        .as_ref()
        .map(|expr| span_text(source, expr.span()));

    let mut diagnostics = Vec::new();
    let mut template = None;
    let mut has_template_decorator = false;
    for decorator in &class.decorators {
        let Some(argument) = decorator_argument(decorator, &names.template) else {
            continue;
        };
        has_template_decorator = true;
        if template.is_some() {
            diagnostics.push(error_at(
                INV_TEMPLATE_DECORATOR,
                "only one template decorator per class",
                file_path,
                source,
                decorator.span.start,
            ));
            continue;
        }
        match argument {
            None => diagnostics.push(error_at(
                INV_TEMPLATE_DECORATOR,
                "template decorator requires an argument",
                file_path,
                source,
                decorator.span.start,
            )),
            Some(arg) => {
                if let Some(function) = HandlerFn::from_expression(arg) {
                    template = Some(TemplateSource::Function(function));
                } else {
                    let inner = unwrap_expression(arg);
                    if matches!(
                        inner,
                        Expression::JSXElement(_) | Expression::JSXFragment(_)
                    ) {
                        template = Some(TemplateSource::Markup(inner));
                    } else {
                        diagnostics.push(error_at(
                            INV_TEMPLATE_DECORATOR,
                            "template decorator argument must be a function or markup",
                            file_path,
                            source,
                            arg.span().start,
                        ));
                    }
                }
            }
        }
    }

    let mut own_props = Vec::new();
    let mut mangled_members = Vec::new();
    let mut constructor_span = None;
    let mut constructor_calls_base = false;

    for element in &class.body.body {
        match element {
            ClassElement::PropertyDefinition(prop) => match &prop.key {
                PropertyKey::StaticIdentifier(id) => {
                    if prop.r#static {
                        mangled_members.push(MangledMember {
                            original: id.name.to_string(),
                            mangled: format!("{}_{}", class_name, id.name),
                            is_static: true,
                        });
                    } else if is_decorated(&prop.decorators, &names.property) {
                        own_props.push(prop_spec(
                            id.name.as_str(),
                            prop.value.as_ref(),
                            prop.type_annotation.as_deref().map(|ann| &ann.type_annotation),
                            prop.optional,
                            source,
                        ));
                    }
                }
                PropertyKey::PrivateIdentifier(pid) => {
                    mangled_members.push(MangledMember {
                        original: format!("#{}", pid.name),
                        mangled: format!("__{}_{}", class_name, pid.name),
                        is_static: prop.r#static,
                    });
                }
                _ => {}
            },
            ClassElement::MethodDefinition(method) => {
                if method.kind == MethodDefinitionKind::Constructor {
                    constructor_span = Some(method.span);
                    if let Some(body) = &method.value.body {
                        let mut finder = SuperCallFinder { found: false };
                        for stmt in &body.statements {
                            finder.visit_statement(stmt);
                        }
                        constructor_calls_base = finder.found;
                    }
                } else if let PropertyKey::PrivateIdentifier(pid) = &method.key {
                    mangled_members.push(MangledMember {
                        original: format!("#{}", pid.name),
                        mangled: format!("__{}_{}", class_name, pid.name),
                        is_static: method.r#static,
                    });
                } else if method.r#static {
                    if let PropertyKey::StaticIdentifier(id) = &method.key {
                        mangled_members.push(MangledMember {
                            original: id.name.to_string(),
                            mangled: format!("{}_{}", class_name, id.name),
                            is_static: true,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    let base_known = base.as_deref().and_then(|b| known.get(b)).is_some();
    if !has_template_decorator && own_props.is_empty() && !base_known {
        return None;
    }

    // A derived construction step that never invokes the base step would
    // leave base-declared required fields uninitialized.
    let mut failed = false;
    if base.is_some() && constructor_span.is_some() && !constructor_calls_base {
        let span = constructor_span.unwrap_or(class.span);
        let location = SourceLocation::at(source, span.start);
        diagnostics.push(CompilerError::with_details(
            INV_CONSTRUCTION_ORDER,
            &format!(
                "Constructor of '{}' never invokes the base construction step",
                class_name
            ),
            file_path,
            location.line,
            location.column,
            None,
            vec!["Call super(...) before assigning fields.".to_string()],
        ));
        failed = true;
    }

    let schema = if failed {
        None
    } else {
        let mut props = base
            .as_deref()
            .and_then(|b| known.get(b))
            .map(|schema| schema.props.clone())
            .unwrap_or_default();
        for prop in own_props {
            match props.iter_mut().find(|p| p.name == prop.name) {
                Some(existing) => *existing = prop,
                None => props.push(prop),
            }
        }
        let mut construction_chain = match base.as_deref() {
            Some(b) => match known.get(b) {
                Some(schema) => schema.construction_chain.clone(),
                None => vec![b.to_string()],
            },
            None => Vec::new(),
        };
        construction_chain.push(class_name.clone());
        Some(ComponentSchema {
            name: class_name.clone(),
            base,
            props,
            construction_chain,
            mangled_members,
            location: SourceLocation::at(source, class.span.start),
        })
    };

    Some(DesugaredClass {
        name: class_name,
        schema,
        template,
        diagnostics,
    })
}

fn is_decorated(decorators: &[Decorator], name: &str) -> bool {
    decorators
        .iter()
        .any(|d| decorator_argument(d, name).is_some())
}

fn prop_spec(
    name: &str,
    value: Option<&Expression>,
    type_annotation: Option<&oxc_ast::ast::TSType>,
    optional_marker: bool,
    source: &str,
) -> PropSpec {
    let init_shape = value.map(classify_init).unwrap_or(BindingInit::None);
    let reactive = matches!(
        init_shape,
        BindingInit::ReactiveWrapper { .. } | BindingInit::Computed
    );
    PropSpec {
        name: name.to_string(),
        type_tag: type_annotation.map(|t| span_text(source, t.span())),
        optional: optional_marker || value.is_some(),
        reactive,
        // Reactive and function defaults are anchored in the realm that
        // evaluates the module; portable defaults are not.
        default_realm_visible: reactive || init_shape == BindingInit::Function,
        default_value: value.map(|v| span_text(source, v.span())),
    }
}

/// Declares a schema's props into a template scope. Reactive props allocate
/// ref ids so their reads join dependency sets.
pub fn declare_schema_props(chain: &mut ScopeChain, refs: &mut RefTable, schema: &ComponentSchema) {
    for prop in &schema.props {
        let ref_id = if prop.reactive {
            Some(refs.alloc(&prop.name, false, false, schema.location.clone()))
        } else {
            None
        };
        chain.declare(Binding {
            name: prop.name.clone(),
            kind: BindingKind::ComponentProp,
            ref_id,
            init: BindingInit::None,
            init_span: None,
            reactive_prop: prop.reactive,
            declared_at: schema.location.clone(),
        });
    }
}

struct SuperCallFinder {
    found: bool,
}

impl<'a> Visit<'a> for SuperCallFinder {
    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        if matches!(&call.callee, Expression::Super(_)) {
            self.found = true;
        }
        walk::walk_call_expression(self, call);
    }
}

fn span_text(source: &str, span: Span) -> String {
    let end = (span.end as usize).min(source.len());
    let start = (span.start as usize).min(end);
    source[start..end].to_string()
}

fn error_at(code: &str, message: &str, file: &str, source: &str, offset: u32) -> CompilerError {
    let location = SourceLocation::at(source, offset);
    CompilerError::new(code, message, file, location.line, location.column)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
