//! # Tandem Template Compiler
//!
//! Compiles TSX templates into realm-split render artifacts: a static HTML
//! skeleton, binding records keyed by exact reactive-ref dependency sets, and
//! serializable closures for handlers declared to run in the other realm.
//!
//! ## Classification Invariants
//!
//! 1. **Scope resolution**: every identifier a template expression reads
//!    resolves against the lexical scope chain at its use site. Unresolved
//!    identifiers are compile diagnostics (TDM-ERR-SCOPE-001), never runtime
//!    lookups.
//!
//! 2. **Classification priority**: identifiers resolve in this exact order:
//!    1. Item scopes of enclosing list callbacks and handler parameters
//!    2. Template props and local declarations
//!    3. Module declarations and imports
//!    4. Globals whitelist (window, console, Math, ...)
//!    5. Unresolved → diagnostic, expression marked opaque
//!
//! 3. **Exact dependency sets**: a binding re-evaluates exactly when one of
//!    the refs its expression read changes. Never a superset, never a subset.
//!    An empty set means the position compiles to a one-shot static fragment.
//!
//! 4. **Transfer strategies**: reactive refs cross the realm boundary by
//!    identity, plain values by compile-time copy, external bindings by
//!    remote name lookup. Strategy/classification mismatches are manifest
//!    validation errors, not runtime surprises.
//!
//! 5. **Construction order**: a derived construction step invokes the base
//!    step before its own field assignments, or that class emits no schema
//!    (TDM-ERR-CLASS-001) while the rest of the module compiles on.

#[cfg(feature = "napi")]
use napi_derive::napi;

mod bind;
mod cache;
mod capture;
mod codegen;
mod compile;
mod desugar;
mod realm;
mod scope;
mod static_eval;
mod validate;

#[cfg(test)]
mod pipeline_tests;

// Internal Rust-to-Rust API (for the bundler plugin)
pub use compile::{compile_dir, compile_file, compile_many, compile_source, CompileOptions};

// Pass-level entry points, usable on their own
pub use bind::{bind_template, BindResult};
pub use capture::{analyze_captures, expression_free_vars, CaptureScan, HandlerFn, ResolvedCapture};
pub use codegen::{compile_evaluator, EvaluatorOutput};
pub use desugar::{desugar_class, DecoratorNames, DesugaredClass, TemplateSource};
pub use realm::{parse_realm_tag, split_handler, HandlerState, SplitOutcome};
pub use scope::{collect_module_scope, Binding, BindingInit, RefTable, ScopeChain};
pub use static_eval::{fold_const, ConstValue};

// Artifact and diagnostic types for the bundler
pub use cache::IncrementalCache;
pub use validate::*;

#[cfg(feature = "napi")]
pub use compile::{compile_many_native, compile_source_native};

#[cfg(feature = "napi")]
#[napi]
pub fn compile_bridge() -> String {
    "Tandem Native Bridge Connected".to_string()
}
