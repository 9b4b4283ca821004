//! End-to-end pipeline tests: source text through every pass to the bundled
//! `CompileOutput`.
//!
//! These cover the cross-pass guarantees no single pass can verify alone:
//! dependency sets surviving desugaring and binding, realm manifests agreeing
//! with scope classification, and schema/program bundling.

#[cfg(test)]
mod tests {
    use crate::compile::{compile_source, CompileOptions};
    use crate::validate::{
        BindingKind, CompileOutput, RealmTag, RenderKind, TransferStrategy,
    };

    fn compile(source: &str) -> CompileOutput {
        compile_source(source, "pipeline.tsx", &CompileOptions::default())
    }

    fn compile_ok(source: &str) -> CompileOutput {
        let output = compile(source);
        assert!(output.ok, "diagnostics: {:?}", output.diagnostics);
        output
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // REALM SPLITTING
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn reactive_prop_with_alternate_realm_handler() {
        let output = compile_ok(
            r#"const App = ({ x = $(0) }) => <div onclick:frontend={() => x.val++}>{x}</div>;"#,
        );

        // One binding record depending on x's ref.
        assert_eq!(output.program.bindings.len(), 1);
        assert_eq!(output.program.bindings[0].kind, RenderKind::Text);
        assert_eq!(output.program.bindings[0].deps, vec!["r0"]);

        // One closure shipped to the frontend realm, x travelling by identity.
        assert_eq!(output.closures.len(), 1);
        let artifact = &output.closures[0];
        assert_eq!(
            artifact.realm,
            RealmTag::Alternate {
                name: "frontend".to_string()
            }
        );
        assert_eq!(artifact.manifest.entries.len(), 1);
        let entry = &artifact.manifest.entries[0];
        assert_eq!(entry.name, "x");
        assert_eq!(entry.classification, BindingKind::ReactiveRef);
        assert_eq!(entry.strategy, TransferStrategy::Identity);
        assert!(entry.written);

        // The handler anchor carries the closure's id.
        assert!(output.program.skeleton.contains(&format!(
            "data-tandem-handler-onclick=\"{}\"",
            artifact.handler_id
        )));
    }

    #[test]
    fn default_realm_templates_ship_no_closures() {
        let output = compile_ok(
            r#"const App = ({ n = $(0) }) => <button onclick={() => n.val++}>{n.val}</button>;"#,
        );
        assert!(output.closures.is_empty());
        assert!(output
            .program
            .skeleton
            .contains("data-tandem-handler-onclick=\"h_"));
    }

    #[test]
    fn repeated_compilations_are_deterministic() {
        let source = r#"const App = ({ x = $(0), msg = "hi" }) => <div onclick:frontend={() => { x.val += 1; console.log(msg); }}>{x.val}</div>;"#;
        let first = compile_ok(source);
        let second = compile_ok(source);

        assert_eq!(first.program, second.program);
        assert_eq!(first.refs, second.refs);
        assert_eq!(first.closures[0].handler_id, second.closures[0].handler_id);
        assert_eq!(first.closures[0].manifest, second.closures[0].manifest);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // DEPENDENCY TRACKING
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn disjoint_reads_rerender_independently() {
        let output = compile_ok(
            r#"const GREETING = "hello";
const App = ({ a = $(1), b = $(2) }) => (
  <div>
    <h1>{GREETING.toUpperCase()}</h1>
    <p>{a.val}</p>
    <p>{b.val}</p>
  </div>
);"#,
        );

        // The module-constant read evaluates once; the two reactive reads get
        // disjoint singleton sets.
        assert_eq!(output.program.statics.len(), 1);
        assert_eq!(output.program.bindings.len(), 2);
        assert_eq!(output.program.bindings[0].deps, vec!["r0"]);
        assert_eq!(output.program.bindings[1].deps, vec!["r1"]);
    }

    #[test]
    fn opaque_positions_keep_siblings_compiling() {
        let output =
            compile(r#"const App = ({ n = $(1) }) => <div><p>{mystery}</p><p>{n.val}</p></div>;"#);

        assert!(output.ok, "unbound identifiers are recoverable");
        assert_eq!(output.diagnostics.len(), 1);
        assert_eq!(output.program.bindings.len(), 1);
        assert_eq!(output.program.bindings[0].deps, vec!["r0"]);
    }

    #[test]
    fn static_marker_pins_dynamic_positions() {
        let output = compile_ok(r#"const App = ({ n = $(5) }) => <p>price #static{n.val}</p>;"#);
        assert!(output.program.bindings.is_empty());
        assert_eq!(output.program.statics.len(), 1);
        assert!(output.program.skeleton.starts_with("<p>price "));
    }

    #[test]
    fn await_expressions_become_async_fragments() {
        let output = compile_ok(
            r#"import { fetchTitle } from "./api";
const App = async () => <h1>{await fetchTitle()}</h1>;"#,
        );
        assert_eq!(output.program.statics.len(), 1);
        assert!(output.program.statics[0].is_async);
        assert!(output.program.statics[0].evaluator.starts_with("async"));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // STRUCTURED POSITIONS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn conditional_branches_carry_their_own_programs() {
        let output = compile_ok(
            r#"import { A, B } from "./parts";
const App = ({ cond = $(true) }) => <main>{cond.val ? <A/> : <B/>}</main>;"#,
        );

        assert_eq!(
            output.program.skeleton,
            "<main><template data-tandem-cond=\"cond_0\"></template></main>"
        );
        assert_eq!(output.program.bindings.len(), 1);
        let binding = &output.program.bindings[0];
        assert_eq!(binding.kind, RenderKind::Conditional);
        assert_eq!(binding.deps, vec!["r0"]);
        let branches = binding.branches.as_ref().expect("branch programs");
        assert_eq!(branches.consequent.skeleton, "<A></A>");
        assert_eq!(branches.alternate.skeleton, "<B></B>");
        assert!(branches.consequent.bindings.is_empty());
    }

    #[test]
    fn list_items_bind_in_their_own_scope() {
        let output = compile_ok(
            r#"const Todos = ({ items = $([]) }) => <ul>{items.val.map((item) => <li>{item.label}</li>)}</ul>;"#,
        );

        assert_eq!(
            output.program.skeleton,
            "<ul><template data-tandem-list=\"list_0\"></template></ul>"
        );
        let binding = &output.program.bindings[0];
        assert_eq!(binding.kind, RenderKind::List);
        assert_eq!(binding.deps, vec!["r0"]);
        let item = binding.item.as_ref().expect("item program");
        assert_eq!(item.item_var, "item");
        assert!(item.index_var.is_none());
        // item.label is plain inside the item scope, so it renders once per
        // instantiated row.
        assert_eq!(item.program.statics.len(), 1);
        assert!(item.program.bindings.is_empty());
        assert!(item.program.skeleton.contains("data-tandem-text="));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // CLASS DESUGARING
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn schema_inheritance_flattens_base_first() {
        let output = compile_ok(
            r#"class Media {
  @property src = "";
  #seed = 1;
}
class Video extends Media {
  @property src = "video.mp4";
  @property autoplay = $(false);
  constructor() { super(); }
  static register() {}
}"#,
        );

        assert_eq!(output.schemas.len(), 2);
        let media = &output.schemas[0];
        let video = &output.schemas[1];

        assert_eq!(video.base.as_deref(), Some("Media"));
        assert_eq!(video.construction_chain, vec!["Media", "Video"]);

        // Base entries come first; the derived default wins on collision.
        assert_eq!(video.props[0].name, "src");
        assert_eq!(video.props[0].default_value.as_deref(), Some("\"video.mp4\""));
        assert_eq!(video.props[1].name, "autoplay");
        assert!(video.props[1].reactive);

        assert_eq!(media.mangled_members[0].mangled, "__Media_seed");
        assert_eq!(video.mangled_members[0].mangled, "Video_register");
        assert!(video.mangled_members[0].is_static);
    }
}
