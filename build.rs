fn main() {
    // Node addon linker flags are only needed when the napi bindings are built.
    if std::env::var("CARGO_FEATURE_NAPI").is_ok() {
        napi_build::setup();
    }
}
