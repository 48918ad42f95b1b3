//! Compile-fail tests for the child setup order
//!
//! Each case misuses the sandbox type-state chain and must be rejected by the
//! compiler.

#![cfg(target_os = "linux")]

#[test]
fn typestate_compile_fail_tests() {
    let t = trybuild::TestCases::new();

    // Running code early
    t.compile_fail("tests/typestate_compile_fail/execute_from_loaded.rs");

    // Skipped steps
    t.compile_fail("tests/typestate_compile_fail/skip_harden.rs");
    t.compile_fail("tests/typestate_compile_fail/silence_before_arm.rs");

    // Reusing a consumed state
    t.compile_fail("tests/typestate_compile_fail/reuse_consumed_contained.rs");
}
