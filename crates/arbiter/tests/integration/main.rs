//! Integration tests for arbiter
//!
//! These tests compile and run real programs, so they need the language
//! toolchains on the host. A test is skipped when its language's programs
//! cannot be found the way the sandbox looks for them.
//! Run with: cargo test -p arbiter --features integration-tests

#![cfg(feature = "integration-tests")]

use std::fs;

use arbiter::config::Config;
use arbiter::sandbox::resolve_command;
use arbiter::{Judge, TestCase};

/// Return early from a test when the sandbox cannot run `language`
macro_rules! require_language {
    ($language:expr) => {
        if !$crate::language_available($language) {
            eprintln!("skipping: toolchain for {} not available to the sandbox", $language);
            return;
        }
    };
}

mod compilation;
mod concurrency;
mod config_loading;
mod languages;
mod resource_limits;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Create a test config with cgroup support if available, falling back to non-cgroup mode.
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    if config.cgroup {
        match arbiter::prepare_cgroup(&config.cg_root) {
            Ok(true) => {}
            _ => config.cgroup = false,
        }
    }
    config
}

pub(crate) fn test_judge() -> Judge {
    let config = test_config();
    let cgroup_ready = config.cgroup;
    Judge::with_cgroup(config, cgroup_ready)
}

/// Whether every program of `language` resolves on the sandbox search path,
/// inside the paths a confined program can see
pub(crate) fn language_available(language: &str) -> bool {
    let config = test_config();
    let Ok(lang) = config.get_language(language) else {
        return false;
    };

    let mut commands = vec![lang.run.command.clone()];
    if let Some(ref compile) = lang.compile {
        commands.push(compile.command.clone());
    }

    commands.into_iter().all(|mut argv| {
        if resolve_command(&mut argv, &lang.run.path).is_err() {
            return false;
        }
        let program = std::path::Path::new(&argv[0]);
        !config.sandbox.confine_filesystem
            || !program.is_absolute()
            || config
                .sandbox
                .readonly_paths
                .iter()
                .any(|visible| program.starts_with(visible))
    })
}

/// Cases for the reverse-a-line fixtures
pub(crate) fn reverse_cases() -> Vec<TestCase> {
    vec![
        TestCase::new("hello\n", "olleh\n"),
        TestCase::new("abc", "cba"),
        TestCase::new("racecar\n", "racecar"),
        TestCase::new("\n", "\n"),
    ]
}

/// Cases for the reverse-a-JSON-array fixtures
pub(crate) fn reverse_array_cases() -> Vec<TestCase> {
    vec![
        TestCase::new(r#"["h","e","l","l","o"]"#, r#"["o","l","l","e","h"]"#),
        TestCase::new(r#"["H","a","n","n","a","h"]"#, r#"["h","a","n","n","a","H"]"#),
    ]
}
