use std::io::Write;

use arbiter::config::Config;
use arbiter::{ComparisonPolicy, EXAMPLE_CONFIG};

#[test]
fn test_example_config_registers_all_languages() {
    let config = Config::parse_toml(EXAMPLE_CONFIG).unwrap();
    let registry = config.registry();

    assert_eq!(
        registry.ids(),
        vec!["c", "cpp17", "go", "java", "javascript", "python3", "rust"]
    );
    assert!(registry.resolve("java").unwrap().is_compiled());
    assert!(!registry.resolve("python3").unwrap().is_compiled());
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    write!(
        file,
        r#"
scratch_root = "/tmp/arbiter-it"

[judge]
workers = 3
comparison = "exact"

[languages.python3]
name = "Python 3"
extension = "py"

[languages.python3.run]
command = ["python3", "{{source}}"]
"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.worker_count(), 3);
    assert_eq!(config.judge.comparison, ComparisonPolicy::Exact);
    assert_eq!(config.languages.len(), 1);
    assert_eq!(config.scratch_root.to_str(), Some("/tmp/arbiter-it"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    write!(
        file,
        r#"
[languages.broken]
name = "Broken"
extension = "x"

[languages.broken.run]
command = []
"#
    )
    .unwrap();

    assert!(Config::from_file(file.path()).is_err());
}
