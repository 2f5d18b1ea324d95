use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::ResourceLimits;

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Configuration for a programming language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "C++17 (GCC)")
    pub name: String,

    /// File extension
    pub extension: FileExtension,

    /// Compilation configuration (None for interpreted languages)
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    /// Execution configuration
    pub run: RunConfig,
}

impl Language {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Get the source file name for this language
    pub fn source_name(&self) -> String {
        if let Some(ref compile) = self.compile {
            compile.source_name.clone()
        } else {
            format!("main.{}", self.extension)
        }
    }

    /// Name substituted for `{binary}` in the run command
    pub fn binary_name(&self) -> String {
        match self.compile {
            Some(ref compile) => compile.output_name.clone(),
            None => self.source_name(),
        }
    }

    /// The run command with placeholders expanded
    pub fn run_command(&self) -> Vec<String> {
        Self::expand_command(&self.run.command, &self.source_name(), &self.binary_name())
    }

    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], source: &str, binary: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{output}", binary)
                    .replace("{binary}", binary)
            })
            .collect()
    }
}

/// File extension without dot (e.g., "cpp")
#[derive(Debug, Clone, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default compile budget, separate from the per-test run limit
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 30_000;

/// Configuration for the compilation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {output}
    pub command: Vec<String>,

    /// Source file name in the scratch directory (e.g., "main.cpp")
    pub source_name: String,

    /// Output binary name (e.g., "main")
    pub output_name: String,

    /// Wall clock budget for the compiler in milliseconds
    #[serde(default = "default_compile_timeout_ms")]
    pub timeout_ms: u64,

    /// Environment variables to set during compilation
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Resource limits for compilation (overrides compile defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_compile_timeout_ms() -> u64 {
    DEFAULT_COMPILE_TIMEOUT_MS
}

/// Default PATH for sandbox execution
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Configuration for the execution step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {binary}
    pub command: Vec<String>,

    /// Environment Variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// PATH environment variable for the sandbox
    #[serde(default = "default_sandbox_path")]
    pub path: String,

    /// Cap the address space at the memory limit (RLIMIT_AS).
    ///
    /// Runtimes that reserve large virtual regions up front (JVM, Go, V8)
    /// must turn this off and rely on cgroup or sampled RSS limits.
    #[serde(default = "default_true")]
    pub address_space_limit: bool,

    /// Resource limits for execution (overrides defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpreted(command: &[&str]) -> Language {
        Language {
            name: "Python".to_owned(),
            extension: FileExtension::new("py").unwrap(),
            compile: None,
            run: RunConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
                env: HashMap::new(),
                path: DEFAULT_SANDBOX_PATH.to_owned(),
                address_space_limit: true,
                limits: None,
            },
        }
    }

    fn compiled() -> Language {
        Language {
            name: "C++".to_owned(),
            extension: FileExtension::new("cpp").unwrap(),
            compile: Some(CompileConfig {
                command: vec!["g++".to_owned(), "{source}".to_owned(), "-o".to_owned(), "{output}".to_owned()],
                source_name: "solution.cpp".to_owned(),
                output_name: "solution".to_owned(),
                timeout_ms: DEFAULT_COMPILE_TIMEOUT_MS,
                env: HashMap::new(),
                limits: None,
            }),
            run: RunConfig {
                command: vec!["./{binary}".to_owned()],
                env: HashMap::new(),
                path: DEFAULT_SANDBOX_PATH.to_owned(),
                address_space_limit: true,
                limits: None,
            },
        }
    }

    #[test]
    fn file_extension_new_valid() {
        let ext = FileExtension::new("cpp").unwrap();
        assert_eq!(ext.to_string(), "cpp");
    }

    #[test]
    fn file_extension_rejects_slash_and_dot() {
        assert!(FileExtension::new("path/ext").is_err());
        assert!(FileExtension::new(".cpp").is_err());
        assert!(FileExtension::new(".tar.gz").is_err());
    }

    #[test]
    fn file_extension_is_empty() {
        assert!(FileExtension::new("").unwrap().is_empty());
        assert!(!FileExtension::new("rs").unwrap().is_empty());
    }

    #[test]
    fn expand_command_placeholders() {
        let cmd = vec![
            "gcc".to_owned(),
            "{source}".to_owned(),
            "-o".to_owned(),
            "{output}".to_owned(),
        ];
        let result = Language::expand_command(&cmd, "test.c", "test");
        assert_eq!(result, vec!["gcc", "test.c", "-o", "test"]);
    }

    #[test]
    fn expand_command_placeholder_in_middle() {
        let cmd = vec!["prefix-{source}-suffix".to_owned()];
        let result = Language::expand_command(&cmd, "main.c", "main");
        assert_eq!(result, vec!["prefix-main.c-suffix"]);
    }

    #[test]
    fn expand_command_empty() {
        let result = Language::expand_command(&[], "main.c", "main");
        assert!(result.is_empty());
    }

    #[test]
    fn language_is_compiled() {
        assert!(compiled().is_compiled());
        assert!(!interpreted(&["python3", "{source}"]).is_compiled());
    }

    #[test]
    fn source_and_binary_names() {
        let cpp = compiled();
        assert_eq!(cpp.source_name(), "solution.cpp");
        assert_eq!(cpp.binary_name(), "solution");

        let py = interpreted(&["python3", "{source}"]);
        assert_eq!(py.source_name(), "main.py");
        assert_eq!(py.binary_name(), "main.py");
    }

    #[test]
    fn run_command_expands_for_both_kinds() {
        assert_eq!(compiled().run_command(), vec!["./solution"]);
        assert_eq!(
            interpreted(&["python3", "-S", "{source}"]).run_command(),
            vec!["python3", "-S", "main.py"]
        );
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn file_extension_rejects_all_strings_with_slash(s in ".*/.*") {
            prop_assert!(FileExtension::new(&s).is_err());
        }

        #[test]
        fn file_extension_accepts_alphanumeric(s in "[a-zA-Z0-9_-]+") {
            prop_assert!(FileExtension::new(&s).is_ok());
        }

        #[test]
        fn expand_command_length_preserved(cmd_len in 1usize..10) {
            let cmd: Vec<String> = (0..cmd_len).map(|i| format!("arg{i}")).collect();
            let result = Language::expand_command(&cmd, "source", "binary");
            prop_assert_eq!(result.len(), cmd_len);
        }
    }
}
