//! Language runtimes
//!
//! Maps a language name to the container image and argv that execute a code
//! file. Standard runtimes read the code from a read-only mount under
//! /workspace; the agent runtime reads a prompt from /tmp and needs outbound
//! network.

use std::collections::HashMap;
use std::sync::Arc;

use cinder_core::EngineError;

/// Name of the agent-class runtime.
pub const AGENT_LANGUAGE: &str = "agent";

/// How to execute code for one language.
pub trait LanguageRuntime: Send + Sync {
    /// Runtime identifier (e.g. "python")
    fn name(&self) -> &'static str;

    /// Container image reference
    fn image(&self) -> &'static str;

    /// Command and args executing the code mounted at `code_path`
    fn command(&self, code_path: &str) -> Vec<String>;

    /// Extension for the code file (e.g. ".py")
    fn file_extension(&self) -> &'static str;

    /// Path the code file is mounted at inside the container
    fn container_code_path(&self) -> String {
        format!("/workspace/code{}", self.file_extension())
    }
}

struct PythonRuntime;

impl LanguageRuntime for PythonRuntime {
    fn name(&self) -> &'static str {
        "python"
    }

    fn image(&self) -> &'static str {
        "docker.io/library/python:3.12-slim"
    }

    fn command(&self, code_path: &str) -> Vec<String> {
        // -u: unbuffered output, -B: no .pyc files
        vec![
            "python3".into(),
            "-u".into(),
            "-B".into(),
            code_path.into(),
        ]
    }

    fn file_extension(&self) -> &'static str {
        ".py"
    }
}

struct NodeRuntime;

impl LanguageRuntime for NodeRuntime {
    fn name(&self) -> &'static str {
        "node"
    }

    fn image(&self) -> &'static str {
        "docker.io/library/node:20-slim"
    }

    fn command(&self, code_path: &str) -> Vec<String> {
        vec![
            "node".into(),
            "--max-old-space-size=256".into(),
            "--disallow-code-generation-from-strings".into(),
            code_path.into(),
        ]
    }

    fn file_extension(&self) -> &'static str {
        ".js"
    }
}

struct BashRuntime;

impl LanguageRuntime for BashRuntime {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn image(&self) -> &'static str {
        "docker.io/library/alpine:3.19"
    }

    fn command(&self, code_path: &str) -> Vec<String> {
        // -e: exit on error, -u: unset variables are errors
        vec!["/bin/sh".into(), "-e".into(), "-u".into(), code_path.into()]
    }

    fn file_extension(&self) -> &'static str {
        ".sh"
    }
}

struct GoRuntime;

impl LanguageRuntime for GoRuntime {
    fn name(&self) -> &'static str {
        "go"
    }

    fn image(&self) -> &'static str {
        "docker.io/library/golang:1.24-alpine"
    }

    fn command(&self, code_path: &str) -> Vec<String> {
        vec!["go".into(), "run".into(), code_path.into()]
    }

    fn file_extension(&self) -> &'static str {
        ".go"
    }
}

struct AgentRuntime;

impl LanguageRuntime for AgentRuntime {
    fn name(&self) -> &'static str {
        AGENT_LANGUAGE
    }

    fn image(&self) -> &'static str {
        "sandbox-agent:latest"
    }

    fn command(&self, code_path: &str) -> Vec<String> {
        // The prompt path travels as a positional parameter so shell
        // metacharacters in it are never expanded.
        vec![
            "sh".into(),
            "-c".into(),
            "cat \"$1\" | agent -p --skip-permissions --output-format text".into(),
            "_".into(),
            code_path.into(),
        ]
    }

    fn file_extension(&self) -> &'static str {
        ".txt"
    }

    fn container_code_path(&self) -> String {
        format!("/tmp/prompt{}", self.file_extension())
    }
}

/// Registry of all supported runtimes.
pub struct Registry {
    runtimes: HashMap<&'static str, Arc<dyn LanguageRuntime>>,
}

impl Registry {
    pub fn new() -> Self {
        let mut runtimes: HashMap<&'static str, Arc<dyn LanguageRuntime>> = HashMap::new();
        for rt in [
            Arc::new(PythonRuntime) as Arc<dyn LanguageRuntime>,
            Arc::new(NodeRuntime),
            Arc::new(BashRuntime),
            Arc::new(GoRuntime),
            Arc::new(AgentRuntime),
        ] {
            runtimes.insert(rt.name(), rt);
        }
        Self { runtimes }
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn LanguageRuntime>, EngineError> {
        self.runtimes
            .get(language)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    pub fn languages(&self) -> Vec<&'static str> {
        let mut langs: Vec<_> = self.runtimes.keys().copied().collect();
        langs.sort_unstable();
        langs
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let reg = Registry::new();
        assert_eq!(reg.get("python").unwrap().name(), "python");
        assert!(matches!(
            reg.get("cobol"),
            Err(EngineError::UnsupportedLanguage(_))
        ));
        assert_eq!(reg.languages(), vec!["agent", "bash", "go", "node", "python"]);
    }

    #[test]
    fn test_standard_code_paths() {
        let reg = Registry::new();
        assert_eq!(
            reg.get("python").unwrap().container_code_path(),
            "/workspace/code.py"
        );
        assert_eq!(
            reg.get("bash").unwrap().container_code_path(),
            "/workspace/code.sh"
        );
    }

    #[test]
    fn test_python_command_is_unbuffered() {
        let reg = Registry::new();
        let cmd = reg.get("python").unwrap().command("/workspace/code.py");
        assert_eq!(cmd[0], "python3");
        assert!(cmd.contains(&"-u".to_string()));
        assert_eq!(cmd.last().unwrap(), "/workspace/code.py");
    }

    #[test]
    fn test_node_blocks_eval() {
        let reg = Registry::new();
        let cmd = reg.get("node").unwrap().command("/workspace/code.js");
        assert!(cmd.contains(&"--disallow-code-generation-from-strings".to_string()));
    }

    #[test]
    fn test_agent_prompt_path_is_positional() {
        let reg = Registry::new();
        let rt = reg.get(AGENT_LANGUAGE).unwrap();
        assert_eq!(rt.container_code_path(), "/tmp/prompt.txt");

        // A hostile path must land in argv, never inside the shell string.
        let hostile = "/tmp/prompt.txt; rm -rf /";
        let cmd = rt.command(hostile);
        assert_eq!(cmd[0], "sh");
        assert_eq!(cmd[1], "-c");
        assert!(!cmd[2].contains(hostile));
        assert_eq!(cmd[3], "_");
        assert_eq!(cmd[4], hostile);
    }
}
