//! Turns a job's declared script into one self-contained executable file.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::job::{CODE_DIR_VAR, OUTPUT_DIR_VAR, Script};

/// File name of the generated script inside a workspace.
pub const SCRIPT_FILE: &str = "run.sh";

const DEFAULT_PRELUDE: &str = "#!/bin/bash\nset -e\n";
const SHELLS: [&str; 6] = ["sh", "bash", "dash", "zsh", "ksh", "ash"];

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script file not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A script written into a workspace, plus the command line that runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedScript {
    pub path: PathBuf,
    /// Interpreter program followed by its optional argument, taken from the shebang.
    pub interpreter: Vec<String>,
}

impl MaterializedScript {
    /// Program and arguments that execute the script the way the kernel would.
    pub fn command_line(&self) -> (String, Vec<String>) {
        let mut parts = self.interpreter.clone();
        let program = parts.remove(0);
        parts.push(self.path.display().to_string());
        (program, parts)
    }
}

/// Builds the generated `run.sh` for a job.
pub struct ScriptMaterializer<'a> {
    job_name: &'a str,
    input_vars: Vec<String>,
}

impl<'a> ScriptMaterializer<'a> {
    pub fn new(job_name: &'a str, input_vars: impl IntoIterator<Item = String>) -> Self {
        Self {
            job_name,
            input_vars: input_vars.into_iter().collect(),
        }
    }

    /// Load the script content.
    ///
    /// A relative `Script::File` is looked up as given first, then inside
    /// `code_dir` (when the code reference resolved to a directory).
    pub fn load(script: &Script, code_dir: &Path) -> Result<String, ScriptError> {
        let path = match script {
            Script::Inline(text) => return Ok(text.clone()),
            Script::File(path) => locate(path, code_dir)?,
        };
        debug!(path = %path.display(), "loading script file");
        fs::read_to_string(&path).map_err(|source| ScriptError::Io { path, source })
    }

    /// Produce the final script text.
    ///
    /// Content without an interpreter directive gets `#!/bin/bash` and `set -e`.
    /// For shell interpreters, diagnostic `echo` lines are inserted right after
    /// the directive and any leading `set -…` lines.
    pub fn render(&self, content: &str) -> String {
        let content = if content.starts_with("#!") {
            content.to_string()
        } else {
            format!("{DEFAULT_PRELUDE}\n{content}")
        };

        let interpreter = parse_shebang(&content);
        if !is_shell(&interpreter) {
            return content;
        }

        let lines: Vec<&str> = content.split('\n').collect();
        let header_len = lines
            .iter()
            .enumerate()
            .take_while(|(i, line)| {
                (*i == 0 && line.starts_with("#!"))
                    || line.trim().is_empty()
                    || line.trim_start().starts_with("set -")
            })
            .count();

        let mut out: Vec<String> = lines[..header_len].iter().map(|l| l.to_string()).collect();
        out.push(String::new());
        out.extend(self.diagnostics());
        out.push(String::new());
        out.extend(lines[header_len..].iter().map(|l| l.to_string()));
        out.join("\n")
    }

    fn diagnostics(&self) -> Vec<String> {
        let mut lines = vec![
            format!("echo \"[JOB] Starting job: {}\"", escape_double_quoted(self.job_name)),
            "echo \"[JOB] Working directory: $(pwd)\"".to_string(),
            format!("echo \"[JOB] Code directory: ${CODE_DIR_VAR}\""),
            format!("echo \"[JOB] Output directory: ${OUTPUT_DIR_VAR}\""),
        ];
        for var in &self.input_vars {
            lines.push(format!("echo \"[JOB] Input {var}: ${{{var}}}\""));
        }
        lines
    }

    /// Load, render and write the script into `workspace`, marked executable.
    pub fn materialize(
        &self,
        script: &Script,
        code_dir: &Path,
        workspace: &Path,
    ) -> Result<MaterializedScript, ScriptError> {
        let content = Self::load(script, code_dir)?;
        let rendered = self.render(&content);
        let path = workspace.join(SCRIPT_FILE);
        fs::write(&path, &rendered).map_err(|source| ScriptError::Io {
            path: path.clone(),
            source,
        })?;
        make_executable(&path)?;
        Ok(MaterializedScript {
            interpreter: parse_shebang(&rendered),
            path,
        })
    }
}

fn locate(path: &Path, code_dir: &Path) -> Result<PathBuf, ScriptError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_relative() && code_dir.is_dir() {
        let candidate = code_dir.join(path);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(ScriptError::NotFound(path.to_path_buf()))
}

/// Split `#!/usr/bin/env bash` style directives into program and optional argument.
fn parse_shebang(content: &str) -> Vec<String> {
    let first = content.lines().next().unwrap_or_default();
    let Some(directive) = first.strip_prefix("#!") else {
        return vec!["/bin/sh".to_string()];
    };
    let directive = directive.trim();
    match directive.split_once(char::is_whitespace) {
        Some((program, arg)) => vec![program.to_string(), arg.trim().to_string()],
        None if directive.is_empty() => vec!["/bin/sh".to_string()],
        None => vec![directive.to_string()],
    }
}

fn is_shell(interpreter: &[String]) -> bool {
    let program = match interpreter {
        [program, arg] if program.ends_with("/env") => arg.split_whitespace().next().unwrap_or(""),
        [program, ..] => program.as_str(),
        [] => return false,
    };
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    SHELLS.contains(&name)
}

fn escape_double_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ScriptError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
        ScriptError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ScriptError> {
    Ok(())
}
