pub mod crypto;
pub mod locks;
pub mod logging;
pub mod process;
pub mod setting;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use which::which;

use crate::errors::{AppError, Result};

/// An external program plus any leading arguments placed before the ones we add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// A command that is killed if its handle is dropped before it exits.
    pub fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        command
    }
}

/// Finds `pg_dump`/`psql` for a given server version.
///
/// Lookup order: explicit override, `<pg_bin_root>/<version>/bin/<tool>`, then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    pub pg_bin_root: Option<PathBuf>,
    pub pg_dump: Option<ToolCommand>,
    pub psql: Option<ToolCommand>,
}

impl ToolLocator {
    pub fn pg_dump(&self, pg_version: &str) -> Result<ToolCommand> {
        self.locate("pg_dump", self.pg_dump.as_ref(), pg_version)
    }

    pub fn psql(&self, pg_version: &str) -> Result<ToolCommand> {
        self.locate("psql", self.psql.as_ref(), pg_version)
    }

    fn locate(
        &self,
        tool: &'static str,
        configured: Option<&ToolCommand>,
        pg_version: &str,
    ) -> Result<ToolCommand> {
        if let Some(command) = configured {
            return Ok(command.clone());
        }

        if let Some(root) = &self.pg_bin_root {
            if let Some(path) = versioned_tool_path(root, pg_version, tool) {
                return Ok(ToolCommand::new(path));
            }
        }

        which(tool).map(ToolCommand::new).map_err(|_| AppError::DumpTool {
            tool,
            stderr: format!(
                "{tool} executable not found for PostgreSQL {pg_version}. Please ensure PostgreSQL client tools are installed and in your PATH."
            ),
        })
    }
}

fn versioned_tool_path(root: &Path, pg_version: &str, tool: &str) -> Option<PathBuf> {
    let version = pg_version.trim();
    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let path = root.join(version).join("bin").join(tool);
    path.is_file().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_command_wins() {
        let locator = ToolLocator {
            pg_dump: Some(ToolCommand::new("sh").arg("-c").arg("true")),
            ..Default::default()
        };
        let tool = locator.pg_dump("16").expect("configured");
        assert_eq!(tool.program, PathBuf::from("sh"));
        assert_eq!(tool.args, vec!["-c", "true"]);
    }

    #[test]
    fn versioned_binary_is_preferred_over_path() {
        let root = tempfile::tempdir().expect("tempdir");
        let bin = root.path().join("15").join("bin");
        std::fs::create_dir_all(&bin).expect("mkdir");
        std::fs::write(bin.join("psql"), b"").expect("touch");

        let locator = ToolLocator {
            pg_bin_root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let tool = locator.psql("15").expect("versioned psql");
        assert_eq!(tool.program, bin.join("psql"));
    }

    #[test]
    fn suspicious_versions_are_not_joined_into_paths() {
        let root = Path::new("/usr/lib/postgresql");
        assert!(versioned_tool_path(root, "../../bin", "pg_dump").is_none());
        assert!(versioned_tool_path(root, "", "pg_dump").is_none());
    }
}
