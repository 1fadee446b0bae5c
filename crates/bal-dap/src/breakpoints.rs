//! Line breakpoints per logical compilation unit.
//!
//! The runtime addresses breakpoints by (package, file, line). Files that declare a
//! package are addressed by their bare name; files in the default package by their
//! path. Stack frames later report only a bare file name plus the package, so the
//! registry also remembers which directory each package and file came from.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::channel::ChannelCommand;
use crate::error::BalAdapterError;
use crate::package;

/// Package of sources without a `package` declaration.
pub const DEFAULT_PACKAGE: &str = ".";

#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    /// unit -> file identity -> lines, in request order
    units: BTreeMap<String, BTreeMap<String, Vec<i64>>>,
    package_paths: HashMap<String, PathBuf>,
    dir_paths: HashMap<String, PathBuf>,
}

impl BreakpointRegistry {
    /// Replaces the breakpoints of the file at `source_path`.
    ///
    /// Returns the commands that bring the debug server in line with the new set.
    pub fn set_breakpoints(
        &mut self,
        source_path: &Path,
        display_name: &str,
        lines: &[i64],
    ) -> Result<Vec<ChannelCommand>, BalAdapterError> {
        let declared = package::read_declared_package(source_path)?;
        Ok(self.apply(source_path, display_name, declared, lines))
    }

    pub fn apply(
        &mut self,
        source_path: &Path,
        display_name: &str,
        declared_package: Option<String>,
        lines: &[i64],
    ) -> Vec<ChannelCommand> {
        let dir = source_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let (unit, file) = match declared_package {
            Some(package) => {
                self.package_paths.insert(package.clone(), dir.clone());
                (package, display_name.to_string())
            }
            None => (
                DEFAULT_PACKAGE.to_string(),
                source_path.to_string_lossy().to_string(),
            ),
        };
        self.dir_paths.insert(display_name.to_string(), dir);

        debug!(unit = %unit, file = %file, ?lines, "Replacing breakpoints");

        let mut commands = Vec::with_capacity(lines.len() + 1);
        commands.push(ChannelCommand::RemoveBreakpoints {
            file: file.clone(),
            package: unit.clone(),
        });
        commands.extend(lines.iter().map(|line| ChannelCommand::AddBreakpoint {
            line: *line,
            file: file.clone(),
            package: unit.clone(),
        }));

        let files = self.units.entry(unit).or_default();
        if lines.is_empty() {
            files.remove(&file);
        } else {
            files.insert(file, lines.to_vec());
        }

        commands
    }

    pub fn active_lines(&self, unit: &str, file: &str) -> &[i64] {
        self.units
            .get(unit)
            .and_then(|files| files.get(file))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Absolute path of a frame's source file, if its directory is known.
    pub fn resolve_frame_path(&self, package_path: &str, file_name: &str) -> Option<PathBuf> {
        let dir = if package_path != DEFAULT_PACKAGE {
            self.package_paths.get(package_path)
        } else {
            self.dir_paths.get(file_name)
        }?;
        Some(dir.join(file_name))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_default_package_addresses_file_by_path() {
        let mut registry = BreakpointRegistry::default();
        let path = Path::new("/work/hello.bal");

        let commands = registry.apply(path, "hello.bal", None, &[3, 7]);

        assert_eq!(
            commands,
            vec![
                ChannelCommand::RemoveBreakpoints {
                    file: "/work/hello.bal".to_string(),
                    package: ".".to_string()
                },
                ChannelCommand::AddBreakpoint {
                    line: 3,
                    file: "/work/hello.bal".to_string(),
                    package: ".".to_string()
                },
                ChannelCommand::AddBreakpoint {
                    line: 7,
                    file: "/work/hello.bal".to_string(),
                    package: ".".to_string()
                },
            ]
        );
        assert_eq!(registry.active_lines(".", "/work/hello.bal"), &[3, 7]);
    }

    #[test]
    fn test_package_addresses_file_by_name() {
        let mut registry = BreakpointRegistry::default();
        let path = Path::new("/work/a/b/svc.bal");

        let commands = registry.apply(path, "svc.bal", Some("a.b".to_string()), &[12]);

        assert_eq!(
            commands,
            vec![
                ChannelCommand::RemoveBreakpoints {
                    file: "svc.bal".to_string(),
                    package: "a.b".to_string()
                },
                ChannelCommand::AddBreakpoint {
                    line: 12,
                    file: "svc.bal".to_string(),
                    package: "a.b".to_string()
                },
            ]
        );
        assert_eq!(registry.active_lines("a.b", "svc.bal"), &[12]);
    }

    #[test]
    fn test_same_file_name_in_two_packages() {
        let mut registry = BreakpointRegistry::default();

        registry.apply(Path::new("/work/a/util.bal"), "util.bal", Some("a".to_string()), &[3]);
        let commands =
            registry.apply(Path::new("/work/b/util.bal"), "util.bal", Some("b".to_string()), &[]);

        assert_eq!(
            commands,
            vec![ChannelCommand::RemoveBreakpoints {
                file: "util.bal".to_string(),
                package: "b".to_string()
            }]
        );
        assert_eq!(registry.active_lines("a", "util.bal"), &[3]);
        assert!(registry.active_lines("b", "util.bal").is_empty());
    }

    #[test]
    fn test_replacement_is_exact() {
        let mut registry = BreakpointRegistry::default();
        let path = Path::new("/work/hello.bal");

        registry.apply(path, "hello.bal", None, &[3, 7]);
        registry.apply(path, "hello.bal", None, &[7, 9]);

        assert_eq!(registry.active_lines(".", "/work/hello.bal"), &[7, 9]);
    }

    #[test]
    fn test_clearing_breakpoints() {
        let mut registry = BreakpointRegistry::default();
        let path = Path::new("/work/hello.bal");

        registry.apply(path, "hello.bal", None, &[3]);
        let commands = registry.apply(path, "hello.bal", None, &[]);

        assert_eq!(commands.len(), 1);
        assert!(registry.active_lines(".", "/work/hello.bal").is_empty());
    }

    #[test]
    fn test_resolve_frame_path() {
        let mut registry = BreakpointRegistry::default();
        registry.apply(Path::new("/work/a/b/svc.bal"), "svc.bal", Some("a.b".to_string()), &[1]);
        registry.apply(Path::new("/scripts/main.bal"), "main.bal", None, &[1]);

        assert_eq!(
            registry.resolve_frame_path("a.b", "util.bal"),
            Some(PathBuf::from("/work/a/b/util.bal"))
        );
        assert_eq!(
            registry.resolve_frame_path(".", "main.bal"),
            Some(PathBuf::from("/scripts/main.bal"))
        );
        assert_eq!(registry.resolve_frame_path(".", "other.bal"), None);
        assert_eq!(registry.resolve_frame_path("x.y", "svc.bal"), None);
    }

    #[test]
    fn test_set_breakpoints_reads_declaration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.bal");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "package orders;\n\nfunction main() {{}}").unwrap();

        let mut registry = BreakpointRegistry::default();
        let commands = registry.set_breakpoints(&path, "svc.bal", &[4]).unwrap();

        assert_eq!(
            commands[1],
            ChannelCommand::AddBreakpoint {
                line: 4,
                file: "svc.bal".to_string(),
                package: "orders".to_string()
            }
        );
        assert_eq!(
            registry.resolve_frame_path("orders", "svc.bal"),
            Some(dir.path().join("svc.bal"))
        );
    }
}
