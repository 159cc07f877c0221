//! Driver name → plugin binary resolution.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{PluginError, PluginResult};
use crate::identity::PluginIdentity;

/// How a plugin binary is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginKind {
    /// A separate executable under `plugins/<name>/<version>/plugin`.
    ExternalBinary(PathBuf),
    /// The running executable, re-entered in plugin mode.
    SelfReinvoked(PathBuf),
}

impl PluginKind {
    pub fn path(&self) -> &Path {
        match self {
            PluginKind::ExternalBinary(path) | PluginKind::SelfReinvoked(path) => path,
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, PluginKind::SelfReinvoked(_))
    }
}

/// Maps driver identities to launchable binaries.
#[derive(Debug, Clone)]
pub struct PluginResolver {
    root: PathBuf,
    builtin: BTreeSet<String>,
    self_exe: Option<PathBuf>,
}

impl PluginResolver {
    /// Resolve external plugins under `root/plugins/...`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            builtin: BTreeSet::new(),
            self_exe: None,
        }
    }

    /// Driver names served by the running executable itself.
    pub fn with_builtin<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builtin.extend(names.into_iter().map(Into::into));
        self
    }

    /// Executable used for built-in drivers instead of `current_exe()`.
    pub fn with_self_exe(mut self, path: impl Into<PathBuf>) -> Self {
        self.self_exe = Some(path.into());
        self
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtin.contains(name)
    }

    /// Conventional location of an external plugin, relative to the root.
    pub fn conventional_path(&self, identity: &PluginIdentity) -> PathBuf {
        self.root
            .join("plugins")
            .join(&identity.name)
            .join(&identity.version)
            .join("plugin")
    }

    /// Resolve `identity` to an absolute, existing binary.
    ///
    /// Never spawns anything; a missing binary is reported with the path
    /// that was tried.
    pub fn resolve(&self, identity: &PluginIdentity) -> PluginResult<PluginKind> {
        if self.is_builtin(&identity.name) {
            let exe = match &self.self_exe {
                Some(path) => path.clone(),
                None => std::env::current_exe().map_err(PluginError::CurrentExe)?,
            };
            return Ok(PluginKind::SelfReinvoked(exe));
        }

        let path = absolute(&self.conventional_path(identity)).map_err(|source| {
            PluginError::PathResolution {
                name: identity.name.clone(),
                source,
            }
        })?;
        if !path.is_file() {
            return Err(PluginError::BinaryNotFound {
                name: identity.name.clone(),
                path,
            });
        }
        Ok(PluginKind::ExternalBinary(path))
    }
}

impl Default for PluginResolver {
    fn default() -> Self {
        Self::new(".")
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_resolves_to_self() {
        let resolver = PluginResolver::new("/nowhere")
            .with_builtin(["shell"])
            .with_self_exe("/usr/local/bin/provisio");
        let kind = resolver
            .resolve(&PluginIdentity::new("shell", "1.0.0", 1))
            .unwrap();
        assert_eq!(
            kind,
            PluginKind::SelfReinvoked(PathBuf::from("/usr/local/bin/provisio"))
        );
        assert!(kind.is_builtin());
    }

    #[test]
    fn test_builtin_defaults_to_current_exe() {
        let resolver = PluginResolver::new("/nowhere").with_builtin(["shell"]);
        let kind = resolver
            .resolve(&PluginIdentity::new("shell", "1.0.0", 1))
            .unwrap();
        assert_eq!(kind.path(), std::env::current_exe().unwrap());
    }

    #[test]
    fn test_external_layout() {
        let dir = tempfile::tempdir().unwrap();
        let identity = PluginIdentity::new("virtualbox", "6.1", 4);
        let bin = dir.path().join("plugins/virtualbox/6.1/plugin");
        std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        let kind = PluginResolver::new(dir.path()).resolve(&identity).unwrap();
        assert_eq!(kind, PluginKind::ExternalBinary(bin));
    }

    #[test]
    fn test_relative_root_made_absolute() {
        let resolver = PluginResolver::new("does-not-exist");
        let err = resolver
            .resolve(&PluginIdentity::new("ghost", "0.1", 9))
            .unwrap_err();
        match err {
            PluginError::BinaryNotFound { name, path } => {
                assert_eq!(name, "ghost");
                assert!(path.is_absolute());
                assert!(path.ends_with("does-not-exist/plugins/ghost/0.1/plugin"));
            }
            other => panic!("expected BinaryNotFound, got {other:?}"),
        }
    }
}
