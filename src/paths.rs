//! XDG Base Directory compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. ElementGate-specific env var (ELEMENTGATE_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::getuid;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "elementgate";

/// Resolved directory paths for the application.
#[derive(Debug, Clone)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    pub data_dir: PathBuf,

    /// Local element portfolio, the default ingestion base directory.
    /// May be overridden independently via ELEMENTGATE_PORTFOLIO.
    pub portfolio: PathBuf,

    /// Audit log and cross-process lock files
    pub state_dir: PathBuf,

    /// None if no suitable runtime directory is available.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "ELEMENTGATE_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });

        let data_dir = env_or(&env_fn, "ELEMENTGATE_DATA_DIR", || {
            strategy.data_dir().join(APP_DIR)
        });

        let state_dir = env_or(&env_fn, "ELEMENTGATE_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join(APP_DIR)
        });

        let portfolio = resolve_portfolio(&env_fn, &data_dir);
        let runtime_dir = resolve_runtime_dir(&env_fn);

        Ok(Self {
            config_dir,
            data_dir,
            portfolio,
            state_dir,
            runtime_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Audit log: state_dir/elementgate.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("elementgate.audit.jsonl")
    }

    /// Cross-process lock files (in runtime_dir, falls back to state_dir)
    pub fn lock_dir(&self) -> PathBuf {
        self.runtime_dir
            .as_ref()
            .unwrap_or(&self.state_dir)
            .join("locks")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.state_dir,
            &self.portfolio,
        ] {
            create_dir_with_mode(dir)?;
        }

        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }
        create_dir_with_mode(&self.lock_dir())?;

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            let data_dir = home.join(".local").join("share").join(APP_DIR);
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                portfolio: data_dir.join("portfolio"),
                data_dir,
                state_dir: home.join(".local").join("state").join(APP_DIR),
                runtime_dir: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

/// ELEMENTGATE_PORTFOLIO (tilde-expanded), else data_dir/portfolio.
fn resolve_portfolio<F>(env_fn: &F, data_dir: &Path) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("ELEMENTGATE_PORTFOLIO") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            let expanded = shellexpand::tilde(trimmed);
            let path = PathBuf::from(expanded.to_string());
            if path.is_absolute() {
                return path;
            }
        }
    }

    data_dir.join("portfolio")
}

fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join(APP_DIR));
        }
    }

    // $TMPDIR/elementgate-$UID on Unix
    #[cfg(unix)]
    {
        let uid = unsafe { getuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        Some(PathBuf::from(tmpdir).join(format!("{}-{}", APP_DIR, uid)))
    }

    #[cfg(not(unix))]
    {
        env_fn("TEMP").ok().map(|t| {
            let user = env_fn("USERNAME").unwrap_or_else(|_| "user".into());
            PathBuf::from(t).join(format!("{}-{}", APP_DIR, user))
        })
    }
}

/// Create a directory with mode 0700.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(paths.config_dir.ends_with(APP_DIR), "{:?}", paths.config_dir);
        assert!(paths.data_dir.ends_with(APP_DIR), "{:?}", paths.data_dir);
        assert!(paths.state_dir.ends_with(APP_DIR), "{:?}", paths.state_dir);
        assert!(paths.portfolio.ends_with("portfolio"));
        assert!(paths.portfolio.starts_with(&paths.data_dir));
    }

    #[test]
    fn env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("ELEMENTGATE_CONFIG_DIR", "/custom/config");
        env.insert("ELEMENTGATE_DATA_DIR", "/custom/data");
        env.insert("ELEMENTGATE_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(paths.portfolio, PathBuf::from("/custom/data/portfolio"));
    }

    #[test]
    fn relative_and_empty_paths_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("ELEMENTGATE_CONFIG_DIR", "relative/path");
        env.insert("ELEMENTGATE_STATE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
        assert!(paths.state_dir.ends_with(APP_DIR));
    }

    #[test]
    fn portfolio_override_independent_of_data_dir() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("ELEMENTGATE_PORTFOLIO", "/projects/elements");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.portfolio, PathBuf::from("/projects/elements"));
        assert!(paths.data_dir.ends_with(APP_DIR));
    }

    #[test]
    fn runtime_dir_prefers_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("XDG_RUNTIME_DIR", "/run/user/1000");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.runtime_dir, Some(PathBuf::from("/run/user/1000/elementgate")));
        assert_eq!(paths.lock_dir(), PathBuf::from("/run/user/1000/elementgate/locks"));
    }

    #[test]
    fn convenience_accessors() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(paths.config_file().ends_with("config.toml"));
        assert!(paths.audit_log().ends_with("elementgate.audit.jsonl"));
        assert!(paths.lock_dir().ends_with("locks"));
    }

    #[test]
    fn ensure_dirs_creates_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap().to_string();
        let config = format!("{}/config", root);
        let data = format!("{}/data", root);
        let state = format!("{}/state", root);
        let runtime = format!("{}/run", root);
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("ELEMENTGATE_CONFIG_DIR", &config);
        env.insert("ELEMENTGATE_DATA_DIR", &data);
        env.insert("ELEMENTGATE_STATE_DIR", &state);
        env.insert("XDG_RUNTIME_DIR", &runtime);

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        paths.ensure_dirs().unwrap();
        assert!(paths.portfolio.is_dir());
        assert!(paths.lock_dir().is_dir());
    }
}
