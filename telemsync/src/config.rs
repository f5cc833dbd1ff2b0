use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::sync::ledger::LedgerConfig;
use crate::sync::transfer::{DEFAULT_MAX_TRANSFER_BYTES, TransferConfig};

const DEFAULT_IBT_FOLDER: &str = "telemetry/ibt";
const DEFAULT_CSV_PATH: &str = "telemetry/csv/%d";
const DEFAULT_LOCAL_PATTERN: &str = "telemetry/%t/%d";
const DEFAULT_LEDGER_FILE: &str = ".ibtignore";
const DEFAULT_VARS_FILE: &str = "SampleVars.txt";
const DEFAULT_TREE_CACHE_FILE: &str = "folder-tree.json";
const DEFAULT_HANDLES: u64 = 4;
const DEFAULT_WORKERS: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    AccessToken(String),
    Refresh {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeCacheConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub root: PathBuf,
    pub credentials: Credentials,
    pub drivers: Vec<String>,
    /// Remote folder holding the raw telemetry, relative to the Drive root.
    pub ibt_folder: PathBuf,
    /// Remote destination pattern; `%d` is the driver name.
    pub csv_path: String,
    /// Local download pattern under `root`; `%d` is the driver, `%t` is `ibt`.
    pub local_ibt: String,
    /// Local conversion pattern under `root`; `%d` is the driver, `%t` is `csv`.
    pub local_csv: String,
    pub converter: PathBuf,
    /// Program and arguments placed in front of the converter, e.g. `wine`.
    pub converter_launcher: Vec<String>,
    pub vars: PathBuf,
    pub ledger: LedgerConfig,
    pub tree_cache: TreeCacheConfig,
    pub handles: usize,
    pub transfer: TransferConfig,
    pub keep_local: bool,
}

impl RunConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let cwd = std::env::current_dir().context("current directory is unavailable")?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home, &cwd)
    }

    /// Builds the config from `lookup`, which plays the role of the environment.
    pub fn from_lookup<F>(lookup: F, home: &Path, cwd: &Path) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path_var = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| expand_with_home(value.trim(), home))
        };

        let root = path_var("TELEMSYNC_ROOT")
            .map(|path| cwd.join(path))
            .unwrap_or_else(|| cwd.to_path_buf());
        let credentials = credentials_from(&lookup)?;
        let drivers = parse_drivers(&lookup("TELEMSYNC_DRIVERS").unwrap_or_default());
        if drivers.is_empty() {
            anyhow::bail!("TELEMSYNC_DRIVERS must name at least one driver");
        }

        let converter = path_var("TELEMSYNC_CONVERTER")
            .map(|path| root.join(path))
            .context("TELEMSYNC_CONVERTER is not set")?;
        let vars = path_var("TELEMSYNC_VARS")
            .map(|path| root.join(path))
            .unwrap_or_else(|| default_vars_path(&converter));
        let converter_launcher = lookup("TELEMSYNC_CONVERTER_LAUNCHER")
            .map(|value| value.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let ledger = LedgerConfig {
            path: root.join(path_var("TELEMSYNC_LEDGER").unwrap_or_else(|| DEFAULT_LEDGER_FILE.into())),
            enabled: read_bool(&lookup, "TELEMSYNC_LEDGER_ENABLED", true),
            fresh_start: read_bool(&lookup, "TELEMSYNC_LEDGER_FRESH", false),
            write_back: read_bool(&lookup, "TELEMSYNC_LEDGER_WRITE_BACK", true),
        };
        let tree_cache = TreeCacheConfig {
            enabled: read_bool(&lookup, "TELEMSYNC_TREE_CACHE", true),
            path: path_var("TELEMSYNC_TREE_CACHE_PATH")
                .map(|path| root.join(path))
                .unwrap_or_else(default_tree_cache_path),
        };

        Ok(Self {
            credentials,
            drivers,
            ibt_folder: lookup("TELEMSYNC_IBT_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|| DEFAULT_IBT_FOLDER.into()),
            csv_path: lookup("TELEMSYNC_CSV_PATH").unwrap_or_else(|| DEFAULT_CSV_PATH.into()),
            local_ibt: lookup("TELEMSYNC_LOCAL_IBT")
                .unwrap_or_else(|| DEFAULT_LOCAL_PATTERN.into()),
            local_csv: lookup("TELEMSYNC_LOCAL_CSV")
                .unwrap_or_else(|| DEFAULT_LOCAL_PATTERN.into()),
            converter,
            converter_launcher,
            vars,
            ledger,
            tree_cache,
            handles: read_u64(&lookup, "TELEMSYNC_HANDLES", DEFAULT_HANDLES) as usize,
            transfer: TransferConfig {
                workers: read_u64(&lookup, "TELEMSYNC_WORKERS", DEFAULT_WORKERS) as usize,
                max_transfer_bytes: read_u64(
                    &lookup,
                    "TELEMSYNC_MAX_TRANSFER_BYTES",
                    DEFAULT_MAX_TRANSFER_BYTES,
                ),
            },
            keep_local: read_bool(&lookup, "TELEMSYNC_KEEP_LOCAL", false),
            root,
        })
    }

    /// Remote folder the driver's CSV files go to.
    pub fn csv_folder(&self, driver: &str) -> PathBuf {
        PathBuf::from(expand_pattern(&self.csv_path, driver, "csv"))
    }

    pub fn local_ibt_dir(&self, driver: &str) -> PathBuf {
        self.root.join(expand_pattern(&self.local_ibt, driver, "ibt"))
    }

    pub fn local_csv_dir(&self, driver: &str) -> PathBuf {
        self.root.join(expand_pattern(&self.local_csv, driver, "csv"))
    }
}

fn credentials_from<F>(lookup: &F) -> anyhow::Result<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = lookup("TELEMSYNC_TOKEN").filter(|t| !t.is_empty()) {
        return Ok(Credentials::AccessToken(token));
    }
    let client_id = lookup("TELEMSYNC_CLIENT_ID")
        .context("neither TELEMSYNC_TOKEN nor TELEMSYNC_CLIENT_ID is set")?;
    let client_secret =
        lookup("TELEMSYNC_CLIENT_SECRET").context("TELEMSYNC_CLIENT_SECRET is not set")?;
    let refresh_token =
        lookup("TELEMSYNC_REFRESH_TOKEN").context("TELEMSYNC_REFRESH_TOKEN is not set")?;
    Ok(Credentials::Refresh {
        client_id,
        client_secret,
        refresh_token,
    })
}

fn parse_drivers(value: &str) -> Vec<String> {
    let mut drivers: Vec<String> = Vec::new();
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !drivers.iter().any(|d| d == name) {
            drivers.push(name.to_string());
        }
    }
    drivers
}

/// Substitutes `%d` with the driver name and `%t` with the file type.
pub fn expand_pattern(pattern: &str, driver: &str, kind: &str) -> String {
    pattern.replace("%t", kind).replace("%d", driver)
}

fn default_vars_path(converter: &Path) -> PathBuf {
    converter
        .parent()
        .map(|dir| dir.join(DEFAULT_VARS_FILE))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VARS_FILE))
}

fn default_tree_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("telemsync")
        .join(DEFAULT_TREE_CACHE_FILE)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<RunConfig> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunConfig::from_lookup(
            |name| env.get(name).cloned(),
            Path::new("/home/racer"),
            Path::new("/work"),
        )
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("TELEMSYNC_TOKEN", "token-1"),
        ("TELEMSYNC_DRIVERS", "alice, bob"),
        ("TELEMSYNC_CONVERTER", "tools/stint.exe"),
    ];

    #[test]
    fn minimal_env_uses_defaults() {
        let cfg = config(MINIMAL).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/work"));
        assert_eq!(cfg.credentials, Credentials::AccessToken("token-1".into()));
        assert_eq!(cfg.drivers, vec!["alice", "bob"]);
        assert_eq!(cfg.ibt_folder, PathBuf::from("telemetry/ibt"));
        assert_eq!(cfg.converter, PathBuf::from("/work/tools/stint.exe"));
        assert_eq!(cfg.vars, PathBuf::from("/work/tools/SampleVars.txt"));
        assert_eq!(cfg.ledger.path, PathBuf::from("/work/.ibtignore"));
        assert!(cfg.ledger.enabled && cfg.ledger.write_back && !cfg.ledger.fresh_start);
        assert!(cfg.tree_cache.enabled);
        assert_eq!(cfg.handles, 4);
        assert_eq!(cfg.transfer.workers, 4);
        assert_eq!(cfg.transfer.max_transfer_bytes, DEFAULT_MAX_TRANSFER_BYTES);
        assert!(!cfg.keep_local);
        assert!(cfg.converter_launcher.is_empty());
    }

    #[test]
    fn driver_patterns_expand() {
        let cfg = config(MINIMAL).unwrap();
        assert_eq!(cfg.csv_folder("alice"), PathBuf::from("telemetry/csv/alice"));
        assert_eq!(
            cfg.local_ibt_dir("alice"),
            PathBuf::from("/work/telemetry/ibt/alice")
        );
        assert_eq!(
            cfg.local_csv_dir("bob"),
            PathBuf::from("/work/telemetry/csv/bob")
        );
    }

    #[test]
    fn root_expands_tilde() {
        let mut vars = MINIMAL.to_vec();
        vars.push(("TELEMSYNC_ROOT", "~/telemetry"));
        let cfg = config(&vars).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/home/racer/telemetry"));
        assert_eq!(cfg.ledger.path, PathBuf::from("/home/racer/telemetry/.ibtignore"));
    }

    #[test]
    fn numeric_and_bool_overrides() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("TELEMSYNC_HANDLES", "2"),
            ("TELEMSYNC_WORKERS", "0"),
            ("TELEMSYNC_MAX_TRANSFER_BYTES", "nope"),
            ("TELEMSYNC_LEDGER_FRESH", "YES"),
            ("TELEMSYNC_TREE_CACHE", "off"),
            ("TELEMSYNC_KEEP_LOCAL", "1"),
            ("TELEMSYNC_CONVERTER_LAUNCHER", "wine  --debug"),
        ]);
        let cfg = config(&vars).unwrap();
        assert_eq!(cfg.handles, 2);
        assert_eq!(cfg.transfer.workers, 4);
        assert_eq!(cfg.transfer.max_transfer_bytes, DEFAULT_MAX_TRANSFER_BYTES);
        assert!(cfg.ledger.fresh_start);
        assert!(!cfg.tree_cache.enabled);
        assert!(cfg.keep_local);
        assert_eq!(cfg.converter_launcher, vec!["wine", "--debug"]);
    }

    #[test]
    fn refresh_credentials_are_used_without_token() {
        let cfg = config(&[
            ("TELEMSYNC_CLIENT_ID", "id"),
            ("TELEMSYNC_CLIENT_SECRET", "secret"),
            ("TELEMSYNC_REFRESH_TOKEN", "refresh"),
            ("TELEMSYNC_DRIVERS", "alice"),
            ("TELEMSYNC_CONVERTER", "/opt/stint.exe"),
        ])
        .unwrap();
        assert_eq!(
            cfg.credentials,
            Credentials::Refresh {
                client_id: "id".into(),
                client_secret: "secret".into(),
                refresh_token: "refresh".into(),
            }
        );
        assert_eq!(cfg.converter, PathBuf::from("/opt/stint.exe"));
    }

    #[test]
    fn missing_required_settings_are_errors() {
        assert!(config(&[("TELEMSYNC_DRIVERS", "a"), ("TELEMSYNC_CONVERTER", "c")]).is_err());
        assert!(config(&[("TELEMSYNC_TOKEN", "t"), ("TELEMSYNC_CONVERTER", "c")]).is_err());
        assert!(config(&[("TELEMSYNC_TOKEN", "t"), ("TELEMSYNC_DRIVERS", " , ")]).is_err());
        assert!(config(&[("TELEMSYNC_TOKEN", "t"), ("TELEMSYNC_DRIVERS", "a")]).is_err());
    }

    #[test]
    fn duplicate_drivers_are_collapsed() {
        assert_eq!(parse_drivers("a,b, a ,,c"), vec!["a", "b", "c"]);
    }
}
