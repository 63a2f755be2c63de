//! Environment and interpreter resolution for spawned workers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::config::ProcessBridgeConfig;
use crate::error::BridgeError;

/// Parent variables a worker sees without `inherit_env`.
pub const ENV_ALLOW_LIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TZ",
    "TMPDIR",
    "TEMP",
    "TMP",
    "SYSTEMROOT",
    "PYTHONPATH",
];

pub const ENV_PREFIX: &str = "POLYBRIDGE_";

fn venv_bin(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts")
    } else {
        venv.join("bin")
    }
}

/// Build the complete child environment from `parent`.
///
/// Order: allow-listed (or all) parent variables, virtualenv adjustments,
/// then `config.env` overrides.
pub fn build_child_env<I>(parent: I, config: &ProcessBridgeConfig) -> Result<BTreeMap<String, String>, BridgeError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = parent
        .into_iter()
        .filter(|(key, _)| {
            config.inherit_env || ENV_ALLOW_LIST.contains(&key.as_str()) || key.starts_with(ENV_PREFIX)
        })
        .collect();

    if let Some(venv) = &config.virtual_env {
        let bin = venv_bin(venv);
        if !bin.is_dir() {
            return Err(BridgeError::execution(
                "SpawnError",
                format!("virtual environment {} has no {}", venv.display(), bin.display()),
            ));
        }
        let mut entries = vec![bin];
        if let Some(path) = env.get("PATH") {
            entries.extend(std::env::split_paths(path));
        }
        let path = std::env::join_paths(entries).map_err(|e| {
            BridgeError::execution("SpawnError", format!("cannot build PATH for {}: {e}", venv.display()))
        })?;
        env.insert("PATH".to_string(), path.to_string_lossy().into_owned());
        env.insert("VIRTUAL_ENV".to_string(), venv.to_string_lossy().into_owned());
        env.remove("PYTHONHOME");
    }

    env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(env)
}

/// The interpreter to spawn: a bare name resolves inside the virtualenv when
/// it exists there.
pub fn resolve_interpreter(config: &ProcessBridgeConfig) -> PathBuf {
    let interpreter = &config.interpreter;
    let bare = interpreter.components().count() == 1 && !interpreter.is_absolute();
    if bare && let Some(venv) = &config.virtual_env {
        let candidate = venv_bin(venv).join(interpreter);
        if candidate.is_file() {
            return candidate;
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return exe;
            }
        }
    }
    interpreter.clone()
}
