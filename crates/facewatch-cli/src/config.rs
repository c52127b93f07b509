use anyhow::{Context, Result};
use facewatch_core::RecognitionConfig;
use std::path::PathBuf;
use std::str::FromStr;

/// Resolved runtime settings: database location plus recognition tunables.
pub struct Settings {
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// Config file the tunables were read from, if any.
    pub config_path: Option<PathBuf>,
    /// Directory for per-change database snapshots.
    pub backup_dir: Option<PathBuf>,
    pub recognition: RecognitionConfig,
}

impl Settings {
    /// Resolve from command-line flags, then `FACEWATCH_*` environment
    /// variables, then built-in defaults.
    pub fn resolve(
        db: Option<PathBuf>,
        config: Option<PathBuf>,
        backup_dir: Option<PathBuf>,
    ) -> Result<Self> {
        Self::resolve_with(db, config, backup_dir, |key| std::env::var(key).ok())
    }

    fn resolve_with(
        db: Option<PathBuf>,
        config: Option<PathBuf>,
        backup_dir: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let config_path = config.or_else(|| env("FACEWATCH_CONFIG").map(PathBuf::from));
        let mut recognition = match &config_path {
            Some(path) => RecognitionConfig::load(path)?,
            None => RecognitionConfig::default(),
        };
        apply_env(&mut recognition, &env)?;
        recognition.validate()?;

        let db_path = db
            .or_else(|| env("FACEWATCH_DB_PATH").map(PathBuf::from))
            .unwrap_or_else(|| default_data_dir(&env).join("faces.db"));
        let backup_dir = backup_dir
            .or_else(|| env("FACEWATCH_BACKUP_DIR").map(PathBuf::from))
            .filter(|dir| !dir.as_os_str().is_empty());

        Ok(Self {
            db_path,
            config_path,
            backup_dir,
            recognition,
        })
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

fn apply_env(config: &mut RecognitionConfig, env: &impl Fn(&str) -> Option<String>) -> Result<()> {
    override_from(env, "FACEWATCH_TOLERANCE", &mut config.tolerance)?;
    override_from(env, "FACEWATCH_QUALITY_THRESHOLD", &mut config.quality_threshold)?;
    override_from(env, "FACEWATCH_SAMPLE_COUNT", &mut config.sample_count)?;
    override_from(env, "FACEWATCH_IOU_THRESHOLD", &mut config.iou_threshold)?;
    override_from(env, "FACEWATCH_TRACK_EXPIRY_FRAMES", &mut config.track_expiry_frames)?;
    override_from(env, "FACEWATCH_VOTE_WINDOW_SIZE", &mut config.vote_window_size)?;
    override_from(env, "FACEWATCH_FRAME_SKIP", &mut config.frame_skip)?;
    Ok(())
}

/// Replace `slot` when `key` is set. A value that does not parse is an error.
fn override_from<T>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = env(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid configuration: {key}={raw:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_db_path_precedence() {
        let env = env_of(&[("FACEWATCH_DB_PATH", "/env/faces.db"), ("HOME", "/home/u")]);
        let flag = Settings::resolve_with(Some("/flag.db".into()), None, None, &env).unwrap();
        assert_eq!(flag.db_path, PathBuf::from("/flag.db"));
        let from_env = Settings::resolve_with(None, None, None, &env).unwrap();
        assert_eq!(from_env.db_path, PathBuf::from("/env/faces.db"));
    }

    #[test]
    fn test_default_db_path_under_data_home() {
        let xdg =
            Settings::resolve_with(None, None, None, env_of(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(xdg.db_path, PathBuf::from("/data/facewatch/faces.db"));
        let home =
            Settings::resolve_with(None, None, None, env_of(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(home.db_path, PathBuf::from("/home/u/.local/share/facewatch/faces.db"));
    }

    #[test]
    fn test_env_overrides_apply() {
        let env = env_of(&[("FACEWATCH_TOLERANCE", "0.45"), ("FACEWATCH_FRAME_SKIP", "3")]);
        let settings = Settings::resolve_with(None, None, None, env).unwrap();
        assert!((settings.recognition.tolerance - 0.45).abs() < 1e-6);
        assert_eq!(settings.recognition.frame_skip, 3);
        assert_eq!(settings.recognition.sample_count, 5);
    }

    #[test]
    fn test_invalid_env_value_is_error() {
        let env = env_of(&[("FACEWATCH_SAMPLE_COUNT", "five")]);
        let err = Settings::resolve_with(None, None, None, env).err().unwrap();
        assert!(err.to_string().contains("FACEWATCH_SAMPLE_COUNT"));

        let env = env_of(&[("FACEWATCH_TOLERANCE", "-1")]);
        assert!(Settings::resolve_with(None, None, None, env).is_err());
    }

    #[test]
    fn test_backup_dir_precedence() {
        let env = env_of(&[("FACEWATCH_BACKUP_DIR", "/env/backups")]);
        let flag = Settings::resolve_with(None, None, Some("/flag/backups".into()), &env).unwrap();
        assert_eq!(flag.backup_dir, Some(PathBuf::from("/flag/backups")));
        let from_env = Settings::resolve_with(None, None, None, &env).unwrap();
        assert_eq!(from_env.backup_dir, Some(PathBuf::from("/env/backups")));

        let blank = env_of(&[("FACEWATCH_BACKUP_DIR", "")]);
        let unset = Settings::resolve_with(None, None, None, blank).unwrap();
        assert_eq!(unset.backup_dir, None);
    }

    #[test]
    fn test_config_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.toml");
        std::fs::write(&path, "tolerance = 0.5\nsample_count = 3\n").unwrap();

        let env = env_of(&[("FACEWATCH_SAMPLE_COUNT", "4")]);
        let settings = Settings::resolve_with(None, Some(path.clone()), None, env).unwrap();
        assert_eq!(settings.config_path, Some(path));
        assert!((settings.recognition.tolerance - 0.5).abs() < 1e-6);
        assert_eq!(settings.recognition.sample_count, 4);
    }
}
