use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use validator::Validate;

use crate::error::{ExpandError, Result};
use crate::utils::constants::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_TIME_START, DEFAULT_TIME_STOP, DEFAULT_WRITER_THREADS,
    ENV_PREFIX,
};

/// Execution runtime used to drive the work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Runner {
    /// One work item after another on the calling thread
    Direct,
    /// Rayon worker pool feeding a pool of writer threads
    Parallel,
}

impl std::fmt::Display for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Runner::Direct => write!(f, "direct"),
            Runner::Parallel => write!(f, "parallel"),
        }
    }
}

/// Codec applied to every chunk of the output store.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    /// Raw little-endian chunks
    None,
    /// Zstandard
    #[default]
    Zstd,
    /// Blosc with LZ4 and byte shuffle
    BloscLz4,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Zstd => write!(f, "zstd"),
            Compression::BloscLz4 => write!(f, "blosc-lz4"),
        }
    }
}

/// Resolved settings for one expansion run.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExpandConfig {
    pub input_path: PathBuf,

    pub output_path: PathBuf,

    #[validate(length(min = 1))]
    pub time_start: String,

    #[validate(length(min = 1))]
    pub time_stop: String,

    #[validate(range(min = 1))]
    pub time_chunk_size: Option<usize>,

    pub runner: Runner,

    pub compression: Compression,

    #[validate(range(min = 1))]
    pub workers: usize,

    #[validate(range(min = 1))]
    pub writers: usize,

    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

/// Partially specified settings from one source (file, environment, CLI).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverrides {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub time_start: Option<String>,
    pub time_stop: Option<String>,
    pub time_chunk_size: Option<usize>,
    pub runner: Option<Runner>,
    pub compression: Option<Compression>,
    pub workers: Option<usize>,
    pub writers: Option<usize>,
    pub channel_capacity: Option<usize>,
}

impl ConfigOverrides {
    /// Values set in `other` take precedence.
    pub fn merge(self, other: ConfigOverrides) -> Self {
        Self {
            input_path: other.input_path.or(self.input_path),
            output_path: other.output_path.or(self.output_path),
            time_start: other.time_start.or(self.time_start),
            time_stop: other.time_stop.or(self.time_stop),
            time_chunk_size: other.time_chunk_size.or(self.time_chunk_size),
            runner: other.runner.or(self.runner),
            compression: other.compression.or(self.compression),
            workers: other.workers.or(self.workers),
            writers: other.writers.or(self.writers),
            channel_capacity: other.channel_capacity.or(self.channel_capacity),
        }
    }
}

impl ExpandConfig {
    /// Layer an optional config file, `CLIM_EXPAND_*` environment variables
    /// and command-line values (highest precedence), then resolve.
    pub fn load(config_file: Option<&Path>, cli: ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let layered: ConfigOverrides = builder.build()?.try_deserialize()?;
        Self::resolve(layered.merge(cli))
    }

    /// Fill defaults and check required values.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        let input_path = overrides
            .input_path
            .ok_or_else(|| ExpandError::config("input_path is required"))?;
        let output_path = overrides
            .output_path
            .ok_or_else(|| ExpandError::config("output_path is required"))?;

        ensure_distinct_paths(&input_path, &output_path)?;

        let config = Self {
            input_path,
            output_path,
            time_start: overrides
                .time_start
                .unwrap_or_else(|| DEFAULT_TIME_START.to_string()),
            time_stop: overrides
                .time_stop
                .unwrap_or_else(|| DEFAULT_TIME_STOP.to_string()),
            time_chunk_size: overrides.time_chunk_size,
            runner: overrides.runner.unwrap_or(Runner::Parallel),
            compression: overrides.compression.unwrap_or_default(),
            workers: overrides.workers.unwrap_or_else(num_cpus::get),
            writers: overrides.writers.unwrap_or(DEFAULT_WRITER_THREADS),
            channel_capacity: overrides
                .channel_capacity
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Absolute form of `path` with symlinks, `.` and `..` resolved.
///
/// The longest existing prefix is canonicalized; components past it are
/// applied lexically, so paths that do not exist yet still resolve.
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let components: Vec<Component> = absolute.components().collect();

    let mut split = components.len();
    let mut resolved = loop {
        let prefix: PathBuf = components[..split].iter().collect();
        if let Ok(canonical) = prefix.canonicalize() {
            break canonical;
        }
        if split == 0 {
            return Err(ExpandError::config(format!(
                "Cannot resolve path {}",
                path.display()
            )));
        }
        split -= 1;
    };

    for component in &components[split..] {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    Ok(resolved)
}

/// Reject an output store that is, contains, or sits inside the input store.
/// Replacing the output removes its directory, so any overlap would destroy
/// the climatology.
pub fn ensure_distinct_paths(input_path: &Path, output_path: &Path) -> Result<()> {
    let input = resolve_path(input_path)?;
    let output = resolve_path(output_path)?;

    if output == input {
        return Err(ExpandError::config(format!(
            "output_path {} resolves to the input store {}",
            output_path.display(),
            input.display()
        )));
    }
    if output.starts_with(&input) {
        return Err(ExpandError::config(format!(
            "output_path {} is inside the input store {}",
            output_path.display(),
            input.display()
        )));
    }
    if input.starts_with(&output) {
        return Err(ExpandError::config(format!(
            "input_path {} is inside the output store {}",
            input_path.display(),
            output.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn store_paths(input: PathBuf, output: PathBuf) -> ConfigOverrides {
        ConfigOverrides {
            input_path: Some(input),
            output_path: Some(output),
            ..Default::default()
        }
    }

    fn paths() -> ConfigOverrides {
        ConfigOverrides {
            input_path: Some(PathBuf::from("clim.zarr")),
            output_path: Some(PathBuf::from("out.zarr")),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ExpandConfig::resolve(paths()).unwrap();
        assert_eq!(config.time_start, "2017-01-01");
        assert_eq!(config.time_stop, "2017-12-31");
        assert_eq!(config.time_chunk_size, None);
        assert_eq!(config.runner, Runner::Parallel);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_missing_paths_rejected() {
        let result = ExpandConfig::resolve(ConfigOverrides::default());
        assert!(matches!(result, Err(ExpandError::Configuration(ref m)) if m.contains("input_path")));

        let result = ExpandConfig::resolve(ConfigOverrides {
            input_path: Some(PathBuf::from("clim.zarr")),
            ..Default::default()
        });
        assert!(matches!(result, Err(ExpandError::Configuration(ref m)) if m.contains("output_path")));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let result = ExpandConfig::resolve(ConfigOverrides {
            time_chunk_size: Some(0),
            ..paths()
        });
        assert!(matches!(result, Err(ExpandError::Configuration(_))));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "input_path = \"from-file.zarr\"").unwrap();
        writeln!(file, "output_path = \"out.zarr\"").unwrap();
        writeln!(file, "time_chunk_size = 48").unwrap();
        writeln!(file, "runner = \"direct\"").unwrap();

        let cli = ConfigOverrides {
            input_path: Some(PathBuf::from("from-cli.zarr")),
            ..Default::default()
        };
        let config = ExpandConfig::load(Some(file.path()), cli).unwrap();

        assert_eq!(config.input_path, PathBuf::from("from-cli.zarr"));
        assert_eq!(config.output_path, PathBuf::from("out.zarr"));
        assert_eq!(config.time_chunk_size, Some(48));
        assert_eq!(config.runner, Runner::Direct);
    }

    #[test]
    fn test_compression_default_and_override() {
        assert_eq!(ExpandConfig::resolve(paths()).unwrap().compression, Compression::Zstd);

        let config = ExpandConfig::resolve(ConfigOverrides {
            compression: Some(Compression::BloscLz4),
            ..paths()
        })
        .unwrap();
        assert_eq!(config.compression.to_string(), "blosc-lz4");
    }

    #[test]
    fn test_same_path_rejected() {
        let result = ExpandConfig::resolve(store_paths(
            PathBuf::from("clim.zarr"),
            PathBuf::from("clim.zarr"),
        ));
        assert!(matches!(result, Err(ExpandError::Configuration(_))));
    }

    #[test]
    fn test_dotted_alias_of_input_rejected() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("clim.zarr");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("zarr.json"), "{}").unwrap();

        let aliases = [
            tmp.path().join("sub").join("..").join("clim.zarr"),
            tmp.path().join(".").join("clim.zarr"),
            input.join("."),
        ];
        for alias in aliases {
            let result = ExpandConfig::resolve(store_paths(input.clone(), alias.clone()));
            assert!(
                matches!(result, Err(ExpandError::Configuration(ref m)) if m.contains("input store")),
                "{} accepted",
                alias.display()
            );
        }
        assert!(input.join("zarr.json").is_file());
    }

    #[test]
    fn test_nested_stores_rejected() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("clim.zarr");
        fs::create_dir_all(&input).unwrap();

        let inside_input = ExpandConfig::resolve(store_paths(input.clone(), input.join("out.zarr")));
        assert!(matches!(inside_input, Err(ExpandError::Configuration(_))));

        let around_input = ExpandConfig::resolve(store_paths(input.clone(), tmp.path().to_path_buf()));
        assert!(matches!(around_input, Err(ExpandError::Configuration(_))));

        let sibling = ExpandConfig::resolve(store_paths(input.clone(), tmp.path().join("out.zarr")));
        assert!(sibling.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_to_input_rejected() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("clim.zarr");
        fs::create_dir_all(&input).unwrap();
        let link = tmp.path().join("link.zarr");
        std::os::unix::fs::symlink(&input, &link).unwrap();

        let result = ExpandConfig::resolve(store_paths(input.clone(), link));
        assert!(matches!(result, Err(ExpandError::Configuration(_))));
        assert!(input.is_dir());
    }

    #[test]
    fn test_resolve_path_handles_missing_components() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().canonicalize().unwrap();

        let resolved = resolve_path(&tmp.path().join("a").join("..").join("b").join("c.zarr")).unwrap();
        assert_eq!(resolved, base.join("b").join("c.zarr"));
    }
}
