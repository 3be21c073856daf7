use std::{
    net::{Ipv6Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::core::{
    classify::default_markers,
    domain::{GenerationLimits, OwnerId},
    janitor::JanitorConfig,
    scheduler::SchedulerConfig,
    service::UploadPolicy,
    workspace::Roots,
};

const DEFAULT_GENERATOR_PATH: &str = "/opt/archipelago/ArchipelagoGenerate";
const DEFAULT_GENERATOR_ARGS: &str = "--player_files {input_dir} --outputpath {working_dir}";

/// Service configuration loaded from `GAMEGEN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub generator_path: PathBuf,
    /// Argument template, see `NativeGenerator::new`.
    pub generator_args: Vec<String>,
    pub roots: Roots,
    pub scheduler: SchedulerConfig,
    pub upload: UploadPolicy,
    pub artifact_extension: String,
    pub markers: Vec<String>,
    pub extract_patches: bool,
    pub janitor: JanitorConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from any variable source; unset and empty
    /// variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let data_dir =
            PathBuf::from(get("GAMEGEN_DATA_PATH").unwrap_or_else(|| "./data".to_string()));
        let defaults = Roots::under(&data_dir);
        let roots = Roots {
            uploads: get("GAMEGEN_UPLOADS_PATH").map_or(defaults.uploads, PathBuf::from),
            games: get("GAMEGEN_GAMES_PATH").map_or(defaults.games, PathBuf::from),
            patches: get("GAMEGEN_PATCHES_PATH").map_or(defaults.patches, PathBuf::from),
        };

        let workers: usize = parse(&get, "GAMEGEN_WORKERS", 1)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                var: "GAMEGEN_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        let limits = GenerationLimits {
            timeout: Duration::from_secs(parse(&get, "GAMEGEN_TIMEOUT_SECS", 600)?),
            memory_bytes: parse_opt(&get, "GAMEGEN_MEMORY_LIMIT_BYTES")?,
            cpu_time_secs: parse_opt(&get, "GAMEGEN_CPU_LIMIT_SECS")?,
            max_output_bytes: parse(&get, "GAMEGEN_MAX_OUTPUT_BYTES", 1024 * 1024)?,
        };

        let upload = UploadPolicy {
            extensions: get("GAMEGEN_UPLOAD_EXTENSIONS")
                .map(|v| {
                    split_list(&v, ',')
                        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                        .collect()
                })
                .unwrap_or_else(|| UploadPolicy::default().extensions),
            max_bytes: parse(&get, "GAMEGEN_MAX_UPLOAD_BYTES", 1024 * 1024)?,
            allowed_owners: get("GAMEGEN_ALLOWED_OWNERS")
                .map(|v| split_list(&v, ',').map(|o| OwnerId(o.to_string())).collect())
                .unwrap_or_default(),
        };

        Ok(Self {
            listen_addr: parse(
                &get,
                "GAMEGEN_LISTEN_ADDR",
                SocketAddr::from((Ipv6Addr::LOCALHOST, 50051)),
            )?,
            generator_path: get("GAMEGEN_GENERATOR_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_GENERATOR_PATH), PathBuf::from),
            generator_args: get("GAMEGEN_GENERATOR_ARGS")
                .unwrap_or_else(|| DEFAULT_GENERATOR_ARGS.to_string())
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            roots,
            scheduler: SchedulerConfig {
                workers,
                timeout_retries: parse(&get, "GAMEGEN_TIMEOUT_RETRIES", 1)?,
                limits,
            },
            upload,
            artifact_extension: get("GAMEGEN_ARTIFACT_EXTENSION")
                .map(|e| e.trim_start_matches('.').to_string())
                .unwrap_or_else(|| "zip".to_string()),
            markers: get("GAMEGEN_VALIDATION_MARKERS")
                .map(|v| split_list(&v, '|').map(str::to_string).collect())
                .unwrap_or_else(default_markers),
            extract_patches: parse_bool(&get, "GAMEGEN_EXTRACT_PATCHES", true)?,
            janitor: JanitorConfig {
                retention: Duration::from_secs(parse(&get, "GAMEGEN_RETENTION_SECS", 24 * 3600)?),
                interval: Duration::from_secs(parse(&get, "GAMEGEN_JANITOR_INTERVAL_SECS", 3600)?),
            },
        })
    }
}

fn split_list(value: &str, sep: char) -> impl Iterator<Item = &str> {
    value.split(sep).map(str::trim).filter(|item| !item.is_empty())
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, var)?.unwrap_or(default))
}

fn parse_opt<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_bool<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected true or false".to_string(),
            }),
        },
    }
}
