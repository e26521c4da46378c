use crate::backup::function_path;
use crate::backup::planner::BackupSpec;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::backup::retention::RetentionPolicy;
use crate::backup::validate::{
    validate_dataset_name, validate_file_exist, validate_host, validate_source_pattern,
};
use crate::backup::zfs::runner::{RemoteAuth, Runner};
use crate::backup::zfs::{DatasetKind, Zfs};
use function_name::named;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use validator::{Validate, ValidationError};

/// Root of the YAML configuration file.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_remote_defaults))]
pub struct BackupConfig {
    /// `host` or `host:port` of the destination
    pub host: Option<Arc<str>>,
    pub user: Option<Arc<str>>,
    pub key: Option<Arc<Path>>,
    /// Maximum number of tasks running at once
    #[serde(default)]
    pub threads: usize,
    /// Back up to pools of this machine instead of a remote one
    #[serde(default)]
    pub local_mode: bool,
    #[validate(length(min = 1, message = "at least one backup section is required"), nested)]
    pub backup: Vec<BackupSection>,
}

#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_section))]
pub struct BackupSection {
    #[validate(custom(function = validate_source_pattern))]
    pub fs: Arc<str>,
    #[validate(custom(function = validate_dataset_name))]
    pub dst_pool: Arc<str>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default, deserialize_with = "RetentionPolicy::deserialize_optional")]
    pub expire: Option<RetentionPolicy>,
    pub remote_prefix: Option<Arc<str>>,
    pub local_mode: Option<bool>,
    pub host: Option<Arc<str>>,
    pub user: Option<Arc<str>>,
    pub key: Option<Arc<Path>>,
}

impl BackupSection {
    fn has_remote_settings(&self) -> bool {
        self.host.is_some() || self.user.is_some() || self.key.is_some()
    }
}

fn validate_remote_auth(
    host: Option<&Arc<str>>,
    key: Option<&Arc<Path>>,
) -> std::result::Result<(), ValidationError> {
    if let Some(host) = host {
        validate_host(host)?;
    }
    if let Some(key) = key {
        validate_file_exist(key)?;
    }
    Ok(())
}

fn validate_remote_defaults(config: &BackupConfig) -> std::result::Result<(), ValidationError> {
    validate_remote_auth(config.host.as_ref(), config.key.as_ref())?;
    if config.local_mode {
        if config.host.is_some() || config.user.is_some() || config.key.is_some() {
            return Err(ValidationError::new("LocalModeConflict").with_message(
                "'host', 'user' and 'key' must not be set with 'local_mode'".into(),
            ));
        }
        return Ok(());
    }

    // sections inheriting the global settings need all three of them
    let inheriting = config.backup.iter().filter(|s| s.local_mode.is_none());
    for section in inheriting {
        for (name, missing) in [
            ("host", section.host.is_none() && config.host.is_none()),
            ("user", section.user.is_none() && config.user.is_none()),
            ("key", section.key.is_none() && config.key.is_none()),
        ] {
            if missing {
                return Err(ValidationError::new("MissingRemoteSetting").with_message(
                    format!("{name} not declared for backup section {:?}", section.fs).into(),
                ));
            }
        }
    }
    Ok(())
}

fn validate_section(section: &BackupSection) -> std::result::Result<(), ValidationError> {
    if let Some(prefix) = &section.remote_prefix {
        validate_dataset_name(prefix)?;
    }
    validate_remote_auth(section.host.as_ref(), section.key.as_ref())
}

impl BackupConfig {
    /// Reads and validates the configuration file.
    #[named]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading config from {:?}", path);
        let file = File::open(path)
            .map_err(Error::from)
            .with_msg(format!("Cannot open config file {:?}", path))?;
        let config: BackupConfig = serde_yml::from_reader(file)
            .map_err(Error::from)
            .with_debug_object_and_fn_name(path.to_path_buf(), function_path!())?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Invalid config file {:?}", path))?;

        for section in config.backup.iter().filter(|s| s.remote_prefix.is_some()) {
            warn!(
                "{}: 'remote_prefix' set; fs with this name on destination may be overwritten",
                section.fs
            );
        }
        Ok(config)
    }

    /// Configured parallelism, 0 being read as 1.
    pub fn max_parallel(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.threads).unwrap_or_else(|| {
            warn!("threads not set, or set to '0', setting it to '1'");
            NonZeroUsize::MIN
        })
    }

    /// Resolves every section into a [`BackupSpec`].
    ///
    /// A section whose local/remote settings do not add up is skipped with
    /// a warning, the others are still returned.
    pub fn specs(&self) -> Vec<BackupSpec> {
        self.backup
            .iter()
            .filter_map(|section| match self.destination_of(section) {
                Ok(destination) => Some(
                    BackupSpec::builder()
                        .source_pattern(section.fs.clone())
                        .recursive(section.recursive)
                        .destination_root(section.dst_pool.clone())
                        .maybe_destination_prefix(section.remote_prefix.clone())
                        .maybe_retention(section.expire)
                        .destination(destination)
                        .build(),
                ),
                Err(reason) => {
                    warn!("{}: {reason}; skip this backup section", section.fs);
                    None
                }
            })
            .collect()
    }

    fn destination_of(&self, section: &BackupSection) -> std::result::Result<Runner, String> {
        if section.local_mode.unwrap_or(self.local_mode) {
            if section.has_remote_settings() {
                return Err("'host', 'user' and 'key' are mutually exclusive with 'local_mode'".into());
            }
            return Ok(Runner::Local);
        }

        let host = section
            .host
            .as_ref()
            .or(self.host.as_ref())
            .ok_or("host not declared")?;
        let user = section
            .user
            .as_ref()
            .or(self.user.as_ref())
            .ok_or("user not declared")?;
        let key = section
            .key
            .as_ref()
            .or(self.key.as_ref())
            .ok_or("key not declared")?;
        let (host, port) =
            RemoteAuth::split_host(host).ok_or_else(|| format!("invalid host {host:?}"))?;

        Ok(Runner::Remote(
            RemoteAuth::builder()
                .host(host)
                .port(port)
                .user(user.clone())
                .key(key.clone())
                .build(),
        ))
    }
}

/// Builds one spec per local filesystem whose `property` is `true`.
///
/// Failing to read the property of any filesystem fails the whole scan.
pub fn discover_by_property(
    source: &dyn Zfs,
    property: &str,
    remote_root: &str,
    expire: Option<RetentionPolicy>,
    destination: Runner,
) -> Result<Vec<BackupSpec>> {
    let mut specs = Vec::new();
    for fs in source.list("", DatasetKind::Filesystem, true)? {
        let value = source
            .get_property(&fs, property)
            .with_msg(format!("Cannot read {property} of {fs}"))?;
        if value != "true" {
            continue;
        }
        debug!("{fs}: {property} is set, adding to backup");
        specs.push(
            BackupSpec::builder()
                .source_pattern(fs)
                .destination_root(remote_root)
                .maybe_retention(expire)
                .destination(destination.clone())
                .build(),
        );
    }
    info!("{} filesystem(s) have {property} set", specs.len());
    Ok(specs)
}
