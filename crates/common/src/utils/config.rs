use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Layers an optional config file and `<PREFIX>_*` environment variables
/// over the serialized `defaults`.
pub fn load_layered<T, P>(defaults: &T, path: Option<P>, env_prefix: &str) -> Result<T>
where
    T: DeserializeOwned + serde::Serialize,
    P: AsRef<Path>,
{
    let defaults = Config::try_from(defaults).context("Failed to encode default configuration")?;
    let mut builder = Config::builder().add_source(defaults);

    if let Some(path) = path {
        let path_str = path.as_ref().to_str().context("Invalid config path")?;
        builder = builder.add_source(File::with_name(path_str));
    }

    let settings = builder
        .add_source(Environment::with_prefix(env_prefix).try_parsing(true))
        .build()
        .context("Failed to build configuration")?;

    settings.try_deserialize::<T>().context("Failed to deserialize configuration")
}
