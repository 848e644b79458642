//! Plugin registration.
//!
//! An app directory is registered by writing a small locator file into the
//! plugins directory, naming the plugin and where it lives on disk.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::PLUGIN_DEFINITION_FILE;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("App given was not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Plugins directory location given is not a directory: {}", .0.display())]
    PluginsDirNotADirectory(PathBuf),

    #[error("Could not read {} in app {}: {source}", PLUGIN_DEFINITION_FILE, path.display())]
    DefinitionRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid {} in app {}: {source}", PLUGIN_DEFINITION_FILE, path.display())]
    DefinitionParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid plugin identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("App not registered due to write failure at {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Deserialize)]
struct PluginDefinition {
    identifier: String,
}

/// Contents of `<plugins_dir>/<identifier>.json`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginLocator {
    pub identifier: String,
    pub plugin_location: PathBuf,
}

/// Register the app in `app_dir` with the server by writing its locator file
/// into `plugins_dir`. Returns the path of the written file.
pub fn install_app(app_dir: &Path, plugins_dir: &Path) -> Result<PathBuf, PluginError> {
    if !plugins_dir.is_dir() {
        return Err(PluginError::PluginsDirNotADirectory(plugins_dir.to_path_buf()));
    }
    if !app_dir.is_dir() {
        return Err(PluginError::NotADirectory(app_dir.to_path_buf()));
    }
    let app_dir = app_dir
        .canonicalize()
        .map_err(|_| PluginError::NotADirectory(app_dir.to_path_buf()))?;

    let definition = read_definition(&app_dir)?;
    validate_identifier(&definition.identifier)?;
    tracing::info!(identifier = %definition.identifier, "Registering app with server");

    let locator = PluginLocator {
        identifier: definition.identifier,
        plugin_location: app_dir,
    };
    let destination = plugins_dir.join(format!("{}.json", locator.identifier));
    let contents = serde_json::to_vec_pretty(&locator).map_err(|e| PluginError::Write {
        path: destination.clone(),
        source: io::Error::other(e),
    })?;

    tracing::debug!(destination = %destination.display(), "Writing plugin locator file");
    write_locator(&destination, &contents).map_err(|source| PluginError::Write {
        path: destination.clone(),
        source,
    })?;

    tracing::info!(
        identifier = %locator.identifier,
        location = %locator.plugin_location.display(),
        "App installed and registered with server"
    );
    Ok(destination)
}

fn read_definition(app_dir: &Path) -> Result<PluginDefinition, PluginError> {
    let path = app_dir.join(PLUGIN_DEFINITION_FILE);
    let contents = fs::read_to_string(&path).map_err(|source| PluginError::DefinitionRead {
        path: app_dir.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| PluginError::DefinitionParse {
        path: app_dir.to_path_buf(),
        source,
    })
}

/// The identifier becomes a file name, so it must stay inside the plugins dir.
fn validate_identifier(identifier: &str) -> Result<(), PluginError> {
    let invalid = identifier.is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier.contains(['/', '\\', '\0']);
    if invalid {
        return Err(PluginError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

fn write_locator(destination: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o660);
    }
    let mut file = options.open(destination)?;
    file.write_all(contents)?;
    file.sync_all()
}
