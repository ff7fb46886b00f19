//! Server settings, loaded from an ini file.
//!
//! All keys live in the `[resource]` section. A missing file or key is the
//! one fatal error class the server has: everything else is reported per
//! request.

use camino::{Utf8Path, Utf8PathBuf};
use ini::Ini;

use crate::error::{Result, ServerError};

const SECTION: &str = "resource";

/// Workers spawned for the compilation pool when the settings file does not
/// say otherwise. The pool never runs with fewer than two.
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const MIN_WORKER_COUNT: usize = 2;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Root of the watched source descriptors.
    pub source_data_dir: Utf8PathBuf,
    /// Normal build output root.
    pub compiled_resource_dir: Utf8PathBuf,
    /// Packaging output root.
    pub packaged_build_dir: Utf8PathBuf,
    /// The external compiler child binary.
    pub compiler_executable: Utf8PathBuf,
    /// Transport listening port.
    pub port: u16,
    /// Compilation pool size.
    pub worker_count: usize,
}

impl ServerSettings {
    pub fn load(path: &Utf8Path) -> Result<Self> {
        fn get<'a>(ini: &'a Ini, path: &Utf8Path, key: &'static str) -> Result<&'a str> {
            ini.section(Some(SECTION))
                .and_then(|section| section.get(key))
                .ok_or(ServerError::SettingsMissingKey {
                    path: path.to_owned(),
                    key,
                })
        }

        let ini = Ini::load_from_file(path).map_err(|e| ServerError::SettingsRead {
            path: path.to_owned(),
            message: e.to_string(),
        })?;

        let get = |key| get(&ini, path, key);

        let port_raw = get("resource_server_port")?.trim();
        let port: u16 = port_raw
            .parse()
            .map_err(|_| ServerError::SettingsInvalidValue {
                key: "resource_server_port",
                message: format!("expected a port number, got `{port_raw}`"),
            })?;

        let worker_count = match ini
            .section(Some(SECTION))
            .and_then(|section| section.get("compilation_worker_count"))
        {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ServerError::SettingsInvalidValue {
                    key: "compilation_worker_count",
                    message: format!("expected a worker count, got `{raw}`"),
                })?
                .max(MIN_WORKER_COUNT),
            None => DEFAULT_WORKER_COUNT,
        };

        Ok(Self {
            source_data_dir: Utf8PathBuf::from(get("source_data_directory_path")?),
            compiled_resource_dir: Utf8PathBuf::from(get("compiled_resource_directory_path")?),
            packaged_build_dir: Utf8PathBuf::from(get(
                "packaged_build_compiled_resource_directory_path",
            )?),
            compiler_executable: Utf8PathBuf::from(get("resource_compiler_executable_path")?),
            port,
            worker_count,
        })
    }
}
