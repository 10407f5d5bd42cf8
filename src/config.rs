use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use plfupdatelib::{
    constants::{SERVER_HOST, SERVER_PORT},
    transport::Endpoint,
};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub root_folder: Option<PathBuf>,
    pub server: Option<String>,
    pub server_port: Option<u16>,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{}.conf", PKG_NAME));
        p
    })
}

/// Load the config file at `user_path`, or at the default path if none is
/// given. A missing file is not an error.
pub fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let path = user_path.or(default_path.as_deref());

    match path {
        Some(p) => {
            let file = match File::open(p) {
                Ok(f) => f,
                Err(e) => {
                    return if e.kind() == io::ErrorKind::NotFound {
                        Ok(None)
                    } else {
                        Err(e).context(format!("Could not open file: {:?}", p))
                    };
                }
            };

            let config = serde_json::from_reader(file)
                .context(format!("Could not parse config file: {:?}", p))?;

            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Pick the firmware root folder from the following list in order:
/// * User-supplied command line argument or `PLFUPDATE_ROOT`
/// * Config file
/// * `<data dir>/plfupdate`
pub fn root_folder(arg: Option<&Path>, config: Option<&Config>) -> Result<PathBuf> {
    arg.map(Path::to_path_buf)
        .or_else(|| config.and_then(|c| c.root_folder.clone()))
        .or_else(|| dirs::data_dir().map(|d| d.join(PKG_NAME)))
        .ok_or_else(|| anyhow!("No root folder argument or variable specified"))
}

/// Pick the update server with the same precedence as [`root_folder`],
/// falling back to the public Parrot server.
pub fn server(host: Option<&str>, port: Option<u16>, config: Option<&Config>) -> Endpoint {
    let host = host
        .or_else(|| config.and_then(|c| c.server.as_deref()))
        .unwrap_or(SERVER_HOST);
    let port = port
        .or_else(|| config.and_then(|c| c.server_port))
        .unwrap_or(SERVER_PORT);

    Endpoint::new(host, port)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plfupdate.conf");

        assert!(load_config_file(Some(&path)).unwrap().is_none());

        fs::write(&path, r#"{"root_folder": "/srv/plf", "server_port": 8080}"#).unwrap();
        let config = load_config_file(Some(&path)).unwrap().unwrap();
        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/plf")));
        assert_eq!(config.server, None);
        assert_eq!(config.server_port, Some(8080));

        fs::write(&path, "not json").unwrap();
        assert!(load_config_file(Some(&path)).is_err());
    }

    #[test]
    fn test_precedence() {
        let config = Config {
            root_folder: Some(PathBuf::from("/from/config")),
            server: Some("mirror.example".to_owned()),
            server_port: None,
        };

        assert_eq!(root_folder(Some(Path::new("/from/arg")), Some(&config)).unwrap(),
                   PathBuf::from("/from/arg"));
        assert_eq!(root_folder(None, Some(&config)).unwrap(), PathBuf::from("/from/config"));

        assert_eq!(server(None, None, None), Endpoint::new(SERVER_HOST, SERVER_PORT));
        assert_eq!(server(None, None, Some(&config)), Endpoint::new("mirror.example", SERVER_PORT));
        assert_eq!(server(Some("localhost"), Some(8000), Some(&config)), Endpoint::new("localhost", 8000));
    }
}
