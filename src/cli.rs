use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};

use crate::config::Config;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "river", version, about, long_about = None)]
pub struct Cli {
    /// JSON config file; defaults are used when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count, global = true)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Runs a lookup service: unicast listener, multicast responder,
    /// announcer and lease expiry
    Serve {
        /// Host name advertised to clients
        #[arg(long)]
        host: Option<String>,
        /// Unicast discovery port
        #[arg(short, long)]
        port: Option<u16>,
        /// Groups to serve (repeatable); replaces the configured groups
        #[arg(short, long = "group")]
        groups: Vec<String>,
    },
    /// Unicast discovery against each locator in turn, printing the first
    /// lookup service found
    Discover {
        /// `jini://host[:port]` locators; configured locators when empty
        locators: Vec<String>,
    },
    /// Prints multicast announcements until interrupted
    Listen {
        /// Groups of interest (repeatable); every group when empty
        #[arg(short, long = "group")]
        groups: Vec<String>,
    },
    /// Writes a new ed25519 identity as <NAME>.key and <NAME>.pub
    Keygen {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(short, long, default_value = "river")]
        name: String,
    },
}

impl Cli {
    /// Loads the config file if one was given and applies command line
    /// overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Commands::Serve { host, port, groups } = &self.command {
            if let Some(host) = host {
                config.host.clone_from(host);
            }
            if let Some(port) = port {
                config.unicast_port = *port;
            }
            if !groups.is_empty() {
                config.groups.clone_from(groups);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("river.json");
        std::fs::write(&path, r#"{ "unicast_port": 4170, "groups": ["a"] }"#).unwrap();

        let cli = Cli::try_parse_from([
            "river",
            "-vv",
            "serve",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "5000",
            "-g",
            "printers",
            "-g",
            "scanners",
        ])
        .unwrap();
        assert_eq!(cli.verbosity, 2);

        let config = cli.load_config().unwrap();
        assert_eq!(config.unicast_port, 5000);
        assert_eq!(config.groups, vec!["printers".to_string(), "scanners".to_string()]);
    }

    #[test]
    fn test_discover_takes_locators() {
        let cli = Cli::try_parse_from(["river", "discover", "jini://a", "jini://b:4161"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Discover {
                locators: vec!["jini://a".into(), "jini://b:4161".into()]
            }
        );
        assert!(cli.config_path().is_none());
        assert_eq!(cli.load_config().unwrap(), Config::default());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["river"]).is_err());
    }
}
