//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vpsctl")]
#[command(author, version, about = "Deploy and manage per-user container instances", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: SubCommand,

    /// Directory holding the registry database
    #[arg(long, global = true, env = "VPSCTL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Identity of the user issuing the request
    #[arg(long, global = true, env = "VPSCTL_OWNER")]
    pub owner: Option<String>,

    /// Output format as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    /// Create a new instance and print its credential
    Deploy {
        /// OS choice (ubuntu, debian, alpine, arch, kali, fedora)
        #[arg(default_value = "ubuntu")]
        image: String,
    },

    /// Start a stopped instance
    Start {
        /// Instance id or unique prefix
        id: String,
    },

    /// Stop a running instance
    Stop {
        /// Instance id or unique prefix
        id: String,
    },

    /// Restart an instance
    Restart {
        /// Instance id or unique prefix
        id: String,
    },

    /// Issue a fresh credential for a running instance
    Regen {
        /// Instance id or unique prefix
        id: String,
    },

    /// Remove one of your instances
    Remove {
        /// Instance id or unique prefix
        id: String,
    },

    /// List your instances
    List,

    /// List every instance of every owner
    ListAll,

    /// Remove any owner's instance
    Delete {
        /// Instance id or unique prefix
        id: String,
    },

    /// Show the event history of an instance
    History {
        /// Instance id or unique prefix
        id: String,
    },

    /// Import records from an `owner|instance_id|credential` file
    Import {
        file: PathBuf,
    },

    /// Write the registry as an `owner|instance_id|credential` file
    Export {
        file: PathBuf,
    },

    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective settings
    Show,

    /// Set the per-owner instance limit
    SetLimit {
        limit: usize,
    },

    /// Set the credential capture timeout in seconds
    SetTimeout {
        seconds: u64,
    },
}

impl SubCommand {
    /// Whether the command acts on behalf of a specific owner
    pub fn needs_owner(&self) -> bool {
        matches!(
            self,
            Self::Deploy { .. }
                | Self::Start { .. }
                | Self::Stop { .. }
                | Self::Restart { .. }
                | Self::Regen { .. }
                | Self::Remove { .. }
                | Self::List
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_owner_command() {
        let args = Args::try_parse_from(["vpsctl", "--owner", "alice", "start", "c1a2"]).unwrap();
        assert_eq!(args.owner.as_deref(), Some("alice"));
        assert!(matches!(args.command, SubCommand::Start { ref id } if id == "c1a2"));
        assert!(args.command.needs_owner());
    }

    #[test]
    fn test_deploy_defaults_to_ubuntu() {
        let args = Args::try_parse_from(["vpsctl", "deploy", "--json"]).unwrap();
        assert!(args.json);
        assert!(matches!(args.command, SubCommand::Deploy { ref image } if image == "ubuntu"));
    }

    #[test]
    fn test_admin_commands_need_no_owner() {
        let args = Args::try_parse_from(["vpsctl", "delete", "c1a2"]).unwrap();
        assert!(!args.command.needs_owner());

        let args = Args::try_parse_from(["vpsctl", "config", "set-limit", "5"]).unwrap();
        assert!(matches!(
            args.command,
            SubCommand::Config {
                action: ConfigAction::SetLimit { limit: 5 }
            }
        ));
    }
}
