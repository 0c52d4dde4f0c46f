//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Directory identity provider: certificate index, endpoint failover and
/// nested group resolution against LDAP / Active Directory
#[derive(Parser, Debug)]
#[command(name = "dirgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to provider configuration file (YAML)
    #[arg(short, long, env = "DIRGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DIRGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "DIRGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Output format for command results
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Result rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the configuration and show the preferred endpoint
    Check,

    /// Rebuild the certificate index once and print its statistics
    Index,

    /// Decode a certificate file, print its facets and look it up
    Cert {
        /// Certificate file (DER, PEM or base64)
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Check whether a user belongs to a group
    Member {
        /// User login name
        #[arg(short, long)]
        user: String,

        /// Group common name
        #[arg(short, long)]
        group: String,
    },

    /// List the groups of a user
    Groups {
        /// User login name
        #[arg(short, long)]
        user: String,
    },

    /// List the users of a group
    Members {
        /// Group common name
        #[arg(short, long)]
        group: String,
    },

    /// Search users and groups by login or name (`*` wildcards allowed)
    Search {
        /// Pattern to match
        pattern: String,

        /// Only users
        #[arg(long, conflicts_with = "groups_only")]
        users_only: bool,

        /// Only groups
        #[arg(long)]
        groups_only: bool,
    },

    /// Run index maintenance and the config watcher until Ctrl-C
    Watch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_membership_query() {
        let cli = Cli::try_parse_from([
            "dirgate",
            "--config",
            "corp.yaml",
            "member",
            "--user",
            "bob",
            "--group",
            "admins",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("corp.yaml")));
        assert!(matches!(
            cli.command,
            Command::Member { ref user, ref group } if user == "bob" && group == "admins"
        ));
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["dirgate", "index", "--format", "json", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn search_filters_are_exclusive() {
        assert!(Cli::try_parse_from(["dirgate", "search", "b*", "--users-only", "--groups-only"]).is_err());
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
