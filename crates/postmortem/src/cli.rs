use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "postmortem")]
#[command(version)]
#[command(about = "Hypothesis-driven crash dump investigation")]
pub struct Cli {
    /// Configuration file (defaults to config.json under the storage root)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new session and investigate an issue
    Investigate {
        /// Dump file to open in the debugger
        target: PathBuf,

        /// Problem description, e.g. "the service hangs under load"
        #[arg(short, long)]
        issue: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one debugger command in an existing session
    Exec {
        #[arg(short, long)]
        session: String,

        command: String,
    },

    /// Search a session's evidence
    Ask {
        #[arg(short, long)]
        session: String,

        question: String,

        /// Number of results
        #[arg(short, default_value_t = 5)]
        k: usize,
    },

    /// Finish analyses that were interrupted
    Resume {
        #[arg(short, long)]
        session: String,
    },

    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        action: Option<SessionAction>,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// List sessions, newest first
    List,
    /// Show one session and its evidence
    Show { id: String },
    /// Remove old sessions
    Cleanup {
        /// Override the configured maximum age
        #[arg(long)]
        days: Option<i64>,
        /// Override the configured number of sessions always kept
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_version() {
        let cli = Cli::try_parse_from(["postmortem", "version"]);
        assert!(cli.is_ok());
        assert!(matches!(cli.unwrap().command, Commands::Version));
    }

    #[test]
    fn test_cli_parse_investigate() {
        let cli = Cli::try_parse_from(["postmortem", "investigate", "app.dmp", "--issue", "hangs on startup", "--json"])
            .unwrap();
        if let Commands::Investigate { target, issue, json } = cli.command {
            assert_eq!(target, PathBuf::from("app.dmp"));
            assert_eq!(issue, "hangs on startup");
            assert!(json);
        } else {
            panic!("Expected Investigate command");
        }
    }

    #[test]
    fn test_cli_investigate_requires_issue() {
        assert!(Cli::try_parse_from(["postmortem", "investigate", "app.dmp"]).is_err());
    }

    #[test]
    fn test_cli_parse_ask_with_global_config() {
        let cli = Cli::try_parse_from([
            "postmortem",
            "ask",
            "--session",
            "session_1",
            "who holds the lock",
            "-k",
            "3",
            "--config",
            "pm.json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("pm.json")));
        if let Commands::Ask { session, question, k } = cli.command {
            assert_eq!(session, "session_1");
            assert_eq!(question, "who holds the lock");
            assert_eq!(k, 3);
        } else {
            panic!("Expected Ask command");
        }
    }

    #[test]
    fn test_cli_parse_sessions() {
        let cli = Cli::try_parse_from(["postmortem", "sessions"]).unwrap();
        assert!(matches!(cli.command, Commands::Sessions { action: None }));

        let cli = Cli::try_parse_from(["postmortem", "sessions", "cleanup", "--days", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sessions {
                action: Some(SessionAction::Cleanup { days: Some(3), keep: None })
            }
        ));
    }
}
