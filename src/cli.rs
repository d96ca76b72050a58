use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "segdex",
    version,
    about = "Segment-based full-text search for documentation tenants"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List or compact the segment files of every tenant under a root
    Vacuum(VacuumArgs),
    /// Build and publish a segment from JSON-lines documents
    Index(IndexArgs),
    /// Search a tenant's newest segment
    Search(SearchArgs),
    /// Show segments and settings
    Status(StatusArgs),
    /// Manage engine settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Vacuum --

#[derive(Debug, Parser)]
pub struct VacuumArgs {
    /// Directory holding one subdirectory per tenant
    pub root: PathBuf,

    /// Only tenants whose name matches this glob
    #[arg(long)]
    pub tenant: Option<String>,

    /// List segment files without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Delete all but the newest N segments of each tenant first
    #[arg(long, value_name = "N")]
    pub prune: Option<usize>,
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Tenant to index into
    #[arg(short, long)]
    pub tenant: String,

    /// JSON-lines file with one document object per line
    #[arg(short, long)]
    pub input: PathBuf,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Tenant to search
    #[arg(short, long)]
    pub tenant: String,

    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "20")]
    pub count: usize,

    /// Match whole words only (no fuzzy or prefix expansion)
    #[arg(long)]
    pub word_match: bool,

    /// Include timing and candidate statistics
    #[arg(long)]
    pub stats: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Only this tenant
    #[arg(short, long)]
    pub tenant: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print one setting, or its default when unset
    Get { key: String },
    /// Validate and store a setting
    Set { key: String, value: String },
    /// Remove a stored setting
    Unset { key: String },
    /// Print every setting with its effective value
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "segdex",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["segdex", "search", "-t", "acme", "hello"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.tenant, "acme");
                assert_eq!(args.query, "hello");
                assert_eq!(args.count, 20);
                assert!(!args.word_match);
                assert!(!args.stats);
                assert!(!args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_vacuum() {
        let cli = Cli::parse_from([
            "segdex", "vacuum", "/srv/data", "--tenant", "docs-*", "--dry-run",
            "--prune", "2",
        ]);
        match cli.command {
            Command::Vacuum(args) => {
                assert_eq!(args.root, PathBuf::from("/srv/data"));
                assert_eq!(args.tenant.as_deref(), Some("docs-*"));
                assert!(args.dry_run);
                assert_eq!(args.prune, Some(2));
            }
            _ => panic!("expected vacuum command"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(
            Cli::try_parse_from(["segdex", "-q", "-v", "status"]).is_err()
        );
    }

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
