use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = r#"
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
"#;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, help_template = HELP_TEMPLATE)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a store read-only and print its tree
    Dump {
        /// Path to the store file
        file: String,
        /// Print the whole tree as a single JSON document instead of
        /// the indented key/value form
        #[arg(long)]
        json: bool,
        /// Colorize keys (ignored with --json)
        #[arg(long)]
        color: bool,
        /// Stop descending past this depth
        #[arg(long, value_name = "N")]
        depth: Option<usize>,
        /// Print as flat dotted paths instead of a nested tree
        #[arg(long)]
        flat: bool,
    },
    /// Verify the on-disk format, failing with the first violation found
    Check {
        /// Path to the store file
        file: String,
    },
    /// Resolve a dotted path and print its JSON value
    Get {
        /// Path to the store file
        file: String,
        /// Dotted path, e.g. `a.b.c`
        path: String,
    },
}
