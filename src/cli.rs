use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cathost")]
#[command(about = "Manage installable catalog packages", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List bundled and installed catalogs
    List,
    /// Show catalogs available from the repository
    Remote {
        /// Fetch the repository index before listing
        #[arg(short, long)]
        refresh: bool,
    },
    /// Download and install a catalog package
    Install {
        /// Package name as listed by `remote`
        pkg_name: String,
    },
    /// Uninstall a catalog package
    Uninstall {
        pkg_name: String,
    },
    /// Show installed catalogs with newer versions available
    Updates,
    /// Print the catalog list whenever packages change (Ctrl+C to stop)
    Watch,
}
