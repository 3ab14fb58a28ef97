//! Command-line interface definitions using clap.
//!
//! The worker is normally launched by its forking supervisor, which passes
//! the template paths it prepared; the flags exist so a worker can also be
//! started by hand for debugging.

use clap::Parser;

/// kitworker - sandboxed single-document engine host
#[derive(Parser, Debug)]
#[command(name = "kitworker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory under which the per-process jail is created.
    #[arg(long, value_name = "PATH")]
    pub childroot: Option<String>,

    /// System template tree mirrored into the jail.
    #[arg(long, value_name = "PATH")]
    pub systemplate: Option<String>,

    /// Office-engine install tree mirrored into the jail.
    #[arg(long, value_name = "PATH")]
    pub lotemplate: Option<String>,

    /// Path under the jail root where the engine lives.
    #[arg(long, value_name = "REL_PATH", default_value = "lo")]
    pub losubpath: String,

    /// Port of the controller we register with.
    #[arg(long, value_name = "PORT", default_value_t = 9981)]
    pub masterport: u16,

    /// Skip jail construction and capability drop (developer builds).
    #[arg(long)]
    pub nocaps: bool,

    /// Query the engine version and report it to the controller.
    #[arg(long)]
    pub queryversion: bool,

    /// Also print the engine version to stdout (implies --queryversion).
    #[arg(long)]
    pub displayversion: bool,

    /// Run the pre-fork engine warmup in this process and exit.
    #[arg(long)]
    pub preinit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["kitworker"]);
        assert_eq!(cli.losubpath, "lo");
        assert_eq!(cli.masterport, 9981);
        assert!(!cli.nocaps);
        assert!(!cli.preinit);
    }

    #[test]
    fn test_full_invocation() {
        let cli = Cli::parse_from([
            "kitworker",
            "--childroot",
            "/var/cache/kit/child",
            "--systemplate",
            "/opt/sys",
            "--lotemplate",
            "/opt/office",
            "--losubpath",
            "lo",
            "--masterport",
            "9982",
            "--queryversion",
        ]);
        assert_eq!(cli.childroot.as_deref(), Some("/var/cache/kit/child"));
        assert_eq!(cli.masterport, 9982);
        assert!(cli.queryversion);
    }
}
