//! Mount-time configuration: CLI parsing, matching `spec.md` §6.1's mount
//! interface and the teacher's `dctl`/`wormhole-attach` binaries' use of
//! `clap::Parser`.

use std::path::PathBuf;

use clap::Parser;

/// `runfs <mountpoint> [-f] [-d] [-o OPT,OPT,...]`
#[derive(Debug, Parser)]
#[command(name = "runfs", about = "A self-cleaning filesystem for ephemeral runtime state")]
pub struct Cli {
    /// Directory to mount the filesystem at.
    pub mountpoint: PathBuf,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short, long)]
    pub foreground: bool,

    /// Enable trace-level logging.
    #[arg(short, long)]
    pub debug: bool,

    /// Comma-separated mount options (ro, allow_other, default_permissions).
    #[arg(short = 'o', long = "options", value_delimiter = ',')]
    pub options: Vec<String>,
}

impl Cli {
    /// Translates `--options` into `fuser::MountOption`s, always appending
    /// `fsname=runfs` (`spec.md` §6.1).
    pub fn mount_options(&self) -> Vec<fuser::MountOption> {
        let mut opts = vec![fuser::MountOption::FSName("runfs".to_string())];
        for opt in &self.options {
            match opt.as_str() {
                "ro" => opts.push(fuser::MountOption::RO),
                "rw" => opts.push(fuser::MountOption::RW),
                "allow_other" => opts.push(fuser::MountOption::AllowOther),
                "allow_root" => opts.push(fuser::MountOption::AllowRoot),
                "default_permissions" => opts.push(fuser::MountOption::DefaultPermissions),
                "" => {}
                other => opts.push(fuser::MountOption::CUSTOM(other.to_string())),
            }
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["runfs", "/mnt/run"]);
        assert_eq!(cli.mountpoint, PathBuf::from("/mnt/run"));
        assert!(!cli.foreground);
        assert!(!cli.debug);
        assert!(cli.options.is_empty());
    }

    #[test]
    fn parses_all_flags() {
        let cli = Cli::parse_from([
            "runfs",
            "/mnt/run",
            "-f",
            "-d",
            "-o",
            "allow_other,default_permissions",
        ]);
        assert!(cli.foreground);
        assert!(cli.debug);
        assert_eq!(cli.options, vec!["allow_other", "default_permissions"]);
    }

    #[test]
    fn mount_options_always_includes_fsname() {
        let cli = Cli::parse_from(["runfs", "/mnt/run"]);
        let opts = cli.mount_options();
        assert!(matches!(opts[0], fuser::MountOption::FSName(_)));
    }
}
