use crate::archive::{self, EntryKind};
use crate::config::{Config, DefaultsSource, Overrides};
use crate::environment::{Environment, LoadFlags, RestoreOutcome, SaveFlags};
use crate::error::{Error, IoContext, Result};
use crate::storage;
use crate::util;
use clap::{Parser, Subcommand};
use file_lock::{FileLock, FileOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(version, about, author)]
pub struct Cli {
    /// Configuration file (default: /etc/envfs.toml if it exists)
    #[clap(long, global = true, env = "ENVFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Storage holding the archive
    #[clap(long, global = true, env = "ENVFS_ARCHIVE")]
    pub archive: Option<PathBuf>,

    /// Live environment directory
    #[clap(long, global = true, env = "ENVFS_DIR")]
    pub dir: Option<PathBuf>,

    /// Default environment as a directory tree
    #[clap(
        long,
        global = true,
        env = "ENVFS_DEFAULTS",
        conflicts_with = "defaults_image"
    )]
    pub defaults_dir: Option<PathBuf>,

    /// Default environment as an envfs image
    #[clap(long, global = true)]
    pub defaults_image: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Save the environment directory to the archive
    #[clap(name = "save", aliases = &["saveenv"])]
    Save {
        /// Store an empty archive so the built-in environment is used on the next load
        #[clap(short = 'z', long)]
        force_builtin: bool,

        /// Store every file instead of only those that differ from the defaults
        #[clap(long)]
        no_defaults: bool,
    },

    /// Load the archive into the environment directory
    #[clap(name = "load", aliases = &["loadenv"])]
    Load {
        /// Do not overwrite existing files
        #[clap(short = 'n', long)]
        no_overwrite: bool,

        /// Remove everything in the environment directory first
        #[clap(short = 's', long)]
        scrub: bool,

        /// fsync() the environment directory afterwards
        #[clap(long)]
        sync: bool,
    },

    /// Install the default environment, then load the archive on top of it
    #[clap(name = "restore")]
    Restore {
        /// fsync() the environment directory afterwards
        #[clap(long)]
        sync: bool,
    },

    /// Write the default environment into a directory
    #[clap(name = "defaults")]
    Defaults {
        #[clap(value_parser)]
        directory: PathBuf,
    },

    /// Print the contents of an archive
    #[clap(name = "inspect", aliases = &["ls"])]
    Inspect {
        /// Archive to read instead of the configured one
        #[clap(value_parser)]
        archive: Option<PathBuf>,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let defaults = self
            .defaults_dir
            .clone()
            .map(DefaultsSource::Dir)
            .or_else(|| self.defaults_image.clone().map(DefaultsSource::Image));
        Overrides {
            archive: self.archive.clone(),
            env_dir: self.dir.clone(),
            defaults,
        }
    }

    pub fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?.with_overrides(self.overrides());
        tracing::trace!("Running command: {:?} with {:?}", self.command, config);

        let defaults = config.defaults.as_ref().map(DefaultsSource::open).transpose()?;
        let mut env = match defaults.as_deref() {
            Some(defaults) => Environment::new(defaults),
            None => Environment::host(),
        };
        if let Some(staging) = &config.staging_dir {
            env = env.with_staging(staging);
        }

        match self.command {
            Commands::Save {
                force_builtin,
                no_defaults,
            } => {
                let _lock = acquire_lock(&config)?;
                let env = if no_defaults { Environment::host() } else { env };
                if env.defaults().is_none() {
                    tracing::info!("No default environment, saving every file");
                }

                let report = env.save_to_path(
                    &config.archive,
                    &config.env_dir,
                    SaveFlags { force_builtin },
                )?;
                if report.force_builtin {
                    println!(
                        "Saved empty environment to {}, the built-in environment will be used",
                        config.archive.display()
                    );
                } else {
                    println!(
                        "Saved {} entries ({} tombstones, {} bytes) to {}",
                        report.entries,
                        report.tombstones,
                        report.bytes_written,
                        config.archive.display()
                    );
                }
                Ok(())
            }
            Commands::Load {
                no_overwrite,
                scrub,
                sync,
            } => {
                let _lock = acquire_lock(&config)?;
                if scrub && config.env_dir.exists() {
                    util::clear_directory(&config.env_dir)?;
                }

                let report = env.load_from_path(
                    &config.archive,
                    &config.env_dir,
                    LoadFlags { no_overwrite },
                )?;
                if sync {
                    sync_env(&config.env_dir)?;
                }

                if report.force_builtin {
                    println!("Archive forces the built-in environment");
                } else {
                    println!(
                        "Loaded {} files and {} tombstones into {} ({} skipped)",
                        report.regular,
                        report.tombstones,
                        config.env_dir.display(),
                        report.skipped
                    );
                }
                Ok(())
            }
            Commands::Restore { sync } => {
                let _lock = acquire_lock(&config)?;
                let outcome = env.restore(&config.archive, &config.env_dir, LoadFlags::default())?;
                if sync {
                    sync_env(&config.env_dir)?;
                }

                match outcome {
                    RestoreOutcome::Loaded(report) => println!(
                        "Restored environment from {} ({} files, {} tombstones)",
                        config.archive.display(),
                        report.regular,
                        report.tombstones
                    ),
                    RestoreOutcome::Defaults => println!("Using default environment"),
                }
                Ok(())
            }
            Commands::Defaults { directory } => {
                let defaults = defaults.as_deref().ok_or(Error::NoDefaults)?;
                tracing::info!(
                    "Writing default environment from {} to {}",
                    defaults.describe(),
                    directory.display()
                );
                defaults.materialize(&directory)?;
                Ok(())
            }
            Commands::Inspect { archive } => {
                let path = archive.as_deref().unwrap_or(&config.archive);
                let mut storage = storage::open(path, false)?;
                let mut bytes = Vec::new();
                storage.read_to_end(&mut bytes).with_path("read", path)?;
                print!("{}", describe_archive(&bytes)?);
                Ok(())
            }
        }
    }
}

fn acquire_lock(config: &Config) -> Result<FileLock> {
    std::fs::create_dir_all(&config.lock_dir).with_path("create lock directory", &config.lock_dir)?;
    let path = config.lock_path();
    tracing::trace!("Waiting for lock {}", path.display());
    FileLock::lock(&path, true, FileOptions::new().write(true).create(true)).with_path("lock", &path)
}

fn sync_env(env_dir: &Path) -> Result<()> {
    util::fsync_tree(env_dir).with_path("sync", env_dir)
}

/// Human-readable listing of an archive image.
pub fn describe_archive(bytes: &[u8]) -> Result<String> {
    let (superblock, entries) = archive::parse_image(bytes)?;

    let mut lines = vec![format!(
        "envfs {}.{}, {} bytes, crc {:#010x}{}{}",
        superblock.major,
        superblock.minor,
        superblock.size,
        superblock.crc,
        if archive::has_efi_prefix(bytes) {
            ", EFI variable"
        } else {
            ""
        },
        if superblock.is_force_builtin() {
            ", force built-in"
        } else {
            ""
        },
    )];

    lines.extend(entries.iter().map(|entry| match &entry.kind {
        EntryKind::Regular { content, mode } => {
            format!("file       {mode:04o} {:>8} {}", content.len(), entry.name)
        }
        EntryKind::Tombstone { target } => format!(
            "tombstone  {:04o} {:>8} {} -> {target}",
            entry.wire_mode() & 0o7777,
            entry.wire_size(),
            entry.name
        ),
    }));

    lines.push(String::new());
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Entry, FLAG_FORCE_BUILT_IN, build_image};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::try_parse_from([
            "envfs",
            "--archive",
            "/tmp/env0",
            "save",
            "-z",
        ])
        .unwrap();
        assert_eq!(cli.archive.as_deref(), Some(Path::new("/tmp/env0")));
        assert!(matches!(
            cli.command,
            Commands::Save {
                force_builtin: true,
                no_defaults: false
            }
        ));

        let cli = Cli::try_parse_from(["envfs", "loadenv", "-n", "-s", "--dir", "/tmp/env"]).unwrap();
        assert_eq!(cli.dir.as_deref(), Some(Path::new("/tmp/env")));
        assert!(matches!(
            cli.command,
            Commands::Load {
                no_overwrite: true,
                scrub: true,
                sync: false
            }
        ));

        assert!(
            Cli::try_parse_from([
                "envfs",
                "--defaults-dir",
                "/a",
                "--defaults-image",
                "/b",
                "restore"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_describe_archive() {
        let image = build_image(
            0,
            &[
                Entry::regular("config/hostname", b"other".to_vec(), 0o644),
                Entry::tombstone("nv/boot.default", "boot.default"),
            ],
        )
        .unwrap();

        let listing = describe_archive(&image).unwrap();
        let lines: Vec<_> = listing.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("envfs 1.0"));
        assert_eq!(lines[1], "file       0644        5 config/hostname");
        assert_eq!(
            lines[2],
            "tombstone  0777       13 nv/boot.default -> boot.default"
        );

        let forced = describe_archive(&build_image(FLAG_FORCE_BUILT_IN, &[]).unwrap()).unwrap();
        assert!(forced.contains("force built-in"));
    }

    #[test]
    fn test_save_and_load_commands() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let config_path = root.join("envfs.toml");
        fs::write(
            &config_path,
            format!("lock_dir = \"{}\"\n", root.join("lock").display()),
        )
        .unwrap();

        let defaults = root.join("defaultenv");
        fs::create_dir_all(defaults.join("config")).unwrap();
        fs::write(defaults.join("config/hostname"), "myhost").unwrap();
        fs::write(defaults.join("config/ip"), "dhcp").unwrap();

        let live = root.join("env");
        util::copy_dir_all(&defaults, &live).unwrap();
        fs::write(live.join("config/hostname"), "other").unwrap();

        let run = |args: &[&str]| {
            let mut argv = vec![
                "envfs".to_owned(),
                "--config".to_owned(),
                config_path.display().to_string(),
                "--archive".to_owned(),
                root.join("env0").display().to_string(),
                "--dir".to_owned(),
                live.display().to_string(),
                "--defaults-dir".to_owned(),
                defaults.display().to_string(),
            ];
            argv.extend(args.iter().map(|arg| (*arg).to_owned()));
            Cli::try_parse_from(argv).unwrap().run()
        };

        run(&["save"]).unwrap();
        assert!(root.join("lock/envfs.lock").exists());

        fs::write(live.join("config/hostname"), "changed again").unwrap();
        fs::write(live.join("stray"), "x").unwrap();
        run(&["load", "--scrub", "--sync"]).unwrap();

        assert_eq!(fs::read(live.join("config/hostname")).unwrap(), b"other");
        assert!(!live.join("stray").exists());
        // Unchanged default files come from the defaults, not the archive
        assert!(!live.join("config/ip").exists());

        run(&["restore"]).unwrap();
        assert_eq!(fs::read(live.join("config/ip")).unwrap(), b"dhcp");
        assert_eq!(fs::read(live.join("config/hostname")).unwrap(), b"other");

        let exported = root.join("exported");
        run(&["defaults", exported.to_str().unwrap()]).unwrap();
        assert_eq!(fs::read(exported.join("config/hostname")).unwrap(), b"myhost");
    }
}
