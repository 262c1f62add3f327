// src/main.rs
//! pmbootstrap - CLI entry point

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use pmbootstrap::runner;
use pmbootstrap::Config;
use std::io;
use std::path::PathBuf;

mod commands;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "pmbootstrap")]
#[command(version)]
#[command(about = "Build Alpine-style packages and device images in managed chroots", long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Wait quietly for the work-dir lock instead of failing
    #[arg(short, long, global = true)]
    quiet_wait: bool,

    /// Do not access the network; use cached indexes and packages
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the work dir, signing key, and config
    Init {
        /// Work directory location
        #[arg(long)]
        work: Option<PathBuf>,

        /// Path to the aports checkout
        #[arg(long)]
        aports: Option<PathBuf>,

        /// Target device id
        #[arg(long)]
        device: Option<String>,
    },

    /// Build packages (and whatever parts of their closure are stale)
    Build {
        /// Package names to build
        #[arg(required = true)]
        packages: Vec<String>,

        /// Target architecture (defaults to the host's)
        #[arg(long)]
        arch: Option<String>,

        /// Rebuild even when the binary is up to date
        #[arg(long)]
        force: bool,

        /// Let abuild verify dependencies itself
        #[arg(long)]
        strict: bool,

        /// Skip the dependency closure
        #[arg(long)]
        no_depends: bool,

        /// Build from this source tree instead of the recipe's sources
        #[arg(long)]
        src: Option<PathBuf>,
    },

    /// Enter a chroot and run a command (a shell when none is given)
    Chroot {
        /// Buildroot architecture (defaults to the native chroot)
        #[arg(short = 'b', long)]
        arch: Option<String>,

        /// Run as the unprivileged user instead of root
        #[arg(long)]
        user: bool,

        /// Command to run
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Destroy chroots; optionally purge packages and caches
    Zap {
        /// Also remove locally built packages
        #[arg(short = 'p', long)]
        packages: bool,

        /// Also remove the apk mirror caches
        #[arg(short = 'm', long)]
        mirror_cache: bool,

        /// Also remove other caches (git clones, apk.static)
        #[arg(short = 'o', long)]
        other_caches: bool,
    },

    /// Regenerate local repository indexes
    Index,

    /// List aports with no matching binary
    #[command(name = "repo_missing")]
    RepoMissing {
        /// Architecture to check (defaults to the host's)
        #[arg(long)]
        arch: Option<String>,
    },

    /// Bump pkgrel for outdated binaries
    #[command(name = "pkgrel_bump")]
    PkgrelBump {
        /// Packages to bump
        packages: Vec<String>,

        /// Detect outdated binaries via stale soname dependencies
        #[arg(long)]
        auto: bool,

        /// Only print what would be bumped
        #[arg(long)]
        dry: bool,
    },

    /// Release all mounts; drop the lock
    Shutdown,

    /// Run pending work-dir migrations
    #[command(name = "work_migrate")]
    WorkMigrate,

    /// Print health and config summary
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    install_sigint_handler();

    let cli = Cli::parse();
    let global = commands::Global {
        config_path: cli.config.clone().unwrap_or_else(Config::default_path),
        quiet_wait: cli.quiet_wait,
        offline: cli.offline,
    };

    let result = dispatch(&cli, &global);
    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            let log = Config::load(&global.config_path)
                .map(|c| c.work.join("log.txt"))
                .unwrap_or_else(|_| PathBuf::from("log.txt"));
            eprintln!("See the log for details: {}", log.display());
            std::process::exit(exit_code(&e));
        }
    }
}

fn dispatch(cli: &Cli, global: &commands::Global) -> Result<()> {
    match &cli.command {
        Commands::Init {
            work,
            aports,
            device,
        } => commands::cmd_init(global, work.clone(), aports.clone(), device.clone()),

        Commands::Build {
            packages,
            arch,
            force,
            strict,
            no_depends,
            src,
        } => commands::cmd_build(
            global,
            packages,
            arch.clone(),
            *force,
            *strict,
            *no_depends,
            src.clone(),
        ),

        Commands::Chroot {
            arch,
            user,
            command,
        } => commands::cmd_chroot(global, arch.clone(), *user, command),

        Commands::Zap {
            packages,
            mirror_cache,
            other_caches,
        } => commands::cmd_zap(global, *packages, *mirror_cache, *other_caches),

        Commands::Index => commands::cmd_index(global),

        Commands::RepoMissing { arch } => commands::cmd_repo_missing(global, arch.clone()),

        Commands::PkgrelBump {
            packages,
            auto,
            dry,
        } => commands::cmd_pkgrel_bump(global, packages, *auto, *dry),

        Commands::Shutdown => commands::cmd_shutdown(global),

        Commands::WorkMigrate => commands::cmd_work_migrate(global),

        Commands::Status => commands::cmd_status(global),

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(*shell, &mut cmd, "pmbootstrap", &mut io::stdout());
            Ok(())
        }
    }
}

/// Map errors to the documented exit codes: 2 usage, 130 interrupted,
/// 1 everything else.
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<pmbootstrap::Error>() {
        Some(e) => e.exit_code(),
        None => 1,
    }
}

/// First SIGINT asks the running command to stop (SIGTERM + grace); a
/// second one escalates to SIGKILL. The handler only flips an atomic;
/// the runner's wait loop does the actual signalling.
fn install_sigint_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_sigint(_: i32) {
        runner::note_interrupt();
    }

    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Installing a handler for SIGINT cannot fail with these arguments
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
    }
}
