use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use env_logger::Env;
use fitload::fit::{self, FitImage, LoadOptions};
use fitload::kexec::{KexecLoader, RecordingLoader, SyscallLoader};
use fitload::keyring::KeyRing;
use fitload::Result;

/// Verify a U-Boot FIT image against a key ring and kexec into it.
#[derive(Parser, Debug)]
#[command(
    name = "fitload",
    version,
    about = "Verify and kexec-load kernels from U-Boot FIT images"
)]
struct Cli {
    /// Configuration to boot (default: the image's `default` configuration)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Trusted public key file: OpenPGP (binary or armored) or PEM RSA.
    /// May be given more than once.
    #[arg(short = 'k', long = "keyring")]
    keys: Vec<PathBuf>,

    /// Kernel command line
    #[arg(long = "cmdline", default_value = "")]
    cmdline: String,

    /// Boot images whose signatures fail to verify (logs a warning)
    #[arg(long = "allow-unverified")]
    allow_unverified: bool,

    /// Verify and build segments, but do not call kexec_load
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Kernel image name to use if no configuration resolves
    #[arg(long = "kernel")]
    kernel: Option<String>,

    /// Initramfs image name to use if no configuration resolves
    #[arg(long = "initramfs")]
    initramfs: Option<String>,

    /// List the image's configurations and exit
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// The FIT image (.itb)
    #[arg()]
    image: PathBuf,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();
}

fn list_configs(path: &Path) -> Result<()> {
    for image in fit::parse_configs_file(path)? {
        println!("{}", image.label());
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    if cli.list {
        return list_configs(&cli.image);
    }

    let mut image = FitImage::new(&cli.image)?;
    image.set_config_override(cli.config.as_deref());
    image.set_cmdline(&cli.cmdline);
    if !cli.keys.is_empty() {
        let ring = KeyRing::from_files(&cli.keys)?;
        for entry in ring.entries() {
            log::debug!("trusted key {entry:?}");
        }
        image.set_key_ring(Some(ring));
    }

    if let Err(e) = image.resolve_config() {
        let Some(kernel) = &cli.kernel else {
            return Err(e);
        };
        log::warn!("{e}; falling back to kernel '{kernel}'");
        image.set_kernel(kernel);
        if let Some(initramfs) = &cli.initramfs {
            image.set_initramfs(initramfs);
        }
    }
    log::info!("booting {}", image.label());

    let opts = LoadOptions {
        verbose: cli.verbose > 0,
        allow_unverified: cli.allow_unverified,
        ..LoadOptions::default()
    };
    let mut loader: Box<dyn KexecLoader> = if cli.dry_run {
        Box::new(RecordingLoader::default())
    } else {
        Box::new(SyscallLoader)
    };
    image.load_with(loader.as_mut(), &opts)?;

    if cli.dry_run {
        println!("{}: verified, not loaded (dry run)", image.label());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        eprintln!("fitload: {}: {}", cli.image.display(), e);
        if e.is_verification_failure() {
            eprintln!("fitload: use --allow-unverified to boot anyway");
        }
        process::exit(1);
    }
}
