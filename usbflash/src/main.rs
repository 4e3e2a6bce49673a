use anyhow::{Result, anyhow};
use clap::{ArgAction, Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use usbflash_core::config::{Config, MIB, SerialMode};
use usbflash_core::device::{Target, format_capacity};
use usbflash_core::platform::Devices;
use usbflash_core::transfer::{Event, Phase};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

mod logging;

const GIB: u64 = 1 << 30;

#[derive(Parser)]
#[command(name = "usbflash")]
#[command(about = "A safe, verifying disk image writer", version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Options {
    /// List every disk, including the ones holding /home, /var, /usr or /srv
    #[arg(short = 'a', long = "all", global = true)]
    all: bool,

    /// Always write, even blocks the device already holds
    #[arg(short, long, global = true)]
    force: bool,

    /// Skip reading back written blocks
    #[arg(short = 'n', long = "no-verify", global = true)]
    no_verify: bool,

    /// Transfer block size in MiB (a power of two up to 512)
    #[arg(short, long, value_name = "MIB", default_value_t = 1, global = true)]
    block_size: usize,

    /// Hide disks larger than this many GiB
    #[arg(short, long, value_name = "GIB", global = true)]
    max_size: Option<u64>,

    /// List serial ports and send images to them verbatim
    #[arg(short = 's', long, value_name = "BAUD", num_args = 0..=1, default_missing_value = "115200", global = true)]
    serial: Option<u32>,

    /// Like --serial, with the bootloader handshake before the image
    #[arg(short = 'S', long, value_name = "BAUD", num_args = 0..=1, default_missing_value = "115200", global = true, conflicts_with = "serial")]
    serial_handshake: Option<u32>,

    /// Compress backups with zstd
    #[arg(short = 'z', long, global = true)]
    compress: bool,

    /// Directory backups are saved to
    #[arg(long, value_name = "DIR", global = true)]
    dir: Option<PathBuf>,
}

#[derive(Args)]
struct FileTarget {
    /// Use a regular file as the target instead of picking a device
    #[arg(long, value_name = "PATH")]
    target_file: Option<PathBuf>,

    /// Capacity of the target file in MiB (defaults to its current length)
    #[arg(long, value_name = "MIB", requires = "target_file")]
    target_size: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device interactively
    Write {
        /// Image file to write (raw, gz, bz2, xz, zst, zip, tar or cpio)
        #[arg(required = true)]
        image: PathBuf,

        #[command(flatten)]
        target: FileTarget,
    },
    /// Back a device up to an image file interactively
    Read {
        #[command(flatten)]
        target: FileTarget,
    },
    /// List available target devices
    List,
}

impl Options {
    fn to_config(&self) -> Result<Config> {
        let mut config = Config {
            show_all_disks: self.all,
            force: self.force,
            verify: !self.no_verify,
            max_disk_size: self.max_size.map(|gib| gib * GIB),
            backup_dir: self.dir.clone(),
            compress_backup: self.compress,
            ..Default::default()
        };
        config.set_block_size_mib(self.block_size)?;
        if let Some(baud) = self.serial {
            config.serial = SerialMode::Raw;
            config.set_baud(baud);
        }
        if let Some(baud) = self.serial_handshake {
            config.serial = SerialMode::Handshake;
            config.set_baud(baud);
        }
        Ok(config)
    }
}

impl FileTarget {
    fn resolve(&self) -> Result<Option<Target>> {
        let Some(path) = &self.target_file else {
            return Ok(None);
        };
        let capacity = match self.target_size {
            Some(mib) => mib * MIB as u64,
            None => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        };
        Ok(Some(Target::file(path, capacity)))
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal so
/// Ctrl+C is not echoed as `^C` over the progress bar. The original terminal
/// state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let original_termios = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

/// Lets the user pick one of the listed targets.
fn select_target(targets: &[Target], prompt: &str) -> Result<Target> {
    if targets.is_empty() {
        return Err(anyhow!("No target devices found. Try --all, or --serial for serial ports."));
    }
    let labels: Vec<&str> = targets.iter().map(|t| t.label.as_str()).collect();
    let index = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&labels)
        .default(0)
        .interact()?;
    Ok(targets[index].clone())
}

/// Asks before anything destructive happens. Defaults to "no".
fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn pick_target(
    devices: &mut Devices,
    config: &Config,
    file: &FileTarget,
    prompt: &str,
) -> Result<Target> {
    if let Some(target) = file.resolve()? {
        return Ok(target);
    }
    let targets = devices.list_targets(config)?;
    select_target(targets, prompt)
}

fn progress_bar(prefix: &'static str, color: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_prefix(prefix);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{pos:>3}}% {{msg}}"
            ))?
            .progress_chars("■ "),
    );
    Ok(pb)
}

/// Connects the core's event stream to a progress bar.
fn on_event(pb: &ProgressBar) -> impl FnMut(Event) + '_ {
    move |event| match event {
        Event::Progress(status) => {
            pb.set_position(status.percent as u64);
            pb.set_message(status.text);
        }
        Event::Phase(Phase::Closing) => pb.set_message("Syncing..."),
        Event::Phase(_) => {}
    }
}

fn write_image(image: &Path, file: &FileTarget, config: &Config, running: Arc<AtomicBool>) -> Result<()> {
    let mut devices = Devices::new();
    let target = pick_target(&mut devices, config, file, "Select the target device to WRITE to")?;

    let size = if target.capacity > 0 {
        format!(" ({})", format_capacity(target.capacity))
    } else {
        String::new()
    };
    println!(
        "{} This will erase all data on '{}'{}.",
        style("WARNING:").red().bold(),
        target,
        size,
    );
    println!("  Image:  {}", style(image.display()).cyan());
    if !config.verify {
        println!("  {}", style("Verification is disabled.").yellow());
    }
    println!();

    if !confirm("Proceed?")? {
        println!("Aborted, nothing was written.");
        return Ok(());
    }
    println!();

    let pb = progress_bar("Writing", "green")?;
    let result = usbflash_core::write::run(image, &devices, &target, config, running, on_event(&pb));

    match result {
        Ok(summary) => {
            pb.finish_with_message(summary.status.text);
            println!(
                "\n✨ Successfully flashed {} with {} ({} written, {} already up to date).",
                style(&target).cyan(),
                style(image.display()).cyan(),
                format_capacity(summary.written),
                format_capacity(summary.skipped),
            );
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("❌ Operation failed.");
            Err(e.into())
        }
    }
}

fn backup(file: &FileTarget, config: &Config, running: Arc<AtomicBool>) -> Result<()> {
    let mut devices = Devices::new();
    let target = pick_target(&mut devices, config, file, "Select the source device to READ from")?;
    let dir = usbflash_core::read::backup_dir(config.backup_dir.as_deref());

    println!("This will read {} from '{}'.", format_capacity(target.capacity), target);
    println!("  Output: {}", style(dir.display()).cyan());
    println!();

    if !confirm("Proceed?")? {
        println!("Aborted.");
        return Ok(());
    }
    println!();

    let pb = progress_bar("Reading", "green")?;
    let result = usbflash_core::read::run(&devices, &target, config, running, on_event(&pb));

    match result {
        Ok(summary) => {
            pb.finish_with_message(summary.status.text);
            let output = summary.output.unwrap_or_default();
            println!(
                "\n✨ Successfully read {} to {}.",
                style(&target).cyan(),
                style(output.display()).cyan()
            );
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("❌ Operation failed.");
            Err(e.into())
        }
    }
}

fn list(config: &Config) -> Result<()> {
    let mut devices = Devices::new();
    let targets = devices.list_targets(config)?;
    if targets.is_empty() {
        println!("No target devices found.");
        return Ok(());
    }

    println!("Found {} target devices:", targets.len());
    println!("\n  {:<4} {}", "#", "DEVICE");
    println!("  {:-<4} {:-<40}", "", "");
    for (index, target) in targets.iter().enumerate() {
        println!("  {:<4} {}", index, target);
    }
    Ok(())
}

fn main() -> Result<()> {
    let _term = TermRestorer::new();

    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = cli.options.to_config()?;

    // Cleared on Ctrl+C; the core stops at the next block boundary.
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    match &cli.command {
        Commands::Write { image, target } => write_image(image, target, &config, running),
        Commands::Read { target } => backup(target, &config, running),
        Commands::List => list(&config),
    }
}
