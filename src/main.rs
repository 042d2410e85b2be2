//! Discwright - command-line front-end
//!
//! Builds images, lists recorders, burns images and mounts them.

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use discwright::burning::{
    BurnEngine, BurnOutcome, BurnProgressCallback, VerificationLevel, build_image,
    normalize_volume_label,
};
use discwright::core::{BurnProgress, CancelToken, Settings};
use discwright::mount::VirtualMountManager;
use discwright::{DiscError, Result};

#[derive(Parser)]
#[command(name = "discwright")]
#[command(about = "Build, burn and mount disc images", version)]
struct Cli {
    /// Show debug output in the terminal
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file to use instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an ISO image from a directory
    Build {
        /// Directory whose contents become the image root
        source: PathBuf,

        /// Image file to create (default: <LABEL>.iso in the output directory)
        output: Option<PathBuf>,

        /// Volume label
        #[arg(short, long)]
        label: Option<String>,
    },
    /// List available recorders
    Recorders,
    /// Burn an image to a recorder
    Burn {
        /// Image file to burn
        image: PathBuf,

        /// Recorder id from `recorders` (default: the first recorder)
        #[arg(short, long)]
        recorder: Option<String>,

        /// Read-back verification after the write
        #[arg(long, value_enum)]
        verify: Option<VerifyArg>,
    },
    /// Attach an image as a read-only virtual device
    Mount { image: PathBuf },
    /// Detach a mounted image
    Unmount { image: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum VerifyArg {
    None,
    Quick,
    Full,
}

impl From<VerifyArg> for VerificationLevel {
    fn from(arg: VerifyArg) -> Self {
        match arg {
            VerifyArg::None => VerificationLevel::None,
            VerifyArg::Quick => VerificationLevel::Quick,
            VerifyArg::Full => VerificationLevel::Full,
        }
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("■ ")
}

fn default_output(settings: &Settings, label: &str) -> PathBuf {
    let dir = settings
        .image
        .output_directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join(format!("{}.iso", label))
}

fn run_build(
    settings: &Settings,
    source: &Path,
    output: Option<PathBuf>,
    label: Option<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let label = label.unwrap_or_else(|| settings.image.default_volume_label.clone());
    let output = output.unwrap_or_else(|| default_output(settings, &normalize_volume_label(&label)));

    let bar = ProgressBar::new(0);
    bar.set_style(bar_style(
        "{prefix:10} [{elapsed_precise}] [{bar:40.green/black}] {pos}/{len} files {msg}",
    ));
    bar.set_prefix("Building");

    let result = build_image(
        source,
        &output,
        &label,
        |progress| {
            bar.set_length(progress.total_files as u64);
            bar.set_position(progress.processed_files as u64);
            bar.set_message(progress.current_file_name.clone());
        },
        cancel,
    );

    match result {
        Ok(iso) => {
            bar.finish_with_message("done");
            println!(
                "Created {} ({} files, {} bytes, label {})",
                iso.iso_path.display(),
                iso.file_count,
                iso.image_size,
                iso.volume_label
            );
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e)
        }
    }
}

fn run_recorders(engine: &BurnEngine) -> Result<()> {
    let recorders = engine.list_recorders()?;
    if recorders.is_empty() {
        println!("No recorders found.");
    }
    for recorder in recorders {
        println!("{}\t{}", recorder.unique_id, recorder);
    }
    Ok(())
}

fn run_burn(
    engine: &BurnEngine,
    image: &Path,
    recorder: Option<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let recorder_id = match recorder {
        Some(id) => id,
        None => engine
            .list_recorders()?
            .into_iter()
            .next()
            .map(|r| r.unique_id)
            .ok_or_else(|| DiscError::NotFound("no recorder available".to_string()))?,
    };

    let bar = ProgressBar::new(100);
    bar.set_style(bar_style("{prefix:10} [{elapsed_precise}] [{bar:40.magenta/black}] {pos}%"));
    bar.set_prefix("Burning");

    let progress_bar = bar.clone();
    let on_progress: BurnProgressCallback = Arc::new(move |progress: BurnProgress| {
        progress_bar.set_position(progress.percent_complete().clamp(0, 100) as u64);
    });

    let outcome = engine
        .burn_image(image, &recorder_id, Some(on_progress), cancel)?
        .wait();

    match outcome {
        Ok(BurnOutcome::Completed) => {
            bar.finish();
            println!("Burn completed on {}", recorder_id);
            Ok(())
        }
        Ok(BurnOutcome::Cancelled) => {
            bar.abandon();
            Err(DiscError::Cancelled)
        }
        Err(e) => {
            bar.abandon();
            Err(e)
        }
    }
}

fn run(cli: Cli, cancel: &CancelToken) -> Result<()> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };

    match cli.command {
        Commands::Build {
            source,
            output,
            label,
        } => run_build(&settings, &source, output, label, cancel),
        Commands::Recorders => run_recorders(&BurnEngine::new(&settings.burn)),
        Commands::Burn {
            image,
            recorder,
            verify,
        } => {
            if let Some(level) = verify {
                settings.burn.verification = level.into();
            }
            run_burn(&BurnEngine::new(&settings.burn), &image, recorder, cancel)
        }
        Commands::Mount { image } => {
            VirtualMountManager::new().mount(&image)?;
            println!("Mounted {}", image.display());
            Ok(())
        }
        Commands::Unmount { image } => {
            VirtualMountManager::new().unmount(&image)?;
            println!("Unmounted {}", image.display());
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    discwright::logging::init_logging(cli.verbose);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Cancellation requested");
        handler_token.cancel();
    }) {
        log::warn!("Could not install Ctrl-C handler: {}", e);
    }

    match run(cli, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(DiscError::Cancelled) => {
            eprintln!("Cancelled.");
            ExitCode::from(130)
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
