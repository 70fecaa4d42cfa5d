use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use idflash::device::{Category, parse_number};
use idflash::eeprom::IdentityTarget;
use idflash::flashing::ErrorMode;
use idflash::identity::{ColorPolicy, inject, resolve_id_address};
use idflash::{
    Backend, BackendKind, DeviceDb, FlashJob, FlashOptions, Flasher, Identity, Image,
    ProcessRunner,
};

fn parse_byte(s: &str) -> std::result::Result<u8, String> {
    let n = parse_number(s)?;
    u8::try_from(n).map_err(|_| format!("{} does not fit in a byte", s))
}

#[derive(clap::Parser)]
#[command(
    name = "idflash",
    version,
    about = "Write per-unit identity into firmware and flash it with ST-Link or J-Link"
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also append log output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct IdentityArgs {
    /// Device name from the catalog
    #[arg(short, long)]
    device: String,

    /// Firmware image (.hex, or .bin for STM32)
    #[arg(short, long)]
    firmware: PathBuf,

    /// Device ID, 6 or 8 hex digits
    #[arg(long)]
    id: String,

    /// Color code
    #[arg(long, value_parser = parse_byte)]
    color: Option<u8>,

    /// Hardware variant, for devices with per-variant hardware types
    #[arg(long)]
    variant: Option<String>,

    /// Refuse colors the device does not come in
    #[arg(long)]
    strict_color: bool,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List devices in the catalog
    List {
        #[arg(long, value_parser = ["intrusion", "smart_home", "sirens", "fire", "other"])]
        category: Option<String>,
    },
    /// Write the identity into a firmware image without flashing
    Inject {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Where to write the patched image
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Inject the identity and program the attached device
    Flash {
        #[command(flatten)]
        identity: IdentityArgs,

        #[arg(short, long, value_enum, default_value_t = BackendKind::StLink)]
        backend: BackendKind,

        /// YAML file with flashing options; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        bootloader: Option<PathBuf>,

        /// Programmer serial number
        #[arg(long)]
        sn: Option<String>,

        /// Attempts per programmer command
        #[arg(long)]
        tries: Option<usize>,

        /// Seconds before a programmer command is killed
        #[arg(long)]
        timeout: Option<u64>,

        /// The device is already unlocked
        #[arg(long)]
        unlocked: bool,

        /// Directory containing stm8flash
        #[arg(long)]
        tool_dir: Option<PathBuf>,

        /// Directory with device-specific openocd scripts
        #[arg(long)]
        openocd_scripts: Option<PathBuf>,

        /// Root directory for temporary files
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Keep going after a failed stage and only report failure
        #[arg(long)]
        lenient: bool,
    },
}

fn init_logging(verbose: u8, log_file: Option<&PathBuf>) -> Result<()> {
    let level = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        loggers.push(simplelog::WriteLogger::new(
            level,
            simplelog::Config::default(),
            file,
        ));
    }
    let _ = simplelog::CombinedLogger::init(loggers);
    Ok(())
}

fn identity_of(args: &IdentityArgs) -> Result<Identity> {
    Ok(Identity::parse(&args.id)?
        .with_color(args.color)
        .with_hardware_variant(args.variant.clone()))
}

fn color_policy(args: &IdentityArgs) -> ColorPolicy {
    if args.strict_color {
        ColorPolicy::Strict
    } else {
        ColorPolicy::Tolerant
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_ref())?;

    let db = DeviceDb::load()?;
    match cli.command {
        Command::List { category } => {
            for c in Category::ALL {
                let name = serde_yaml::to_string(&c)?;
                if category.as_deref().is_some_and(|wanted| wanted != name.trim()) {
                    continue;
                }
                println!("{}:", name.trim());
                for (i, device) in db.category(c).enumerate() {
                    println!("  {:3}. {}", i, device);
                }
            }
        }
        Command::Inject { identity: args, output } => {
            let device = db.find(&args.device)?;
            let identity = identity_of(&args)?;
            let id_address = resolve_id_address(&device, &args.firmware)?;
            anyhow::ensure!(
                IdentityTarget::for_address(id_address) == IdentityTarget::Firmware,
                "ID address {:#x} of {} is in EEPROM, use `flash` to read it from the device",
                id_address,
                device.name
            );
            let image = Image::load(&args.firmware)
                .with_context(|| format!("loading {}", args.firmware.display()))?;
            let patched = inject(image, &device, &identity, id_address, color_policy(&args))?;
            patched.save(&output)?;
            log::info!("Patched image written to {}", output.display());
        }
        Command::Flash {
            identity: args,
            backend,
            config,
            bootloader,
            sn,
            tries,
            timeout,
            unlocked,
            tool_dir,
            openocd_scripts,
            work_dir,
            lenient,
        } => {
            let mut options = match config {
                Some(path) => FlashOptions::from_yaml_file(&path)?,
                None => FlashOptions::default(),
            };
            options.bootloader = bootloader.or(options.bootloader);
            options.programmer_sn = sn.or(options.programmer_sn);
            options.tries = tries.unwrap_or(options.tries);
            options.timeout_secs = timeout.unwrap_or(options.timeout_secs);
            options.unlocked |= unlocked;
            options.tool_dir = tool_dir.or(options.tool_dir);
            options.openocd_scripts = openocd_scripts.or(options.openocd_scripts);
            options.work_dir = work_dir.unwrap_or(options.work_dir);
            if args.strict_color {
                options.color_policy = ColorPolicy::Strict;
            }
            if lenient {
                options.error_mode = ErrorMode::Lenient;
            }
            options.validate()?;

            let device = db.find(&args.device)?;
            let identity = identity_of(&args)?;
            let job = FlashJob::new(
                device,
                args.firmware.clone(),
                options.bootloader.clone(),
                &options.work_dir,
            )?;
            let runner = ProcessRunner::new(options.timeout());
            let ok = Backend::new(backend, runner, job, identity, options).run()?;
            anyhow::ensure!(ok, "flashing {} failed", args.device);
            log::info!("{} flashed", args.device);
        }
    }

    Ok(())
}
