use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dynacall_config::{ConfigLoader, GateMode};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Call functions in native shared libraries without compiling bindings.
///
/// EXAMPLES:
///     dynacall call libm.so.6 cos --arg f64:0 --ret f64
///     dynacall call self strlen --arg str:hello --ret u64
///     dynacall lookup libc.so.6 printf puts
///     dynacall abi --param f64 --param i32 --ret f64
///     dynacall config
///
/// ENVIRONMENT VARIABLES:
///     DYNACALL_LOG                 Log filter (e.g. 'debug', 'dynacall_runtime=trace')
///     DYNACALL_GATE_MODE           auto | native-thread | direct
///     DYNACALL_NATIVE_STACK_SIZE   Stack size in bytes for native-thread mode
///     DYNACALL_WORKER_THREADS      Worker threads of the engine runtime
///     DYNACALL_OPEN_MODE           Default open flags, e.g. 'now,global'
#[derive(Parser)]
#[command(name = "dynacall")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output (debug logging to stderr)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Directory to search for dynacall.toml (defaults to the current directory)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a function in a shared library
    ///
    /// Use `self` as the library to search the symbols already loaded into
    /// the process.
    ///
    /// ARGUMENT KINDS:
    ///     i8 i16 i32 i64 u8 u16 u32 u64 bool ptr f32 f64 str
    ///
    /// EXAMPLES:
    ///     dynacall call libm.so.6 pow --arg f64:2 --arg f64:10 --ret f64
    ///     dynacall call self abs --arg i32:-7 --ret i32
    #[command(visible_alias = "c")]
    Call {
        /// Library path or name passed to the dynamic linker
        library: String,
        /// Exported function name
        symbol: String,
        /// Argument as kind:value, in order
        #[arg(long = "arg", short = 'a')]
        args: Vec<String>,
        /// Return kind (void when omitted)
        #[arg(long)]
        ret: Option<String>,
        /// Override the configured gate mode
        #[arg(long)]
        gate: Option<GateMode>,
        /// Print the result as JSON
        #[arg(long, env = "DYNACALL_JSON")]
        json: bool,
    },

    /// Resolve symbols and print their addresses
    #[command(visible_alias = "l")]
    Lookup {
        /// Library path or name passed to the dynamic linker
        library: String,
        /// Symbol names
        #[arg(required = true)]
        symbols: Vec<String>,
    },

    /// Show how a signature is passed under a calling convention
    ///
    /// Without parameters prints the convention's register files.
    ///
    /// EXAMPLES:
    ///     dynacall abi
    ///     dynacall abi --convention win64 --param f64 --param i32
    Abi {
        /// sysv, aapcs64 or win64 (defaults to the host convention)
        #[arg(long)]
        convention: Option<String>,
        /// Parameter kind, in order
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
        /// Return kind
        #[arg(long)]
        ret: Option<String>,
        /// Print the plan as JSON
        #[arg(long, env = "DYNACALL_JSON")]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("DYNACALL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let start_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let config = ConfigLoader::new()
        .load_from_directory(&start_dir)
        .context("Failed to load configuration")?;
    tracing::debug!(project = ?config.project_root(), "loaded configuration");

    match cli.command {
        Commands::Call {
            library,
            symbol,
            args,
            ret,
            gate,
            json,
        } => {
            let mut engine = config.engine;
            if let Some(mode) = gate {
                engine.gate.get_or_insert_with(Default::default).mode = Some(mode);
            }
            commands::call::run(
                engine,
                commands::call::CallArgs {
                    library,
                    symbol,
                    args,
                    ret,
                    json,
                },
            )?;
        }
        Commands::Lookup { library, symbols } => {
            commands::lookup::run(config.engine, &library, &symbols)?;
        }
        Commands::Abi {
            convention,
            params,
            ret,
            json,
        } => {
            commands::abi::run(convention.as_deref(), &params, ret.as_deref(), json)?;
        }
        Commands::Config => {
            commands::config::run(&config)?;
        }
    }

    Ok(())
}
