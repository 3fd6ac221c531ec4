use std::{io::Write as _, path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use miette::{Context as _, IntoDiagnostic as _};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracewrap::{
    invocation::{InvocationError, InvocationOptions},
    strace::launch::TracerConfig,
};

/// Reported when the tracer itself could not be started, so it can't be
/// mistaken for the command's own status.
const LAUNCH_FAILURE_EXIT_CODE: u8 = 125;

/// Run a shell command under strace and record what its processes did.
#[derive(Debug, Clone, Parser)]
#[command(version)]
struct Args {
    /// Write the diagnostic record as JSON to this path (`-` for stdout).
    #[arg(short, long, env = "TRACEWRAP_RECORD")]
    record: Option<patharg::OutputArg>,

    /// Copy strace's raw output to this path.
    #[arg(short, long)]
    output_strace: Option<PathBuf>,

    #[arg(long, env = "TRACEWRAP_STRACE", default_value = "strace")]
    strace: PathBuf,

    #[arg(long, env = "TRACEWRAP_SHELL", default_value = "/bin/sh")]
    shell: PathBuf,

    /// How often to poll resource usage, e.g. `100ms` or `1s`.
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    sample_interval: Duration,

    /// How long to wait for leftover processes once the command exits.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    resolve_timeout: Duration,

    /// Maximum string length strace prints for syscall arguments.
    #[arg(long, default_value_t = 4096)]
    string_limit: u32,

    /// Log everything the wrapper does to stderr.
    #[arg(long)]
    debug: bool,

    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> miette::Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.debug);

    if args.record.is_none() && args.output_strace.is_none() {
        miette::bail!("one of --record or --output-strace must be specified");
    }

    let interrupted = tracewrap::signal::install()
        .into_diagnostic()
        .wrap_err("failed to install signal handlers")?;

    let command_line = args.command.join(" ");
    let options = InvocationOptions {
        tracer: TracerConfig {
            strace: args.strace,
            shell: args.shell,
            string_limit: args.string_limit,
            output_strace: args.output_strace,
        },
        sample_interval: args.sample_interval,
        resolve_timeout: args.resolve_timeout,
    };

    let outcome = match tracewrap::invocation::run(&command_line, &options, interrupted) {
        Ok(outcome) => outcome,
        Err(InvocationError::Launch(error)) => {
            eprintln!("{:?}", miette::Report::new(error));
            return Ok(ExitCode::from(LAUNCH_FAILURE_EXIT_CODE));
        }
        Err(error) => return Err(error.into()),
    };

    if let Some(record_path) = &args.record {
        let mut output = record_path
            .create()
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to open record output path {record_path}"))?;
        serde_json::to_writer_pretty(&mut output, &outcome.record)
            .into_diagnostic()
            .wrap_err("failed to write diagnostic record")?;
        writeln!(output)
            .and_then(|()| output.flush())
            .into_diagnostic()
            .wrap_err("failed to write diagnostic record")?;
    }

    let exit_code = outcome.exit_code();
    if exit_code == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        let exit_code = u8::try_from(exit_code).map_or(ExitCode::FAILURE, ExitCode::from);
        Ok(exit_code)
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug {
        LevelFilter::TRACE
    } else {
        LevelFilter::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let duration: jiff::SignedDuration = value
        .parse()
        .map_err(|error: jiff::Error| error.to_string())?;
    Duration::try_from(duration).map_err(|error| error.to_string())
}
