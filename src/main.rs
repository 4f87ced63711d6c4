//! Purpose: `pickle2json` CLI entry point.
//! Role: Binary crate root; parses args, runs the conversion, prints one status line.
//! Invariants: With no arguments it reads `Code/hist` and writes `hist_data.json`.
//! Invariants: Success and failure are both reported on stdout; diagnostics go to stderr.
//! Invariants: Exit code is 0 regardless of outcome unless `--exit-code` is given.
use std::path::PathBuf;

use clap::{Parser, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use pickle2json::api::{
    ConvertOptions, DEFAULT_INPUT, DEFAULT_OUTPUT, EncodeOptions, NonFinite, NormalizeOptions,
    OutputStyle, convert_file, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let outcome = run();
    std::process::exit(outcome.exit_code);
}

fn run() -> RunOutcome {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => RunOutcome::ok(),
                _ => RunOutcome::with_code(2),
            };
        }
    };

    let strict_exit = cli.exit_code;
    let options = cli.into_options();
    debug!(?options, "starting conversion");

    match convert_file(&options) {
        Ok(report) => {
            if let Some(array) = &report.array {
                debug!(shape = ?array.shape, dtype = ?array.dtype, "converted numeric array");
            }
            println!("{} created successfully.", report.output.display());
            RunOutcome::ok()
        }
        Err(err) => {
            warn!(kind = ?err.kind(), "conversion failed");
            println!("Error: {err}");
            if strict_exit {
                RunOutcome::with_code(to_exit_code(err.kind()))
            } else {
                RunOutcome::ok()
            }
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(
    name = "pickle2json",
    version,
    about = "Convert a pickled value or NumPy array into a JSON file",
    long_about = None,
    after_help = r#"EXAMPLES
  $ pickle2json                                  # Code/hist -> hist_data.json
  $ pickle2json -i weights.pkl -o weights.json --style compact
  $ RUST_LOG=debug pickle2json --deep

NOTES
  - Errors are printed as `Error: ...` on stdout and exit 0 (use --exit-code to change)
  - A top-level ndarray becomes nested lists; --deep converts nested arrays too"#
)]
struct Cli {
    #[arg(
        short = 'i',
        long,
        default_value = DEFAULT_INPUT,
        help = "Pickle file to read",
        value_hint = ValueHint::FilePath
    )]
    input: PathBuf,
    #[arg(
        short = 'o',
        long,
        default_value = DEFAULT_OUTPUT,
        help = "JSON file to write (overwritten)",
        value_hint = ValueHint::FilePath
    )]
    output: PathBuf,
    #[arg(
        long,
        default_value = "spaced",
        value_enum,
        help = "Output layout: spaced|compact|pretty"
    )]
    style: StyleCli,
    #[arg(long, help = "Write non-ASCII characters as UTF-8 instead of \\uXXXX escapes")]
    no_ensure_ascii: bool,
    #[arg(long, help = "Convert arrays and NumPy scalars at any depth")]
    deep: bool,
    #[arg(
        long,
        default_value = "null",
        value_enum,
        help = "NaN/Infinity handling: null|error"
    )]
    non_finite: NonFiniteCli,
    #[arg(long, help = "Exit non-zero when the conversion fails")]
    exit_code: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StyleCli {
    Spaced,
    Compact,
    Pretty,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum NonFiniteCli {
    Null,
    Error,
}

impl Cli {
    fn into_options(self) -> ConvertOptions {
        let style = match self.style {
            StyleCli::Spaced => OutputStyle::Spaced,
            StyleCli::Compact => OutputStyle::Compact,
            StyleCli::Pretty => OutputStyle::Pretty,
        };
        let non_finite = match self.non_finite {
            NonFiniteCli::Null => NonFinite::Null,
            NonFiniteCli::Error => NonFinite::Error,
        };
        ConvertOptions {
            input: self.input,
            output: self.output,
            normalize: NormalizeOptions {
                deep: self.deep,
                non_finite,
            },
            encode: EncodeOptions {
                style,
                ensure_ascii: !self.no_ensure_ascii,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::{CommandFactory, Parser};
    use pickle2json::api::{NonFinite, OutputStyle};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_arguments_map_to_fixed_paths() {
        let options = Cli::try_parse_from(["pickle2json"]).unwrap().into_options();
        assert_eq!(options.input.to_str(), Some("Code/hist"));
        assert_eq!(options.output.to_str(), Some("hist_data.json"));
        assert_eq!(options.encode.style, OutputStyle::Spaced);
        assert!(options.encode.ensure_ascii);
        assert!(!options.normalize.deep);
        assert_eq!(options.normalize.non_finite, NonFinite::Null);
    }

    #[test]
    fn flags_map_onto_options() {
        let options = Cli::try_parse_from([
            "pickle2json",
            "-i",
            "in.pkl",
            "-o",
            "out.json",
            "--style",
            "pretty",
            "--no-ensure-ascii",
            "--deep",
            "--non-finite",
            "error",
        ])
        .unwrap()
        .into_options();
        assert_eq!(options.input.to_str(), Some("in.pkl"));
        assert_eq!(options.output.to_str(), Some("out.json"));
        assert_eq!(options.encode.style, OutputStyle::Pretty);
        assert!(!options.encode.ensure_ascii);
        assert!(options.normalize.deep);
        assert_eq!(options.normalize.non_finite, NonFinite::Error);
    }
}
