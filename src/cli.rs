// ============================================================================
// PaintCore CLI - headless batch processing via command-line arguments
// ============================================================================
//
// Usage examples:
//   paintcore -i photo.png -f invert -o result.png
//   paintcore -i photo.png -f grayscale -f flip-horizontal -o result.pcs
//   paintcore -i "shots/*.png" -f brightness-contrast --output-dir processed/
//   paintcore -i project.pcs -o flat.png
//
// Every filter runs through the same pipeline as interactive use. Modal
// filters are confirmed with their dialog defaults.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{error, info};

use crate::io::write_png;
use crate::ops::filters::{FilterId, FilterInput, FlipInput, builtin};
use crate::ops::pipeline::Invocation;
use crate::session::EditingSession;
use crate::settings::EngineSettings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// PaintCore headless image processor.
#[derive(Parser, Debug)]
#[command(
    name = "paintcore",
    about = "PaintCore headless batch image processor",
    long_about = "Run filters on PNG images or stored PaintCore projects and write a\n\
                  flattened PNG or a layered project.\n\n\
                  Example:\n  \
                  paintcore --input photo.png --filter invert --output result.png\n  \
                  paintcore -i \"*.png\" -f grayscale --output-dir out/"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.pcs").
    /// Stored projects (.pcs) retain all layers; images load as one layer.
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Filter to run on the focused layer, in order. Repeatable.
    /// One of: invert, grayscale, brightness-contrast, hue-saturation,
    /// flip-horizontal, flip-vertical.
    #[arg(short, long = "filter", value_name = "FILTER")]
    pub filters: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png or pcs. Inferred from --output when omitted, defaulting to png.
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Do not embed a thumbnail in stored projects.
    #[arg(long)]
    pub no_thumbnail: bool,

    /// Print per-file timing and debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Flattened composite.
    Png,
    /// Layered stored project.
    Project,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Project => "pcs",
        }
    }
}

/// One requested filter plus the input that replaces its dialog defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterStep {
    pub filter: FilterId,
    pub input: Option<FilterInput>,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs, settings: &EngineSettings) -> ExitCode {
    let steps = match args.filters.iter().map(|f| parse_filter(f)).collect::<Result<Vec<_>, _>>() {
        Ok(steps) => steps,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let format = parse_format(args.format.as_deref(), args.output.as_deref());

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let jobs = match plan_outputs(&inputs, args.output.as_deref(), args.output_dir.as_deref(), format) {
        Ok(jobs) => jobs,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let total = jobs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, (input_path, output_path)) in jobs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();

        match run_one(input_path, output_path, &steps, format, !args.no_thumbnail, settings) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                error!("{}: {}", input_path.display(), e);
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

// ============================================================================
// Per-file processing
// ============================================================================

pub fn run_one(
    input: &Path,
    output: &Path,
    steps: &[FilterStep],
    format: OutputFormat,
    with_thumbnail: bool,
    settings: &EngineSettings,
) -> Result<(), String> {
    let session = EditingSession::open(input, settings).map_err(|e| format!("load failed: {}", e))?;

    for step in steps {
        match session.invoke(&builtin(step.filter)).map_err(|e| e.to_string())? {
            Invocation::Applied(_) => {}
            Invocation::Pending(mut pending) => {
                if let Some(input) = &step.input {
                    pending.update(input.clone()).map_err(|e| e.to_string())?;
                }
                pending.confirm().map_err(|e| e.to_string())?;
            }
        }
    }

    match format {
        OutputFormat::Project => {
            let stored = session.to_storage(with_thumbnail).map_err(|e| format!("encode failed: {}", e))?;
            stored.save(output).map_err(|e| format!("project save failed: {}", e))?;
        }
        OutputFormat::Png => {
            write_png(&session.composite_image(), output).map_err(|e| format!("save failed: {}", e))?;
        }
    }
    info!("{} -> {} ({} filters)", input.display(), output.display(), steps.len());
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Map a CLI filter name to a filter and its input override.
pub fn parse_filter(name: &str) -> Result<FilterStep, String> {
    let flip = |horizontal: bool| FilterStep {
        filter: FilterId::Flip,
        input: Some(FilterInput::Flip(FlipInput { horizontal, vertical: !horizontal, whole_stack: true })),
    };
    match name.to_lowercase().as_str() {
        "flip-horizontal" => Ok(flip(true)),
        "flip-vertical" => Ok(flip(false)),
        other => match FilterId::from_name(other) {
            Some(filter @ (FilterId::Gradient | FilterId::Shape)) => {
                Err(format!("filter '{}' needs interactive parameters", filter))
            }
            Some(filter) => Ok(FilterStep { filter, input: None }),
            None => Err(format!("unknown filter '{}'", name)),
        },
    }
}

/// Lowercased extension, if any.
fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase)
}

/// Only PNG images and stored projects can be opened.
fn is_supported_input(path: &Path) -> bool {
    matches!(extension_of(path).as_deref(), Some("png" | "pcs"))
}

/// Expand `--input` patterns in order. Directories and other file types are skipped
/// with a warning, and a file reached by two patterns is processed once.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    patterns
        .iter()
        .flat_map(|pattern| expand_pattern(pattern))
        .filter(|path| {
            if path.is_dir() || !is_supported_input(path) {
                eprintln!("warning: skipping '{}': not a .png image or .pcs project.", path.display());
                return false;
            }
            seen.insert(path.clone())
        })
        .collect()
}

/// An existing path is taken literally, so names containing `[` still work.
fn expand_pattern(pattern: &str) -> Vec<PathBuf> {
    let literal = PathBuf::from(pattern);
    if literal.exists() {
        return vec![literal];
    }
    let matches: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(entries) => entries.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("warning: invalid glob '{}': {}", pattern, e);
            return Vec::new();
        }
    };
    if matches.is_empty() {
        eprintln!("warning: pattern '{}' matched no files.", pattern);
    }
    matches
}

/// `--format` wins, then the `--output` extension. Anything but `pcs` is PNG.
fn parse_format(format_arg: Option<&str>, output: Option<&Path>) -> OutputFormat {
    let name = format_arg.map(str::to_ascii_lowercase).or_else(|| output.and_then(extension_of));
    match name.as_deref() {
        Some("pcs") => OutputFormat::Project,
        _ => OutputFormat::Png,
    }
}

/// Where one input is written.
///
/// - `--output` is used as given, gaining the format's extension when it has none.
/// - `--output-dir` gets `<stem>.<ext>`.
/// - Otherwise the result lands beside the input as `<stem>.edited.<ext>`, so an
///   input is never overwritten in place.
fn output_path_for(input: &Path, output: Option<&Path>, output_dir: Option<&Path>, format: OutputFormat) -> Option<PathBuf> {
    let ext = format.extension();
    if let Some(out) = output {
        return Some(if out.extension().is_some() { out.to_path_buf() } else { out.with_extension(ext) });
    }
    let stem = input.file_stem()?.to_string_lossy();
    Some(match output_dir {
        Some(dir) => dir.join(format!("{stem}.{ext}")),
        None => input.with_file_name(format!("{stem}.edited.{ext}")),
    })
}

/// Pair every input with its output before any work starts. Two inputs mapping to
/// one output (`a.png` and `a.pcs` into the same directory) or an output that would
/// replace an input are refused up front.
fn plan_outputs(
    inputs: &[PathBuf],
    output: Option<&Path>,
    output_dir: Option<&Path>,
    format: OutputFormat,
) -> Result<Vec<(PathBuf, PathBuf)>, String> {
    let mut targets: HashMap<PathBuf, &Path> = HashMap::new();
    let mut jobs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let target = output_path_for(input, output, output_dir, format)
            .ok_or_else(|| format!("cannot determine output path for '{}'", input.display()))?;
        if inputs.contains(&target) {
            return Err(format!("'{}' would overwrite an input file", target.display()));
        }
        if let Some(first) = targets.insert(target.clone(), input.as_path()) {
            return Err(format!(
                "'{}' and '{}' would both be written to '{}'",
                first.display(),
                input.display(),
                target.display()
            ));
        }
        jobs.push((input.clone(), target));
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_names_map_to_steps() {
        assert_eq!(parse_filter("invert").unwrap(), FilterStep { filter: FilterId::Invert, input: None });
        let flip = parse_filter("flip-vertical").unwrap();
        assert_eq!(
            flip.input,
            Some(FilterInput::Flip(FlipInput { horizontal: false, vertical: true, whole_stack: true }))
        );
        assert!(parse_filter("shape").is_err());
        assert!(parse_filter("sharpen").is_err());
    }

    #[test]
    fn outputs_never_replace_inputs() {
        let input = Path::new("dir/photo.png");
        assert_eq!(
            output_path_for(input, None, None, OutputFormat::Png),
            Some(PathBuf::from("dir/photo.edited.png"))
        );
        assert_eq!(
            output_path_for(input, None, Some(Path::new("out")), OutputFormat::Project),
            Some(PathBuf::from("out/photo.pcs"))
        );
        assert_eq!(
            output_path_for(input, Some(Path::new("result")), None, OutputFormat::Project),
            Some(PathBuf::from("result.pcs"))
        );
        assert_eq!(parse_format(None, Some(Path::new("a.PCS"))), OutputFormat::Project);
        assert_eq!(parse_format(Some("png"), Some(Path::new("a.pcs"))), OutputFormat::Png);

        let same_stem = [PathBuf::from("a.png"), PathBuf::from("a.pcs")];
        assert!(plan_outputs(&same_stem, None, Some(Path::new("out")), OutputFormat::Png).is_err());
        assert!(plan_outputs(&same_stem, Some(Path::new("a.png")), None, OutputFormat::Png).is_err());
        assert!(plan_outputs(&same_stem, None, None, OutputFormat::Png).is_err());
        let jobs = plan_outputs(&[PathBuf::from("a.png"), PathBuf::from("b.pcs")], None, None, OutputFormat::Png).unwrap();
        assert_eq!(jobs[1], (PathBuf::from("b.pcs"), PathBuf::from("b.edited.png")));
    }

    #[test]
    fn inputs_skip_unsupported_and_repeated_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.pcs", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let all = dir.path().join("*").to_string_lossy().into_owned();
        let b = dir.path().join("b.png").to_string_lossy().into_owned();
        let resolved = resolve_inputs(&[b.clone(), all, b]);
        assert_eq!(resolved, [dir.path().join("b.png"), dir.path().join("a.pcs")]);
    }

    #[test]
    fn args_parse_repeated_filters() {
        let args = CliArgs::try_parse_from(["paintcore", "-i", "a.png", "-f", "invert", "-f", "grayscale", "-o", "b.pcs"])
            .unwrap();
        assert_eq!(args.filters, ["invert", "grayscale"]);
        assert_eq!(args.output, Some(PathBuf::from("b.pcs")));
    }
}
