use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use miette::{Context, IntoDiagnostic, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fwdelta_analyzers::digest::{AnalysisDigest, ServiceMetadata};
use fwdelta_analyzers::dispatch::AnalysisContext;
use fwdelta_analyzers::kernel::KernelHardeningDiff;
use fwdelta_analyzers::pipeline::{read_summary, DigestPipeline, SnapshotRoots};
use fwdelta_core::{FwdeltaConfig, OutputFormat};
use fwdelta_rank::broadcasts::{parse_intent_filters, parse_protected_broadcasts, undeclared_broadcasts};
use fwdelta_rank::components::{
    compare_components, compare_visibility, parse_manifest, ComponentMap, VisibilityMap,
};
use fwdelta_rank::priority::rank;
use fwdelta_rank::protection::{
    compare_gids, diff_protection_levels, parse_permission_levels, GidPermissions, GidSnapshot,
    ProtectionLevelScorer,
};
use fwdelta_rank::report::DigestReport;

#[derive(Parser)]
#[command(
    name = "fwdelta",
    version,
    about = "Security regression digests between two firmware snapshots",
    long_about = "fwdelta turns the per-file summary of a diff between two extracted firmware\n\
                   snapshots into a security-tiered digest, runs deep analyzers on changed\n\
                   binaries, packages and certificates, and ranks the results for review.\n\n\
                   Examples:\n  \
                     fwdelta digest --diff numstat.txt                 Change tree only\n  \
                     fwdelta analyze --diff numstat.txt --old-root old --new-root new\n  \
                     fwdelta rank --input digests.json                 Rank saved digests\n  \
                     fwdelta kernel --before a.txt --after b.txt       Kernel config flips"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .fwdelta.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable tables and summaries (default)\n  \
                         json      Machine-readable JSON\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable debug logging on stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build the aggregated change tree of a diff summary
    #[command(long_about = "Build the aggregated change tree of a diff summary.\n\n\
        The summary has one `<added>\\t<deleted>\\t<path>` line per file, `-` standing\n\
        for non-text content. No snapshot access and no deep analysis.\n\n\
        Examples:\n  fwdelta digest --diff numstat.txt --format json\n  fwdelta digest --diff numstat.txt --root-key BUILD123")]
    Digest {
        /// Diff summary file
        #[arg(long)]
        diff: PathBuf,

        /// Wrap the tree under this top-level key
        #[arg(long)]
        root_key: Option<String>,
    },
    /// Build the change tree and deep-analyze changed artifacts
    #[command(long_about = "Build the change tree and deep-analyze changed artifacts.\n\n\
        Every artifact present in both snapshots is routed to an analyzer by content and\n\
        path. Tool failures degrade a single artifact to line counts; the run continues.\n\n\
        Examples:\n  fwdelta analyze --diff numstat.txt --old-root old --new-root new\n  \
        fwdelta analyze --diff numstat.txt --old-root old --new-root new --services rc.json --digests-out digests.json")]
    Analyze {
        /// Diff summary file
        #[arg(long)]
        diff: PathBuf,

        /// Extracted old snapshot
        #[arg(long)]
        old_root: PathBuf,

        /// Extracted new snapshot
        #[arg(long)]
        new_root: PathBuf,

        /// Service manifest metadata (JSON: binary path -> metadata)
        #[arg(long)]
        services: Option<PathBuf>,

        /// Shared-library usage map (JSON: library name -> consuming binaries)
        #[arg(long)]
        lib_usage: Option<PathBuf>,

        /// Wrap the tree under this top-level key
        #[arg(long)]
        root_key: Option<String>,

        /// Also write the per-artifact digests to this file
        #[arg(long)]
        digests_out: Option<PathBuf>,

        /// Analyze artifacts one at a time
        #[arg(long)]
        sequential: bool,
    },
    /// Rank saved per-artifact digests for review
    Rank {
        /// Digest file written by `analyze --digests-out`
        #[arg(long)]
        input: PathBuf,
    },
    /// Compare permission protection levels of two snapshots
    Permissions {
        /// Old permission dump (one JSON object per line)
        #[arg(long)]
        old: PathBuf,

        /// New permission dump
        #[arg(long)]
        new: PathBuf,
    },
    /// Compare GID protection of two snapshots
    Gids {
        /// Old GID map (JSON: gid -> permissions)
        #[arg(long)]
        old_gids: PathBuf,

        /// New GID map
        #[arg(long)]
        new_gids: PathBuf,

        /// Old permission dump
        #[arg(long)]
        old_levels: PathBuf,

        /// New permission dump
        #[arg(long)]
        new_levels: PathBuf,
    },
    /// Record the component guards of one package manifest
    #[command(long_about = "Record the component guards of one package manifest.\n\n\
        Reads a decoded AndroidManifest.xml and merges its activity, service, receiver and\n\
        provider permissions into a JSON component map under the package path.\n\n\
        Examples:\n  fwdelta manifest --apk system/app/Foo/Foo.apk --manifest Foo/AndroidManifest.xml --out old.json")]
    Manifest {
        /// Package path to record the components under
        #[arg(long)]
        apk: PathBuf,

        /// Decoded manifest
        #[arg(long)]
        manifest: PathBuf,

        /// Component map to create or update
        #[arg(long)]
        out: PathBuf,
    },
    /// Compare component guards of two snapshots
    Components {
        /// Old component map written by `manifest`
        #[arg(long)]
        old: PathBuf,

        /// New component map
        #[arg(long)]
        new: PathBuf,

        /// Old permission dump
        #[arg(long)]
        old_levels: PathBuf,

        /// New permission dump
        #[arg(long)]
        new_levels: PathBuf,
    },
    /// Compare component export state of two snapshots
    Visibility {
        /// Old visibility dump (JSON: package path -> components)
        #[arg(long)]
        old: PathBuf,

        /// New visibility dump
        #[arg(long)]
        new: PathBuf,
    },
    /// List filtered broadcast actions nobody declared protected
    Broadcasts {
        /// Protected-broadcast listing (`### <package>` sections)
        #[arg(long)]
        protected: PathBuf,

        /// Intent-filter listing (`== <package> ==` sections)
        #[arg(long)]
        intents: PathBuf,
    },
    /// Compare two kernel hardening checker reports
    Kernel {
        /// Report of the old kernel
        #[arg(long)]
        before: PathBuf,

        /// Report of the new kernel
        #[arg(long)]
        after: PathBuf,
    },
    /// Create a default .fwdelta.toml configuration file
    #[command(long_about = "Create a default .fwdelta.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if .fwdelta.toml already exists.")]
    Init,
    /// Generate shell completion scripts
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

const DEFAULT_CONFIG: &str = r#"# fwdelta configuration

[tools]
# radiff2 = "radiff2"
# checksec = "checksec"
# dexdump = "dexdump"
# timeout_secs = 300

[analysis]
# entropy_threshold = 7.5
# entropy_window = 4096
# digest_key_depth = 3
# certificate_text_diff = false
# parallel = true
# archive_extensions = ["apk"]
# certificate_dirs = ["cacerts", "cacerts_google"]
# wrapper_magics = ["SEC2", "SEC3", "SEC4", "MCLF"]
# wrapper_magic_offset = 0
# skip_patterns = ["vendor/firmware/**"]

[tiers]
# ignore_prefixes = ["META-INF/", "original/", "stamp-cert-sha256", "apktool.yml"]
# critical_substrings = ["classes", "AndroidManifest.xml"]
# meaningful_substrings = ["lib/", "assets/", "res/", "resources.arsc", "smali", "kotlin/"]

[protection]
# Scores are in tenths of a point.
# default_base = "normal"
# default_flag_weight = 10
# [protection.base_levels]
# normal = 100
# dangerous = 200
# signature = 300
# [protection.flag_weights]
# privileged = 50
# pre23 = 5
"#;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<FwdeltaConfig> {
    let path = match path {
        Some(p) => p,
        None => {
            let default_path = Path::new(".fwdelta.toml");
            if !default_path.exists() {
                return Ok(FwdeltaConfig::default());
            }
            default_path
        }
    };
    FwdeltaConfig::from_file(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to load {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    serde_json::from_str(&read_text(path)?)
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn print_report(report: &DigestReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Markdown => {
            print!("{}", report.to_markdown());
            Ok(())
        }
        OutputFormat::Text => {
            print!("{report}");
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(format = %cli.format, parallel = config.analysis.parallel, "configuration loaded");

    match cli.command {
        Command::Digest { ref diff, ref root_key } => {
            let input = read_summary(diff)
                .into_diagnostic()
                .wrap_err("cannot read diff summary")?;
            let mut pipeline = DigestPipeline::from_config(&config);
            if let Some(key) = root_key {
                pipeline = pipeline.with_root_key(key.clone());
            }
            let output = pipeline.summarize(&input);
            match cli.format {
                OutputFormat::Json => print_json(&output.tree)?,
                format => print_report(&DigestReport::from_pipeline(&output), format)?,
            }
        }
        Command::Analyze {
            ref diff,
            ref old_root,
            ref new_root,
            ref services,
            ref lib_usage,
            ref root_key,
            ref digests_out,
            sequential,
        } => {
            let input = read_summary(diff)
                .into_diagnostic()
                .wrap_err("cannot read diff summary")?;
            let services: BTreeMap<String, ServiceMetadata> = match services {
                Some(path) => read_json(path)?,
                None => BTreeMap::new(),
            };
            let lib_usage: BTreeMap<String, Vec<String>> = match lib_usage {
                Some(path) => read_json(path)?,
                None => BTreeMap::new(),
            };
            let ctx = AnalysisContext::new(services, lib_usage);

            let mut pipeline = DigestPipeline::from_config(&config);
            if sequential {
                pipeline = pipeline.with_parallel(false);
            }
            if let Some(key) = root_key {
                pipeline = pipeline.with_root_key(key.clone());
            }
            let output = pipeline.run(&input, &SnapshotRoots::new(old_root, new_root), &ctx);

            if let Some(path) = digests_out {
                let json = serde_json::to_string_pretty(&output.digests).into_diagnostic()?;
                std::fs::write(path, json)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("failed to write {}", path.display()))?;
            }

            match cli.format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "tree": output.tree,
                    "digests": output.digests,
                }))?,
                format => print_report(&DigestReport::from_pipeline(&output), format)?,
            }
        }
        Command::Rank { ref input } => {
            let digests: BTreeMap<String, AnalysisDigest> = read_json(input)?;
            match cli.format {
                OutputFormat::Json => print_json(&rank(&digests))?,
                format => print_report(&DigestReport::from_digests(&digests), format)?,
            }
        }
        Command::Permissions { ref old, ref new } => {
            let scorer = ProtectionLevelScorer::from_config(&config.protection);
            let old = parse_permission_levels(&read_text(old)?);
            let new = parse_permission_levels(&read_text(new)?);
            let digest = diff_protection_levels(&scorer, &old.levels, &new.levels);
            match cli.format {
                OutputFormat::Json => print_json(&digest)?,
                _ => print!("{digest}"),
            }
        }
        Command::Gids {
            ref old_gids,
            ref new_gids,
            ref old_levels,
            ref new_levels,
        } => {
            let scorer = ProtectionLevelScorer::from_config(&config.protection);
            let old_gids: GidPermissions = read_json(old_gids)?;
            let new_gids: GidPermissions = read_json(new_gids)?;
            let old_levels = parse_permission_levels(&read_text(old_levels)?);
            let new_levels = parse_permission_levels(&read_text(new_levels)?);
            let levels_digest = diff_protection_levels(&scorer, &old_levels.levels, &new_levels.levels);
            let digest = compare_gids(
                &scorer,
                GidSnapshot {
                    gids: &old_gids,
                    levels: &old_levels.levels,
                },
                GidSnapshot {
                    gids: &new_gids,
                    levels: &new_levels.levels,
                },
                &levels_digest,
            );
            match cli.format {
                OutputFormat::Json => print_json(&digest)?,
                _ => print!("{digest}"),
            }
        }
        Command::Manifest {
            ref apk,
            ref manifest,
            ref out,
        } => {
            let parsed = parse_manifest(&read_text(manifest)?)
                .into_diagnostic()
                .wrap_err_with(|| format!("cannot read {}", manifest.display()))?;
            let Some(parsed) = parsed else {
                tracing::info!(manifest = %manifest.display(), "no <application> element, nothing recorded");
                return Ok(());
            };
            let mut map: ComponentMap = if out.exists() {
                read_json(out)?
            } else {
                ComponentMap::new()
            };
            map.insert(apk.display().to_string(), parsed);
            let json = serde_json::to_string_pretty(&map).into_diagnostic()?;
            std::fs::write(out, json)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to write {}", out.display()))?;
            println!("Recorded {} in {}", apk.display(), out.display());
        }
        Command::Components {
            ref old,
            ref new,
            ref old_levels,
            ref new_levels,
        } => {
            let scorer = ProtectionLevelScorer::from_config(&config.protection);
            let old: ComponentMap = read_json(old)?;
            let new: ComponentMap = read_json(new)?;
            let old_levels = parse_permission_levels(&read_text(old_levels)?);
            let new_levels = parse_permission_levels(&read_text(new_levels)?);
            let levels_digest = diff_protection_levels(&scorer, &old_levels.levels, &new_levels.levels);
            let digest = compare_components(&scorer, &old, &new, &new_levels.levels, &levels_digest);
            match cli.format {
                OutputFormat::Json => print_json(&digest)?,
                _ => print!("{digest}"),
            }
        }
        Command::Visibility { ref old, ref new } => {
            let old: VisibilityMap = read_json(old)?;
            let new: VisibilityMap = read_json(new)?;
            let digest = compare_visibility(&old, &new);
            match cli.format {
                OutputFormat::Json => print_json(&digest)?,
                _ => print!("{digest}"),
            }
        }
        Command::Broadcasts {
            ref protected,
            ref intents,
        } => {
            let protected = parse_protected_broadcasts(&read_text(protected)?);
            let intents = parse_intent_filters(&read_text(intents)?);
            let undeclared = undeclared_broadcasts(&protected, &intents);
            match cli.format {
                OutputFormat::Json => print_json(&undeclared)?,
                _ => print!("{undeclared}"),
            }
        }
        Command::Kernel { ref before, ref after } => {
            let diff = KernelHardeningDiff::from_reports(&read_text(before)?, &read_text(after)?);
            match cli.format {
                OutputFormat::Json => print_json(&diff)?,
                _ => print!("{diff}"),
            }
        }
        Command::Init => {
            let path = Path::new(".fwdelta.toml");
            if path.exists() {
                miette::bail!(".fwdelta.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .fwdelta.toml with default configuration");
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "fwdelta", &mut std::io::stdout());
        }
    }

    Ok(())
}
