use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use iconsys_core::title_cfg::run_cfg;
use iconsys_core::{
    find_files, read_preview, run_titles, BatchSummary, CfgSettings, IconSysError, Prompter,
    Result, TitleLayout, TitleSettings, ICON_SYS_NAME,
};

#[derive(Debug, Parser)]
#[command(name = "iconsys", version, about = "PS2 icon.sys title and title.cfg editor")]
struct Cli {
    /// Log debug detail (byte dumps, skipped entries).
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactively retitle every icon.sys under ROOT.
    Titles {
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Do not create .bak files.
        #[arg(long)]
        no_backup: bool,

        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Print the stored title of every icon.sys under ROOT.
    Show {
        #[arg(default_value = ".")]
        root: PathBuf,

        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Interactively edit the key=value pairs of every title.cfg under ROOT.
    Cfg {
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Do not create .bak files.
        #[arg(long)]
        no_backup: bool,
    },
}

#[derive(Debug, Args)]
struct LayoutArgs {
    /// JSON file with title_offset / block_len / split_offset.
    #[arg(long, value_name = "FILE")]
    layout: Option<PathBuf>,

    /// Title block start (default 0xC0).
    #[arg(long, value_parser = parse_offset)]
    offset: Option<usize>,

    /// Title block length (default 68).
    #[arg(long)]
    block_len: Option<usize>,

    /// Position of the line-one length byte (default 0x06).
    #[arg(long, value_parser = parse_offset)]
    split_offset: Option<usize>,
}

impl LayoutArgs {
    fn resolve(&self) -> Result<TitleLayout> {
        let mut layout = match &self.layout {
            Some(path) => TitleLayout::from_json_file(path)?,
            None => TitleLayout::default(),
        };
        if let Some(offset) = self.offset {
            layout.title_offset = offset;
        }
        if let Some(block_len) = self.block_len {
            layout.block_len = block_len;
        }
        if let Some(split_offset) = self.split_offset {
            layout.split_offset = split_offset;
        }
        layout
            .validate()
            .map_err(|e| IconSysError::Config(e.to_string()))?;
        Ok(layout)
    }
}

fn parse_offset(s: &str) -> std::result::Result<usize, String> {
    let res = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16)
    } else {
        s.parse::<usize>()
    };
    res.map_err(|e| format!("invalid offset '{s}': {e}"))
}

struct StdioPrompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter for StdioPrompter<R, W> {
    fn show(&mut self, text: &str) {
        if let Err(err) = writeln!(self.output, "{text}") {
            log::warn!("failed to write to terminal: {err}");
        }
    }

    /// A question the user never saw cannot be answered, so a failed write
    /// ends input the same way EOF does.
    fn ask(&mut self, question: &str) -> Option<String> {
        if let Err(err) = write!(self.output, "{question}").and_then(|()| self.output.flush()) {
            log::warn!("failed to show prompt: {err}");
            return None;
        }
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

fn init_logging(level: LevelFilter) -> std::result::Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stderr())
        .apply()
}

fn show_titles(root: &Path, layout: &TitleLayout) -> Result<()> {
    let icons = find_files(root, ICON_SYS_NAME)?;
    println!("Found {} icon.sys files.", icons.len());
    for path in &icons {
        match read_preview(path, layout) {
            Ok(p) => println!(
                "{}\n  split={} line1='{}' line2='{}'",
                p.path.display(),
                p.split,
                p.line1,
                p.line2
            ),
            Err(e) => eprintln!("{}\n  ERROR reading: {e}", path.display()),
        }
    }
    Ok(())
}

fn report(summary: &BatchSummary) {
    log::info!(
        "{} found, {} written, {} skipped, {} failed",
        summary.found,
        summary.written,
        summary.skipped,
        summary.failed
    );
}

fn run(cli: Cli) -> Result<()> {
    let mut prompter = StdioPrompter {
        input: io::stdin().lock(),
        output: io::stdout().lock(),
    };

    match cli.command {
        Command::Titles {
            root,
            no_backup,
            layout,
        } => {
            let settings = TitleSettings {
                root,
                layout: layout.resolve()?,
                backup: !no_backup,
            };
            report(&run_titles(&settings, &mut prompter)?);
        }
        Command::Show { root, layout } => show_titles(&root, &layout.resolve()?)?,
        Command::Cfg { root, no_backup } => {
            let settings = CfgSettings {
                root,
                backup: !no_backup,
            };
            report(&run_cfg(&settings, &mut prompter)?);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    if let Err(err) = init_logging(level) {
        eprintln!("Failed to initialise logging: {err}");
    }

    if let Err(err) = run(cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
