//! tm-highlight - tokenize text with a TextMate grammar
//!
//! Prints one line per token: `line:start-end scope...`, followed by the
//! foreground color when a theme is in use.

use std::env;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tm_highlight::error::{Error, Result};
use tm_highlight::{Config, Registry, StateStack, Theme};

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    grammar: PathBuf,
    input: Option<PathBuf>,
    theme: Option<PathBuf>,
    config: Option<PathBuf>,
    grammar_dir: Option<PathBuf>,
}

enum Command {
    Run(Options),
    Help,
    Version,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut options = Options::default();
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .map(PathBuf::from)
                .ok_or_else(|| Error::Message(format!("{} needs a value", name)))
        };
        match arg.as_str() {
            "--help" | "-h" => return Ok(Command::Help),
            "--version" | "-V" => return Ok(Command::Version),
            "--theme" => options.theme = Some(value("--theme")?),
            "--config" => options.config = Some(value("--config")?),
            "--grammar-dir" => options.grammar_dir = Some(value("--grammar-dir")?),
            flag if flag.starts_with("--") => {
                return Err(Error::Message(format!("unknown option {}", flag)));
            }
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    options.grammar = positional
        .next()
        .ok_or_else(|| Error::Message("missing grammar file, see --help".to_string()))?;
    options.input = positional.next();
    if let Some(extra) = positional.next() {
        return Err(Error::Message(format!("unexpected argument {}", extra.display())));
    }
    Ok(Command::Run(options))
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args)? {
        Command::Run(options) => options,
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Version => {
            print_version();
            return Ok(());
        }
    };

    let config = match &options.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let registry = Registry::new();
    if let Some(dir) = &options.grammar_dir {
        registry.load_grammar_dir(dir)?;
    }
    let scope = registry.load_grammar_file(&options.grammar)?;

    let theme = match options.theme.as_ref().or(config.theme.path.as_ref()) {
        Some(path) => Some(Arc::new(Theme::load(path)?)),
        None => None,
    };
    registry.set_theme(theme.clone());
    let grammar = registry.grammar(&scope)?;
    info!(scope = %scope, "grammar loaded");

    let text = match &options.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut state: Option<StateStack> = None;
    for (index, line) in text.lines().enumerate() {
        let result = grammar.tokenize_line(line, state.as_ref(), config.tokenizer.time_budget());
        if result.stopped_early {
            warn!(line = index + 1, "time budget exhausted, rest of line left unscoped");
        }
        for token in &result.tokens {
            write!(out, "{}:{}-{} {}", index + 1, token.start, token.end, token.scopes.join(" "))?;
            if let Some(theme) = &theme {
                if let Some(color) = theme.token_style(token).foreground.and_then(|id| theme.color(id)) {
                    write!(out, " {}", color)?;
                }
            }
            writeln!(out)?;
        }
        state = Some(result.state);
    }
    out.flush()?;
    Ok(())
}

fn print_usage() {
    println!("tm-highlight {} - TextMate grammar tokenizer", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: tm-highlight [OPTIONS] <GRAMMAR> [FILE]");
    println!();
    println!("Tokenizes FILE (or standard input) with the JSON grammar GRAMMAR.");
    println!();
    println!("Options:");
    println!("  --theme PATH        JSON or CSS theme, overrides the config file");
    println!("  --config PATH       Config file (default ~/.tm-highlight.toml)");
    println!("  --grammar-dir DIR   Load every .json grammar in DIR for includes");
    println!("  -h, --help          Show this help message");
    println!("  -V, --version       Show version information");
    println!();
    println!("Set RUST_LOG (e.g. RUST_LOG=debug) for diagnostics on stderr.");
}

fn print_version() {
    println!("tm-highlight {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let Command::Run(options) = parse_args(&args(&["g.json", "in.txt", "--theme", "t.css"])).unwrap() else {
            panic!("expected run");
        };
        assert_eq!(
            options,
            Options {
                grammar: PathBuf::from("g.json"),
                input: Some(PathBuf::from("in.txt")),
                theme: Some(PathBuf::from("t.css")),
                ..Options::default()
            }
        );
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(matches!(parse_args(&args(&["--version"])), Ok(Command::Version)));
        assert!(matches!(parse_args(&args(&["g.json", "--help"])), Ok(Command::Help)));
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["g.json", "--theme"])).is_err());
        assert!(parse_args(&args(&["g.json", "--bogus"])).is_err());
        assert!(parse_args(&args(&["a", "b", "c"])).is_err());
    }
}
