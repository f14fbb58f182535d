use std::path::PathBuf;

use anyhow::bail;
use clap::{App, Arg, ArgMatches};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ir,
    Llvm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Source file; `None` reads standard input.
    pub input: Option<PathBuf>,
    pub backend: BackendKind,
    pub emit_ir: bool,
    pub dump_ast: bool,
    pub dump_tokens: bool,
    pub optimize: bool,
    pub verbosity: u64,
}

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("kaleidoscope")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("INPUT")
                .help("source file to compile, defaults to standard input")
                .index(1),
        )
        .arg(
            Arg::with_name("backend")
                .long("backend")
                .takes_value(true)
                .possible_values(&["ir", "llvm"])
                .default_value("ir")
                .help("code generation backend"),
        )
        .arg(
            Arg::with_name("emit-ir")
                .long("emit-ir")
                .help("print the IR of every compiled function and of the final module"),
        )
        .arg(
            Arg::with_name("dump-ast")
                .long("dump-ast")
                .help("print each parsed unit"),
        )
        .arg(
            Arg::with_name("dump-tokens")
                .long("dump-tokens")
                .help("print the token stream before compiling"),
        )
        .arg(
            Arg::with_name("no-opt")
                .long("no-opt")
                .help("skip the per-function optimization pass"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("raise log verbosity, may be repeated"),
        )
}

impl Config {
    pub fn from_args() -> anyhow::Result<Config> {
        Config::from_matches(&app().get_matches())
    }

    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Config> {
        let backend = match matches.value_of("backend") {
            Some("ir") | None => BackendKind::Ir,
            Some("llvm") => BackendKind::Llvm,
            Some(other) => bail!("unknown backend {}", other),
        };

        Ok(Config {
            input: matches.value_of("INPUT").map(PathBuf::from),
            backend,
            emit_ir: matches.is_present("emit-ir"),
            dump_ast: matches.is_present("dump-ast"),
            dump_tokens: matches.is_present("dump-tokens"),
            optimize: !matches.is_present("no-opt"),
            verbosity: matches.occurrences_of("verbose"),
        })
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
