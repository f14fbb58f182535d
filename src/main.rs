mod ast;
mod codegen;
mod config;
mod driver;
mod interp;
mod ir;
mod lexer;
#[cfg(feature = "llvm")]
mod llvm;
mod opt;
mod parser;

use std::fs;
use std::io::{self, IsTerminal};

use anyhow::{bail, Context as _};
use codegen::{Codegen, Execute};
use config::{BackendKind, Config};
use driver::{Driver, InputError, LineChars, Options};
use parser::Parser;

type Source = Box<dyn Iterator<Item = char>>;

const MODULE_NAME: &str = "kaleidoscope";

fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter().to_string()),
    )
    .init();

    let interactive = config.input.is_none() && io::stdin().is_terminal();
    let (source, input_error) = open_source(&config)?;

    if config.dump_tokens {
        let text: String = source.collect();
        let stdout = io::stdout();
        driver::dump_tokens(&text, &mut stdout.lock())?;
        let source = Box::new(text.chars().collect::<Vec<_>>().into_iter());
        return compile(&config, interactive, source, input_error);
    }

    compile(&config, interactive, source, input_error)
}

fn open_source(config: &Config) -> anyhow::Result<(Source, InputError)> {
    match &config.input {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read source file {}", path.display()))?;
            log::info!("compiling {}", path.display());
            let source: Source = Box::new(text.chars().collect::<Vec<_>>().into_iter());
            Ok((source, InputError::default()))
        }
        None => {
            let chars = LineChars::new(io::stdin().lock());
            let input_error = chars.error_slot();
            let source: Source = Box::new(chars);
            Ok((source, input_error))
        }
    }
}

fn compile(
    config: &Config,
    interactive: bool,
    source: Source,
    input_error: InputError,
) -> anyhow::Result<()> {
    match config.backend {
        BackendKind::Ir => {
            let backend = ir::Module::new(MODULE_NAME);
            run(config, interactive, source, input_error, backend)
        }
        #[cfg(feature = "llvm")]
        BackendKind::Llvm => {
            let context = inkwell::context::Context::create();
            let backend = llvm::LlvmBackend::new(&context, MODULE_NAME)?;
            run(config, interactive, source, input_error, backend)
        }
        #[cfg(not(feature = "llvm"))]
        BackendKind::Llvm => {
            bail!("this build does not include the llvm backend, rebuild with --features llvm")
        }
    }
}

fn run<B: Execute>(
    config: &Config,
    interactive: bool,
    source: Source,
    input_error: InputError,
    backend: B,
) -> anyhow::Result<()> {
    let options = Options {
        emit_ir: config.emit_ir,
        dump_ast: config.dump_ast,
        interactive,
    };
    let codegen = Codegen::new(backend).with_optimization(config.optimize);

    let stdout = io::stdout();
    let stderr = io::stderr();
    let parser = Parser::new(source);
    let mut driver = Driver::new(parser, codegen, options, stdout.lock(), stderr.lock())
        .watch_input(input_error.clone());
    let summary = driver.run()?;
    log::info!("{} units, {} errors", summary.units, summary.errors);

    match &config.input {
        Some(path) if summary.errors > 0 => {
            bail!("{} error(s) in {}", summary.errors, path.display())
        }
        None if input_error.borrow().is_some() => bail!("failed to read standard input"),
        _ => Ok(()),
    }
}
