mod ast;
mod config;
mod db;
mod env;
mod error;
mod eval;
mod io;
mod lexer;
mod methods;
mod module;
mod parser;
mod pln;
mod query;
mod security;
mod subprocess;
mod tag;
mod token;
mod value;

use clap::Parser;
use config::EngineConfig;
use env::Environment;
use error::ErrorClass;
use eval::Evaluator;
use security::{SecurityConfig, SecurityPolicy};
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use value::Value;

/// Parsley: a dynamically-typed scripting language for HTML templating,
/// data pipelines, and sandboxed system access.
#[derive(Parser, Debug)]
#[command(name = "parsley")]
#[command(version = config::VERSION)]
#[command(about = "A dynamically-typed scripting language for HTML templating and data pipelines")]
struct CliArgs {
    /// Script file to execute (omit to start the REPL)
    #[arg(value_name = "FILE")]
    script: Option<PathBuf>,

    /// Arguments bound to `@args` inside the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Evaluate an inline expression instead of a file
    #[arg(short = 'e', value_name = "CODE")]
    eval_code: Option<String>,

    /// Parse only; exit 0 on success, 1 on parse error
    #[arg(long = "check")]
    check: bool,

    /// Pretty-print the result value
    #[arg(short = 'p', long = "pp")]
    pretty_print: bool,

    /// Deny all filesystem writes
    #[arg(long = "no-write")]
    no_write: bool,

    /// Deny subprocess execution
    #[arg(long = "no-exec")]
    no_exec: bool,

    /// Deny all filesystem reads except explicitly allowed paths
    #[arg(long = "restrict-read")]
    restrict_read: bool,

    /// Enable network I/O (disabled by default)
    #[arg(long = "allow-net")]
    allow_net: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let security = build_security(&args);
    let engine_config = EngineConfig::default();
    let _ = &engine_config;

    let env = Environment::with_server(Rc::new(env::ServerContext {
        security: Some(Rc::new(security)),
        ..Default::default()
    }));
    bind_args(&env, &args.args);

    if let Some(code) = &args.eval_code {
        return run_source(code, None, &env, args.check, args.pretty_print);
    }

    match &args.script {
        Some(path) => {
            let source = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("io error: cannot read {}: {e}", path.display());
                    return ExitCode::from(3);
                }
            };
            env.set_filename(path.to_string_lossy().to_string());
            run_source(&source, Some(path.as_path()), &env, args.check, args.pretty_print)
        }
        None => run_repl(&env),
    }
}

fn bind_args(env: &Rc<Environment>, raw_args: &[String]) {
    let items = raw_args.iter().map(|s| Value::String(s.clone())).collect();
    env.define("args", Value::array(items));
}

fn build_security(args: &CliArgs) -> SecurityPolicy {
    let mut cfg = SecurityConfig::default();
    if args.restrict_read {
        cfg.restrict_read();
    }
    if args.no_write {
        cfg.deny_write();
    }
    if args.no_exec {
        cfg.deny_execute();
    }
    if args.allow_net {
        cfg.enable_net(vec![]);
    }
    SecurityPolicy::from_config(&cfg)
}

fn run_source(
    source: &str,
    path: Option<&std::path::Path>,
    env: &Rc<Environment>,
    check_only: bool,
    pretty: bool,
) -> ExitCode {
    let label = path.map(|p| p.display().to_string()).unwrap_or_else(|| "<eval>".to_string());

    let program = match parser::parse_source(source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{label}: {e}");
            return ExitCode::from(1);
        }
    };

    if check_only {
        return ExitCode::SUCCESS;
    }

    let mut evaluator = Evaluator::new(env.clone());
    match evaluator.run_program(&program) {
        Ok(result) => {
            if pretty {
                println!("{}", pln::write(&result));
            } else {
                println!("{result}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{label}: {e}");
            ExitCode::from(exit_code_for(e.class))
        }
    }
}

fn exit_code_for(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Security => 2,
        ErrorClass::Io | ErrorClass::Network | ErrorClass::Database => 3,
        _ => 1,
    }
}

fn run_repl(env: &Rc<Environment>) -> ExitCode {
    use rustyline::error::ReadlineError;
    use rustyline::{Config, DefaultEditor};

    println!("{} {}", config::WELCOME_MESSAGE, config::VERSION);
    println!("{}", config::WELCOME_SUBTITLE);

    let rl_config = Config::builder().auto_add_history(true).build();
    let mut rl = match DefaultEditor::with_config(rl_config) {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("failed to initialize REPL: {e}");
            return ExitCode::from(1);
        }
    };

    let history_file = ".parsley_history";
    let _ = rl.load_history(history_file);

    let mut evaluator = Evaluator::new(env.clone());
    loop {
        match rl.readline("parsley> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ":quit" || trimmed == ":exit" {
                    break;
                }
                if trimmed == ":help" {
                    println!("{}", config::HELP_TEXT);
                    continue;
                }
                match parser::parse_source(trimmed) {
                    Ok(node) => match evaluator.run_program(&node) {
                        Ok(result) => println!("=> {result}"),
                        Err(e) => eprintln!("Error: {e}"),
                    },
                    Err(e) => eprintln!("Parse error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {e}");
                break;
            }
        }
    }
    let _ = rl.save_history(history_file);
    ExitCode::SUCCESS
}
