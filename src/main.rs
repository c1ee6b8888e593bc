mod highlighter;

use clap::Parser as ClapParser;
use highlighter::ForgeHelper;
use lisp_forge::compiler::funcdef::FuncDef;
use lisp_forge::compiler::{compile, specials};
use lisp_forge::config::{VERSION, WELCOME_MESSAGE, WELCOME_SUBTITLE};
use lisp_forge::env::Environment;
use lisp_forge::parser::{Parser, Status};
use lisp_forge::vm::NativeEngine;
use rustyline::error::ReadlineError;
use rustyline::{Config, Editor};
use serde::Serialize;
use std::path::PathBuf;

/// Streaming Lisp reader and bytecode compiler
#[derive(ClapParser, Debug)]
#[command(name = "lisp-forge")]
#[command(version = VERSION)]
#[command(about = "Compile Lisp source to bytecode listings")]
#[command(long_about = "Reads source with a resumable streaming parser and \
compiles each top-level form to a register-machine function definition. \
With no file argument, starts an interactive session.")]
struct CliArgs {
    /// Source file to compile (optional - if not provided, starts the REPL)
    #[arg(value_name = "FILE")]
    script: Option<PathBuf>,

    /// Emit listings as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Start from an empty environment instead of the core natives
    #[arg(long = "no-core")]
    no_core: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut env = if args.no_core {
        Environment::new()
    } else {
        Environment::core()
    };
    let mut engine = NativeEngine::new();

    if let Some(script_path) = args.script {
        return compile_file(&script_path, &mut env, &mut engine, args.json);
    }

    repl(&mut env, &mut engine, args.json)
}

/// A machine-readable rendering of a function definition, mirroring the
/// text listing.
#[derive(Serialize)]
struct Listing {
    name: Option<String>,
    source: Option<String>,
    arity: i32,
    vararg: bool,
    slotcount: i32,
    needs_env: bool,
    bytecode: Vec<String>,
    constants: Vec<String>,
    environments: Vec<i32>,
    defs: Vec<Listing>,
}

impl Listing {
    fn from_def(def: &FuncDef) -> Listing {
        Listing {
            name: def.name.as_ref().map(|n| n.to_string()),
            source: def.source.as_ref().map(|s| s.to_string()),
            arity: def.arity,
            vararg: def.is_vararg(),
            slotcount: def.slotcount,
            needs_env: def.needs_env(),
            bytecode: def.disassemble(),
            constants: def.constants.iter().map(|c| format!("{}", c)).collect(),
            environments: def.environments.clone(),
            defs: def.defs.iter().map(|d| Listing::from_def(d)).collect(),
        }
    }
}

fn print_listing(def: &FuncDef, indent: usize) {
    let pad = "  ".repeat(indent);
    let name = def.name.as_deref().unwrap_or("<anonymous>");
    println!(
        "{}function {} (arity {}{}, slots {}{})",
        pad,
        name,
        def.arity,
        if def.is_vararg() { "+" } else { "" },
        def.slotcount,
        if def.needs_env() { ", captures" } else { "" },
    );
    for line in def.disassemble() {
        println!("{}  {}", pad, line);
    }
    if !def.constants.is_empty() {
        println!("{}  constants:", pad);
        for (i, constant) in def.constants.iter().enumerate() {
            println!("{}    {}: {}", pad, i, constant);
        }
    }
    if !def.environments.is_empty() {
        println!("{}  environments: {:?}", pad, def.environments);
    }
    for sub in &def.defs {
        print_listing(sub, indent + 1);
    }
}

fn emit_def(def: &FuncDef, json: bool) {
    if json {
        match serde_json::to_string_pretty(&Listing::from_def(def)) {
            Ok(text) => println!("{}", text),
            Err(err) => eprintln!("Error: cannot serialize listing: {}", err),
        }
    } else {
        print_listing(def, 0);
    }
}

/// Compile every top-level form in a file, streaming the bytes through the
/// parser.
fn compile_file(
    path: &PathBuf,
    env: &mut Environment,
    engine: &mut NativeEngine,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read(path)
        .map_err(|e| format!("Cannot read source file {}: {}", path.display(), e))?;
    let source_name = path.display().to_string();

    let mut parser = Parser::new();
    let feed = |parser: &mut Parser, byte: Option<u8>| -> Result<(), String> {
        match byte {
            Some(b) => parser.consume(b).map_err(|e| e.to_string())?,
            None => parser.eof().map_err(|e| e.to_string())?,
        }
        if parser.status() == Status::Error {
            let (line, column) = parser.position();
            let message = parser.error().unwrap_or("unknown parse error");
            return Err(format!(
                "{}:{}:{}: {}",
                source_name, line, column, message
            ));
        }
        Ok(())
    };

    let emit_pending = |parser: &mut Parser,
                        env: &mut Environment,
                        engine: &mut NativeEngine|
     -> Result<(), String> {
        while let Some(value) = parser.produce() {
            match compile(&value, env, engine, Some(&source_name)) {
                Ok(def) => emit_def(&def, json),
                Err(err) => {
                    return Err(format!(
                        "{}:{}:{}: {}",
                        source_name, err.line, err.column, err.message
                    ));
                }
            }
        }
        Ok(())
    };

    for &byte in &contents {
        feed(&mut parser, Some(byte))?;
        emit_pending(&mut parser, env, engine)?;
    }
    feed(&mut parser, None)?;
    emit_pending(&mut parser, env, engine)?;
    Ok(())
}

/// Interactive session. The streaming parser persists across lines, so an
/// open form keeps reading; the continuation prompt shows the open
/// delimiters. Each line is fed against a checkpoint clone, so a line that
/// fails to parse rolls back instead of poisoning accumulated state.
fn repl(
    env: &mut Environment,
    engine: &mut NativeEngine,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::builder().auto_add_history(true).build();
    let mut rl =
        Editor::with_config(config).map_err(|e| format!("Failed to initialize REPL: {}", e))?;
    rl.set_helper(Some(ForgeHelper::new()));

    let history_file = ".forge_history";
    let _ = rl.load_history(history_file);

    println!("{}", WELCOME_MESSAGE);
    println!("{}", WELCOME_SUBTITLE);
    println!("Special forms: {}", special_form_summary());
    println!("Type (quit) to exit.");

    let mut parser = Parser::new();

    loop {
        let open = parser.delimiters();
        let prompt = if open.is_empty() {
            "forge> ".to_string()
        } else {
            format!("{:>5}> ", open)
        };

        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match line.trim() {
                    "(quit)" | "(exit)" => {
                        println!("Goodbye!");
                        break;
                    }
                    "(clear)" => {
                        print!("\x1B[2J\x1B[H");
                        continue;
                    }
                    _ => {}
                }

                let checkpoint = parser.clone();
                let mut failed = false;
                for &byte in line.as_bytes() {
                    if parser.consume(byte).is_err() {
                        break;
                    }
                    if parser.status() == Status::Error {
                        report_parse_error(&mut parser);
                        failed = true;
                        break;
                    }
                }
                if !failed {
                    // Lines end in a newline the editor stripped.
                    let _ = parser.consume(b'\n');
                    if parser.status() == Status::Error {
                        report_parse_error(&mut parser);
                        failed = true;
                    }
                }
                if failed {
                    parser = checkpoint;
                    continue;
                }

                while let Some(value) = parser.produce() {
                    match compile(&value, env, engine, Some("repl")) {
                        Ok(def) => emit_def(&def, json),
                        Err(err) => {
                            eprintln!(
                                "Compile error: {} (line {}, column {})",
                                err.message, err.line, err.column
                            );
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(history_file);
    Ok(())
}

fn report_parse_error(parser: &mut Parser) {
    let (line, column) = parser.position();
    let message = parser.error().unwrap_or("unknown parse error");
    eprintln!("Parse error: {} (line {}, column {})", message, line, column);
}

fn special_form_summary() -> String {
    let mut names: Vec<&str> = specials::names().collect();
    names.sort_unstable();
    names.join(" ")
}
