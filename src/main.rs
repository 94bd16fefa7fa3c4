//! EightBall - interpreter, bytecode compiler and VM front end

use std::env;
use std::fs;
use std::io::{self, Write};
use std::process;

use eightball::disasm;
use eightball::engine::{EditMode, Engine, ReplStatus};
use eightball::vm::Vm;

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut input_file = None;
    let mut output_file = None;
    let mut compile = false;
    let mut execute = false;
    let mut disassemble = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--compile" => compile = true,
            "-x" | "--execute" => execute = true,
            "-d" | "--disasm" => disassemble = true,
            "-o" => {
                i += 1;
                if i < args.len() {
                    output_file = Some(args[i].clone());
                }
            }
            "-h" | "--help" => {
                usage();
                return;
            }
            _ => {
                if args[i].starts_with('-') {
                    eprintln!("Unknown option: {}", args[i]);
                    usage();
                    process::exit(1);
                }
                input_file = Some(args[i].clone());
            }
        }
        i += 1;
    }

    if execute {
        run_bytecode(&require_input(input_file));
    } else if disassemble {
        disasm_file(&require_input(input_file));
    } else if compile {
        compile_file(&require_input(input_file), output_file.as_deref());
    } else if let Some(file) = input_file {
        run_source(&file);
    } else {
        repl();
    }
}

fn usage() {
    eprintln!("Usage: eightball [options] [file.8b]");
    eprintln!("  (no arguments)   interactive interpreter");
    eprintln!("  file.8b          load the source file and run it");
    eprintln!("Options:");
    eprintln!("  -c, --compile    compile file.8b to bytecode");
    eprintln!("  -o <file>        bytecode output path (default: bytecode)");
    eprintln!("  -x, --execute    run a bytecode file on the VM");
    eprintln!("  -d, --disasm     disassemble a bytecode file");
}

fn require_input(input_file: Option<String>) -> String {
    input_file.unwrap_or_else(|| {
        eprintln!("No input file specified");
        process::exit(1);
    })
}

/// The interactive prompt with the line editor.
fn repl() {
    println!("      ***    EightBall v0.5    ***");
    println!("The Eight Bit Algorithmic Language");
    println!();

    let mut engine = Engine::new(io::stdout());
    let stdin = io::stdin();
    loop {
        if engine.edit != EditMode::Off {
            print!(">");
            let _ = io::stdout().flush();
        }
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }

        if engine.edit != EditMode::Off {
            if line == "." {
                engine.end_edit();
            } else {
                engine.edit_line(&line);
            }
            continue;
        }

        match engine.exec_line(&line) {
            ReplStatus::Ok => println!(),
            ReplStatus::Err => println!(" err"),
            ReplStatus::Break => println!("Brk"),
            ReplStatus::Quit => break,
        }
    }
}

fn run_source(path: &str) {
    let mut engine = Engine::new(io::stdout());
    if engine.program.load(path).is_err() {
        eprintln!("Error reading {}", path);
        process::exit(1);
    }
    match engine.exec_line("run") {
        ReplStatus::Ok | ReplStatus::Quit => {}
        _ => process::exit(1),
    }
}

fn compile_file(path: &str, output: Option<&str>) {
    let mut engine = Engine::new(io::stdout());
    if engine.program.load(path).is_err() {
        eprintln!("Error reading {}", path);
        process::exit(1);
    }
    match engine.compile_program() {
        Ok(image) => {
            let out_path = output.unwrap_or("bytecode");
            if let Err(e) = fs::write(out_path, &image) {
                eprintln!("Error writing {}: {}", out_path, e);
                process::exit(1);
            }
            println!("Compiled: {} bytes of bytecode to {}", image.len(), out_path);
        }
        Err(e) => {
            eprintln!("?{}", e);
            process::exit(1);
        }
    }
}

fn run_bytecode(path: &str) {
    let file = fs::File::open(path).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", path, e);
        process::exit(1);
    });
    let mut vm = Vm::new(io::stdout());
    if let Err(e) = vm.load(file) {
        eprintln!("Error loading {}: {}", path, e);
        process::exit(1);
    }
    if let Err(e) = vm.run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn disasm_file(path: &str) {
    let image = fs::read(path).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", path, e);
        process::exit(1);
    });
    let stdout = io::stdout();
    let _ = disasm::disassemble(&image, &mut stdout.lock());
}
