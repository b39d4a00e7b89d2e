use std::{env, fs, path::Path, process};

use tmbdl::bytecode::disasm;
use tmbdl::{deserialize, Vm, VmOptions};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        return;
    }

    let command = args[1].as_str();
    let json = args.contains(&"--json".to_string());

    // first non-flag argument after the command is the filename
    let filename = args.iter().skip(2).find(|a| !a.starts_with('-'));

    match (command, filename) {
        ("run", Some(filename)) => {
            let chunk = load_chunk(filename);
            let mut vm = Vm::new(VmOptions {
                current_module_key: Some(filename.clone()),
                ..Default::default()
            });
            if let Err(e) = vm.run(chunk) {
                eprintln!("{}", e);
                process::exit(70);
            }
        }
        ("dis", Some(filename)) => {
            let chunk = load_chunk(filename);
            if json {
                let listing = disasm::disassemble_to_json(&chunk, "<main>");
                match serde_json::to_string_pretty(&listing) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("Failed to render listing: {}", e);
                        process::exit(1);
                    }
                }
            } else {
                print!("{}", disasm::disassemble_to_string(&chunk, "<main>"));
            }
        }
        _ => {
            print_usage();
            process::exit(64);
        }
    }
}

fn load_chunk(filename: &str) -> tmbdl::Chunk {
    ensure_extension(filename);
    let bytes = match fs::read(filename) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", filename, e);
            process::exit(66);
        }
    };
    match deserialize(&bytes) {
        Ok(chunk) => chunk,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(65);
        }
    }
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("tmbdlc") {
        eprintln!("Error: expected a .tmbdlc file, got {}", filename);
        process::exit(64);
    }
}

fn print_usage() {
    println!("TMBDL - bytecode runner");
    println!();
    println!("Usage:");
    println!("  tmbdl run <file.tmbdlc>           Execute a compiled program");
    println!("  tmbdl dis <file.tmbdlc>           Disassemble a compiled program");
    println!("  tmbdl dis --json <file.tmbdlc>    Disassemble as JSON");
    println!("  tmbdl --help, -h                  Show this help");
}
