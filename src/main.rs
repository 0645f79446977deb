use std::fs;
use std::io::{self, Read};

use anyhow::{Context, Result, bail};

use vee::output::{DisplaySink, FileSink, GridRenderer, OutputSink, StdoutSink};
use vee::vm::Vm;
use vee::{compiler, ir, lexer, parser};

/// Stand-in rasterizer for the character-grid device: draws each frame
/// as a framed block of text.
struct ConsoleRenderer;

impl GridRenderer for ConsoleRenderer {
    fn show(&mut self, rows: &[String]) {
        println!("+{}+", "-".repeat(rows.first().map_or(0, String::len)));
        for row in rows {
            println!("|{row}|");
        }
    }

    fn clear(&mut self) {}
}

fn usage() -> ! {
    eprintln!(
        "Usage: vee [--emit-ir] [--run-ir] [--device file|display] [--strict-labels] [file]"
    );
    std::process::exit(1);
}

fn main() -> Result<()> {
    env_logger::init();

    let mut emit_ir = false;
    let mut run_ir = false;
    let mut strict_labels = false;
    let mut device: Option<String> = None;
    let mut input_path: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--emit-ir" => emit_ir = true,
            "--run-ir" => run_ir = true,
            "--strict-labels" => strict_labels = true,
            "--device" | "-d" => {
                device = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("Missing device name after {arg}"))?,
                );
            }
            "--help" | "-h" => usage(),
            _ => {
                if input_path.is_some() {
                    bail!("Only one input file is supported");
                }
                input_path = Some(arg);
            }
        }
    }

    let source = if let Some(path) = &input_path {
        fs::read_to_string(path).with_context(|| format!("Reading {path}"))?
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Reading stdin")?;
        buffer
    };

    let ir_text = if run_ir {
        source
    } else {
        let tokens = lexer::tokenize(&source);
        let ast = parser::parse(tokens)?;
        compiler::compile(&ast)?
    };

    if emit_ir {
        println!("{ir_text}");
        return Ok(());
    }

    let sink: Box<dyn OutputSink> = match device.as_deref() {
        None => Box::new(StdoutSink),
        Some("file") => Box::new(FileSink::new("log.txt")),
        Some("display") => Box::new(DisplaySink::new(Box::new(ConsoleRenderer))),
        Some(other) => bail!("Unknown output device '{other}'"),
    };

    let program = ir::load(&ir_text);
    let mut vm = Vm::new(sink);
    vm.set_strict_labels(strict_labels);
    vm.run(&program)?;
    Ok(())
}
