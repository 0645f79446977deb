use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};

use crate::output::CaptureSink;
use crate::vm::Vm;
use crate::{compiler, ir, lexer, parser};

fn normalize_output(output: &str) -> String {
    output.replace("\r\n", "\n").trim_end().to_string()
}

/// Full pipeline: source text -> tokens -> AST -> instruction text ->
/// loaded program -> execution, with the print stream captured.
fn run_pipeline(source: &str) -> Result<String> {
    let tokens = lexer::tokenize(source);
    let ast = parser::parse(tokens)?;
    let text = compiler::compile(&ast)?;
    let program = ir::load(&text);
    let (sink, buffer) = CaptureSink::new();
    let mut vm = Vm::new(Box::new(sink));
    vm.run(&program)?;
    let output = buffer.borrow().clone();
    Ok(output)
}

#[test]
fn runs_fixture_programs() -> Result<()> {
    let programs_dir = Path::new("tests/programs");
    let mut programs = Vec::new();

    for entry in
        fs::read_dir(programs_dir).with_context(|| format!("Reading {}", programs_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("vee") {
            programs.push(path);
        }
    }

    ensure!(
        !programs.is_empty(),
        "No .vee programs found in {}",
        programs_dir.display()
    );
    programs.sort();

    for path in programs {
        let source =
            fs::read_to_string(&path).with_context(|| format!("Reading {}", path.display()))?;

        let expected_error_path = path.with_extension("err");
        if expected_error_path.exists() {
            let expected_error = fs::read_to_string(&expected_error_path)
                .with_context(|| format!("Reading {}", expected_error_path.display()))?;
            let expected_error = expected_error.trim();
            match run_pipeline(&source) {
                Ok(_) => bail!("Expected an error for {}", path.display()),
                Err(err) => {
                    let error = err.to_string();
                    ensure!(
                        error.contains(expected_error),
                        "Expected error containing '{expected_error}', got '{error}' for {}",
                        path.display()
                    );
                }
            }
            continue;
        }

        let expected_path = path.with_extension("out");
        let expected = fs::read_to_string(&expected_path)
            .with_context(|| format!("Reading {}", expected_path.display()))?;
        let output = run_pipeline(&source)
            .with_context(|| format!("Running {}", path.display()))?;
        assert_eq!(
            normalize_output(&output),
            normalize_output(&expected),
            "Output mismatch for {}",
            path.display()
        );
    }

    Ok(())
}

#[test]
fn emitted_instruction_text_round_trips_through_the_loader() -> Result<()> {
    let source = fs::read_to_string("tests/programs/fib.vee").context("Reading fib fixture")?;
    let tokens = lexer::tokenize(&source);
    let ast = parser::parse(tokens)?;
    let text = compiler::compile(&ast)?;
    let program = ir::load(&text);

    // Every non-blank emitted line must have loaded as an instruction,
    // a label, or a comment no-op; the function table must know `fib`.
    assert_eq!(text.lines().count(), program.lines.len());
    assert!(program.funcs.contains_key("fib"));
    Ok(())
}
