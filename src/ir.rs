use log::warn;
use rustc_hash::FxHashMap;

/// A loaded instruction program: one token list per source line (the
/// line index is the program counter), plus the label and function
/// tables resolved in the same pass. Programs are immutable once loaded.
#[derive(Debug, Default)]
pub struct Program {
    pub lines: Vec<Vec<String>>,
    pub labels: LabelTable,
    pub funcs: FxHashMap<String, usize>,
}

/// Labels are two-level: one global scope, plus one scope per function
/// for labels declared between its `def` and `end` markers. A label is
/// only visible from its defining scope.
#[derive(Debug, Default)]
pub struct LabelTable {
    global: FxHashMap<String, usize>,
    function: FxHashMap<String, FxHashMap<String, usize>>,
}

impl LabelTable {
    /// Resolve `name` in the given scope; `None` scope means global.
    pub fn lookup(&self, scope: Option<&str>, name: &str) -> Option<usize> {
        match scope {
            Some(func) => self.function.get(func)?.get(name).copied(),
            None => self.global.get(name).copied(),
        }
    }

    fn define(&mut self, scope: Option<&str>, name: String, pc: usize) {
        match scope {
            Some(func) => {
                self.function.entry(func.to_string()).or_default().insert(name, pc);
            }
            None => {
                self.global.insert(name, pc);
            }
        }
    }
}

/// Parse instruction-program text. Loading never fails: malformed
/// instructions surface when (and if) the VM reaches them.
pub fn load(text: &str) -> Program {
    let mut program = Program::default();
    let mut current_func: Option<String> = None;

    for (pc, raw) in text.split('\n').enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('/') {
            program.lines.push(Vec::new());
            continue;
        }

        if let Some(rest) = line.strip_prefix('#') {
            let name = rest.split_whitespace().next().unwrap_or("");
            if !name.is_empty() {
                program
                    .labels
                    .define(current_func.as_deref(), name.to_string(), pc);
            }
        } else if let Some(rest) = line.strip_prefix("def ") {
            if let Some(name) = rest.split_whitespace().next() {
                // Entry point is the first instruction after the marker.
                program.funcs.insert(name.to_string(), pc + 1);
                program.labels.function.entry(name.to_string()).or_default();
                current_func = Some(name.to_string());
            }
        } else if line == "end" {
            // No nested function definitions.
            current_func = None;
        }

        program.lines.push(tokenize_line(line));
    }
    program
}

/// Split one instruction line into operand tokens. String operands keep
/// their surrounding quotes (that is how the VM recognizes them) with
/// the escape sequences already decoded; an unquoted `/` starts a
/// trailing comment.
fn tokenize_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                current.push('\'');
                let mut terminated = false;
                while let Some(inner) = chars.next() {
                    if inner == '\'' {
                        terminated = true;
                        break;
                    }
                    if inner == '\\' {
                        match chars.next() {
                            Some('b') => current.push('\u{8}'),
                            Some('n') => current.push('\n'),
                            Some('t') => current.push('\t'),
                            Some('\'') => current.push('\''),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => break,
                        }
                    } else {
                        current.push(inner);
                    }
                }
                if !terminated {
                    warn!("unterminated string in instruction line '{line}'");
                }
                current.push('\'');
                tokens.push(std::mem::take(&mut current));
            }
            '/' => break,
            ' ' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn blank_and_comment_lines_load_as_noops() {
        let program = load("let x 1\n\n/ a comment\nlet y 2");
        assert_eq!(program.lines.len(), 4);
        assert!(program.lines[1].is_empty());
        assert!(program.lines[2].is_empty());
        assert_eq!(program.lines[3], vec!["let", "y", "2"]);
    }

    #[test]
    fn indentation_is_cosmetic() {
        let program = load("   let x 1");
        assert_eq!(program.lines[0], vec!["let", "x", "1"]);
    }

    #[test]
    fn labels_are_scoped_to_their_function() {
        let text = indoc! {"
            #top
            def greet
             #inner
             prt 'hi'
            end
            #bottom
        "};
        let program = load(text);
        assert_eq!(program.labels.lookup(None, "top"), Some(0));
        assert_eq!(program.labels.lookup(None, "bottom"), Some(5));
        assert_eq!(program.labels.lookup(Some("greet"), "inner"), Some(2));
        // Scopes do not leak into each other.
        assert_eq!(program.labels.lookup(None, "inner"), None);
        assert_eq!(program.labels.lookup(Some("greet"), "top"), None);
    }

    #[test]
    fn function_entry_is_the_line_after_its_marker() {
        let program = load("jmp skip\ndef add\n add ret $0 $1\nend\n#skip");
        assert_eq!(program.funcs.get("add"), Some(&2));
    }

    #[test]
    fn string_operands_keep_quotes_and_decode_escapes() {
        let program = load(r"prt 'a\tb' 'c\nd'");
        assert_eq!(program.lines[0], vec!["prt", "'a\tb'", "'c\nd'"]);
    }

    #[test]
    fn escaped_quote_stays_inside_the_operand() {
        let program = load(r"let s 'it\'s'");
        assert_eq!(program.lines[0], vec!["let", "s", "'it's'"]);
    }

    #[test]
    fn unquoted_slash_truncates_the_line() {
        let program = load("let x 1 / trailing note");
        assert_eq!(program.lines[0], vec!["let", "x", "1"]);
    }

    #[test]
    fn spaces_inside_strings_do_not_split_tokens() {
        let program = load("prt 'hello world'");
        assert_eq!(program.lines[0], vec!["prt", "'hello world'"]);
    }
}
