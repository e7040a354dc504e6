//! Stratafile parser
//!
//! Line oriented: blank lines and `#` comments are skipped, a trailing `\`
//! joins the next line, keywords are case-insensitive. RUN and CMD accept a
//! shell form (run through `/bin/sh -c`) and a JSON exec form.

use crate::base::BaseRef;
use crate::descriptor::{Instruction, SHELL};
use crate::error::{StrataError, StrataResult};

/// A logical line and the physical line it starts on
struct LogicalLine {
    number: usize,
    text: String,
}

pub(super) fn parse(content: &str) -> StrataResult<Vec<Instruction>> {
    let mut instructions = Vec::new();
    for line in join_continuation_lines(content) {
        let trimmed = line.text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        instructions.push(parse_instruction(trimmed, line.number)?);
    }
    Ok(instructions)
}

fn join_continuation_lines(content: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        // Comment lines inside a continuation are dropped
        if !current.is_empty() && line.trim_start().starts_with('#') {
            continue;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                lines.push(LogicalLine {
                    number: start,
                    text: std::mem::take(&mut current),
                });
            }
        }
    }

    if !current.trim().is_empty() {
        lines.push(LogicalLine {
            number: start,
            text: current,
        });
    }

    lines
}

fn parse_instruction(line: &str, line_num: usize) -> StrataResult<Instruction> {
    let (keyword, rest) = split_first_word(line);

    match keyword.to_ascii_uppercase().as_str() {
        "FROM" => parse_from(rest, line_num),
        "WORKDIR" => parse_workdir(rest, line_num),
        "COPY" => parse_copy(rest, line_num),
        "RUN" => parse_command(rest, "RUN", line_num).map(Instruction::RunCommand),
        "CMD" => parse_command(rest, "CMD", line_num).map(Instruction::SetDefaultCommand),
        _ => Err(StrataError::UnknownInstruction {
            line: line_num,
            keyword: keyword.to_string(),
        }),
    }
}

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn parse_error(line: usize, reason: impl Into<String>) -> StrataError {
    StrataError::DescriptorParse {
        line,
        reason: reason.into(),
    }
}

fn parse_from(rest: &str, line_num: usize) -> StrataResult<Instruction> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [] => Err(parse_error(line_num, "FROM requires a base reference")),
        [reference] => BaseRef::parse(reference)
            .map(Instruction::SetBase)
            .map_err(|e| parse_error(line_num, e.to_string())),
        [_, alias, ..] if alias.eq_ignore_ascii_case("AS") => Err(parse_error(
            line_num,
            "named stages are not supported",
        )),
        _ => Err(parse_error(line_num, "FROM takes exactly one reference")),
    }
}

fn parse_workdir(rest: &str, line_num: usize) -> StrataResult<Instruction> {
    let path = rest.trim();
    if path.is_empty() {
        return Err(parse_error(line_num, "WORKDIR requires a path"));
    }
    if path.contains('\0') {
        return Err(parse_error(line_num, "WORKDIR path contains a NUL byte"));
    }
    Ok(Instruction::SetWorkingDirectory(path.to_string()))
}

fn parse_copy(rest: &str, line_num: usize) -> StrataResult<Instruction> {
    if rest.starts_with("--") {
        let (flag, _) = split_first_word(rest);
        return Err(parse_error(
            line_num,
            format!("COPY flag '{}' is not supported", flag),
        ));
    }

    let mut parts = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?
    } else {
        rest.split_whitespace().map(str::to_string).collect()
    };

    if parts.len() < 2 {
        return Err(parse_error(
            line_num,
            "COPY requires at least one source and a destination",
        ));
    }

    let dest = parts.pop().unwrap_or_default();
    Ok(Instruction::CopySubset {
        sources: parts,
        dest,
    })
}

fn parse_command(rest: &str, keyword: &str, line_num: usize) -> StrataResult<Vec<String>> {
    if rest.is_empty() {
        return Err(parse_error(line_num, format!("{} requires a command", keyword)));
    }

    if rest.starts_with('[') {
        let argv = parse_json_array(rest, line_num)?;
        if argv.is_empty() {
            return Err(parse_error(
                line_num,
                format!("{} exec form must not be empty", keyword),
            ));
        }
        return Ok(argv);
    }

    Ok(vec![
        SHELL[0].to_string(),
        SHELL[1].to_string(),
        rest.to_string(),
    ])
}

fn parse_json_array(s: &str, line_num: usize) -> StrataResult<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| parse_error(line_num, format!("invalid JSON array '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_join_continuation_keeps_start_line() {
        let lines = join_continuation_lines("FROM base\nRUN apt-get update && \\\n    make\nCMD x");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].number, 2);
        assert_eq!(lines[1].text, "RUN apt-get update &&     make");
        assert_eq!(lines[2].number, 4);
    }

    #[test]
    fn test_parse_full_descriptor() {
        let text = r#"
# python app
FROM base:v1
WORKDIR /app
COPY manifest .
RUN install-deps
COPY . .
CMD ["run-entry"]
"#;
        let instructions = parse(text).unwrap();
        assert_eq!(instructions.len(), 6);
        assert_eq!(
            instructions[0],
            Instruction::SetBase(BaseRef::parse("base:v1").unwrap())
        );
        assert_eq!(
            instructions[2],
            Instruction::CopySubset {
                sources: argv(&["manifest"]),
                dest: ".".into()
            }
        );
        assert_eq!(
            instructions[3],
            Instruction::RunCommand(argv(&["/bin/sh", "-c", "install-deps"]))
        );
        assert_eq!(
            instructions[5],
            Instruction::SetDefaultCommand(argv(&["run-entry"]))
        );
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let instructions = parse("from base\nworkdir /srv").unwrap();
        assert_eq!(
            instructions[1],
            Instruction::SetWorkingDirectory("/srv".into())
        );
    }

    #[test]
    fn test_unknown_instruction_is_error() {
        let err = parse("FROM base\n\nEXPOSE 80").unwrap_err();
        match err {
            StrataError::UnknownInstruction { line, keyword } => {
                assert_eq!(line, 3);
                assert_eq!(keyword, "EXPOSE");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_copy_json_form_and_multiple_sources() {
        let instructions = parse(r#"COPY ["a b.txt", "c", "/dst/"]"#).unwrap();
        assert_eq!(
            instructions[0],
            Instruction::CopySubset {
                sources: argv(&["a b.txt", "c"]),
                dest: "/dst/".into()
            }
        );
    }

    #[test]
    fn test_copy_rejects_flags_and_single_arg() {
        assert!(parse("COPY --from=build /out .").is_err());
        assert!(parse("COPY onlyone").is_err());
    }

    #[test]
    fn test_exec_form_errors() {
        assert!(parse("RUN []").is_err());
        assert!(parse("CMD [\"unterminated\"").is_err());
        assert!(parse("RUN").is_err());
    }

    #[test]
    fn test_from_alias_rejected() {
        let err = parse("FROM base AS builder").unwrap_err();
        assert!(matches!(err, StrataError::DescriptorParse { line: 1, .. }));
    }
}
