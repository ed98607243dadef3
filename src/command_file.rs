use std::path::Path;

use crate::error::SequencerError;

/// Scan techniques reachable from a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Usaxs,
    Saxs,
    Waxs,
}

/// The closed action vocabulary of command files.
///
/// Unknown words parse to `Unrecognized`, which the execution engine logs
/// and skips; a batch never aborts merely because of a word it does not
/// know. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandAction {
    Scan(ScanKind),
    ModeBlackFly,
    ModeRadiography,
    ModeSaxs,
    ModeUsaxs,
    ModeWaxs,
    RotatorOff,
    RotatorForward,
    RotatorReverse,
    PreUsaxsTune,
    RunScript,
    Unrecognized(String),
}

impl CommandAction {
    pub fn parse(word: &str) -> Self {
        match word.to_lowercase().as_str() {
            "flyscan" | "usaxsscan" | "usaxs" => CommandAction::Scan(ScanKind::Usaxs),
            "saxs" | "saxsexp" => CommandAction::Scan(ScanKind::Saxs),
            "waxs" | "waxsexp" => CommandAction::Scan(ScanKind::Waxs),
            "mode_blackfly" => CommandAction::ModeBlackFly,
            "mode_radiography" => CommandAction::ModeRadiography,
            "mode_saxs" => CommandAction::ModeSaxs,
            "mode_usaxs" => CommandAction::ModeUsaxs,
            "mode_waxs" => CommandAction::ModeWaxs,
            "pi_off" => CommandAction::RotatorOff,
            "pi_onf" => CommandAction::RotatorForward,
            "pi_onr" => CommandAction::RotatorReverse,
            "preusaxstune" => CommandAction::PreUsaxsTune,
            "run_python" | "run" => CommandAction::RunScript,
            _ => CommandAction::Unrecognized(word.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CommandAction::Scan(ScanKind::Usaxs) => "usaxsscan",
            CommandAction::Scan(ScanKind::Saxs) => "saxs",
            CommandAction::Scan(ScanKind::Waxs) => "waxs",
            CommandAction::ModeBlackFly => "mode_blackfly",
            CommandAction::ModeRadiography => "mode_radiography",
            CommandAction::ModeSaxs => "mode_saxs",
            CommandAction::ModeUsaxs => "mode_usaxs",
            CommandAction::ModeWaxs => "mode_waxs",
            CommandAction::RotatorOff => "pi_off",
            CommandAction::RotatorForward => "pi_onf",
            CommandAction::RotatorReverse => "pi_onr",
            CommandAction::PreUsaxsTune => "preusaxstune",
            CommandAction::RunScript => "run_python",
            CommandAction::Unrecognized(word) => word,
        }
    }
}

/// One parsed command-list entry. Immutable once parsed; the raw source
/// text and the 1-based line number travel with it for logging, validation
/// messages and notifications.
#[derive(Debug, Clone)]
pub struct Command {
    pub action: CommandAction,
    pub args: Vec<String>,
    pub line_number: usize,
    pub raw: String,
}

/// Tokenize one command line.
///
/// Whitespace separates tokens; double or single quotes group a token that
/// contains spaces; an unquoted `#` starts a comment running to the end of
/// the line. An all-blank or all-comment line yields no tokens.
pub fn split_quoted_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;
    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                    in_token = true;
                } else if c == '#' {
                    break;
                } else if c.is_whitespace() {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                } else {
                    current.push(c);
                    in_token = true;
                }
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Parse a line-oriented text command file.
///
/// Blank lines are ignored, `#` comments run to end of line, everything
/// else is a command with arguments.
pub fn parse_text_command_file(path: &Path) -> Result<Vec<Command>, SequencerError> {
    let text = std::fs::read_to_string(path).map_err(|e| SequencerError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut commands = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let tokens = split_quoted_line(raw);
        let Some((action_word, args)) = tokens.split_first() else {
            continue; // comment or blank
        };
        commands.push(Command {
            action: CommandAction::parse(action_word),
            args: args.to_vec(),
            line_number: index + 1,
            raw: raw.trim_end().to_string(),
        });
    }
    Ok(commands)
}

/// Parse a tabular command file (the CSV/TSV export of a command sheet).
///
/// The first non-empty row is the header and is skipped; each data row is
/// action in the first column, positional arguments after it, trailing
/// empty cells trimmed. Line numbers count data rows from 1.
pub fn parse_table_command_file(path: &Path) -> Result<Vec<Command>, SequencerError> {
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => b',',
        Some("tsv") => b'\t',
        _ => {
            return Err(SequencerError::Parse {
                path: path.display().to_string(),
                reason: "not a tabular command file".to_string(),
            });
        }
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| SequencerError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let mut commands = Vec::new();
    let mut header_seen = false;
    let mut row_number = 0usize;
    for record in reader.records() {
        let record = record.map_err(|e| SequencerError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut cells: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        while cells.last().is_some_and(|c| c.is_empty()) {
            cells.pop();
        }
        if cells.is_empty() {
            continue;
        }
        if !header_seen {
            header_seen = true;
            continue;
        }
        row_number += 1;
        let raw = cells.join(" ");
        let action = CommandAction::parse(&cells[0]);
        commands.push(Command {
            action,
            args: cells[1..].to_vec(),
            line_number: row_number,
            raw,
        });
    }
    Ok(commands)
}

/// Read a command list from either supported format: tabular first, then
/// the line-oriented text format.
pub fn get_command_list(path: &Path) -> Result<Vec<Command>, SequencerError> {
    match parse_table_command_file(path) {
        Ok(commands) => Ok(commands),
        Err(_) => parse_text_command_file(path),
    }
}

/// Format a command list as an aligned text table for logs and the archive.
pub fn command_list_as_table(commands: &[Command]) -> String {
    let headers = ["line #", "action", "parameters"];
    let rows: Vec<[String; 3]> = commands
        .iter()
        .map(|c| {
            [
                c.line_number.to_string(),
                c.action.name().to_string(),
                c.args.join(", "),
            ]
        })
        .collect();
    let mut widths = [headers[0].len(), headers[1].len(), headers[2].len()];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }
    let rule = widths
        .iter()
        .map(|w| "=".repeat(*w))
        .collect::<Vec<_>>()
        .join(" ");
    let format_row = |cells: [&str; 3]| {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, width)| format!("{:<1$}", cell, *width))
            .collect::<Vec<_>>()
            .join(" ")
            .trim_end()
            .to_string()
    };
    let mut out = String::new();
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format_row(headers));
    out.push('\n');
    out.push_str(&rule);
    out.push('\n');
    for row in &rows {
        out.push_str(&format_row([&row[0], &row[1], &row[2]]));
        out.push('\n');
    }
    out.push_str(&rule);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tokenizer_handles_quotes_and_comments() {
        assert_eq!(
            split_quoted_line(r#"FlyScan 5 2 0 "empty container" # note"#),
            vec!["FlyScan", "5", "2", "0", "empty container"]
        );
        assert!(split_quoted_line("   ").is_empty());
        assert!(split_quoted_line("# just a comment").is_empty());
        assert_eq!(split_quoted_line("a 'b c' d"), vec!["a", "b c", "d"]);
    }

    #[test]
    fn text_file_skips_blanks_and_comments_and_keeps_line_numbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "USAXS 0 0 0 blank\n#comment\nSAXS 1 2 0.5 foo\n"
        )
        .unwrap();
        let commands = parse_text_command_file(file.path()).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].line_number, 1);
        assert_eq!(commands[0].action, CommandAction::Scan(ScanKind::Usaxs));
        assert_eq!(commands[1].line_number, 3);
        assert_eq!(commands[1].action, CommandAction::Scan(ScanKind::Saxs));
        assert_eq!(commands[1].args, vec!["1", "2", "0.5", "foo"]);
    }

    #[test]
    fn unknown_actions_parse_to_unrecognized() {
        assert_eq!(
            CommandAction::parse("make_coffee"),
            CommandAction::Unrecognized("make_coffee".to_string())
        );
        assert_eq!(CommandAction::parse("FLYSCAN"), CommandAction::Scan(ScanKind::Usaxs));
        assert_eq!(CommandAction::parse("WAXSExp"), CommandAction::Scan(ScanKind::Waxs));
    }

    #[test]
    fn table_file_skips_header_and_trims_trailing_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overnight.csv");
        std::fs::write(
            &path,
            "scan,sx,sy,thickness,sample name\nFlyScan,0,0,0,blank,,\nFlyScan,5,2,0,blank\n",
        )
        .unwrap();
        let commands = parse_table_command_file(&path).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].args, vec!["0", "0", "0", "blank"]);
        assert_eq!(commands[1].line_number, 2);
    }

    #[test]
    fn get_command_list_falls_back_to_text() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "mode_USAXS\npreUSAXStune\n").unwrap();
        let commands = get_command_list(file.path()).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].action, CommandAction::ModeUsaxs);
        assert_eq!(commands[1].action, CommandAction::PreUsaxsTune);
    }

    #[test]
    fn table_rendering_lines_up() {
        let commands = vec![Command {
            action: CommandAction::Scan(ScanKind::Saxs),
            args: vec!["1".into(), "2".into(), "0.5".into(), "foo".into()],
            line_number: 3,
            raw: "SAXS 1 2 0.5 foo".into(),
        }];
        let table = command_list_as_table(&commands);
        assert!(table.contains("line #"));
        assert!(table.contains("saxs"));
        assert!(table.contains("1, 2, 0.5, foo"));
    }
}
