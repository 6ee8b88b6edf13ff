use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewCommand {
    /// A drag tick on the control.
    Set(i32),
    /// Hardware volume keys, `n` presses.
    Up(u32),
    Down(u32),
    /// Another application wrote a level to the mixer.
    Emit(f64),
    Restart,
    Offline,
    Online,
    Show,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("`{0}` needs a value")]
    MissingValue(&'static str),
    #[error("invalid value `{value}` for `{command}`")]
    InvalidValue {
        command: &'static str,
        value: String,
    },
}

/// Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ViewCommand>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();

    let command = match head.to_ascii_lowercase().as_str() {
        "set" => ViewCommand::Set(required(arg, "set")?),
        "up" => ViewCommand::Up(optional(arg, "up")?.unwrap_or(1)),
        "down" => ViewCommand::Down(optional(arg, "down")?.unwrap_or(1)),
        "emit" => ViewCommand::Emit(required(arg, "emit")?),
        "restart" => ViewCommand::Restart,
        "offline" => ViewCommand::Offline,
        "online" => ViewCommand::Online,
        "show" => ViewCommand::Show,
        "quit" | "exit" | "q" => ViewCommand::Quit,
        _ => match head.parse() {
            Ok(raw) => ViewCommand::Set(raw),
            Err(_) => return Err(ParseError::Unknown(head.to_string())),
        },
    };
    Ok(Some(command))
}

fn required<T: std::str::FromStr>(
    arg: Option<&str>,
    command: &'static str,
) -> Result<T, ParseError> {
    optional(arg, command)?.ok_or(ParseError::MissingValue(command))
}

fn optional<T: std::str::FromStr>(
    arg: Option<&str>,
    command: &'static str,
) -> Result<Option<T>, ParseError> {
    arg.map(|value| {
        value.parse().map_err(|_| ParseError::InvalidValue {
            command,
            value: value.to_string(),
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_numbers_are_drag_ticks() {
        assert_eq!(parse_command("-35"), Ok(Some(ViewCommand::Set(-35))));
        assert_eq!(parse_command("  set 15 "), Ok(Some(ViewCommand::Set(15))));
    }

    #[test]
    fn key_presses_default_to_one_step() {
        assert_eq!(parse_command("up"), Ok(Some(ViewCommand::Up(1))));
        assert_eq!(parse_command("DOWN 3"), Ok(Some(ViewCommand::Down(3))));
    }

    #[test]
    fn emit_accepts_fractional_levels() {
        assert_eq!(parse_command("emit -10.5"), Ok(Some(ViewCommand::Emit(-10.5))));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn reports_bad_input() {
        assert_eq!(
            parse_command("louder"),
            Err(ParseError::Unknown("louder".to_string()))
        );
        assert_eq!(parse_command("set"), Err(ParseError::MissingValue("set")));
        assert_eq!(
            parse_command("up lots"),
            Err(ParseError::InvalidValue {
                command: "up",
                value: "lots".to_string()
            })
        );
    }
}
