//! Entry command parsing.

/// Split a manifest `entry` string into program and arguments.
///
/// Whitespace separates words. Single quotes keep their content literally;
/// double quotes allow `\"` and `\\` escapes; a backslash outside quotes
/// escapes the next character.
///
/// # Errors
///
/// Returns a message for empty commands, unterminated quotes, or a
/// trailing backslash.
pub(crate) fn split_command(entry: &str) -> Result<(String, Vec<String>), String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = entry.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            },
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            },
                            None => return Err("unterminated double quote".into()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            },
            '\\' => {
                in_word = true;
                current.push(chars.next().ok_or("trailing backslash")?);
            },
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            },
            c => {
                in_word = true;
                current.push(c);
            },
        }
    }
    if in_word {
        words.push(current);
    }

    let mut words = words.into_iter();
    let program = words.next().ok_or("entry command is empty")?;
    Ok((program, words.collect()))
}
