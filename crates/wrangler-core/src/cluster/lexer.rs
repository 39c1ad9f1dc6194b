//! Shell-style word splitting for cluster input lines (§4.7/§6): single
//! quotes preserve literally, double quotes permit `\ " $` escapes and
//! variable substitution, unquoted whitespace splits words.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated single quote")]
    UnterminatedSingleQuote,
    #[error("unterminated double quote")]
    UnterminatedDoubleQuote,
    #[error("trailing backslash")]
    TrailingBackslash,
}

#[derive(PartialEq)]
enum State {
    Bare,
    Single,
    Double,
}

/// Split `line` into an argument vector, expanding `$VAR` and `${VAR}`
/// references against the process environment outside single quotes.
pub fn split_words(line: &str) -> Result<Vec<String>, LexError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut have_current = false;
    let mut state = State::Bare;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Bare => match c {
                ' ' | '\t' => {
                    if have_current {
                        words.push(std::mem::take(&mut current));
                        have_current = false;
                    }
                }
                '\'' => {
                    state = State::Single;
                    have_current = true;
                }
                '"' => {
                    state = State::Double;
                    have_current = true;
                }
                '\\' => {
                    let next = chars.next().ok_or(LexError::TrailingBackslash)?;
                    current.push(next);
                    have_current = true;
                }
                '$' => {
                    current.push_str(&expand_var(&mut chars));
                    have_current = true;
                }
                other => {
                    current.push(other);
                    have_current = true;
                }
            },
            State::Single => {
                if c == '\'' {
                    state = State::Bare;
                } else {
                    current.push(c);
                }
            }
            State::Double => match c {
                '"' => state = State::Bare,
                '\\' => {
                    let next = chars.next().ok_or(LexError::TrailingBackslash)?;
                    match next {
                        '\\' | '"' | '$' => current.push(next),
                        other => {
                            current.push('\\');
                            current.push(other);
                        }
                    }
                }
                '$' => current.push_str(&expand_var(&mut chars)),
                other => current.push(other),
            },
        }
    }

    match state {
        State::Single => return Err(LexError::UnterminatedSingleQuote),
        State::Double => return Err(LexError::UnterminatedDoubleQuote),
        State::Bare => {}
    }

    if have_current {
        words.push(current);
    }
    Ok(words)
}

fn expand_var(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let braced = chars.peek() == Some(&'{');
    if braced {
        chars.next();
    }
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if braced {
        if chars.peek() == Some(&'}') {
            chars.next();
        }
    }
    std::env::var(&name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_unquoted_whitespace() {
        assert_eq!(
            split_words("echo  hello   world").unwrap(),
            vec!["echo", "hello", "world"]
        );
    }

    #[test]
    fn single_quotes_preserve_literally() {
        assert_eq!(
            split_words("echo '$HOME is literal'").unwrap(),
            vec!["echo", "$HOME is literal"]
        );
    }

    #[test]
    fn double_quotes_allow_escapes_and_expansion() {
        unsafe { std::env::set_var("WRANGLER_LEXER_TEST_VAR", "expanded") };
        assert_eq!(
            split_words("echo \"a \\\"quoted\\\" $WRANGLER_LEXER_TEST_VAR\"").unwrap(),
            vec!["echo", "a \"quoted\" expanded"]
        );
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            split_words("echo 'unterminated"),
            Err(LexError::UnterminatedSingleQuote)
        );
        assert_eq!(
            split_words("echo \"unterminated"),
            Err(LexError::UnterminatedDoubleQuote)
        );
    }

    #[test]
    fn braced_variable_expansion() {
        unsafe { std::env::set_var("WRANGLER_LEXER_BRACED", "yes") };
        assert_eq!(
            split_words("echo ${WRANGLER_LEXER_BRACED}suffix").unwrap(),
            vec!["echo", "yessuffix"]
        );
    }
}
