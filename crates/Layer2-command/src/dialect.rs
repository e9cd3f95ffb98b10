//! Shell dialects and quoting

use std::borrow::Cow;

/// Shell that will parse the rendered command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShellDialect {
    /// sh, bash, zsh, dash, ash
    #[default]
    Posix,
    PowerShell,
    /// Windows `cmd.exe`. `%VAR%` expansion cannot be suppressed inside quotes.
    Cmd,
}

impl ShellDialect {
    /// Dialect of the shell this process would use for `sh -c` style calls
    pub fn native() -> Self {
        if cfg!(windows) {
            Self::Cmd
        } else {
            Self::Posix
        }
    }

    /// Guess the dialect from a shell binary path
    pub fn from_shell(shell: &str) -> Self {
        let name = shell
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(shell)
            .to_ascii_lowercase();
        let name = name.strip_suffix(".exe").unwrap_or(&name);
        match name {
            "pwsh" | "powershell" => Self::PowerShell,
            "cmd" => Self::Cmd,
            _ => Self::Posix,
        }
    }
}

/// Characters that never need quoting in any supported dialect
fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ',' | ':' | '@' | '%' | '+' | '=')
}

/// Quote `value` so the shell reads it back as exactly one word
///
/// Values made only of safe characters come back unchanged. The empty string
/// becomes an explicit empty-quote token.
pub fn quote(value: &str, dialect: ShellDialect) -> Cow<'_, str> {
    let needs_quotes = match dialect {
        // cmd expands %VAR% even inside quotes; quoting keeps the word intact at least
        ShellDialect::Cmd => value.is_empty() || !value.chars().all(|c| is_safe(c) && c != '%'),
        _ => value.is_empty() || !value.chars().all(is_safe),
    };
    if !needs_quotes {
        return Cow::Borrowed(value);
    }

    match dialect {
        ShellDialect::Posix => {
            let mut out = String::with_capacity(value.len() + 2);
            out.push('\'');
            for c in value.chars() {
                if c == '\'' {
                    // close, escaped quote, reopen
                    out.push_str("'\\''");
                } else {
                    out.push(c);
                }
            }
            out.push('\'');
            Cow::Owned(out)
        }
        ShellDialect::PowerShell => Cow::Owned(format!("'{}'", value.replace('\'', "''"))),
        ShellDialect::Cmd => Cow::Owned(format!("\"{}\"", value.replace('"', "\"\""))),
    }
}

/// Quote every token and join with single spaces
pub fn join<S: AsRef<str>>(tokens: &[S], dialect: ShellDialect) -> String {
    tokens
        .iter()
        .map(|t| quote(t.as_ref(), dialect))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wrap `line` in a POSIX brace group so a prefix like `cd dir &&`
/// guards all of it
///
/// `{ a || b; }` binds tighter than `&&`, so `cd /x && { false || echo y\n}`
/// runs nothing when `cd` fails. The closing brace sits on its own line,
/// after any trailing `#` comment or `&` in `line`.
pub fn posix_group(line: &str) -> String {
    format!("{{ {}\n}}", line)
}
