//! Structured command lines.
//!
//! Commands are assembled from typed arguments and only turned into text at
//! the edges: [`CommandLine::render`] for the shell-quoted form handed to
//! other programs, [`CommandLine::redacted`] for logs, and
//! [`CommandLine::argv`] for direct process spawning. Nothing here ever goes
//! through a shell.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("command line is empty")]
    Empty,
    #[error("unterminated {0} quote in command line")]
    UnterminatedQuote(&'static str),
    #[error("command line ends with a dangling backslash")]
    DanglingEscape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Plain(String),
    /// `--flag=value`
    Option {
        flag: String,
        value: String,
        secret: bool,
    },
    /// `--flag value`
    Pair { flag: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<Arg>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Split `line` with POSIX shell rules; the first word is the program.
    pub fn parse(line: &str) -> Result<Self, CommandLineError> {
        let mut words = split_words(line)?.into_iter();
        let program = words.next().ok_or(CommandLineError::Empty)?;
        Ok(Self {
            program,
            args: words.map(Arg::Plain).collect(),
        })
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| Arg::Plain(a.into())));
        self
    }

    #[must_use]
    pub fn option(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push(Arg::Option {
            flag: flag.into(),
            value: value.into(),
            secret: false,
        });
        self
    }

    /// Like [`option`](Self::option), but the value never appears in logs.
    #[must_use]
    pub fn secret_option(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push(Arg::Option {
            flag: flag.into(),
            value: value.into(),
            secret: true,
        });
        self
    }

    #[must_use]
    pub fn pair(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push(Arg::Pair {
            flag: flag.into(),
            value: value.into(),
        });
        self
    }

    /// Append `other` (its program included) as arguments, keeping secrets secret.
    #[must_use]
    pub fn append(mut self, other: &CommandLine) -> Self {
        self.args.push(Arg::Plain(other.program.clone()));
        self.args.extend(other.args.iter().cloned());
        self
    }

    #[inline]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program, one element per process argument.
    pub fn argv(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            match arg {
                Arg::Plain(a) => out.push(a.clone()),
                Arg::Option { flag, value, .. } => out.push(format!("{flag}={value}")),
                Arg::Pair { flag, value } => {
                    out.push(flag.clone());
                    out.push(value.clone());
                }
            }
        }
        out
    }

    /// Shell-quoted form; each value is quoted on its own.
    pub fn render(&self) -> String {
        self.render_with(false)
    }

    /// Shell-quoted form with secret values replaced by `***`.
    pub fn redacted(&self) -> String {
        self.render_with(true)
    }

    fn render_with(&self, redact: bool) -> String {
        let mut parts = vec![shell_quote(&self.program)];
        for arg in &self.args {
            match arg {
                Arg::Plain(a) => parts.push(shell_quote(a)),
                Arg::Option {
                    flag,
                    value,
                    secret,
                } => {
                    let value = if *secret && redact {
                        "***".to_owned()
                    } else {
                        shell_quote(value)
                    };
                    parts.push(format!("{}={value}", shell_quote(flag)));
                }
                Arg::Pair { flag, value } => {
                    parts.push(shell_quote(flag));
                    parts.push(shell_quote(value));
                }
            }
        }
        parts.join(" ")
    }
}

/// Logs and error messages only ever see the redacted form.
impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// Quote `s` for a POSIX shell, leaving it untouched when that is already safe.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_owned();
    }
    if s.chars().all(is_safe) {
        return s.to_owned();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Split `line` into words following POSIX shell quoting rules.
pub fn split_words(line: &str) -> Result<Vec<String>, CommandLineError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(CommandLineError::UnterminatedQuote("single")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('$' | '`' | '"' | '\\')) => current.push(ch),
                            Some('\n') => {}
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(CommandLineError::UnterminatedQuote("double")),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(CommandLineError::UnterminatedQuote("double")),
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(ch) => {
                    in_word = true;
                    current.push(ch);
                }
                None => return Err(CommandLineError::DanglingEscape),
            },
            ch => {
                in_word = true;
                current.push(ch);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_safe_values_alone() {
        assert_eq!(shell_quote("swift://x"), "swift://x");
        assert_eq!(shell_quote("/var/lib/antpickax/k2hdkc"), "/var/lib/antpickax/k2hdkc");
        assert_eq!(shell_quote("abc123"), "abc123");
    }

    #[test]
    fn quote_wraps_unsafe_values() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn split_respects_quotes() {
        let words = split_words(r#"/bin/sh -c "/usr/libexec/k2hdkctrove.sh status""#).unwrap();
        assert_eq!(words, ["/bin/sh", "-c", "/usr/libexec/k2hdkctrove.sh status"]);

        let words = split_words(r"a 'b c' d\ e f''g").unwrap();
        assert_eq!(words, ["a", "b c", "d e", "fg"]);

        let words = split_words(r#"x "a \"q\" \n" ''"#).unwrap();
        assert_eq!(words, ["x", r#"a "q" \n"#, ""]);
    }

    #[test]
    fn split_rejects_bad_input() {
        assert_eq!(
            split_words("echo 'oops"),
            Err(CommandLineError::UnterminatedQuote("single"))
        );
        assert_eq!(
            split_words("echo \"oops"),
            Err(CommandLineError::UnterminatedQuote("double"))
        );
        assert_eq!(split_words("echo \\"), Err(CommandLineError::DanglingEscape));
        assert_eq!(CommandLine::parse("   "), Err(CommandLineError::Empty));
    }

    #[test]
    fn render_survives_split() {
        let cmd = CommandLine::new("/usr/bin/python3")
            .arg("main.py")
            .option("--restore-from", "swift://bucket/with space")
            .secret_option("--os-token", "tok'en")
            .pair("--db-datadir", "/data dir");
        let words = split_words(&cmd.render()).unwrap();
        assert_eq!(words[0], "/usr/bin/python3");
        assert_eq!(words[1..], cmd.argv()[..]);
    }

    #[test]
    fn redacted_hides_secret_values() {
        let cmd = CommandLine::new("tool")
            .secret_option("--os-token", "gAAAAsecret")
            .option("--os-tenant-id", "p1");
        assert_eq!(cmd.redacted(), "tool --os-token=*** --os-tenant-id=p1");
        assert_eq!(cmd.to_string(), cmd.redacted());
        assert!(cmd.render().contains("gAAAAsecret"));
    }

    #[test]
    fn parse_then_extend() {
        let cmd = CommandLine::parse("/usr/bin/python3 main.py")
            .unwrap()
            .arg("--nobackup");
        assert_eq!(cmd.program(), "/usr/bin/python3");
        assert_eq!(cmd.argv(), ["main.py", "--nobackup"]);
    }

    #[test]
    fn append_keeps_program_and_secrets() {
        let inner = CommandLine::new("/bin/sh").secret_option("--key", "k");
        let outer = CommandLine::new("docker").arg("exec").append(&inner);
        assert_eq!(outer.argv(), ["exec", "/bin/sh", "--key=k"]);
        assert_eq!(outer.redacted(), "docker exec /bin/sh --key=***");
    }
}
