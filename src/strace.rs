pub mod analyzer;
pub mod launch;
pub mod parser;
pub mod stream;

use crate::Pid;

#[derive(Debug)]
pub struct Line<'a> {
    pub pid: Pid,
    pub timestamp: jiff::Timestamp,
    pub event: Event<'a>,
}

#[derive(Debug)]
pub enum Event<'a> {
    Syscall(RawSyscall<'a>),
    Signal { signal: &'a str },
    Exited { code: i32 },
    KilledBy { signal: &'a str },
    Notice { message: &'a str },
}

#[derive(Debug)]
pub struct RawSyscall<'a> {
    pub name: &'a str,
    pub args: Vec<&'a str>,
    pub result: &'a str,
    pub duration: Option<std::time::Duration>,
}

impl RawSyscall<'_> {
    /// The decoded return value, if strace printed a number.
    pub fn returned(&self) -> Option<i64> {
        let value = self.result.split_whitespace().next()?;
        if let Some(hex) = value.strip_prefix("0x") {
            i64::from_str_radix(hex, 16).ok()
        } else {
            value.parse().ok()
        }
    }

    /// The errno name for a failed call, e.g. `ENOENT`.
    pub fn errno(&self) -> Option<&str> {
        let mut words = self.result.split_whitespace();
        let value = words.next()?;
        if value != "-1" && value != "?" {
            return None;
        }

        words.next().filter(|word| {
            word.starts_with('E')
                && word
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        })
    }

    pub fn succeeded(&self) -> bool {
        self.errno().is_none() && self.returned().is_some_and(|value| value >= 0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LineSourceLocation<'a> {
    pub filename: &'a str,
    pub line_index: usize,
}
