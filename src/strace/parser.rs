use chumsky::prelude::*;

use crate::Pid;

use super::{Event, Line, LineSourceLocation, RawSyscall};

type ParserError<'a> = extra::Err<Rich<'a, char>>;

pub fn parse_line<'line>(
    line: &'line str,
    location: &LineSourceLocation,
) -> Result<Line<'line>, ParseLineError> {
    line_parser()
        .parse(line)
        .into_result()
        .map_err(|errors| ParseLineError::from_parser_errors(line, location, errors))
}

/// Decode a quoted strace string such as `"a\tb\n"`. A trailing `...`
/// (truncated string) is accepted and dropped.
pub fn parse_string_literal(value: &str) -> Option<bstr::BString> {
    string_literal().then_ignore(end()).parse(value.trim()).into_output()
}

/// Decode a strace string array such as `["ls", "-l"]`. Elided entries
/// (`...`) are skipped.
pub fn parse_string_array(value: &str) -> Option<Vec<bstr::BString>> {
    string_literal()
        .map(Some)
        .or(just("...").to(None))
        .separated_by(just(',').padded())
        .collect::<Vec<_>>()
        .delimited_by(just('['), just(']'))
        .then_ignore(end())
        .parse(value.trim())
        .into_output()
        .map(|values| values.into_iter().flatten().collect())
}

fn line_parser<'a>() -> impl chumsky::Parser<'a, &'a str, Line<'a>, ParserError<'a>> {
    let pid = text::int(10)
        .try_map(|pid: &str, span| pid.parse::<Pid>().map_err(|e| Rich::custom(span, e)));

    let signed_duration = one_of("+-")
        .or_not()
        .then(text::int(10))
        .to_slice()
        .then(
            just(".")
                .then(one_of('0'..='9').repeated().at_least(1))
                .to_slice()
                .or_not(),
        )
        .try_map(|(seconds, fraction): (&str, Option<&str>), span| {
            let seconds = seconds.parse::<i64>().map_err(|e| Rich::custom(span, e))?;

            let nanoseconds = if let Some(fraction) = fraction {
                let fraction = fraction.parse::<f64>().map_err(|e| Rich::custom(span, e))?;
                let nanoseconds = (fraction * 1_000_000_000.0).round() as i32;
                nanoseconds.clamp(0, 999_999_999)
            } else {
                0
            };

            Ok(jiff::SignedDuration::new(seconds, nanoseconds))
        });
    let duration = signed_duration.clone().try_map(|duration, span| {
        std::time::Duration::try_from(duration).map_err(|e| Rich::custom(span, e))
    });
    let timestamp = signed_duration.try_map(|duration, span| {
        jiff::Timestamp::from_duration(duration).map_err(|e| Rich::custom(span, e))
    });

    // `exit_group(0) = ?` never returns, so strace prints no duration
    let trailing_duration = text::whitespace()
        .at_least(1)
        .ignore_then(duration.delimited_by(just('<'), just('>')))
        .then_ignore(end());
    let syscall_result = any()
        .and_is(trailing_duration.clone().not())
        .repeated()
        .to_slice()
        .map(|result: &str| result.trim());

    let syscall = group((
        text::ident(),
        syscall_args().delimited_by(just('('), just(')')),
        just('=').padded().ignore_then(syscall_result),
        trailing_duration.or_not(),
    ))
    .map(|(name, args, result, duration)| {
        Event::Syscall(RawSyscall {
            name,
            args,
            result,
            duration,
        })
    });

    let exit_code = one_of("+-")
        .or_not()
        .then(text::int(10))
        .to_slice()
        .try_map(|code: &str, span| code.parse::<i32>().map_err(|e| Rich::custom(span, e)));
    let exited = just("+++ exited with ")
        .ignore_then(exit_code)
        .then_ignore(just(" +++"))
        .map(|code| Event::Exited { code });
    let killed_by = just("+++ killed by ")
        .ignore_then(until(" +++"))
        .then_ignore(just(" +++"))
        .map(|signal| Event::KilledBy { signal });
    let notice = just("+++ ")
        .ignore_then(until(" +++"))
        .then_ignore(just(" +++"))
        .map(|message| Event::Notice { message });
    let signal = just("--- ")
        .ignore_then(until(" ---"))
        .then_ignore(just(" ---"))
        .map(|signal| Event::Signal { signal });

    let event = choice((syscall, exited, killed_by, notice, signal));

    // strace pads the pid column when following forks into a single file
    group((
        pid.then_ignore(just(' ').repeated().at_least(1)),
        timestamp.then_ignore(just(' ')),
        event.then_ignore(end()),
    ))
    .map(|(pid, timestamp, event)| Line {
        pid,
        timestamp,
        event,
    })
}

/// Everything up to a terminator that closes the line.
fn until<'a>(
    terminator: &'static str,
) -> impl chumsky::Parser<'a, &'a str, &'a str, ParserError<'a>> + Clone {
    any()
        .and_is(just(terminator).then(end()).not())
        .repeated()
        .to_slice()
}

/// Top-level syscall arguments, split on commas that are not nested inside
/// a string, brackets, braces, or parentheses.
fn syscall_args<'a>() -> impl chumsky::Parser<'a, &'a str, Vec<&'a str>, ParserError<'a>> + Clone
{
    choice((quoted(), balanced(), none_of("\"()[]{},").ignored()))
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|arg: &str| arg.trim())
        .separated_by(just(','))
        .collect::<Vec<_>>()
}

fn balanced<'a>() -> impl chumsky::Parser<'a, &'a str, (), ParserError<'a>> + Clone {
    recursive(|balanced| {
        let inner = choice((quoted(), balanced, none_of("\"()[]{}").ignored())).repeated();
        choice((
            inner.clone().delimited_by(just('('), just(')')),
            inner.clone().delimited_by(just('['), just(']')),
            inner.delimited_by(just('{'), just('}')),
        ))
    })
}

fn quoted<'a>() -> impl chumsky::Parser<'a, &'a str, (), ParserError<'a>> + Clone {
    just('"')
        .then(
            choice((just('\\').then(any()).ignored(), none_of("\\\"").ignored())).repeated(),
        )
        .then(just('"'))
        .then(just("...").or_not())
        .ignored()
}

fn string_literal<'a>() -> impl chumsky::Parser<'a, &'a str, bstr::BString, ParserError<'a>> + Clone
{
    let string_escape = just('\\').ignore_then(choice((
        just('\\').to(b'\\'),
        just('a').to(0x07),
        just('b').to(0x08),
        just('e').to(0x1B),
        just('f').to(0x0C),
        just('n').to(b'\n'),
        just('r').to(b'\r'),
        just('t').to(b'\t'),
        just('v').to(0x0B),
        just('\'').to(b'\''),
        just('"').to(b'\"'),
        just('?').to(b'?'),
        just('x')
            .ignore_then(
                one_of("0123456789ABCDEFabcdef")
                    .repeated()
                    .exactly(2)
                    .to_slice(),
            )
            .try_map(|hex: &str, span| {
                u8::from_str_radix(hex, 16).map_err(|e| Rich::custom(span, e))
            }),
        one_of("01234567")
            .repeated()
            .at_least(1)
            .at_most(3)
            .to_slice()
            .try_map(|octal: &str, span| {
                u8::from_str_radix(octal, 8).map_err(|e| Rich::custom(span, e))
            }),
    )));

    none_of("\\\"")
        .map(|c: char| {
            let mut buf = [0; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        })
        .or(string_escape.map(|byte| vec![byte]))
        .repeated()
        .collect::<Vec<Vec<u8>>>()
        .map(|chunks| bstr::BString::new(chunks.concat()))
        .delimited_by(just('"'), just('"'))
        .then_ignore(just("...").or_not())
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse strace line")]
pub struct ParseLineError {
    src: StraceSource,
    spans: Vec<miette::LabeledSpan>,
}

impl ParseLineError {
    fn from_parser_errors(
        source: &str,
        location: &LineSourceLocation,
        errors: Vec<Rich<'_, char>>,
    ) -> Self {
        let spans = errors
            .into_iter()
            .map(|error| {
                let span = error.span();
                miette::LabeledSpan::at(span.into_range(), error.into_reason().to_string())
            })
            .collect();

        Self {
            src: StraceSource {
                source: source.to_string(),
                filename: location.filename.to_string(),
                line_index: location.line_index,
            },
            spans,
        }
    }

    pub fn line_index(&self) -> usize {
        self.src.line_index
    }
}

impl miette::Diagnostic for ParseLineError {
    fn severity(&self) -> Option<miette::Severity> {
        Some(miette::Severity::Warning)
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&self.src)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        Some(Box::new(self.spans.iter().cloned()))
    }
}

#[derive(Debug)]
struct StraceSource {
    filename: String,
    line_index: usize,
    source: String,
}

impl miette::SourceCode for StraceSource {
    fn read_span<'a>(
        &'a self,
        span: &miette::SourceSpan,
        context_lines_before: usize,
        context_lines_after: usize,
    ) -> Result<Box<dyn miette::SpanContents<'a> + 'a>, miette::MietteError> {
        let contents = self
            .source
            .read_span(span, context_lines_before, context_lines_after)?;
        let contents = miette::MietteSpanContents::new_named(
            self.filename.to_string(),
            contents.data(),
            *contents.span(),
            self.line_index + contents.line(),
            contents.column(),
            contents.line_count(),
        );
        Ok(Box::new(contents))
    }
}
