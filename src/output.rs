//! Output handling for bot and test-runner streams.
//!
//! Every line a child prints is re-emitted on our stdout with a prefix naming
//! its source, rendered from a small template (`{name}`, `{index}`, `{time}`).

use std::time::Instant;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Output settings shared by every prefixed stream.
#[derive(Debug, Clone, Default)]
pub struct OutputSettings {
    /// Prefix template; defaults to `[{name}]`.
    pub prefix: Option<String>,
    /// Prepend elapsed time when the template has no `{time}`.
    pub timestamp: bool,
    /// Remove ANSI escape codes from child output.
    pub strip_ansi: bool,
    /// Print lines exactly as received.
    pub raw: bool,
}

/// Formats and prints child output lines.
#[derive(Debug, Clone)]
pub struct LineWriter {
    settings: OutputSettings,
    start: Instant,
}

impl LineWriter {
    pub fn new(settings: OutputSettings) -> Self {
        Self {
            settings,
            start: Instant::now(),
        }
    }

    /// Prints one line from `name`. stderr lines go to our stderr.
    pub fn emit(&self, name: &str, index: usize, line: &str, stream: StreamKind) {
        let output = self.format_line(name, index, line);
        match stream {
            StreamKind::Stdout => println!("{}", output),
            StreamKind::Stderr => eprintln!("{}", output),
        }
    }

    pub fn format_line(&self, name: &str, index: usize, line: &str) -> String {
        let text = sanitize_text(line, self.settings.strip_ansi);
        if self.settings.raw {
            return text;
        }
        let cleaned = strip_existing_prefix(name, &text);
        format!("{}{}", self.format_prefix(name, index), cleaned)
    }

    fn format_prefix(&self, name: &str, index: usize) -> String {
        let elapsed = self.elapsed();
        let mut prefix = match self.settings.prefix.as_deref() {
            Some(template) => {
                let rendered = render_template(template, name, index, &elapsed);
                if self.settings.timestamp && !template.contains("{time}") {
                    format!("{} {}", elapsed, rendered)
                } else {
                    rendered
                }
            }
            None if self.settings.timestamp => format!("{} [{}]", elapsed, name),
            None => format!("[{}]", name),
        };
        if !prefix.is_empty() {
            prefix.push(' ');
        }
        prefix
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

/// Name used for bot `index` in prefixes.
pub fn bot_name(index: usize) -> String {
    format!("bot-{}", index)
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Simple token replacement for prefix and command templates.
pub fn render_template(template: &str, name: &str, index: usize, time: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{index}", &index.to_string())
        .replace("{time}", time)
}

fn strip_existing_prefix(name: &str, text: &str) -> String {
    let candidates = [
        format!("[{}] ", name),
        format!("[{}]", name),
        format!("{}: ", name),
    ];
    for candidate in candidates {
        if let Some(rest) = text.strip_prefix(&candidate) {
            return rest.trim_start().to_string();
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix_uses_name() {
        let writer = LineWriter::new(OutputSettings::default());
        assert_eq!(writer.format_line("bot-2", 2, "joined room"), "[bot-2] joined room");
    }

    #[test]
    fn template_renders_index() {
        let writer = LineWriter::new(OutputSettings {
            prefix: Some("<{index}:{name}>".into()),
            ..OutputSettings::default()
        });
        assert_eq!(writer.format_line("bot-7", 7, "x"), "<7:bot-7> x");
    }

    #[test]
    fn timestamp_is_prepended_without_time_token() {
        let writer = LineWriter::new(OutputSettings {
            timestamp: true,
            ..OutputSettings::default()
        });
        assert_eq!(writer.format_line("tests", 0, "ok"), "00:00 [tests] ok");
    }

    #[test]
    fn duplicate_prefix_is_not_repeated() {
        let writer = LineWriter::new(OutputSettings::default());
        assert_eq!(writer.format_line("bot-0", 0, "[bot-0] hello"), "[bot-0] hello");
    }

    #[test]
    fn strips_ansi_when_asked() {
        let writer = LineWriter::new(OutputSettings {
            strip_ansi: true,
            raw: true,
            ..OutputSettings::default()
        });
        assert_eq!(writer.format_line("bot-0", 0, "\u{1b}[31mred\u{1b}[0m"), "red");
        assert_eq!(sanitize_text("\u{1b}[1mx", false), "\u{1b}[1mx");
    }
}
