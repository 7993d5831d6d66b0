//! The device list.
//!
//! Each entry is `<device name> <driver name> [-<parameter> <value>]...`,
//! one per line:
//!
//! ```text
//! # Comments start with '#'.
//! dut     test
//! psu     serial -dev /dev/ttyUSB0 -baud 19200
//! scope   spp    -prog "scope_ctl --port 5" \
//!                -read_timeout 10
//! ```
//!
//! Words may be quoted with `'` or `"`, a backslash escapes the next character,
//! and a backslash at the end of a line continues the entry on the next one.

use std::{collections::HashSet, path::Path};

use crate::{
    driver::{self, Params},
    error::{Error, Result},
};

/// One configured device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Unique name of the device.
    pub name: String,

    /// Which driver to use.
    pub driver: String,

    /// Parameters for the driver.
    pub params: Params,

    /// The line the entry starts on.
    pub line: usize,
}

/// Read a device list from a file.
pub async fn read_devices(path: &Path) -> Result<Vec<DeviceEntry>> {
    let text = tokio::fs::read_to_string(path).await.map_err(|_| {
        Error::BadConfig(format!("can't open configuration: {}", path.display()))
    })?;

    parse_devices(&text, &path.display().to_string())
}

/// Parse the text of a device list.
/// `file` is only used in error messages.
pub fn parse_devices(text: &str, file: &str) -> Result<Vec<DeviceEntry>> {
    let bad = |line: usize, reason: String| {
        Error::BadConfig(format!(
            "bad configuration file {file} at line {line}: {reason}"
        ))
    };

    let entries = Words::default().split(text).map_err(|(line, reason)| bad(line, reason))?;

    let mut names = HashSet::new();
    let mut devices = Vec::with_capacity(entries.len());

    for (line, words) in entries {
        let device = entry(line, words).map_err(|reason| bad(line, reason))?;

        if !names.insert(device.name.clone()) {
            return Err(bad(line, format!("duplicated device name: {}", device.name)));
        }

        devices.push(device);
    }

    Ok(devices)
}

fn entry(line: usize, mut words: Vec<String>) -> std::result::Result<DeviceEntry, String> {
    if words.len() < 2 {
        return Err("expected: <device name> <driver name> [-<parameter> <value>]".into());
    }

    let rest = words.split_off(2);
    if rest.len() % 2 != 0 {
        return Err("even-size list of [-<parameter> <value>] pairs expected".into());
    }

    let mut params = Params::new();
    for pair in rest.chunks(2) {
        match pair[0].strip_prefix('-') {
            Some(key) if !key.is_empty() => params.insert(key, pair[1].as_str()),
            _ => {
                return Err(format!(
                    "parameter name should be prefixed with \"-\" and contain at least one character: {}",
                    pair[0]
                ))
            }
        }
    }

    let driver = words.pop().unwrap_or_default();
    let name = words.pop().unwrap_or_default();

    if name.is_empty() {
        return Err("empty device".into());
    }
    if name.contains(|c: char| c == '/' || c.is_whitespace()) {
        return Err(format!("bad device name: {name}"));
    }
    if !driver::is_known(&driver) {
        return Err(format!("unknown driver: {driver}"));
    }

    Ok(DeviceEntry {
        name,
        driver,
        params,
        line,
    })
}

/// Splits text into entries of words.
#[derive(Debug, Default)]
struct Words {
    entries: Vec<(usize, Vec<String>)>,
    words: Vec<String>,

    /// The word being read.
    /// `Some("")` after an empty pair of quotes.
    word: Option<String>,

    /// Current line, counting from 1.
    line: usize,

    /// The line the current entry started on.
    entry_line: usize,
}

impl Words {
    fn push(&mut self, c: char) {
        self.word_mut().push(c);
    }

    fn word_mut(&mut self) -> &mut String {
        if self.word.is_none() && self.words.is_empty() {
            self.entry_line = self.line;
        }
        self.word.get_or_insert_with(String::new)
    }

    fn end_word(&mut self) {
        if let Some(word) = self.word.take() {
            self.words.push(word);
        }
    }

    fn end_entry(&mut self) {
        self.end_word();
        if !self.words.is_empty() {
            let words = std::mem::take(&mut self.words);
            self.entries.push((self.entry_line, words));
        }
    }

    fn split(mut self, text: &str) -> std::result::Result<Vec<(usize, Vec<String>)>, (usize, String)> {
        self.line = 1;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('\n') => {
                        self.line += 1;
                        self.end_word();
                    }
                    Some(escaped) => self.push(escaped),
                    None => self.push('\\'),
                },
                '\n' => {
                    self.end_entry();
                    self.line += 1;
                }
                '#' if self.word.is_none() => {
                    while chars.next_if(|&c| c != '\n').is_some() {}
                }
                '\'' | '"' => {
                    let quote = c;
                    self.word_mut();

                    loop {
                        match chars.next() {
                            Some(c) if c == quote => break,
                            Some('\\') => match chars.next() {
                                Some(escaped) if escaped != '\n' => self.push(escaped),
                                _ => return Err((self.entry_line, "unterminated quote".into())),
                            },
                            Some('\n') | None => {
                                return Err((self.entry_line, "unterminated quote".into()))
                            }
                            Some(c) => self.push(c),
                        }
                    }
                }
                c if c.is_whitespace() => self.end_word(),
                c => self.push(c),
            }
        }

        self.end_entry();
        Ok(self.entries)
    }
}
