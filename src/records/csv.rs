//! # CSV Document Codec
//!
//! Text serialization for schema-light documents, one record per line:
//!
//! ```text
//! Person@name:"Alice",age:42,score:3.5,boss:#4:12,tags:["a","b"],note:
//! ```
//!
//! An optional class name precedes `@`; fields follow as `name:value` pairs
//! separated by commas. Value forms:
//!
//! | Form            | Type                                  |
//! |-----------------|---------------------------------------|
//! | *(empty)*       | null                                  |
//! | `true`/`false`  | boolean                               |
//! | `42`, `-7`      | integer                               |
//! | `3.5`, `-0.25`  | float (always contains `.`)           |
//! | `"..."`         | string (`\"` and `\\` escaped)        |
//! | `#12:0`         | record link (cluster:position)        |
//! | `[v,v,...]`     | list of any of the above              |
//!
//! This codec is a collaborator of the record storage layer and is fully
//! independent of the tree engine: documents serialized here are what the
//! surrounding layer stores as record payloads.

use eyre::{bail, ensure, Result};

/// Separator between the class name and the first field.
const CLASS_SEPARATOR: char = '@';
const FIELD_VALUE_SEPARATOR: char = ':';
const RECORD_SEPARATOR: char = ',';

/// A link to another record by cluster and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId {
    pub cluster: i32,
    pub position: i64,
}

impl RecordId {
    pub fn new(cluster: i32, position: i64) -> Self {
        Self { cluster, position }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

/// One field value of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Link(RecordId),
    List(Vec<FieldValue>),
}

/// A schema-light record: an optional class name plus ordered named fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    class: Option<String>,
    fields: Vec<(String, FieldValue)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(class: &str) -> Self {
        Self {
            class: Some(class.to_string()),
            fields: Vec::new(),
        }
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Sets a field, replacing an existing one of the same name while
    /// keeping its position.
    pub fn set(&mut self, name: &str, value: FieldValue) -> &mut Self {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Serializes the document to its CSV line form.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();

        if let Some(class) = &self.class {
            out.push_str(class);
            out.push(CLASS_SEPARATOR);
        }

        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(RECORD_SEPARATOR);
            }
            out.push_str(name);
            out.push(FIELD_VALUE_SEPARATOR);
            write_value(&mut out, value);
        }

        out
    }

    /// Parses a document from its CSV line form.
    pub fn from_csv(input: &str) -> Result<Self> {
        let mut document = Document::new();
        let mut rest = input;

        if let Some(at) = find_unquoted(input, CLASS_SEPARATOR) {
            let class = &input[..at];
            ensure!(
                !class.is_empty() && !class.contains([FIELD_VALUE_SEPARATOR, RECORD_SEPARATOR]),
                "invalid class name {:?}",
                class
            );
            document.class = Some(class.to_string());
            rest = &input[at + 1..];
        }

        if rest.is_empty() {
            return Ok(document);
        }

        let mut parser = Parser { input: rest, pos: 0 };
        loop {
            let name = parser.take_field_name()?;
            let value = parser.parse_value()?;
            document.fields.push((name, value));

            if parser.at_end() {
                break;
            }
            parser.expect(RECORD_SEPARATOR)?;
        }

        Ok(document)
    }
}

fn write_value(out: &mut String, value: &FieldValue) {
    match value {
        FieldValue::Null => {}
        FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        FieldValue::Int(i) => out.push_str(&i.to_string()),
        FieldValue::Float(f) => {
            let text = f.to_string();
            out.push_str(&text);
            // Keep floats distinguishable from integers on the way back.
            if !text.contains('.') {
                out.push_str(".0");
            }
        }
        FieldValue::Text(s) => {
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
        FieldValue::Link(rid) => {
            out.push_str(&rid.to_string());
        }
        FieldValue::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(RECORD_SEPARATOR);
                }
                write_value(out, item);
            }
            out.push(']');
        }
    }
}

/// Position of `needle` in `haystack`, ignoring quoted spans.
fn find_unquoted(haystack: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in haystack.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            _ if c == needle && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += c.len_utf8();
                Ok(())
            }
            other => bail!("expected {:?} at position {}, found {:?}", expected, self.pos, other),
        }
    }

    fn take_field_name(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == FIELD_VALUE_SEPARATOR {
                let name = &self.input[start..self.pos];
                ensure!(!name.is_empty(), "empty field name at position {}", start);
                self.pos += 1;
                return Ok(name.to_string());
            }
            ensure!(
                c != RECORD_SEPARATOR && c != '"',
                "malformed field name at position {}",
                start
            );
            self.pos += c.len_utf8();
        }
        bail!("unterminated field name at position {}", start)
    }

    fn parse_value(&mut self) -> Result<FieldValue> {
        match self.peek() {
            None => Ok(FieldValue::Null),
            Some('"') => self.parse_string(),
            Some('#') => self.parse_link(),
            Some('[') => self.parse_list(),
            Some(c) if c == RECORD_SEPARATOR || c == ']' => Ok(FieldValue::Null),
            Some(_) => self.parse_scalar(),
        }
    }

    fn parse_string(&mut self) -> Result<FieldValue> {
        self.expect('"')?;
        let mut text = String::new();
        let mut escaped = false;

        for (i, c) in self.input[self.pos..].char_indices() {
            if escaped {
                text.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' => {
                    self.pos += i + 1;
                    return Ok(FieldValue::Text(text));
                }
                _ => text.push(c),
            }
        }
        bail!("unterminated string at position {}", self.pos)
    }

    fn parse_link(&mut self) -> Result<FieldValue> {
        self.expect('#')?;
        let token = self.take_scalar_token();
        let (cluster, position) = token
            .split_once(':')
            .ok_or_else(|| eyre::eyre!("malformed record link #{}", token))?;
        Ok(FieldValue::Link(RecordId::new(
            cluster.parse()?,
            position.parse()?,
        )))
    }

    fn parse_list(&mut self) -> Result<FieldValue> {
        self.expect('[')?;
        let mut items = Vec::new();

        if self.peek() == Some(']') {
            self.pos += 1;
            return Ok(FieldValue::List(items));
        }

        loop {
            items.push(self.parse_value()?);
            match self.peek() {
                Some(']') => {
                    self.pos += 1;
                    return Ok(FieldValue::List(items));
                }
                Some(c) if c == RECORD_SEPARATOR => self.pos += 1,
                other => bail!("expected ',' or ']' in list, found {:?}", other),
            }
        }
    }

    fn take_scalar_token(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == RECORD_SEPARATOR || c == ']' {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.input[start..self.pos]
    }

    fn parse_scalar(&mut self) -> Result<FieldValue> {
        let token = self.take_scalar_token();
        match token {
            "true" => Ok(FieldValue::Bool(true)),
            "false" => Ok(FieldValue::Bool(false)),
            _ if token.contains('.') => Ok(FieldValue::Float(token.parse()?)),
            _ => Ok(FieldValue::Int(token.parse()?)),
        }
    }
}
