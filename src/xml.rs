// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tag-tree parser for `DiskDescriptor.xml`.
//!
//! The descriptor uses a small, fully textual XML subset: a declaration,
//! case-sensitive element names, decimal or string leaf values and no
//! meaningful attributes. Some writers pad the file with trailing NUL
//! bytes; those are ignored. This parser covers exactly that subset.

use crate::error::{PhdError, Result};

/// One element of the descriptor tag tree.
#[derive(Debug, PartialEq)]
pub struct XmlTag {
    pub name: String,
    pub value: String,
    pub children: Vec<XmlTag>,
}

impl XmlTag {
    /// First child with the given (case-sensitive) name.
    pub fn child(&self, name: &str) -> Option<&XmlTag> {
        self.children.iter().find(|child| child.name == name)
    }

    /// All children with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlTag> {
        self.children.iter().filter(move |child| child.name == name)
    }
}

/// Parses a descriptor document and returns its root tag.
pub fn parse(data: &[u8]) -> Result<XmlTag> {
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0 {
        end -= 1;
    }
    let text = std::str::from_utf8(&data[..end])
        .map_err(|_| PhdError::InvalidFormat("descriptor is not valid UTF-8".to_string()))?;

    let mut parser = Parser { text: text.as_bytes(), position: 0 };
    parser.skip_misc()?;
    let root = parser.parse_element()?;
    parser.skip_misc()?;
    if parser.position != parser.text.len() {
        return Err(parser.error("trailing content after root element"));
    }
    Ok(root)
}

struct Parser<'a> {
    text: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> PhdError {
        PhdError::InvalidFormat(format!("{} at offset {}", message, self.position))
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.position).copied()
    }

    fn starts_with(&self, prefix: &[u8]) -> bool {
        self.text[self.position..].starts_with(prefix)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c == b' ' || c == b'\t' || c == b'\r' || c == b'\n' {
                self.position += 1;
            } else {
                break;
            }
        }
    }

    /// Skips whitespace, the XML declaration and comments between elements.
    fn skip_misc(&mut self) -> Result<()> {
        loop {
            self.skip_whitespace();
            if self.starts_with(b"<?") {
                self.skip_until(b"?>")?;
            } else if self.starts_with(b"<!--") {
                self.skip_until(b"-->")?;
            } else {
                return Ok(());
            }
        }
    }

    fn skip_until(&mut self, terminator: &[u8]) -> Result<()> {
        while self.position < self.text.len() {
            if self.starts_with(terminator) {
                self.position += terminator.len();
                return Ok(());
            }
            self.position += 1;
        }
        Err(self.error("unterminated markup"))
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.position;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.' || c == b':' {
                self.position += 1;
            } else {
                break;
            }
        }
        if self.position == start {
            return Err(self.error("expected element name"));
        }
        Ok(String::from_utf8_lossy(&self.text[start..self.position]).into_owned())
    }

    fn parse_element(&mut self) -> Result<XmlTag> {
        if self.peek() != Some(b'<') {
            return Err(self.error("expected element start"));
        }
        self.position += 1;
        let name = self.parse_name()?;

        // Attributes carry no information in a disk descriptor; scan past
        // them up to the tag close.
        let mut empty = false;
        loop {
            match self.peek() {
                Some(b'>') => {
                    self.position += 1;
                    break;
                }
                Some(b'/') if self.starts_with(b"/>") => {
                    self.position += 2;
                    empty = true;
                    break;
                }
                Some(_) => self.position += 1,
                None => return Err(self.error("unterminated start tag")),
            }
        }
        let mut tag = XmlTag { name, value: String::new(), children: Vec::new() };
        if empty {
            return Ok(tag);
        }

        let mut text = String::new();
        loop {
            if self.starts_with(b"</") {
                self.position += 2;
                let close_name = self.parse_name()?;
                self.skip_whitespace();
                if self.peek() != Some(b'>') {
                    return Err(self.error("unterminated end tag"));
                }
                self.position += 1;
                if close_name != tag.name {
                    return Err(self.error("mismatched end tag"));
                }
                tag.value = text.trim().to_string();
                return Ok(tag);
            } else if self.starts_with(b"<!--") {
                self.skip_until(b"-->")?;
            } else if self.peek() == Some(b'<') {
                tag.children.push(self.parse_element()?);
            } else if self.peek().is_some() {
                let start = self.position;
                while let Some(c) = self.peek() {
                    if c == b'<' {
                        break;
                    }
                    self.position += 1;
                }
                text.push_str(&decode_entities(
                    &String::from_utf8_lossy(&self.text[start..self.position]),
                ));
            } else {
                return Err(self.error("unterminated element"));
            }
        }
    }
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut decoded = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(index) = rest.find('&') {
        decoded.push_str(&rest[..index]);
        rest = &rest[index..];
        let mut replaced = false;
        for (entity, replacement) in
            &[("&amp;", "&"), ("&lt;", "<"), ("&gt;", ">"), ("&quot;", "\""), ("&apos;", "'")]
        {
            if rest.starts_with(entity) {
                decoded.push_str(replacement);
                rest = &rest[entity.len()..];
                replaced = true;
                break;
            }
        }
        if !replaced {
            decoded.push('&');
            rest = &rest[1..];
        }
    }
    decoded.push_str(rest);
    decoded
}
