//! The preprocessor.
//!
//! Expands `.include` (with a nesting limit and cycle detection), the
//! conditional blocks `.if` / `.ifdef` / `.ifndef` / `.else` / `.endif`,
//! and `.macro` / `.endm` textual macros with `\name` parameters. Block
//! comments are stripped here so the line lexer never sees them. The
//! output is a flat list of lines, each tagged with its original file and
//! line number so diagnostics point at real source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::diag::{Diagnostics, Pos};
use crate::expr::{self, EvalError, Resolver};
use crate::lexer::{lex_line, Cursor, Token};

/// Source access for `.include`.
pub trait SourceProvider {
    /// Read the file at `path`, referenced from the file `from`.
    fn read(&self, path: &str, from: &str) -> Result<String, String>;
}

/// Reads includes from the filesystem, relative to the including file.
pub struct FsProvider;

impl SourceProvider for FsProvider {
    fn read(&self, path: &str, from: &str) -> Result<String, String> {
        let resolved: PathBuf = Path::new(from)
            .parent()
            .map_or_else(|| PathBuf::from(path), |dir| dir.join(path));
        std::fs::read_to_string(&resolved)
            .map_err(|e| format!("cannot read '{}': {e}", resolved.display()))
    }
}

/// In-memory provider for tests and embedded sources.
#[derive(Default)]
pub struct MapProvider {
    files: HashMap<String, String>,
}

impl MapProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, source: &str) {
        self.files.insert(name.to_string(), source.to_string());
    }
}

impl SourceProvider for MapProvider {
    fn read(&self, path: &str, _from: &str) -> Result<String, String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| format!("no such file '{path}'"))
    }
}

/// One preprocessed line with its origin.
#[derive(Debug, Clone)]
pub struct Line {
    pub file: String,
    pub line: u32,
    pub text: String,
}

struct Macro {
    params: Vec<String>,
    body: Vec<Line>,
}

/// Condition-stack entry.
struct CondFrame {
    /// Whether lines in the current arm are emitted.
    active: bool,
    /// Whether the enclosing context was active.
    parent_active: bool,
    seen_else: bool,
    pos: Pos,
}

struct DefineResolver<'a> {
    defines: &'a HashMap<String, i64>,
}

impl Resolver for DefineResolver<'_> {
    fn symbol(&self, name: &str) -> Result<i64, EvalError> {
        self.defines
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::Undefined(name.to_string()))
    }
    fn local(&self, n: u32, forward: bool) -> Result<i64, EvalError> {
        Err(EvalError::NoLocalLabel { n, forward })
    }
    fn here(&self) -> Result<i64, EvalError> {
        Err(EvalError::NoLocation)
    }
}

/// Replace `/* ... */` comments with spaces, newlines preserved.
fn strip_block_comments(source: &str, file: &str, diags: &mut Diagnostics) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut line = 1u32;
    let mut in_comment_since = None;
    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
            out.push('\n');
            continue;
        }
        if in_comment_since.is_some() {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                out.push_str("  ");
                in_comment_since = None;
            } else {
                out.push(' ');
            }
        } else if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            out.push_str("  ");
            in_comment_since = Some(line);
        } else {
            out.push(c);
        }
    }
    if let Some(start) = in_comment_since {
        diags.report(Pos::new(file, start, 1), "unterminated block comment");
    }
    out
}

/// First word of a line, lowercased, skipping a leading `label:` prefix.
/// Returns (word, rest-after-word, had-label-prefix-text).
fn split_leading(text: &str) -> (String, &str, &str) {
    let trimmed = text.trim_start();
    let mut prefix_end = 0;
    // Skip any number of `ident:` / `digits:` label definitions.
    let bytes = trimmed.as_bytes();
    let mut i = 0;
    loop {
        let start = i;
        while i < bytes.len()
            && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'$' | b'.'))
        {
            i += 1;
        }
        if i > start && i < bytes.len() && bytes[i] == b':' {
            i += 1;
            while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
                i += 1;
            }
            prefix_end = i;
        } else {
            break;
        }
    }
    let after_labels = &trimmed[prefix_end..];
    let word_end = after_labels
        .find(|c: char| c.is_whitespace())
        .unwrap_or(after_labels.len());
    let word = after_labels[..word_end].to_ascii_lowercase();
    (word, after_labels[word_end..].trim_start(), &trimmed[..prefix_end])
}

/// Split a macro argument list on top-level commas.
fn split_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut in_str = false;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '"' => {
                in_str = !in_str;
                current.push(c);
            }
            '[' | '{' | '(' if !in_str => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' | ')' if !in_str => {
                depth -= 1;
                current.push(c);
            }
            ',' if !in_str && depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

pub struct Preprocessor<'a> {
    provider: &'a dyn SourceProvider,
    max_depth: u32,
    macros: HashMap<String, Macro>,
    defines: HashMap<String, i64>,
    include_stack: Vec<String>,
    conds: Vec<CondFrame>,
    out: Vec<Line>,
}

impl<'a> Preprocessor<'a> {
    #[must_use]
    pub fn new(provider: &'a dyn SourceProvider, max_depth: u32) -> Self {
        Self {
            provider,
            max_depth,
            macros: HashMap::new(),
            defines: HashMap::new(),
            include_stack: Vec::new(),
            conds: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Run the preprocessor over a whole source file.
    pub fn run(mut self, source: &str, file: &str, diags: &mut Diagnostics) -> Vec<Line> {
        self.include_stack.push(file.to_string());
        self.process_source(source, file, 0, diags);
        for frame in self.conds.drain(..).collect::<Vec<_>>() {
            diags.report_with(
                frame.pos,
                "unterminated conditional block",
                Some("add a matching .endif".to_string()),
            );
        }
        self.out
    }

    fn active(&self) -> bool {
        self.conds.last().is_none_or(|f| f.active)
    }

    fn process_source(&mut self, source: &str, file: &str, depth: u32, diags: &mut Diagnostics) {
        let stripped = strip_block_comments(source, file, diags);
        let lines: Vec<Line> = stripped
            .lines()
            .enumerate()
            .map(|(idx, text)| Line {
                file: file.to_string(),
                line: idx as u32 + 1,
                text: text.to_string(),
            })
            .collect();
        self.process_lines(&lines, depth, diags);
    }

    fn process_lines(&mut self, lines: &[Line], depth: u32, diags: &mut Diagnostics) {
        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            i += 1;
            let (word, rest, label_prefix) = split_leading(&line.text);
            let pos = Pos::new(&line.file, line.line, 1);

            // Conditional structure is tracked even in inactive regions.
            match word.as_str() {
                ".if" | ".ifdef" | ".ifndef" => {
                    let parent_active = self.active();
                    let active = parent_active && self.eval_condition(&word, rest, &pos, diags);
                    self.conds.push(CondFrame { active, parent_active, seen_else: false, pos });
                    continue;
                }
                ".else" => {
                    match self.conds.last_mut() {
                        Some(frame) if !frame.seen_else => {
                            frame.seen_else = true;
                            frame.active = frame.parent_active && !frame.active;
                        }
                        _ => diags.report(pos, ".else without .if"),
                    }
                    continue;
                }
                ".endif" => {
                    if self.conds.pop().is_none() {
                        diags.report(pos, ".endif without .if");
                    }
                    continue;
                }
                _ => {}
            }

            if !self.active() {
                continue;
            }

            match word.as_str() {
                ".include" => self.handle_include(rest, &pos, depth, diags),
                ".macro" => i = self.collect_macro(lines, i, rest, &pos, diags),
                ".endm" => diags.report(pos, ".endm without .macro"),
                _ => {
                    // Track evaluable .equ/.set for later .if conditions.
                    if word == ".equ" || word == ".set" {
                        self.track_define(rest, &line.file, line.line, diags);
                    }
                    if !word.is_empty() && !word.starts_with('.') {
                        if let Some(expanded) =
                            self.expand_macro(&word, rest, label_prefix, line, depth, diags)
                        {
                            self.process_lines(&expanded, depth + 1, diags);
                            continue;
                        }
                    }
                    self.out.push(line.clone());
                }
            }
        }
    }

    fn eval_condition(
        &self,
        word: &str,
        rest: &str,
        pos: &Pos,
        diags: &mut Diagnostics,
    ) -> bool {
        if word == ".ifdef" || word == ".ifndef" {
            let name = rest.trim();
            let defined = self.defines.contains_key(name);
            return if word == ".ifdef" { defined } else { !defined };
        }
        let toks = lex_line(rest, &pos.file, pos.line, diags);
        let mut cur = Cursor::new(&toks);
        match expr::parse(&mut cur) {
            Ok(e) => match expr::eval(&e, &DefineResolver { defines: &self.defines }) {
                Ok(v) => v != 0,
                Err(err) => {
                    diags.report(pos.clone(), format!(".if condition: {err}"));
                    false
                }
            },
            Err(err) => {
                diags.report(pos.clone(), format!(".if condition: {err}"));
                false
            }
        }
    }

    fn track_define(&mut self, rest: &str, file: &str, line: u32, diags: &mut Diagnostics) {
        let toks = lex_line(rest, file, line, diags);
        let mut cur = Cursor::new(&toks);
        let Some(Token::Ident(name)) = cur.next() else { return };
        let name = name.clone();
        if !cur.eat(&Token::Comma) {
            return;
        }
        if let Ok(e) = expr::parse(&mut cur) {
            if let Ok(v) = expr::eval(&e, &DefineResolver { defines: &self.defines }) {
                self.defines.insert(name, v);
            }
        }
    }

    fn handle_include(&mut self, rest: &str, pos: &Pos, depth: u32, diags: &mut Diagnostics) {
        let toks = lex_line(rest, &pos.file, pos.line, diags);
        let Some(Token::Str(path_bytes)) = toks.first().map(|t| &t.tok) else {
            diags.report(pos.clone(), ".include expects a quoted path");
            return;
        };
        let path = String::from_utf8_lossy(path_bytes).into_owned();
        if depth + 1 > self.max_depth {
            diags.report(
                pos.clone(),
                format!("include depth exceeds {}", self.max_depth),
            );
            return;
        }
        if self.include_stack.contains(&path) {
            diags.report(pos.clone(), format!("circular include of '{path}'"));
            return;
        }
        match self.provider.read(&path, &pos.file) {
            Ok(source) => {
                self.include_stack.push(path.clone());
                self.process_source(&source, &path, depth + 1, diags);
                self.include_stack.pop();
            }
            Err(e) => diags.report(pos.clone(), e),
        }
    }

    /// Collect a `.macro` body. Returns the index after `.endm`.
    fn collect_macro(
        &mut self,
        lines: &[Line],
        mut i: usize,
        header: &str,
        pos: &Pos,
        diags: &mut Diagnostics,
    ) -> usize {
        let mut parts = split_args(header);
        if parts.is_empty() {
            diags.report(pos.clone(), ".macro needs a name");
            return i;
        }
        // The name may share its argument with whitespace: `.macro name p1, p2`.
        let first = parts.remove(0);
        let mut head_words = first.split_whitespace();
        let Some(name) = head_words.next().map(str::to_string) else {
            diags.report(pos.clone(), ".macro needs a name");
            return i;
        };
        let mut params: Vec<String> = head_words.map(str::to_string).collect();
        params.extend(parts);

        let mut body = Vec::new();
        loop {
            let Some(line) = lines.get(i) else {
                diags.report_with(
                    pos.clone(),
                    format!("macro '{name}' has no .endm"),
                    Some("add .endm before end of file".to_string()),
                );
                return i;
            };
            i += 1;
            let (word, _, _) = split_leading(&line.text);
            if word == ".endm" {
                break;
            }
            if word == ".macro" {
                diags.report(Pos::new(&line.file, line.line, 1), "nested .macro is not supported");
            }
            body.push(line.clone());
        }
        self.macros.insert(name, Macro { params, body });
        i
    }

    /// Expand `word rest` if it names a macro. Expanded lines carry the
    /// invocation site so diagnostics point at the caller.
    fn expand_macro(
        &self,
        word: &str,
        rest: &str,
        label_prefix: &str,
        site: &Line,
        depth: u32,
        diags: &mut Diagnostics,
    ) -> Option<Vec<Line>> {
        // Mnemonic lookup is case-insensitive, so macro invocation is too.
        let mac = self
            .macros
            .get(word)
            .or_else(|| self.macros.iter().find(|(k, _)| k.eq_ignore_ascii_case(word)).map(|(_, v)| v))?;
        if depth + 1 > self.max_depth {
            diags.report(
                Pos::new(&site.file, site.line, 1),
                format!("macro expansion depth exceeds {}", self.max_depth),
            );
            return Some(Vec::new());
        }
        let args = split_args(rest);
        let mut lines = Vec::with_capacity(mac.body.len() + 1);
        if !label_prefix.trim().is_empty() {
            lines.push(Line {
                file: site.file.clone(),
                line: site.line,
                text: label_prefix.trim_end().to_string(),
            });
        }
        // Longest names first, so a parameter `a` cannot eat into `\amount`.
        let mut order: Vec<usize> = (0..mac.params.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(mac.params[i].len()));
        for body_line in &mac.body {
            let mut text = body_line.text.clone();
            for &idx in &order {
                let value = args.get(idx).map_or("", String::as_str);
                text = text.replace(&format!("\\{}", mac.params[idx]), value);
            }
            lines.push(Line { file: site.file.clone(), line: site.line, text });
        }
        Some(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp(source: &str) -> (Vec<String>, Vec<crate::diag::Diagnostic>) {
        let provider = MapProvider::new();
        pp_with(source, &provider)
    }

    fn pp_with(source: &str, provider: &dyn SourceProvider) -> (Vec<String>, Vec<crate::diag::Diagnostic>) {
        let mut diags = Diagnostics::new(20);
        let lines = Preprocessor::new(provider, 100).run(source, "main.s", &mut diags);
        (lines.into_iter().map(|l| l.text.trim().to_string()).collect(), diags.into_vec())
    }

    #[test]
    fn conditionals_select_arms() {
        let (lines, diags) = pp(
            ".equ MODE, 2\n.if MODE == 2\nMOV R0, #2\n.else\nMOV R0, #1\n.endif\n",
        );
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(lines, vec![".equ MODE, 2", "MOV R0, #2"]);
    }

    #[test]
    fn ifdef_and_ifndef() {
        let (lines, diags) = pp(
            ".equ HAVE, 1\n.ifdef HAVE\nA\n.endif\n.ifndef MISSING\nB\n.endif\n",
        );
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(lines, vec![".equ HAVE, 1", "A", "B"]);
    }

    #[test]
    fn missing_endif_is_reported() {
        let (_, diags) = pp(".if 1\nMOV R0, #0\n");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("unterminated"));
    }

    #[test]
    fn macro_expansion_substitutes_params() {
        let (lines, diags) = pp(
            ".macro inc reg, amount\nADD \\reg, \\reg, #\\amount\n.endm\ninc R0, 2\ninc R1, 3\n",
        );
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(lines, vec!["ADD R0, R0, #2", "ADD R1, R1, #3"]);
    }

    #[test]
    fn macro_keeps_invocation_label() {
        let (lines, diags) = pp(".macro nopper\nNOP\n.endm\nhere: nopper\n");
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(lines, vec!["here:", "NOP"]);
    }

    #[test]
    fn missing_endm_is_reported() {
        let (_, diags) = pp(".macro broken\nNOP\n");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("no .endm"));
    }

    #[test]
    fn include_expands_and_cycles_fail() {
        let mut provider = MapProvider::new();
        provider.insert("lib.s", "MOV R1, #1\n");
        let (lines, diags) = pp_with(".include \"lib.s\"\nMOV R0, #0\n", &provider);
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(lines, vec!["MOV R1, #1", "MOV R0, #0"]);

        let mut cyclic = MapProvider::new();
        cyclic.insert("a.s", ".include \"b.s\"\n");
        cyclic.insert("b.s", ".include \"a.s\"\n");
        let (_, diags) = pp_with(".include \"a.s\"\n", &cyclic);
        assert!(diags.iter().any(|d| d.message.contains("circular include")));
    }

    #[test]
    fn block_comments_are_stripped() {
        let (lines, diags) = pp("MOV R0, #1 /* comment\nstill comment */ MOV R1, #2\n");
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(lines, vec!["MOV R0, #1", "MOV R1, #2"]);
    }
}
