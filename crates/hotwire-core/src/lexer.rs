//! Source scanner for HMR analysis.
//!
//! Extracts what the module graph needs from transformed JavaScript without a
//! full parse: import specifiers with the bindings they pull in, export names,
//! and the arguments of `import.meta.hot.accept` / `acceptExports` calls.
//!
//! Accept arguments must be string literals (or an array of them) so the
//! server can link accepted dependencies before the module ever runs. Anything
//! else is reported as [`Error::AcceptUsage`].

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};

/// One import of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    /// Specifier exactly as written.
    pub specifier: String,
    /// Imported names: `default`, `*` for a namespace, or the export name.
    pub bindings: HashSet<String>,
    pub dynamic: bool,
}

/// Result of scanning one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAnalysis {
    /// Imports in first-appearance order, one record per specifier.
    pub imports: Vec<ImportRecord>,
    pub exports: Vec<String>,
    /// Specifiers passed to `hot.accept(dep)` / `hot.accept([deps])`.
    pub accepted_deps: Vec<String>,
    /// Names passed to `hot.acceptExports`.
    pub accepted_exports: Option<HashSet<String>>,
    pub is_self_accepting: bool,
    /// The module references `import.meta.hot`.
    pub has_hmr: bool,
}

impl ModuleAnalysis {
    /// Bindings of every static import, keyed by specifier.
    #[must_use]
    pub fn imported_bindings(&self) -> HashMap<String, HashSet<String>> {
        self.imports
            .iter()
            .filter(|record| !record.dynamic)
            .map(|record| (record.specifier.clone(), record.bindings.clone()))
            .collect()
    }
}

/// Scan a transformed JavaScript module.
pub fn analyze_module(code: &str) -> Result<ModuleAnalysis> {
    let mut scanner = Scanner {
        code,
        bytes: code.as_bytes(),
        analysis: ModuleAnalysis::default(),
        import_index: HashMap::new(),
    };
    scanner.run()?;

    let mut analysis = scanner.analysis;
    if let Some(accepted) = &analysis.accepted_exports {
        // Accepting every export is the same as accepting the module.
        if !accepted.is_empty() && analysis.exports.iter().all(|e| accepted.contains(e)) {
            analysis.is_self_accepting = true;
        }
    }
    Ok(analysis)
}

/// `@import` targets of a stylesheet, in order.
#[must_use]
pub fn analyze_stylesheet(code: &str) -> Vec<String> {
    let mut imports = Vec::new();
    let mut rest = code;
    while let Some(idx) = rest.find("@import") {
        rest = rest[idx + "@import".len()..].trim_start();
        let target = rest.strip_prefix("url(").unwrap_or(rest).trim_start();
        let spec = match target.as_bytes().first() {
            Some(&q @ (b'"' | b'\'')) => target[1..].find(q as char).map(|end| &target[1..=end]),
            Some(_) if target.len() < rest.len() => target.find(')').map(|end| target[..end].trim()),
            _ => None,
        };
        if let Some(spec) = spec.filter(|s| !s.is_empty()) {
            imports.push(spec.to_string());
        }
    }
    imports
}

struct Scanner<'a> {
    code: &'a str,
    bytes: &'a [u8],
    analysis: ModuleAnalysis,
    import_index: HashMap<String, usize>,
}

impl<'a> Scanner<'a> {
    fn run(&mut self) -> Result<()> {
        let len = self.bytes.len();
        let mut i = 0;
        while i < len {
            let b = self.bytes[i];
            if b == b'/' && self.bytes.get(i + 1) == Some(&b'/') {
                i = self.find_from(i, b'\n').unwrap_or(len);
                continue;
            }
            if b == b'/' && self.bytes.get(i + 1) == Some(&b'*') {
                i = self.code[i + 2..].find("*/").map_or(len, |end| i + 2 + end + 2);
                continue;
            }
            if self.at_keyword(i, "import") {
                i = self.scan_import(i + "import".len())?;
                continue;
            }
            if self.at_keyword(i, "export") {
                i = self.scan_export(i + "export".len());
                continue;
            }
            i += 1;
        }
        Ok(())
    }

    fn at_keyword(&self, pos: usize, keyword: &str) -> bool {
        if !self.bytes[pos..].starts_with(keyword.as_bytes()) {
            return false;
        }
        if pos > 0 && (is_ident(self.bytes[pos - 1]) || self.bytes[pos - 1] == b'.') {
            return false;
        }
        !matches!(self.bytes.get(pos + keyword.len()), Some(&b) if is_ident(b))
    }

    fn find_from(&self, pos: usize, byte: u8) -> Option<usize> {
        self.bytes[pos..]
            .iter()
            .position(|&b| b == byte)
            .map(|off| pos + off)
    }

    fn skip_ws(&self, mut pos: usize) -> usize {
        while pos < self.bytes.len() && self.bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        pos
    }

    /// Read the quoted literal starting at `pos`. Returns the contents and
    /// the position after the closing quote.
    fn literal(&self, pos: usize) -> Option<(&'a str, usize)> {
        let code = self.code;
        let quote = *self.bytes.get(pos)?;
        if !matches!(quote, b'"' | b'\'' | b'`') {
            return None;
        }
        let mut i = pos + 1;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\\' => i += 2,
                b if b == quote => return Some((&code[pos + 1..i], i + 1)),
                _ => i += 1,
            }
        }
        None
    }

    /// Position of the next quote that starts a `from` specifier, if the
    /// statement text before it ends in `from`.
    fn from_clause(&self, pos: usize) -> Option<(&'a str, usize)> {
        let code = self.code;
        let quote = self.bytes[pos..]
            .iter()
            .position(|&b| matches!(b, b'"' | b'\'' | b';'))
            .map(|off| pos + off)?;
        if self.bytes[quote] == b';' {
            return None;
        }
        let clause = code[pos..quote].trim_end().strip_suffix("from")?;
        Some((clause, quote))
    }

    fn add_import(&mut self, specifier: &str, bindings: HashSet<String>, dynamic: bool) {
        if let Some(&idx) = self.import_index.get(specifier) {
            let record = &mut self.analysis.imports[idx];
            record.bindings.extend(bindings);
            record.dynamic &= dynamic;
            return;
        }
        self.import_index
            .insert(specifier.to_string(), self.analysis.imports.len());
        self.analysis.imports.push(ImportRecord {
            specifier: specifier.to_string(),
            bindings,
            dynamic,
        });
    }

    fn add_export(&mut self, name: &str) {
        if !name.is_empty() && !self.analysis.exports.iter().any(|e| e == name) {
            self.analysis.exports.push(name.to_string());
        }
    }

    fn scan_import(&mut self, after_keyword: usize) -> Result<usize> {
        let bytes = self.bytes;
        let pos = self.skip_ws(after_keyword);
        match bytes.get(pos) {
            Some(b'(') => {
                let start = self.skip_ws(pos + 1);
                match self.literal(start) {
                    Some((spec, end)) => {
                        let spec = spec.to_string();
                        self.add_import(&spec, HashSet::new(), true);
                        Ok(end)
                    }
                    None => Ok(pos + 1),
                }
            }
            Some(b'.') => self.scan_import_meta(pos),
            Some(b'"' | b'\'') => match self.literal(pos) {
                Some((spec, end)) => {
                    let spec = spec.to_string();
                    self.add_import(&spec, HashSet::new(), false);
                    Ok(end)
                }
                None => Ok(pos),
            },
            Some(_) => match self.from_clause(pos) {
                Some((clause, quote)) => {
                    let bindings = import_clause_bindings(clause);
                    let Some((spec, end)) = self.literal(quote) else {
                        return Ok(quote);
                    };
                    let spec = spec.to_string();
                    self.add_import(&spec, bindings, false);
                    Ok(end)
                }
                None => Ok(pos),
            },
            None => Ok(pos),
        }
    }

    fn scan_import_meta(&mut self, pos: usize) -> Result<usize> {
        let code = self.code;
        let rest = &code[pos..];
        let Some(after_hot) = rest.strip_prefix(".meta.hot") else {
            return Ok(pos + 1);
        };
        self.analysis.has_hmr = true;
        let hot_end = pos + ".meta.hot".len();

        let (exports_only, method_len) = if after_hot.starts_with(".acceptExports") {
            (true, ".acceptExports".len())
        } else if after_hot.starts_with(".accept") && !after_hot[7..].starts_with(is_ident_char) {
            (false, ".accept".len())
        } else {
            return Ok(hot_end);
        };

        let call = self.skip_ws(hot_end + method_len);
        if self.bytes.get(call) != Some(&b'(') {
            return Ok(call);
        }

        let mut deps = Vec::new();
        let self_accepts = lex_accepted_deps(self.code, call + 1, &mut deps)?;
        if exports_only {
            if !deps.is_empty() {
                self.analysis
                    .accepted_exports
                    .get_or_insert_with(HashSet::new)
                    .extend(deps);
            }
        } else if self_accepts {
            self.analysis.is_self_accepting = true;
        } else {
            for dep in deps {
                if !self.analysis.accepted_deps.contains(&dep) {
                    self.analysis.accepted_deps.push(dep);
                }
            }
        }
        Ok(call + 1)
    }

    fn scan_export(&mut self, after_keyword: usize) -> usize {
        let code = self.code;
        let pos = self.skip_ws(after_keyword);
        let rest = &code[pos..];

        if rest.starts_with("default") {
            self.add_export("default");
            return pos + "default".len();
        }

        if rest.starts_with('{') || rest.starts_with('*') {
            let (clause, spec) = match self.from_clause(pos) {
                Some((clause, quote)) => (clause, self.literal(quote)),
                None => {
                    let end = self.find_from(pos, b'}').map_or(pos + 1, |end| end + 1);
                    (&code[pos..end], None)
                }
            };

            let mut imported = HashSet::new();
            if let Some(star) = clause.trim().strip_prefix('*') {
                imported.insert("*".to_string());
                if let Some(alias) = star.trim().strip_prefix("as") {
                    self.add_export(alias.trim());
                }
            } else {
                for (local, exported) in braced_names(clause) {
                    imported.insert(local.to_string());
                    self.add_export(exported);
                }
            }

            return match spec {
                Some((spec, end)) => {
                    let spec = spec.to_string();
                    self.add_import(&spec, imported, false);
                    end
                }
                None => pos + clause.len().max(1),
            };
        }

        let mut decl = rest;
        for keyword in ["async", "function", "class", "const", "let", "var"] {
            if let Some(after) = decl.strip_prefix(keyword) {
                if after.starts_with(|c: char| c.is_whitespace() || c == '*') {
                    decl = after.trim_start().trim_start_matches('*').trim_start();
                }
            }
        }
        if decl.len() < rest.len() {
            let name_len = decl.bytes().take_while(|&b| is_ident(b)).count();
            self.add_export(&decl[..name_len]);
        }
        pos
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    InCall,
    InArray,
    InString(u8),
}

/// Lex the arguments of an accept call starting right after `(`.
///
/// Returns `true` when the call accepts the module itself (no dependency
/// argument). Dependency literals are pushed to `deps`.
fn lex_accepted_deps(code: &str, start: usize, deps: &mut Vec<String>) -> Result<bool> {
    let bytes = code.as_bytes();
    let mut state = LexState::InCall;
    let mut prev = LexState::InCall;
    let mut dep_start = start;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        match state {
            LexState::InCall | LexState::InArray => {
                if matches!(b, b'\'' | b'"' | b'`') {
                    prev = state;
                    state = LexState::InString(b);
                    dep_start = i + 1;
                } else if b.is_ascii_whitespace() {
                } else if state == LexState::InCall {
                    if b == b'[' {
                        state = LexState::InArray;
                    } else {
                        return Ok(true);
                    }
                } else if b == b']' {
                    return Ok(false);
                } else if b != b',' {
                    return Err(Error::AcceptUsage { pos: i });
                }
            }
            LexState::InString(quote) => {
                if b == quote {
                    deps.push(code[dep_start..i].to_string());
                    if prev == LexState::InCall {
                        return Ok(false);
                    }
                    state = prev;
                } else if quote == b'`' && b == b'$' && bytes.get(i + 1) == Some(&b'{') {
                    return Err(Error::AcceptUsage { pos: i });
                }
            }
        }
    }
    Ok(false)
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// `(imported, local)` pairs of a `{ a, b as c }` list.
fn braced_names(clause: &str) -> impl Iterator<Item = (&str, &str)> {
    let inner = clause
        .find('{')
        .and_then(|start| {
            let end = clause[start..].find('}')? + start;
            Some(&clause[start + 1..end])
        })
        .unwrap_or("");
    inner.split(',').filter_map(|part| {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        Some(match part.split_once(" as ") {
            Some((imported, local)) => (imported.trim(), local.trim()),
            None => (part, part),
        })
    })
}

fn import_clause_bindings(clause: &str) -> HashSet<String> {
    let mut bindings = HashSet::new();
    let clause = clause.trim();

    let head = match clause.find(|c| c == '{' || c == '*') {
        Some(idx) => {
            if clause[idx..].starts_with('*') {
                bindings.insert("*".to_string());
            } else {
                bindings.extend(braced_names(clause).map(|(imported, _)| imported.to_string()));
            }
            &clause[..idx]
        }
        None => clause,
    };
    if !head.trim().trim_end_matches(',').trim().is_empty() {
        bindings.insert("default".to_string());
    }
    bindings
}
