//! Small structured representation of generated shell code.
//!
//! Hook functions build a [`Script`] out of statements and typed words
//! instead of formatting strings by hand. Quoting happens once, at render
//! time, so a value containing quotes or `$` cannot break out of its word.

use std::fmt;

/// One piece of a double-quoted word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// Literal text, escaped for double quotes.
    Text(String),
    /// Variable expansion, rendered as `${name}`.
    Var(String),
    /// Command substitution, rendered as `$(...)` verbatim.
    Sub(String),
}

/// A double-quoted word built from text and expansions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dq(Vec<Part>);

impl Dq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.0.push(Part::Text(text.into()));
        self
    }

    pub fn var(mut self, name: impl Into<String>) -> Self {
        self.0.push(Part::Var(name.into()));
        self
    }

    pub fn sub(mut self, command: impl Into<String>) -> Self {
        self.0.push(Part::Sub(command.into()));
        self
    }

    fn render(&self) -> String {
        let mut out = String::from("\"");
        for part in &self.0 {
            match part {
                Part::Text(text) => {
                    for c in text.chars() {
                        if matches!(c, '"' | '\\' | '$' | '`') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                }
                Part::Var(name) => {
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                }
                Part::Sub(command) => {
                    out.push_str("$(");
                    out.push_str(command);
                    out.push(')');
                }
            }
        }
        out.push('"');
        out
    }
}

impl From<&str> for Dq {
    fn from(text: &str) -> Self {
        Dq::new().text(text)
    }
}

/// A word in a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word {
    /// Emitted as-is. Used for command names, flags and operators.
    Raw(String),
    /// Single-quoted literal.
    Lit(String),
    /// Double-quoted with expansions.
    Dq(Dq),
}

impl Word {
    fn render(&self) -> String {
        match self {
            Word::Raw(raw) => raw.clone(),
            Word::Lit(text) => single_quote(text),
            Word::Dq(dq) => dq.render(),
        }
    }
}

/// Quote a value so the shell sees it literally.
pub fn single_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// A single command line: words joined by spaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Line(Vec<Word>);

impl Line {
    /// Start a line with a raw command word.
    pub fn cmd(command: impl Into<String>) -> Self {
        Line(vec![Word::Raw(command.into())])
    }

    /// Variable assignment, `name="value"`.
    pub fn assign(name: &str, value: impl Into<Dq>) -> Self {
        Line(vec![Word::Raw(format!("{}={}", name, value.into().render()))])
    }

    /// Raw words appended unquoted.
    pub fn raw(mut self, raw: impl Into<String>) -> Self {
        self.0.push(Word::Raw(raw.into()));
        self
    }

    pub fn lit(mut self, text: impl Into<String>) -> Self {
        self.0.push(Word::Lit(text.into()));
        self
    }

    pub fn dq(mut self, dq: impl Into<Dq>) -> Self {
        self.0.push(Word::Dq(dq.into()));
        self
    }

    /// Append the words of another line.
    pub fn then(mut self, other: Line) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(Word::render)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A shell statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Line(Line),
    /// Verbatim text line, not re-quoted.
    Raw(String),
    Comment(String),
    Blank,
    /// `if`/`elif`/`else` chain. Each branch is (condition, body).
    If {
        branches: Vec<(Line, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },
    /// Counted loop, `var` running from 1 to `count` inclusive.
    Loop {
        var: String,
        count: u64,
        body: Vec<Stmt>,
    },
}

impl Stmt {
    pub fn if_then(cond: Line, body: Vec<Stmt>) -> Self {
        Stmt::If {
            branches: vec![(cond, body)],
            otherwise: None,
        }
    }

    fn render_into(&self, depth: usize, out: &mut Vec<String>) {
        let pad = "    ".repeat(depth);
        match self {
            Stmt::Line(line) => out.push(format!("{}{}", pad, line.render())),
            Stmt::Raw(raw) => {
                if raw.is_empty() {
                    out.push(String::new());
                } else {
                    out.push(format!("{}{}", pad, raw));
                }
            }
            Stmt::Comment(text) => out.push(format!("{}# {}", pad, text)),
            Stmt::Blank => out.push(String::new()),
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (i, (cond, body)) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { "elif" };
                    out.push(format!("{}{} {}; then", pad, keyword, cond.render()));
                    render_block(body, depth + 1, out);
                }
                if let Some(body) = otherwise {
                    out.push(format!("{}else", pad));
                    render_block(body, depth + 1, out);
                }
                out.push(format!("{}fi", pad));
            }
            Stmt::Loop { var, count, body } => {
                out.push(format!("{}{}=0", pad, var));
                out.push(format!(
                    "{}while [ \"$(({} += 1))\" -le {} ]; do",
                    pad, var, count
                ));
                render_block(body, depth + 1, out);
                out.push(format!("{}done", pad));
            }
        }
    }
}

fn render_block(body: &[Stmt], depth: usize, out: &mut Vec<String>) {
    if body.is_empty() {
        out.push(format!("{}:", "    ".repeat(depth)));
        return;
    }
    for stmt in body {
        stmt.render_into(depth, out);
    }
}

impl From<Line> for Stmt {
    fn from(line: Line) -> Self {
        Stmt::Line(line)
    }
}

/// Ordered list of statements produced by one hook function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script(Vec<Stmt>);

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script from verbatim text. Common leading indentation is stripped
    /// and leading/trailing blank lines are dropped.
    pub fn raw(text: &str) -> Self {
        Script(dedent(text).into_iter().map(Stmt::Raw).collect())
    }

    /// Single-line script.
    pub fn line(line: Line) -> Self {
        Script(vec![Stmt::Line(line)])
    }

    pub fn push(&mut self, stmt: impl Into<Stmt>) {
        self.0.push(stmt.into());
    }

    pub fn extend(&mut self, other: Script) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn statements(&self) -> &[Stmt] {
        &self.0
    }

    pub fn into_statements(self) -> Vec<Stmt> {
        self.0
    }

    /// Render to text lines, four-space indentation per block level.
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        for stmt in &self.0 {
            stmt.render_into(0, &mut out);
        }
        out
    }

    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}

impl From<Vec<Stmt>> for Script {
    fn from(stmts: Vec<Stmt>) -> Self {
        Script(stmts)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn dedent(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    let (Some(start), Some(end)) = (start, end) else {
        return Vec::new();
    };
    let body = &lines[start..=end];
    let indent = body
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    body.iter()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                l[indent..].trim_end().to_string()
            }
        })
        .collect()
}
