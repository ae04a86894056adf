use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use parley_core::tools::{Tool, ToolContext, ToolError};

const MAX_SOURCE_BYTES: usize = 256 * 1024;
const MAX_LISTED: usize = 100;

/// Static, dependency-free inspection of a source snippet.
pub struct AnalyzeCodeTool;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Language {
    Rust,
    Python,
    JavaScript,
    Go,
    Unknown,
}

impl Language {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rust" | "rs" => Some(Self::Rust),
            "python" | "py" => Some(Self::Python),
            "javascript" | "js" | "typescript" | "ts" => Some(Self::JavaScript),
            "go" | "golang" => Some(Self::Go),
            _ => None,
        }
    }

    fn detect(source: &str) -> Self {
        let score = |markers: &[&str]| markers.iter().filter(|m| source.contains(*m)).count();
        let candidates = [
            (Self::Rust, score(&["fn ", "let mut ", "impl ", "pub fn", "::", "-> "])),
            (Self::Python, score(&["def ", "import ", "self.", "elif ", "__init__", "None"])),
            (Self::JavaScript, score(&["function ", "const ", "=> ", "console.", "let ", "export "])),
            (Self::Go, score(&["func ", "package ", ":= ", "fmt.", "go func", "chan "])),
        ];
        candidates
            .into_iter()
            .filter(|(_, s)| *s > 0)
            .max_by_key(|(_, s)| *s)
            .map_or(Self::Unknown, |(lang, _)| lang)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Go => "go",
            Self::Unknown => "unknown",
        }
    }

    fn line_comment(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["#"],
            Self::Unknown => &["//", "#"],
            _ => &["//"],
        }
    }

    fn definition_pattern(self) -> &'static Regex {
        match self {
            Self::Rust => &RUST_FN,
            Self::Python => &PYTHON_DEF,
            Self::JavaScript => &JS_FUNCTION,
            Self::Go => &GO_FUNC,
            Self::Unknown => &ANY_FUNCTION,
        }
    }
}

static RUST_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap()
});
static PYTHON_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static JS_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:async\s+)?(?:function\s*\*?\s*([A-Za-z_$][\w$]*)|(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>)",
    )
    .unwrap()
});
static GO_FUNC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static ANY_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:fn|def|func|function)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static TODO_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(TODO|FIXME|XXX|HACK)\b").unwrap());

fn analyze(source: &str, language: Language) -> Value {
    let mut blank = 0usize;
    let mut comment = 0usize;
    let mut definitions = Vec::new();
    let mut markers = Vec::new();
    let prefixes = language.line_comment();
    let pattern = language.definition_pattern();

    for (idx, line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            blank += 1;
            continue;
        }
        if prefixes.iter().any(|p| trimmed.starts_with(p)) {
            comment += 1;
        }
        if let Some(caps) = pattern.captures(line) {
            let name = caps.iter().skip(1).flatten().next().map(|m| m.as_str());
            if let (Some(name), true) = (name, definitions.len() < MAX_LISTED) {
                definitions.push(json!({"name": name, "line": line_no}));
            }
        }
        if let Some(m) = TODO_MARKER.find(line) {
            if markers.len() < MAX_LISTED {
                markers.push(json!({
                    "marker": m.as_str(),
                    "line": line_no,
                    "text": line.trim(),
                }));
            }
        }
    }

    let total = source.lines().count();
    json!({
        "language": language.as_str(),
        "lines": {
            "total": total,
            "blank": blank,
            "comment": comment,
            "code": total - blank - comment,
        },
        "definitions": definitions,
        "markers": markers,
    })
}

#[async_trait]
impl Tool for AnalyzeCodeTool {
    fn name(&self) -> &str {
        "analyze_code"
    }

    fn description(&self) -> &str {
        "Inspect a code snippet: detect its language, count code/comment/blank lines, \
         list function definitions and TODO-style markers"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["code"],
            "additionalProperties": false,
            "properties": {
                "code": {"type": "string", "description": "Source text to analyze"},
                "language": {
                    "type": "string",
                    "description": "Language hint (rust, python, javascript, go); detected when omitted"
                }
            }
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let code = args["code"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("code is required".into()))?;
        if code.len() > MAX_SOURCE_BYTES {
            return Err(ToolError::InvalidArguments(format!(
                "code is {} bytes, limit is {MAX_SOURCE_BYTES}",
                code.len()
            )));
        }
        let language = match args["language"].as_str() {
            Some(hint) => Language::from_name(hint).ok_or_else(|| {
                ToolError::InvalidArguments(format!("unsupported language {hint:?}"))
            })?,
            None => Language::detect(code),
        };
        Ok(analyze(code, language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_ctx;

    const RUST_SRC: &str = "\
// entry point
pub fn main() {
    let mut x = 1;

    // TODO: remove
    helper(x);
}

async fn helper(v: i32) -> i32 { v }
";

    #[test]
    fn detects_languages() {
        assert_eq!(Language::detect(RUST_SRC), Language::Rust);
        assert_eq!(Language::detect("def f(self):\n    return None\n"), Language::Python);
        assert_eq!(Language::detect("package main\nfunc main() { x := 1 }"), Language::Go);
        assert_eq!(Language::detect("hello world"), Language::Unknown);
    }

    #[test]
    fn counts_lines_and_finds_definitions() {
        let out = analyze(RUST_SRC, Language::Rust);
        assert_eq!(out["language"], "rust");
        assert_eq!(out["lines"]["total"], 9);
        assert_eq!(out["lines"]["blank"], 2);
        assert_eq!(out["lines"]["comment"], 2);
        assert_eq!(out["lines"]["code"], 5);
        assert_eq!(out["definitions"], json!([
            {"name": "main", "line": 2},
            {"name": "helper", "line": 9},
        ]));
        assert_eq!(out["markers"][0]["marker"], "TODO");
        assert_eq!(out["markers"][0]["line"], 5);
    }

    #[test]
    fn javascript_arrow_functions() {
        let src = "export async function load() {}\nconst add = (a, b) => a + b;\n";
        let out = analyze(src, Language::JavaScript);
        let names: Vec<&str> = out["definitions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["load", "add"]);
    }

    #[tokio::test]
    async fn rejects_unknown_language_hint() {
        let err = AnalyzeCodeTool
            .invoke(json!({"code": "x", "language": "cobol"}), &test_ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn honours_language_hint() {
        let out = AnalyzeCodeTool
            .invoke(json!({"code": "def go():\n  pass\n", "language": "py"}), &test_ctx())
            .await
            .unwrap();
        assert_eq!(out["language"], "python");
        assert_eq!(out["definitions"][0]["name"], "go");
    }
}
