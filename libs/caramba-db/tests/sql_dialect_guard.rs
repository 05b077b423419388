use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

fn collect_files(dir: &Path, ext: &str, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, ext, out);
        } else if path.extension().and_then(|s| s.to_str()) == Some(ext) {
            out.push(path);
        }
    }
}

fn line_number(content: &str, byte_idx: usize) -> usize {
    content[..byte_idx].bytes().filter(|b| *b == b'\n').count() + 1
}

/// Reads the first string literal after `(` starting at `call_idx`.
fn parse_literal_from_call(content: &str, call_idx: usize) -> Option<(usize, String)> {
    let open_paren_rel = content[call_idx..].find('(')?;
    let mut i = call_idx + open_paren_rel + 1;
    let bytes = content.as_bytes();

    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return None;
    }

    if bytes[i] == b'r' {
        let mut j = i + 1;
        let mut hashes = 0usize;
        while j < bytes.len() && bytes[j] == b'#' {
            hashes += 1;
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b'"' {
            return None;
        }
        let start = j + 1;
        let mut end_marker = String::from("\"");
        end_marker.push_str(&"#".repeat(hashes));
        let end_rel = content[start..].find(&end_marker)?;
        let end = start + end_rel;
        return Some((i, content[start..end].to_string()));
    }

    if bytes[i] == b'"' {
        let start = i + 1;
        let mut j = start;
        let mut escaped = false;
        while j < bytes.len() {
            let b = bytes[j];
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                return Some((i, content[start..j].to_string()));
            }
            j += 1;
        }
    }

    None
}

/// SQL literals passed to `sqlx::query*` directly or built with `format!`.
fn extract_sql_literals(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    for needle in ["sqlx::query", "format!"] {
        let mut pos = 0usize;
        while let Some(rel) = content[pos..].find(needle) {
            let idx = pos + rel;
            if let Some((at, sql)) = parse_literal_from_call(content, idx) {
                let upper = sql.to_uppercase();
                if needle == "sqlx::query"
                    || upper.contains("SELECT ")
                    || upper.contains("INSERT INTO")
                {
                    result.push((at, sql));
                }
            }
            pos = idx + needle.len();
        }
    }
    result
}

fn sources() -> Vec<(PathBuf, String)> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut files = Vec::new();
    collect_files(&root, "rs", &mut files);
    files
        .into_iter()
        .filter_map(|f| fs::read_to_string(&f).ok().map(|c| (f, c)))
        .collect()
}

fn migrated_tables() -> HashSet<String> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let mut files = Vec::new();
    collect_files(&root, "sql", &mut files);

    let mut tables = HashSet::new();
    for file in files {
        let Ok(content) = fs::read_to_string(&file) else {
            continue;
        };
        let lower = content.to_lowercase();
        let mut rest = lower.as_str();
        while let Some(idx) = rest.find("create table if not exists ") {
            rest = &rest[idx + "create table if not exists ".len()..];
            let name: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            tables.insert(name);
        }
    }
    tables
}

fn referenced_tables(sql: &str) -> Vec<String> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let mut out = Vec::new();
    for pair in words.windows(2) {
        if matches!(pair[0], "from" | "into" | "update" | "join") {
            let name: String = pair[1]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() && name != "{}" {
                out.push(name);
            }
        }
    }
    out
}

#[test]
fn sqlx_queries_must_not_use_sqlite_placeholders() {
    let mut violations = Vec::new();
    for (file, content) in sources() {
        for (byte_idx, sql) in extract_sql_literals(&content) {
            if sql.contains('?') {
                violations.push(format!(
                    "{}:{} contains '?' placeholder in sqlx query literal",
                    file.display(),
                    line_number(&content, byte_idx)
                ));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "Found SQLite placeholders in SQL literals:\n{}",
        violations.join("\n")
    );
}

#[test]
fn sqlx_queries_must_not_use_sqlite_specific_syntax() {
    let mut violations = Vec::new();
    for (file, content) in sources() {
        for (byte_idx, sql) in extract_sql_literals(&content) {
            let lower = sql.to_lowercase();
            let has_bad = lower.contains("insert or ignore")
                || lower.contains("strftime(")
                || lower.contains("datetime(")
                || lower.contains("autoincrement");
            if has_bad {
                violations.push(format!(
                    "{}:{} contains SQLite-only SQL syntax",
                    file.display(),
                    line_number(&content, byte_idx)
                ));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "Found SQLite-specific SQL in query literals:\n{}",
        violations.join("\n")
    );
}

#[test]
fn sqlx_queries_only_touch_migrated_tables() {
    let tables = migrated_tables();
    assert!(tables.contains("assignments"), "migrations not found: {:?}", tables);

    let mut violations = Vec::new();
    for (file, content) in sources() {
        for (byte_idx, sql) in extract_sql_literals(&content) {
            for table in referenced_tables(&sql) {
                if !tables.contains(&table) {
                    violations.push(format!(
                        "{}:{} references unknown table {}",
                        file.display(),
                        line_number(&content, byte_idx),
                        table
                    ));
                }
            }
        }
    }

    assert!(
        violations.is_empty(),
        "Found queries against tables no migration creates:\n{}",
        violations.join("\n")
    );
}
