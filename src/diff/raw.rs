/// One file's section of a whole-MR plain-text diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection {
    pub old_path: String,
    pub new_path: String,
    /// The section verbatim, starting at its `diff --git` line
    pub text: String,
}

/// Split plain `git diff` output into per-file sections.
///
/// Section text is kept byte-for-byte (line endings included). Paths come from
/// the `diff --git a/{old} b/{new}` header and are refined by `rename from/to`
/// and `---`/`+++` lines when those are present. Text before the first header
/// is ignored.
pub fn split_raw_diff(raw_diff: &str) -> Vec<RawSection> {
    let mut sections = Vec::new();
    let mut current: Option<RawSection> = None;
    let mut in_hunks = false;

    for line in raw_diff.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);

        if let Some(rest) = content.strip_prefix("diff --git ") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            let (old_path, new_path) = parse_git_header(rest);
            current = Some(RawSection {
                old_path,
                new_path,
                text: line.to_string(),
            });
            in_hunks = false;
            continue;
        }

        let Some(section) = current.as_mut() else {
            continue;
        };
        section.text.push_str(line);

        // Header lines only appear before the first hunk.
        if in_hunks || content.starts_with("@@") {
            in_hunks = true;
            continue;
        }
        if let Some(path) = content.strip_prefix("rename from ") {
            section.old_path = path.to_string();
        } else if let Some(path) = content.strip_prefix("rename to ") {
            section.new_path = path.to_string();
        } else if let Some(path) = content.strip_prefix("--- a/") {
            section.old_path = path.to_string();
        } else if let Some(path) = content.strip_prefix("+++ b/") {
            section.new_path = path.to_string();
        }
    }

    if let Some(section) = current.take() {
        sections.push(section);
    }
    sections
}

/// Split `a/{old} b/{new}`. Paths may contain spaces, so prefer the split
/// where both sides are equal, and otherwise the last ` b/`.
fn parse_git_header(rest: &str) -> (String, String) {
    let Some(body) = rest.strip_prefix("a/") else {
        return (String::new(), String::new());
    };

    let splits: Vec<usize> = body.match_indices(" b/").map(|(i, _)| i).collect();
    for &i in &splits {
        let (old, new) = (&body[..i], &body[i + 3..]);
        if old == new {
            return (old.to_string(), new.to_string());
        }
    }
    match splits.last() {
        Some(&i) => (body[..i].to_string(), body[i + 3..].to_string()),
        None => (body.to_string(), body.to_string()),
    }
}
