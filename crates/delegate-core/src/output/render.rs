//! Plain-text rendering of a call tree for chat messages.

use std::fmt::Write as _;

use crate::core::call_tree::{CallKind, CallNode, CallState, NodeId, Step, TreeSnapshot};

const INDENT: &str = "  ";

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Show every call in full instead of collapsing summarized ones.
    pub verbose: bool,
    /// Link to this job in the web inspector.
    pub job_link: Option<String>,
}

/// Display name for a call: `search_drive_files` becomes `SearchDriveFiles`,
/// and agents lose a trailing `Agent` (`drive_agent` becomes `Drive`).
pub fn format_name(name: &str, kind: CallKind) -> String {
    let camel: String = name
        .split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .map(|first| first.to_uppercase().chain(chars).collect::<String>())
                .unwrap_or_default()
        })
        .collect();

    if kind == CallKind::Agent
        && let Some(stripped) = camel.strip_suffix("Agent")
        && !stripped.is_empty()
    {
        return stripped.to_string();
    }
    camel
}

pub fn status_icon(state: CallState) -> &'static str {
    match state {
        CallState::Completed => "✓",
        CallState::Error => "✖",
        CallState::InProgress => "...",
    }
}

/// Renders every root of `tree`, preceded by the job link when configured.
pub fn render_tree(tree: &TreeSnapshot, options: &RenderOptions) -> String {
    let mut sections = Vec::new();

    if let Some(link) = &options.job_link {
        let label = if tree.is_in_progress() {
            "Processing..."
        } else {
            "Job Details"
        };
        sections.push(format!("{label}: {link}"));
    }

    let has_error_block = tree
        .roots()
        .iter()
        .filter_map(|id| tree.node(*id))
        .any(|node| node.kind == CallKind::Error);

    for id in tree.roots() {
        let Some(node) = tree.node(*id) else {
            continue;
        };
        let rendered = match node.kind {
            CallKind::Agent | CallKind::Tool => render_root(tree, node, options, has_error_block),
            _ => leaf_line(node, 0),
        };
        if !rendered.is_empty() {
            sections.push(rendered);
        }
    }

    sections.join("\n\n")
}

fn render_root(
    tree: &TreeSnapshot,
    node: &CallNode,
    options: &RenderOptions,
    has_error_block: bool,
) -> String {
    let mut lines = Vec::new();
    render_steps(tree, node, 0, options, &mut lines);
    let mut out = lines.join("\n");

    let tail = match node.state {
        CallState::Error if has_error_block => None,
        CallState::Error => Some(format!(
            "{} {}",
            status_icon(CallState::Error),
            node.error.as_deref().unwrap_or("Failed")
        )),
        _ => (!node.text.trim().is_empty()).then(|| node.text.trim().to_string()),
    };
    if let Some(tail) = tail {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&tail);
    }
    out
}

/// Steps in timeline order, then children no step refers to.
fn render_steps(
    tree: &TreeSnapshot,
    node: &CallNode,
    depth: usize,
    options: &RenderOptions,
    lines: &mut Vec<String>,
) {
    let mut referenced: Vec<NodeId> = Vec::new();
    for step in &node.steps {
        match step {
            Step::Log(line) => lines.push(format!("{}{line}", INDENT.repeat(depth))),
            Step::Call(child) => {
                if let Some(child) = tree.node(*child) {
                    referenced.push(child.id);
                    render_node(tree, child, depth, options, lines);
                }
            }
        }
    }
    for child in tree.children(node.id) {
        if !referenced.contains(&child.id) {
            render_node(tree, child, depth, options, lines);
        }
    }
}

fn render_node(
    tree: &TreeSnapshot,
    node: &CallNode,
    depth: usize,
    options: &RenderOptions,
    lines: &mut Vec<String>,
) {
    if !matches!(node.kind, CallKind::Agent | CallKind::Tool) {
        lines.push(leaf_line(node, depth));
        return;
    }

    let indent = INDENT.repeat(depth);
    let icon = status_icon(tree.effective_state(node.id));
    let name = format_name(&node.name, node.kind);

    if let Some(summary) = &node.summary
        && node.state.is_terminal()
        && !options.verbose
    {
        lines.push(format!("{indent}{icon} {name}: {summary}"));
        return;
    }

    let mut line = format!("{indent}{icon} {name}");
    if node.state == CallState::Error
        && let Some(error) = &node.error
    {
        let _ = write!(line, ": {error}");
    } else if node.kind == CallKind::Agent
        && let Some(task) = node.task()
    {
        let _ = write!(line, ": {task}");
    }
    lines.push(line);
    render_steps(tree, node, depth + 1, options, lines);
}

fn leaf_line(node: &CallNode, depth: usize) -> String {
    let indent = INDENT.repeat(depth);
    match node.kind {
        CallKind::File => format!("{indent}📎 {}", node.name),
        CallKind::Error => format!(
            "{indent}{} {}",
            status_icon(CallState::Error),
            node.error.as_deref().unwrap_or(&node.name)
        ),
        _ => {
            let text = if node.text.is_empty() {
                node.name.as_str()
            } else {
                node.text.as_str()
            };
            format!("{indent}{text}")
        }
    }
}

/// Splits `text` into chunks of at most `limit` UTF-16 code units, the unit
/// chat APIs count message length in.
///
/// Breaks after the last newline in the window, else the last space, else
/// exactly at the limit. The separator a chunk breaks on is dropped. Never
/// splits a character.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while let Some(end) = overflow_at(rest, limit) {
        let window = &rest[..end];
        let (cut, resume) = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .map_or((end, end), |i| (i, i + 1));
        chunks.push(rest[..cut].to_string());
        rest = &rest[resume..];
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Byte offset of the first character past `limit` UTF-16 units, or `None`
/// when all of `text` fits. A lone oversized first character still fits.
fn overflow_at(text: &str, limit: usize) -> Option<usize> {
    let mut units = 0;
    for (i, c) in text.char_indices() {
        units += c.len_utf16();
        if units > limit {
            return Some(if i == 0 { c.len_utf8() } else { i });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::call_tree::CallTree;

    #[test]
    fn formats_names() {
        assert_eq!(format_name("drive_agent", CallKind::Agent), "Drive");
        assert_eq!(format_name("search_drive_files", CallKind::Tool), "SearchDriveFiles");
        assert_eq!(format_name("agent", CallKind::Agent), "Agent");
        assert_eq!(format_name("drive_agent", CallKind::Tool), "DriveAgent");
    }

    fn sample() -> (CallTree, crate::core::call_tree::BlockHandle) {
        let tree = CallTree::default();
        let root = tree.add_root(CallKind::Agent, "master_agent", Some(json!("find files")));
        (tree, root)
    }

    #[test]
    fn renders_steps_then_answer() {
        let (tree, root) = sample();
        root.log("Looking around");
        let drive = root.add_child(CallKind::Agent, "drive_agent", Some(json!({"input": "list assets"})));
        root.record_call(drive.id());
        let search = drive.add_child(CallKind::Tool, "search_drive_files", Some(json!({"q": "x"})));
        drive.record_call(search.id());
        search.complete(Some(json!({"files": 3})));
        root.append_text("Found 3 files.");

        let text = render_tree(&tree.snapshot(), &RenderOptions::default());
        assert_eq!(
            text,
            "Looking around\n... Drive: list assets\n  ✓ SearchDriveFiles\n\nFound 3 files."
        );
    }

    #[test]
    fn summarized_calls_collapse_unless_verbose() {
        let (tree, root) = sample();
        let tool = root.add_child(CallKind::Tool, "search_drive_files", None);
        root.record_call(tool.id());
        tool.log("page 1");
        tool.complete(None);
        tool.set_summary("Found 3 character files");

        let collapsed = render_tree(&tree.snapshot(), &RenderOptions::default());
        assert_eq!(collapsed, "✓ SearchDriveFiles: Found 3 character files");

        let verbose = render_tree(
            &tree.snapshot(),
            &RenderOptions {
                verbose: true,
                job_link: None,
            },
        );
        assert_eq!(verbose, "✓ SearchDriveFiles\n  page 1");
    }

    #[test]
    fn failed_calls_show_their_error_and_roll_up() {
        let (tree, root) = sample();
        let drive = root.add_child(CallKind::Agent, "drive_agent", Some(json!({"input": "upload"})));
        let upload = drive.add_child(CallKind::Tool, "upload_file", None);
        upload.fail("quota exceeded");
        drive.complete(None);

        let text = render_tree(&tree.snapshot(), &RenderOptions::default());
        assert_eq!(text, "✖ Drive: upload\n  ✖ UploadFile: quota exceeded");
    }

    #[test]
    fn failed_root_and_job_link() {
        let (tree, root) = sample();
        let options = RenderOptions {
            verbose: false,
            job_link: Some("https://jobs.example/1".to_string()),
        };
        assert_eq!(
            render_tree(&tree.snapshot(), &options),
            "Processing...: https://jobs.example/1"
        );

        root.fail("model unavailable");
        assert_eq!(
            render_tree(&tree.snapshot(), &options),
            "Job Details: https://jobs.example/1\n\n✖ model unavailable"
        );

        tree.add_root(CallKind::Error, "error", None).fail("model unavailable");
        assert_eq!(
            render_tree(&tree.snapshot(), &options),
            "Job Details: https://jobs.example/1\n\n✖ model unavailable"
        );
    }

    #[test]
    fn files_render_with_clip() {
        let (tree, root) = sample();
        let tool = root.add_child(CallKind::Tool, "make_text_file", None);
        tool.add_child(CallKind::File, "notes.txt", None).complete(None);
        tool.complete(None);
        root.complete(None);

        let text = render_tree(&tree.snapshot(), &RenderOptions::default());
        assert_eq!(text, "✓ MakeTextFile\n  📎 notes.txt");
    }

    #[test]
    fn split_prefers_newlines_then_spaces() {
        assert_eq!(split_message("aaaa\nbbbb cccc", 10), vec!["aaaa", "bbbb cccc"]);
        assert_eq!(split_message("aaaa bbbb cccc", 10), vec!["aaaa bbbb", "cccc"]);
        assert_eq!(split_message("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert!(split_message("", 10).is_empty());
    }

    #[test]
    fn split_never_breaks_characters() {
        let text = "é".repeat(9);
        let chunks = split_message(&text, 4);
        assert_eq!(chunks, vec!["éééé", "éééé", "é"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }

    #[test]
    fn split_counts_utf16_units() {
        assert_eq!(split_message("😀😀😀", 4), vec!["😀😀", "😀"]);
        assert_eq!(split_message("ab😀", 3), vec!["ab", "😀"]);
        assert_eq!(split_message("😀", 1), vec!["😀"]);

        let text = format!("{} tail", "🚀".repeat(2047));
        let chunks = split_message(&text, 4096);
        assert_eq!(chunks, vec!["🚀".repeat(2047), "tail".to_string()]);
        assert!(chunks.iter().all(|c| c.encode_utf16().count() <= 4096));
    }
}
