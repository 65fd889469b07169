use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunbookChunk {
    pub text: String,
    pub heading_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub window_words: usize,
    pub overlap_words: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            window_words: 180,
            overlap_words: 36,
        }
    }
}

pub fn strip_front_matter(markdown: &str) -> &str {
    let Some(rest) = markdown
        .strip_prefix("---\n")
        .or_else(|| markdown.strip_prefix("---\r\n"))
    else {
        return markdown;
    };
    let mut offset = markdown.len() - rest.len();
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == "---" {
            return &markdown[offset..];
        }
    }
    markdown
}

/// Renders markdown to plain text. Code is kept because runbooks carry their
/// remediation commands in code blocks.
pub fn plain_text(markdown: &str) -> String {
    let mut text = String::new();
    for event in Parser::new(markdown) {
        match event {
            Event::Text(t) | Event::Code(t) => {
                text.push_str(&t);
                text.push(' ');
            }
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(_)))
            | Event::SoftBreak
            | Event::HardBreak
            | Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => text.push('\n'),
            _ => {}
        }
    }
    text.trim().to_string()
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|ch| *ch == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    (!title.is_empty()).then_some((level, title))
}

pub fn word_windows(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let window = window.max(1);
    let step = window.saturating_sub(overlap).max(1);

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + window).min(words.len());
        windows.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    windows
}

struct Section {
    heading_path: Option<String>,
    lines: Vec<String>,
}

fn split_sections(content: &str) -> Vec<Section> {
    let mut sections = vec![Section {
        heading_path: None,
        lines: Vec::new(),
    }];
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut in_fence = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        let parsed = if in_fence { None } else { heading(line) };
        match parsed {
            Some((level, title)) => {
                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title.to_string()));
                let path = stack
                    .iter()
                    .map(|(_, t)| t.as_str())
                    .collect::<Vec<_>>()
                    .join(" > ");
                sections.push(Section {
                    heading_path: Some(path),
                    lines: Vec::new(),
                });
            }
            None => {
                if let Some(section) = sections.last_mut() {
                    section.lines.push(line.to_string());
                }
            }
        }
    }
    sections
}

/// Splits a runbook into heading-scoped word windows.
pub fn chunk_markdown(markdown: &str, options: ChunkingOptions) -> Vec<RunbookChunk> {
    let content = strip_front_matter(markdown);
    let mut chunks = Vec::new();
    for section in split_sections(content) {
        let text = plain_text(&section.lines.join("\n"));
        for window in word_windows(&text, options.window_words, options.overlap_words) {
            chunks.push(RunbookChunk {
                text: window,
                heading_path: section.heading_path.clone(),
            });
        }
    }
    chunks
}
