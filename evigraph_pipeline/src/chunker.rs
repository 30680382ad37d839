//! Stage 0: semantic chunking.
//!
//! Splits a parsed document into overlapping sentence windows, carrying the
//! section path (root → leaf heading labels) onto each chunk. Sentence
//! splitting is deterministic and language-aware (CJK and ASCII terminators,
//! decimal points protected); no model calls. Chunk ids hash the document,
//! window bounds and build version, so re-running the same build is stable.

use tracing::debug;

use evigraph_config::Thresholds;
use evigraph_core::ids;
use evigraph_core::types::{BuildVersion, Chunk, DocId};

use regex::Regex;

/// One heading extracted by the external parser (or detected from text).
#[derive(Debug, Clone)]
pub struct Heading {
    /// Byte offset of the heading line in the document text.
    pub offset: usize,
    /// 1-based nesting level.
    pub level: usize,
    pub title: String,
}

/// Parser output the pipeline consumes. Parsers themselves are external.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub text: String,
    pub headings: Vec<Heading>,
    /// `(byte_offset, page_number)` marks, ascending by offset.
    pub pages: Vec<(usize, u32)>,
}

impl ParsedDocument {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Stage 0 chunker.
pub struct Chunker {
    window: usize,
    stride: usize,
    max_chars: usize,
    min_chars: usize,
}

impl Chunker {
    pub fn from_thresholds(t: &Thresholds) -> Self {
        Self {
            window: t.chunk_window_sentences.max(1),
            stride: t.chunk_stride.max(1),
            max_chars: t.chunk_max_chars,
            min_chars: t.chunk_min_chars,
        }
    }

    /// Split a document into ordered chunks. Empty or below-minimum text
    /// yields an empty sequence; this never fails.
    pub fn split(
        &self,
        doc_id: &DocId,
        parsed: &ParsedDocument,
        build_version: &BuildVersion,
    ) -> Vec<Chunk> {
        if parsed.text.trim().is_empty() {
            return Vec::new();
        }

        let headings = if parsed.headings.is_empty() {
            detect_headings(&parsed.text)
        } else {
            parsed.headings.clone()
        };
        let sections = section_bodies(&parsed.text, &headings);

        let mut chunks = Vec::new();
        let mut sentence_seq = 0usize; // document-wide
        let mut chunk_index = 0usize;

        for section in &sections {
            let sentences = split_sentences_with_offsets(&section.body);
            if sentences.is_empty() {
                continue;
            }
            let first_seq = sentence_seq;
            sentence_seq += sentences.len();

            let mut last_window_end: Option<usize> = None;
            let mut i = 0usize;
            while i < sentences.len() {
                let window_full = i + self.window <= sentences.len();
                let covered = last_window_end
                    .map(|e| e >= sentences.len() - 1)
                    .unwrap_or(false);
                if !window_full && covered {
                    break; // trailing partial window already covered by overlap
                }

                // Cap the window by character budget, keeping at least one
                // sentence so an oversized sentence becomes its own chunk.
                let mut end = (i + self.window).min(sentences.len());
                while end > i + 1 {
                    let chars: usize = sentences[i..end].iter().map(|s| s.0.chars().count()).sum();
                    if chars <= self.max_chars {
                        break;
                    }
                    end -= 1;
                }

                let text = sentences[i..end]
                    .iter()
                    .map(|s| s.0.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");

                let window_start = first_seq + i;
                let window_end = first_seq + end - 1;

                if text.trim().chars().count() >= self.min_chars {
                    let sentence_ids = (window_start..=window_end)
                        .map(|n| ids::sentence_id(doc_id, n))
                        .collect();
                    let start_offset = section.offset + sentences[i].1;
                    chunks.push(Chunk {
                        id: ids::chunk_id(doc_id, window_start, window_end, build_version),
                        doc_id: doc_id.clone(),
                        chunk_index,
                        text,
                        resolved_text: None,
                        section_path: section.path.clone(),
                        page_num: page_for_offset(&parsed.pages, start_offset),
                        sentence_ids,
                        window_start,
                        window_end,
                        embedding: None,
                        build_version: build_version.clone(),
                    });
                    chunk_index += 1;
                    last_window_end = Some(end - 1);
                } else {
                    debug!(window_start, window_end, "skipping below-minimum window");
                }

                // Never advance past the emitted window's end, so sentences
                // dropped by the character cap still get their own window.
                i += self.stride.min(end - i).max(1);
            }
        }

        debug!(
            doc_id = %doc_id,
            chunks = chunks.len(),
            sentences = sentence_seq,
            "chunking complete"
        );
        chunks
    }
}

struct SectionBody {
    path: Vec<String>,
    body: String,
    /// Byte offset of the body within the document text.
    offset: usize,
}

/// Split the document into heading-delimited bodies, carrying the root→leaf
/// heading path. A document without headings is one section with an empty
/// path.
fn section_bodies(text: &str, headings: &[Heading]) -> Vec<SectionBody> {
    if headings.is_empty() {
        return vec![SectionBody {
            path: Vec::new(),
            body: text.to_string(),
            offset: 0,
        }];
    }

    let mut sections = Vec::new();
    // Preamble before the first heading.
    let first = headings[0].offset.min(text.len());
    if !text[..first].trim().is_empty() {
        sections.push(SectionBody {
            path: Vec::new(),
            body: text[..first].to_string(),
            offset: 0,
        });
    }

    // Stack of (level, title) forming the current path.
    let mut stack: Vec<(usize, String)> = Vec::new();
    for (idx, heading) in headings.iter().enumerate() {
        while let Some((level, _)) = stack.last() {
            if *level >= heading.level {
                stack.pop();
            } else {
                break;
            }
        }
        stack.push((heading.level, heading.title.clone()));

        let body_start = text[heading.offset..]
            .find('\n')
            .map(|n| heading.offset + n + 1)
            .unwrap_or(text.len());
        let body_end = headings
            .get(idx + 1)
            .map(|h| h.offset)
            .unwrap_or(text.len())
            .max(body_start);

        let body = &text[body_start..body_end];
        if body.trim().is_empty() {
            continue;
        }
        sections.push(SectionBody {
            path: stack.iter().map(|(_, t)| t.clone()).collect(),
            body: body.to_string(),
            offset: body_start,
        });
    }
    sections
}

/// Detect headings directly from text when the parser supplied none.
/// Recognizes numbered headings ("1.2 Title"), Markdown hashes and CJK
/// chapter lines ("第三章 标题").
pub fn detect_headings(text: &str) -> Vec<Heading> {
    let numbered = Regex::new(r"^([0-9]+(?:\.[0-9]+)*)[.)]?\s+(.+)$").unwrap();
    let markdown = Regex::new(r"^(#+)\s+(.+)$").unwrap();
    let chapter = Regex::new(r"^第[0-9一二三四五六七八九十百]+[章节]\s*(.*)$").unwrap();

    let mut headings = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n').trim();
        if !trimmed.is_empty() {
            if let Some(caps) = markdown.captures(trimmed) {
                headings.push(Heading {
                    offset,
                    level: caps[1].len(),
                    title: caps[2].trim().to_string(),
                });
            } else if let Some(caps) = numbered.captures(trimmed) {
                // "2.1 Background" nests at the dot count + 1.
                let level = caps[1].matches('.').count() + 1;
                let title = caps[2].trim();
                // Heading lines are short and unterminated; anything else is
                // a numbered list item inside prose.
                if title.chars().count() <= 60 && !title.ends_with(['。', '.', '!', '?', '！', '？'])
                {
                    headings.push(Heading {
                        offset,
                        level,
                        title: title.to_string(),
                    });
                }
            } else if let Some(caps) = chapter.captures(trimmed) {
                headings.push(Heading {
                    offset,
                    level: 1,
                    title: if caps[1].trim().is_empty() {
                        trimmed.to_string()
                    } else {
                        caps[1].trim().to_string()
                    },
                });
            }
        }
        offset += line.len();
    }
    headings
}

/// Split text into sentences, keeping terminal punctuation. A period between
/// two digits is a decimal point, not a boundary.
pub fn split_sentences(text: &str) -> Vec<String> {
    split_sentences_with_offsets(text)
        .into_iter()
        .map(|(s, _)| s)
        .collect()
}

fn split_sentences_with_offsets(text: &str) -> Vec<(String, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut current_start: Option<usize> = None;

    let mut push = |buf: &mut String, start: &mut Option<usize>| {
        let trimmed = buf.trim();
        if trimmed.chars().count() > 1 {
            sentences.push((trimmed.to_string(), start.unwrap_or(0)));
        }
        buf.clear();
        *start = None;
    };

    for (i, &(byte_pos, ch)) in chars.iter().enumerate() {
        if current_start.is_none() && !ch.is_whitespace() {
            current_start = Some(byte_pos);
        }
        current.push(ch);

        let boundary = match ch {
            '。' | '！' | '？' | '!' | '?' => true,
            '.' => {
                let prev_digit = i > 0 && chars[i - 1].1.is_ascii_digit();
                let next_digit = i + 1 < chars.len() && chars[i + 1].1.is_ascii_digit();
                !(prev_digit && next_digit)
            }
            '\n' => {
                // A blank line ends a sentence even without punctuation.
                i + 1 < chars.len() && chars[i + 1].1 == '\n'
            }
            _ => false,
        };
        if boundary {
            push(&mut current, &mut current_start);
        }
    }
    push(&mut current, &mut current_start);
    sentences
}

fn page_for_offset(pages: &[(usize, u32)], offset: usize) -> Option<u32> {
    pages
        .iter()
        .take_while(|(page_offset, _)| *page_offset <= offset)
        .last()
        .map(|(_, n)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::from_thresholds(&Thresholds::default())
    }

    fn small_chunker(window: usize, stride: usize, min_chars: usize) -> Chunker {
        let mut t = Thresholds::default();
        t.chunk_window_sentences = window;
        t.chunk_stride = stride;
        t.chunk_min_chars = min_chars;
        Chunker::from_thresholds(&t)
    }

    #[test]
    fn split_sentences_mixed_language() {
        let sentences = split_sentences("Transformer 是一种架构。它很强大！Is it fast? Yes.");
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[0], "Transformer 是一种架构。");
        assert_eq!(sentences[1], "它很强大！");
    }

    #[test]
    fn split_sentences_preserves_decimals() {
        let sentences = split_sentences("The price is $99.99 today. Version 2.0.1 shipped.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("99.99"));
        assert!(sentences[1].contains("2.0.1"));
    }

    #[test]
    fn split_sentences_empty() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   \n\t ").is_empty());
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        let chunks = chunker().split(
            &"doc_x".to_string(),
            &ParsedDocument::from_text("   "),
            &"v1".to_string(),
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_document_below_minimum_yields_no_chunks() {
        let chunks = chunker().split(
            &"doc_x".to_string(),
            &ParsedDocument::from_text("Tiny."),
            &"v1".to_string(),
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn fewer_sentences_than_window_makes_one_chunk() {
        let chunker = small_chunker(4, 2, 10);
        let parsed = ParsedDocument::from_text(
            "Transformers changed natural language processing. They rely on attention.",
        );
        let chunks = chunker.split(&"doc_x".to_string(), &parsed, &"v1".to_string());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].window_start, 0);
        assert_eq!(chunks[0].window_end, 1);
        assert_eq!(chunks[0].sentence_ids, vec!["doc_x:s0", "doc_x:s1"]);
    }

    #[test]
    fn sliding_window_overlaps() {
        let chunker = small_chunker(3, 2, 10);
        let parsed = ParsedDocument::from_text(
            "Sentence number zero here. Sentence number one here. Sentence number two here. \
             Sentence number three here. Sentence number four here.",
        );
        let chunks = chunker.split(&"doc_x".to_string(), &parsed, &"v1".to_string());
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].window_start, 0);
        assert_eq!(chunks[0].window_end, 2);
        assert_eq!(chunks[1].window_start, 2);
        // Adjacent chunks share sentence 2.
        assert!(chunks[0].sentence_ids.contains(&"doc_x:s2".to_string()));
        assert!(chunks[1].sentence_ids.contains(&"doc_x:s2".to_string()));
    }

    #[test]
    fn chunk_ids_are_stable_across_runs() {
        let chunker = small_chunker(3, 2, 10);
        let parsed = ParsedDocument::from_text(
            "Alpha sentence one is long enough. Beta sentence two is long enough. \
             Gamma sentence three is long enough. Delta sentence four is long enough.",
        );
        let a = chunker.split(&"doc_x".to_string(), &parsed, &"v1".to_string());
        let b = chunker.split(&"doc_x".to_string(), &parsed, &"v1".to_string());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.sentence_ids, y.sentence_ids);
        }
        let c = chunker.split(&"doc_x".to_string(), &parsed, &"v2".to_string());
        assert_ne!(a[0].id, c[0].id);
    }

    #[test]
    fn oversized_sentence_becomes_its_own_chunk() {
        let mut t = Thresholds::default();
        t.chunk_window_sentences = 3;
        t.chunk_stride = 2;
        t.chunk_min_chars = 10;
        t.chunk_max_chars = 80;
        let chunker = Chunker::from_thresholds(&t);

        let long = "x".repeat(200);
        let text = format!("Short first sentence here. {long}. Short last sentence here.");
        let chunks = chunker.split(&"doc_x".to_string(), &ParsedDocument::from_text(text), &"v1".to_string());
        // The long sentence never shares a window with its neighbors.
        assert!(chunks
            .iter()
            .any(|c| c.window_start == c.window_end && c.text.len() > 150));
    }

    #[test]
    fn section_paths_follow_heading_nesting() {
        let text = "# Intro\nThis paper introduces the system fully. It has several parts.\n\
                    ## Background\nEarlier work built the foundations here. We extend them today.\n";
        let chunker = small_chunker(4, 2, 10);
        let chunks = chunker.split(
            &"doc_x".to_string(),
            &ParsedDocument::from_text(text),
            &"v1".to_string(),
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].section_path, vec!["Intro"]);
        assert_eq!(chunks[1].section_path, vec!["Intro", "Background"]);
    }

    #[test]
    fn no_headings_means_empty_section_path() {
        let chunker = small_chunker(4, 2, 10);
        let chunks = chunker.split(
            &"doc_x".to_string(),
            &ParsedDocument::from_text("One full sentence lives here. Another one follows it."),
            &"v1".to_string(),
        );
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].section_path.is_empty());
    }

    #[test]
    fn detect_headings_recognizes_all_three_forms() {
        let text = "1 Introduction\nBody text.\n## Methods\nMore body.\n第二章 实验\n正文。\n";
        let headings = detect_headings(text);
        assert_eq!(headings.len(), 3);
        assert_eq!(headings[0].title, "Introduction");
        assert_eq!(headings[0].level, 1);
        assert_eq!(headings[1].title, "Methods");
        assert_eq!(headings[1].level, 2);
        assert_eq!(headings[2].title, "实验");
    }

    #[test]
    fn page_numbers_follow_page_map() {
        let chunker = small_chunker(2, 2, 10);
        let text = "First page sentence lives here. Second page sentence lives here.";
        let split_at = text.find("Second").unwrap();
        let parsed = ParsedDocument {
            text: text.to_string(),
            headings: vec![],
            pages: vec![(0, 1), (split_at, 2)],
        };
        let chunks = chunker.split(&"doc_x".to_string(), &parsed, &"v1".to_string());
        assert_eq!(chunks[0].page_num, Some(1));
    }

    #[test]
    fn sentence_ids_are_document_wide_and_monotonic() {
        let text = "# A\nFirst body sentence is long enough. Second body sentence is long enough.\n\
                    # B\nThird body sentence is long enough. Fourth body sentence is long enough.\n";
        let chunker = small_chunker(2, 2, 10);
        let chunks = chunker.split(
            &"doc_x".to_string(),
            &ParsedDocument::from_text(text),
            &"v1".to_string(),
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].sentence_ids, vec!["doc_x:s0", "doc_x:s1"]);
        assert_eq!(chunks[1].sentence_ids, vec!["doc_x:s2", "doc_x:s3"]);
    }
}
