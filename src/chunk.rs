//! Chunk pipeline (C8).
//!
//! Turns OCR markdown plus a block tree into retrieval-ready chunks: locates
//! atomic regions (tables/figures/code) that a paragraph split must never
//! cross, splits the remainder on paragraph boundaries, folds tiny
//! heading-only stubs into a neighbor, flags repeated header/footer
//! boilerplate, and extracts table structure as a side product. Grounded on
//! the teacher's paragraph chunker (`chunk_text`'s boundary-splitting shape
//! in the pre-transform version of this file), generalized to block-tree
//! driven regions per §4.8.
//!
//! A missing block tree (`None`) degrades gracefully: no atomic regions, no
//! tables, no header/footer info, and chunking falls back to plain
//! paragraph splitting over the whole markdown (§8 boundary behavior).

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

use crate::hash::hash_text;
use crate::models::SectionMetadata;

/// The block types the chunk pipeline cares about. Everything else in a
/// real block tree (paragraphs, blockquotes, ...) collapses to `Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Table,
    TableGroup,
    Figure,
    FigureGroup,
    Code,
    SectionHeader,
    Title,
    List,
    Text,
    PageHeader,
    PageFooter,
}

impl BlockType {
    pub fn content_type_label(self) -> &'static str {
        match self {
            BlockType::Table | BlockType::TableGroup => "table",
            BlockType::Figure | BlockType::FigureGroup => "figure",
            BlockType::Code => "code",
            BlockType::SectionHeader | BlockType::Title => "heading",
            BlockType::List => "list",
            BlockType::Text => "text",
            BlockType::PageHeader => "page_header",
            BlockType::PageFooter => "page_footer",
        }
    }

    /// Tolerant parse of a provider's block-type label. Unrecognized
    /// strings return `None`, which callers fold into `Other`/`Text`.
    fn parse(s: &str) -> Option<BlockType> {
        Some(match s.to_ascii_lowercase().as_str() {
            "table" => BlockType::Table,
            "table_group" | "tablegroup" => BlockType::TableGroup,
            "figure" | "image" | "picture" => BlockType::Figure,
            "figure_group" | "figuregroup" => BlockType::FigureGroup,
            "code" | "code_block" | "codeblock" => BlockType::Code,
            "section_header" | "sectionheader" | "heading" => BlockType::SectionHeader,
            "title" => BlockType::Title,
            "list" | "list_item" | "listitem" => BlockType::List,
            "text" | "paragraph" | "line" => BlockType::Text,
            "page_header" | "pageheader" => BlockType::PageHeader,
            "page_footer" | "pagefooter" => BlockType::PageFooter,
            _ => return None,
        })
    }

    fn is_atomic_candidate(self) -> bool {
        matches!(
            self,
            BlockType::Table | BlockType::TableGroup | BlockType::Figure | BlockType::FigureGroup | BlockType::Code
        )
    }

    /// Per-content-type confidence weight (§4.8 "Confidence scoring").
    fn confidence(self) -> f64 {
        match self {
            BlockType::Table | BlockType::TableGroup | BlockType::Code => 0.9,
            BlockType::SectionHeader | BlockType::Title => 0.85,
            BlockType::List => 0.8,
            BlockType::Text => 0.7,
            BlockType::Figure | BlockType::FigureGroup => 0.6,
            BlockType::PageHeader | BlockType::PageFooter => 0.5,
        }
    }
}

/// One node of the OCR block tree. A real tree is nested (`children`), but
/// the pipeline only ever needs document-order traversal, so callers may
/// flatten their tree into document order before handing it in.
///
/// `block_tree_json` is opaque past deserialization (§6): field names are
/// aliased to the common variants an OCR provider might emit rather than
/// pinned to one schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Block {
    #[serde(default, alias = "type")]
    pub block_type: Option<BlockTypeOrOther>,
    #[serde(default, alias = "page_number")]
    pub page: Option<i64>,
    /// The block's own text, used to locate its span in the markdown.
    #[serde(default, alias = "content")]
    pub text: String,
    /// Raw HTML for the block, when the source format carried it (used for
    /// table header/row extraction and figure extent estimation).
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub children: Vec<Block>,
}

/// A block tree can carry block kinds the pipeline doesn't special-case
/// (paragraphs, blockquotes, ...); those pass through as `Other` and are
/// treated as `Text` everywhere a [`BlockType`] is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTypeOrOther {
    Known(BlockType),
    Other,
}

impl<'de> Deserialize<'de> for BlockTypeOrOther {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(BlockType::parse(&s).map(BlockTypeOrOther::Known).unwrap_or(BlockTypeOrOther::Other))
    }
}

impl BlockTypeOrOther {
    fn resolved(self) -> BlockType {
        match self {
            BlockTypeOrOther::Known(k) => k,
            BlockTypeOrOther::Other => BlockType::Text,
        }
    }
}

/// A located, non-overlapping span in the markdown that chunk boundaries
/// must not cross (§4.8 "Atomic-region discovery").
#[derive(Debug, Clone)]
pub struct AtomicRegion {
    pub start: usize,
    pub end: usize,
    pub block_type: BlockType,
}

fn normalize_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_ws = true;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_ws {
                out.push(' ');
            }
            prev_ws = true;
        } else {
            out.push(ch);
            prev_ws = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

fn strip_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for ch in s.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Tier 2: whitespace-normalized substring search with remapping back to
/// the original byte offsets, searching only from `from` onward.
fn find_normalized(markdown: &str, from: usize, text: &str) -> Option<(usize, usize)> {
    let target = normalize_ws(text);
    if target.is_empty() {
        return None;
    }
    let window = &markdown[from..];
    let mut normalized = String::with_capacity(window.len());
    let mut offsets = Vec::with_capacity(window.len());
    let mut prev_ws = true;
    for (idx, ch) in window.char_indices() {
        if ch.is_whitespace() {
            if !prev_ws {
                normalized.push(' ');
                offsets.push(from + idx);
            }
            prev_ws = true;
        } else {
            normalized.push(ch);
            offsets.push(from + idx);
            prev_ws = false;
        }
    }
    let pos = normalized.find(&target)?;
    let start = *offsets.get(pos)?;
    let last_char_pos = pos + target.chars().count().saturating_sub(1).max(0);
    let last_char_pos = last_char_pos.min(offsets.len().saturating_sub(1));
    let last_start = *offsets.get(last_char_pos)?;
    let end = markdown[last_start..]
        .chars()
        .next()
        .map(|c| last_start + c.len_utf8())
        .unwrap_or(last_start);
    Some((start, end.max(start)))
}

/// Tier 3 for tables: scan forward from `from` for the first `|`-bearing
/// line, then extend while lines keep containing `|`, stopping at the
/// first blank line that isn't itself a table row.
fn find_table_extent(markdown: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = markdown.as_bytes();
    let mut cursor = from;
    // Find first pipe-bearing line at or after `from`.
    let first_line_start = loop {
        if cursor >= bytes.len() {
            return None;
        }
        let line_end = markdown[cursor..].find('\n').map(|p| cursor + p).unwrap_or(markdown.len());
        if markdown[cursor..line_end].contains('|') {
            break cursor;
        }
        if line_end >= markdown.len() {
            return None;
        }
        cursor = line_end + 1;
    };

    let mut pos = first_line_start;
    let mut last_table_line_end = first_line_start;
    loop {
        let line_end = markdown[pos..].find('\n').map(|p| pos + p).unwrap_or(markdown.len());
        let line = &markdown[pos..line_end];
        if line.contains('|') {
            last_table_line_end = line_end;
            if line_end >= markdown.len() {
                break;
            }
            pos = line_end + 1;
        } else if line.trim().is_empty() {
            break;
        } else {
            break;
        }
    }
    Some((first_line_start, last_table_line_end))
}

/// Tier 3 for fenced code: find the opening ``` at or after `from`, then
/// the matching closing fence.
fn find_code_extent(markdown: &str, from: usize) -> Option<(usize, usize)> {
    let open = markdown[from..].find("```").map(|p| from + p)?;
    let after_open = open + 3;
    let close_rel = markdown[after_open..].find("```")?;
    let close = after_open + close_rel + 3;
    Some((open, close))
}

/// Tier 3 for figures: no fence to anchor on, so the span is estimated as
/// `from .. from + len(stripped_html)` (or the block's own text length if
/// no HTML was carried), clamped to the document.
fn find_figure_extent(markdown: &str, from: usize, block: &Block) -> Option<(usize, usize)> {
    let estimate_len = block
        .html
        .as_deref()
        .map(strip_html)
        .unwrap_or_else(|| block.text.clone())
        .len();
    if estimate_len == 0 || from >= markdown.len() {
        return None;
    }
    let end = (from + estimate_len).min(markdown.len());
    Some((from, end))
}

/// Walk the block tree locating each atomic-candidate block's span in
/// `markdown`, merging overlaps, and returning a sorted, non-overlapping
/// region list. `None` input yields an empty list (§8 boundary behavior).
pub fn discover_atomic_regions(markdown: &str, block_tree: Option<&[Block]>) -> Vec<AtomicRegion> {
    let Some(tree) = block_tree else {
        return Vec::new();
    };

    let mut regions = Vec::new();
    let mut cursor = 0usize;

    for block in flatten(tree) {
        let block_type = match block.block_type {
            Some(bt) => bt.resolved(),
            None => continue,
        };
        if !block_type.is_atomic_candidate() {
            continue;
        }

        let located = markdown[cursor..]
            .find(block.text.as_str())
            .map(|p| (cursor + p, cursor + p + block.text.len()))
            .or_else(|| find_normalized(markdown, cursor, &block.text))
            .or_else(|| match block_type {
                BlockType::Table | BlockType::TableGroup => find_table_extent(markdown, cursor),
                BlockType::Code => find_code_extent(markdown, cursor),
                BlockType::Figure | BlockType::FigureGroup => find_figure_extent(markdown, cursor, block),
                _ => None,
            });

        if let Some((start, end)) = located {
            if end >= start {
                regions.push(AtomicRegion { start, end, block_type });
                cursor = end;
            }
        }
    }

    regions.sort_by_key(|r| r.start);
    merge_overlapping(regions)
}

/// Build the `(char_offset, page_number)` table `ChunkInput::page_offsets`
/// expects, by locating each block's text in `markdown` the same way
/// [`discover_atomic_regions`] does and pairing the offset it's found at
/// with the block's own page number. Blocks with no page or that can't be
/// located are skipped; the result is monotonic in `char_offset`.
pub fn derive_page_offsets(markdown: &str, block_tree: Option<&[Block]>) -> Vec<(usize, i64)> {
    let Some(tree) = block_tree else {
        return Vec::new();
    };

    let mut offsets = Vec::new();
    let mut cursor = 0usize;

    for block in flatten(tree) {
        let Some(page) = block.page else { continue };
        if block.text.trim().is_empty() {
            continue;
        }
        let located = markdown[cursor..]
            .find(block.text.as_str())
            .map(|p| cursor + p)
            .or_else(|| find_normalized(markdown, cursor, &block.text).map(|(s, _)| s));

        if let Some(start) = located {
            offsets.push((start, page));
            cursor = start + block.text.len().min(markdown.len().saturating_sub(start));
        }
    }

    offsets
}

fn flatten(tree: &[Block]) -> Vec<&Block> {
    let mut out = Vec::new();
    fn walk<'a>(blocks: &'a [Block], out: &mut Vec<&'a Block>) {
        for b in blocks {
            out.push(b);
            walk(&b.children, out);
        }
    }
    walk(tree, &mut out);
    out
}

/// Figure/table blocks in document order, each paired with its resolved
/// [`BlockType`] label — the candidates `ingest.rs` hands to an
/// [`crate::clients::ImageExtractor`] one at a time. Blocks without a page
/// number are skipped; there is nowhere to crop pixels from.
pub fn image_candidate_blocks(tree: &[Block]) -> Vec<(&Block, &'static str)> {
    flatten(tree)
        .into_iter()
        .filter_map(|b| {
            let bt = b.block_type?.resolved();
            if !matches!(
                bt,
                BlockType::Figure | BlockType::FigureGroup | BlockType::Table | BlockType::TableGroup
            ) {
                return None;
            }
            b.page?;
            Some((b, bt.content_type_label()))
        })
        .collect()
}

/// Block-type "size" used to decide which of two overlapping regions'
/// types survives a merge: the type whose matched span is longer wins.
fn merge_overlapping(regions: Vec<AtomicRegion>) -> Vec<AtomicRegion> {
    let mut merged: Vec<AtomicRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        if let Some(last) = merged.last_mut() {
            if region.start <= last.end {
                let last_len = last.end - last.start;
                let region_len = region.end - region.start;
                last.end = last.end.max(region.end);
                if region_len > last_len {
                    last.block_type = region.block_type;
                }
                continue;
            }
        }
        merged.push(region);
    }
    merged
}

/// Binary search over the sorted, merged region list (§4.8).
pub fn is_in_region(regions: &[AtomicRegion], offset: usize) -> Option<&AtomicRegion> {
    let idx = regions.partition_point(|r| r.end <= offset);
    regions.get(idx).filter(|r| r.start <= offset && offset < r.end)
}

/// Default minimum size (characters) below which a heading-only chunk
/// merges into a neighbor (§4.8 "Heading-only merge").
pub const DEFAULT_MIN_SIZE: usize = 100;

/// A chunk before it is assigned an id/provenance/document — the chunk
/// pipeline's own output unit. Callers (the ingest pipeline) turn each of
/// these into a full [`crate::models::Chunk`] once its EMBEDDING-free
/// provenance record has been created.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub text: String,
    pub text_hash: String,
    pub character_start: i64,
    pub character_end: i64,
    pub page_number: Option<i64>,
    pub page_range: Option<String>,
    pub section: SectionMetadata,
}

fn text_hash(text: &str) -> String {
    hash_text(text.as_bytes())
}

struct Paragraph {
    start: usize,
    end: usize,
    text: String,
}

/// Split `markdown` into paragraph spans on blank lines, extending any
/// paragraph across an atomic region so the split never lands inside one.
fn split_paragraphs(markdown: &str, regions: &[AtomicRegion]) -> Vec<Paragraph> {
    let mut paragraphs = Vec::new();
    let mut cursor = 0usize;
    let len = markdown.len();

    while cursor < len {
        // Skip leading blank separators.
        while cursor < len && markdown[cursor..].starts_with('\n') {
            cursor += 1;
        }
        if cursor >= len {
            break;
        }
        let start = cursor;
        let mut end = match markdown[cursor..].find("\n\n") {
            Some(p) => cursor + p,
            None => len,
        };

        // If this boundary falls inside an atomic region, extend past it.
        while let Some(region) = is_in_region(regions, end.min(len.saturating_sub(1)).max(start)) {
            if end >= region.end {
                break;
            }
            end = match markdown[region.end..].find("\n\n") {
                Some(p) => region.end + p,
                None => len,
            };
        }
        if end <= start {
            end = len;
        }

        let text = markdown[start..end].to_string();
        if !text.trim().is_empty() {
            paragraphs.push(Paragraph { start, end, text });
        }
        cursor = end;
    }

    paragraphs
}

/// Dominant content types covered by `[start, end)`, used to populate a
/// chunk's `content_types` and atomicity flag.
fn content_types_for_span(blocks: &[&Block], markdown: &str, start: usize, end: usize) -> (Vec<String>, bool) {
    let mut labels: Vec<String> = Vec::new();
    let mut is_atomic = false;
    for b in blocks {
        let Some(bt) = b.block_type else { continue };
        let resolved = bt.resolved();
        if let Some(pos) = markdown.find(b.text.as_str()) {
            if pos >= start && pos < end {
                let label = resolved.content_type_label().to_string();
                if !labels.contains(&label) {
                    labels.push(label);
                }
                if resolved.is_atomic_candidate() {
                    is_atomic = true;
                }
            }
        }
    }
    if labels.is_empty() {
        labels.push(BlockType::Text.content_type_label().to_string());
    }
    (labels, is_atomic)
}

fn page_for_offset(page_offsets: &[(usize, i64)], offset: usize) -> Option<i64> {
    if page_offsets.is_empty() {
        return None;
    }
    let idx = page_offsets.partition_point(|(o, _)| *o <= offset);
    let idx = idx.saturating_sub(1);
    page_offsets.get(idx).map(|(_, page)| *page)
}

fn page_range_for_span(page_offsets: &[(usize, i64)], start: usize, end: usize) -> Option<String> {
    let p1 = page_for_offset(page_offsets, start)?;
    let p2 = page_for_offset(page_offsets, end.saturating_sub(1).max(start))?;
    if p1 == p2 {
        None
    } else {
        Some(format!("{p1}-{p2}"))
    }
}

/// Track the current heading/section path as paragraphs are scanned, so
/// each chunk can be tagged with the section it falls under.
#[derive(Default, Clone)]
struct SectionCursor {
    path: Vec<String>,
    last_heading: Option<String>,
    last_level: Option<i64>,
}

impl SectionCursor {
    fn observe(&mut self, blocks_in_span: &[(&Block, BlockType)]) {
        for (block, bt) in blocks_in_span {
            if matches!(bt, BlockType::SectionHeader | BlockType::Title) {
                let level = heading_level(&block.text);
                while self.path.len() >= level.max(1) as usize {
                    self.path.pop();
                }
                self.path.push(block.text.trim().to_string());
                self.last_heading = Some(block.text.trim().to_string());
                self.last_level = Some(level);
            }
        }
    }

    fn section_path(&self) -> Option<String> {
        if self.path.is_empty() {
            None
        } else {
            Some(self.path.join(" > "))
        }
    }
}

fn heading_level(text: &str) -> i64 {
    let hashes = text.chars().take_while(|c| *c == '#').count();
    if hashes > 0 {
        hashes as i64
    } else {
        1
    }
}

/// Full input to the chunk pipeline.
pub struct ChunkInput<'a> {
    pub markdown: &'a str,
    pub block_tree: Option<&'a [Block]>,
    /// Sorted `(char_offset, page_number)` pairs marking where each page
    /// begins; empty means page information is unavailable.
    pub page_offsets: &'a [(usize, i64)],
    pub page_count: i64,
    pub min_heading_merge_size: usize,
}

pub struct ChunkPipelineOutput {
    pub chunks: Vec<ChunkDraft>,
    pub block_type_stats: HashMap<&'static str, usize>,
    pub confidence_hints: Vec<f64>,
    pub repeated_texts: Vec<String>,
    pub tables: Vec<TableStructure>,
}

/// Run the full chunk pipeline: atomic-region discovery, paragraph
/// splitting that respects those regions, section tagging, heading-only
/// merge to a fixed point, repeated-header/footer classification, table
/// extraction, and confidence scoring.
pub fn run(input: ChunkInput) -> ChunkPipelineOutput {
    let regions = discover_atomic_regions(input.markdown, input.block_tree);
    let flat_blocks = input.block_tree.map(flatten).unwrap_or_default();
    let paragraphs = split_paragraphs(input.markdown, &regions);

    let mut block_type_stats: HashMap<&'static str, usize> = HashMap::new();
    for b in &flat_blocks {
        if let Some(bt) = b.block_type {
            *block_type_stats.entry(bt.resolved().content_type_label()).or_insert(0) += 1;
        }
    }

    let mut section_cursor = SectionCursor::default();
    let mut drafts = Vec::with_capacity(paragraphs.len());

    for para in &paragraphs {
        let blocks_in_span: Vec<(&Block, BlockType)> = flat_blocks
            .iter()
            .filter_map(|b| {
                let bt = b.block_type?.resolved();
                let pos = input.markdown.find(b.text.as_str())?;
                (pos >= para.start && pos < para.end).then_some((*b, bt))
            })
            .collect();
        section_cursor.observe(&blocks_in_span);

        let (content_types, is_atomic) =
            content_types_for_span(&flat_blocks, input.markdown, para.start, para.end);

        let text = para.text.trim().to_string();
        if text.is_empty() {
            continue;
        }

        let heading_level = blocks_in_span
            .iter()
            .find(|(_, bt)| matches!(bt, BlockType::SectionHeader | BlockType::Title))
            .map(|(b, _)| heading_level(&b.text));

        drafts.push(ChunkDraft {
            text_hash: text_hash(&text),
            character_start: para.start as i64,
            character_end: para.end as i64,
            page_number: page_for_offset(input.page_offsets, para.start),
            page_range: page_range_for_span(input.page_offsets, para.start, para.end),
            section: SectionMetadata {
                heading_context: section_cursor.last_heading.clone(),
                heading_level: heading_level.or(section_cursor.last_level),
                section_path: section_cursor.section_path(),
                content_types,
                is_atomic,
                strategy: "block_tree_atomic".to_string(),
            },
            text,
        });
    }

    let mut drafts = merge_heading_only(drafts, input.min_heading_merge_size.max(1));

    let repeated_texts = detect_repeated_headers_footers(&flat_blocks, input.page_count);
    classify_repeated_boilerplate(&mut drafts, &repeated_texts);

    let confidence_hints = drafts
        .iter()
        .map(|d| confidence_for_chunk(&d.section.content_types))
        .collect();

    let tables = extract_tables(input.markdown, &flat_blocks, &regions);

    ChunkPipelineOutput {
        chunks: drafts,
        block_type_stats,
        confidence_hints,
        repeated_texts,
        tables,
    }
}

/// Merge a heading-only chunk (content_types == ["heading"], trimmed text
/// shorter than `min_size`) into its successor, or predecessor if it's
/// last. Iterates to a fixed point (§4.8).
fn merge_heading_only(mut drafts: Vec<ChunkDraft>, min_size: usize) -> Vec<ChunkDraft> {
    loop {
        let merge_at = drafts.iter().position(|d| {
            d.section.content_types == vec!["heading".to_string()] && d.text.trim().len() < min_size
        });
        let Some(idx) = merge_at else { break };
        if drafts.len() == 1 {
            break;
        }

        if idx + 1 < drafts.len() {
            let heading = drafts.remove(idx);
            let successor = &mut drafts[idx];
            successor.text = format!("{}\n\n{}", heading.text, successor.text);
            successor.character_start = heading.character_start.min(successor.character_start);
            successor.character_end = successor.character_end.max(heading.character_end);
            successor.section.heading_context = heading.section.heading_context.or(successor.section.heading_context.clone());
            successor.section.heading_level = heading.section.heading_level.or(successor.section.heading_level);
            successor.section.section_path = heading.section.section_path.or(successor.section.section_path.clone());
            successor.text_hash = text_hash(&successor.text);
        } else {
            let heading = drafts.remove(idx);
            let predecessor = &mut drafts[idx - 1];
            predecessor.text = format!("{}\n\n{}", predecessor.text, heading.text);
            predecessor.character_start = predecessor.character_start.min(heading.character_start);
            predecessor.character_end = predecessor.character_end.max(heading.character_end);
            predecessor.text_hash = text_hash(&predecessor.text);
        }
    }
    drafts
}

/// Count PageHeader/PageFooter text occurrences per distinct page; a text
/// is "repeated" if it shows up on more than half the pages, at least
/// twice (§4.8).
fn detect_repeated_headers_footers(blocks: &[&Block], page_count: i64) -> Vec<String> {
    if page_count <= 0 {
        return Vec::new();
    }
    let mut pages_seen: HashMap<String, std::collections::HashSet<i64>> = HashMap::new();
    for b in blocks {
        let Some(bt) = b.block_type else { continue };
        if matches!(bt.resolved(), BlockType::PageHeader | BlockType::PageFooter) {
            let key = normalize_ws(&b.text);
            if key.is_empty() {
                continue;
            }
            pages_seen.entry(key).or_default().insert(b.page.unwrap_or(0));
        }
    }

    pages_seen
        .into_iter()
        .filter(|(_, pages)| pages.len() >= 2 && (pages.len() as f64 / page_count as f64) > 0.5)
        .map(|(text, _)| text)
        .collect()
}

/// Flag a chunk as repeated boilerplate when its normalized text equals or
/// is substring-contained within a normalized repeated text, with a length
/// ratio no greater than 1.5x (§4.8).
fn classify_repeated_boilerplate(drafts: &mut [ChunkDraft], repeated_texts: &[String]) {
    for draft in drafts.iter_mut() {
        let normalized = normalize_ws(&draft.text);
        if normalized.is_empty() {
            continue;
        }
        let is_repeated = repeated_texts.iter().any(|rep| {
            if normalized == *rep {
                return true;
            }
            let (shorter, longer) = if normalized.len() <= rep.len() {
                (&normalized, rep)
            } else {
                (rep, &normalized)
            };
            if shorter.is_empty() || !longer.contains(shorter.as_str()) {
                return false;
            }
            (longer.len() as f64) <= (shorter.len() as f64) * 1.5
        });
        if is_repeated && !draft.section.content_types.iter().any(|c| c == "repeated_boilerplate") {
            draft.section.content_types.push("repeated_boilerplate".to_string());
        }
    }
}

fn confidence_for_chunk(content_types: &[String]) -> f64 {
    if content_types.is_empty() {
        return 0.7;
    }
    let sum: f64 = content_types
        .iter()
        .map(|c| match c.as_str() {
            "table" => 0.9,
            "code" => 0.9,
            "heading" => 0.85,
            "list" => 0.8,
            "text" => 0.7,
            "figure" => 0.6,
            "page_header" | "page_footer" => 0.5,
            _ => 0.7,
        })
        .sum();
    sum / content_types.len() as f64
}

#[derive(Debug, Clone)]
pub struct TableStructure {
    pub start: usize,
    pub end: usize,
    pub page: Option<i64>,
    pub caption: Option<String>,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub column_count: usize,
    pub first_data_row: Vec<String>,
    pub summary: String,
    pub continues_previous: bool,
}

fn caption_regex() -> Regex {
    Regex::new(r"^(Table|Figure)\s+\d+[.:]").unwrap()
}

/// Extract headers from a markdown pipe-row, HTML `<th>`/`<td>`, or block
/// children, in that fallback order (§4.8 "same fallback chain").
fn extract_row(block_children: Option<&[String]>, html: Option<&str>, markdown_row: Option<&str>) -> Vec<String> {
    if let Some(children) = block_children {
        if !children.is_empty() {
            return children.to_vec();
        }
    }
    if let Some(html) = html {
        let cells = extract_html_cells(html);
        if !cells.is_empty() {
            return cells;
        }
    }
    if let Some(row) = markdown_row {
        return row
            .trim()
            .trim_matches('|')
            .split('|')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }
    Vec::new()
}

fn extract_html_cells(html: &str) -> Vec<String> {
    let re = Regex::new(r"(?is)<t[hd][^>]*>(.*?)</t[hd]>").unwrap();
    re.captures_iter(html).map(|c| strip_html(&c[1]).trim().to_string()).collect()
}

fn first_pipe_row(markdown: &str) -> Option<&str> {
    markdown.lines().find(|l| l.contains('|'))
}

fn second_pipe_row(markdown: &str) -> Option<&str> {
    markdown.lines().filter(|l| l.contains('|')).nth(2)
}

fn sorensen_dice(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: std::collections::HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: std::collections::HashSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count();
    (2.0 * intersection as f64) / (set_a.len() + set_b.len()) as f64
}

/// Extract table structure for each located Table/TableGroup region.
fn extract_tables(markdown: &str, blocks: &[&Block], regions: &[AtomicRegion]) -> Vec<TableStructure> {
    let caption_re = caption_regex();
    let mut tables = Vec::new();
    let mut prev_headers: Option<(i64, Vec<String>)> = None;

    for (idx, region) in regions.iter().enumerate() {
        if !matches!(region.block_type, BlockType::Table | BlockType::TableGroup) {
            continue;
        }
        let span = &markdown[region.start..region.end];
        let headers = extract_row(None, None, first_pipe_row(span));
        let first_data_row = extract_row(None, None, second_pipe_row(span));
        let row_count = span.lines().filter(|l| l.contains('|')).count().saturating_sub(1).max(0);
        let column_count = headers.len();

        let page = blocks
            .iter()
            .find(|b| markdown.find(b.text.as_str()).map(|p| p >= region.start && p < region.end).unwrap_or(false))
            .and_then(|b| b.page);

        let caption = if region.start > 0 {
            let before = &markdown[..region.start];
            before
                .trim_end()
                .lines()
                .last()
                .filter(|line| caption_re.is_match(line.trim()))
                .map(|line| line.trim().to_string())
        } else {
            None
        };

        let mut summary = String::new();
        if let Some(cap) = &caption {
            summary.push_str(cap);
            summary.push(' ');
        }
        summary.push_str(&format!(
            "Table with {} rows and columns: {}. Sample: {}",
            row_count,
            headers.join(", "),
            first_data_row.join(", ")
        ));
        summary.truncate(200);

        let continues_previous = match (&prev_headers, page) {
            (Some((prev_page, prev_h)), Some(p)) => {
                (p - prev_page).abs() <= 1 && sorensen_dice(prev_h, &headers) >= 0.8
            }
            _ => false,
        };

        prev_headers = page.map(|p| (p, headers.clone()));

        tables.push(TableStructure {
            start: region.start,
            end: region.end,
            page,
            caption,
            headers,
            row_count,
            column_count,
            first_data_row,
            summary,
            continues_previous,
        });

        let _ = idx;
    }

    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md_block(text: &str, bt: BlockType, page: i64) -> Block {
        Block {
            block_type: Some(BlockTypeOrOther::Known(bt)),
            page: Some(page),
            text: text.to_string(),
            html: None,
            children: vec![],
        }
    }

    #[test]
    fn null_block_tree_produces_no_regions_or_tables() {
        let out = run(ChunkInput {
            markdown: "Some text.\n\nMore text.",
            block_tree: None,
            page_offsets: &[],
            page_count: 1,
            min_heading_merge_size: DEFAULT_MIN_SIZE,
        });
        assert!(out.tables.is_empty());
        assert!(out.repeated_texts.is_empty());
        assert!(out.block_type_stats.is_empty());
        assert!(!out.chunks.is_empty());
    }

    #[test]
    fn atomic_region_protects_table_from_split() {
        let table_md = "| a | b |\n|---|---|\n| 1 | 2 |";
        let markdown = format!("Intro text.\n\n{table_md}\n\nOutro text.");
        let blocks = vec![md_block(table_md, BlockType::Table, 1)];
        let regions = discover_atomic_regions(&markdown, Some(&blocks));
        assert_eq!(regions.len(), 1);
        assert!(regions[0].start < regions[0].end);
        let mid = regions[0].start + 1;
        assert!(is_in_region(&regions, mid).is_some());
    }

    #[test]
    fn code_fence_extent_detection() {
        let markdown = "before\n\n```\nlet x = 1;\n```\n\nafter";
        let blocks = vec![md_block("garbage-not-present-verbatim", BlockType::Code, 1)];
        let regions = discover_atomic_regions(markdown, Some(&blocks));
        assert_eq!(regions.len(), 1);
        assert!(markdown[regions[0].start..regions[0].end].contains("let x = 1;"));
    }

    #[test]
    fn heading_only_chunk_merges_into_successor() {
        let markdown = "# H\n\nThis is the body that follows the heading and is long enough to survive merge checks easily.";
        let blocks = vec![md_block("# H", BlockType::SectionHeader, 1)];
        let out = run(ChunkInput {
            markdown,
            block_tree: Some(&blocks),
            page_offsets: &[],
            page_count: 1,
            min_heading_merge_size: DEFAULT_MIN_SIZE,
        });
        assert_eq!(out.chunks.len(), 1);
        assert!(out.chunks[0].text.starts_with("# H"));
    }

    #[test]
    fn heading_only_last_chunk_merges_into_predecessor() {
        let markdown = "Body paragraph with enough characters to not be merge-eligible itself for sure.\n\n# H";
        let blocks = vec![md_block("# H", BlockType::SectionHeader, 1)];
        let out = run(ChunkInput {
            markdown,
            block_tree: Some(&blocks),
            page_offsets: &[],
            page_count: 1,
            min_heading_merge_size: DEFAULT_MIN_SIZE,
        });
        assert_eq!(out.chunks.len(), 1);
        assert!(out.chunks[0].text.trim_end().ends_with("# H"));
    }

    #[test]
    fn repeated_header_detected_across_majority_of_pages() {
        let blocks: Vec<Block> = (1..=4)
            .map(|p| md_block("Confidential Draft", BlockType::PageHeader, p))
            .collect();
        let refs: Vec<&Block> = blocks.iter().collect();
        let repeated = detect_repeated_headers_footers(&refs, 4);
        assert_eq!(repeated, vec!["Confidential Draft".to_string()]);
    }

    #[test]
    fn table_structure_extracts_headers_and_summary() {
        let table_md = "Table 1: Sample\n| col a | col b |\n|---|---|\n| 1 | 2 |";
        let markdown = format!("intro\n\n{table_md}\n\noutro");
        let blocks = vec![md_block("| col a | col b |\n|---|---|\n| 1 | 2 |", BlockType::Table, 1)];
        let flat: Vec<&Block> = blocks.iter().collect();
        let regions = discover_atomic_regions(&markdown, Some(&blocks));
        let tables = extract_tables(&markdown, &flat, &regions);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].headers, vec!["col a".to_string(), "col b".to_string()]);
        assert!(tables[0].summary.contains("Table with"));
        assert!(tables[0].summary.len() <= 200);
    }

    #[test]
    fn sorensen_dice_identical_headers_is_one() {
        let h = vec!["a".to_string(), "b".to_string()];
        assert!((sorensen_dice(&h, &h) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_weights_match_table() {
        assert!((confidence_for_chunk(&["table".to_string()]) - 0.9).abs() < 1e-9);
        assert!((confidence_for_chunk(&["figure".to_string()]) - 0.6).abs() < 1e-9);
        assert!((confidence_for_chunk(&[]) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn all_located_offsets_are_valid() {
        let table_md = "| a |\n|---|\n| 1 |";
        let markdown = format!("x\n\n{table_md}\n\ny");
        let blocks = vec![md_block(table_md, BlockType::Table, 1)];
        let regions = discover_atomic_regions(&markdown, Some(&blocks));
        for r in regions {
            assert!(r.end >= r.start);
        }
    }
}
