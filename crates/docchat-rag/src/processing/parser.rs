use anyhow::{Context, Result};
use std::io::{Cursor, Read};
use std::sync::LazyLock;

static ENTITY_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|lt|gt|quot|apos|amp);")
        .expect("xml entity regex is valid")
});

/// Split text on newlines, dropping blank and whitespace-only lines.
/// Lines are kept as-is otherwise (a trailing `\r` is stripped).
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Decode bytes as UTF-8, replacing invalid sequences. A leading BOM is dropped.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Raw text of a word-processing document, one line per paragraph.
pub fn parse_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .context("Failed to read word-processing document as ZIP")?;

    let mut xml_content = String::new();
    {
        let mut document_xml = archive
            .by_name("word/document.xml")
            .context("Document missing word/document.xml")?;
        document_xml
            .read_to_string(&mut xml_content)
            .context("Failed to read document.xml")?;
    }

    Ok(extract_docx_text(&xml_content))
}

fn extract_docx_text(xml: &str) -> String {
    let mut result = String::new();
    let mut pos = 0;

    while let Some(p_start) = find_element(xml, pos, "w:p") {
        let p_end = match xml[p_start..].find("</w:p>") {
            Some(end) => p_start + end + "</w:p>".len(),
            None => xml.len(),
        };

        // Paragraph properties hold tab-stop definitions, not content
        let paragraph = strip_element(&xml[p_start..p_end], "w:pPr");
        let paragraph = paragraph.as_str();
        let mut para_text = String::new();
        let mut t_pos = 0;

        // Runs are either <w:t>text</w:t> or a <w:tab/> marker
        loop {
            let next_text = find_element(paragraph, t_pos, "w:t");
            let next_tab = find_element(paragraph, t_pos, "w:tab");
            let text_first = match (next_text, next_tab) {
                (None, None) => break,
                (Some(t), Some(tab)) => t < tab,
                (Some(_), None) => true,
                (None, Some(_)) => false,
            };

            if !text_first {
                if let Some(tab) = next_tab {
                    para_text.push('\t');
                    t_pos = tab + "<w:tab".len();
                }
                continue;
            }

            let Some(t) = next_text else {
                break;
            };
            let Some(tag_end) = paragraph[t..].find('>') else {
                break;
            };
            let open_tag = &paragraph[t..t + tag_end + 1];
            let content_start = t + tag_end + 1;
            if open_tag.ends_with("/>") {
                t_pos = content_start;
                continue;
            }
            match paragraph[content_start..].find("</w:t>") {
                Some(t_end) => {
                    para_text.push_str(&decode_xml_entities(
                        &paragraph[content_start..content_start + t_end],
                    ));
                    t_pos = content_start + t_end + "</w:t>".len();
                }
                None => break,
            }
        }

        if !result.is_empty() {
            result.push('\n');
        }
        result.push_str(&para_text);

        pos = p_end;
    }

    result
}

/// Position of the next `<name>`, `<name ...>` or `<name/>` tag, ignoring
/// tags that merely share the prefix (`<w:pPr>` is not `<w:p>`).
fn find_element(haystack: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("<{}", name);
    let mut pos = from;
    while let Some(found) = haystack[pos..].find(&needle) {
        let start = pos + found;
        let after = start + needle.len();
        match haystack[after..].chars().next() {
            Some('>') | Some(' ') | Some('/') => return Some(start),
            Some(_) => pos = after,
            None => return None,
        }
    }
    None
}

/// Remove every `name` element, self-closing or with its subtree.
fn strip_element(fragment: &str, name: &str) -> String {
    let close = format!("</{}>", name);
    let mut out = String::with_capacity(fragment.len());
    let mut pos = 0;

    while let Some(start) = find_element(fragment, pos, name) {
        out.push_str(&fragment[pos..start]);
        let Some(tag_end) = fragment[start..].find('>') else {
            return out;
        };
        let open_end = start + tag_end + 1;
        pos = if fragment[start..open_end].ends_with("/>") {
            open_end
        } else {
            match fragment[open_end..].find(&close) {
                Some(end) => open_end + end + close.len(),
                None => return out,
            }
        };
    }
    out.push_str(&fragment[pos..]);
    out
}

/// Named and numeric character references, decoded in one pass so that
/// `&amp;lt;` stays `&lt;`.
fn decode_xml_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let code = match entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => entity[1..].parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

#[cfg(test)]
pub(crate) fn build_docx(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;

    let body: String = paragraphs
        .iter()
        .map(|p| {
            if p.is_empty() {
                "<w:p><w:pPr><w:spacing w:after=\"0\"/></w:pPr></w:p>".to_string()
            } else {
                format!("<w:p><w:pPr><w:jc w:val=\"left\"/></w:pPr><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", p)
            }
        })
        .collect();
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document><w:body>{}</w:body></w:document>",
        body
    );

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("word/document.xml", options).unwrap();
    writer.write_all(xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}
