//! MIME normalization for POP3 downloads.
//!
//! POP3 can only truncate a message by line count, so a snippet fetch usually
//! cuts the last MIME part short. The part tree built here remembers which part
//! was cut (the deepest last child) and attributes every byte that was not
//! downloaded to it, so size estimates stay honest.

use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SNIPPET_CHARS: usize = 100;
const SNIPPET_WRAP: usize = 80;

/// One node of the MIME structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimePart {
    /// `1`, `1.1`, `1.2.1`, ...
    pub part_id: String,
    pub content_type: String,
    pub params: BTreeMap<String, String>,
    pub disposition: Option<String>,
    pub disposition_params: BTreeMap<String, String>,
    pub content_id: Option<String>,
    /// Decoded bytes we actually have for this part
    pub size: usize,
    pub children: Vec<MimePart>,
}

/// A renderable text part, or the synthetic `fake` marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyRep {
    /// `plain`, `html` or `fake`
    pub rep_type: String,
    pub part: String,
    pub size: usize,
    pub amount_downloaded: usize,
    pub is_downloaded: bool,
    pub content: Option<String>,
}

/// An attachment or a related (inline, content-id referenced) part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPart {
    pub part: String,
    pub name: Option<String>,
    pub mime_type: String,
    pub size_estimate: usize,
    pub content_id: Option<String>,
    /// Only present once the part was downloaded in full
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Server-given UIDL
    pub srvid: Option<String>,
    pub subject: Option<String>,
    pub author: Option<String>,
    /// Milliseconds since the epoch, never in the future
    pub date: i64,
    pub has_attachments: bool,
    pub snippet: Option<String>,
    pub bytes_to_download_for_body_display: usize,
    /// Raw `Name: value\r\n` header block
    pub header_fields: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub structure: MimePart,
    pub body_reps: Vec<BodyRep>,
    pub attachments: Vec<AttachmentPart>,
    pub related_parts: Vec<AttachmentPart>,
}

/// A downloaded (possibly partial) POP3 message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

/// Inputs that do not come from the message text itself
#[derive(Debug, Clone)]
pub struct MimeContext {
    pub uidl: Option<String>,
    /// Full message size as reported by LIST, or the downloaded length
    pub est_size: usize,
    pub is_snippet: bool,
    pub infer_attachments_size: usize,
    pub now_ms: i64,
}

/// Normalize raw message text into header, structure and body reps.
pub fn parse_message(
    content: &str,
    ctx: &MimeContext,
) -> Result<ParsedMessage, mailparse::MailParseError> {
    let root = mailparse::parse_mail(content.as_bytes())?;

    let partial_id = if ctx.is_snippet {
        Some(deepest_last_part_id(&root, "1".to_string()))
    } else {
        None
    };

    let mut part_map: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut leaves: Vec<(String, &ParsedMail)> = Vec::new();
    let structure = build_structure(&root, "1".to_string(), &mut part_map, &mut leaves);

    // Everything seen was downloaded in full except the truncated part.
    let mut part_sizes: BTreeMap<String, usize> = BTreeMap::new();
    let mut used_size = 0;
    for (part, bytes) in &part_map {
        if Some(part) != partial_id.as_ref() {
            used_size += bytes.len();
            part_sizes.insert(part.clone(), bytes.len());
        }
    }
    if let Some(partial) = &partial_id {
        part_sizes.insert(partial.clone(), ctx.est_size.saturating_sub(used_size));
    }

    let mut body_reps = Vec::new();
    let mut attachments = Vec::new();
    let mut related_parts = Vec::new();

    for (part, node) in leaves {
        let mimetype = node.ctype.mimetype.as_str();
        let disposition = node.get_content_disposition();
        let is_attachment = matches!(disposition.disposition, DispositionType::Attachment);
        let content_id = node.headers.get_first_value("Content-ID");
        let is_partial = Some(&part) == partial_id.as_ref();
        let size = part_sizes.get(&part).copied().unwrap_or(0);

        if !is_attachment && (mimetype == "text/plain" || mimetype == "text/html") {
            let text = node.get_body().unwrap_or_default();
            body_reps.push(BodyRep {
                rep_type: if mimetype == "text/html" { "html" } else { "plain" }.to_string(),
                part: part.clone(),
                size,
                amount_downloaded: text.len(),
                is_downloaded: !is_partial,
                content: Some(text),
            });
            continue;
        }

        let entry = AttachmentPart {
            name: disposition
                .params
                .get("filename")
                .or_else(|| node.ctype.params.get("name"))
                .cloned(),
            mime_type: mimetype.to_string(),
            size_estimate: size,
            content_id: content_id.clone(),
            content: if is_partial {
                None
            } else {
                part_map.get(&part).cloned()
            },
            part,
        };

        if !is_attachment && content_id.is_some() {
            related_parts.push(entry);
        } else {
            attachments.push(entry);
        }
    }

    let mut has_attachments = !attachments.is_empty();
    // Without the whole message we can only guess.
    if ctx.is_snippet
        && !has_attachments
        && (root.headers.get_first_value("X-MS-Has-Attach").is_some()
            || root.ctype.mimetype == "multipart/mixed"
            || ctx.est_size > ctx.infer_attachments_size)
    {
        has_attachments = true;
    }

    let snippet = select_snippet(&body_reps);

    // Parts may hide in the undownloaded tail, so callers need a marker that
    // says whether a full fetch is still required.
    body_reps.push(BodyRep {
        rep_type: "fake".to_string(),
        part: "fake".to_string(),
        size: 0,
        amount_downloaded: 0,
        is_downloaded: !ctx.is_snippet,
        content: None,
    });

    let header_fields: String = root
        .headers
        .iter()
        .map(|h| format!("{}: {}\r\n", h.get_key(), h.get_value()))
        .collect();

    let header = MessageHeader {
        srvid: ctx.uidl.clone(),
        subject: root.headers.get_first_value("Subject"),
        author: root.headers.get_first_value("From"),
        date: clamp_date(root.headers.get_first_value("Date").as_deref(), ctx.now_ms),
        has_attachments,
        snippet,
        bytes_to_download_for_body_display: if ctx.is_snippet { ctx.est_size } else { 0 },
        header_fields,
    };

    Ok(ParsedMessage {
        header,
        body: MessageBody {
            structure,
            body_reps,
            attachments,
            related_parts,
        },
    })
}

/// Missing, unparsable, or future dates become `now`.
pub fn clamp_date(date_header: Option<&str>, now_ms: i64) -> i64 {
    match date_header.map(mailparse::dateparse) {
        Some(Ok(secs)) => {
            let ms = secs.saturating_mul(1000);
            if ms > now_ms {
                now_ms
            } else {
                ms
            }
        }
        _ => now_ms,
    }
}

fn deepest_last_part_id(node: &ParsedMail, part_id: String) -> String {
    match node.subparts.last() {
        Some(last) => {
            let child_id = format!("{}.{}", part_id, node.subparts.len());
            deepest_last_part_id(last, child_id)
        }
        None => part_id,
    }
}

fn build_structure<'m, 'a>(
    node: &'m ParsedMail<'a>,
    part_id: String,
    part_map: &mut BTreeMap<String, Vec<u8>>,
    leaves: &mut Vec<(String, &'m ParsedMail<'a>)>,
) -> MimePart {
    let disposition = node.get_content_disposition();
    let disposition_name = match &disposition.disposition {
        DispositionType::Inline => None,
        DispositionType::Attachment => Some("attachment".to_string()),
        DispositionType::FormData => Some("form-data".to_string()),
        DispositionType::Extension(other) => Some(other.to_lowercase()),
    };

    let is_multipart = node.ctype.mimetype.starts_with("multipart/");
    let mut size = 0;
    if !is_multipart {
        let content = node.get_body_raw().unwrap_or_default();
        size = content.len();
        part_map.insert(part_id.clone(), content);
        leaves.push((part_id.clone(), node));
    }

    let children = node
        .subparts
        .iter()
        .enumerate()
        .map(|(i, child)| build_structure(child, format!("{}.{}", part_id, i + 1), part_map, leaves))
        .collect();

    MimePart {
        part_id,
        content_type: node.ctype.mimetype.clone(),
        params: node.ctype.params.clone(),
        disposition: disposition_name,
        disposition_params: disposition.params.clone(),
        content_id: node.headers.get_first_value("Content-ID"),
        size,
        children,
    }
}

fn select_snippet(body_reps: &[BodyRep]) -> Option<String> {
    let rep = body_reps
        .iter()
        .find(|r| r.rep_type == "plain")
        .or_else(|| body_reps.iter().find(|r| r.rep_type == "html"))?;
    let content = rep.content.as_deref()?;

    let text = if rep.rep_type == "html" {
        html2text::from_read(content.as_bytes(), SNIPPET_WRAP)
            .unwrap_or_else(|_| content.to_string())
    } else {
        content.to_string()
    };

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(collapsed.chars().take(SNIPPET_CHARS).collect())
}
