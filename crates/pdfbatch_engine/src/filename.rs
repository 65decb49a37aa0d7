use url::Url;

const MAX_STEM_LEN: usize = 80;

/// Filesystem-safe, batch-unique name for the PDF fetched from `url`:
/// `{index:06}_{sanitized_segment}.pdf`, or `document_{index:06}.pdf` when the
/// URL has no usable trailing segment.
pub fn pdf_filename(url: &Url, index: usize) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(sanitize_segment)
        .unwrap_or_default();

    if segment.is_empty() {
        return format!("document_{index:06}.pdf");
    }

    let name = if segment.to_ascii_lowercase().ends_with(".pdf") {
        segment
    } else {
        format!("{segment}.pdf")
    };
    format!("{index:06}_{name}")
}

/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else becomes `_`.
fn sanitize_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // Collapse multiple underscores
    let mut compacted = String::with_capacity(cleaned.len());
    let mut prev_underscore = false;
    for c in cleaned.chars() {
        if c == '_' {
            if !prev_underscore {
                compacted.push(c);
            }
            prev_underscore = true;
        } else {
            compacted.push(c);
            prev_underscore = false;
        }
    }

    let mut trimmed = compacted.trim_matches(&['_', '.'][..]).to_string();
    if trimmed.len() > MAX_STEM_LEN {
        // Keep the extension when shortening.
        let keep_ext = trimmed.to_ascii_lowercase().ends_with(".pdf");
        trimmed.truncate(MAX_STEM_LEN);
        if keep_ext && !trimmed.to_ascii_lowercase().ends_with(".pdf") {
            trimmed.truncate(MAX_STEM_LEN - 4);
            trimmed.push_str(".pdf");
        }
    }
    trimmed
}
