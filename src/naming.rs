//! Job identifier derivation
//!
//! A job id is a slug of the user-supplied name followed by a UUID v4. The
//! result is a valid DNS label, so it doubles as the job's subdomain.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Maximum length of a DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Length of a hyphenated UUID
const SUFFIX_LEN: usize = 36;

/// Longest slug that still fits in a label next to `-<uuid>`
const MAX_SLUG_LEN: usize = MAX_LABEL_LEN - SUFFIX_LEN - 1;

/// Derive a unique job id from a human-readable name.
pub fn derive_job_id(name: &str) -> String {
    with_suffix(&slugify(name), &Uuid::new_v4().to_string())
}

fn with_suffix(slug: &str, suffix: &str) -> String {
    let slug = truncate_slug(slug);
    if slug.is_empty() {
        suffix.to_string()
    } else {
        format!("{}-{}", slug, suffix)
    }
}

fn truncate_slug(slug: &str) -> &str {
    // slugs are pure ASCII, byte slicing is safe
    let cut = &slug[..slug.len().min(MAX_SLUG_LEN)];
    cut.trim_end_matches('-')
}

/// Convert a name to a lowercase `[a-z0-9-]` slug.
///
/// Diacritics are removed by decomposing and dropping combining marks, every
/// other run of characters outside `[a-z0-9]` collapses to a single hyphen,
/// and leading/trailing hyphens are trimmed. May return an empty string.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for c in name.to_lowercase().nfd().filter(|c| !is_combining_mark(*c)) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

/// Check that a string is usable as a DNS label (and therefore a job id).
#[cfg(test)]
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_LABEL_LEN
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}
