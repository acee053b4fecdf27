use select::document::Document;
use select::predicate::Name;
use url::Url;

/// Children of one listing page, in document order.
#[derive(Debug, Default)]
pub(crate) struct Links {
    /// Remote paths, always ending in `/`.
    pub(crate) directories: Vec<String>,
    pub(crate) files: Vec<Url>,
}

/// Pulls child directories and files out of one listing page.
///
/// html5ever recovers from any markup, so a broken page yields whatever
/// anchors could be recovered, possibly none.
pub(crate) fn extract(page: &Url, html: &str) -> Links {
    let document = Document::from(html);

    let mut links = Links::default();
    for href in document.find(Name("a")).filter_map(|n| n.attr("href")) {
        let Some(reference) = child_reference(href) else {
            continue;
        };
        let path = join_path(page.path(), reference);
        if reference.ends_with('/') {
            links.directories.push(path);
        } else {
            let mut file = page.clone();
            file.set_path(&path);
            file.set_fragment(None);
            links.files.push(file);
        }
    }
    links
}

/// Returns the usable part of an href, or `None` when it points outside the
/// listed directory: parent links, absolute URLs, root-relative paths and
/// the query-only sort links Apache puts in column headers.
fn child_reference(href: &str) -> Option<&str> {
    let href = href.trim();
    let end = href.find(|c: char| c == '?' || c == '#').unwrap_or(href.len());
    let reference = &href[..end];

    if reference.is_empty()
        || reference.starts_with("..")
        || reference.contains("://")
        || reference.starts_with('/')
    {
        return None;
    }
    // mailto:, javascript: and friends
    let first_segment = reference.split('/').next().unwrap_or_default();
    if first_segment.contains(':') {
        return None;
    }
    Some(reference)
}

/// Lexically joins `reference` onto the directory `base`, dropping `.`
/// segments, resolving `..` and collapsing repeated separators. A trailing
/// `/` on `reference` is kept.
pub(crate) fn join_path(base: &str, reference: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(reference.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut path = format!("/{}", segments.join("/"));
    if reference.ends_with('/') && path != "/" {
        path.push('/');
    }
    path
}
