//! URL helpers shared by the graph, the propagator and the engine.
//!
//! Module URLs carry volatile query parameters: `t=<timestamp>` for cache
//! busting and `import` marking explicit asset imports. Neither changes module
//! identity, so lookups strip them first.

/// Prefix used for modules whose URL is not rooted at the server root.
pub const VALID_ID_PREFIX: &str = "/@id/";

/// Prefix for file-only modules that have no served URL.
pub const FS_PREFIX: &str = "/@fs/";

const NULL_BYTE_PLACEHOLDER: &str = "__x00__";

const CSS_LANGS: &[&str] = &[
    "css", "less", "sass", "scss", "styl", "stylus", "pcss", "postcss", "sss",
];

const KNOWN_JS_SRC: &[&str] = &[
    "js", "jsx", "ts", "tsx", "mjs", "mts", "cjs", "cts", "vue", "marko", "svelte", "astro",
    "imba",
];

/// Strip the query string and hash from a URL.
#[must_use]
pub fn clean_url(url: &str) -> &str {
    let end = url.find(|c: char| c == '?' || c == '#').unwrap_or(url.len());
    &url[..end]
}

/// Remove every query parameter matching `drop`, keeping order and hash.
fn remove_query_params(url: &str, drop: impl Fn(&str) -> bool) -> String {
    let (without_hash, hash) = match url.find('#') {
        Some(idx) => url.split_at(idx),
        None => (url, ""),
    };
    let Some((path, query)) = without_hash.split_once('?') else {
        return url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|param| !param.is_empty() && !drop(param))
        .collect();

    if kept.is_empty() {
        format!("{path}{hash}")
    } else {
        format!("{path}?{}{hash}", kept.join("&"))
    }
}

/// Remove the `t=<digits>` cache-busting parameter.
#[must_use]
pub fn remove_timestamp_query(url: &str) -> String {
    remove_query_params(url, |param| {
        param
            .strip_prefix("t=")
            .is_some_and(|ts| !ts.is_empty() && ts.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Remove the `import` marker parameter.
#[must_use]
pub fn remove_import_query(url: &str) -> String {
    remove_query_params(url, |param| param == "import" || param == "import=")
}

/// Strip both volatile parameters so cache-busted URLs map to the same node.
#[must_use]
pub fn strip_volatile_query(url: &str) -> String {
    remove_import_query(&remove_timestamp_query(url))
}

fn extension(url: &str) -> Option<&str> {
    let path = clean_url(url);
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file_name.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

/// Whether the URL points at a stylesheet.
#[must_use]
pub fn is_css_request(url: &str) -> bool {
    extension(url).is_some_and(|ext| CSS_LANGS.contains(&ext))
}

/// Whether the URL is served as JavaScript.
///
/// Extensionless URLs count as JS unless they end with `/`.
#[must_use]
pub fn is_js_request(url: &str) -> bool {
    match extension(url) {
        Some(ext) => KNOWN_JS_SRC.contains(&ext),
        None => !clean_url(url).ends_with('/'),
    }
}

/// JS updates for modules that are neither JS nor CSS (assets imported with
/// `?import`) must be re-fetched with the import marker.
#[must_use]
pub fn is_explicit_import_required(url: &str) -> bool {
    !is_js_request(url) && !is_css_request(url)
}

/// Whether the file is an HTML entry.
#[must_use]
pub fn is_html_file(file: &str) -> bool {
    std::path::Path::new(clean_url(file))
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html"))
}

/// Whether a resolved id denotes a virtual module with no backing file.
#[must_use]
pub fn is_virtual_id(id: &str) -> bool {
    id.starts_with('\0') || id.starts_with("virtual:")
}

/// Wrap a non-rooted id so it can travel as a URL path.
#[must_use]
pub fn wrap_id(id: &str) -> String {
    if id.starts_with(VALID_ID_PREFIX) {
        id.to_string()
    } else {
        format!("{VALID_ID_PREFIX}{}", id.replace('\0', NULL_BYTE_PLACEHOLDER))
    }
}

/// Normalize a module URL for use in HMR payloads.
#[must_use]
pub fn normalize_hmr_url(url: &str) -> String {
    if url.starts_with('.') || url.starts_with('/') {
        url.to_string()
    } else {
        wrap_id(url)
    }
}

/// Resolve an import specifier against the URL of the importing module.
///
/// Only rooted and relative specifiers map to served URLs; bare package
/// specifiers return `None`.
#[must_use]
pub fn join_import(importer_url: &str, specifier: &str) -> Option<String> {
    if specifier.starts_with('/') {
        return Some(specifier.to_string());
    }
    if !specifier.starts_with("./") && !specifier.starts_with("../") {
        return None;
    }

    let importer = clean_url(importer_url);
    let mut segments: Vec<&str> = importer.split('/').filter(|s| !s.is_empty()).collect();
    segments.pop();
    for part in specifier.split('/') {
        match part {
            "." | "" => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    Some(format!("/{}", segments.join("/")))
}
