use std::collections::BTreeSet;

/// Normalizes a directory argument: no trailing slash, `/` becomes empty.
pub fn normalize_dir(dir: &str) -> &str {
    dir.trim_end_matches('/')
}

/// Immediate children of `dir` among `names`, sorted and de-duplicated.
/// Sub-directories are reported with a trailing `/`.
pub fn children<I, S>(dir: &str, names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = format!("{}/", normalize_dir(dir));
    let mut out = BTreeSet::new();
    for name in names {
        let Some(rest) = name.as_ref().strip_prefix(&prefix) else {
            continue;
        };
        let child = match rest.find('/') {
            Some(0) => continue,
            Some(i) => &rest[..=i],
            None if rest.is_empty() => continue,
            None => rest,
        };
        out.insert(format!("{prefix}{child}"));
    }
    out.into_iter().collect()
}
